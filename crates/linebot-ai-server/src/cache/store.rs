use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    /// Backing store unreachable or erroring. Callers degrade to cache-miss.
    #[error("Cache unavailable ({backend}): {reason}")]
    Unavailable {
        backend: &'static str,
        reason: String,
    },

    #[error("Cache codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl CacheError {
    pub fn unavailable(backend: &'static str, reason: impl ToString) -> Self {
        Self::Unavailable {
            backend,
            reason: reason.to_string(),
        }
    }
}

/// Key-value store with TTLs and bounded lists, shared by both caches.
#[async_trait]
pub trait FastStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Overwrites any previous value.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Appends to the tail of the list at `key`, trims it to the newest
    /// `max_len` items and resets its TTL, as a single store operation.
    async fn push_bounded(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    /// Whole list, head (oldest) first. Missing key is an empty list.
    async fn list(&self, key: &str) -> Result<Vec<String>, CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;

    /// Releases connections. Later calls report `Unavailable`.
    async fn close(&self);
}
