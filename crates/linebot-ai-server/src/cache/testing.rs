use async_trait::async_trait;
use std::time::Duration;

use super::store::{CacheError, FastStore};

/// Fast store that refuses every call, as an unreachable Redis would.
pub(crate) struct DownStore;

fn refused() -> CacheError {
    CacheError::unavailable("down", "connection refused")
}

#[async_trait]
impl FastStore for DownStore {
    fn backend(&self) -> &'static str {
        "down"
    }

    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Err(refused())
    }

    async fn set_with_ttl(&self, _: &str, _: &str, _: Duration) -> Result<(), CacheError> {
        Err(refused())
    }

    async fn push_bounded(&self, _: &str, _: &str, _: usize, _: Duration) -> Result<(), CacheError> {
        Err(refused())
    }

    async fn list(&self, _key: &str) -> Result<Vec<String>, CacheError> {
        Err(refused())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Err(refused())
    }

    async fn close(&self) {}
}
