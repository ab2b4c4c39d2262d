use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::store::{CacheError, FastStore};

const BACKEND: &str = "memory";

enum Value {
    Text(String),
    List(VecDeque<String>),
}

struct Entry {
    value: Value,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-process fast store used when no Redis URL is configured.
/// Expiry is lazy on access plus a periodic `purge_expired` sweep.
#[derive(Clone, Default)]
pub struct MemoryStore {
    map: Arc<DashMap<String, Entry>>,
    closed: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        info!("Initializing in-process fast store with DashMap");
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::unavailable(BACKEND, "store closed"));
        }
        Ok(())
    }

    /// Drops every expired entry. Returns number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let start_len = self.map.len();
        self.map.retain(|_, entry| !entry.is_expired(now));
        let count = start_len.saturating_sub(self.map.len());

        if count > 0 {
            debug!("Purged {} expired cache entries", count);
        }

        count
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[async_trait]
impl FastStore for MemoryStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.ensure_open()?;
        let Some(entry) = self.map.get(key) else {
            return Ok(None);
        };

        if entry.is_expired(Instant::now()) {
            drop(entry);
            self.map.remove(key);
            return Ok(None);
        }

        match &entry.value {
            Value::Text(text) => Ok(Some(text.clone())),
            Value::List(_) => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.ensure_open()?;
        self.map.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn push_bounded(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.ensure_open()?;
        let now = Instant::now();

        // The entry guard holds the shard lock for the whole read-modify-write.
        let mut entry = self.map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::List(VecDeque::new()),
            expires_at: now + ttl,
        });

        if entry.is_expired(now) || matches!(entry.value, Value::Text(_)) {
            entry.value = Value::List(VecDeque::new());
        }

        if let Value::List(items) = &mut entry.value {
            items.push_back(value.to_string());
            while items.len() > max_len {
                items.pop_front();
            }
        }
        entry.expires_at = now + ttl;

        Ok(())
    }

    async fn list(&self, key: &str) -> Result<Vec<String>, CacheError> {
        self.ensure_open()?;
        let Some(entry) = self.map.get(key) else {
            return Ok(Vec::new());
        };

        if entry.is_expired(Instant::now()) {
            drop(entry);
            self.map.remove(key);
            return Ok(Vec::new());
        }

        match &entry.value {
            Value::List(items) => Ok(items.iter().cloned().collect()),
            Value::Text(_) => Ok(Vec::new()),
        }
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.ensure_open()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.map.clear();
    }
}
