use async_trait::async_trait;
use deadpool_redis::redis::{self, AsyncCommands};
use deadpool_redis::{Config, Connection, Pool, PoolConfig, Runtime};
use std::time::Duration;
use tracing::info;

use super::store::{CacheError, FastStore};
use crate::config::RedisConfig;

const BACKEND: &str = "redis";

/// Redis-backed fast store. The pool connects lazily, so an unreachable
/// server surfaces per call as `CacheError::Unavailable`.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    pub fn new(cfg: &RedisConfig) -> Result<Self, CacheError> {
        let mut config = Config::from_url(cfg.url.clone());
        config.pool = Some(PoolConfig::new(cfg.pool_max_size.max(1)));

        let pool = config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| CacheError::unavailable(BACKEND, e))?;

        info!("Redis pool created (max_size={})", cfg.pool_max_size);
        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<Connection, CacheError> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::unavailable(BACKEND, e))
    }
}

/// Redis expiry has one-second granularity; never round down to "no TTL".
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn unavailable(e: redis::RedisError) -> CacheError {
    CacheError::unavailable(BACKEND, e)
}

#[async_trait]
impl FastStore for RedisStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn().await?;
        conn.get(key).await.map_err(unavailable)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .set_ex(key, value, ttl_secs(ttl))
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn push_bounded(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        let keep_from = -(max_len.max(1) as isize);

        let _: () = redis::pipe()
            .atomic()
            .rpush(key, value)
            .ignore()
            .ltrim(key, keep_from, -1)
            .ignore()
            .expire(key, ttl_secs(ttl) as i64)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn list(&self, key: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn().await?;
        conn.lrange(key, 0, -1).await.map_err(unavailable)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close();
        info!("Redis pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_never_rounds_to_zero() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(3600)), 3600);
    }

    #[tokio::test]
    async fn test_unreachable_server_reports_unavailable() {
        let store = RedisStore::new(&RedisConfig {
            url: "redis://127.0.0.1:1".to_string(),
            pool_max_size: 1,
        })
        .unwrap();

        assert!(matches!(
            store.get("chat_history:U1").await,
            Err(CacheError::Unavailable { backend: "redis", .. })
        ));
    }
}
