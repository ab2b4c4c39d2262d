use async_trait::async_trait;
use thiserror::Error;

use super::types::{InteractionRecord, UserActivity};

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Durable, append-only destination for interaction records.
#[async_trait]
pub trait InteractionStore: Send + Sync {
    /// Inserts the batch; returns rows actually written.
    async fn insert_batch(&self, records: &[InteractionRecord]) -> Result<usize, PersistenceError>;

    /// Upserts one profile row per user and moves `last_active` forward.
    /// Callers pass at most one entry per user.
    async fn touch_users(&self, activity: &[UserActivity]) -> Result<usize, PersistenceError>;
}
