//! In-memory sinks and stores for exercising the history pipeline.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::sink::HistorySink;
use super::store::{InteractionStore, PersistenceError};
use super::types::{InteractionKind, InteractionRecord, UserActivity};
use crate::models::UserKey;

pub fn record(user: &str, input: &str) -> InteractionRecord {
    InteractionRecord::builder(UserKey::new(user), InteractionKind::Text)
        .input(input)
        .output("ok")
        .provider("openai")
        .build()
}

#[derive(Default)]
pub struct RecordingStore {
    records: Mutex<Vec<InteractionRecord>>,
    activity: Mutex<Vec<UserActivity>>,
}

impl RecordingStore {
    pub fn records(&self) -> Vec<InteractionRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn activity(&self) -> Vec<UserActivity> {
        self.activity.lock().unwrap().clone()
    }
}

#[async_trait]
impl InteractionStore for RecordingStore {
    async fn insert_batch(&self, records: &[InteractionRecord]) -> Result<usize, PersistenceError> {
        self.records.lock().unwrap().extend_from_slice(records);
        Ok(records.len())
    }

    async fn touch_users(&self, activity: &[UserActivity]) -> Result<usize, PersistenceError> {
        self.activity.lock().unwrap().extend_from_slice(activity);
        Ok(activity.len())
    }
}

/// Fails any insert containing a record with the given input, like a
/// database rejecting one row of a multi-row statement.
pub struct RejectingStore {
    reject_input: String,
    inner: RecordingStore,
}

impl RejectingStore {
    pub fn new(reject_input: &str) -> Self {
        Self {
            reject_input: reject_input.to_string(),
            inner: RecordingStore::default(),
        }
    }

    pub fn records(&self) -> Vec<InteractionRecord> {
        self.inner.records()
    }
}

#[async_trait]
impl InteractionStore for RejectingStore {
    async fn insert_batch(&self, records: &[InteractionRecord]) -> Result<usize, PersistenceError> {
        if records.iter().any(|r| r.input_summary == self.reject_input) {
            return Err(PersistenceError::Database(sqlx::Error::Protocol(
                "invalid byte sequence for encoding \"UTF8\": 0x00".to_string(),
            )));
        }
        self.inner.insert_batch(records).await
    }

    async fn touch_users(&self, activity: &[UserActivity]) -> Result<usize, PersistenceError> {
        self.inner.touch_users(activity).await
    }
}

#[derive(Default)]
pub struct FailingStore {
    attempts: AtomicUsize,
}

impl FailingStore {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InteractionStore for FailingStore {
    async fn insert_batch(&self, _records: &[InteractionRecord]) -> Result<usize, PersistenceError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(PersistenceError::Database(sqlx::Error::PoolTimedOut))
    }

    async fn touch_users(&self, _activity: &[UserActivity]) -> Result<usize, PersistenceError> {
        Err(PersistenceError::Database(sqlx::Error::PoolTimedOut))
    }
}

/// Captures enqueued records and touches synchronously.
#[derive(Default)]
pub struct RecordingSink {
    records: Mutex<Vec<InteractionRecord>>,
    touched: Mutex<Vec<UserKey>>,
}

impl RecordingSink {
    pub fn records(&self) -> Vec<InteractionRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn touched(&self) -> Vec<UserKey> {
        self.touched.lock().unwrap().clone()
    }
}

impl HistorySink for RecordingSink {
    fn enqueue(&self, record: InteractionRecord) {
        self.records.lock().unwrap().push(record);
    }

    fn touch(&self, user: &UserKey) {
        self.touched.lock().unwrap().push(user.clone());
    }
}
