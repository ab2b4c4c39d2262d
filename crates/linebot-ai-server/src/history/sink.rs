use chrono::{DateTime, Utc};
use flume::{bounded, Receiver, Sender};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::store::InteractionStore;
use super::types::{HistoryEvent, InteractionRecord, UserActivity};
use crate::config::HistoryConfig;
use crate::models::UserKey;

/// Fire-and-forget hand-off of completed exchanges and user activity.
pub trait HistorySink: Send + Sync {
    /// Never blocks and never fails the caller. A record that cannot be
    /// queued is logged and dropped.
    fn enqueue(&self, record: InteractionRecord);

    /// Marks `user` as active now. Same delivery guarantees as `enqueue`.
    fn touch(&self, user: &UserKey);
}

/// Bounded in-memory queue drained by background batch writers.
///
/// Drop policy: queue full, sink closed, or a failed write all drop the
/// affected events with a log line. A failed multi-record insert is replayed
/// one record at a time so only the rejected records are lost.
pub struct QueuedHistorySink {
    sender: Sender<HistoryEvent>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl QueuedHistorySink {
    /// Spawns `worker_count` writers; must be called inside a tokio runtime.
    pub fn new(store: Arc<dyn InteractionStore>, config: HistoryConfig) -> Self {
        let (sender, receiver) = bounded(config.queue_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);

        info!(
            "Initializing history sink: queue={}, batch={}, timeout={}ms, workers={}",
            config.queue_capacity, config.batch_size, config.batch_timeout_ms, config.worker_count
        );

        let workers = (0..config.worker_count)
            .map(|worker_id| {
                let store = store.clone();
                let receiver = receiver.clone();
                let shutdown_rx = shutdown_rx.clone();
                let config = config.clone();

                tokio::spawn(async move {
                    Self::worker_loop(worker_id, store, receiver, shutdown_rx, config).await;
                })
            })
            .collect();

        Self {
            sender,
            closed: AtomicBool::new(false),
            shutdown,
            workers: Mutex::new(workers),
        }
    }

    async fn worker_loop(
        worker_id: usize,
        store: Arc<dyn InteractionStore>,
        receiver: Receiver<HistoryEvent>,
        mut shutdown: watch::Receiver<bool>,
        config: HistoryConfig,
    ) {
        info!("History worker {} started", worker_id);

        let batch_size = config.batch_size.max(1);
        let batch_timeout = Duration::from_millis(config.batch_timeout_ms);
        let mut batch: Vec<HistoryEvent> = Vec::with_capacity(batch_size);

        loop {
            let deadline = tokio::time::Instant::now() + batch_timeout;

            while batch.len() < batch_size {
                tokio::select! {
                    received = tokio::time::timeout_at(deadline, receiver.recv_async()) => {
                        match received {
                            Ok(Ok(event)) => batch.push(event),
                            Ok(Err(_)) => {
                                // Channel closed
                                Self::flush_all(store.as_ref(), &batch, batch_size, worker_id).await;
                                info!("History worker {} shutting down (channel closed)", worker_id);
                                return;
                            }
                            Err(_) => break,
                        }
                    }
                    _ = shutdown.changed() => {
                        batch.extend(receiver.drain());
                        Self::flush_all(store.as_ref(), &batch, batch_size, worker_id).await;
                        info!("History worker {} drained {} events and stopped", worker_id, batch.len());
                        return;
                    }
                }
            }

            if !batch.is_empty() {
                Self::flush_batch(store.as_ref(), &batch, worker_id).await;
                batch.clear();
            }
        }
    }

    async fn flush_all(
        store: &dyn InteractionStore,
        events: &[HistoryEvent],
        batch_size: usize,
        worker_id: usize,
    ) {
        for chunk in events.chunks(batch_size) {
            Self::flush_batch(store, chunk, worker_id).await;
        }
    }

    async fn flush_batch(store: &dyn InteractionStore, batch: &[HistoryEvent], worker_id: usize) {
        let start = std::time::Instant::now();
        debug!("Worker {} flushing {} history events", worker_id, batch.len());

        let mut records: Vec<InteractionRecord> = Vec::new();
        let mut seen: HashMap<UserKey, DateTime<Utc>> = HashMap::new();
        for event in batch {
            match event {
                HistoryEvent::Interaction(record) => records.push(record.clone()),
                HistoryEvent::Activity(activity) => {
                    let at = seen.entry(activity.user.clone()).or_insert(activity.at);
                    *at = (*at).max(activity.at);
                }
            }
        }

        if !records.is_empty() {
            Self::write_records(store, &records, worker_id).await;
        }

        if !seen.is_empty() {
            let activity: Vec<UserActivity> = seen
                .into_iter()
                .map(|(user, at)| UserActivity { user, at })
                .collect();
            if let Err(e) = store.touch_users(&activity).await {
                error!(
                    "Worker {} dropped activity for {} users: {}",
                    worker_id,
                    activity.len(),
                    e
                );
            }
        }

        debug!("Worker {} flushed batch in {:?}", worker_id, start.elapsed());
    }

    async fn write_records(store: &dyn InteractionStore, records: &[InteractionRecord], worker_id: usize) {
        let err = match store.insert_batch(records).await {
            Ok(inserted) => {
                debug!("Worker {} inserted {} records", worker_id, inserted);
                return;
            }
            Err(e) => e,
        };

        if records.len() == 1 {
            error!(
                "Worker {} dropped interaction record {} for {}: {}",
                worker_id, records[0].id, records[0].user, err
            );
            return;
        }

        warn!(
            "Worker {} batch of {} records failed ({}), retrying one by one",
            worker_id,
            records.len(),
            err
        );
        let mut dropped = 0;
        for record in records {
            if let Err(e) = store.insert_batch(std::slice::from_ref(record)).await {
                dropped += 1;
                error!(
                    "Worker {} dropped interaction record {} for {}: {}",
                    worker_id, record.id, record.user, e
                );
            }
        }
        if dropped > 0 {
            warn!(
                "Worker {} kept {} of {} records from the failed batch",
                worker_id,
                records.len() - dropped,
                records.len()
            );
        }
    }

    /// Stops intake, lets workers flush whatever is queued, and waits up to
    /// `grace` for them to finish.
    pub async fn shutdown(&self, grace: Duration) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.send_replace(true);

        let handles = self
            .workers
            .lock()
            .map(|mut workers| std::mem::take(&mut *workers))
            .unwrap_or_default();

        if tokio::time::timeout(grace, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!("History workers did not finish within {:?}", grace);
        } else {
            info!("History sink drained");
        }
    }

    pub fn queue_len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_queue_full(&self) -> bool {
        self.sender.is_full()
    }
}

impl QueuedHistorySink {
    fn push(&self, event: HistoryEvent) {
        if self.closed.load(Ordering::Acquire) {
            warn!("History sink closed, dropping event for {}", event.user());
            return;
        }
        if let Err(e) = self.sender.try_send(event) {
            warn!("Failed to enqueue history event (queue full?): {}", e);
        }
    }
}

impl HistorySink for QueuedHistorySink {
    fn enqueue(&self, record: InteractionRecord) {
        self.push(HistoryEvent::Interaction(record));
    }

    fn touch(&self, user: &UserKey) {
        self.push(HistoryEvent::Activity(UserActivity::now(user.clone())));
    }
}
