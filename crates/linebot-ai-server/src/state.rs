use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::{ConversationWindowCache, FastStore, MemoryStore, RedisStore, ResultCache};
use crate::config::Settings;
use crate::database::{DbPool, Repository};
use crate::history::{InteractionStore, QueuedHistorySink};
use crate::services::orchestrator::{ExchangeSettings, Orchestrator};
use crate::services::providers::ProviderRegistry;
use crate::utils::image::ImagePolicy;
use crate::utils::limiters::Limiters;

const HISTORY_DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Application state shared across handlers.
///
/// Every client is built once here and released in `shutdown`.
pub struct AppState {
    pub settings: Settings,
    pub orchestrator: Orchestrator,
    pub fast_store: Arc<dyn FastStore>,
    pub repository: Arc<Repository>,
    pub history: Arc<QueuedHistorySink>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl AppState {
    pub async fn build(settings: Settings) -> Result<Arc<Self>> {
        let (fast_store, sweeper) = Self::build_fast_store(&settings).await?;

        let db_pool = DbPool::new(&settings.database).await?;
        info!("Database connection established");

        let repository = Arc::new(Repository::new(db_pool));
        let state = Self::from_parts(settings, fast_store, repository);
        *state.sweeper.lock().unwrap_or_else(|p| p.into_inner()) = sweeper;

        Ok(Arc::new(state))
    }

    /// Wires the orchestrator and history sink over already-built clients.
    pub fn from_parts(
        settings: Settings,
        fast_store: Arc<dyn FastStore>,
        repository: Arc<Repository>,
    ) -> Self {
        let interaction_store: Arc<dyn InteractionStore> = repository.clone();
        let history = Arc::new(QueuedHistorySink::new(
            interaction_store,
            settings.history.clone(),
        ));

        let window = ConversationWindowCache::new(
            fast_store.clone(),
            settings.cache.window_size,
            settings.cache.window_ttl(),
        );
        let results = ResultCache::new(
            fast_store.clone(),
            settings.cache.result_scope,
            settings.cache.result_ttl(),
        );

        info!(
            "Caches on {} store: window={} turns, result scope={:?}",
            fast_store.backend(),
            window.max_turns(),
            results.scope()
        );

        let orchestrator = Orchestrator::new(
            ProviderRegistry::from_settings(&settings.providers),
            window,
            results,
            history.clone(),
            ImagePolicy::new(&settings.images),
            Limiters::new(&settings.limits),
            ExchangeSettings::from(&settings.providers),
        );

        Self {
            settings,
            orchestrator,
            fast_store,
            repository,
            history,
            sweeper: Mutex::new(None),
        }
    }

    async fn build_fast_store(
        settings: &Settings,
    ) -> Result<(Arc<dyn FastStore>, Option<JoinHandle<()>>)> {
        if settings.redis.url.trim().is_empty() {
            let store = MemoryStore::new();
            let sweeper = spawn_sweeper(
                store.clone(),
                Duration::from_secs(settings.cache.sweep_interval_seconds.max(1)),
            );
            info!("Using in-process fast store (redis.url is empty)");
            return Ok((Arc::new(store), Some(sweeper)));
        }

        let store = RedisStore::new(&settings.redis)?;
        // An unreachable Redis only degrades the caches; keep starting.
        match store.ping().await {
            Ok(()) => info!("Redis connection established"),
            Err(e) => warn!("Redis not reachable at startup, caches degraded: {}", e),
        }
        Ok((Arc::new(store), None))
    }

    /// Drains queued history, then releases Redis and Postgres.
    pub async fn shutdown(&self) {
        info!("Shutting down application state");

        self.history.shutdown(HISTORY_DRAIN_GRACE).await;

        if let Some(sweeper) = self
            .sweeper
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            sweeper.abort();
        }

        self.fast_store.close().await;
        self.repository.pool.close().await;
        info!("Shutdown complete");
    }
}

fn spawn_sweeper(store: MemoryStore, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            store.purge_expired();
        }
    })
}
