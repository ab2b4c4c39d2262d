use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::keys::result_key;
use super::store::{CacheError, FastStore};
use crate::config::ResultScope;
use crate::models::UserKey;
use crate::services::providers::ProviderReply;
use crate::utils::ContentFingerprint;

/// A previously successful analysis, served instead of a new provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResult {
    pub fingerprint: ContentFingerprint,
    pub output: ProviderReply,
    pub created_at: DateTime<Utc>,
}

/// Fingerprint-keyed analysis cache with TTL. Unavailability reads as a miss.
#[derive(Clone)]
pub struct ResultCache {
    store: Arc<dyn FastStore>,
    scope: ResultScope,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(store: Arc<dyn FastStore>, scope: ResultScope, ttl: Duration) -> Self {
        Self { store, scope, ttl }
    }

    pub fn scope(&self) -> ResultScope {
        self.scope
    }

    pub async fn get(
        &self,
        user: &UserKey,
        fingerprint: &ContentFingerprint,
    ) -> Option<CachedResult> {
        let key = result_key(self.scope, user, fingerprint);

        let raw = match self.store.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!("Result cache miss: {}", key);
                return None;
            }
            Err(e) => {
                warn!("Result cache read degraded to miss for {}: {}", key, e);
                return None;
            }
        };

        match serde_json::from_str::<CachedResult>(&raw) {
            Ok(cached) => {
                info!("Result cache hit: {}", key);
                Some(cached)
            }
            Err(e) => {
                warn!("Ignoring undecodable cached result {}: {}", key, e);
                None
            }
        }
    }

    /// Last write wins. `Err` is a soft failure: the caller already has the output.
    pub async fn put(
        &self,
        user: &UserKey,
        fingerprint: &ContentFingerprint,
        output: &ProviderReply,
    ) -> Result<(), CacheError> {
        let key = result_key(self.scope, user, fingerprint);
        let entry = CachedResult {
            fingerprint: fingerprint.clone(),
            output: output.clone(),
            created_at: Utc::now(),
        };
        let encoded = serde_json::to_string(&entry)?;

        self.store
            .set_with_ttl(&key, &encoded, self.ttl)
            .await
            .inspect_err(|e| warn!("Result cache write skipped for {}: {}", key, e))?;

        info!("Cached analysis result: {}", key);
        Ok(())
    }
}
