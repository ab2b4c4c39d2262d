use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::keys::window_key;
use super::store::{CacheError, FastStore};
use crate::models::{ConversationTurn, UserKey};

/// Bounded, idle-expiring, per-user conversation history.
///
/// The only writer of window state. Appends are single store operations, so
/// concurrent exchanges for one user interleave in the store's write order.
#[derive(Clone)]
pub struct ConversationWindowCache {
    store: Arc<dyn FastStore>,
    max_turns: usize,
    idle_ttl: Duration,
}

impl ConversationWindowCache {
    pub fn new(store: Arc<dyn FastStore>, max_turns: usize, idle_ttl: Duration) -> Self {
        Self {
            store,
            max_turns: max_turns.max(1),
            idle_ttl,
        }
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    /// Appends `turn`, evicting the oldest turns beyond the bound.
    /// `Err` is a soft failure: nothing was written.
    pub async fn append(&self, user: &UserKey, turn: ConversationTurn) -> Result<(), CacheError> {
        let key = window_key(user);
        let encoded = serde_json::to_string(&turn)?;

        self.store
            .push_bounded(&key, &encoded, self.max_turns, self.idle_ttl)
            .await
            .inspect_err(|e| warn!("Window append skipped for {}: {}", user, e))?;

        debug!("Appended {} turn to {}", turn.role.as_str(), key);
        Ok(())
    }

    /// Current window, oldest first. Never fails: an unavailable store or an
    /// unseen user both read as empty.
    pub async fn read(&self, user: &UserKey) -> Vec<ConversationTurn> {
        let key = window_key(user);
        let raw = match self.store.list(&key).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Window read degraded to empty for {}: {}", user, e);
                return Vec::new();
            }
        };

        let mut turns: Vec<ConversationTurn> = raw
            .iter()
            .filter_map(|item| match serde_json::from_str(item) {
                Ok(turn) => Some(turn),
                Err(e) => {
                    warn!("Dropping undecodable turn in {}: {}", key, e);
                    None
                }
            })
            .collect();

        // The store trims on write; guard against a store that holds more.
        if turns.len() > self.max_turns {
            turns.drain(..turns.len() - self.max_turns);
        }
        turns
    }
}
