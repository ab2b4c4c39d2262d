//! Namespaced fast-store keys: `{purpose}:{partition}[:{fingerprint}]`.

use crate::config::ResultScope;
use crate::models::UserKey;
use crate::utils::ContentFingerprint;

pub const WINDOW_PREFIX: &str = "chat_history";
pub const RESULT_PREFIX: &str = "image_analysis";
const GLOBAL_PARTITION: &str = "global";

pub fn window_key(user: &UserKey) -> String {
    format!("{}:{}", WINDOW_PREFIX, user)
}

pub fn result_key(scope: ResultScope, user: &UserKey, fingerprint: &ContentFingerprint) -> String {
    match scope {
        ResultScope::PerUser => format!("{}:{}:{}", RESULT_PREFIX, user, fingerprint),
        ResultScope::Global => format!("{}:{}:{}", RESULT_PREFIX, GLOBAL_PARTITION, fingerprint),
    }
}
