use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
}

pub async fn health_check() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    status: &'static str,
    fast_store: &'static str,
    fast_store_backend: &'static str,
    database: &'static str,
    history_queue: usize,
}

/// 503 only when the database is unreachable; a down fast store just
/// degrades the caches.
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let fast_store = match state.fast_store.ping().await {
        Ok(()) => "ok",
        Err(e) => {
            warn!("Readiness: fast store unavailable: {}", e);
            "unavailable"
        }
    };
    let database = match state.repository.pool.ping().await {
        Ok(()) => "ok",
        Err(e) => {
            warn!("Readiness: database unavailable: {}", e);
            "unavailable"
        }
    };

    let (code, status) = match (database, fast_store) {
        ("ok", "ok") => (StatusCode::OK, "ready"),
        ("ok", _) => (StatusCode::OK, "degraded"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
    };

    (
        code,
        Json(ReadinessResponse {
            status,
            fast_store,
            fast_store_backend: state.fast_store.backend(),
            database,
            history_queue: state.history.queue_len(),
        }),
    )
}
