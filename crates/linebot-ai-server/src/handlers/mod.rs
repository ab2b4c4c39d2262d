pub mod chat;
pub mod health;
pub mod history;
pub mod images;
pub mod users;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

use crate::state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = state.settings.server.body_limit_bytes;

    Router::new()
        .route("/health", get(health::health_check))
        .route("/health/ready", get(health::readiness_check))
        .route("/chat/process", post(chat::process_chat))
        .route("/chat/history/{line_user_id}", get(history::chat_history))
        .route("/images/analyze", post(images::analyze_image))
        .route("/images/history/{line_user_id}", get(history::image_history))
        .route("/users", post(users::create_user))
        .route(
            "/users/{line_user_id}",
            get(users::get_user).put(users::update_user),
        )
        .with_state(state)
        // CORS
        .layer(CorsLayer::permissive())
        // Tracing
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
        .layer(DefaultBodyLimit::max(body_limit))
}
