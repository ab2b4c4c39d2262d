use axum::{extract::State, Json};
use std::sync::Arc;
use tracing::info;

use crate::models::chat::{ChatRequest, ChatResponse};
use crate::models::{InboundMessage, OutboundReply};
use crate::state::AppState;
use crate::utils::error::ApiError;

pub async fn process_chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    info!(
        "Chat request: user={}, message_len={}, model_provider={:?}",
        request.line_user_id,
        request.message.len(),
        request.model_provider
    );

    let mut message = InboundMessage::text(request.line_user_id, request.message);
    if let Some(provider) = request.model_provider {
        message = message.with_directive(provider);
    }
    if let Some(context) = request.context {
        message = message.with_context(context);
    }

    match state.orchestrator.handle(message).await? {
        OutboundReply::Text(reply) => Ok(Json(ChatResponse {
            response: reply.text,
            provider: reply.provider,
        })),
        OutboundReply::Image(_) => Err(ApiError::InternalError(
            "text exchange produced an image reply".to_string(),
        )),
    }
}
