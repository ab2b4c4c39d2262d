use axum::{
    extract::{Path, Query, State},
    Json,
};
use std::sync::Arc;

use crate::database::HistoryRow;
use crate::history::InteractionKind;
use crate::models::chat::HistoryQuery;
use crate::models::history::{ChatHistoryItem, HistoryResponse, ImageHistoryItem};
use crate::models::UserKey;
use crate::state::AppState;
use crate::utils::error::ApiError;

const DEFAULT_LIMIT: i64 = 10;
const MAX_LIMIT: i64 = 100;

pub async fn chat_history(
    State(state): State<Arc<AppState>>,
    Path(line_user_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse<ChatHistoryItem>>, ApiError> {
    let rows = recent(&state, &line_user_id, InteractionKind::Text, query).await?;
    Ok(Json(HistoryResponse {
        line_user_id,
        history: rows.into_iter().map(ChatHistoryItem::from).collect(),
    }))
}

pub async fn image_history(
    State(state): State<Arc<AppState>>,
    Path(line_user_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse<ImageHistoryItem>>, ApiError> {
    let rows = recent(&state, &line_user_id, InteractionKind::Image, query).await?;
    Ok(Json(HistoryResponse {
        line_user_id,
        history: rows.into_iter().map(ImageHistoryItem::from).collect(),
    }))
}

async fn recent(
    state: &AppState,
    line_user_id: &str,
    kind: InteractionKind,
    query: HistoryQuery,
) -> Result<Vec<HistoryRow>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(ApiError::BadRequest(format!(
            "limit must be between 1 and {}",
            MAX_LIMIT
        )));
    }

    state
        .repository
        .recent_for_user(&UserKey::new(line_user_id), kind, limit)
        .await
        .map_err(|e| ApiError::DatabaseError(e.to_string()))
}
