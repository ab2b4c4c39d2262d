use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::Map;
use std::sync::Arc;
use tracing::info;

use crate::database::UserRow;
use crate::models::user::{CreateUserRequest, UpdateUserRequest};
use crate::models::UserKey;
use crate::state::AppState;
use crate::utils::error::ApiError;

const USER_NOT_FOUND: &str = "用戶不存在";

/// Creates a profile; an existing one is returned unchanged.
pub async fn create_user(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateUserRequest>,
) -> Result<Json<UserRow>, ApiError> {
    let user = UserKey::new(request.line_user_id);
    if user.is_blank() {
        return Err(ApiError::BadRequest("line_user_id is required".to_string()));
    }
    info!("Create user request: {}", user);

    let row = state
        .repository
        .create_user(
            &user,
            request.username.as_deref(),
            &request.preferences.unwrap_or_else(Map::new),
        )
        .await
        .map_err(|e| ApiError::DatabaseError(e.to_string()))?;
    Ok(Json(row))
}

pub async fn get_user(
    State(state): State<Arc<AppState>>,
    Path(line_user_id): Path<String>,
) -> Result<Json<UserRow>, ApiError> {
    state
        .repository
        .get_user(&UserKey::new(line_user_id))
        .await
        .map_err(|e| ApiError::DatabaseError(e.to_string()))?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(USER_NOT_FOUND.to_string()))
}

pub async fn update_user(
    State(state): State<Arc<AppState>>,
    Path(line_user_id): Path<String>,
    Json(request): Json<UpdateUserRequest>,
) -> Result<Json<UserRow>, ApiError> {
    let user = UserKey::new(line_user_id);
    info!("Update user request: {}", user);

    state
        .repository
        .update_user(
            &user,
            request.username.as_deref(),
            request.preferences.as_ref(),
        )
        .await
        .map_err(|e| ApiError::DatabaseError(e.to_string()))?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(USER_NOT_FOUND.to_string()))
}
