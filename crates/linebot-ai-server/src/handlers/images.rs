use axum::{
    extract::{Multipart, State},
    Json,
};
use std::sync::Arc;
use tracing::info;

use crate::models::{ImageReply, ImageUpload, InboundMessage, OutboundReply};
use crate::state::AppState;
use crate::utils::error::ApiError;

/// `multipart/form-data` with `image`, `line_user_id`, and optional
/// `description` and `model_provider` fields.
pub async fn analyze_image(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<ImageReply>, ApiError> {
    let mut user_id: Option<String> = None;
    let mut description: Option<String> = None;
    let mut model_provider: Option<String> = None;
    let mut upload: Option<ImageUpload> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Failed to read field: {}", e)))?
    {
        let field_name = field.name().unwrap_or("").to_string();

        match field_name.as_str() {
            "image" => {
                let file_name = field.file_name().unwrap_or("").to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Failed to read image: {}", e)))?;
                upload = Some(ImageUpload::new(file_name, data));
            }
            "line_user_id" | "description" | "model_provider" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Invalid {}: {}", field_name, e)))?;
                match field_name.as_str() {
                    "line_user_id" => user_id = Some(text),
                    "description" => description = Some(text),
                    _ => model_provider = Some(text),
                }
            }
            _ => {}
        }
    }

    let user_id = user_id.ok_or_else(|| ApiError::BadRequest("line_user_id required".to_string()))?;
    let mut upload = upload.ok_or_else(|| ApiError::BadRequest("image required".to_string()))?;
    if let Some(description) = description {
        upload = upload.with_description(description);
    }

    info!(
        "Image analysis request: user={}, file={}, bytes={}",
        user_id,
        upload.file_name,
        upload.data.len()
    );

    let mut message = InboundMessage::image(user_id, upload);
    if let Some(provider) = model_provider {
        message = message.with_directive(provider);
    }

    match state.orchestrator.handle(message).await? {
        OutboundReply::Image(reply) => Ok(Json(reply)),
        OutboundReply::Text(_) => Err(ApiError::InternalError(
            "image exchange produced a text reply".to_string(),
        )),
    }
}
