use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::database::HistoryRow;

/// `{line_user_id, history}` envelope shared by both history endpoints.
#[derive(Debug, Serialize)]
pub struct HistoryResponse<T> {
    pub line_user_id: String,
    pub history: Vec<T>,
}

#[derive(Debug, Serialize)]
pub struct ChatHistoryItem {
    pub id: Uuid,
    pub message: String,
    pub response: String,
    pub created_at: DateTime<Utc>,
    pub provider: String,
    pub context: Value,
}

impl From<HistoryRow> for ChatHistoryItem {
    fn from(row: HistoryRow) -> Self {
        let provider = match context_str(&row.context, "provider") {
            Some(provider) => provider.to_string(),
            None if !row.provider_id.is_empty() => row.provider_id.clone(),
            None => "unknown".to_string(),
        };

        Self {
            id: row.id,
            message: row.input_summary,
            response: row.output_text,
            created_at: row.created_at,
            provider,
            context: row.context,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ImageHistoryItem {
    pub id: Uuid,
    pub image_url: Option<String>,
    pub description: Option<String>,
    pub analysis: String,
    pub created_at: DateTime<Utc>,
}

impl From<HistoryRow> for ImageHistoryItem {
    fn from(row: HistoryRow) -> Self {
        Self {
            id: row.id,
            image_url: context_str(&row.context, "image_ref").map(str::to_string),
            description: context_str(&row.context, "description").map(str::to_string),
            analysis: row.output_text,
            created_at: row.created_at,
        }
    }
}

fn context_str<'a>(context: &'a Value, key: &str) -> Option<&'a str> {
    context.get(key).and_then(Value::as_str)
}
