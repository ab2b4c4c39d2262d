use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// Row of `interaction_history` as returned by the history endpoints.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct HistoryRow {
    pub id: Uuid,
    pub user_key: String,
    pub kind: String,
    pub input_summary: String,
    pub output_text: String,
    pub provider_id: String,
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Row of `users`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct UserRow {
    pub id: i64,
    pub line_user_id: String,
    pub username: Option<String>,
    pub preferences: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}
