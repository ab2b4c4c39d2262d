use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::types::Json;
use tracing::{debug, info};

use super::{DbPool, HistoryRow, UserRow};
use crate::history::{
    InteractionKind, InteractionRecord, InteractionStore, PersistenceError, UserActivity,
};
use crate::models::UserKey;

const USER_COLUMNS: &str = "id, line_user_id, username, preferences, created_at, last_active";

pub struct Repository {
    pub pool: DbPool,
}

impl Repository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Newest first.
    pub async fn recent_for_user(
        &self,
        user: &UserKey,
        kind: InteractionKind,
        limit: i64,
    ) -> Result<Vec<HistoryRow>, PersistenceError> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"SELECT
                id, user_key, kind, input_summary, output_text,
                provider_id, context, created_at
               FROM interaction_history
               WHERE user_key = $1 AND kind = $2
               ORDER BY created_at DESC
               LIMIT $3"#,
        )
        .bind(strip_nul(user.as_str()))
        .bind(kind.as_str())
        .bind(limit)
        .fetch_all(self.pool.get_pool())
        .await?;

        debug!("Loaded {} {} history rows for {}", rows.len(), kind, user);
        Ok(rows)
    }

    pub async fn get_user(&self, user: &UserKey) -> Result<Option<UserRow>, PersistenceError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {} FROM users WHERE line_user_id = $1",
            USER_COLUMNS
        ))
        .bind(strip_nul(user.as_str()))
        .fetch_optional(self.pool.get_pool())
        .await?;
        Ok(row)
    }

    /// Creates the profile, or returns the existing one untouched.
    pub async fn create_user(
        &self,
        user: &UserKey,
        username: Option<&str>,
        preferences: &Map<String, Value>,
    ) -> Result<UserRow, PersistenceError> {
        let inserted = sqlx::query_as::<_, UserRow>(&format!(
            r#"INSERT INTO users (line_user_id, username, preferences)
               VALUES ($1, $2, $3)
               ON CONFLICT (line_user_id) DO NOTHING
               RETURNING {}"#,
            USER_COLUMNS
        ))
        .bind(strip_nul(user.as_str()))
        .bind(username.map(strip_nul))
        .bind(Json(strip_nul_map(preferences)))
        .fetch_optional(self.pool.get_pool())
        .await?;

        if let Some(row) = inserted {
            info!("Created user profile for {}", user);
            return Ok(row);
        }

        let existing = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {} FROM users WHERE line_user_id = $1",
            USER_COLUMNS
        ))
        .bind(strip_nul(user.as_str()))
        .fetch_one(self.pool.get_pool())
        .await?;
        Ok(existing)
    }

    /// Sets `username` when given and merges `preferences` into the stored
    /// object. `None` when the user does not exist.
    pub async fn update_user(
        &self,
        user: &UserKey,
        username: Option<&str>,
        preferences: Option<&Map<String, Value>>,
    ) -> Result<Option<UserRow>, PersistenceError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            r#"UPDATE users
               SET username = COALESCE($2, username),
                   preferences = preferences || COALESCE($3, '{{}}'::jsonb)
               WHERE line_user_id = $1
               RETURNING {}"#,
            USER_COLUMNS
        ))
        .bind(strip_nul(user.as_str()))
        .bind(username.map(strip_nul))
        .bind(preferences.map(|p| Json(strip_nul_map(p))))
        .fetch_optional(self.pool.get_pool())
        .await?;

        if row.is_some() {
            info!("Updated user profile for {}", user);
        }
        Ok(row)
    }
}

#[async_trait]
impl InteractionStore for Repository {
    async fn insert_batch(&self, records: &[InteractionRecord]) -> Result<usize, PersistenceError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut query_builder = sqlx::QueryBuilder::new(
            r#"
            INSERT INTO interaction_history (
                id, user_key, kind, input_summary, output_text,
                provider_id, context, created_at
            )
            "#,
        );

        query_builder.push_values(records, |mut b, record| {
            b.push_bind(record.id)
                .push_bind(strip_nul(record.user.as_str()))
                .push_bind(record.kind.as_str())
                .push_bind(strip_nul(&record.input_summary))
                .push_bind(strip_nul(&record.output_text))
                .push_bind(strip_nul(&record.provider_id))
                .push_bind(Json(strip_nul_map(&record.context)))
                .push_bind(record.created_at);
        });
        query_builder.push(" ON CONFLICT (id) DO NOTHING");

        let result = query_builder.build().execute(self.pool.get_pool()).await?;
        Ok(result.rows_affected() as usize)
    }

    async fn touch_users(&self, activity: &[UserActivity]) -> Result<usize, PersistenceError> {
        if activity.is_empty() {
            return Ok(0);
        }

        let mut query_builder =
            sqlx::QueryBuilder::new("INSERT INTO users (line_user_id, created_at, last_active) ");
        query_builder.push_values(activity, |mut b, seen| {
            b.push_bind(strip_nul(seen.user.as_str()))
                .push_bind(seen.at)
                .push_bind(seen.at);
        });
        query_builder.push(
            " ON CONFLICT (line_user_id) DO UPDATE \
             SET last_active = GREATEST(users.last_active, EXCLUDED.last_active)",
        );

        let result = query_builder.build().execute(self.pool.get_pool()).await?;
        Ok(result.rows_affected() as usize)
    }
}

/// Postgres TEXT and JSONB reject U+0000.
fn strip_nul(text: &str) -> String {
    if text.contains('\0') {
        text.replace('\0', "")
    } else {
        text.to_string()
    }
}

fn strip_nul_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(strip_nul(s)),
        Value::Array(items) => Value::Array(items.iter().map(strip_nul_value).collect()),
        Value::Object(map) => Value::Object(strip_nul_map(map)),
        other => other.clone(),
    }
}

fn strip_nul_map(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(k, v)| (strip_nul(k), strip_nul_value(v)))
        .collect()
}
