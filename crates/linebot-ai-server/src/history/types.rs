use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::models::UserKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionKind {
    Text,
    Image,
}

impl InteractionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
        }
    }
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One completed exchange. Created only after a provider success or a cache
/// hit, then handed to the history sink exactly once.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InteractionRecord {
    pub id: Uuid,
    pub user: UserKey,
    pub kind: InteractionKind,
    pub input_summary: String,
    pub output_text: String,
    pub provider_id: String,
    pub context: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl InteractionRecord {
    pub fn builder(user: UserKey, kind: InteractionKind) -> InteractionRecordBuilder {
        InteractionRecordBuilder::new(user, kind)
    }
}

pub struct InteractionRecordBuilder {
    record: InteractionRecord,
}

impl InteractionRecordBuilder {
    pub fn new(user: UserKey, kind: InteractionKind) -> Self {
        Self {
            record: InteractionRecord {
                id: Uuid::new_v4(),
                user,
                kind,
                input_summary: String::new(),
                output_text: String::new(),
                provider_id: String::new(),
                context: Map::new(),
                created_at: Utc::now(),
            },
        }
    }

    pub fn input(mut self, summary: impl Into<String>) -> Self {
        self.record.input_summary = summary.into();
        self
    }

    pub fn output(mut self, text: impl Into<String>) -> Self {
        self.record.output_text = text.into();
        self
    }

    pub fn provider(mut self, id: impl Into<String>) -> Self {
        self.record.provider_id = id.into();
        self
    }

    /// Merges caller metadata; keys set later with `custom` win.
    pub fn context(mut self, context: Map<String, Value>) -> Self {
        self.record.context.extend(context);
        self
    }

    pub fn custom(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.record.context.insert(key.to_string(), value.into());
        self
    }

    pub fn build(self) -> InteractionRecord {
        self.record
    }
}

/// A user was seen; upserts their profile row and bumps `last_active`.
#[derive(Debug, Clone, PartialEq)]
pub struct UserActivity {
    pub user: UserKey,
    pub at: DateTime<Utc>,
}

impl UserActivity {
    pub fn now(user: UserKey) -> Self {
        Self {
            user,
            at: Utc::now(),
        }
    }
}

/// Unit of work on the history queue.
#[derive(Debug, Clone)]
pub enum HistoryEvent {
    Interaction(InteractionRecord),
    Activity(UserActivity),
}

impl HistoryEvent {
    pub fn user(&self) -> &UserKey {
        match self {
            Self::Interaction(record) => &record.user,
            Self::Activity(activity) => &activity.user,
        }
    }
}

impl From<InteractionRecord> for HistoryEvent {
    fn from(record: InteractionRecord) -> Self {
        Self::Interaction(record)
    }
}
