use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};

use super::chat::UserKey;

/// Message handed to the orchestrator by the transport layer.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub user: UserKey,
    pub payload: InboundPayload,
    /// Provider chosen out-of-band by the caller; wins over an in-text prefix.
    pub directive: Option<String>,
    /// Caller metadata copied into the persisted record.
    pub context: Option<Map<String, Value>>,
}

impl InboundMessage {
    pub fn text(user: impl Into<UserKey>, text: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            payload: InboundPayload::Text(text.into()),
            directive: None,
            context: None,
        }
    }

    pub fn image(user: impl Into<UserKey>, upload: ImageUpload) -> Self {
        Self {
            user: user.into(),
            payload: InboundPayload::Image(upload),
            directive: None,
            context: None,
        }
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directive = Some(directive.into());
        self
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = Some(context);
        self
    }
}

#[derive(Debug, Clone)]
pub enum InboundPayload {
    Text(String),
    Image(ImageUpload),
}

#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub file_name: String,
    pub data: Bytes,
    /// Optional user question about the image.
    pub description: Option<String>,
}

impl ImageUpload {
    pub fn new(file_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            file_name: file_name.into(),
            data: data.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// How the reply text was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplySource {
    Provider,
    Cache,
    /// Provider failed; the text is the fixed user-facing fallback.
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextReply {
    pub text: String,
    pub provider: String,
    pub source: ReplySource,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageReply {
    pub analysis: String,
    pub model: Option<String>,
    pub provider: String,
    pub cached: bool,
    #[serde(skip)]
    pub source: ReplySource,
}

#[derive(Debug, Clone)]
pub enum OutboundReply {
    Text(TextReply),
    Image(ImageReply),
}
