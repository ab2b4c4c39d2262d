//! LLM provider adapters
//!
//! Every backend implements `LlmProvider`; the orchestrator only ever talks to
//! the trait through `ProviderRegistry`, keyed by provider id. Adapters are
//! stateless: all conversation context arrives as arguments.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::config::ProvidersConfig;
use crate::models::{ConversationTurn, UserKey};

pub mod gemini;
pub mod openai;

pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Provider network error: {0}")]
    Network(String),

    #[error("Provider API error ({status}): {body}")]
    Upstream { status: StatusCode, body: String },

    #[error("Malformed provider response: {0}")]
    MalformedResponse(String),

    #[error("Provider saturated: {0}")]
    Saturated(String),

    #[error("Provider does not support {0}")]
    Unsupported(&'static str),
}

impl ProviderError {
    /// Whether a later identical request could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Network(_) | Self::Saturated(_) => true,
            Self::Upstream { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::MalformedResponse(_) | Self::Unsupported(_) => false,
        }
    }
}

/// Successful provider output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderReply {
    pub text: String,
    pub provider_id: String,
    pub model: String,
}

impl ProviderReply {
    pub fn new(
        text: impl Into<String>,
        provider_id: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            provider_id: provider_id.into(),
            model: model.into(),
        }
    }
}

/// Image handed to an adapter, already validated.
#[derive(Debug, Clone)]
pub struct ImageInput {
    pub data: Bytes,
    pub mime_type: String,
    /// User question about the image, if any.
    pub description: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Reply to `input` given the prior turns, oldest first.
    async fn generate(
        &self,
        user: &UserKey,
        input: &str,
        history: &[ConversationTurn],
    ) -> Result<ProviderReply, ProviderError>;

    async fn analyze_image(&self, image: &ImageInput) -> Result<ProviderReply, ProviderError>;
}

/// Prompt sent alongside an image.
pub fn image_prompt(description: Option<&str>) -> String {
    match description.map(str::trim).filter(|d| !d.is_empty()) {
        Some(question) => format!(
            "請分析這張圖片並回答用戶的問題: {}\n請使用繁體中文回答。",
            question
        ),
        None => "請詳細描述這張圖片中的內容。請使用繁體中文描述。".to_string(),
    }
}

/// Sends `request` and decodes a JSON body, mapping every failure mode onto
/// `ProviderError`.
pub(crate) async fn send_json<T: DeserializeOwned>(
    request: RequestBuilder,
    provider: &str,
    timeout: Duration,
) -> Result<T, ProviderError> {
    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            ProviderError::Timeout(timeout)
        } else {
            ProviderError::Network(format!("{} request failed: {}", provider, e))
        }
    })?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::Upstream { status, body });
    }

    response.json::<T>().await.map_err(|e| {
        ProviderError::MalformedResponse(format!("{} response not decodable: {}", provider, e))
    })
}

pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Provider lookup keyed by id, plus the defaults for each message kind.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    default_text: String,
    default_image: String,
}

impl ProviderRegistry {
    pub fn new(default_text: impl Into<String>, default_image: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            default_text: default_text.into(),
            default_image: default_image.into(),
        }
    }

    /// Registry holding every provider that has a config block.
    pub fn from_settings(cfg: &ProvidersConfig) -> Self {
        let timeout = cfg.request_timeout();
        let mut registry = Self::new(cfg.default.clone(), cfg.image_default.clone());

        if let Some(openai) = &cfg.openai {
            registry.register(
                OpenAiProvider::ID,
                Arc::new(OpenAiProvider::new(openai.clone(), timeout)),
            );
        }
        if let Some(gemini) = &cfg.gemini {
            registry.register(
                GeminiProvider::ID,
                Arc::new(GeminiProvider::new(gemini.clone(), timeout)),
            );
        }

        info!(
            "Provider registry ready: {:?} (text default={}, image default={})",
            registry.ids(),
            registry.default_text,
            registry.default_image
        );
        registry
    }

    pub fn register(&mut self, id: impl Into<String>, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(id.into().to_lowercase(), provider);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(&id.to_lowercase()).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.providers.contains_key(&id.to_lowercase())
    }

    pub fn default_text(&self) -> &str {
        &self.default_text
    }

    pub fn default_image(&self) -> &str {
        &self.default_image
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}
