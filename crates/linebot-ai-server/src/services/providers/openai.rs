use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{http_client, image_prompt, send_json, ImageInput, LlmProvider, ProviderError, ProviderReply};
use crate::config::ProviderConfig;
use crate::models::{ConversationTurn, UserKey};

const DEFAULT_SYSTEM_PROMPT: &str = "你是一個友善的聊天機器人助手，請用繁體中文回應用戶問題。";

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    n: u8,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: MessageContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: Option<String>,
}

/// OpenAI-compatible `chat/completions` adapter.
#[derive(Clone)]
pub struct OpenAiProvider {
    client: Client,
    config: ProviderConfig,
    timeout: Duration,
}

impl OpenAiProvider {
    pub const ID: &'static str = "openai";

    pub fn new(config: ProviderConfig, timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
            config,
            timeout,
        }
    }

    fn system_prompt(&self) -> &str {
        self.config
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT)
    }

    async fn complete(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<ProviderReply, ProviderError> {
        let request = ChatCompletionRequest {
            model,
            messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            n: 1,
        };

        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let builder = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&request);

        let body: ChatCompletionResponse = send_json(builder, Self::ID, self.timeout).await?;

        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                ProviderError::MalformedResponse("OpenAI returned no message content".to_string())
            })?;

        Ok(ProviderReply::new(text, Self::ID, model))
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn generate(
        &self,
        user: &UserKey,
        input: &str,
        history: &[ConversationTurn],
    ) -> Result<ProviderReply, ProviderError> {
        debug!(
            "OpenAI generate for {} with {} prior turns",
            user,
            history.len()
        );

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage {
            role: "system",
            content: MessageContent::Text(self.system_prompt().to_string()),
        });
        messages.extend(history.iter().map(|turn| ChatMessage {
            role: turn.role.as_str(),
            content: MessageContent::Text(turn.content.clone()),
        }));
        messages.push(ChatMessage {
            role: "user",
            content: MessageContent::Text(input.to_string()),
        });

        self.complete(&self.config.model_name, messages).await
    }

    async fn analyze_image(&self, image: &ImageInput) -> Result<ProviderReply, ProviderError> {
        let data_url = format!("data:{};base64,{}", image.mime_type, STANDARD.encode(&image.data));
        let messages = vec![ChatMessage {
            role: "user",
            content: MessageContent::Parts(vec![
                ContentPart::Text {
                    text: image_prompt(image.description.as_deref()),
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrl { url: data_url },
                },
            ]),
        }];

        self.complete(self.config.vision_model(), messages).await
    }
}
