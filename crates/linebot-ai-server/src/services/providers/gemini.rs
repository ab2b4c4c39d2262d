use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{http_client, image_prompt, send_json, ImageInput, LlmProvider, ProviderError, ProviderReply};
use crate::config::ProviderConfig;
use crate::models::{ConversationTurn, Role, UserKey};

// Request Structures
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part {
    Text { text: String },
    Inline { inline_data: InlineData },
}

#[derive(Debug, Serialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    temperature: f32,
}

// Response Structures
#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

/// Google Gemini `generateContent` adapter.
#[derive(Clone)]
pub struct GeminiProvider {
    client: Client,
    config: ProviderConfig,
    timeout: Duration,
}

impl GeminiProvider {
    pub const ID: &'static str = "gemini";

    pub fn new(config: ProviderConfig, timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
            config,
            timeout,
        }
    }

    fn generation_config(&self) -> GenerationConfig {
        GenerationConfig {
            max_output_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        }
    }

    async fn generate_content(
        &self,
        model: &str,
        request: GenerateContentRequest,
    ) -> Result<ProviderReply, ProviderError> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            model
        );
        let builder = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(&request);

        let body: GenerateContentResponse = send_json(builder, Self::ID, self.timeout).await?;

        // Gemini may split one answer over several parts.
        let text: String = body
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        let text = text.trim();
        if text.is_empty() {
            return Err(ProviderError::MalformedResponse(
                "Gemini returned no candidate text".to_string(),
            ));
        }

        Ok(ProviderReply::new(text, Self::ID, model))
    }
}

fn gemini_role(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "model",
    }
}

/// Gemini requires the conversation to open with a user turn and alternate
/// roles: leading model turns are dropped and same-role runs merged.
fn conversation_contents(history: &[ConversationTurn], input: &str) -> Vec<Content> {
    let turns = history
        .iter()
        .skip_while(|turn| turn.role == Role::Assistant)
        .map(|turn| (gemini_role(turn.role), turn.content.as_str()))
        .chain(std::iter::once(("user", input)));

    let mut contents: Vec<Content> = Vec::new();
    for (role, text) in turns {
        let part = Part::Text {
            text: text.to_string(),
        };
        match contents.last_mut() {
            Some(last) if last.role == Some(role) => last.parts.push(part),
            _ => contents.push(Content {
                role: Some(role),
                parts: vec![part],
            }),
        }
    }
    contents
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    async fn generate(
        &self,
        user: &UserKey,
        input: &str,
        history: &[ConversationTurn],
    ) -> Result<ProviderReply, ProviderError> {
        debug!(
            "Gemini generate for {} with {} prior turns",
            user,
            history.len()
        );

        let request = GenerateContentRequest {
            contents: conversation_contents(history, input),
            system_instruction: self.config.system_prompt.as_ref().map(|prompt| Content {
                role: None,
                parts: vec![Part::Text {
                    text: prompt.clone(),
                }],
            }),
            generation_config: self.generation_config(),
        };

        self.generate_content(&self.config.model_name, request).await
    }

    async fn analyze_image(&self, image: &ImageInput) -> Result<ProviderReply, ProviderError> {
        let request = GenerateContentRequest {
            contents: vec![Content {
                role: Some("user"),
                parts: vec![
                    Part::Text {
                        text: image_prompt(image.description.as_deref()),
                    },
                    Part::Inline {
                        inline_data: InlineData {
                            mime_type: image.mime_type.clone(),
                            data: STANDARD.encode(&image.data),
                        },
                    },
                ],
            }],
            system_instruction: None,
            generation_config: self.generation_config(),
        };

        self.generate_content(self.config.vision_model(), request)
            .await
    }
}
