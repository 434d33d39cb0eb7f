use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::{ChatMessage, ChatModel, ChatRole, CompletionOptions, ModelError, ProviderDefinition};

const DEFAULT_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// Anthropic messages API.  System messages are lifted into the top-level
/// `system` field; everything else is sent in order.
pub struct AnthropicChatModel {
    name: String,
    model: String,
    url: String,
    client: reqwest::Client,
}

impl AnthropicChatModel {
    pub fn new(def: &ProviderDefinition, api_key: String) -> Result<Self, ModelError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&api_key).map_err(|_| {
                ModelError::InvalidConfig(format!("invalid API key for '{}'", def.name))
            })?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(def.timeout_ms))
            .default_headers(headers)
            .build()?;
        Ok(Self {
            name: def.name.clone(),
            model: def.model.clone(),
            url: def.url.clone().unwrap_or_else(|| DEFAULT_URL.to_string()),
            client,
        })
    }
}

fn split_system(messages: &[ChatMessage]) -> (Option<String>, Vec<AnthropicMessage<'_>>) {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == ChatRole::System)
        .map(|m| m.content.as_str())
        .collect();
    let turns = messages
        .iter()
        .filter_map(|m| {
            let role = match m.role {
                ChatRole::System => return None,
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
            };
            Some(AnthropicMessage {
                role,
                content: &m.content,
            })
        })
        .collect();
    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    (system, turns)
}

#[async_trait::async_trait]
impl ChatModel for AnthropicChatModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<String, ModelError> {
        let (system, turns) = split_system(messages);
        let body = AnthropicRequest {
            model: &self.model,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            system: system.as_deref(),
            messages: turns,
        };
        let resp = self.client.post(&self.url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(ModelError::Status {
                provider: self.name.clone(),
                status: status.as_u16(),
                body: text,
            });
        }
        let parsed: AnthropicResponse = resp.json().await?;
        let answer = parsed
            .content
            .into_iter()
            .filter_map(|block| match block {
                AnthropicResponseBlock::Text { text } => Some(text),
                AnthropicResponseBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        let answer = answer.trim();
        if answer.is_empty() {
            return Err(ModelError::EmptyResponse(self.name.clone()));
        }
        Ok(answer.to_string())
    }
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<AnthropicMessage<'a>>,
}

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicResponseBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicResponseBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}
