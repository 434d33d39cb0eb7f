//! Chat-completion provider adapters.
//!
//! Every provider satisfies the same narrow contract: a list of chat
//! messages plus options in, response text out.  Providers are declared in
//! the model configuration and bound by name to the three call sites of the
//! pipeline (`waiter`, `layoutStructure`, `layoutEnhance`).  A route with no
//! usable provider behaves exactly like a provider that always fails, so the
//! orchestrator's fallbacks cover it.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub mod anthropic;
pub mod openai;

use self::anthropic::AnthropicChatModel;
use self::openai::OpenAiChatModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Ask the provider for a JSON object response where supported.
    pub json_response: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{provider} returned {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("{0} response contained no text")]
    EmptyResponse(String),
    #[error("provider call timed out after {0} ms")]
    Timeout(u64),
    #[error("no model configured for {0}")]
    NotConfigured(&'static str),
    #[error("invalid provider configuration: {0}")]
    InvalidConfig(String),
}

#[async_trait::async_trait]
pub trait ChatModel: Send + Sync {
    /// Identifier reported as `modelUsed` / `generated_by`.
    fn name(&self) -> &str;

    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<String, ModelError>;
}

/// What a model call produced.  On failure `text` holds the substituted
/// fallback and `succeeded` is false, so downstream stages always receive a
/// well-formed value.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelCallResult {
    pub text: String,
    pub model_used: String,
    pub latency_ms: u64,
    pub succeeded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDefinition {
    pub name: String,
    pub kind: ProviderKind,
    pub model: String,
    /// Override the provider endpoint (proxies, compatible gateways, tests).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable holding the API key; used when `api_key` is unset.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_provider_timeout_ms() -> u64 {
    30_000
}

impl ProviderDefinition {
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| {
                self.api_key_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok())
            })
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    #[serde(default)]
    pub waiter: Option<String>,
    #[serde(default)]
    pub layout_structure: Option<String>,
    #[serde(default)]
    pub layout_enhance: Option<String>,
}

/// Provider declarations plus route bindings, loaded from
/// `DINEGATE_MODEL_CONFIG` or derived from well-known API key variables.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    #[serde(default)]
    pub providers: Vec<ProviderDefinition>,
    #[serde(default)]
    pub routes: RouteConfig,
}

impl ModelConfig {
    /// Defaults when no configuration file is given: one provider per API
    /// key found in the environment, structure pass on OpenAI and
    /// enhancement pass on Anthropic when both are present.
    pub fn from_env_keys() -> Self {
        let has = |var: &str| {
            std::env::var(var)
                .map(|v| !v.trim().is_empty())
                .unwrap_or(false)
        };
        let mut providers = Vec::new();
        if has("OPENAI_API_KEY") {
            providers.push(ProviderDefinition {
                name: "openai".into(),
                kind: ProviderKind::OpenAi,
                model: "gpt-4o-mini".into(),
                url: None,
                api_key: None,
                api_key_env: Some("OPENAI_API_KEY".into()),
                timeout_ms: default_provider_timeout_ms(),
            });
        }
        if has("ANTHROPIC_API_KEY") {
            providers.push(ProviderDefinition {
                name: "anthropic".into(),
                kind: ProviderKind::Anthropic,
                model: "claude-3-5-haiku-latest".into(),
                url: None,
                api_key: None,
                api_key_env: Some("ANTHROPIC_API_KEY".into()),
                timeout_ms: default_provider_timeout_ms(),
            });
        }
        let first = |preferred: &str| {
            providers
                .iter()
                .find(|p| p.name == preferred)
                .or_else(|| providers.first())
                .map(|p| p.name.clone())
        };
        let routes = RouteConfig {
            waiter: first("openai"),
            layout_structure: first("openai"),
            layout_enhance: first("anthropic"),
        };
        Self { providers, routes }
    }
}

/// Models bound to each call site.  `None` means "always fall back".
#[derive(Clone, Default)]
pub struct ModelRoutes {
    pub waiter: Option<Arc<dyn ChatModel>>,
    pub layout_structure: Option<Arc<dyn ChatModel>>,
    pub layout_enhance: Option<Arc<dyn ChatModel>>,
}

impl ModelRoutes {
    pub fn from_config(cfg: &ModelConfig) -> Self {
        let mut built: HashMap<String, Arc<dyn ChatModel>> = HashMap::new();
        for def in &cfg.providers {
            match build_provider(def) {
                Ok(model) => {
                    built.insert(def.name.clone(), model);
                }
                Err(err) => {
                    tracing::warn!(provider = %def.name, error = %err, "model provider unusable, skipping");
                }
            }
        }
        let bind = |route: &'static str, name: &Option<String>| -> Option<Arc<dyn ChatModel>> {
            let Some(name) = name else {
                tracing::warn!(route, "no model bound to route; responses will use fallbacks");
                return None;
            };
            let found = built.get(name).cloned();
            if found.is_none() {
                tracing::warn!(route, provider = %name, "model route references unknown provider");
            }
            found
        };
        Self {
            waiter: bind("waiter", &cfg.routes.waiter),
            layout_structure: bind("layoutStructure", &cfg.routes.layout_structure),
            layout_enhance: bind("layoutEnhance", &cfg.routes.layout_enhance),
        }
    }

    pub fn describe(&self) -> serde_json::Value {
        let name = |m: &Option<Arc<dyn ChatModel>>| m.as_ref().map(|m| m.name().to_string());
        serde_json::json!({
            "waiter": name(&self.waiter),
            "layoutStructure": name(&self.layout_structure),
            "layoutEnhance": name(&self.layout_enhance),
        })
    }
}

fn build_provider(def: &ProviderDefinition) -> Result<Arc<dyn ChatModel>, ModelError> {
    let api_key = def
        .resolve_api_key()
        .ok_or_else(|| ModelError::InvalidConfig(format!("no API key for '{}'", def.name)))?;
    let model: Arc<dyn ChatModel> = match def.kind {
        ProviderKind::OpenAi => Arc::new(OpenAiChatModel::new(def, api_key)?),
        ProviderKind::Anthropic => Arc::new(AnthropicChatModel::new(def, api_key)?),
    };
    Ok(model)
}
