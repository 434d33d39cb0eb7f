//! Model orchestration.
//!
//! Two shapes live here: the waiter's single pass with a fixed fallback
//! sentence, and the layout generator's two passes with structural
//! fallbacks.  Both go through [`invoke`], which makes exactly one attempt
//! per model, bounds it with a timeout and never returns an error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;

use crate::models::{ChatMessage, ChatModel, CompletionOptions, ModelCallResult, ModelError};

pub mod layout;
pub mod suggestions;
pub mod waiter;

pub use self::layout::{LayoutOrchestrator, LayoutOutcome};
pub use self::suggestions::{extract_suggestions, Suggestion};
pub use self::waiter::{WaiterOrchestrator, WAITER_FALLBACK_REPLY};

/// Model name reported when no model produced the text.
pub const FALLBACK_MODEL: &str = "fallback";

/// Call `model` once.  Any failure, including a missing model or a timeout,
/// yields `fallback_text` with `succeeded = false`.
pub async fn invoke(
    model: Option<&Arc<dyn ChatModel>>,
    stage: &'static str,
    messages: &[ChatMessage],
    options: &CompletionOptions,
    timeout: Duration,
    fallback_text: &str,
) -> ModelCallResult {
    let started = Instant::now();
    let outcome = match model {
        None => Err(ModelError::NotConfigured(stage)),
        Some(model) => match tokio::time::timeout(timeout, model.complete(messages, options)).await {
            Ok(result) => result,
            Err(_) => Err(ModelError::Timeout(timeout.as_millis() as u64)),
        },
    };
    let latency_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Ok(text) => ModelCallResult {
            text,
            model_used: model.map(|m| m.name().to_string()).unwrap_or_default(),
            latency_ms,
            succeeded: true,
        },
        Err(err) => {
            tracing::warn!(
                stage,
                model = model.map(|m| m.name()).unwrap_or("none"),
                latency_ms,
                error = %err,
                "model call failed, using fallback"
            );
            ModelCallResult {
                text: fallback_text.to_string(),
                model_used: FALLBACK_MODEL.to_string(),
                latency_ms,
                succeeded: false,
            }
        }
    }
}

/// A parsed document together with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed<T> {
    Model(T),
    Fallback(T),
}

impl<T> Parsed<T> {
    pub fn into_inner(self) -> T {
        match self {
            Parsed::Model(v) | Parsed::Fallback(v) => v,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Parsed::Fallback(_))
    }
}

/// Parse model text as `T`, substituting `default` when it does not parse.
/// A surrounding Markdown code fence is tolerated.
pub fn parse_with_fallback<T: DeserializeOwned>(text: &str, default: T) -> Parsed<T> {
    match serde_json::from_str::<T>(strip_code_fence(text)) {
        Ok(value) => Parsed::Model(value),
        Err(err) => {
            tracing::debug!(error = %err, "model output is not the expected JSON, using default");
            Parsed::Fallback(default)
        }
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // drop the info string (e.g. `json`) on the opening line
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or("");
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}
