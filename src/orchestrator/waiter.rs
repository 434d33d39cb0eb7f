use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use crate::context::VendorContext;
use crate::models::{ChatMessage, ChatModel, CompletionOptions, ModelCallResult};
use crate::store::CatalogItem;
use crate::WaiterRequest;

pub const WAITER_FALLBACK_REPLY: &str = "I'm sorry, I'm having trouble answering right now. Please try again in a moment, or ask a member of staff for help.";

/// Prior turns replayed to the model, newest last.
const MAX_HISTORY_TURNS: usize = 10;

const WAITER_OPTIONS: CompletionOptions = CompletionOptions {
    temperature: 0.7,
    max_tokens: 500,
    json_response: false,
};

/// Single pass: one model, one attempt, fixed sentence on failure.
#[derive(Clone)]
pub struct WaiterOrchestrator {
    model: Option<Arc<dyn ChatModel>>,
    timeout: Duration,
}

impl WaiterOrchestrator {
    pub fn new(model: Option<Arc<dyn ChatModel>>, timeout: Duration) -> Self {
        Self { model, timeout }
    }

    pub async fn respond(&self, ctx: &VendorContext, req: &WaiterRequest) -> ModelCallResult {
        let messages = build_messages(ctx, req);
        super::invoke(
            self.model.as_ref(),
            "waiter",
            &messages,
            &WAITER_OPTIONS,
            self.timeout,
            WAITER_FALLBACK_REPLY,
        )
        .await
    }
}

pub fn build_messages(ctx: &VendorContext, req: &WaiterRequest) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(system_prompt(ctx, req))];
    if let Some(history) = req
        .conversation_context
        .as_ref()
        .map(|c| c.previous_messages.as_slice())
    {
        let skip = history.len().saturating_sub(MAX_HISTORY_TURNS);
        for turn in &history[skip..] {
            match turn.role.as_str() {
                "user" => messages.push(ChatMessage::user(turn.content.clone())),
                "assistant" => messages.push(ChatMessage::assistant(turn.content.clone())),
                _ => {}
            }
        }
    }
    messages.push(ChatMessage::user(req.message.clone()));
    messages
}

fn system_prompt(ctx: &VendorContext, req: &WaiterRequest) -> String {
    let mut prompt = format!(
        "You are a friendly AI waiter for {}. Help guests choose from the menu, answer questions about dishes and make recommendations.\n\n",
        ctx.vendor.name
    );
    let items = ctx.items();
    if items.is_empty() {
        prompt.push_str(
            "The menu is not available right now. Do not invent dishes or prices; offer to call a member of staff instead.\n",
        );
    } else {
        prompt.push_str("Menu items currently available:\n");
        for item in items {
            prompt.push_str(&menu_line(item));
            prompt.push('\n');
        }
    }
    prompt.push_str(
        "\nGuidelines:\n\
         - Only recommend items from the menu above.\n\
         - Refer to dishes by their exact menu name.\n\
         - Keep replies under 120 words.\n\
         - If you are unsure, say so and offer to call a member of staff.\n",
    );
    if let Some(prefs) = req.user_preferences.as_ref().and_then(preference_lines) {
        prompt.push_str("\nGuest preferences:\n");
        prompt.push_str(&prefs);
    }
    prompt
}

fn menu_line(item: &CatalogItem) -> String {
    let mut line = format!("- {}", item.name);
    if let Some(price) = item.price {
        let _ = write!(line, " (${:.2})", price);
    }
    if let Some(category) = item.category.as_deref().filter(|c| !c.is_empty()) {
        let _ = write!(line, " - {}", category);
    }
    line
}

fn preference_lines(prefs: &serde_json::Value) -> Option<String> {
    let map = prefs.as_object()?;
    let mut out = String::new();
    for (key, value) in map {
        let rendered = match value {
            serde_json::Value::Null => continue,
            serde_json::Value::String(s) if s.is_empty() => continue,
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Array(items) if items.is_empty() => continue,
            serde_json::Value::Array(items) => items
                .iter()
                .map(|v| v.as_str().map(String::from).unwrap_or_else(|| v.to_string()))
                .collect::<Vec<_>>()
                .join(", "),
            other => other.to_string(),
        };
        let _ = writeln!(out, "- {}: {}", key, rendered);
    }
    (!out.is_empty()).then_some(out)
}
