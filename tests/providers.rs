use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use dinegate::models::anthropic::AnthropicChatModel;
use dinegate::models::openai::OpenAiChatModel;
use dinegate::models::{
    ChatMessage, ChatModel, CompletionOptions, ModelError, ProviderDefinition, ProviderKind,
};
use dinegate::orchestrator::{invoke, FALLBACK_MODEL};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

type Seen = Arc<Mutex<Vec<(HeaderMap, Value)>>>;

async fn serve(app: Router) -> (SocketAddr, JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, handle)
}

fn definition(kind: ProviderKind, name: &str, url: String, timeout_ms: u64) -> ProviderDefinition {
    ProviderDefinition {
        name: name.into(),
        kind,
        model: "test-model".into(),
        url: Some(url),
        api_key: Some("sk-test".into()),
        api_key_env: None,
        timeout_ms,
    }
}

const JSON_OPTIONS: CompletionOptions = CompletionOptions {
    temperature: 0.4,
    max_tokens: 300,
    json_response: true,
};

fn conversation() -> Vec<ChatMessage> {
    vec![
        ChatMessage::system("You are a waiter."),
        ChatMessage::user("Anything vegetarian?"),
    ]
}

#[tokio::test]
async fn openai_adapter_sends_chat_completion_and_reads_first_choice() {
    async fn completions(State(seen): State<Seen>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
        seen.lock().unwrap().push((headers, body));
        Json(json!({
            "choices": [{"message": {"role": "assistant", "content": "  Try the risotto.  "}}]
        }))
    }
    let seen: Seen = Arc::default();
    let app = Router::new()
        .route("/v1/chat/completions", post(completions))
        .with_state(seen.clone());
    let (addr, _h) = serve(app).await;

    let def = definition(
        ProviderKind::OpenAi,
        "gpt",
        format!("http://{}/v1/chat/completions", addr),
        2_000,
    );
    let model = OpenAiChatModel::new(&def, "sk-test".into()).unwrap();
    let text = model.complete(&conversation(), &JSON_OPTIONS).await.unwrap();
    assert_eq!(text, "Try the risotto.");
    assert_eq!(model.name(), "gpt");

    let (headers, body) = seen.lock().unwrap()[0].clone();
    assert_eq!(headers.get("authorization").unwrap(), "Bearer sk-test");
    assert_eq!(body["model"], "test-model");
    assert_eq!(body["max_tokens"], json!(300));
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][1]["content"], "Anything vegetarian?");
    assert_eq!(body["response_format"]["type"], "json_object");
}

#[tokio::test]
async fn openai_adapter_reports_upstream_status() {
    async fn overloaded() -> (StatusCode, &'static str) {
        (StatusCode::TOO_MANY_REQUESTS, "slow down")
    }
    let (addr, _h) = serve(Router::new().route("/v1/chat/completions", post(overloaded))).await;

    let def = definition(
        ProviderKind::OpenAi,
        "gpt",
        format!("http://{}/v1/chat/completions", addr),
        2_000,
    );
    let model = OpenAiChatModel::new(&def, "sk-test".into()).unwrap();
    let err = model.complete(&conversation(), &JSON_OPTIONS).await.unwrap_err();
    match err {
        ModelError::Status {
            provider,
            status,
            body,
        } => {
            assert_eq!(provider, "gpt");
            assert_eq!(status, 429);
            assert_eq!(body, "slow down");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn openai_adapter_rejects_empty_content() {
    async fn empty() -> Json<Value> {
        Json(json!({"choices": [{"message": {"role": "assistant", "content": null}}]}))
    }
    let (addr, _h) = serve(Router::new().route("/v1/chat/completions", post(empty))).await;
    let def = definition(
        ProviderKind::OpenAi,
        "gpt",
        format!("http://{}/v1/chat/completions", addr),
        2_000,
    );
    let model = OpenAiChatModel::new(&def, "sk-test".into()).unwrap();
    let err = model.complete(&conversation(), &JSON_OPTIONS).await.unwrap_err();
    assert!(matches!(err, ModelError::EmptyResponse(name) if name == "gpt"));
}

#[tokio::test]
async fn anthropic_adapter_lifts_system_prompt_and_joins_text_blocks() {
    async fn messages(State(seen): State<Seen>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
        seen.lock().unwrap().push((headers, body));
        Json(json!({
            "content": [
                {"type": "text", "text": "The Caprese salad"},
                {"type": "text", "text": "is vegetarian."}
            ]
        }))
    }
    let seen: Seen = Arc::default();
    let app = Router::new()
        .route("/v1/messages", post(messages))
        .with_state(seen.clone());
    let (addr, _h) = serve(app).await;

    let def = definition(
        ProviderKind::Anthropic,
        "claude",
        format!("http://{}/v1/messages", addr),
        2_000,
    );
    let model = AnthropicChatModel::new(&def, "sk-test".into()).unwrap();
    let text = model.complete(&conversation(), &JSON_OPTIONS).await.unwrap();
    assert_eq!(text, "The Caprese salad\nis vegetarian.");

    let (headers, body) = seen.lock().unwrap()[0].clone();
    assert_eq!(headers.get("x-api-key").unwrap(), "sk-test");
    assert_eq!(headers.get("anthropic-version").unwrap(), "2023-06-01");
    assert_eq!(body["system"], "You are a waiter.");
    let turns = body["messages"].as_array().unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0]["role"], "user");
}

#[tokio::test]
async fn slow_provider_is_cut_off_by_the_orchestrator_timeout() {
    async fn stall() -> Json<Value> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Json(json!({"choices": [{"message": {"content": "too late"}}]}))
    }
    let (addr, _h) = serve(Router::new().route("/v1/chat/completions", post(stall))).await;
    let def = definition(
        ProviderKind::OpenAi,
        "gpt",
        format!("http://{}/v1/chat/completions", addr),
        10_000,
    );
    let model: Arc<dyn ChatModel> = Arc::new(OpenAiChatModel::new(&def, "sk-test".into()).unwrap());

    let result = invoke(
        Some(&model),
        "waiter",
        &conversation(),
        &JSON_OPTIONS,
        Duration::from_millis(100),
        "fallback text",
    )
    .await;
    assert!(!result.succeeded);
    assert_eq!(result.text, "fallback text");
    assert_eq!(result.model_used, FALLBACK_MODEL);
    assert!(result.latency_ms < 5_000);
}
