#[path = "common/mod.rs"]
mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use common::{body_json, harness, post_json, trattoria, waiter_only, ScriptedModel};
use dinegate::rate_limit::{
    spawn_sweeper, InMemoryRateLimitStore, RateLimitConfig, RateLimitStore,
};
use dinegate::util::ManualClock;
use dinegate::{app, AppConfig};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

fn chat() -> serde_json::Value {
    json!({"message": "hi", "vendor_id": "v1", "guest_session_id": "s"})
}

#[tokio::test]
async fn eleventh_request_in_a_window_is_throttled() {
    let model = ScriptedModel::replying("gpt", "Hello!");
    let h = harness(&AppConfig::default(), trattoria(), waiter_only(model.clone()));

    for i in 0..10u32 {
        let resp = app(h.state.clone())
            .oneshot(post_json("/ai-waiter-chat", &chat()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "request {i}");
        assert_eq!(
            resp.headers().get("x-rate-limit-remaining").unwrap(),
            &(9 - i).to_string()
        );
    }

    let resp = app(h.state.clone())
        .oneshot(post_json("/ai-waiter-chat", &chat()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let headers = resp.headers().clone();
    assert_eq!(headers.get("x-rate-limit-remaining").unwrap(), "0");
    assert_eq!(headers.get("x-rate-limit-limit").unwrap(), "10");
    let retry: u64 = headers
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry));
    let body = body_json(resp).await;
    assert_eq!(body["error"]["code"], "RATE_LIMIT_EXCEEDED");
    assert_eq!(model.calls(), 10);
    assert_eq!(h.state.metrics.rejections_total("RATE_LIMIT_EXCEEDED"), 1);

    // the next window admits again
    h.clock.advance(Duration::from_secs(60));
    let resp = app(h.state.clone())
        .oneshot(post_json("/ai-waiter-chat", &chat()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("x-rate-limit-remaining").unwrap(), "9");
}

#[tokio::test]
async fn endpoints_and_clients_have_separate_buckets() {
    let cfg = AppConfig {
        waiter_rate: RateLimitConfig::new(1, 60_000),
        layout_rate: RateLimitConfig::new(1, 60_000),
        ..Default::default()
    };
    let model = ScriptedModel::replying("gpt", "Hello!");
    let h = harness(&cfg, trattoria(), waiter_only(model));

    let first = app(h.state.clone())
        .oneshot(post_json("/ai-waiter-chat", &chat()))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    // same client, other endpoint
    let layout = app(h.state.clone())
        .oneshot(post_json(
            "/ai-layout-generator",
            &json!({"vendorId": "v1", "layoutType": "menu"}),
        ))
        .await
        .unwrap();
    assert_eq!(layout.status(), StatusCode::OK);

    // other client, same endpoint
    let mut req = post_json("/ai-waiter-chat", &chat());
    req.headers_mut()
        .insert("x-forwarded-for", "198.51.100.9".parse().unwrap());
    let other = app(h.state.clone()).oneshot(req).await.unwrap();
    assert_eq!(other.status(), StatusCode::OK);

    let again = app(h.state.clone())
        .oneshot(post_json("/ai-waiter-chat", &chat()))
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(h.limiter.len(), 3);
}

#[tokio::test]
async fn throttled_requests_still_count_invalid_bodies() {
    let cfg = AppConfig {
        waiter_rate: RateLimitConfig::new(2, 60_000),
        ..Default::default()
    };
    let h = harness(&cfg, trattoria(), Default::default());

    for _ in 0..2 {
        let resp = app(h.state.clone())
            .oneshot(post_json("/ai-waiter-chat", &json!({"message": "hi"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
    let resp = app(h.state.clone())
        .oneshot(post_json("/ai-waiter-chat", &chat()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(h.store.total_calls(), 0);
}

#[tokio::test]
async fn sweeper_evicts_expired_buckets() {
    let clock = Arc::new(ManualClock::new(0));
    let store = Arc::new(InMemoryRateLimitStore::new(clock.clone()));
    let cfg = RateLimitConfig::new(5, 1_000);
    store.check_and_increment("a", &cfg).await;
    store.check_and_increment("b", &cfg).await;
    assert_eq!(store.len(), 2);

    let cancel = CancellationToken::new();
    let sweeper = spawn_sweeper(store.clone(), Duration::from_millis(10), cancel.clone());

    clock.advance(Duration::from_millis(1_000));
    let mut waited = 0;
    while !store.is_empty() && waited < 200 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        waited += 1;
    }
    assert!(store.is_empty());

    cancel.cancel();
    sweeper.await.unwrap();
}

#[tokio::test]
async fn concurrent_requests_never_overshoot_the_limit() {
    let clock = Arc::new(ManualClock::new(10_000));
    let store = Arc::new(InMemoryRateLimitStore::new(clock));
    let cfg = RateLimitConfig::new(20, 60_000);

    let mut tasks = Vec::new();
    for _ in 0..100 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store.check_and_increment("hot", &cfg).await.allowed
        }));
    }
    let mut admitted = 0;
    for task in tasks {
        if task.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 20);
    assert_eq!(store.bucket("hot").unwrap().count, 20);
}
