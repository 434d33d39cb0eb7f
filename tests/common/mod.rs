#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{Request, Response};
use dinegate::models::{ChatMessage, ChatModel, CompletionOptions, ModelError, ModelRoutes};
use dinegate::rate_limit::InMemoryRateLimitStore;
use dinegate::store::{
    CatalogItem, ConversationLogEntry, DataStore, MemoryDataStore, StoreError, Vendor,
};
use dinegate::util::ManualClock;
use dinegate::{AppConfig, AppState, Collaborators};
use http_body_util::BodyExt;

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn set_many(&mut self, entries: &[(&str, &str)]) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// Chat model with a canned reply that records every prompt it receives.
pub struct ScriptedModel {
    name: String,
    reply: Result<String, u16>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedModel {
    pub fn replying(name: &str, text: &str) -> Arc<Self> {
        Self::build(name, Ok(text.to_string()))
    }

    /// Fails every call with the given HTTP status.
    pub fn failing(name: &str, status: u16) -> Arc<Self> {
        Self::build(name, Err(status))
    }

    fn build(name: &str, reply: Result<String, u16>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            reply,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<Vec<ChatMessage>> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ChatModel for ScriptedModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        _options: &CompletionOptions,
    ) -> Result<String, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(messages.to_vec());
        match &self.reply {
            Ok(text) => Ok(text.clone()),
            Err(status) => Err(ModelError::Status {
                provider: self.name.clone(),
                status: *status,
                body: "scripted failure".into(),
            }),
        }
    }
}

/// Memory store wrapper that counts calls and can be told to fail.
pub struct CountingStore {
    inner: MemoryDataStore,
    pub vendor_calls: AtomicUsize,
    pub catalog_calls: AtomicUsize,
    pub insert_calls: AtomicUsize,
    pub fail_vendor: AtomicBool,
    pub fail_catalog: AtomicBool,
    pub fail_insert: AtomicBool,
}

impl CountingStore {
    pub fn new(inner: MemoryDataStore) -> Arc<Self> {
        Arc::new(Self {
            inner,
            vendor_calls: AtomicUsize::new(0),
            catalog_calls: AtomicUsize::new(0),
            insert_calls: AtomicUsize::new(0),
            fail_vendor: AtomicBool::new(false),
            fail_catalog: AtomicBool::new(false),
            fail_insert: AtomicBool::new(false),
        })
    }

    pub fn logged(&self) -> Vec<ConversationLogEntry> {
        self.inner.logged()
    }

    pub fn total_calls(&self) -> usize {
        self.vendor_calls.load(Ordering::SeqCst)
            + self.catalog_calls.load(Ordering::SeqCst)
            + self.insert_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl DataStore for CountingStore {
    async fn vendor(&self, vendor_id: &str) -> Result<Option<Vendor>, StoreError> {
        self.vendor_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_vendor.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("vendor table offline".into()));
        }
        self.inner.vendor(vendor_id).await
    }

    async fn available_items(
        &self,
        vendor_id: &str,
        limit: usize,
    ) -> Result<Vec<CatalogItem>, StoreError> {
        self.catalog_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_catalog.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("catalog offline".into()));
        }
        self.inner.available_items(vendor_id, limit).await
    }

    async fn insert_conversation(&self, rows: &[ConversationLogEntry]) -> Result<(), StoreError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(StoreError::Status {
                status: 503,
                body: "insert rejected".into(),
            });
        }
        self.inner.insert_conversation(rows).await
    }
}

pub fn item(id: &str, name: &str, price: f64, category: &str) -> CatalogItem {
    CatalogItem {
        id: id.into(),
        name: name.into(),
        price: Some(price),
        category: Some(category.into()),
        description: None,
    }
}

/// Vendor `v1` ("Trattoria Roma") with a pizza, a pasta and a dessert.
pub fn trattoria() -> MemoryDataStore {
    MemoryDataStore::new()
        .with_vendor("v1", "Trattoria Roma")
        .with_item("v1", item("m1", "Margherita Pizza", 12.5, "Main Course"))
        .with_item("v1", item("m2", "Spaghetti Carbonara", 14.0, "Pasta"))
        .with_item("v1", item("m3", "Tiramisu", 6.5, "Dessert"))
}

pub struct Harness {
    pub state: AppState,
    pub store: Arc<CountingStore>,
    pub clock: Arc<ManualClock>,
    pub limiter: Arc<InMemoryRateLimitStore>,
}

/// Build state around a counting store, a manual clock and the given models.
pub fn harness(cfg: &AppConfig, store: MemoryDataStore, models: ModelRoutes) -> Harness {
    let store = CountingStore::new(store);
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let limiter = Arc::new(InMemoryRateLimitStore::new(clock.clone()));
    let state = AppState::from_parts(
        cfg,
        Collaborators {
            store: store.clone(),
            models,
            rate_limiter: limiter.clone(),
        },
    )
    .unwrap();
    Harness {
        state,
        store,
        clock,
        limiter,
    }
}

pub fn waiter_only(model: Arc<ScriptedModel>) -> ModelRoutes {
    ModelRoutes {
        waiter: Some(model),
        ..Default::default()
    }
}

pub fn post_json(uri: &str, body: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-forwarded-for", "203.0.113.7")
        .header("user-agent", "integration-test")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_json(resp: Response<Body>) -> serde_json::Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Wait until the detached conversation log has written `rows` rows.
pub async fn wait_for_log(store: &CountingStore, rows: usize) -> Vec<ConversationLogEntry> {
    for _ in 0..200 {
        let logged = store.logged();
        if logged.len() >= rows {
            return logged;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    store.logged()
}
