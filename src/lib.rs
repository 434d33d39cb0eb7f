//! Core library for dinegate.  This module wires the request pipeline shared
//! by the AI waiter and the layout generator: security headers, rate
//! limiting, validation and sanitization, context assembly, model
//! orchestration and conversation logging, plus the HTTP handlers on top.

mod config;
pub mod context;
pub mod conversation_log;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod rate_limit;
pub mod security;
pub mod store;
pub mod telemetry;
pub mod util;
pub mod validate;

pub use config::{AppConfig, RotationConfig, StoreSettings};

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use axum::body::Bytes;
use axum::extract::rejection::{BytesRejection, FailedToBufferBody};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::context::{ContextAssembler, ContextError};
use crate::conversation_log::{ConversationLogger, Exchange};
use crate::error::ApiError;
use crate::models::ModelRoutes;
use crate::orchestrator::layout::emergency_layout;
use crate::orchestrator::{extract_suggestions, LayoutOrchestrator, Suggestion, WaiterOrchestrator};
use crate::rate_limit::{
    client_fingerprint, InMemoryRateLimitStore, RateLimitConfig, RateLimitDecision, RateLimitStore,
};
use crate::security::{insert_rate_limit_headers, SecurityHeaders};
use crate::store::{DataStore, MemoryDataStore, RestDataStore};
use crate::telemetry::{Metrics, RequestEvent, TelemetrySink};
use crate::util::SystemClock;
use crate::validate::RequestLimits;

/// Body of `POST /ai-waiter-chat`.  Unknown fields are ignored.
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct WaiterRequest {
    pub message: String,
    pub vendor_id: String,
    pub guest_session_id: String,
    #[serde(default)]
    pub conversation_context: Option<ConversationContext>,
    #[serde(default)]
    pub user_preferences: Option<Value>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct ConversationContext {
    #[serde(default)]
    pub previous_messages: Vec<ChatTurn>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize, Clone)]
pub struct WaiterResponse {
    pub response: String,
    pub suggestions: Vec<Suggestion>,
    pub processing_time_ms: u64,
    pub conversation_id: String,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutType {
    Hero,
    Menu,
    Promo,
    #[default]
    Full,
}

impl LayoutType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayoutType::Hero => "hero",
            LayoutType::Menu => "menu",
            LayoutType::Promo => "promo",
            LayoutType::Full => "full",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "hero" => Some(LayoutType::Hero),
            "menu" => Some(LayoutType::Menu),
            "promo" => Some(LayoutType::Promo),
            "full" => Some(LayoutType::Full),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct Weather {
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct Location {
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LayoutContext {
    #[serde(default)]
    pub time_of_day: Option<String>,
    #[serde(default)]
    pub day_of_week: Option<String>,
    #[serde(default)]
    pub weather: Option<Weather>,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub user_preferences: Option<Value>,
    /// Overrides the stored catalog in prompts when present.
    #[serde(default)]
    pub menu_items: Option<Vec<Value>>,
}

impl LayoutContext {
    /// Names of the context fields that were supplied.
    pub fn keys_used(&self) -> Vec<&'static str> {
        let present = [
            ("timeOfDay", self.time_of_day.is_some()),
            ("dayOfWeek", self.day_of_week.is_some()),
            ("weather", self.weather.is_some()),
            ("location", self.location.is_some()),
            ("userPreferences", self.user_preferences.is_some()),
            ("menuItems", self.menu_items.is_some()),
        ];
        present
            .into_iter()
            .filter_map(|(key, set)| set.then_some(key))
            .collect()
    }
}

/// Body of `POST /ai-layout-generator`.
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LayoutRequest {
    pub vendor_id: String,
    #[serde(default)]
    pub context_data: LayoutContext,
    #[serde(default)]
    pub layout_type: LayoutType,
}

#[derive(Debug, Serialize, Clone)]
pub struct LayoutResponse {
    pub success: bool,
    pub layout: Value,
    pub metadata: LayoutMetadata,
}

#[derive(Debug, Serialize, Clone)]
pub struct LayoutMetadata {
    pub generated_by: Vec<String>,
    pub context_used: Vec<&'static str>,
    pub layout_type: LayoutType,
    pub timestamp: String,
}

/// 500 body for the layout endpoint: the client still gets something to
/// render.
#[derive(Debug, Serialize, Clone)]
pub struct LayoutFailure {
    pub success: bool,
    pub layout: Value,
    pub error: String,
    pub fallback: bool,
}

/// Internal application state shared across handlers.  Cheap to clone;
/// everything mutable sits behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub limits: RequestLimits,
    pub waiter_rate: RateLimitConfig,
    pub layout_rate: RateLimitConfig,
    pub rate_limiter: Arc<dyn RateLimitStore>,
    pub headers: SecurityHeaders,
    pub assembler: ContextAssembler,
    pub waiter: WaiterOrchestrator,
    pub layout: LayoutOrchestrator,
    pub logger: ConversationLogger,
    pub telemetry: TelemetrySink,
    pub metrics: Arc<Metrics>,
    /// Route bindings as reported by `/healthz`.
    pub models: Arc<Value>,
}

/// The external pieces a state is assembled from.  Tests substitute their
/// own; [`build_state`] derives them from configuration.
pub struct Collaborators {
    pub store: Arc<dyn DataStore>,
    pub models: ModelRoutes,
    pub rate_limiter: Arc<dyn RateLimitStore>,
}

impl AppState {
    pub fn from_parts(cfg: &AppConfig, parts: Collaborators) -> anyhow::Result<Self> {
        let headers = SecurityHeaders::new(&cfg.allowed_origin).with_context(|| {
            format!(
                "DINEGATE_ALLOWED_ORIGIN '{}' is not a valid header value",
                cfg.allowed_origin
            )
        })?;
        let timeout = cfg.upstream_timeout;
        let Collaborators {
            store,
            models,
            rate_limiter,
        } = parts;
        Ok(Self {
            limits: cfg.limits,
            waiter_rate: cfg.waiter_rate,
            layout_rate: cfg.layout_rate,
            rate_limiter,
            headers,
            assembler: ContextAssembler::new(store.clone(), cfg.catalog_limit, timeout),
            waiter: WaiterOrchestrator::new(models.waiter.clone(), timeout),
            layout: LayoutOrchestrator::new(
                models.layout_structure.clone(),
                models.layout_enhance.clone(),
                timeout,
            ),
            logger: ConversationLogger::new(store, timeout),
            telemetry: TelemetrySink::from_config(
                cfg.log_file.as_deref(),
                &cfg.rotation,
                cfg.log_stdout,
            ),
            metrics: Arc::new(Metrics::new()),
            models: Arc::new(models.describe()),
        })
    }
}

/// Build state from a loaded configuration: pick the data store, bind the
/// model routes and create the in-memory limiter.
pub fn build_state(cfg: &AppConfig) -> anyhow::Result<AppState> {
    let store: Arc<dyn DataStore> = match &cfg.store {
        StoreSettings::Rest { url, key } => Arc::new(
            RestDataStore::new(url, key, cfg.upstream_timeout)
                .with_context(|| format!("Failed to configure data store at '{}'", url))?,
        ),
        StoreSettings::Fixture(path) => Arc::new(MemoryDataStore::from_fixture_file(path)?),
        StoreSettings::Memory => {
            tracing::warn!("No data store configured (DINEGATE_STORE_URL / DINEGATE_FIXTURE_FILE); every vendor lookup will miss");
            Arc::new(MemoryDataStore::new())
        }
    };
    let models = ModelRoutes::from_config(&cfg.models);
    let rate_limiter: Arc<dyn RateLimitStore> =
        Arc::new(InMemoryRateLimitStore::new(Arc::new(SystemClock)));
    AppState::from_parts(
        cfg,
        Collaborators {
            store,
            models,
            rate_limiter,
        },
    )
}

/// Load [`AppConfig`] from the environment and build the state from it.
pub fn build_state_from_env() -> anyhow::Result<(AppConfig, AppState)> {
    let config = AppConfig::from_env()?;
    let state = build_state(&config)?;
    Ok((config, state))
}

/// Build the Axum router and attach handlers.  The router holds a copy
/// of the `AppState` for each invocation.
pub fn app(state: AppState) -> Router {
    let max_body_bytes = state.limits.max_body_bytes;
    let panic_headers = state.headers.clone();

    Router::new()
        .route(
            "/ai-waiter-chat",
            post(waiter_handler).options(preflight_handler),
        )
        .route(
            "/ai-layout-generator",
            post(layout_handler).options(preflight_handler),
        )
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(fallback_handler)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(CatchPanicLayer::custom(
            move |_: Box<dyn Any + Send + 'static>| {
                tracing::error!("handler panicked");
                panic_headers.panic_response()
            },
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Waiter,
    Layout,
}

impl Endpoint {
    fn name(self) -> &'static str {
        match self {
            Endpoint::Waiter => "ai-waiter-chat",
            Endpoint::Layout => "ai-layout-generator",
        }
    }

    fn required_fields(self) -> &'static [&'static str] {
        match self {
            Endpoint::Waiter => &["message", "vendor_id", "guest_session_id"],
            Endpoint::Layout => &["vendorId", "layoutType"],
        }
    }

    /// Identifier fields that must survive markup stripping.
    fn sanitized_ids(self) -> &'static [&'static str] {
        match self {
            Endpoint::Waiter => &["vendor_id", "guest_session_id"],
            Endpoint::Layout => &["vendorId"],
        }
    }

    fn rate(self, state: &AppState) -> RateLimitConfig {
        match self {
            Endpoint::Waiter => state.waiter_rate,
            Endpoint::Layout => state.layout_rate,
        }
    }
}

/// Limiter verdict echoed back in `X-Rate-Limit-*` headers.
#[derive(Debug, Clone, Copy)]
struct RateInfo {
    decision: RateLimitDecision,
    limit: u32,
}

impl RateInfo {
    fn stamp(&self, response: &mut Response) {
        insert_rate_limit_headers(response.headers_mut(), &self.decision, self.limit);
    }
}

/// A request that passed every guard.
struct Admission {
    value: Value,
    rate: RateInfo,
}

/// What a handler produced, plus the bits telemetry wants to know.
struct Handled {
    response: Response,
    model_used: Option<String>,
    degraded: bool,
    error_code: Option<&'static str>,
}

impl Handled {
    fn ok(response: Response, model_used: Option<String>, degraded: bool) -> Self {
        Self {
            response,
            model_used,
            degraded,
            error_code: None,
        }
    }
}

/// Size, content type, rate limit, JSON parse and required fields, in that
/// order.  Nothing downstream runs unless all pass, and a request rejected
/// before the limiter never creates a bucket.
async fn admit(
    state: &AppState,
    endpoint: Endpoint,
    headers: &HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Admission, ApiError> {
    validate::check_declared_length(headers, &state.limits)?;
    let body = body.map_err(|rejection| body_rejection(rejection, &state.limits))?;
    validate::check_body_len(body.len(), &state.limits)?;
    validate::check_content_type(headers)?;

    let rate = endpoint.rate(state);
    let key = format!("{}:{}", endpoint.name(), client_fingerprint(headers));
    let decision = state.rate_limiter.check_and_increment(&key, &rate).await;
    if !decision.allowed {
        tracing::info!(endpoint = endpoint.name(), key = %key, "rate limit exceeded");
        return Err(ApiError::RateLimited {
            decision,
            limit: rate.max_requests,
            retry_after_secs: decision.retry_after_secs(state.rate_limiter.now_ms()),
        });
    }

    let value = validate::parse_object(&body)?;
    validate::require_fields(&value, endpoint.required_fields())?;
    Ok(Admission {
        value,
        rate: RateInfo {
            decision,
            limit: rate.max_requests,
        },
    })
}

fn body_rejection(rejection: BytesRejection, limits: &RequestLimits) -> ApiError {
    match rejection {
        BytesRejection::FailedToBufferBody(FailedToBufferBody::LengthLimitError(_)) => {
            tracing::warn!(limit = limits.max_body_bytes, "request body exceeded configured limit");
            ApiError::PayloadTooLarge {
                limit: limits.max_body_bytes,
            }
        }
        other => {
            tracing::warn!(error = %other, "failed to read request body");
            ApiError::InvalidJson("request body could not be read".into())
        }
    }
}

fn context_error(err: ContextError) -> ApiError {
    match err {
        ContextError::VendorNotFound(_) => ApiError::VendorNotFound,
        ContextError::Store(e) => {
            tracing::error!(error = %e, "vendor lookup failed");
            ApiError::Unavailable
        }
    }
}

fn header_number(headers: &mut HeaderMap, name: &'static str, value: u64) {
    headers.insert(HeaderName::from_static(name), HeaderValue::from(value));
}

impl AppState {
    /// Record metrics and telemetry for a finished request and produce the
    /// final response.
    fn complete(
        &self,
        endpoint: Endpoint,
        request_id: &str,
        started: Instant,
        outcome: Result<Handled, ApiError>,
    ) -> Response {
        let handled = match outcome {
            Ok(handled) => handled,
            Err(err) => {
                if err.status().is_server_error() {
                    tracing::error!(endpoint = endpoint.name(), request_id = %request_id, error = %err, "request failed");
                } else {
                    tracing::debug!(endpoint = endpoint.name(), request_id = %request_id, code = err.code(), "request rejected");
                }
                Handled {
                    response: self.headers.error(&err, request_id),
                    model_used: None,
                    degraded: false,
                    error_code: Some(err.code()),
                }
            }
        };
        if let Some(code) = handled.error_code {
            self.metrics.record_rejection(code);
        }
        let latency_ms = started.elapsed().as_millis() as u64;
        self.metrics.record_request(endpoint.name(), latency_ms);

        let mut event = RequestEvent::new(
            request_id,
            endpoint.name(),
            handled.response.status().as_u16(),
            latency_ms,
        );
        event.model_used = handled.model_used.as_deref();
        event.degraded = handled.degraded;
        event.error_code = handled.error_code;
        self.telemetry.emit(&event);

        handled.response
    }
}

/// Handler for `/ai-waiter-chat`.
async fn waiter_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let started = Instant::now();
    let outcome = handle_waiter(&state, &headers, body, &request_id, started).await;
    state.complete(Endpoint::Waiter, &request_id, started, outcome)
}

async fn handle_waiter(
    state: &AppState,
    headers: &HeaderMap,
    body: Result<Bytes, BytesRejection>,
    request_id: &str,
    started: Instant,
) -> Result<Handled, ApiError> {
    let Admission { value, rate } = admit(state, Endpoint::Waiter, headers, body).await?;

    let raw_message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    validate::check_message_length(raw_message, &state.limits)?;

    let value = validate::sanitize_value(value);
    validate::require_fields(&value, Endpoint::Waiter.sanitized_ids())?;
    let req: WaiterRequest = serde_json::from_value(value)
        .map_err(|e| ApiError::InvalidField {
            field: "request",
            reason: e.to_string(),
        })?;
    if req.message.is_empty() {
        return Err(ApiError::InvalidField {
            field: "message",
            reason: "nothing left after removing markup".into(),
        });
    }

    let ctx = state
        .assembler
        .assemble(&req.vendor_id)
        .await
        .map_err(context_error)?;
    let call = state.waiter.respond(&ctx, &req).await;
    if !call.succeeded {
        state.metrics.record_model_fallback("waiter");
    }
    let suggestions = extract_suggestions(ctx.items(), &call.text);

    let payload = WaiterResponse {
        response: call.text,
        suggestions,
        processing_time_ms: started.elapsed().as_millis() as u64,
        conversation_id: uuid::Uuid::new_v4().to_string(),
        success: true,
    };
    let mut response = state.headers.json(StatusCode::OK, &payload, request_id);
    let h = response.headers_mut();
    header_number(h, "x-processing-time", payload.processing_time_ms);
    header_number(h, "x-suggestions-count", payload.suggestions.len() as u64);
    rate.stamp(&mut response);

    let WaiterResponse {
        response: reply,
        suggestions,
        processing_time_ms,
        conversation_id,
        ..
    } = payload;
    state.logger.spawn(Exchange {
        conversation_id,
        session_id: req.guest_session_id,
        vendor_id: req.vendor_id,
        user_message: req.message,
        assistant_message: reply,
        model_used: call.model_used.clone(),
        model_succeeded: call.succeeded,
        processing_time_ms,
        suggestions,
    });

    Ok(Handled::ok(
        response,
        Some(call.model_used),
        !call.succeeded || ctx.catalog.is_degraded(),
    ))
}

/// Handler for `/ai-layout-generator`.
async fn layout_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let started = Instant::now();
    let outcome = handle_layout(&state, &headers, body, &request_id).await;
    state.complete(Endpoint::Layout, &request_id, started, outcome)
}

async fn handle_layout(
    state: &AppState,
    headers: &HeaderMap,
    body: Result<Bytes, BytesRejection>,
    request_id: &str,
) -> Result<Handled, ApiError> {
    let Admission { value, rate } = admit(state, Endpoint::Layout, headers, body).await?;
    let value = validate::sanitize_value(value);
    validate::require_fields(&value, Endpoint::Layout.sanitized_ids())?;
    let req = parse_layout_request(value)?;

    let ctx = match state.assembler.assemble(&req.vendor_id).await {
        Ok(ctx) => ctx,
        Err(ContextError::VendorNotFound(_)) => return Err(ApiError::VendorNotFound),
        Err(ContextError::Store(e)) => {
            tracing::error!(error = %e, "vendor lookup failed, serving emergency layout");
            return Ok(layout_failure(state, request_id, rate));
        }
    };
    let degraded_catalog = ctx.catalog.is_degraded();

    // a panic inside generation still yields the emergency layout
    let orchestrator = state.layout.clone();
    let task_req = req.clone();
    let generated =
        tokio::spawn(async move { orchestrator.generate(&ctx, &task_req).await }).await;
    let outcome = match generated {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(error = %e, "layout generation aborted, serving emergency layout");
            return Ok(layout_failure(state, request_id, rate));
        }
    };
    if outcome.structure_fallback {
        state.metrics.record_model_fallback("layout_structure");
    }
    if !outcome.enhance_applied {
        state.metrics.record_model_fallback("layout_enhance");
    }

    let degraded = outcome.structure_fallback || !outcome.enhance_applied || degraded_catalog;
    let model_used = outcome.generated_by.join(",");
    let payload = LayoutResponse {
        success: true,
        layout: outcome.layout,
        metadata: LayoutMetadata {
            generated_by: outcome.generated_by,
            context_used: req.context_data.keys_used(),
            layout_type: req.layout_type,
            timestamp: chrono::Utc::now().to_rfc3339(),
        },
    };
    let mut response = state.headers.json(StatusCode::OK, &payload, request_id);
    rate.stamp(&mut response);
    Ok(Handled::ok(response, Some(model_used), degraded))
}

fn parse_layout_request(value: Value) -> Result<LayoutRequest, ApiError> {
    let raw_type = value
        .get("layoutType")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if LayoutType::parse(raw_type).is_none() {
        return Err(ApiError::InvalidField {
            field: "layoutType",
            reason: format!("expected one of hero, menu, promo, full; got '{}'", raw_type),
        });
    }
    serde_json::from_value(value).map_err(|e| ApiError::InvalidField {
        field: "contextData",
        reason: e.to_string(),
    })
}

fn layout_failure(state: &AppState, request_id: &str, rate: RateInfo) -> Handled {
    let err = ApiError::Unavailable;
    let payload = LayoutFailure {
        success: false,
        layout: emergency_layout(),
        error: err.to_string(),
        fallback: true,
    };
    let mut response = state
        .headers
        .json(StatusCode::INTERNAL_SERVER_ERROR, &payload, request_id);
    rate.stamp(&mut response);
    Handled {
        response,
        model_used: None,
        degraded: true,
        error_code: Some(err.code()),
    }
}

async fn preflight_handler(State(state): State<AppState>) -> Response {
    state.headers.preflight()
}

/// OPTIONS on any path is a preflight; anything else unrouted is a 404.
async fn fallback_handler(State(state): State<AppState>, method: Method) -> Response {
    if method == Method::OPTIONS {
        return state.headers.preflight();
    }
    let request_id = uuid::Uuid::new_v4().to_string();
    state.metrics.record_rejection(ApiError::NotFound.code());
    state.headers.error(&ApiError::NotFound, &request_id)
}

/// Simple health endpoint for container readiness / liveness checks.
async fn healthz_handler(State(state): State<AppState>) -> Response {
    let json = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "models": state.models.as_ref(),
    });
    let request_id = uuid::Uuid::new_v4().to_string();
    state.headers.json(StatusCode::OK, &json, &request_id)
}

/// Prometheus-style metrics exposition.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let body = state
        .metrics
        .render(&state.telemetry, state.logger.failures());
    let mut resp = (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response();
    let request_id = uuid::Uuid::new_v4().to_string();
    state.headers.apply(resp.headers_mut(), &request_id);
    resp
}

/// Grace period given to in-flight conversation log writes at shutdown.
pub const SHUTDOWN_LOG_GRACE: Duration = Duration::from_secs(5);
