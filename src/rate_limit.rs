//! Fixed-window request limiter keyed by a derived client fingerprint.
//!
//! This is request shaping in front of a paid model API, not a security
//! boundary: state lives in process memory, is lost on restart and is not
//! shared between instances.  Callers talk to the [`RateLimitStore`] trait so
//! the in-memory map can be replaced by a shared store without touching the
//! handlers.

use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::util::Clock;

const USER_AGENT_PREFIX_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_ms: u64,
}

impl RateLimitConfig {
    pub const fn new(max_requests: u32, window_ms: u64) -> Self {
        Self {
            max_requests,
            window_ms,
        }
    }

    /// `(window_start, reset_time)` for the window containing `now_ms`.
    pub fn window_bounds(&self, now_ms: i64) -> (i64, i64) {
        let window = self.window_ms.max(1) as i64;
        let start = now_ms.div_euclid(window) * window;
        (start, start + window)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining_requests: u32,
    pub reset_time_ms: i64,
}

impl RateLimitDecision {
    pub fn reset_unix_secs(&self) -> i64 {
        (self.reset_time_ms + 999).div_euclid(1000)
    }

    pub fn retry_after_secs(&self, now_ms: i64) -> u64 {
        let wait_ms = (self.reset_time_ms - now_ms).max(0) as u64;
        wait_ms.div_ceil(1000).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitBucket {
    pub count: u32,
    pub reset_time_ms: i64,
}

#[async_trait::async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Count one request against `key` and report whether it is admitted.
    async fn check_and_increment(&self, key: &str, config: &RateLimitConfig) -> RateLimitDecision;

    /// Drop buckets whose window has ended.  Returns how many were removed.
    async fn evict_expired(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn now_ms(&self) -> i64;
}

/// Process-local store.  DashMap entry locks make check-and-increment
/// atomic per key; eviction only ever holds one shard at a time.
pub struct InMemoryRateLimitStore {
    buckets: DashMap<String, RateLimitBucket, ahash::RandomState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryRateLimitStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::with_hasher(ahash::RandomState::new()),
            clock,
        }
    }

    pub fn bucket(&self, key: &str) -> Option<RateLimitBucket> {
        self.buckets.get(key).map(|b| *b)
    }
}

#[async_trait::async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn check_and_increment(&self, key: &str, config: &RateLimitConfig) -> RateLimitDecision {
        let now = self.clock.now_ms();
        let (_, reset_time_ms) = config.window_bounds(now);
        let fresh = RateLimitBucket {
            count: 1,
            reset_time_ms,
        };
        let admitted_fresh = RateLimitDecision {
            allowed: true,
            remaining_requests: config.max_requests.saturating_sub(1),
            reset_time_ms,
        };

        match self.buckets.entry(key.to_owned()) {
            Entry::Vacant(slot) => {
                slot.insert(fresh);
                admitted_fresh
            }
            Entry::Occupied(mut slot) => {
                let bucket = slot.get_mut();
                if now >= bucket.reset_time_ms {
                    *bucket = fresh;
                    admitted_fresh
                } else if bucket.count < config.max_requests {
                    bucket.count += 1;
                    RateLimitDecision {
                        allowed: true,
                        remaining_requests: config.max_requests - bucket.count,
                        reset_time_ms: bucket.reset_time_ms,
                    }
                } else {
                    RateLimitDecision {
                        allowed: false,
                        remaining_requests: 0,
                        reset_time_ms: bucket.reset_time_ms,
                    }
                }
            }
        }
    }

    async fn evict_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut removed = 0usize;
        self.buckets.retain(|_, bucket| {
            let keep = bucket.reset_time_ms > now;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    fn len(&self) -> usize {
        self.buckets.len()
    }

    fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }
}

/// Run `evict_expired` every `every` until `cancel` fires.
pub fn spawn_sweeper(
    store: Arc<dyn RateLimitStore>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval fires immediately; skip that one
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("rate limit sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let removed = store.evict_expired().await;
                    if removed > 0 {
                        tracing::debug!(removed, remaining = store.len(), "evicted expired rate limit buckets");
                    }
                }
            }
        }
    })
}

/// Derive the bucket key for a request from its headers.
///
/// Best available client IP (first `x-forwarded-for` hop, then
/// `x-real-ip`, then `unknown`), a truncated user agent and whether an
/// `authorization` header is present, hashed with a 32-bit polynomial
/// rolling hash.  Not an identity and never persisted.
pub fn client_fingerprint(headers: &HeaderMap) -> String {
    let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let ip = header_str("x-forwarded-for")
        .and_then(|chain| chain.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or_else(|| {
            header_str("x-real-ip")
                .map(str::trim)
                .filter(|s| !s.is_empty())
        })
        .unwrap_or("unknown");
    let ua: String = header_str("user-agent")
        .unwrap_or("")
        .chars()
        .take(USER_AGENT_PREFIX_CHARS)
        .collect();
    let auth = if headers.contains_key("authorization") {
        "auth"
    } else {
        "anon"
    };

    let raw = format!("{}:{}:{}", ip, ua, auth);
    format!("client_{}", to_base36(rolling_hash(&raw).unsigned_abs()))
}

fn rolling_hash(input: &str) -> i32 {
    input.chars().fold(0i32, |hash, c| {
        hash.wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(c as i32)
    })
}

fn to_base36(mut n: u32) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
