//! Best-effort persistence of waiter exchanges.
//!
//! Writes are detached from the request: the handler hands an [`Exchange`]
//! to [`ConversationLogger::spawn`] after the response body is final and
//! never looks at the result.  Failures are logged and counted only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use crate::orchestrator::Suggestion;
use crate::store::{ConversationLogEntry, DataStore, Role, StoreError};
use crate::util::Outcome;

/// A completed waiter turn, already sanitized.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub conversation_id: String,
    pub session_id: String,
    pub vendor_id: String,
    pub user_message: String,
    pub assistant_message: String,
    pub model_used: String,
    pub model_succeeded: bool,
    pub processing_time_ms: u64,
    pub suggestions: Vec<Suggestion>,
}

impl Exchange {
    /// The user row followed by the assistant row.  Only the assistant row
    /// carries metadata.
    pub fn into_entries(self) -> [ConversationLogEntry; 2] {
        let timestamp = chrono::Utc::now().to_rfc3339();
        let user = ConversationLogEntry {
            content: self.user_message,
            role: Role::User,
            session_id: self.session_id.clone(),
            vendor_id: self.vendor_id.clone(),
            conversation_id: self.conversation_id.clone(),
            model_used: self.model_used.clone(),
            processing_time_ms: self.processing_time_ms,
            timestamp: timestamp.clone(),
            metadata: None,
        };
        let assistant = ConversationLogEntry {
            content: self.assistant_message,
            role: Role::Assistant,
            session_id: self.session_id,
            vendor_id: self.vendor_id,
            conversation_id: self.conversation_id,
            model_used: self.model_used,
            processing_time_ms: self.processing_time_ms,
            timestamp,
            metadata: Some(json!({
                "suggestions": self.suggestions,
                "fallback": !self.model_succeeded,
            })),
        };
        [user, assistant]
    }
}

#[derive(Clone)]
pub struct ConversationLogger {
    store: Arc<dyn DataStore>,
    tracker: TaskTracker,
    timeout: Duration,
    failures: Arc<AtomicU64>,
}

impl ConversationLogger {
    pub fn new(store: Arc<dyn DataStore>, timeout: Duration) -> Self {
        Self {
            store,
            tracker: TaskTracker::new(),
            timeout,
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Write both rows in one insert.  Never returns `Degraded`.
    pub async fn record(&self, exchange: Exchange) -> Outcome<(), StoreError> {
        let conversation_id = exchange.conversation_id.clone();
        let rows = exchange.into_entries();
        let result = match tokio::time::timeout(self.timeout, self.store.insert_conversation(&rows)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout.as_millis() as u64)),
        };
        match result {
            Ok(()) => {
                tracing::debug!(conversation_id = %conversation_id, "conversation logged");
                Outcome::Ok(())
            }
            Err(err) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(conversation_id = %conversation_id, error = %err, "failed to log conversation");
                Outcome::Err(err)
            }
        }
    }

    /// Fire and forget.  The handle is only useful to tests.
    pub fn spawn(&self, exchange: Exchange) -> JoinHandle<Outcome<(), StoreError>> {
        let logger = self.clone();
        self.tracker
            .spawn(async move { logger.record(exchange).await })
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait up to `grace` for in-flight writes.  Returns false when some
    /// were still running at the deadline.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.tracker.close();
        let done = tokio::time::timeout(grace, self.tracker.wait()).await.is_ok();
        if !done {
            tracing::warn!(in_flight = self.tracker.len(), "conversation log writes abandoned at shutdown");
        }
        done
    }
}
