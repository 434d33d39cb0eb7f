//! Data store collaborator.
//!
//! The pipeline needs three things from the backend: a vendor lookup, the
//! vendor's currently available catalog, and an insert for conversation
//! log rows.  [`DataStore`] is that contract; `rest` talks to a
//! PostgREST-style HTTP API and `memory` keeps everything in process.

use serde::{Deserialize, Serialize};

pub mod memory;
pub mod rest;

pub use self::memory::MemoryDataStore;
pub use self::rest::RestDataStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vendor {
    pub id: String,
    #[serde(alias = "business_name")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One persisted side of a waiter exchange.  Two rows sharing a
/// `conversation_id` are written per completed exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationLogEntry {
    pub content: String,
    pub role: Role,
    pub session_id: String,
    pub vendor_id: String,
    pub conversation_id: String,
    pub model_used: String,
    pub processing_time_ms: u64,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("data store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("data store returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("data store response could not be decoded: {0}")]
    Decode(String),
    #[error("data store call timed out after {0} ms")]
    Timeout(u64),
    #[error("data store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait::async_trait]
pub trait DataStore: Send + Sync {
    /// `Ok(None)` when the vendor does not exist.
    async fn vendor(&self, vendor_id: &str) -> Result<Option<Vendor>, StoreError>;

    /// Currently available items for the vendor, at most `limit`.
    async fn available_items(
        &self,
        vendor_id: &str,
        limit: usize,
    ) -> Result<Vec<CatalogItem>, StoreError>;

    async fn insert_conversation(&self, rows: &[ConversationLogEntry]) -> Result<(), StoreError>;
}
