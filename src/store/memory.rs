use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use serde::Deserialize;

use super::{CatalogItem, ConversationLogEntry, DataStore, StoreError, Vendor};

/// Fixture file layout accepted by [`MemoryDataStore::from_fixture_file`].
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fixture {
    #[serde(default)]
    pub vendors: Vec<Vendor>,
    #[serde(default)]
    pub menu_items: Vec<FixtureItem>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureItem {
    pub vendor_id: String,
    #[serde(default = "default_available")]
    pub is_available: bool,
    #[serde(flatten)]
    pub item: CatalogItem,
}

fn default_available() -> bool {
    true
}

/// In-process store for local runs and tests.  Items keep insertion order,
/// which is the catalog order seen by the orchestrator.
#[derive(Default)]
pub struct MemoryDataStore {
    vendors: Vec<Vendor>,
    items: Vec<FixtureItem>,
    logged: Mutex<Vec<ConversationLogEntry>>,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(fixture: Fixture) -> Self {
        Self {
            vendors: fixture.vendors,
            items: fixture.menu_items,
            logged: Mutex::new(Vec::new()),
        }
    }

    pub fn from_fixture_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixture file '{}'", path.display()))?;
        let fixture: Fixture = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse fixture file '{}'", path.display()))?;
        Ok(Self::from_fixture(fixture))
    }

    pub fn with_vendor(mut self, id: &str, name: &str) -> Self {
        self.vendors.push(Vendor {
            id: id.to_string(),
            name: name.to_string(),
        });
        self
    }

    pub fn with_item(mut self, vendor_id: &str, item: CatalogItem) -> Self {
        self.items.push(FixtureItem {
            vendor_id: vendor_id.to_string(),
            is_available: true,
            item,
        });
        self
    }

    pub fn with_unavailable_item(mut self, vendor_id: &str, item: CatalogItem) -> Self {
        self.items.push(FixtureItem {
            vendor_id: vendor_id.to_string(),
            is_available: false,
            item,
        });
        self
    }

    /// Rows written so far, oldest first.
    pub fn logged(&self) -> Vec<ConversationLogEntry> {
        self.logged
            .lock()
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl DataStore for MemoryDataStore {
    async fn vendor(&self, vendor_id: &str) -> Result<Option<Vendor>, StoreError> {
        Ok(self.vendors.iter().find(|v| v.id == vendor_id).cloned())
    }

    async fn available_items(
        &self,
        vendor_id: &str,
        limit: usize,
    ) -> Result<Vec<CatalogItem>, StoreError> {
        Ok(self
            .items
            .iter()
            .filter(|i| i.vendor_id == vendor_id && i.is_available)
            .take(limit)
            .map(|i| i.item.clone())
            .collect())
    }

    async fn insert_conversation(&self, rows: &[ConversationLogEntry]) -> Result<(), StoreError> {
        let mut guard = self
            .logged
            .lock()
            .map_err(|_| StoreError::Unavailable("conversation log poisoned".into()))?;
        guard.extend_from_slice(rows);
        Ok(())
    }
}
