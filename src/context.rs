//! Loads the minimum vendor and catalog data needed to ground a model call.

use std::sync::Arc;
use std::time::Duration;

use crate::store::{CatalogItem, DataStore, StoreError, Vendor};
use crate::util::Outcome;

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("vendor '{0}' not found")]
    VendorNotFound(String),
    #[error("vendor lookup failed: {0}")]
    Store(#[source] StoreError),
}

/// Vendor plus catalog.  The catalog is `Degraded` (empty) when it could not
/// be fetched; a reduced-context answer is still worth giving.
#[derive(Debug)]
pub struct VendorContext {
    pub vendor: Vendor,
    pub catalog: Outcome<Vec<CatalogItem>, StoreError>,
}

impl VendorContext {
    pub fn items(&self) -> &[CatalogItem] {
        self.catalog.value().map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Clone)]
pub struct ContextAssembler {
    store: Arc<dyn DataStore>,
    catalog_limit: usize,
    timeout: Duration,
}

impl ContextAssembler {
    pub fn new(store: Arc<dyn DataStore>, catalog_limit: usize, timeout: Duration) -> Self {
        Self {
            store,
            catalog_limit,
            timeout,
        }
    }

    pub async fn assemble(&self, vendor_id: &str) -> Result<VendorContext, ContextError> {
        let vendor = match tokio::time::timeout(self.timeout, self.store.vendor(vendor_id)).await {
            Ok(Ok(Some(vendor))) => vendor,
            Ok(Ok(None)) => return Err(ContextError::VendorNotFound(vendor_id.to_string())),
            Ok(Err(err)) => return Err(ContextError::Store(err)),
            Err(_) => {
                return Err(ContextError::Store(StoreError::Timeout(
                    self.timeout.as_millis() as u64,
                )))
            }
        };

        let fetch = self.store.available_items(vendor_id, self.catalog_limit);
        let catalog = match tokio::time::timeout(self.timeout, fetch).await {
            Ok(Ok(mut items)) => {
                items.truncate(self.catalog_limit);
                Outcome::Ok(items)
            }
            Ok(Err(cause)) => {
                tracing::warn!(vendor_id = %vendor_id, error = %cause, "catalog fetch failed, continuing without catalog");
                Outcome::Degraded {
                    value: Vec::new(),
                    cause,
                }
            }
            Err(_) => {
                let cause = StoreError::Timeout(self.timeout.as_millis() as u64);
                tracing::warn!(vendor_id = %vendor_id, error = %cause, "catalog fetch timed out, continuing without catalog");
                Outcome::Degraded {
                    value: Vec::new(),
                    cause,
                }
            }
        };

        Ok(VendorContext { vendor, catalog })
    }
}
