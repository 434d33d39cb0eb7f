use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use super::{CatalogItem, ConversationLogEntry, DataStore, StoreError, Vendor};

const VENDORS_TABLE: &str = "vendors";
const MENU_ITEMS_TABLE: &str = "menu_items";
const CONVERSATIONS_TABLE: &str = "ai_conversations";

/// Client for a PostgREST-style backend (`/rest/v1/<table>` with
/// `column=eq.value` filters), authenticated with a service key sent both
/// as `apikey` and as a bearer token.
pub struct RestDataStore {
    base_url: String,
    client: reqwest::Client,
}

impl RestDataStore {
    pub fn new(base_url: &str, service_key: &str, timeout: Duration) -> Result<Self, StoreError> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(service_key.trim())
            .map_err(|_| StoreError::Unavailable("invalid service key".into()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", service_key.trim()))
            .map_err(|_| StoreError::Unavailable("invalid service key".into()))?;
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    async fn read_rows<T: serde::de::DeserializeOwned>(
        &self,
        resp: reqwest::Response,
    ) -> Result<Vec<T>, StoreError> {
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(StoreError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        serde_json::from_str(&text).map_err(|e| StoreError::Decode(e.to_string()))
    }
}

#[async_trait::async_trait]
impl DataStore for RestDataStore {
    async fn vendor(&self, vendor_id: &str) -> Result<Option<Vendor>, StoreError> {
        let resp = self
            .client
            .get(self.table_url(VENDORS_TABLE))
            .query(&[
                ("id", format!("eq.{}", vendor_id)),
                ("select", "id,business_name".to_string()),
                ("limit", "1".to_string()),
            ])
            .send()
            .await?;
        let rows: Vec<Vendor> = self.read_rows(resp).await?;
        Ok(rows.into_iter().next())
    }

    async fn available_items(
        &self,
        vendor_id: &str,
        limit: usize,
    ) -> Result<Vec<CatalogItem>, StoreError> {
        let resp = self
            .client
            .get(self.table_url(MENU_ITEMS_TABLE))
            .query(&[
                ("vendor_id", format!("eq.{}", vendor_id)),
                ("is_available", "eq.true".to_string()),
                ("select", "id,name,price,category,description".to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await?;
        self.read_rows(resp).await
    }

    async fn insert_conversation(&self, rows: &[ConversationLogEntry]) -> Result<(), StoreError> {
        let resp = self
            .client
            .post(self.table_url(CONVERSATIONS_TABLE))
            .header(CONTENT_TYPE, "application/json")
            .header("prefer", "return=minimal")
            .json(rows)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_url_strips_trailing_slash() {
        let store = RestDataStore::new("https://db.example/", "key", Duration::from_secs(1)).unwrap();
        assert_eq!(
            store.table_url("menu_items"),
            "https://db.example/rest/v1/menu_items"
        );
    }

    #[test]
    fn rejects_unprintable_service_key() {
        assert!(RestDataStore::new("https://db.example", "bad\nkey", Duration::from_secs(1)).is_err());
    }
}
