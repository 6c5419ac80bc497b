//! Transport boundary for the external catalog API.
//!
//! The trait exists so the sync engine and query service can be driven by a
//! mock in tests; the HTTP implementation builds the endpoint URLs and defers
//! pacing/retry to [`PacedClient`](super::http_client::PacedClient). Payloads
//! stay raw `serde_json::Value` here; mapping into domain types happens in the
//! application ingest layer.

use super::http_client::PacedClient;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait CatalogUpstream: Send + Sync {
    async fn fetch_grades(&self) -> Result<Value>;
    async fn fetch_classes(&self) -> Result<Value>;
    async fn fetch_categories(&self) -> Result<Value>;
    /// One page of the item search endpoint.
    async fn fetch_item_page(&self, page: i64, size: i64) -> Result<Value>;
    /// Full detail for one item at one combined enchant level.
    async fn fetch_item_detail(&self, item_id: i64, enchant_level: i64) -> Result<Value>;
}

pub struct HttpUpstream {
    client: PacedClient,
    base_url: String,
    locale: String,
}

impl HttpUpstream {
    pub fn new(client: PacedClient, base_url: impl Into<String>, locale: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            locale: locale.into(),
        }
    }
}

#[async_trait]
impl CatalogUpstream for HttpUpstream {
    async fn fetch_grades(&self) -> Result<Value> {
        self.client.fetch_json(&format!("{}/grades", self.base_url)).await
    }

    async fn fetch_classes(&self) -> Result<Value> {
        self.client.fetch_json(&format!("{}/classes", self.base_url)).await
    }

    async fn fetch_categories(&self) -> Result<Value> {
        self.client.fetch_json(&format!("{}/categories", self.base_url)).await
    }

    async fn fetch_item_page(&self, page: i64, size: i64) -> Result<Value> {
        let url = format!(
            "{}/items?page={page}&size={size}&lang={}",
            self.base_url, self.locale
        );
        self.client.fetch_json(&url).await
    }

    async fn fetch_item_detail(&self, item_id: i64, enchant_level: i64) -> Result<Value> {
        let url = format!(
            "{}/items/{item_id}?enchantLevel={enchant_level}&lang={}",
            self.base_url, self.locale
        );
        self.client.fetch_json(&url).await
    }
}
