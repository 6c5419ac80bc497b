//! Read-side service for the HTTP API. Mostly a thin layer over the catalog
//! repository, plus the self-healing backfill: a detail request for data the
//! bulk sync has not covered yet fetches it from upstream on the spot, through
//! the same ingest path the sync engine uses.

use crate::application::ingest;
use crate::domain::item::{
    split_combined_level, FilterOptions, Item, ItemDetail, ItemFilter, ItemPage,
};
use crate::domain::sync::{log_event, SyncLogEntry};
use crate::infrastructure::{CatalogRepository, CatalogUpstream, Localizer, SyncRepository};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;

pub struct QueryService {
    store: CatalogRepository,
    sync: SyncRepository,
    upstream: Arc<dyn CatalogUpstream>,
    localizer: Localizer,
}

impl QueryService {
    pub fn new(
        store: CatalogRepository,
        sync: SyncRepository,
        upstream: Arc<dyn CatalogUpstream>,
        localizer: Localizer,
    ) -> Self {
        Self { store, sync, upstream, localizer }
    }

    pub async fn list_items(&self, filter: &ItemFilter) -> Result<ItemPage> {
        let mut filter = filter.clone();
        filter.page = filter.page.max(1);
        filter.size = if filter.size < 1 {
            DEFAULT_PAGE_SIZE
        } else {
            filter.size.min(MAX_PAGE_SIZE)
        };
        self.store.query_items(&filter).await
    }

    /// Item detail at one combined enchant level. The requested level is
    /// clamped into the item's valid range; a snapshot the bulk sync has not
    /// written yet is backfilled from upstream before answering.
    pub async fn get_item_detail(
        &self,
        item_id: i64,
        combined_level: i64,
    ) -> Result<Option<ItemDetail>> {
        let Some(item) = self.item_or_backfill(item_id).await? else {
            return Ok(None);
        };

        let max_enchant = item.max_enchant_level.unwrap_or(0);
        let max_combined = max_enchant + item.max_exceed_level.unwrap_or(0);
        let combined = combined_level.clamp(0, max_combined);
        let (enchant, exceed) = split_combined_level(combined, max_enchant);

        let stats = match self.store.get_item_stats(item_id, enchant, exceed).await? {
            Some(stats) => stats,
            None => self.backfill_stats(item_id, combined, enchant, exceed).await?,
        };
        let available_stats = self.store.get_item_all_stats(item_id).await?;
        Ok(Some(ItemDetail { item, stats, available_stats }))
    }

    pub async fn list_filter_options(&self) -> Result<FilterOptions> {
        Ok(FilterOptions {
            grades: self.store.get_grades().await?,
            classes: self.store.get_classes().await?,
            categories: self.store.get_categories_with_children().await?,
        })
    }

    pub async fn recent_logs(&self, limit: i64) -> Result<Vec<SyncLogEntry>> {
        self.sync.recent_logs(limit.clamp(1, 500)).await
    }

    /// The stored item, enriched on demand when only the list phase (or
    /// nothing at all) has seen it. An unknown id that upstream also cannot
    /// serve is reported as not found, not as an error.
    async fn item_or_backfill(&self, item_id: i64) -> Result<Option<Item>> {
        let stored = self.store.get_item_by_id(item_id).await?;
        if let Some(item) = &stored {
            if item.raw.is_some() {
                return Ok(stored);
            }
        }

        let known_locally = stored.is_some();
        match self.upstream.fetch_item_detail(item_id, 0).await {
            Ok(raw) => {
                let item =
                    ingest::persist_detail(&self.store, &self.localizer, item_id, 0, 0, &raw)
                        .await?;
                info!("🩹 Backfilled detail for item {item_id} on demand");
                self.sync
                    .log(
                        log_event::BACKFILL,
                        &format!("detail backfilled on demand for item {item_id}"),
                        Some(item_id),
                        Some(0),
                        Some(0),
                        true,
                        None,
                    )
                    .await?;
                Ok(Some(item))
            }
            Err(e) if !known_locally => {
                warn!("Item {item_id} unknown locally and upstream fetch failed: {e:#}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn backfill_stats(
        &self,
        item_id: i64,
        combined: i64,
        enchant: i64,
        exceed: i64,
    ) -> Result<crate::domain::item::ItemStatSnapshot> {
        let raw = self.upstream.fetch_item_detail(item_id, combined).await?;
        ingest::persist_stats(&self.store, &self.localizer, item_id, enchant, exceed, &raw)
            .await?;
        self.sync
            .log(
                log_event::BACKFILL,
                &format!("stats backfilled on demand for item {item_id} at +{enchant}/{exceed}"),
                Some(item_id),
                Some(enchant),
                Some(exceed),
                true,
                None,
            )
            .await?;
        self.store
            .get_item_stats(item_id, enchant, exceed)
            .await?
            .ok_or_else(|| anyhow!("stats for item {item_id} missing right after backfill"))
    }
}
