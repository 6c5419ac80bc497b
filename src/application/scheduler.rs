//! Details-batch scheduling: which top-level category runs next, and the
//! persisted (category, not-before) pair that survives process restarts.
//!
//! The category order is never cached here; it is re-read from the store on
//! every decision, so upstream re-ordering or a restart cannot desynchronize
//! the schedule from the data.

use crate::domain::item::Category;
use crate::infrastructure::{CatalogRepository, SyncRepository};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::time::Duration;

pub struct Scheduler {
    store: CatalogRepository,
    sync: SyncRepository,
    delay: Duration,
}

impl Scheduler {
    pub fn new(store: CatalogRepository, sync: SyncRepository, delay: Duration) -> Self {
        Self { store, sync, delay }
    }

    /// Fixed pause between details batches. Deliberately long: the whole
    /// catalog completes unattended over days without tripping upstream
    /// rate limits.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub async fn first_category(&self) -> Result<Option<Category>> {
        Ok(self.store.get_top_categories().await?.into_iter().next())
    }

    /// The top-level category after `current` in batch order, or `None` when
    /// `current` was the last one (catalog complete) or is no longer known.
    pub async fn next_after(&self, current: i64) -> Result<Option<Category>> {
        let tops = self.store.get_top_categories().await?;
        let Some(position) = tops.iter().position(|c| c.id == current) else {
            return Ok(None);
        };
        Ok(tops.into_iter().nth(position + 1))
    }

    pub async fn record(&self, category_id: i64, not_before: DateTime<Utc>) -> Result<()> {
        self.sync.set_schedule(category_id, not_before).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.sync.clear_schedule().await
    }

    pub async fn pending(&self) -> Result<Option<(i64, DateTime<Utc>)>> {
        self.sync.get_schedule().await
    }
}
