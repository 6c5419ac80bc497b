//! The phased sync state machine.
//!
//! Phases: base-data sync (lookup tables), list sync (paged catalog roster)
//! and details sync (per-item enrichment plus the per-level stat walk). One
//! run flag serializes the write path; progress is persisted after every unit
//! of work so an interrupted run resumes instead of restarting.

use crate::application::ingest::{self, NameIndex};
use crate::application::scheduler::Scheduler;
use crate::domain::item::{split_combined_level, Category, Item};
use crate::domain::sync::{
    log_event, DetailsReport, ScheduleEntry, SyncPhase, SyncStatusReport,
};
use crate::infrastructure::{CatalogRepository, CatalogUpstream, Localizer, SyncRepository};
use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SyncConfig {
    /// Page size requested from the upstream item-search endpoint.
    pub list_page_size: i64,
    /// Names of the equipment super-categories whose items carry enchantment.
    pub equipment_categories: Vec<String>,
    /// Minimum grade sort rank for the per-level stat walk (quality floor).
    pub min_enchant_grade_rank: i64,
    /// Pause between scheduled details batches.
    pub details_batch_delay_secs: u64,
    /// Cap on unmatched-name log entries per list page.
    pub unmatched_log_sample: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            list_page_size: 100,
            equipment_categories: vec![
                "weapon".to_string(),
                "armor".to_string(),
                "accessory".to_string(),
            ],
            // 4th-lowest of five tiers: only the top two tiers get the
            // expensive per-level walk.
            min_enchant_grade_rank: 4,
            details_batch_delay_secs: 4 * 3600,
            unmatched_log_sample: 5,
        }
    }
}

/// Refusal from every sync entry point while the run flag is held. Typed so
/// the HTTP layer can answer 409 instead of treating it as a server fault.
#[derive(Debug, thiserror::Error)]
#[error("a sync is already running")]
pub struct SyncBusy;

struct RunState {
    running: bool,
    phase: Option<SyncPhase>,
    category_id: Option<i64>,
    cancel: CancellationToken,
    timer: Option<JoinHandle<()>>,
}

pub struct SyncEngine {
    store: CatalogRepository,
    sync: SyncRepository,
    upstream: Arc<dyn CatalogUpstream>,
    localizer: Localizer,
    scheduler: Scheduler,
    config: SyncConfig,
    state: Mutex<RunState>,
}

impl SyncEngine {
    pub fn new(
        store: CatalogRepository,
        sync: SyncRepository,
        upstream: Arc<dyn CatalogUpstream>,
        localizer: Localizer,
        config: SyncConfig,
    ) -> Self {
        let scheduler = Scheduler::new(
            store.clone(),
            sync.clone(),
            Duration::from_secs(config.details_batch_delay_secs),
        );
        Self {
            store,
            sync,
            upstream,
            localizer,
            scheduler,
            config,
            state: Mutex::new(RunState {
                running: false,
                phase: None,
                category_id: None,
                cancel: CancellationToken::new(),
                timer: None,
            }),
        }
    }

    /// Startup reconciliation: reap progress rows left `running` by a dead
    /// process and re-arm the persisted details schedule (immediately when
    /// overdue). Called once before the API starts serving.
    pub async fn reconcile_on_startup(self: &Arc<Self>) -> Result<()> {
        let reaped = self
            .sync
            .fail_abandoned_runs("abandoned: process restarted mid-run")
            .await?;
        if reaped > 0 {
            warn!("Reaped {reaped} abandoned sync run(s) from a previous process");
        }
        if let Some((category_id, not_before)) = self.scheduler.pending().await? {
            let delay = (not_before - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            info!("Re-arming persisted schedule: category {category_id} in {delay:?}");
            self.arm_timer(category_id, delay).await;
        }
        Ok(())
    }

    // ===============================
    // RUN-FLAG GUARD
    // ===============================

    async fn try_begin(
        &self,
        phase: Option<SyncPhase>,
        category_id: Option<i64>,
    ) -> Option<CancellationToken> {
        let mut state = self.state.lock().await;
        if state.running {
            return None;
        }
        state.running = true;
        state.phase = phase;
        state.category_id = category_id;
        state.cancel = CancellationToken::new();
        Some(state.cancel.clone())
    }

    async fn end_run(&self) {
        let mut state = self.state.lock().await;
        state.running = false;
        state.phase = None;
        state.category_id = None;
    }

    // ===============================
    // BASE SYNC
    // ===============================

    /// Refresh the grade/class/category lookup tables. A failure on any step
    /// aborts the rest but keeps rows committed by earlier steps.
    pub async fn run_base_sync(&self) -> Result<String> {
        let Some(_cancel) = self.try_begin(None, None).await else {
            return Err(SyncBusy.into());
        };
        let result = self.base_sync_inner().await;
        self.end_run().await;
        match result {
            Ok(rows) => Ok(format!("base data synced ({rows} lookup rows)")),
            Err(e) => {
                self.sync
                    .log(
                        log_event::BASE_SYNC,
                        "base data sync failed",
                        None,
                        None,
                        None,
                        false,
                        Some(&format!("{e:#}")),
                    )
                    .await
                    .ok();
                Err(e)
            }
        }
    }

    async fn base_sync_inner(&self) -> Result<usize> {
        info!("Starting base data sync");

        let payload = self.upstream.fetch_grades().await.context("fetching grades")?;
        let grades = ingest::grades_from_json(&payload, &self.localizer)?;
        self.store.upsert_grades(&grades).await?;

        let payload = self.upstream.fetch_classes().await.context("fetching classes")?;
        let classes = ingest::classes_from_json(&payload, &self.localizer)?;
        self.store.upsert_classes(&classes).await?;

        let payload = self
            .upstream
            .fetch_categories()
            .await
            .context("fetching categories")?;
        let categories = ingest::categories_from_json(&payload, &self.localizer)?;
        self.store.upsert_categories(&categories).await?;

        let total = grades.len() + classes.len() + categories.len();
        info!(
            "✅ Base data synced: {} grades, {} classes, {} categories",
            grades.len(),
            classes.len(),
            categories.len()
        );
        self.sync
            .log(
                log_event::BASE_SYNC,
                &format!(
                    "base data synced: {} grades, {} classes, {} categories",
                    grades.len(),
                    classes.len(),
                    categories.len()
                ),
                None,
                None,
                None,
                true,
                None,
            )
            .await?;
        Ok(total)
    }

    // ===============================
    // LIST SYNC
    // ===============================

    /// Entry point for the list pipeline. Resumes an interrupted run from the
    /// page after the last committed one unless `force` asks for a fresh pass
    /// (which re-runs base sync first). Work happens on a background task;
    /// the returned message is for the control API.
    pub async fn start_sync(self: &Arc<Self>, force: bool) -> Result<String> {
        let Some(cancel) = self.try_begin(Some(SyncPhase::List), None).await else {
            return Err(SyncBusy.into());
        };
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine.list_sync_with_guard(cancel, force).await {
                error!("List sync failed: {e:#}");
            }
            engine.end_run().await;
        });
        Ok(if force {
            "list sync restarted from page 1".to_string()
        } else {
            "list sync started".to_string()
        })
    }

    /// Blocking variant of [`start_sync`](Self::start_sync); the integration
    /// tests and one-shot invocations drive this directly.
    pub async fn run_list_sync(self: &Arc<Self>, force: bool) -> Result<()> {
        let Some(cancel) = self.try_begin(Some(SyncPhase::List), None).await else {
            return Err(SyncBusy.into());
        };
        let result = self.list_sync_with_guard(cancel, force).await;
        self.end_run().await;
        result
    }

    async fn list_sync_with_guard(
        self: &Arc<Self>,
        cancel: CancellationToken,
        force: bool,
    ) -> Result<()> {
        let resume = if force {
            let superseded = self
                .sync
                .fail_abandoned_runs("superseded by forced restart")
                .await?;
            if superseded > 0 {
                info!("Marked {superseded} stale run(s) failed before forced restart");
            }
            None
        } else {
            self.sync.list_resume_point().await?
        };

        let start_page = resume.as_ref().map_or(1, |p| p.current_page + 1);
        // The progress row exists before any upstream work so that a failure
        // anywhere in the pipeline (base sync included) leaves a failed row
        // and an audit log entry behind.
        let progress_id = self.sync.create_progress(SyncPhase::List, None).await?;
        if let Some(prior) = &resume {
            info!("Resuming list sync from page {start_page}");
            self.sync
                .update_page_progress(
                    progress_id,
                    prior.current_page,
                    prior.total_pages,
                    prior.total_items,
                )
                .await?;
        }

        let outcome = self
            .list_phase(&cancel, resume.is_none(), progress_id, start_page)
            .await;

        match outcome {
            Ok(total_items) => {
                self.sync.complete_progress(progress_id, true, None).await?;
                self.sync
                    .log(
                        log_event::LIST_SYNC,
                        &format!("list sync completed: {total_items} items known"),
                        None,
                        None,
                        None,
                        true,
                        None,
                    )
                    .await?;
                info!("✅ List sync completed ({total_items} items)");
                // Kick off unattended details syncing, one category per tick.
                if let Some(first) = self.scheduler.first_category().await? {
                    self.schedule_details(first.id, self.scheduler.delay()).await?;
                }
                Ok(())
            }
            Err(e) => {
                let message = format!("{e:#}");
                self.sync
                    .complete_progress(progress_id, false, Some(&message))
                    .await?;
                self.sync
                    .log(
                        log_event::LIST_SYNC,
                        "list sync failed",
                        None,
                        None,
                        None,
                        false,
                        Some(&message),
                    )
                    .await?;
                Err(e)
            }
        }
    }

    /// Everything after the progress row: base refresh (fresh pass only,
    /// since a resume reuses the tables the interrupted run was built
    /// against), name index load, then the page walk.
    async fn list_phase(
        &self,
        cancel: &CancellationToken,
        fresh: bool,
        progress_id: i64,
        start_page: i64,
    ) -> Result<i64> {
        if fresh {
            self.base_sync_inner().await.context("base sync before list sync")?;
        }
        let names = NameIndex::load(&self.store).await?;
        self.list_pages(cancel, &names, progress_id, start_page).await
    }

    async fn list_pages(
        &self,
        cancel: &CancellationToken,
        names: &NameIndex,
        progress_id: i64,
        start_page: i64,
    ) -> Result<i64> {
        let mut page = start_page;
        loop {
            if cancel.is_cancelled() {
                bail!("stopped by operator");
            }
            let payload = self
                .upstream
                .fetch_item_page(page, self.config.list_page_size)
                .await
                .with_context(|| format!("fetching item page {page}"))?;
            let info = ingest::page_info(&payload)?;
            let (items, unmatched) =
                ingest::items_from_list_page(&payload, names, &self.localizer)?;
            self.store.upsert_items(&items).await?;

            for name in unmatched.iter().take(self.config.unmatched_log_sample) {
                warn!("No local match for upstream name '{name}' on page {page}");
                self.sync
                    .log(
                        log_event::NAME_UNMATCHED,
                        &format!("no local match for upstream name '{name}'"),
                        None,
                        None,
                        None,
                        false,
                        None,
                    )
                    .await?;
            }

            self.sync
                .update_page_progress(progress_id, page, info.last_page, info.total)
                .await?;
            info!(
                "📄 List page {page}/{} committed ({} items)",
                info.last_page,
                items.len()
            );

            if page >= info.last_page {
                return Ok(info.total);
            }
            page += 1;
        }
    }

    // ===============================
    // DETAILS SYNC
    // ===============================

    /// Run the details batch for one top-level category on a background task.
    pub async fn start_details_batch(self: &Arc<Self>, category_id: i64) -> Result<String> {
        let Some(cancel) = self
            .try_begin(Some(SyncPhase::Details), Some(category_id))
            .await
        else {
            return Err(SyncBusy.into());
        };
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            match engine.details_with_guard(cancel, category_id, false).await {
                Ok(report) => info!(
                    "✅ Details batch for category {category_id} done: {}/{} items, {} snapshots, {} failed",
                    report.items_synced, report.items_total, report.snapshots_written, report.items_failed
                ),
                Err(e) => error!("Details batch for category {category_id} failed: {e:#}"),
            }
            engine.end_run().await;
        });
        Ok(format!("details sync started for category {category_id}"))
    }

    /// Blocking variant of [`start_details_batch`](Self::start_details_batch).
    pub async fn run_details_batch(self: &Arc<Self>, category_id: i64) -> Result<DetailsReport> {
        let Some(cancel) = self
            .try_begin(Some(SyncPhase::Details), Some(category_id))
            .await
        else {
            return Err(SyncBusy.into());
        };
        let result = self.details_with_guard(cancel, category_id, false).await;
        self.end_run().await;
        result
    }

    /// Details sync scoped to a single sub-category, bypassing the top-level
    /// grouping and the scheduler. Manual repair tool.
    pub async fn start_subcategory_sync(self: &Arc<Self>, category_id: i64) -> Result<String> {
        let Some(cancel) = self
            .try_begin(Some(SyncPhase::Details), Some(category_id))
            .await
        else {
            return Err(SyncBusy.into());
        };
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            match engine.details_with_guard(cancel, category_id, true).await {
                Ok(report) => info!(
                    "✅ Sub-category {category_id} synced: {}/{} items, {} snapshots, {} failed",
                    report.items_synced, report.items_total, report.snapshots_written, report.items_failed
                ),
                Err(e) => error!("Sub-category {category_id} sync failed: {e:#}"),
            }
            engine.end_run().await;
        });
        Ok(format!("details sync started for sub-category {category_id}"))
    }

    /// Blocking variant of [`start_subcategory_sync`](Self::start_subcategory_sync).
    pub async fn run_subcategory_sync(self: &Arc<Self>, category_id: i64) -> Result<DetailsReport> {
        let Some(cancel) = self
            .try_begin(Some(SyncPhase::Details), Some(category_id))
            .await
        else {
            return Err(SyncBusy.into());
        };
        let result = self.details_with_guard(cancel, category_id, true).await;
        self.end_run().await;
        result
    }

    /// Cancel any pending scheduled batch and run this category immediately.
    pub async fn sync_category_now(self: &Arc<Self>, category_id: i64) -> Result<String> {
        {
            let mut state = self.state.lock().await;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
        }
        self.start_details_batch(category_id).await
    }

    async fn details_with_guard(
        self: &Arc<Self>,
        cancel: CancellationToken,
        category_id: i64,
        subcategory_only: bool,
    ) -> Result<DetailsReport> {
        self.store
            .get_category(category_id)
            .await?
            .ok_or_else(|| anyhow!("unknown category {category_id}"))?;

        let items = if subcategory_only {
            self.store.get_items_in_subcategory(category_id).await?
        } else {
            self.store.get_items_in_category(category_id).await?
        };
        let grade_ranks: HashMap<i64, i64> = self
            .store
            .get_grades()
            .await?
            .into_iter()
            .map(|g| (g.id, g.sort_order))
            .collect();
        let categories: HashMap<i64, Category> = self
            .store
            .get_all_categories()
            .await?
            .into_iter()
            .map(|c| (c.id, c))
            .collect();

        info!(
            "Starting details sync for category {category_id} ({} items)",
            items.len()
        );
        let progress_id = self
            .sync
            .create_progress(SyncPhase::Details, Some(category_id))
            .await?;
        let mut report = DetailsReport {
            category_id,
            items_total: items.len() as u64,
            ..Default::default()
        };

        let outcome = self
            .details_items(&cancel, progress_id, &items, &grade_ranks, &categories, &mut report)
            .await;

        match outcome {
            Ok(()) => {
                self.sync.complete_progress(progress_id, true, None).await?;
                self.sync
                    .log(
                        log_event::DETAILS_SYNC,
                        &format!(
                            "details sync for category {category_id}: {}/{} items, {} snapshots, {} failed",
                            report.items_synced,
                            report.items_total,
                            report.snapshots_written,
                            report.items_failed
                        ),
                        None,
                        None,
                        None,
                        report.items_failed == 0,
                        None,
                    )
                    .await?;
                if !subcategory_only {
                    self.schedule_after(category_id).await?;
                }
                Ok(report)
            }
            Err(e) => {
                let message = format!("{e:#}");
                self.sync
                    .complete_progress(progress_id, false, Some(&message))
                    .await?;
                self.sync
                    .log(
                        log_event::DETAILS_SYNC,
                        &format!("details sync for category {category_id} failed"),
                        None,
                        None,
                        None,
                        false,
                        Some(&message),
                    )
                    .await?;
                Err(e)
            }
        }
    }

    async fn details_items(
        &self,
        cancel: &CancellationToken,
        progress_id: i64,
        items: &[Item],
        grade_ranks: &HashMap<i64, i64>,
        categories: &HashMap<i64, Category>,
        report: &mut DetailsReport,
    ) -> Result<()> {
        for (index, item) in items.iter().enumerate() {
            // Cooperative stop between items; the item in flight always runs
            // to completion.
            if cancel.is_cancelled() {
                bail!("stopped by operator");
            }
            match self.sync_one_item(item.id, grade_ranks, categories).await {
                Ok(snapshots) => {
                    report.items_synced += 1;
                    report.snapshots_written += snapshots;
                }
                Err(e) => {
                    report.items_failed += 1;
                    warn!("Item {} failed during details sync: {e:#}", item.id);
                    self.sync
                        .log(
                            log_event::ITEM_FAILED,
                            &format!("detail sync failed for item {}", item.id),
                            Some(item.id),
                            None,
                            None,
                            false,
                            Some(&format!("{e:#}")),
                        )
                        .await?;
                }
            }
            self.sync
                .update_item_progress(progress_id, (index + 1) as i64, items.len() as i64)
                .await?;
        }
        Ok(())
    }

    /// Fetch, enrich and snapshot one item. Returns the number of snapshots
    /// written (1 for level 0, plus one per enchant/exceed level walked).
    async fn sync_one_item(
        &self,
        item_id: i64,
        grade_ranks: &HashMap<i64, i64>,
        categories: &HashMap<i64, Category>,
    ) -> Result<u64> {
        let raw = self.upstream.fetch_item_detail(item_id, 0).await?;
        let enriched =
            ingest::persist_detail(&self.store, &self.localizer, item_id, 0, 0, &raw).await?;
        let mut snapshots = 1;

        let top_name = enriched
            .category_id
            .and_then(|id| categories.get(&id))
            .map(|c| match c.parent_id.and_then(|p| categories.get(&p)) {
                Some(parent) => parent.name.as_str(),
                None => c.name.as_str(),
            });
        let grade_rank = enriched.grade_id.and_then(|id| grade_ranks.get(&id)).copied();

        if enchant_eligible(&self.config, &enriched, top_name, grade_rank) {
            let max_enchant = enriched.max_enchant_level.unwrap_or(0);
            let max_combined = max_enchant + enriched.max_exceed_level.unwrap_or(0);
            for combined in 1..=max_combined {
                let (enchant, exceed) = split_combined_level(combined, max_enchant);
                let raw_level = self.upstream.fetch_item_detail(item_id, combined).await?;
                ingest::persist_stats(
                    &self.store,
                    &self.localizer,
                    item_id,
                    enchant,
                    exceed,
                    &raw_level,
                )
                .await?;
                snapshots += 1;
            }
        }
        Ok(snapshots)
    }

    // ===============================
    // SCHEDULING & STOP
    // ===============================

    async fn schedule_after(self: &Arc<Self>, completed_category: i64) -> Result<()> {
        match self.scheduler.next_after(completed_category).await? {
            Some(next) => {
                self.schedule_details(next.id, self.scheduler.delay()).await?;
            }
            None => {
                self.scheduler.clear().await?;
                info!("🏁 All category batches complete");
                self.sync
                    .log(
                        log_event::DETAILS_SYNC,
                        "all category batches complete",
                        None,
                        None,
                        None,
                        true,
                        None,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn schedule_details(self: &Arc<Self>, category_id: i64, delay: Duration) -> Result<()> {
        let not_before = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        // Persist before arming so a crash in between re-arms on startup.
        self.scheduler.record(category_id, not_before).await?;
        info!("⏱️ Next details batch: category {category_id} in {delay:?}");
        self.arm_timer(category_id, delay).await;
        Ok(())
    }

    /// Boxed so the timer → batch → reschedule → timer cycle bottoms out in
    /// one concrete future type instead of an infinitely recursive opaque one.
    fn start_details_batch_boxed(
        self: Arc<Self>,
        category_id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send>> {
        Box::pin(async move { self.start_details_batch(category_id).await })
    }

    async fn arm_timer(self: &Arc<Self>, category_id: i64, delay: Duration) {
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match engine.start_details_batch_boxed(category_id).await {
                Ok(message) => info!("Scheduled batch fired: {message}"),
                Err(e) => error!("Scheduled batch for category {category_id} failed to start: {e:#}"),
            }
        });
        let mut state = self.state.lock().await;
        if let Some(old) = state.timer.replace(handle) {
            old.abort();
        }
    }

    /// Cooperative, coarse stop: cancels the pending timer and asks the
    /// running phase to wind down at its next unit boundary. The in-flight
    /// page or item always completes first.
    pub async fn stop_sync(&self) -> String {
        let was_running = {
            let mut state = self.state.lock().await;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.cancel.cancel();
            state.running
        };
        if let Err(e) = self.scheduler.clear().await {
            warn!("Failed to clear persisted schedule on stop: {e:#}");
        }
        if was_running {
            "stop requested; the unit of work in flight will finish first".to_string()
        } else {
            "no sync in progress; cleared any pending schedule".to_string()
        }
    }

    pub async fn status(&self) -> Result<SyncStatusReport> {
        let (is_running, phase, category_id) = {
            let state = self.state.lock().await;
            (state.running, state.phase, state.category_id)
        };
        Ok(SyncStatusReport {
            is_running,
            phase,
            category_id,
            progress: self.sync.latest_progress().await?,
            last_completed: self.sync.latest_completed().await?,
            item_count: self.store.count_items().await?,
            stat_count: self.store.count_item_stats().await?,
            schedule: self.scheduler.pending().await?.map(|(next_category_id, not_before)| {
                ScheduleEntry { next_category_id, not_before }
            }),
            categories: self.store.get_top_categories().await?,
        })
    }
}

/// Whether an item qualifies for the expensive per-level stat walk: it must
/// sit under an equipment super-category, clear the grade quality floor, be
/// flagged enchantable and have a positive enchant cap.
pub fn enchant_eligible(
    config: &SyncConfig,
    item: &Item,
    top_category_name: Option<&str>,
    grade_rank: Option<i64>,
) -> bool {
    let Some(top) = top_category_name else {
        return false;
    };
    if !config.equipment_categories.iter().any(|name| name == top) {
        return false;
    }
    let Some(rank) = grade_rank else {
        return false;
    };
    rank >= config.min_enchant_grade_rank
        && item.enchantable == Some(true)
        && item.max_enchant_level.unwrap_or(0) > 0
}
