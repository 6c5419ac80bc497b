//! Engine integration tests against an in-memory database and a scripted
//! upstream. Covers the full list pipeline, resume, the per-level details
//! walk, failure isolation and the category batch chain.

use anyhow::Result;
use async_trait::async_trait;
use item_mirror::application::{SyncBusy, SyncConfig, SyncEngine};
use item_mirror::domain::item::{Category, Grade, Item};
use item_mirror::domain::sync::{log_event, SyncPhase, SyncStatus};
use item_mirror::infrastructure::{
    CatalogRepository, CatalogUpstream, DatabaseConnection, Localizer, SyncRepository,
};
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Scripted upstream: fixed base payloads, a page table and a detail table,
/// with call recording for the assertions.
struct MockUpstream {
    pages: HashMap<i64, Value>,
    details: HashMap<i64, Value>,
    failing_items: HashSet<i64>,
    failing_base: bool,
    detail_gate: Option<Arc<tokio::sync::Semaphore>>,
    grade_fetches: Mutex<usize>,
    page_fetches: Mutex<Vec<i64>>,
    detail_fetches: Mutex<Vec<(i64, i64)>>,
}

impl MockUpstream {
    fn new(pages: HashMap<i64, Value>, details: HashMap<i64, Value>) -> Self {
        Self {
            pages,
            details,
            failing_items: HashSet::new(),
            failing_base: false,
            detail_gate: None,
            grade_fetches: Mutex::new(0),
            page_fetches: Mutex::new(Vec::new()),
            detail_fetches: Mutex::new(Vec::new()),
        }
    }

    fn with_failing_item(mut self, item_id: i64) -> Self {
        self.failing_items.insert(item_id);
        self
    }

    fn with_failing_base(mut self) -> Self {
        self.failing_base = true;
        self
    }

    /// Each detail fetch consumes one permit, so a batch can be held mid-run
    /// by starting the semaphore empty.
    fn with_detail_gate(mut self, gate: Arc<tokio::sync::Semaphore>) -> Self {
        self.detail_gate = Some(gate);
        self
    }

    fn pages_fetched(&self) -> Vec<i64> {
        self.page_fetches.lock().unwrap().clone()
    }

    fn details_fetched(&self) -> Vec<(i64, i64)> {
        self.detail_fetches.lock().unwrap().clone()
    }
}

#[async_trait]
impl CatalogUpstream for MockUpstream {
    async fn fetch_grades(&self) -> Result<Value> {
        *self.grade_fetches.lock().unwrap() += 1;
        if self.failing_base {
            anyhow::bail!("scripted base-data outage");
        }
        Ok(json!([
            {"id": 1, "name": "common", "sortOrder": 1},
            {"id": 2, "name": "uncommon", "sortOrder": 2},
            {"id": 3, "name": "rare", "sortOrder": 3},
            {"id": 4, "name": "epic", "sortOrder": 4},
            {"id": 5, "name": "legendary", "sortOrder": 5}
        ]))
    }

    async fn fetch_classes(&self) -> Result<Value> {
        Ok(json!([
            {"id": 1, "name": "warrior"},
            {"id": 2, "name": "mage"}
        ]))
    }

    async fn fetch_categories(&self) -> Result<Value> {
        Ok(json!([
            {"id": 1, "name": "weapon", "children": [{"id": 11, "name": "sword"}]},
            {"id": 2, "name": "material", "children": []}
        ]))
    }

    async fn fetch_item_page(&self, page: i64, _size: i64) -> Result<Value> {
        self.page_fetches.lock().unwrap().push(page);
        self.pages
            .get(&page)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no scripted page {page}"))
    }

    async fn fetch_item_detail(&self, item_id: i64, enchant_level: i64) -> Result<Value> {
        if let Some(gate) = &self.detail_gate {
            gate.acquire().await.unwrap().forget();
        }
        self.detail_fetches.lock().unwrap().push((item_id, enchant_level));
        if self.failing_items.contains(&item_id) {
            anyhow::bail!("scripted failure for item {item_id}");
        }
        self.details
            .get(&item_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no scripted detail for item {item_id}"))
    }
}

fn two_page_catalog() -> HashMap<i64, Value> {
    HashMap::from([
        (
            1,
            json!({
                "contents": [
                    {"id": 101, "name": "Relic Blade", "category": "sword", "grade": "legendary",
                     "level": 50, "equipLevel": 45},
                    {"id": 102, "name": "Iron Ore", "category": "material", "grade": "common"}
                ],
                "pagination": {"page": 1, "size": 100, "total": 3, "lastPage": 2}
            }),
        ),
        (
            2,
            json!({
                "contents": [
                    {"id": 103, "name": "Rusty Sword", "category": "sword", "grade": "common"}
                ],
                "pagination": {"page": 2, "size": 100, "total": 3, "lastPage": 2}
            }),
        ),
    ])
}

fn standard_details() -> HashMap<i64, Value> {
    HashMap::from([
        (
            101,
            json!({
                "name": "Relic Blade", "gradeId": 5, "categoryId": 11, "tradable": true,
                "enchantable": true, "maxEnchantLevel": 2, "maxExceedLevel": 1,
                "mainStats": [{"atk": 120}], "subStats": []
            }),
        ),
        (
            102,
            json!({
                "name": "Iron Ore", "gradeId": 1, "categoryId": 2,
                "enchantable": false, "maxEnchantLevel": 0,
                "mainStats": [], "subStats": []
            }),
        ),
        (
            103,
            json!({
                "name": "Rusty Sword", "gradeId": 1, "categoryId": 11,
                "enchantable": true, "maxEnchantLevel": 15, "maxExceedLevel": 3,
                "mainStats": [{"atk": 3}], "subStats": []
            }),
        ),
    ])
}

async fn build_engine(
    upstream: Arc<MockUpstream>,
) -> (Arc<SyncEngine>, CatalogRepository, SyncRepository) {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    DatabaseConnection::from_pool(pool.clone())
        .migrate()
        .await
        .unwrap();
    let store = CatalogRepository::new(pool.clone());
    let sync = SyncRepository::new(pool);
    let engine = Arc::new(SyncEngine::new(
        store.clone(),
        sync.clone(),
        upstream,
        Localizer::identity(),
        SyncConfig::default(),
    ));
    (engine, store, sync)
}

/// Seed the lookup tables and the minimal item rows a details batch scans,
/// the state a finished list sync leaves behind.
async fn seed_listed_catalog(store: &CatalogRepository) {
    store
        .upsert_grades(
            &serde_json::from_value::<Vec<Grade>>(json!([
                {"id": 1, "name": "common", "nameLocalized": "common", "sortOrder": 1},
                {"id": 5, "name": "legendary", "nameLocalized": "legendary", "sortOrder": 5}
            ]))
            .unwrap(),
        )
        .await
        .unwrap();
    store
        .upsert_categories(
            &serde_json::from_value::<Vec<Category>>(json!([
                {"id": 1, "name": "weapon", "nameLocalized": "weapon", "parentId": null, "batchIndex": 0},
                {"id": 11, "name": "sword", "nameLocalized": "sword", "parentId": 1, "batchIndex": 0},
                {"id": 2, "name": "material", "nameLocalized": "material", "parentId": null, "batchIndex": 1}
            ]))
            .unwrap(),
        )
        .await
        .unwrap();

    let mut blade = Item::from_listing(101);
    blade.category_id = Some(11);
    let mut rusty = Item::from_listing(103);
    rusty.category_id = Some(11);
    let mut ore = Item::from_listing(102);
    ore.category_id = Some(2);
    store.upsert_items(&[blade, rusty, ore]).await.unwrap();
}

#[tokio::test]
async fn list_sync_walks_every_page_and_schedules_details() {
    let upstream = Arc::new(MockUpstream::new(two_page_catalog(), standard_details()));
    let (engine, store, sync) = build_engine(Arc::clone(&upstream)).await;

    engine.run_list_sync(false).await.unwrap();

    // Base sync ran first, then both pages in order.
    assert_eq!(*upstream.grade_fetches.lock().unwrap(), 1);
    assert_eq!(upstream.pages_fetched(), vec![1, 2]);
    assert_eq!(store.count_items().await.unwrap(), 3);
    assert_eq!(store.get_grades().await.unwrap().len(), 5);

    // Name matching resolved both axes for the first entry.
    let blade = store.get_item_by_id(101).await.unwrap().unwrap();
    assert_eq!(blade.category_id, Some(11));
    assert_eq!(blade.grade_id, Some(5));

    let progress = sync.latest_progress().await.unwrap().unwrap();
    assert_eq!(progress.phase, SyncPhase::List);
    assert_eq!(progress.status, SyncStatus::Completed);
    assert_eq!(progress.current_page, 2);
    assert_eq!(progress.total_items, 3);

    // The first details batch was queued for the first top-level category.
    let (next, _) = sync.get_schedule().await.unwrap().unwrap();
    assert_eq!(next, 1);
}

#[tokio::test]
async fn interrupted_list_sync_resumes_after_the_last_committed_page() {
    let mut pages = HashMap::new();
    for page in 1..=7 {
        pages.insert(
            page,
            json!({
                "contents": [{"id": 1000 + page}],
                "pagination": {"page": page, "size": 100, "total": 7, "lastPage": 7}
            }),
        );
    }
    let upstream = Arc::new(MockUpstream::new(pages, HashMap::new()));
    let (engine, store, sync) = build_engine(Arc::clone(&upstream)).await;

    // A previous run died after committing page 5.
    let stale = sync.create_progress(SyncPhase::List, None).await.unwrap();
    sync.update_page_progress(stale, 5, 7, 7).await.unwrap();
    sync.fail_abandoned_runs("abandoned: process restarted mid-run")
        .await
        .unwrap();

    engine.run_list_sync(false).await.unwrap();

    // No base re-sync on resume, and no refetch of pages 1..=5.
    assert_eq!(*upstream.grade_fetches.lock().unwrap(), 0);
    assert_eq!(upstream.pages_fetched(), vec![6, 7]);
    assert_eq!(store.count_items().await.unwrap(), 2);

    let progress = sync.latest_progress().await.unwrap().unwrap();
    assert_eq!(progress.status, SyncStatus::Completed);
    assert_eq!(progress.current_page, 7);
}

#[tokio::test]
async fn forced_sync_starts_over_from_page_one() {
    let upstream = Arc::new(MockUpstream::new(two_page_catalog(), standard_details()));
    let (engine, _store, sync) = build_engine(Arc::clone(&upstream)).await;

    let stale = sync.create_progress(SyncPhase::List, None).await.unwrap();
    sync.update_page_progress(stale, 1, 2, 3).await.unwrap();

    engine.run_list_sync(true).await.unwrap();

    assert_eq!(upstream.pages_fetched(), vec![1, 2]);
    // The stale row was superseded, not resumed, and no longer shadows
    // anything after the fresh run completed.
    let _ = stale;
    assert!(sync.list_resume_point().await.unwrap().is_none());
}

#[tokio::test]
async fn base_sync_failure_in_list_pipeline_is_recorded() {
    let upstream = Arc::new(
        MockUpstream::new(two_page_catalog(), standard_details()).with_failing_base(),
    );
    let (engine, _store, sync) = build_engine(upstream).await;

    engine.run_list_sync(false).await.unwrap_err();

    // The run died before the first page, but it still left a failed
    // progress row and an audit log entry behind.
    let progress = sync.latest_progress().await.unwrap().unwrap();
    assert_eq!(progress.phase, SyncPhase::List);
    assert_eq!(progress.status, SyncStatus::Failed);
    assert!(progress
        .error_message
        .as_deref()
        .unwrap()
        .contains("base sync before list sync"));

    let logs = sync.recent_logs(20).await.unwrap();
    assert!(logs
        .iter()
        .any(|l| l.event_type == log_event::LIST_SYNC && !l.success));
}

#[tokio::test]
async fn details_sync_walks_every_enchant_level_of_eligible_items() {
    let upstream = Arc::new(MockUpstream::new(HashMap::new(), standard_details()));
    let (engine, store, _sync) = build_engine(Arc::clone(&upstream)).await;
    seed_listed_catalog(&store).await;

    let report = engine.run_details_batch(1).await.unwrap();

    // Category 1 covers both sword items. The Relic Blade (legendary,
    // maxEnchant 2, maxExceed 1) gets snapshots at +0, +1, +2 and +2/1;
    // the Rusty Sword fails the grade floor and gets only the +0 snapshot.
    assert_eq!(report.items_total, 2);
    assert_eq!(report.items_synced, 2);
    assert_eq!(report.items_failed, 0);
    assert_eq!(report.snapshots_written, 5);

    let blade_levels: Vec<(i64, i64)> = store
        .get_item_all_stats(101)
        .await
        .unwrap()
        .iter()
        .map(|s| (s.enchant_level, s.exceed_level))
        .collect();
    assert_eq!(blade_levels, vec![(0, 0), (1, 0), (2, 0), (2, 1)]);
    assert_eq!(store.get_item_all_stats(103).await.unwrap().len(), 1);

    // The walk fetched combined levels 0..=3 for the blade, only 0 for the
    // rusty sword, and never touched the material item.
    let fetched = upstream.details_fetched();
    assert_eq!(
        fetched,
        vec![(101, 0), (101, 1), (101, 2), (101, 3), (103, 0)]
    );
}

#[tokio::test]
async fn details_batches_chain_through_categories_then_stop() {
    let upstream = Arc::new(MockUpstream::new(HashMap::new(), standard_details()));
    let (engine, store, sync) = build_engine(upstream).await;
    seed_listed_catalog(&store).await;

    engine.run_details_batch(1).await.unwrap();
    let (next, _) = sync.get_schedule().await.unwrap().unwrap();
    assert_eq!(next, 2);

    engine.run_details_batch(2).await.unwrap();
    assert!(sync.get_schedule().await.unwrap().is_none());
}

#[tokio::test]
async fn one_failing_item_does_not_abort_the_batch() {
    let upstream = Arc::new(
        MockUpstream::new(HashMap::new(), standard_details()).with_failing_item(101),
    );
    let (engine, store, sync) = build_engine(upstream).await;
    seed_listed_catalog(&store).await;

    let report = engine.run_details_batch(1).await.unwrap();

    assert_eq!(report.items_total, 2);
    assert_eq!(report.items_synced, 1);
    assert_eq!(report.items_failed, 1);
    assert_eq!(report.snapshots_written, 1);

    let progress = sync.latest_progress().await.unwrap().unwrap();
    assert_eq!(progress.status, SyncStatus::Completed);

    let logs = sync.recent_logs(20).await.unwrap();
    assert!(logs
        .iter()
        .any(|l| l.event_type == log_event::ITEM_FAILED && l.item_id == Some(101)));
}

#[tokio::test]
async fn subcategory_sync_scopes_to_one_subtree_and_leaves_the_schedule_alone() {
    let upstream = Arc::new(MockUpstream::new(HashMap::new(), standard_details()));
    let (engine, store, sync) = build_engine(Arc::clone(&upstream)).await;
    seed_listed_catalog(&store).await;

    let report = engine.run_subcategory_sync(11).await.unwrap();

    assert_eq!(report.items_total, 2);
    // A manual sub-category repair must not arm the batch chain.
    assert!(sync.get_schedule().await.unwrap().is_none());
}

#[tokio::test]
async fn startup_reconciliation_reaps_running_rows() {
    let upstream = Arc::new(MockUpstream::new(HashMap::new(), HashMap::new()));
    let (engine, _store, sync) = build_engine(upstream).await;

    let orphan = sync.create_progress(SyncPhase::Details, Some(1)).await.unwrap();
    engine.reconcile_on_startup().await.unwrap();

    let progress = sync.latest_progress().await.unwrap().unwrap();
    assert_eq!(progress.id, orphan);
    assert_eq!(progress.status, SyncStatus::Failed);
    assert_eq!(
        progress.error_message.as_deref(),
        Some("abandoned: process restarted mid-run")
    );
}

#[tokio::test]
async fn stop_when_idle_clears_the_pending_schedule() {
    let upstream = Arc::new(MockUpstream::new(HashMap::new(), HashMap::new()));
    let (engine, _store, sync) = build_engine(upstream).await;

    sync.set_schedule(2, chrono::Utc::now()).await.unwrap();
    let message = engine.stop_sync().await;

    assert!(message.contains("no sync in progress"));
    assert!(sync.get_schedule().await.unwrap().is_none());
}

#[tokio::test]
async fn overdue_persisted_schedule_fires_on_startup() {
    let upstream = Arc::new(MockUpstream::new(HashMap::new(), standard_details()));
    let (engine, store, sync) = build_engine(upstream).await;
    seed_listed_catalog(&store).await;

    // A batch for category 1 was due an hour ago when the process died.
    sync.set_schedule(1, chrono::Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();
    engine.reconcile_on_startup().await.unwrap();

    // The re-armed timer fires immediately; wait for the batch to land.
    let mut completed = false;
    for _ in 0..100 {
        if let Some(progress) = sync.latest_progress().await.unwrap() {
            if progress.phase == SyncPhase::Details && progress.status == SyncStatus::Completed {
                completed = true;
                break;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(completed, "re-armed batch never completed");
    assert!(store.count_item_stats().await.unwrap() > 0);
}

#[tokio::test]
async fn concurrent_start_is_refused_while_a_run_is_active() {
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let upstream = Arc::new(
        MockUpstream::new(HashMap::new(), standard_details())
            .with_detail_gate(Arc::clone(&gate)),
    );
    let (engine, store, _sync) = build_engine(upstream).await;
    seed_listed_catalog(&store).await;

    // Hold a details batch mid-item so the run flag stays taken.
    let background = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run_details_batch(1).await })
    };
    while !engine.status().await.unwrap().is_running {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let err = engine.run_base_sync().await.unwrap_err();
    assert!(err.downcast_ref::<SyncBusy>().is_some());

    gate.add_permits(100);
    background.await.unwrap().unwrap();
}

#[tokio::test]
async fn base_sync_populates_all_three_lookup_tables() {
    let upstream = Arc::new(MockUpstream::new(HashMap::new(), HashMap::new()));
    let (engine, store, _sync) = build_engine(upstream).await;

    engine.run_base_sync().await.unwrap();

    assert_eq!(store.get_grades().await.unwrap().len(), 5);
    assert_eq!(store.get_classes().await.unwrap().len(), 2);
    let tops = store.get_top_categories().await.unwrap();
    assert_eq!(tops.len(), 2);
    assert_eq!(tops[0].name, "weapon");
    assert_eq!(store.get_all_categories().await.unwrap().len(), 3);
}
