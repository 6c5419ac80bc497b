//! Sync run bookkeeping: phases, statuses, the persisted progress row and the
//! append-only log entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Top-level sync mode. Base-data sync is not tracked by a progress row (it
/// is short and restartable for free), so only the two long phases appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    List,
    Details,
}

impl SyncPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncPhase::List => "list",
            SyncPhase::Details => "details",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "list" => Some(SyncPhase::List),
            "details" => Some(SyncPhase::Details),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Running => "running",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "running" => Some(SyncStatus::Running),
            "completed" => Some(SyncStatus::Completed),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

/// One row per sync run. Page counters are used by the list phase, item
/// counters by the details phase; the unused pair stays at zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncProgress {
    pub id: i64,
    pub phase: SyncPhase,
    #[serde(rename = "categoryId")]
    pub category_id: Option<i64>,
    #[serde(rename = "currentPage")]
    pub current_page: i64,
    #[serde(rename = "totalPages")]
    pub total_pages: i64,
    #[serde(rename = "currentItem")]
    pub current_item: i64,
    #[serde(rename = "totalItems")]
    pub total_items: i64,
    pub status: SyncStatus,
    #[serde(rename = "errorMessage")]
    pub error_message: Option<String>,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "completedAt")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Append-only audit record. Never updated, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: i64,
    #[serde(rename = "eventType")]
    pub event_type: String,
    pub message: String,
    #[serde(rename = "itemId")]
    pub item_id: Option<i64>,
    #[serde(rename = "enchantLevel")]
    pub enchant_level: Option<i64>,
    #[serde(rename = "exceedLevel")]
    pub exceed_level: Option<i64>,
    pub success: bool,
    pub error: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Event type tags used in the sync log.
pub mod log_event {
    pub const BASE_SYNC: &str = "base_sync";
    pub const LIST_SYNC: &str = "list_sync";
    pub const DETAILS_SYNC: &str = "details_sync";
    pub const ITEM_FAILED: &str = "item_failed";
    pub const NAME_UNMATCHED: &str = "name_unmatched";
    pub const BACKFILL: &str = "backfill";
}

/// Outcome tally for one details batch. Per-item failures are counted here
/// instead of failing the batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DetailsReport {
    #[serde(rename = "categoryId")]
    pub category_id: i64,
    #[serde(rename = "itemsTotal")]
    pub items_total: u64,
    #[serde(rename = "itemsSynced")]
    pub items_synced: u64,
    #[serde(rename = "itemsFailed")]
    pub items_failed: u64,
    #[serde(rename = "snapshotsWritten")]
    pub snapshots_written: u64,
}

/// Persisted scheduler state: which category runs next and not before when.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleEntry {
    #[serde(rename = "nextCategoryId")]
    pub next_category_id: i64,
    #[serde(rename = "notBefore")]
    pub not_before: DateTime<Utc>,
}

/// Snapshot served by `GET /sync/status`.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatusReport {
    #[serde(rename = "isRunning")]
    pub is_running: bool,
    pub phase: Option<SyncPhase>,
    #[serde(rename = "categoryId")]
    pub category_id: Option<i64>,
    pub progress: Option<SyncProgress>,
    #[serde(rename = "lastCompleted")]
    pub last_completed: Option<SyncProgress>,
    #[serde(rename = "itemCount")]
    pub item_count: i64,
    #[serde(rename = "statCount")]
    pub stat_count: i64,
    pub schedule: Option<ScheduleEntry>,
    pub categories: Vec<super::item::Category>,
}
