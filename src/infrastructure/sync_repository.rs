//! Persistence for sync run state: progress rows, the append-only log and the
//! singleton scheduler row.

use crate::domain::sync::{SyncLogEntry, SyncPhase, SyncProgress, SyncStatus};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

#[derive(Clone)]
pub struct SyncRepository {
    pool: Arc<SqlitePool>,
}

impl SyncRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    // ===============================
    // PROGRESS ROWS
    // ===============================

    pub async fn create_progress(
        &self,
        phase: SyncPhase,
        category_id: Option<i64>,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO sync_progress (phase, category_id, status, started_at) \
             VALUES (?, ?, 'running', ?)",
        )
        .bind(phase.as_str())
        .bind(category_id)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// List-phase counters. Written after every committed page.
    pub async fn update_page_progress(
        &self,
        id: i64,
        current_page: i64,
        total_pages: i64,
        total_items: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sync_progress SET current_page = ?, total_pages = ?, total_items = ? \
             WHERE id = ?",
        )
        .bind(current_page)
        .bind(total_pages)
        .bind(total_items)
        .bind(id)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    /// Details-phase counters. Written after every processed item.
    pub async fn update_item_progress(
        &self,
        id: i64,
        current_item: i64,
        total_items: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sync_progress SET current_item = ?, total_items = ? WHERE id = ?",
        )
        .bind(current_item)
        .bind(total_items)
        .bind(id)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    pub async fn complete_progress(
        &self,
        id: i64,
        success: bool,
        error_message: Option<&str>,
    ) -> Result<()> {
        let status = if success { SyncStatus::Completed } else { SyncStatus::Failed };
        sqlx::query(
            "UPDATE sync_progress SET status = ?, error_message = ?, completed_at = ? \
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    /// Startup reconciliation: rows still `running` belong to a run that died
    /// with the process. Returns how many rows were reaped.
    pub async fn fail_abandoned_runs(&self, reason: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE sync_progress SET status = 'failed', error_message = ?, completed_at = ? \
             WHERE status = 'running'",
        )
        .bind(reason)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn latest_progress(&self) -> Result<Option<SyncProgress>> {
        let row = sqlx::query(&format!(
            "SELECT {PROGRESS_COLUMNS} FROM sync_progress ORDER BY id DESC LIMIT 1"
        ))
        .fetch_optional(&*self.pool)
        .await?;
        row.as_ref().map(row_to_progress).transpose()
    }

    pub async fn latest_completed(&self) -> Result<Option<SyncProgress>> {
        let row = sqlx::query(&format!(
            "SELECT {PROGRESS_COLUMNS} FROM sync_progress WHERE status = 'completed' \
             ORDER BY id DESC LIMIT 1"
        ))
        .fetch_optional(&*self.pool)
        .await?;
        row.as_ref().map(row_to_progress).transpose()
    }

    /// Resume point for the list phase: the most recent list-phase run, if it
    /// did not finish and committed at least one page. Its `current_page` is
    /// the last page committed, so a resume continues at the page after it.
    /// Abandoned rows reaped at startup stay resumable through this; a run
    /// completed since then does not, so older failures never shadow it.
    pub async fn list_resume_point(&self) -> Result<Option<SyncProgress>> {
        let row = sqlx::query(&format!(
            "SELECT {PROGRESS_COLUMNS} FROM sync_progress \
             WHERE phase = 'list' ORDER BY id DESC LIMIT 1"
        ))
        .fetch_optional(&*self.pool)
        .await?;
        let Some(progress) = row.as_ref().map(row_to_progress).transpose()? else {
            return Ok(None);
        };
        let unfinished = matches!(progress.status, SyncStatus::Running | SyncStatus::Failed);
        Ok((unfinished && progress.current_page >= 1).then_some(progress))
    }

    // ===============================
    // SYNC LOG (append-only)
    // ===============================

    #[allow(clippy::too_many_arguments)]
    pub async fn log(
        &self,
        event_type: &str,
        message: &str,
        item_id: Option<i64>,
        enchant_level: Option<i64>,
        exceed_level: Option<i64>,
        success: bool,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO sync_log \
             (event_type, message, item_id, enchant_level, exceed_level, success, error, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event_type)
        .bind(message)
        .bind(item_id)
        .bind(enchant_level)
        .bind(exceed_level)
        .bind(success)
        .bind(error)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_logs(&self, limit: i64) -> Result<Vec<SyncLogEntry>> {
        let rows = sqlx::query(
            "SELECT id, event_type, message, item_id, enchant_level, exceed_level, \
             success, error, created_at FROM sync_log ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| SyncLogEntry {
                id: r.get("id"),
                event_type: r.get("event_type"),
                message: r.get("message"),
                item_id: r.get("item_id"),
                enchant_level: r.get("enchant_level"),
                exceed_level: r.get("exceed_level"),
                success: r.get("success"),
                error: r.get("error"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    // ===============================
    // SCHEDULE (singleton row)
    // ===============================

    pub async fn set_schedule(
        &self,
        next_category_id: i64,
        not_before: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO sync_schedule (id, next_category_id, not_before) \
             VALUES (1, ?, ?)",
        )
        .bind(next_category_id)
        .bind(not_before)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_schedule(&self) -> Result<()> {
        sqlx::query("DELETE FROM sync_schedule WHERE id = 1")
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_schedule(&self) -> Result<Option<(i64, DateTime<Utc>)>> {
        let row = sqlx::query(
            "SELECT next_category_id, not_before FROM sync_schedule WHERE id = 1",
        )
        .fetch_optional(&*self.pool)
        .await?;
        Ok(row.and_then(|r| {
            let category: Option<i64> = r.get("next_category_id");
            let not_before: Option<DateTime<Utc>> = r.get("not_before");
            category.zip(not_before)
        }))
    }
}

const PROGRESS_COLUMNS: &str = "id, phase, category_id, current_page, total_pages, \
     current_item, total_items, status, error_message, started_at, completed_at";

fn row_to_progress(row: &sqlx::sqlite::SqliteRow) -> Result<SyncProgress> {
    let phase_text: String = row.get("phase");
    let status_text: String = row.get("status");
    Ok(SyncProgress {
        id: row.get("id"),
        phase: SyncPhase::parse(&phase_text)
            .ok_or_else(|| anyhow!("unknown sync phase in store: {phase_text}"))?,
        category_id: row.get("category_id"),
        current_page: row.get("current_page"),
        total_pages: row.get("total_pages"),
        current_item: row.get("current_item"),
        total_items: row.get("total_items"),
        status: SyncStatus::parse(&status_text)
            .ok_or_else(|| anyhow!("unknown sync status in store: {status_text}"))?,
        error_message: row.get("error_message"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}
