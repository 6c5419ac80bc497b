// Database connection and pool management
// This module handles SQLite database connections using sqlx

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    pub async fn new(database_path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(database_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{database_path}"))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            // Readers may overlap the single sync writer; avoid transient
            // "database is locked" failures.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests use this with in-memory SQLite).
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        let create_items_sql = r#"
            CREATE TABLE IF NOT EXISTS items (
                id INTEGER PRIMARY KEY,
                name TEXT,
                name_original TEXT,
                image TEXT,
                grade_id INTEGER,
                category_id INTEGER,
                level INTEGER,
                equip_level INTEGER,
                tradable BOOLEAN,
                enchantable BOOLEAN,
                max_enchant_level INTEGER,
                item_type TEXT,
                classes TEXT,
                options TEXT,
                sources TEXT,
                raw TEXT,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
        "#;

        let create_item_stats_sql = r#"
            CREATE TABLE IF NOT EXISTS item_stats (
                item_id INTEGER NOT NULL,
                enchant_level INTEGER NOT NULL,
                exceed_level INTEGER NOT NULL,
                main_stats TEXT NOT NULL,
                sub_stats TEXT NOT NULL,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (item_id, enchant_level, exceed_level)
            )
        "#;

        let create_grades_sql = r#"
            CREATE TABLE IF NOT EXISTS grades (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                name_localized TEXT NOT NULL,
                sort_order INTEGER NOT NULL DEFAULT 0
            )
        "#;

        let create_classes_sql = r#"
            CREATE TABLE IF NOT EXISTS classes (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                name_localized TEXT NOT NULL
            )
        "#;

        let create_categories_sql = r#"
            CREATE TABLE IF NOT EXISTS categories (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                name_localized TEXT NOT NULL,
                parent_id INTEGER
            )
        "#;

        let create_sync_progress_sql = r#"
            CREATE TABLE IF NOT EXISTS sync_progress (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                phase TEXT NOT NULL,
                category_id INTEGER,
                current_page INTEGER NOT NULL DEFAULT 0,
                total_pages INTEGER NOT NULL DEFAULT 0,
                current_item INTEGER NOT NULL DEFAULT 0,
                total_items INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                error_message TEXT,
                started_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                completed_at DATETIME
            )
        "#;

        let create_sync_log_sql = r#"
            CREATE TABLE IF NOT EXISTS sync_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                message TEXT NOT NULL,
                item_id INTEGER,
                enchant_level INTEGER,
                exceed_level INTEGER,
                success BOOLEAN NOT NULL DEFAULT 1,
                error TEXT,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
        "#;

        let create_sync_schedule_sql = r#"
            CREATE TABLE IF NOT EXISTS sync_schedule (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                next_category_id INTEGER,
                not_before DATETIME
            )
        "#;

        sqlx::query(create_items_sql).execute(&self.pool).await?;
        sqlx::query(create_item_stats_sql).execute(&self.pool).await?;
        sqlx::query(create_grades_sql).execute(&self.pool).await?;
        sqlx::query(create_classes_sql).execute(&self.pool).await?;
        sqlx::query(create_categories_sql).execute(&self.pool).await?;
        sqlx::query(create_sync_progress_sql).execute(&self.pool).await?;
        sqlx::query(create_sync_log_sql).execute(&self.pool).await?;
        sqlx::query(create_sync_schedule_sql).execute(&self.pool).await?;

        // Columns added after the first deployed schema. Re-running against an
        // existing database must be a no-op, not an error.
        self.ensure_column("items", "max_exceed_level", "INTEGER").await?;
        self.ensure_column("items", "raw_original", "TEXT").await?;
        self.ensure_column("categories", "batch_index", "INTEGER NOT NULL DEFAULT 0")
            .await?;

        let index_statements = [
            "CREATE INDEX IF NOT EXISTS idx_items_category_id ON items (category_id)",
            "CREATE INDEX IF NOT EXISTS idx_items_grade_id ON items (grade_id)",
            "CREATE INDEX IF NOT EXISTS idx_categories_parent_id ON categories (parent_id)",
            "CREATE INDEX IF NOT EXISTS idx_sync_progress_status ON sync_progress (status)",
            "CREATE INDEX IF NOT EXISTS idx_sync_log_item_id ON sync_log (item_id)",
        ];
        for statement in index_statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Additive schema evolution: add a column unless a prior version of the
    /// schema already has it. SQLite has no `ADD COLUMN IF NOT EXISTS`, so the
    /// duplicate-column error is treated as a no-op.
    async fn ensure_column(&self, table: &str, column: &str, decl: &str) -> Result<()> {
        let sql = format!("ALTER TABLE {table} ADD COLUMN {column} {decl}");
        match sqlx::query(&sql).execute(&self.pool).await {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("duplicate column name") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
