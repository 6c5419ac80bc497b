//! Repository for the mirrored catalog: items, per-level stat snapshots and
//! the grade/class/category lookup tables.
//!
//! All writes are idempotent upserts keyed by the upstream's natural ids, so
//! every sync pass can blindly re-apply what it fetched.

use crate::domain::item::{
    Category, CategoryWithChildren, ClassInfo, Grade, Item, ItemFilter, ItemPage, ItemStatSnapshot,
    Pagination,
};
use anyhow::Result;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

#[derive(Clone)]
pub struct CatalogRepository {
    pool: Arc<SqlitePool>,
}

impl CatalogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    // ===============================
    // ITEM OPERATIONS
    // ===============================

    /// Upsert minimal item records from a list-sync page. Only the columns the
    /// list endpoint supplies are written on conflict, so a later re-listing
    /// never erases detail-sync enrichment. The whole page commits atomically.
    pub async fn upsert_items(&self, items: &[Item]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for item in items {
            sqlx::query(
                r#"
                INSERT INTO items (id, name, name_original, image, grade_id, category_id,
                                   level, equip_level, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    name_original = excluded.name_original,
                    image = excluded.image,
                    grade_id = excluded.grade_id,
                    category_id = excluded.category_id,
                    level = excluded.level,
                    equip_level = excluded.equip_level,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(item.id)
            .bind(&item.name)
            .bind(&item.name_original)
            .bind(&item.image)
            .bind(item.grade_id)
            .bind(item.category_id)
            .bind(item.level)
            .bind(item.equip_level)
            .bind(item.created_at)
            .bind(item.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Upsert a fully enriched item record from the detail endpoint.
    pub async fn upsert_item_detail(&self, item: &Item) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO items (id, name, name_original, image, grade_id, category_id,
                               level, equip_level, tradable, enchantable,
                               max_enchant_level, max_exceed_level, item_type,
                               classes, options, sources, raw, raw_original,
                               created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                name_original = excluded.name_original,
                image = excluded.image,
                grade_id = COALESCE(excluded.grade_id, items.grade_id),
                category_id = COALESCE(excluded.category_id, items.category_id),
                level = excluded.level,
                equip_level = excluded.equip_level,
                tradable = excluded.tradable,
                enchantable = excluded.enchantable,
                max_enchant_level = excluded.max_enchant_level,
                max_exceed_level = excluded.max_exceed_level,
                item_type = excluded.item_type,
                classes = excluded.classes,
                options = excluded.options,
                sources = excluded.sources,
                raw = excluded.raw,
                raw_original = excluded.raw_original,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(item.id)
        .bind(&item.name)
        .bind(&item.name_original)
        .bind(&item.image)
        .bind(item.grade_id)
        .bind(item.category_id)
        .bind(item.level)
        .bind(item.equip_level)
        .bind(item.tradable)
        .bind(item.enchantable)
        .bind(item.max_enchant_level)
        .bind(item.max_exceed_level)
        .bind(&item.item_type)
        .bind(&item.classes)
        .bind(&item.options)
        .bind(&item.sources)
        .bind(&item.raw)
        .bind(&item.raw_original)
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    /// Insert-or-replace the stat snapshot for one (item, enchant, exceed)
    /// triple. A re-sync of the same level silently replaces the old row.
    pub async fn upsert_item_stats(
        &self,
        item_id: i64,
        enchant_level: i64,
        exceed_level: i64,
        main_stats: &str,
        sub_stats: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO item_stats
            (item_id, enchant_level, exceed_level, main_stats, sub_stats, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(item_id)
        .bind(enchant_level)
        .bind(exceed_level)
        .bind(main_stats)
        .bind(sub_stats)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_item_by_id(&self, id: i64) -> Result<Option<Item>> {
        let row = sqlx::query(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?"))
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;
        Ok(row.map(|r| row_to_item(&r)))
    }

    pub async fn get_item_stats(
        &self,
        item_id: i64,
        enchant_level: i64,
        exceed_level: i64,
    ) -> Result<Option<ItemStatSnapshot>> {
        let row = sqlx::query(
            r#"
            SELECT item_id, enchant_level, exceed_level, main_stats, sub_stats, updated_at
            FROM item_stats
            WHERE item_id = ? AND enchant_level = ? AND exceed_level = ?
            "#,
        )
        .bind(item_id)
        .bind(enchant_level)
        .bind(exceed_level)
        .fetch_optional(&*self.pool)
        .await?;
        Ok(row.map(|r| row_to_snapshot(&r)))
    }

    /// All levels synced so far for one item, lowest level first.
    pub async fn get_item_all_stats(&self, item_id: i64) -> Result<Vec<ItemStatSnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT item_id, enchant_level, exceed_level, main_stats, sub_stats, updated_at
            FROM item_stats
            WHERE item_id = ?
            ORDER BY enchant_level ASC, exceed_level ASC
            "#,
        )
        .bind(item_id)
        .fetch_all(&*self.pool)
        .await?;
        Ok(rows.iter().map(row_to_snapshot).collect())
    }

    /// Filtered, paginated item listing. Predicates are optional and
    /// AND-combined; a top-level category id implicitly includes its
    /// sub-categories.
    pub async fn query_items(&self, filter: &ItemFilter) -> Result<ItemPage> {
        let page = filter.page.max(1);
        let size = filter.size.max(1);
        let keyword_pattern = filter.keyword.as_ref().map(|k| format!("%{k}%"));

        let mut conditions: Vec<&str> = Vec::new();
        if filter.grade.is_some() {
            conditions.push("i.grade_id = ?");
        }
        if filter.category_id.is_some() {
            conditions.push(
                "(i.category_id = ? OR i.category_id IN \
                 (SELECT id FROM categories WHERE parent_id = ?))",
            );
        }
        if filter.class_id.is_some() {
            conditions.push(
                "EXISTS (SELECT 1 FROM json_each(COALESCE(i.classes, '[]')) \
                 WHERE json_each.value = ?)",
            );
        }
        if keyword_pattern.is_some() {
            conditions.push("(i.name LIKE ? OR i.name_original LIKE ?)");
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM items i {where_clause}");
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        if let Some(grade) = filter.grade {
            count_query = count_query.bind(grade);
        }
        if let Some(category_id) = filter.category_id {
            count_query = count_query.bind(category_id).bind(category_id);
        }
        if let Some(class_id) = filter.class_id {
            count_query = count_query.bind(class_id);
        }
        if let Some(pattern) = &keyword_pattern {
            count_query = count_query.bind(pattern).bind(pattern);
        }
        let total = count_query.fetch_one(&*self.pool).await?;

        let data_sql = format!(
            "SELECT {ITEM_COLUMNS_QUALIFIED} FROM items i {where_clause} \
             ORDER BY i.id ASC LIMIT ? OFFSET ?"
        );
        let mut data_query = sqlx::query(&data_sql);
        if let Some(grade) = filter.grade {
            data_query = data_query.bind(grade);
        }
        if let Some(category_id) = filter.category_id {
            data_query = data_query.bind(category_id).bind(category_id);
        }
        if let Some(class_id) = filter.class_id {
            data_query = data_query.bind(class_id);
        }
        if let Some(pattern) = &keyword_pattern {
            data_query = data_query.bind(pattern).bind(pattern);
        }
        let rows = data_query
            .bind(size)
            .bind((page - 1) * size)
            .fetch_all(&*self.pool)
            .await?;

        Ok(ItemPage {
            contents: rows.iter().map(row_to_item).collect(),
            pagination: Pagination::new(page, size, total),
        })
    }

    /// Items stored under a top-level category or any of its sub-categories,
    /// in id order. The details phase walks this list.
    pub async fn get_items_in_category(&self, category_id: i64) -> Result<Vec<Item>> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE category_id = ? OR category_id IN \
             (SELECT id FROM categories WHERE parent_id = ?) ORDER BY id ASC"
        ))
        .bind(category_id)
        .bind(category_id)
        .fetch_all(&*self.pool)
        .await?;
        Ok(rows.iter().map(row_to_item).collect())
    }

    /// Items stored under exactly one sub-category (no parent expansion).
    pub async fn get_items_in_subcategory(&self, category_id: i64) -> Result<Vec<Item>> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE category_id = ? ORDER BY id ASC"
        ))
        .bind(category_id)
        .fetch_all(&*self.pool)
        .await?;
        Ok(rows.iter().map(row_to_item).collect())
    }

    pub async fn count_items(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM items")
            .fetch_one(&*self.pool)
            .await?)
    }

    pub async fn count_item_stats(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM item_stats")
            .fetch_one(&*self.pool)
            .await?)
    }

    // ===============================
    // LOOKUP TABLES
    // ===============================

    pub async fn upsert_grades(&self, grades: &[Grade]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for grade in grades {
            sqlx::query(
                "INSERT OR REPLACE INTO grades (id, name, name_localized, sort_order) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(grade.id)
            .bind(&grade.name)
            .bind(&grade.name_localized)
            .bind(grade.sort_order)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn upsert_classes(&self, classes: &[ClassInfo]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for class in classes {
            sqlx::query(
                "INSERT OR REPLACE INTO classes (id, name, name_localized) VALUES (?, ?, ?)",
            )
            .bind(class.id)
            .bind(&class.name)
            .bind(&class.name_localized)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn upsert_categories(&self, categories: &[Category]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for category in categories {
            sqlx::query(
                "INSERT OR REPLACE INTO categories \
                 (id, name, name_localized, parent_id, batch_index) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(category.id)
            .bind(&category.name)
            .bind(&category.name_localized)
            .bind(category.parent_id)
            .bind(category.batch_index)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_grades(&self) -> Result<Vec<Grade>> {
        let rows = sqlx::query(
            "SELECT id, name, name_localized, sort_order FROM grades ORDER BY sort_order ASC",
        )
        .fetch_all(&*self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| Grade {
                id: r.get("id"),
                name: r.get("name"),
                name_localized: r.get("name_localized"),
                sort_order: r.get("sort_order"),
            })
            .collect())
    }

    pub async fn get_classes(&self) -> Result<Vec<ClassInfo>> {
        let rows = sqlx::query("SELECT id, name, name_localized FROM classes ORDER BY id ASC")
            .fetch_all(&*self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| ClassInfo {
                id: r.get("id"),
                name: r.get("name"),
                name_localized: r.get("name_localized"),
            })
            .collect())
    }

    pub async fn get_all_categories(&self) -> Result<Vec<Category>> {
        let rows = sqlx::query(
            "SELECT id, name, name_localized, parent_id, batch_index FROM categories \
             ORDER BY batch_index ASC, id ASC",
        )
        .fetch_all(&*self.pool)
        .await?;
        Ok(rows.iter().map(row_to_category).collect())
    }

    /// Top-level categories in batch order. This is the details-sync schedule
    /// order; the scheduler re-reads it instead of caching it.
    pub async fn get_top_categories(&self) -> Result<Vec<Category>> {
        let rows = sqlx::query(
            "SELECT id, name, name_localized, parent_id, batch_index FROM categories \
             WHERE parent_id IS NULL ORDER BY batch_index ASC, id ASC",
        )
        .fetch_all(&*self.pool)
        .await?;
        Ok(rows.iter().map(row_to_category).collect())
    }

    pub async fn get_category(&self, id: i64) -> Result<Option<Category>> {
        let row = sqlx::query(
            "SELECT id, name, name_localized, parent_id, batch_index FROM categories WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_category))
    }

    pub async fn get_categories_with_children(&self) -> Result<Vec<CategoryWithChildren>> {
        let all = self.get_all_categories().await?;
        let (tops, subs): (Vec<_>, Vec<_>) = all.into_iter().partition(|c| c.parent_id.is_none());
        Ok(tops
            .into_iter()
            .map(|top| {
                let children = subs
                    .iter()
                    .filter(|s| s.parent_id == Some(top.id))
                    .cloned()
                    .collect();
                CategoryWithChildren { category: top, children }
            })
            .collect())
    }
}

const ITEM_COLUMNS: &str = "id, name, name_original, image, grade_id, category_id, level, \
     equip_level, tradable, enchantable, max_enchant_level, max_exceed_level, item_type, \
     classes, options, sources, raw, raw_original, created_at, updated_at";

const ITEM_COLUMNS_QUALIFIED: &str =
    "i.id, i.name, i.name_original, i.image, i.grade_id, i.category_id, i.level, \
     i.equip_level, i.tradable, i.enchantable, i.max_enchant_level, i.max_exceed_level, \
     i.item_type, i.classes, i.options, i.sources, i.raw, i.raw_original, i.created_at, \
     i.updated_at";

fn row_to_item(row: &sqlx::sqlite::SqliteRow) -> Item {
    Item {
        id: row.get("id"),
        name: row.get("name"),
        name_original: row.get("name_original"),
        image: row.get("image"),
        grade_id: row.get("grade_id"),
        category_id: row.get("category_id"),
        level: row.get("level"),
        equip_level: row.get("equip_level"),
        tradable: row.get("tradable"),
        enchantable: row.get("enchantable"),
        max_enchant_level: row.get("max_enchant_level"),
        max_exceed_level: row.get("max_exceed_level"),
        item_type: row.get("item_type"),
        classes: row.get("classes"),
        options: row.get("options"),
        sources: row.get("sources"),
        raw: row.get("raw"),
        raw_original: row.get("raw_original"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_snapshot(row: &sqlx::sqlite::SqliteRow) -> ItemStatSnapshot {
    ItemStatSnapshot {
        item_id: row.get("item_id"),
        enchant_level: row.get("enchant_level"),
        exceed_level: row.get("exceed_level"),
        main_stats: row.get("main_stats"),
        sub_stats: row.get("sub_stats"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_category(row: &sqlx::sqlite::SqliteRow) -> Category {
    Category {
        id: row.get("id"),
        name: row.get("name"),
        name_localized: row.get("name_localized"),
        parent_id: row.get("parent_id"),
        batch_index: row.get("batch_index"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database_connection::DatabaseConnection;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_repo() -> CatalogRepository {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        DatabaseConnection::from_pool(pool.clone())
            .migrate()
            .await
            .unwrap();
        CatalogRepository::new(pool)
    }

    fn item_named(id: i64, name: &str, category_id: Option<i64>) -> Item {
        let mut item = Item::from_listing(id);
        item.name = Some(name.to_string());
        item.name_original = Some(name.to_string());
        item.category_id = category_id;
        item
    }

    async fn seed_categories(repo: &CatalogRepository) {
        repo.upsert_categories(&[
            Category {
                id: 1,
                name: "weapon".into(),
                name_localized: "weapon".into(),
                parent_id: None,
                batch_index: 0,
            },
            Category {
                id: 11,
                name: "sword".into(),
                name_localized: "sword".into(),
                parent_id: Some(1),
                batch_index: 0,
            },
            Category {
                id: 12,
                name: "bow".into(),
                name_localized: "bow".into(),
                parent_id: Some(1),
                batch_index: 0,
            },
            Category {
                id: 2,
                name: "material".into(),
                name_localized: "material".into(),
                parent_id: None,
                batch_index: 1,
            },
        ])
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn upsert_items_is_idempotent() {
        let repo = test_repo().await;
        let items = vec![item_named(1, "Iron Sword", None), item_named(2, "Oak Bow", None)];

        repo.upsert_items(&items).await.unwrap();
        repo.upsert_items(&items).await.unwrap();

        assert_eq!(repo.count_items().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn partial_list_upsert_keeps_detail_columns() {
        let repo = test_repo().await;
        let mut detailed = item_named(7, "Flame Staff", Some(11));
        detailed.enchantable = Some(true);
        detailed.max_enchant_level = Some(15);
        detailed.raw = Some("{\"id\":7}".into());
        repo.upsert_item_detail(&detailed).await.unwrap();

        // A later list pass re-supplies only summary fields.
        repo.upsert_items(&[item_named(7, "Flame Staff", Some(11))])
            .await
            .unwrap();

        let stored = repo.get_item_by_id(7).await.unwrap().unwrap();
        assert_eq!(stored.max_enchant_level, Some(15));
        assert_eq!(stored.raw.as_deref(), Some("{\"id\":7}"));
    }

    #[tokio::test]
    async fn stats_upsert_replaces_by_composite_key() {
        let repo = test_repo().await;
        repo.upsert_item_stats(1, 5, 0, "[1]", "[]").await.unwrap();
        repo.upsert_item_stats(1, 5, 0, "[2]", "[]").await.unwrap();

        let all = repo.get_item_all_stats(1).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].main_stats, "[2]");
    }

    #[tokio::test]
    async fn pagination_reports_ceiling_last_page() {
        let repo = test_repo().await;
        let items: Vec<Item> = (1..=5).map(|i| item_named(i, "thing", None)).collect();
        repo.upsert_items(&items).await.unwrap();

        let page = repo
            .query_items(&ItemFilter { page: 1, size: 2, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(page.pagination.total, 5);
        assert_eq!(page.pagination.last_page, 3);
        assert!(page.contents.len() <= 2);

        let empty = repo
            .query_items(&ItemFilter {
                page: 1,
                size: 2,
                keyword: Some("no-such-item".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(empty.pagination.total, 0);
        assert_eq!(empty.pagination.last_page, 1);
    }

    #[tokio::test]
    async fn top_category_filter_includes_children() {
        let repo = test_repo().await;
        seed_categories(&repo).await;
        repo.upsert_items(&[
            item_named(1, "a", Some(11)),
            item_named(2, "b", Some(12)),
            item_named(3, "c", Some(2)),
        ])
        .await
        .unwrap();

        let by_parent = repo
            .query_items(&ItemFilter {
                page: 1,
                size: 10,
                category_id: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_parent.pagination.total, 2);

        let by_sub = repo
            .query_items(&ItemFilter {
                page: 1,
                size: 10,
                category_id: Some(11),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_sub.pagination.total, 1);
        assert_eq!(by_sub.contents[0].id, 1);
    }

    #[tokio::test]
    async fn class_filter_matches_serialized_array() {
        let repo = test_repo().await;
        let mut item = item_named(1, "a", None);
        item.classes = Some("[3,7]".into());
        repo.upsert_item_detail(&item).await.unwrap();
        repo.upsert_items(&[item_named(2, "b", None)]).await.unwrap();

        let hits = repo
            .query_items(&ItemFilter { page: 1, size: 10, class_id: Some(7), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(hits.pagination.total, 1);
        assert_eq!(hits.contents[0].id, 1);
    }

    #[tokio::test]
    async fn keyword_matches_either_name_column() {
        let repo = test_repo().await;
        let mut item = item_named(1, "iron sword", None);
        item.name_original = Some("鐵劍".into());
        repo.upsert_items(&[item]).await.unwrap();

        for keyword in ["iron", "鐵"] {
            let hits = repo
                .query_items(&ItemFilter {
                    page: 1,
                    size: 10,
                    keyword: Some(keyword.into()),
                    ..Default::default()
                })
                .await
                .unwrap();
            assert_eq!(hits.pagination.total, 1, "keyword {keyword}");
        }
    }

    #[tokio::test]
    async fn categories_nest_one_level() {
        let repo = test_repo().await;
        seed_categories(&repo).await;

        let nested = repo.get_categories_with_children().await.unwrap();
        assert_eq!(nested.len(), 2);
        assert_eq!(nested[0].category.id, 1);
        assert_eq!(nested[0].children.len(), 2);
        assert!(nested[1].children.is_empty());
    }
}
