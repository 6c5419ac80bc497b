//! Mapping from raw upstream JSON into domain rows, shared by the bulk sync
//! engine and the query-time backfill path so both produce identical stored
//! shapes.

use crate::domain::item::{Category, ClassInfo, Grade, Item};
use crate::infrastructure::{CatalogRepository, Localizer};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;

fn text(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(str::to_string)
}

fn int(v: &Value, key: &str) -> Option<i64> {
    v.get(key).and_then(Value::as_i64)
}

/// Upstream flags arrive as booleans or 0/1 depending on the endpoint.
fn flag(v: &Value, key: &str) -> Option<bool> {
    match v.get(key) {
        Some(Value::Bool(b)) => Some(*b),
        Some(Value::Number(n)) => n.as_i64().map(|n| n != 0),
        _ => None,
    }
}

fn array_text(v: &Value, key: &str) -> Option<String> {
    v.get(key).filter(|f| f.is_array()).map(Value::to_string)
}

pub fn grades_from_json(value: &Value, localizer: &Localizer) -> Result<Vec<Grade>> {
    let rows = value.as_array().ok_or_else(|| anyhow!("grades payload is not an array"))?;
    rows.iter()
        .map(|row| {
            let name = text(row, "name").ok_or_else(|| anyhow!("grade without a name"))?;
            Ok(Grade {
                id: int(row, "id").ok_or_else(|| anyhow!("grade without an id"))?,
                name_localized: localizer.text(&name),
                name,
                sort_order: int(row, "sortOrder").unwrap_or(0),
            })
        })
        .collect()
}

pub fn classes_from_json(value: &Value, localizer: &Localizer) -> Result<Vec<ClassInfo>> {
    let rows = value.as_array().ok_or_else(|| anyhow!("classes payload is not an array"))?;
    rows.iter()
        .map(|row| {
            let name = text(row, "name").ok_or_else(|| anyhow!("class without a name"))?;
            Ok(ClassInfo {
                id: int(row, "id").ok_or_else(|| anyhow!("class without an id"))?,
                name_localized: localizer.text(&name),
                name,
            })
        })
        .collect()
}

/// Flatten the two-level category tree. Batch order comes from the upstream
/// `batchIndex` when present, otherwise from array position; the fetch order
/// is what establishes the details-sync schedule.
pub fn categories_from_json(value: &Value, localizer: &Localizer) -> Result<Vec<Category>> {
    let rows = value.as_array().ok_or_else(|| anyhow!("categories payload is not an array"))?;
    let mut out = Vec::new();
    for (position, row) in rows.iter().enumerate() {
        let id = int(row, "id").ok_or_else(|| anyhow!("category without an id"))?;
        let name = text(row, "name").ok_or_else(|| anyhow!("category without a name"))?;
        let batch_index = int(row, "batchIndex").unwrap_or(position as i64);
        out.push(Category {
            id,
            name_localized: localizer.text(&name),
            name,
            parent_id: None,
            batch_index,
        });
        if let Some(children) = row.get("children").and_then(Value::as_array) {
            for child in children {
                let child_name =
                    text(child, "name").ok_or_else(|| anyhow!("sub-category without a name"))?;
                out.push(Category {
                    id: int(child, "id").ok_or_else(|| anyhow!("sub-category without an id"))?,
                    name_localized: localizer.text(&child_name),
                    name: child_name,
                    parent_id: Some(id),
                    batch_index,
                });
            }
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy)]
pub struct PageInfo {
    pub last_page: i64,
    pub total: i64,
}

pub fn page_info(value: &Value) -> Result<PageInfo> {
    let pagination = value.get("pagination").ok_or_else(|| anyhow!("page without pagination"))?;
    Ok(PageInfo {
        last_page: int(pagination, "lastPage").unwrap_or(1).max(1),
        total: int(pagination, "total").unwrap_or(0),
    })
}

/// Display-name lookup for list entries (the list endpoint carries grade and
/// category as free-text names, not ids).
pub struct NameIndex {
    categories: HashMap<String, i64>,
    grades: HashMap<String, i64>,
}

impl NameIndex {
    pub async fn load(store: &CatalogRepository) -> Result<Self> {
        let categories = store
            .get_all_categories()
            .await?
            .into_iter()
            .map(|c| (c.name.clone(), c.id))
            .collect();
        let grades = store
            .get_grades()
            .await?
            .into_iter()
            .map(|g| (g.name.clone(), g.id))
            .collect();
        Ok(Self { categories, grades })
    }

    pub fn category(&self, name: &str) -> Option<i64> {
        self.categories.get(name).copied()
    }

    pub fn grade(&self, name: &str) -> Option<i64> {
        self.grades.get(name).copied()
    }
}

/// Map one list page into minimal item rows. Entries whose category name
/// matches nothing stay with a null category rather than being dropped; the
/// unmatched names are returned for operator-visible logging.
pub fn items_from_list_page(
    value: &Value,
    names: &NameIndex,
    localizer: &Localizer,
) -> Result<(Vec<Item>, Vec<String>)> {
    let entries = value
        .get("contents")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("item page without contents"))?;

    let mut items = Vec::with_capacity(entries.len());
    let mut unmatched = Vec::new();
    for entry in entries {
        let id = int(entry, "id").ok_or_else(|| anyhow!("list entry without an id"))?;
        let mut item = Item::from_listing(id);
        if let Some(name) = text(entry, "name") {
            item.name = Some(localizer.text(&name));
            item.name_original = Some(name);
        }
        item.image = text(entry, "image");
        item.level = int(entry, "level");
        item.equip_level = int(entry, "equipLevel");
        if let Some(category_name) = text(entry, "category") {
            item.category_id = names.category(&category_name);
            if item.category_id.is_none() {
                unmatched.push(category_name);
            }
        }
        if let Some(grade_name) = text(entry, "grade") {
            item.grade_id = names.grade(&grade_name);
            if item.grade_id.is_none() {
                unmatched.push(grade_name);
            }
        }
        items.push(item);
    }
    Ok((items, unmatched))
}

/// Map a detail payload into a fully enriched item row. The verbatim payload
/// is kept in both scripts; the detail endpoint supplies proper ids for grade
/// and category, so no name matching happens here.
pub fn item_from_detail(item_id: i64, raw: &Value, localizer: &Localizer) -> Item {
    let localized = localizer.localize(raw);
    let now = Utc::now();
    Item {
        id: item_id,
        name: text(&localized, "name"),
        name_original: text(raw, "name"),
        image: text(raw, "image"),
        grade_id: int(raw, "gradeId"),
        category_id: int(raw, "categoryId"),
        level: int(raw, "level"),
        equip_level: int(raw, "equipLevel"),
        tradable: flag(raw, "tradable"),
        enchantable: flag(raw, "enchantable"),
        max_enchant_level: int(raw, "maxEnchantLevel"),
        max_exceed_level: int(raw, "maxExceedLevel"),
        item_type: text(raw, "type"),
        classes: array_text(raw, "classes"),
        options: array_text(&localized, "options"),
        sources: array_text(&localized, "sources"),
        raw: Some(localized.to_string()),
        raw_original: Some(raw.to_string()),
        created_at: now,
        updated_at: now,
    }
}

/// Serialized (main, sub) stat lists for one detail payload.
pub fn stats_from_detail(raw: &Value, localizer: &Localizer) -> (String, String) {
    let main = raw
        .get("mainStats")
        .map(|v| localizer.localize(v).to_string())
        .unwrap_or_else(|| "[]".to_string());
    let sub = raw
        .get("subStats")
        .map(|v| localizer.localize(v).to_string())
        .unwrap_or_else(|| "[]".to_string());
    (main, sub)
}

/// Persist a full detail payload: enriched item row plus the stat snapshot
/// for the given (enchant, exceed) pair. Both the bulk details phase and the
/// on-demand backfill converge here.
pub async fn persist_detail(
    store: &CatalogRepository,
    localizer: &Localizer,
    item_id: i64,
    enchant_level: i64,
    exceed_level: i64,
    raw: &Value,
) -> Result<Item> {
    let item = item_from_detail(item_id, raw, localizer);
    store
        .upsert_item_detail(&item)
        .await
        .with_context(|| format!("persisting item {item_id}"))?;
    persist_stats(store, localizer, item_id, enchant_level, exceed_level, raw).await?;
    Ok(item)
}

/// Persist only the stat snapshot from a detail payload (used for the
/// per-level walk where the item row is already enriched).
pub async fn persist_stats(
    store: &CatalogRepository,
    localizer: &Localizer,
    item_id: i64,
    enchant_level: i64,
    exceed_level: i64,
    raw: &Value,
) -> Result<()> {
    let (main_stats, sub_stats) = stats_from_detail(raw, localizer);
    store
        .upsert_item_stats(item_id, enchant_level, exceed_level, &main_stats, &sub_stats)
        .await
        .with_context(|| {
            format!("persisting stats for item {item_id} at +{enchant_level}/{exceed_level}")
        })
}
