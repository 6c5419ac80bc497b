use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One catalog entry, keyed by the upstream's numeric item id.
///
/// List-sync creates rows with only the summary columns filled; details-sync
/// enriches them in place. `raw`/`raw_original` keep the verbatim upstream
/// payload (localized and original) so new upstream fields survive without a
/// schema migration. They are opaque JSON text and are never parsed back into
/// the typed columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: i64,
    pub name: Option<String>,
    #[serde(rename = "nameOriginal")]
    pub name_original: Option<String>,
    pub image: Option<String>,
    #[serde(rename = "gradeId")]
    pub grade_id: Option<i64>,
    #[serde(rename = "categoryId")]
    pub category_id: Option<i64>,
    pub level: Option<i64>,
    #[serde(rename = "equipLevel")]
    pub equip_level: Option<i64>,
    pub tradable: Option<bool>,
    pub enchantable: Option<bool>,
    #[serde(rename = "maxEnchantLevel")]
    pub max_enchant_level: Option<i64>,
    #[serde(rename = "maxExceedLevel")]
    pub max_exceed_level: Option<i64>,
    #[serde(rename = "type")]
    pub item_type: Option<String>,
    /// JSON-serialized array of applicable class ids.
    pub classes: Option<String>,
    /// JSON-serialized array of option descriptors.
    pub options: Option<String>,
    /// JSON-serialized array of drop/craft sources.
    pub sources: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    #[serde(skip)]
    pub raw_original: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl Item {
    /// Minimal record as produced by the list-sync path. Detail columns stay
    /// `None` and the partial upsert leaves their stored values untouched.
    pub fn from_listing(id: i64) -> Self {
        Self {
            id,
            name: None,
            name_original: None,
            image: None,
            grade_id: None,
            category_id: None,
            level: None,
            equip_level: None,
            tradable: None,
            enchantable: None,
            max_enchant_level: None,
            max_exceed_level: None,
            item_type: None,
            classes: None,
            options: None,
            sources: None,
            raw: None,
            raw_original: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

/// Stat block for one item frozen at one (enchant, exceed) level pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemStatSnapshot {
    #[serde(rename = "itemId")]
    pub item_id: i64,
    #[serde(rename = "enchantLevel")]
    pub enchant_level: i64,
    #[serde(rename = "exceedLevel")]
    pub exceed_level: i64,
    /// JSON-serialized main-stat list.
    #[serde(rename = "mainStats")]
    pub main_stats: String,
    /// JSON-serialized sub-stat list.
    #[serde(rename = "subStats")]
    pub sub_stats: String,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

/// Item quality tier. `sort_order` is the gameplay ordering (1 = lowest) and
/// is distinct from the upstream id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grade {
    pub id: i64,
    pub name: String,
    #[serde(rename = "nameLocalized")]
    pub name_localized: String,
    #[serde(rename = "sortOrder")]
    pub sort_order: i64,
}

/// Playable class, used only as an item filter axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassInfo {
    pub id: i64,
    pub name: String,
    #[serde(rename = "nameLocalized")]
    pub name_localized: String,
}

/// Item category. Two-level hierarchy: a top-level category has
/// `parent_id = None`, a sub-category points at its parent. `batch_index`
/// orders top-level categories for details-sync scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    #[serde(rename = "nameLocalized")]
    pub name_localized: String,
    #[serde(rename = "parentId")]
    pub parent_id: Option<i64>,
    #[serde(rename = "batchIndex")]
    pub batch_index: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryWithChildren {
    #[serde(flatten)]
    pub category: Category,
    pub children: Vec<Category>,
}

/// Optional, AND-combined filter predicates for the item listing.
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    pub page: i64,
    pub size: i64,
    pub grade: Option<i64>,
    pub category_id: Option<i64>,
    pub class_id: Option<i64>,
    pub keyword: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    pub page: i64,
    pub size: i64,
    pub total: i64,
    #[serde(rename = "lastPage")]
    pub last_page: i64,
}

impl Pagination {
    pub fn new(page: i64, size: i64, total: i64) -> Self {
        let size = size.max(1);
        let last_page = ((total + size - 1) / size).max(1);
        Self { page, size, total, last_page }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemPage {
    pub contents: Vec<Item>,
    pub pagination: Pagination,
}

/// Full detail response: the item, the stats resolved for the requested
/// combined level, and every level synced so far (client-side slider hints).
#[derive(Debug, Clone, Serialize)]
pub struct ItemDetail {
    #[serde(flatten)]
    pub item: Item,
    pub stats: ItemStatSnapshot,
    #[serde(rename = "availableStats")]
    pub available_stats: Vec<ItemStatSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilterOptions {
    pub grades: Vec<Grade>,
    pub classes: Vec<ClassInfo>,
    pub categories: Vec<CategoryWithChildren>,
}

/// Split a user-facing combined enchant level into the stored
/// (enchant, exceed) pair: enchant caps at the item's max, the remainder is
/// exceed progress.
pub fn split_combined_level(combined: i64, max_enchant: i64) -> (i64, i64) {
    let enchant = combined.min(max_enchant).max(0);
    let exceed = (combined - max_enchant).max(0);
    (enchant, exceed)
}
