//! Domain module - entities and value types for the item catalog mirror.
//!
//! Modern Rust module organization (Rust 2018+ style):
//! - Each module is its own file in the domain/ directory
//! - Public exports are defined here for convenience

pub mod item;
pub mod sync;

pub use item::{
    Category, CategoryWithChildren, ClassInfo, FilterOptions, Grade, Item, ItemDetail, ItemFilter,
    ItemPage, ItemStatSnapshot, Pagination, split_combined_level,
};
pub use sync::{
    DetailsReport, ScheduleEntry, SyncLogEntry, SyncPhase, SyncProgress, SyncStatus,
    SyncStatusReport,
};
