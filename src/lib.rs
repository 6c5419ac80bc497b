//! item-mirror: a local, queryable mirror of an MMORPG item catalog.
//!
//! The sync pipeline pulls the upstream API in three phases (base lookup
//! tables, the paged item list, per-category item details with per-level stat
//! snapshots) into SQLite, politely paced and resumable after interruption.
//! The HTTP API serves the mirrored data and controls the pipeline.

pub mod api;
pub mod application;
pub mod domain;
pub mod infrastructure;
