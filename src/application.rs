//! Application layer: sync pipeline, scheduling and the read-side service.

pub mod ingest;
pub mod query_service;
pub mod scheduler;
pub mod sync_engine;

pub use query_service::QueryService;
pub use scheduler::Scheduler;
pub use sync_engine::{SyncBusy, SyncConfig, SyncEngine};
