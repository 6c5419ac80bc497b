//! Infrastructure layer: database access, upstream HTTP transport and the
//! localization walker.

pub mod catalog_repository;
pub mod database_connection;
pub mod http_client;
pub mod localization;
pub mod sync_repository;
pub mod upstream;

pub use catalog_repository::CatalogRepository;
pub use database_connection::DatabaseConnection;
pub use http_client::{HttpClientConfig, PacedClient};
pub use localization::{Localizer, StringTransform};
pub use sync_repository::SyncRepository;
pub use upstream::{CatalogUpstream, HttpUpstream};
