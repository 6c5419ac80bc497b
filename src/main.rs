use anyhow::{Context, Result};
use item_mirror::api::{self, AppState};
use item_mirror::application::{QueryService, SyncConfig, SyncEngine};
use item_mirror::infrastructure::{
    CatalogRepository, DatabaseConnection, HttpClientConfig, HttpUpstream, Localizer, PacedClient,
    SyncRepository,
};
use std::env;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let database_path =
        env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/item-mirror.db".to_string());
    let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8750".to_string());
    let base_url = env::var("UPSTREAM_BASE_URL")
        .context("UPSTREAM_BASE_URL must point at the catalog API")?;
    let locale = env::var("UPSTREAM_LOCALE").unwrap_or_else(|_| "zh-TW".to_string());

    let db = DatabaseConnection::new(&database_path).await?;
    db.migrate().await?;
    info!("Database ready at {database_path}");

    let store = CatalogRepository::new(db.pool().clone());
    let sync = SyncRepository::new(db.pool().clone());
    let client = PacedClient::new(HttpClientConfig::default())?;
    let upstream = Arc::new(HttpUpstream::new(client, base_url, locale));
    let localizer = Localizer::identity();

    let engine = Arc::new(SyncEngine::new(
        store.clone(),
        sync.clone(),
        upstream.clone(),
        localizer.clone(),
        SyncConfig::default(),
    ));
    engine.reconcile_on_startup().await?;

    let query = Arc::new(QueryService::new(store, sync, upstream, localizer));

    let app = api::router(AppState { engine, query });
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {bind_addr}"))?;
    info!("🚀 Serving on http://{bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;
    Ok(())
}
