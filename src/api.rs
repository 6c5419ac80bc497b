//! HTTP surface: read endpoints over the mirrored catalog and control
//! endpoints for the sync pipeline. All handlers are thin; policy lives in
//! the application layer.

use crate::application::{QueryService, SyncBusy, SyncEngine};
use crate::domain::item::ItemFilter;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    pub query: Arc<QueryService>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/list", get(list_items))
        .route("/detail/:id", get(item_detail))
        .route("/filters", get(filter_options))
        .route("/sync/status", get(sync_status))
        .route("/sync/logs", get(sync_logs))
        .route("/sync/start", post(sync_start))
        .route("/sync/stop", post(sync_stop))
        .route("/sync/base", post(sync_base))
        .route("/sync/category/:id", post(sync_category))
        .route("/sync/subcategory/:id", post(sync_subcategory))
        .with_state(state)
}

/// Envelope for control endpoints and error bodies.
#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(e) => {
                error!("Request failed: {e:#}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(ControlResponse { success: false, message: self.to_string() });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        // A refused start is the caller's race, not a server fault.
        if e.downcast_ref::<SyncBusy>().is_some() {
            ApiError::Conflict(e.to_string())
        } else {
            ApiError::Internal(e)
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

fn ok(message: String) -> Json<ControlResponse> {
    Json(ControlResponse { success: true, message })
}

// ===============================
// READ ENDPOINTS
// ===============================

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    #[serde(default)]
    page: i64,
    #[serde(default)]
    size: i64,
    grade: Option<i64>,
    #[serde(rename = "categoryId")]
    category_id: Option<i64>,
    #[serde(rename = "classId")]
    class_id: Option<i64>,
    keyword: Option<String>,
}

async fn list_items(
    State(state): State<AppState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(params) = params?;
    let filter = ItemFilter {
        page: params.page,
        size: params.size,
        grade: params.grade,
        category_id: params.category_id,
        class_id: params.class_id,
        keyword: params.keyword.filter(|k| !k.trim().is_empty()),
    };
    let page = state.query.list_items(&filter).await?;
    Ok(Json(page))
}

#[derive(Debug, Default, Deserialize)]
struct DetailParams {
    #[serde(default)]
    level: i64,
}

async fn item_detail(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    params: Result<Query<DetailParams>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(params) = params?;
    let detail = state
        .query
        .get_item_detail(id, params.level)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(detail))
}

async fn filter_options(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.query.list_filter_options().await?))
}

// ===============================
// CONTROL ENDPOINTS
// ===============================

async fn sync_status(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.status().await?))
}

#[derive(Debug, Default, Deserialize)]
struct LogParams {
    #[serde(default = "default_log_limit")]
    limit: i64,
}

fn default_log_limit() -> i64 {
    50
}

async fn sync_logs(
    State(state): State<AppState>,
    params: Result<Query<LogParams>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(params) = params?;
    Ok(Json(state.query.recent_logs(params.limit).await?))
}

#[derive(Debug, Default, Deserialize)]
struct StartParams {
    #[serde(default)]
    force: bool,
}

async fn sync_start(
    State(state): State<AppState>,
    params: Result<Query<StartParams>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(params) = params?;
    let message = state.engine.start_sync(params.force).await?;
    Ok(ok(message))
}

async fn sync_stop(State(state): State<AppState>) -> impl IntoResponse {
    ok(state.engine.stop_sync().await)
}

async fn sync_base(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let message = state.engine.run_base_sync().await?;
    Ok(ok(message))
}

async fn sync_category(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    if id < 1 {
        return Err(ApiError::BadRequest(format!("invalid category id {id}")));
    }
    let message = state.engine.sync_category_now(id).await?;
    Ok(ok(message))
}

async fn sync_subcategory(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    if id < 1 {
        return Err(ApiError::BadRequest(format!("invalid category id {id}")));
    }
    let message = state.engine.start_subcategory_sync(id).await?;
    Ok(ok(message))
}
