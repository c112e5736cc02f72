//! Admin HTTP handlers: list, get-by-id, update, delete, status-patch,
//! stats, cache inspection and flush. Gated by the `admin_auth`
//! middleware layer, not by per-handler checks.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::credential_store::{DeviceFilter, Page};
use crate::error::{AppError, AppResult};
use crate::models::{AdminStatus, ConfigPatch, Device};
use crate::web::state::AppState;

#[derive(Deserialize)]
pub struct ListQuery {
    pub admin_status: Option<String>,
    pub device_type: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListQuery>,
) -> AppResult<Json<Vec<Device>>> {
    let filter = DeviceFilter {
        admin_status: params.admin_status.as_deref().and_then(AdminStatus::parse),
        device_type: params.device_type.clone(),
    };
    let page = Page { limit: params.limit, offset: params.offset };

    let devices = state.store.list(&filter, page).await.map_err(AppError::Internal)?;
    Ok(Json(devices))
}

pub async fn get(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> AppResult<Json<Device>> {
    let device = state
        .store
        .get_by_id(id)
        .await
        .map_err(AppError::Internal)?
        .ok_or_else(|| AppError::NotFound(format!("device {id}")))?;
    Ok(Json(device))
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(patch): Json<ConfigPatch>,
) -> AppResult<StatusCode> {
    let updated = state.store.update_config(id, &patch).await.map_err(AppError::Internal)?;
    if !updated {
        return Err(AppError::NotFound(format!("device {id}")));
    }
    Ok(StatusCode::OK)
}

pub async fn delete(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> AppResult<StatusCode> {
    let deleted = state.store.delete(id).await.map_err(AppError::Internal)?;
    if !deleted {
        return Err(AppError::NotFound(format!("device {id}")));
    }

    if let Err(err) = state.timeseries.delete_device(id).await {
        tracing::warn!(error = %err, device_id = id, "best-effort time-series cleanup failed after device delete");
    }
    if let Err(err) = state.cache.clear_status(id).await {
        tracing::warn!(error = %err, device_id = id, "best-effort liveness cache cleanup failed after device delete");
    }

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct StatusPatchBody {
    pub status: String,
}

pub async fn status_patch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<StatusPatchBody>,
) -> AppResult<StatusCode> {
    let status = AdminStatus::parse(&body.status)
        .ok_or_else(|| AppError::Validation(format!("unknown admin_status: {}", body.status)))?;

    let updated = state.store.update_status(id, status).await.map_err(AppError::Internal)?;
    if !updated {
        return Err(AppError::NotFound(format!("device {id}")));
    }
    Ok(StatusCode::OK)
}

#[derive(Serialize)]
pub struct RotatedKeyBody {
    pub api_key: String,
}

pub async fn rotate_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> AppResult<Json<RotatedKeyBody>> {
    let api_key = state
        .store
        .rotate_api_key(id)
        .await
        .map_err(AppError::Internal)?
        .ok_or_else(|| AppError::NotFound(format!("device {id}")))?;
    Ok(Json(RotatedKeyBody { api_key }))
}

#[derive(Serialize)]
pub struct StatsBody {
    pub device_count: i64,
    pub online_devices: u64,
}

pub async fn stats(State(state): State<Arc<AppState>>) -> AppResult<Json<StatsBody>> {
    let device_count = state.store.count().await.map_err(AppError::Internal)?;
    let cache_stats = state.cache.stats().await.map_err(AppError::Internal)?;
    Ok(Json(StatsBody { device_count, online_devices: cache_stats.online_devices }))
}

pub async fn cache_inspect(State(state): State<Arc<AppState>>) -> AppResult<Json<serde_json::Value>> {
    let cache_stats = state.cache.stats().await.map_err(AppError::Internal)?;
    Ok(Json(serde_json::json!({ "online_devices": cache_stats.online_devices })))
}

pub async fn cache_flush(State(state): State<Arc<AppState>>) -> AppResult<StatusCode> {
    state.cache.clear_all().await.map_err(AppError::Internal)?;
    Ok(StatusCode::OK)
}
