//! Device-scoped HTTP handlers: register, status, heartbeat, config
//! read/write, mqtt-credentials.

use axum::extract::{Extension, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use crate::cache::LivenessStatus;
use crate::error::{AppError, AppResult};
use crate::models::{AdminStatus, ConfigPatch, Device, RegisterOutcome, RegisterProfile};
use crate::web::state::AppState;

#[derive(Serialize)]
struct RegisteredBody {
    id: i64,
    name: String,
    api_key: String,
    status: AdminStatus,
    created_at: chrono::DateTime<Utc>,
}

pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(profile): Json<RegisterProfile>,
) -> Response {
    match state.auth.register(&profile).await {
        Ok(RegisterOutcome::Registered { device }) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "device": RegisteredBody {
                    id: device.id,
                    name: device.name,
                    api_key: device.api_key,
                    status: device.admin_status,
                    created_at: device.created_at,
                }
            })),
        )
            .into_response(),
        Ok(RegisterOutcome::NameTaken { existing_id }) => {
            AppError::Conflict { existing_id }.into_response()
        }
        Err(err) => AppError::Internal(err).into_response(),
    }
}

#[derive(Serialize)]
struct StatusBody {
    id: i64,
    name: String,
    is_online: bool,
    last_seen: Option<chrono::DateTime<Utc>>,
    status: AdminStatus,
    status_source: &'static str,
}

pub async fn status(
    State(state): State<Arc<AppState>>,
    Extension(device): Extension<Device>,
) -> AppResult<Json<StatusBody>> {
    let (is_online, last_seen, status_source) = match state.cache.get_status(device.id).await {
        Ok(LivenessStatus::Online) => {
            let seen = state
                .cache
                .get_last_seen(device.id)
                .await
                .unwrap_or_else(|err| {
                    tracing::warn!(error = %err, device_id = device.id, "liveness cache get_last_seen failed, falling back to store");
                    None
                })
                .or(device.last_seen);
            (true, seen, "cache")
        }
        Ok(LivenessStatus::Offline) => {
            // Cache-miss-equivalent for the in-process/redis double: fall
            // back to the store's own last_seen column.
            let online = device
                .last_seen
                .map(|seen| Utc::now() - seen < state.settings.heartbeat_ttl_chrono())
                .unwrap_or(false);
            (online, device.last_seen, "store")
        }
        Err(err) => {
            tracing::warn!(error = %err, device_id = device.id, "liveness cache get_status failed, falling back to store");
            (false, device.last_seen, "store")
        }
    };

    Ok(Json(StatusBody {
        id: device.id,
        name: device.name,
        is_online,
        last_seen,
        status: device.admin_status,
        status_source,
    }))
}

#[derive(Serialize)]
struct HeartbeatBody {
    ok: bool,
    last_seen: chrono::DateTime<Utc>,
}

pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Extension(device): Extension<Device>,
) -> AppResult<Json<HeartbeatBody>> {
    if state.auth.authorize_heartbeat(&device) == crate::auth::TelemetryAuthorization::DeviceSuspended {
        return Err(AppError::AuthFailed);
    }

    let now = Utc::now();
    state
        .cache
        .set_online(device.id, now, state.settings.heartbeat_ttl)
        .await
        .unwrap_or_else(|err| tracing::warn!(error = %err, "heartbeat cache update failed, continuing"));
    state
        .store
        .touch_last_seen(device.id, now)
        .await
        .map_err(AppError::Internal)?;

    Ok(Json(HeartbeatBody { ok: true, last_seen: now }))
}

pub async fn get_config(Extension(device): Extension<Device>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "location": device.location,
        "firmware_version": device.firmware_version,
        "description": device.description,
    }))
}

pub async fn put_config(
    State(state): State<Arc<AppState>>,
    Extension(device): Extension<Device>,
    Json(patch): Json<ConfigPatch>,
) -> AppResult<StatusCode> {
    state
        .store
        .update_config(device.id, &patch)
        .await
        .map_err(AppError::Internal)?;
    Ok(StatusCode::OK)
}

#[derive(Serialize)]
struct MqttCredentialsBody {
    broker_host: String,
    broker_port: u16,
    username: String,
    password: String,
}

pub async fn mqtt_credentials(
    State(state): State<Arc<AppState>>,
    Extension(device): Extension<Device>,
) -> Json<MqttCredentialsBody> {
    Json(MqttCredentialsBody {
        broker_host: state.settings.mqtt_host.clone(),
        broker_port: state.settings.mqtt_port,
        username: device.name.clone(),
        password: device.api_key.clone(),
    })
}
