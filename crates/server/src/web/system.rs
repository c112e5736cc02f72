//! System handlers: `/health`.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

use crate::web::state::AppState;

#[derive(Deserialize)]
pub struct HealthQuery {
    #[serde(default)]
    pub detailed: bool,
}

pub async fn health(State(state): State<Arc<AppState>>, Query(params): Query<HealthQuery>) -> Response {
    let report = state.health.report(params.detailed).await;
    let status = match report.status {
        "down" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, Json(report)).into_response()
}
