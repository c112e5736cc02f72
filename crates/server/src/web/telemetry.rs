//! Telemetry HTTP handlers: submit, latest, range, aggregated.

use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{AppError, AppResult};
use crate::models::{Device, IngestOutcome, TelemetryEnvelope};
use crate::timeseries::Aggregate;
use crate::web::state::AppState;

#[derive(Deserialize)]
pub struct SubmitBody {
    pub data: std::collections::HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

pub async fn submit(
    State(state): State<Arc<AppState>>,
    Extension(device): Extension<Device>,
    Json(body): Json<SubmitBody>,
) -> Response {
    let envelope = TelemetryEnvelope {
        device_id: Some(device.id),
        api_key: device.api_key.clone(),
        timestamp: body.timestamp,
        data: body.data,
        metadata: body.metadata,
    };

    match state.pipeline.ingest(envelope).await {
        Ok(IngestOutcome::Accepted) => StatusCode::ACCEPTED.into_response(),
        Ok(IngestOutcome::PartialWrite { rejected }) => {
            AppError::PartialWrite { rejected }.into_response()
        }
        Err(err) => err.into_response(),
    }
}

#[derive(Serialize)]
struct PointBody {
    measurement: String,
    timestamp: DateTime<Utc>,
    value: crate::models::MetricValue,
}

pub async fn latest(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<i64>,
    Query(params): Query<MeasurementQuery>,
) -> AppResult<Json<PointBody>> {
    let point = state
        .timeseries
        .query_latest(device_id, params.measurement.as_deref())
        .await
        .map_err(AppError::Internal)?
        .ok_or_else(|| match &params.measurement {
            Some(measurement) => AppError::NotFound(format!("no data for {measurement}")),
            None => AppError::NotFound(format!("no telemetry for device {device_id}")),
        })?;

    Ok(Json(PointBody { measurement: point.measurement, timestamp: point.timestamp, value: point.value }))
}

#[derive(Deserialize)]
pub struct MeasurementQuery {
    pub measurement: Option<String>,
}

#[derive(Deserialize)]
pub struct RangeQuery {
    pub measurement: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    1000
}

pub async fn range(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<i64>,
    Query(params): Query<RangeQuery>,
) -> AppResult<Json<Vec<PointBody>>> {
    let points = state
        .timeseries
        .query_range(device_id, &params.measurement, params.from, params.to, params.limit)
        .await
        .map_err(AppError::Internal)?;

    Ok(Json(
        points
            .into_iter()
            .map(|p| PointBody { measurement: p.measurement, timestamp: p.timestamp, value: p.value })
            .collect(),
    ))
}

#[derive(Deserialize)]
pub struct AggregateQuery {
    pub measurement: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub window: i64,
    #[serde(rename = "fn")]
    pub function: String,
}

#[derive(Serialize)]
pub struct AggregateBucketBody {
    pub bucket_start: DateTime<Utc>,
    pub value: Option<f64>,
}

#[derive(Serialize)]
pub struct AggregateBody {
    pub measurement: String,
    pub buckets: Vec<AggregateBucketBody>,
}

pub async fn aggregated(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<i64>,
    Query(params): Query<AggregateQuery>,
) -> AppResult<Json<AggregateBody>> {
    let aggregate = match params.function.as_str() {
        "mean" | "avg" => Aggregate::Avg,
        "min" => Aggregate::Min,
        "max" => Aggregate::Max,
        "sum" => Aggregate::Sum,
        "count" => Aggregate::Count,
        other => return Err(AppError::Validation(format!("unknown aggregate function: {other}"))),
    };
    if params.window <= 0 {
        return Err(AppError::Validation("window must be a positive number of seconds".into()));
    }

    let buckets = state
        .timeseries
        .query_aggregate(device_id, &params.measurement, params.from, params.to, params.window, aggregate)
        .await
        .map_err(AppError::Internal)?
        .into_iter()
        .map(|b| AggregateBucketBody { bucket_start: b.bucket_start, value: b.value })
        .collect();

    Ok(Json(AggregateBody { measurement: params.measurement, buckets }))
}
