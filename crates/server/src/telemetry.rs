//! Telemetry Pipeline: the seven normalization steps shared by both
//! ingresses, ending in a dual write to the Time-Series Adapter and the
//! Liveness Cache with asymmetric partial-failure semantics.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AuthService, TelemetryAuthorization};
use crate::cache::LivenessCache;
use crate::credential_store::CredentialStore;
use crate::error::{AppError, AppResult};
use crate::models::{Device, IngestOutcome, MetricValue, TelemetryEnvelope, TelemetryPoint};
use crate::timeseries::TimeSeriesAdapter;

pub struct TelemetryPipeline {
    auth: Arc<AuthService>,
    store: Arc<CredentialStore>,
    timeseries: Arc<TimeSeriesAdapter>,
    cache: Arc<dyn LivenessCache>,
    heartbeat_ttl: Duration,
    skew_tolerance: ChronoDuration,
}

impl TelemetryPipeline {
    pub fn new(
        auth: Arc<AuthService>,
        store: Arc<CredentialStore>,
        timeseries: Arc<TimeSeriesAdapter>,
        cache: Arc<dyn LivenessCache>,
        heartbeat_ttl: Duration,
        skew_tolerance: ChronoDuration,
    ) -> Self {
        Self { auth, store, timeseries, cache, heartbeat_ttl, skew_tolerance }
    }

    pub async fn ingest(&self, envelope: TelemetryEnvelope) -> AppResult<IngestOutcome> {
        let device = self.authenticate(&envelope).await?;

        let server_received_at = Utc::now();
        let effective_timestamp = resolve_timestamp(
            envelope.timestamp,
            server_received_at,
            self.skew_tolerance,
        );

        let (points, mut rejected) = normalize_data(&envelope.data, effective_timestamp);

        self.cache
            .set_online(device.id, server_received_at, self.heartbeat_ttl)
            .await
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, device_id = device.id, "liveness cache set_online failed, continuing");
            });
        self.store
            .touch_last_seen(device.id, server_received_at)
            .await
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, device_id = device.id, "store touch_last_seen failed, continuing");
            });

        if points.is_empty() {
            return if rejected.is_empty() {
                Ok(IngestOutcome::Accepted)
            } else {
                Ok(IngestOutcome::PartialWrite { rejected })
            };
        }

        match self.timeseries.write_batch(device.id, &points).await {
            Ok(write_rejections) => {
                rejected.extend(write_rejections.into_iter().map(|r| r.path));
                if rejected.is_empty() {
                    Ok(IngestOutcome::Accepted)
                } else {
                    Ok(IngestOutcome::PartialWrite { rejected })
                }
            }
            Err(err) => {
                tracing::error!(error = %err, device_id = device.id, "time-series write exhausted retries");
                Err(AppError::StoreUnavailable)
            }
        }
    }

    async fn authenticate(&self, envelope: &TelemetryEnvelope) -> AppResult<Device> {
        let device = self
            .auth
            .authenticate(&envelope.api_key)
            .await
            .map_err(AppError::Internal)?
            .ok_or(AppError::AuthFailed)?;

        if let Some(claimed_id) = envelope.device_id {
            if claimed_id != device.id {
                return Err(AppError::AuthFailed);
            }
        }

        match self.auth.authorize_telemetry(&device) {
            TelemetryAuthorization::Allowed => Ok(device),
            TelemetryAuthorization::DeviceSuspended => Err(AppError::AuthFailed),
        }
    }
}

/// Step 2: substitute and clamp the timestamp per the configured skew
/// tolerance. A deviation beyond tolerance in either direction falls back
/// to server time rather than trusting the device's clock.
fn resolve_timestamp(
    claimed: Option<DateTime<Utc>>,
    server_received_at: DateTime<Utc>,
    skew_tolerance: ChronoDuration,
) -> DateTime<Utc> {
    match claimed {
        None => server_received_at,
        Some(ts) => {
            let skew = (ts - server_received_at).abs();
            if skew > skew_tolerance {
                tracing::warn!(
                    claimed = %ts,
                    server = %server_received_at,
                    "telemetry timestamp skew exceeds tolerance, substituting server time"
                );
                server_received_at
            } else {
                ts
            }
        }
    }
}

/// Step 3: flatten one level of nested objects into dotted measurement
/// names, convert JSON leaves into `MetricValue`s, and reject anything
/// that isn't a scalar or bool. Numeric coercion against a path's
/// previously-fixed type happens later, in the time-series adapter, which
/// is the only place that knows the path's history.
fn normalize_data(
    data: &HashMap<String, Value>,
    timestamp: DateTime<Utc>,
) -> (Vec<TelemetryPoint>, Vec<String>) {
    let mut points = Vec::new();
    let mut rejected = Vec::new();

    for (key, value) in data {
        match value {
            Value::Object(nested) => {
                for (inner_key, inner_value) in nested {
                    let measurement = format!("{key}.{inner_key}");
                    match leaf_to_metric(inner_value) {
                        Some(metric) => points.push(TelemetryPoint {
                            measurement,
                            timestamp,
                            value: metric,
                            tags: None,
                        }),
                        None => rejected.push(measurement),
                    }
                }
            }
            other => match leaf_to_metric(other) {
                Some(metric) => points.push(TelemetryPoint {
                    measurement: key.clone(),
                    timestamp,
                    value: metric,
                    tags: None,
                }),
                None => rejected.push(key.clone()),
            },
        }
    }

    (points, rejected)
}

fn leaf_to_metric(value: &Value) -> Option<MetricValue> {
    match value {
        Value::Bool(b) => Some(MetricValue::Bool(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(MetricValue::Int(i))
            } else {
                n.as_f64().map(MetricValue::Float)
            }
        }
        Value::String(s) => Some(MetricValue::Text(s.clone())),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryLivenessCache;
    use crate::credential_store::CredentialStore;
    use crate::models::{RegisterOutcome, RegisterProfile};
    use serde_json::json;

    async fn test_pipeline() -> (TelemetryPipeline, Device) {
        let store = Arc::new(CredentialStore::connect("sqlite::memory:", 32).await.unwrap());
        store.migrate().await.unwrap();
        let timeseries = Arc::new(TimeSeriesAdapter::connect("sqlite::memory:").await.unwrap());
        timeseries.migrate().await.unwrap();
        let cache: Arc<dyn LivenessCache> = Arc::new(InMemoryLivenessCache::new());
        let auth = Arc::new(AuthService::new(store.clone(), "admin-secret-0123456".to_string()));

        let RegisterOutcome::Registered { device } = auth
            .register(&RegisterProfile {
                name: "sensor-alpha".into(),
                device_type: "temperature".into(),
                description: None,
                location: None,
                firmware_version: None,
                hardware_version: None,
            })
            .await
            .unwrap()
        else {
            panic!("expected Registered");
        };

        let pipeline = TelemetryPipeline::new(
            auth,
            store,
            timeseries,
            cache,
            Duration::from_secs(120),
            ChronoDuration::hours(24),
        );
        (pipeline, device)
    }

    #[tokio::test]
    async fn accepted_submission_is_queryable_via_latest() {
        let (pipeline, device) = test_pipeline().await;
        let ts = Utc::now();
        let mut data = HashMap::new();
        data.insert("temperature".to_string(), json!(22.5));

        let outcome = pipeline
            .ingest(TelemetryEnvelope {
                device_id: None,
                api_key: device.api_key.clone(),
                timestamp: Some(ts),
                data,
                metadata: None,
            })
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Accepted));

        let latest = pipeline.timeseries.query_latest(device.id, Some("temperature")).await.unwrap().unwrap();
        assert_eq!(latest.value, MetricValue::Float(22.5));
    }

    #[tokio::test]
    async fn unknown_api_key_is_auth_failed() {
        let (pipeline, _device) = test_pipeline().await;
        let mut data = HashMap::new();
        data.insert("temperature".to_string(), json!(1));

        let err = pipeline
            .ingest(TelemetryEnvelope {
                device_id: None,
                api_key: "not-a-real-key-000000000".to_string(),
                timestamp: None,
                data,
                metadata: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AuthFailed));
    }

    #[tokio::test]
    async fn mismatched_device_id_is_auth_failed() {
        let (pipeline, device) = test_pipeline().await;
        let mut data = HashMap::new();
        data.insert("temperature".to_string(), json!(1));

        let err = pipeline
            .ingest(TelemetryEnvelope {
                device_id: Some(device.id + 999),
                api_key: device.api_key.clone(),
                timestamp: None,
                data,
                metadata: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AuthFailed));
    }

    #[tokio::test]
    async fn missing_timestamp_substitutes_server_time() {
        let (pipeline, device) = test_pipeline().await;
        let before = Utc::now();
        let mut data = HashMap::new();
        data.insert("temperature".to_string(), json!(1));

        pipeline
            .ingest(TelemetryEnvelope {
                device_id: None,
                api_key: device.api_key.clone(),
                timestamp: None,
                data,
                metadata: None,
            })
            .await
            .unwrap();

        let latest = pipeline.timeseries.query_latest(device.id, Some("temperature")).await.unwrap().unwrap();
        assert!(latest.timestamp >= before);
    }

    #[tokio::test]
    async fn skewed_timestamp_is_overridden_with_server_time() {
        let (pipeline, device) = test_pipeline().await;
        let before = Utc::now();
        let far_future = before + ChronoDuration::hours(48);
        let mut data = HashMap::new();
        data.insert("temperature".to_string(), json!(1));

        pipeline
            .ingest(TelemetryEnvelope {
                device_id: None,
                api_key: device.api_key.clone(),
                timestamp: Some(far_future),
                data,
                metadata: None,
            })
            .await
            .unwrap();

        let latest = pipeline.timeseries.query_latest(device.id, Some("temperature")).await.unwrap().unwrap();
        assert!(latest.timestamp < far_future);
    }

    #[tokio::test]
    async fn nested_object_flattens_to_dotted_measurement() {
        let (pipeline, device) = test_pipeline().await;
        let mut data = HashMap::new();
        data.insert("battery".to_string(), json!({"voltage": 3.7, "percent": 80}));

        pipeline
            .ingest(TelemetryEnvelope {
                device_id: None,
                api_key: device.api_key.clone(),
                timestamp: Some(Utc::now()),
                data,
                metadata: None,
            })
            .await
            .unwrap();

        let voltage = pipeline.timeseries.query_latest(device.id, Some("battery.voltage")).await.unwrap().unwrap();
        assert_eq!(voltage.value, MetricValue::Float(3.7));
    }

    #[tokio::test]
    async fn array_leaf_is_rejected_as_partial_write() {
        let (pipeline, device) = test_pipeline().await;
        let mut data = HashMap::new();
        data.insert("temperature".to_string(), json!(22.0));
        data.insert("samples".to_string(), json!([1, 2, 3]));

        let outcome = pipeline
            .ingest(TelemetryEnvelope {
                device_id: None,
                api_key: device.api_key.clone(),
                timestamp: Some(Utc::now()),
                data,
                metadata: None,
            })
            .await
            .unwrap();

        match outcome {
            IngestOutcome::PartialWrite { rejected } => assert_eq!(rejected, vec!["samples".to_string()]),
            IngestOutcome::Accepted => panic!("expected PartialWrite"),
        }
    }

    #[tokio::test]
    async fn int_then_incompatible_text_is_partial_write() {
        let (pipeline, device) = test_pipeline().await;
        let mut first = HashMap::new();
        first.insert("temperature".to_string(), json!(22.5));
        pipeline
            .ingest(TelemetryEnvelope {
                device_id: None,
                api_key: device.api_key.clone(),
                timestamp: Some(Utc::now()),
                data: first,
                metadata: None,
            })
            .await
            .unwrap();

        let mut second = HashMap::new();
        second.insert("temperature".to_string(), json!("warm"));
        let outcome = pipeline
            .ingest(TelemetryEnvelope {
                device_id: None,
                api_key: device.api_key.clone(),
                timestamp: Some(Utc::now() + ChronoDuration::seconds(1)),
                data: second,
                metadata: None,
            })
            .await
            .unwrap();

        assert!(matches!(outcome, IngestOutcome::PartialWrite { .. }));
    }

    #[tokio::test]
    async fn inactive_device_submission_is_auth_failed() {
        use crate::models::AdminStatus;

        let (pipeline, device) = test_pipeline().await;
        let mut inactive_device = device.clone();
        inactive_device.admin_status = AdminStatus::Inactive;
        assert_eq!(
            pipeline.auth.authorize_telemetry(&inactive_device),
            TelemetryAuthorization::DeviceSuspended
        );
    }
}
