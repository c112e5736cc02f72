//! HTTP Ingress: router assembly. The handler pipeline (security headers
//! → request tracing id → input sanitization → rate limit → auth →
//! business logic) is composed here as an explicit, fixed-order
//! `axum::middleware::from_fn[_with_state]` stack — data, not
//! decorator/reflection stacking.

pub mod admin;
pub mod devices;
pub mod state;
pub mod system;
pub mod telemetry;

use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, patch, post};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::middleware as mw;
use state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    let public = Router::new()
        .route("/devices/register", post(devices::register))
        .route("/health", get(system::health));

    let device_scoped = Router::new()
        .route("/devices/status", get(devices::status))
        .route("/devices/heartbeat", post(devices::heartbeat))
        .route("/devices/config", get(devices::get_config).put(devices::put_config))
        .route("/devices/mqtt-credentials", get(devices::mqtt_credentials))
        .route("/devices/telemetry", post(telemetry::submit))
        .route("/telemetry/{id}", get(telemetry::range))
        .route("/telemetry/{id}/latest", get(telemetry::latest))
        .route("/telemetry/{id}/aggregated", get(telemetry::aggregated))
        .route_layer(from_fn_with_state(state.clone(), mw::device_auth));

    let admin = Router::new()
        .route("/admin/devices", get(admin::list))
        .route("/admin/devices/{id}", get(admin::get).put(admin::update).delete(admin::delete))
        .route("/admin/devices/{id}/status", patch(admin::status_patch))
        .route("/admin/devices/{id}/rotate-key", post(admin::rotate_key))
        .route("/admin/stats", get(admin::stats))
        .route("/admin/cache", get(admin::cache_inspect))
        .route("/admin/cache/flush", post(admin::cache_flush))
        .route_layer(from_fn_with_state(state.clone(), mw::admin_auth));

    let api = public
        .merge(device_scoped)
        .merge(admin)
        .layer(from_fn(mw::request_timeout))
        .layer(from_fn_with_state(state.clone(), mw::rate_limit))
        .layer(from_fn(mw::input_sanitization))
        .layer(from_fn(mw::request_id))
        .layer(from_fn(mw::security_headers))
        .layer(TraceLayer::new_for_http());

    Router::new().nest("/api/v1", api).with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthService;
    use crate::cache::InMemoryLivenessCache;
    use crate::config::{RateLimitRule, RateLimitSettings, Settings};
    use crate::credential_store::CredentialStore;
    use crate::health::{HealthReporter, MqttHealthFlag};
    use crate::telemetry::TelemetryPipeline;
    use crate::timeseries::TimeSeriesAdapter;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn test_state() -> Arc<AppState> {
        let store = Arc::new(CredentialStore::connect("sqlite::memory:", 32).await.unwrap());
        store.migrate().await.unwrap();
        let timeseries = Arc::new(TimeSeriesAdapter::connect("sqlite::memory:").await.unwrap());
        timeseries.migrate().await.unwrap();
        let cache: Arc<dyn crate::cache::LivenessCache> = Arc::new(InMemoryLivenessCache::new());
        let auth = Arc::new(AuthService::new(store.clone(), "admin-secret-0123456".to_string()));
        let pipeline = Arc::new(TelemetryPipeline::new(
            auth.clone(),
            store.clone(),
            timeseries.clone(),
            cache.clone(),
            Duration::from_secs(120),
            chrono::Duration::hours(24),
        ));
        let health = Arc::new(HealthReporter::new(
            store.clone(),
            timeseries.clone(),
            cache.clone(),
            Arc::new(MqttHealthFlag::new()),
        ));

        let rule = RateLimitRule { limit: 1000, window: Duration::from_secs(60) };
        let settings = Arc::new(Settings {
            store_url: "sqlite::memory:".into(),
            timeseries_url: "sqlite::memory:".into(),
            cache_url: None,
            mqtt_host: "127.0.0.1".into(),
            mqtt_port: 1883,
            mqtt_user: None,
            mqtt_pass: None,
            admin_bearer: "admin-secret-0123456".into(),
            api_key_length: 32,
            rate_limits: RateLimitSettings {
                registration: rule.clone(),
                telemetry: rule.clone(),
                heartbeat: rule.clone(),
                default: rule,
            },
            heartbeat_ttl: Duration::from_secs(120),
            skew_tolerance: chrono::Duration::hours(24),
            batch_size: 256,
            batch_window: Duration::from_millis(100),
            bind_host: "0.0.0.0".into(),
            bind_port: 8080,
            log_level: "info".into(),
        });

        Arc::new(AppState { store, timeseries, cache, auth, pipeline, health, settings })
    }

    #[tokio::test]
    async fn health_endpoint_is_reachable_without_auth() {
        let app = router(test_state().await);
        let response = app
            .oneshot(Request::builder().uri("/api/v1/health").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn register_then_status_round_trips_through_the_router() {
        let app = router(test_state().await);

        let register_response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/devices/register")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(
                        serde_json::json!({"name": "sensor-alpha", "device_type": "temperature"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(register_response.status(), StatusCode::CREATED);

        let body = register_response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let api_key = parsed["device"]["api_key"].as_str().unwrap().to_string();

        let status_response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/devices/status")
                    .header("x-api-key", api_key)
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(status_response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn device_route_without_api_key_is_unauthorized() {
        let app = router(test_state().await);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/devices/status")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn admin_route_without_bearer_is_unauthorized() {
        let app = router(test_state().await);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/admin/devices")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn duplicate_registration_returns_conflict() {
        let app = router(test_state().await);
        let body = serde_json::json!({"name": "sensor-dup", "device_type": "temperature"}).to_string();

        let first = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/devices/register")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/devices/register")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn telemetry_submit_then_status_reports_online_with_last_seen() {
        let app = router(test_state().await);

        let register_response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/devices/register")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(
                        serde_json::json!({"name": "sensor-beta", "device_type": "temperature"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = register_response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let api_key = parsed["device"]["api_key"].as_str().unwrap().to_string();

        let submit_response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/devices/telemetry")
                    .header("content-type", "application/json")
                    .header("x-api-key", api_key.clone())
                    .body(axum::body::Body::from(serde_json::json!({"data": {"temperature": 21.5}}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(submit_response.status(), StatusCode::ACCEPTED);

        let status_response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/devices/status")
                    .header("x-api-key", api_key)
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(status_response.status(), StatusCode::OK);
        let body = status_response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["is_online"], true);
        assert!(parsed["last_seen"].is_string());
    }
}
