//! Entry point: reads env configuration, connects to the credential
//! store, time-series store and liveness cache, wires the auth/telemetry
//! services, then starts the HTTP and MQTT ingresses side by side.
//!
//! Exit codes:
//! - 0: graceful shutdown (SIGINT/SIGTERM)
//! - 1: a required adapter could not be reached at startup
//! - 2: configuration error (`Settings::from_env()` failed)

mod auth;
mod cache;
mod config;
mod credential_store;
mod error;
mod health;
mod middleware;
mod models;
mod mqtt_ingress;
mod telemetry;
mod timeseries;
mod web;

use anyhow::{Context, Result};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

use auth::AuthService;
use cache::{InMemoryLivenessCache, LivenessCache, RedisLivenessCache};
use config::Settings;
use credential_store::CredentialStore;
use health::{HealthReporter, MqttHealthFlag};
use mqtt_ingress::MqttIngress;
use telemetry::TelemetryPipeline;
use timeseries::TimeSeriesAdapter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            error!(error = %err, "configuration error");
            return ExitCode::from(2);
        }
    };

    match run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "fatal startup error");
            ExitCode::FAILURE
        }
    }
}

async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);

    // ── Adapters ────────────────────────────────────────────────────
    let store = Arc::new(
        CredentialStore::connect(&settings.store_url, settings.api_key_length)
            .await
            .context("connecting to credential store")?,
    );
    store.migrate().await.context("running credential store migrations")?;

    let timeseries = Arc::new(
        TimeSeriesAdapter::connect(&settings.timeseries_url)
            .await
            .context("connecting to time-series store")?,
    );
    timeseries.migrate().await.context("running time-series store migrations")?;

    let cache: Arc<dyn LivenessCache> = match &settings.cache_url {
        Some(url) => {
            let redis_cache = RedisLivenessCache::connect(url).await.context("connecting to liveness cache")?;
            info!(url, "liveness cache connected");
            Arc::new(redis_cache)
        }
        None => {
            warn!("CACHE_URL not set — using in-process liveness cache (single-process deployments only)");
            Arc::new(InMemoryLivenessCache::new())
        }
    };

    // ── Services ────────────────────────────────────────────────────
    let auth = Arc::new(AuthService::new(store.clone(), settings.admin_bearer.clone()));
    let pipeline = Arc::new(TelemetryPipeline::new(
        auth.clone(),
        store.clone(),
        timeseries.clone(),
        cache.clone(),
        settings.heartbeat_ttl,
        settings.skew_tolerance,
    ));
    let mqtt_flag = Arc::new(MqttHealthFlag::new());
    let health = Arc::new(HealthReporter::new(store.clone(), timeseries.clone(), cache.clone(), mqtt_flag.clone()));

    let app_state = Arc::new(web::state::AppState {
        store: store.clone(),
        timeseries: timeseries.clone(),
        cache: cache.clone(),
        auth: auth.clone(),
        pipeline: pipeline.clone(),
        health: health.clone(),
        settings: settings.clone(),
    });

    // ── MQTT ingress ────────────────────────────────────────────────
    let mqtt_ingress = MqttIngress::spawn(
        settings.mqtt_host.clone(),
        settings.mqtt_port,
        settings.mqtt_user.clone(),
        settings.mqtt_pass.clone(),
        pipeline.clone(),
        auth.clone(),
        store.clone(),
        cache.clone(),
        settings.rate_limits.clone(),
        settings.heartbeat_ttl,
        mqtt_flag.clone(),
    );

    // ── HTTP ingress ────────────────────────────────────────────────
    let router = web::router(app_state);
    let listener = tokio::net::TcpListener::bind((settings.bind_host.as_str(), settings.bind_port))
        .await
        .with_context(|| format!("binding http listener on {}:{}", settings.bind_host, settings.bind_port))?;
    info!(host = %settings.bind_host, port = settings.bind_port, "http ingress listening");

    let server = axum::serve(listener, router).with_graceful_shutdown(shutdown_signal());

    if let Err(err) = server.await {
        error!(error = %err, "http server exited with error");
    }

    info!("shutting down mqtt ingress");
    mqtt_ingress.shutdown().await;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
