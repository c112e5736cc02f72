//! Shared application state handed to the HTTP router and, via its inner
//! `Arc`-wrapped adapters, to the MQTT ingress task. The three adapter
//! handles are the only process-wide singletons.

use std::sync::Arc;

use crate::auth::AuthService;
use crate::cache::LivenessCache;
use crate::config::Settings;
use crate::credential_store::CredentialStore;
use crate::health::HealthReporter;
use crate::telemetry::TelemetryPipeline;
use crate::timeseries::TimeSeriesAdapter;

pub struct AppState {
    pub store: Arc<CredentialStore>,
    pub timeseries: Arc<TimeSeriesAdapter>,
    pub cache: Arc<dyn LivenessCache>,
    pub auth: Arc<AuthService>,
    pub pipeline: Arc<TelemetryPipeline>,
    pub health: Arc<HealthReporter>,
    pub settings: Arc<Settings>,
}
