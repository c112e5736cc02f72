//! Health & Observability: the composite `/health` report.
//! Every adapter's health check runs in parallel with a bounded timeout;
//! overall status degrades on any non-essential failure and goes `down`
//! only when the credential store itself is unreachable.

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::System;

use crate::cache::LivenessCache;
use crate::credential_store::CredentialStore;
use crate::timeseries::TimeSeriesAdapter;

const CHECK_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub healthy: bool,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Checks {
    pub store: CheckResult,
    pub ts: CheckResult,
    pub cache: CheckResult,
    pub mqtt: CheckResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemGauges {
    pub cpu_usage_percent: f32,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetailedReport {
    pub device_count: i64,
    pub telemetry_count_1h: i64,
    pub system: SystemGauges,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub checks: Checks,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<DetailedReport>,
}

/// Tracks whether the MQTT ingress has heard from the broker recently;
/// flipped by the ingress supervisor task, read here under the health
/// check. A simple atomic rather than a full adapter trait since there's
/// exactly one MQTT session per process.
pub struct MqttHealthFlag(std::sync::atomic::AtomicBool);

impl MqttHealthFlag {
    pub fn new() -> Self {
        Self(std::sync::atomic::AtomicBool::new(true))
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.0.store(healthy, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn is_healthy(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl Default for MqttHealthFlag {
    fn default() -> Self {
        Self::new()
    }
}

pub struct HealthReporter {
    store: Arc<CredentialStore>,
    timeseries: Arc<TimeSeriesAdapter>,
    cache: Arc<dyn LivenessCache>,
    mqtt_flag: Arc<MqttHealthFlag>,
}

async fn timed_check<F>(check: F) -> CheckResult
where
    F: std::future::Future<Output = anyhow::Result<()>>,
{
    let started = Instant::now();
    match tokio::time::timeout(CHECK_TIMEOUT, check).await {
        Ok(Ok(())) => CheckResult { healthy: true, response_time_ms: started.elapsed().as_millis() as u64, note: None },
        Ok(Err(err)) => CheckResult {
            healthy: false,
            response_time_ms: started.elapsed().as_millis() as u64,
            note: Some(err.to_string()),
        },
        Err(_) => CheckResult {
            healthy: false,
            response_time_ms: CHECK_TIMEOUT.as_millis() as u64,
            note: Some("check timed out".to_string()),
        },
    }
}

impl HealthReporter {
    pub fn new(
        store: Arc<CredentialStore>,
        timeseries: Arc<TimeSeriesAdapter>,
        cache: Arc<dyn LivenessCache>,
        mqtt_flag: Arc<MqttHealthFlag>,
    ) -> Self {
        Self { store, timeseries, cache, mqtt_flag }
    }

    pub async fn report(&self, detailed: bool) -> HealthReport {
        let (store_check, ts_check, cache_check) = tokio::join!(
            timed_check(self.store.health_check()),
            timed_check(self.timeseries.health_check()),
            timed_check(async {
                self.cache.stats().await.map(|_| ())
            }),
        );

        let mqtt_check = CheckResult {
            healthy: self.mqtt_flag.is_healthy(),
            response_time_ms: 0,
            note: if self.mqtt_flag.is_healthy() { None } else { Some("no recent broker activity".to_string()) },
        };

        let checks = Checks { store: store_check, ts: ts_check, cache: cache_check, mqtt: mqtt_check };

        let status = if !checks.store.healthy {
            "down"
        } else if !checks.ts.healthy || !checks.cache.healthy || !checks.mqtt.healthy {
            "degraded"
        } else {
            "ok"
        };

        let detail = if detailed { Some(self.detailed_report().await) } else { None };

        HealthReport { status, checks, detail }
    }

    async fn detailed_report(&self) -> DetailedReport {
        let device_count = self.store.count().await.unwrap_or(0);
        let since = chrono::Utc::now() - chrono::Duration::hours(1);
        let telemetry_count_1h = self.timeseries.recent_point_count(since).await.unwrap_or(0);

        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();

        DetailedReport {
            device_count,
            telemetry_count_1h,
            system: SystemGauges {
                cpu_usage_percent: system.global_cpu_usage(),
                memory_used_bytes: system.used_memory(),
                memory_total_bytes: system.total_memory(),
            },
        }
    }
}
