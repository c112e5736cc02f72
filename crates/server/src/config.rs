//! Environment-driven startup configuration.
//!
//! Loaded once into an immutable value and passed by reference — no
//! component re-reads the environment after startup.

use anyhow::{bail, Context, Result};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RateLimitRule {
    pub limit: u32,
    pub window: Duration,
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub registration: RateLimitRule,
    pub telemetry: RateLimitRule,
    pub heartbeat: RateLimitRule,
    pub default: RateLimitRule,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub store_url: String,
    pub timeseries_url: String,
    pub cache_url: Option<String>,

    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: Option<String>,
    pub mqtt_pass: Option<String>,

    pub admin_bearer: String,
    pub api_key_length: usize,

    pub rate_limits: RateLimitSettings,
    pub heartbeat_ttl: Duration,
    pub skew_tolerance: chrono::Duration,

    pub batch_size: usize,
    pub batch_window: Duration,

    pub bind_host: String,
    pub bind_port: u16,

    pub log_level: String,
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("malformed value for {key}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

impl Settings {
    /// `heartbeat_ttl` as a `chrono::Duration`, for comparisons against
    /// `DateTime<Utc>` timestamps pulled from the credential store.
    pub fn heartbeat_ttl_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.heartbeat_ttl).unwrap_or_else(|_| chrono::Duration::seconds(120))
    }

    /// Read configuration from the environment. Unknown env vars are
    /// ignored (nothing here fails on extras); a malformed *known* value
    /// aborts with an error the caller turns into exit code 2.
    pub fn from_env() -> Result<Self> {
        let admin_bearer = env::var("ADMIN_BEARER_TOKEN")
            .context("ADMIN_BEARER_TOKEN must be set — no default for the admin secret")?;
        if admin_bearer.len() < 16 {
            bail!("ADMIN_BEARER_TOKEN must be at least 16 characters");
        }

        let api_key_length: usize = env_parsed("API_KEY_LENGTH", 32)?;
        if api_key_length < 16 {
            bail!("API_KEY_LENGTH must be at least 16");
        }

        let heartbeat_ttl_secs: u64 = env_parsed("HEARTBEAT_TTL_SEC", 120)?;
        let skew_tolerance_hours: i64 = env_parsed("SKEW_TOLERANCE_HOURS", 24)?;

        let rate_limits = RateLimitSettings {
            registration: RateLimitRule {
                limit: env_parsed("RATE_LIMIT_REGISTRATION", 10)?,
                window: Duration::from_secs(env_parsed("RATE_LIMIT_REGISTRATION_WINDOW_SEC", 300)?),
            },
            telemetry: RateLimitRule {
                limit: env_parsed("RATE_LIMIT_TELEMETRY", 100)?,
                window: Duration::from_secs(env_parsed("RATE_LIMIT_TELEMETRY_WINDOW_SEC", 60)?),
            },
            heartbeat: RateLimitRule {
                limit: env_parsed("RATE_LIMIT_HEARTBEAT", 30)?,
                window: Duration::from_secs(env_parsed("RATE_LIMIT_HEARTBEAT_WINDOW_SEC", 60)?),
            },
            default: RateLimitRule {
                limit: env_parsed("RATE_LIMIT_DEFAULT", 60)?,
                window: Duration::from_secs(env_parsed("RATE_LIMIT_DEFAULT_WINDOW_SEC", 60)?),
            },
        };

        Ok(Settings {
            store_url: env_string("STORE_URL", "sqlite:iotflow_devices.db?mode=rwc"),
            timeseries_url: env_string("TIMESERIES_URL", "sqlite:iotflow_timeseries.db?mode=rwc"),
            cache_url: env::var("CACHE_URL").ok(),

            mqtt_host: env_string("MQTT_HOST", "127.0.0.1"),
            mqtt_port: env_parsed("MQTT_PORT", 1883)?,
            mqtt_user: env::var("MQTT_USER").ok(),
            mqtt_pass: env::var("MQTT_PASS").ok(),

            admin_bearer,
            api_key_length,

            rate_limits,
            heartbeat_ttl: Duration::from_secs(heartbeat_ttl_secs),
            skew_tolerance: chrono::Duration::hours(skew_tolerance_hours),

            batch_size: env_parsed("BATCH_SIZE", 256)?,
            batch_window: Duration::from_millis(env_parsed("BATCH_WINDOW_MS", 100)?),

            bind_host: env_string("BIND_HOST", "0.0.0.0"),
            bind_port: env_parsed("BIND_PORT", 8080)?,

            log_level: env_string("LOG_LEVEL", "info"),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
