//! Shared domain types: device records, the tagged telemetry value type,
//! and the normalized envelopes that both ingresses build before handing
//! work to the telemetry pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Administrative lifecycle state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminStatus {
    Active,
    Inactive,
    Maintenance,
}

impl AdminStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminStatus::Active => "active",
            AdminStatus::Inactive => "inactive",
            AdminStatus::Maintenance => "maintenance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AdminStatus::Active),
            "inactive" => Some(AdminStatus::Inactive),
            "maintenance" => Some(AdminStatus::Maintenance),
            _ => None,
        }
    }
}

/// A registered device, as persisted by the credential store.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub id: i64,
    pub name: String,
    pub device_type: String,
    pub description: String,
    pub location: String,
    pub firmware_version: String,
    pub hardware_version: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub admin_status: AdminStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Fields accepted on `POST /devices/register`.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterProfile {
    pub name: String,
    pub device_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub hardware_version: Option<String>,
}

/// Fields accepted on `PUT /devices/config`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConfigPatch {
    pub location: Option<String>,
    pub firmware_version: Option<String>,
    pub description: Option<String>,
}

/// Outcome of a registration attempt: explicit result variants instead
/// of exception-for-control-flow.
pub enum RegisterOutcome {
    Registered { device: Device },
    NameTaken { existing_id: i64 },
}

/// The tagged value type telemetry coercion logic is built around.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl MetricValue {
    /// Kind discriminant, independent of the concrete numeric value —
    /// used to check path-type compatibility.
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Int(_) => MetricKind::Int,
            MetricValue::Float(_) => MetricKind::Float,
            MetricValue::Bool(_) => MetricKind::Bool,
            MetricValue::Text(_) => MetricKind::Text,
        }
    }

    /// Coerce to `Float` if representable: integers <= 2^53 coerce to
    /// float when a prior float path exists.
    pub fn coerce_to_float(&self) -> Option<f64> {
        match self {
            MetricValue::Float(f) => Some(*f),
            MetricValue::Int(i) if i.unsigned_abs() <= (1u64 << 53) => Some(*i as f64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Int,
    Float,
    Bool,
    Text,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Int => "int",
            MetricKind::Float => "float",
            MetricKind::Bool => "bool",
            MetricKind::Text => "text",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "int" => Some(MetricKind::Int),
            "float" => Some(MetricKind::Float),
            "bool" => Some(MetricKind::Bool),
            "text" => Some(MetricKind::Text),
            _ => None,
        }
    }
}

/// A single accepted/queued telemetry sample.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryPoint {
    pub measurement: String,
    pub timestamp: DateTime<Utc>,
    pub value: MetricValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<HashMap<String, String>>,
}

/// Inbound telemetry envelope, normalized the same way regardless of
/// whether it arrived over HTTP or MQTT.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryEnvelope {
    #[serde(default)]
    pub device_id: Option<i64>,
    pub api_key: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub data: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Inbound status envelope (MQTT `status/*` topics).
#[derive(Debug, Clone, Deserialize)]
pub struct StatusEnvelope {
    pub api_key: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Result of running the telemetry pipeline on one envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Accepted,
    PartialWrite { rejected: Vec<String> },
}
