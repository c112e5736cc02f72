//! Identity & Authorization: api-key authentication, admin bearer-token
//! authorization, and the device registration entry point. Every lookup
//! goes straight to the credential store without ever caching a negative
//! result, so a revoked key stops working on its very next request.

use anyhow::Result;
use std::sync::Arc;

use crate::credential_store::CredentialStore;
use crate::models::{AdminStatus, Device, RegisterOutcome, RegisterProfile};

const KEY_PREFIX_LEN: usize = 8;

pub struct AuthService {
    store: Arc<CredentialStore>,
    admin_bearer: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryAuthorization {
    Allowed,
    DeviceSuspended,
}

impl AuthService {
    pub fn new(store: Arc<CredentialStore>, admin_bearer: String) -> Self {
        Self { store, admin_bearer }
    }

    pub async fn register(&self, profile: &RegisterProfile) -> Result<RegisterOutcome> {
        self.store.register(profile).await
    }

    /// Resolve an api key to its device, or `None` if the key is unknown
    /// or too short to be a real one. Always goes to the store — a
    /// revoked or rotated key must stop working on its very next request,
    /// which rules out caching this lookup.
    pub async fn authenticate(&self, api_key: &str) -> Result<Option<Device>> {
        if api_key.len() < KEY_PREFIX_LEN {
            return Ok(None);
        }
        self.store.get_by_api_key(api_key).await
    }

    /// Constant-time-ish comparison: length-gated short circuit plus a
    /// byte-wise compare using the full presented string (no early return
    /// on first mismatching byte) to avoid an easy timing oracle on the
    /// admin secret.
    pub fn authorize_admin(&self, presented: &str) -> bool {
        if presented.len() != self.admin_bearer.len() {
            return false;
        }
        let mut diff = 0u8;
        for (a, b) in presented.bytes().zip(self.admin_bearer.bytes()) {
            diff |= a ^ b;
        }
        diff == 0
    }

    /// Telemetry writes are refused for anything but an active device:
    /// inactive devices are suspended outright, and maintenance devices
    /// may heartbeat and read/write config but not submit telemetry.
    pub fn authorize_telemetry(&self, device: &Device) -> TelemetryAuthorization {
        match device.admin_status {
            AdminStatus::Active => TelemetryAuthorization::Allowed,
            AdminStatus::Inactive | AdminStatus::Maintenance => TelemetryAuthorization::DeviceSuspended,
        }
    }

    /// Heartbeat and config access stay open for maintenance devices;
    /// only an inactive device is refused.
    pub fn authorize_heartbeat(&self, device: &Device) -> TelemetryAuthorization {
        match device.admin_status {
            AdminStatus::Active | AdminStatus::Maintenance => TelemetryAuthorization::Allowed,
            AdminStatus::Inactive => TelemetryAuthorization::DeviceSuspended,
        }
    }
}
