//! Credential Store Adapter: device CRUD, unique-name enforcement,
//! api_key lookup, backed by SQLite via `sqlx`.

use anyhow::{Context, Result};
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use std::str::FromStr;

use crate::models::{AdminStatus, ConfigPatch, Device, RegisterOutcome, RegisterProfile};

#[derive(Clone)]
pub struct CredentialStore {
    pool: Pool<Sqlite>,
    api_key_length: usize,
}

#[derive(Debug, Default, Clone)]
pub struct DeviceFilter {
    pub admin_status: Option<AdminStatus>,
    pub device_type: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Page {
    fn default() -> Self {
        Page { limit: 50, offset: 0 }
    }
}

/// Generate a cryptographically strong, URL-safe api key of exactly
/// `length` characters, at least 192 bits of entropy from a CSPRNG.
fn generate_api_key(length: usize) -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
    encoded.chars().take(length).collect()
}

fn row_to_device(
    id: i64,
    name: String,
    device_type: String,
    description: String,
    location: String,
    firmware_version: String,
    hardware_version: String,
    api_key: String,
    admin_status: String,
    created_at: i64,
    updated_at: i64,
    last_seen: Option<i64>,
) -> Device {
    Device {
        id,
        name,
        device_type,
        description,
        location,
        firmware_version,
        hardware_version,
        api_key,
        admin_status: AdminStatus::parse(&admin_status).unwrap_or(AdminStatus::Active),
        created_at: DateTime::from_timestamp(created_at, 0).unwrap_or_else(Utc::now),
        updated_at: DateTime::from_timestamp(updated_at, 0).unwrap_or_else(Utc::now),
        last_seen: last_seen.and_then(|ts| DateTime::from_timestamp(ts, 0)),
    }
}

impl CredentialStore {
    pub async fn connect(db_url: &str, api_key_length: usize) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to credential store: {db_url}"))?;

        Ok(Self { pool, api_key_length })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run credential store migrations")?;
        Ok(())
    }

    /// Atomic with the uniqueness check: the insert either succeeds or
    /// hits the unique index on `name`, with no separate read-then-write
    /// race window.
    pub async fn register(&self, profile: &RegisterProfile) -> Result<RegisterOutcome> {
        let api_key = generate_api_key(self.api_key_length);
        let now = Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO devices (
                name, device_type, description, location,
                firmware_version, hardware_version, api_key, admin_status,
                created_at, updated_at, last_seen
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 'active', ?, ?, NULL)
            "#,
        )
        .bind(&profile.name)
        .bind(&profile.device_type)
        .bind(profile.description.clone().unwrap_or_default())
        .bind(profile.location.clone().unwrap_or_default())
        .bind(profile.firmware_version.clone().unwrap_or_default())
        .bind(profile.hardware_version.clone().unwrap_or_default())
        .bind(&api_key)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(res) => {
                let device = self
                    .get_by_id(res.last_insert_rowid())
                    .await?
                    .context("device vanished immediately after insert")?;
                Ok(RegisterOutcome::Registered { device })
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                let existing = self
                    .get_by_name(&profile.name)
                    .await?
                    .context("unique violation but name lookup found nothing")?;
                Ok(RegisterOutcome::NameTaken { existing_id: existing.id })
            }
            Err(e) => Err(e).context("register failed"),
        }
    }

    pub async fn get_by_api_key(&self, api_key: &str) -> Result<Option<Device>> {
        let row = sqlx::query(
            "SELECT id, name, device_type, description, location, firmware_version, \
             hardware_version, api_key, admin_status, created_at, updated_at, last_seen \
             FROM devices WHERE api_key = ?",
        )
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await
        .context("get_by_api_key failed")?;

        Ok(row.map(Self::map_row))
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Device>> {
        let row = sqlx::query(
            "SELECT id, name, device_type, description, location, firmware_version, \
             hardware_version, api_key, admin_status, created_at, updated_at, last_seen \
             FROM devices WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("get_by_id failed")?;

        Ok(row.map(Self::map_row))
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<Device>> {
        let row = sqlx::query(
            "SELECT id, name, device_type, description, location, firmware_version, \
             hardware_version, api_key, admin_status, created_at, updated_at, last_seen \
             FROM devices WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("get_by_name failed")?;

        Ok(row.map(Self::map_row))
    }

    fn map_row(row: sqlx::sqlite::SqliteRow) -> Device {
        row_to_device(
            row.get("id"),
            row.get("name"),
            row.get("device_type"),
            row.get("description"),
            row.get("location"),
            row.get("firmware_version"),
            row.get("hardware_version"),
            row.get("api_key"),
            row.get("admin_status"),
            row.get("created_at"),
            row.get("updated_at"),
            row.get("last_seen"),
        )
    }

    pub async fn update_config(&self, id: i64, patch: &ConfigPatch) -> Result<bool> {
        let existing = self.get_by_id(id).await?;
        let Some(existing) = existing else {
            return Ok(false);
        };

        let location = patch.location.clone().unwrap_or(existing.location);
        let firmware_version = patch
            .firmware_version
            .clone()
            .unwrap_or(existing.firmware_version);
        let description = patch.description.clone().unwrap_or(existing.description);
        let now = Utc::now().timestamp();

        sqlx::query(
            "UPDATE devices SET location = ?, firmware_version = ?, description = ?, \
             updated_at = ? WHERE id = ?",
        )
        .bind(location)
        .bind(firmware_version)
        .bind(description)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("update_config failed")?;

        Ok(true)
    }

    pub async fn update_status(&self, id: i64, status: AdminStatus) -> Result<bool> {
        let now = Utc::now().timestamp();
        let result = sqlx::query("UPDATE devices SET admin_status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("update_status failed")?;
        Ok(result.rows_affected() > 0)
    }

    /// Issue a fresh api_key for a device, invalidating the old one
    /// immediately. Registration never rotates an existing name's key;
    /// this admin-only path is the only way to do so. Returns the new
    /// key, or `None` if the device doesn't exist.
    pub async fn rotate_api_key(&self, id: i64) -> Result<Option<String>> {
        let new_key = generate_api_key(self.api_key_length);
        let now = Utc::now().timestamp();
        let result = sqlx::query("UPDATE devices SET api_key = ?, updated_at = ? WHERE id = ?")
            .bind(&new_key)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("rotate_api_key failed")?;

        Ok((result.rows_affected() > 0).then_some(new_key))
    }

    /// Stamp `last_seen` on any inbound message. The liveness cache is the
    /// fast path; this keeps the store-side fallback current for the
    /// cache-miss case.
    pub async fn touch_last_seen(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE devices SET last_seen = ? WHERE id = ?")
            .bind(at.timestamp())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("touch_last_seen failed")?;
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM devices WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("delete failed")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list(&self, filter: &DeviceFilter, page: Page) -> Result<Vec<Device>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT id, name, device_type, description, location, firmware_version, \
             hardware_version, api_key, admin_status, created_at, updated_at, last_seen \
             FROM devices",
        );

        let mut has_where = false;
        if let Some(status) = filter.admin_status {
            qb.push(" WHERE admin_status = ");
            qb.push_bind(status.as_str());
            has_where = true;
        }
        if let Some(device_type) = &filter.device_type {
            qb.push(if has_where { " AND " } else { " WHERE " });
            qb.push("device_type = ");
            qb.push_bind(device_type.clone());
        }

        qb.push(" ORDER BY id LIMIT ");
        qb.push_bind(page.limit);
        qb.push(" OFFSET ");
        qb.push_bind(page.offset);

        let rows = qb.build().fetch_all(&self.pool).await.context("list failed")?;
        Ok(rows.into_iter().map(Self::map_row).collect())
    }

    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as n FROM devices")
            .fetch_one(&self.pool)
            .await
            .context("count failed")?;
        Ok(row.get("n"))
    }

    /// Quick connectivity check for the composite health report.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("credential store health check failed")?;
        Ok(())
    }
}
