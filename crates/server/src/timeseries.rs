//! Time-Series Adapter: per-device metric history, addressed by a
//! hierarchical path (`root.iotflow.devices.device_{id}.{measurement}`),
//! with a retry/backoff envelope around writes that mirrors how this
//! crate would talk to a real external time-series engine even though
//! the local SQLite backing rarely needs the retries itself.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::sleep;

use crate::models::{MetricKind, MetricValue, TelemetryPoint};

const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_FACTOR: u32 = 2;
const RETRY_CEILING: Duration = Duration::from_secs(5);
const RETRY_MAX_ATTEMPTS: u32 = 4;

#[derive(Clone)]
pub struct TimeSeriesAdapter {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, Copy)]
pub enum Aggregate {
    Avg,
    Min,
    Max,
    Sum,
    Count,
}

#[derive(Debug, Clone)]
pub struct StoredPoint {
    pub measurement: String,
    pub timestamp: DateTime<Utc>,
    pub value: MetricValue,
    pub tags: Option<HashMap<String, String>>,
}

/// One bucket of a windowed aggregate query. `value` is `None` when the
/// bucket has no numeric samples (e.g. `COUNT` of an all-text path still
/// reports a count, but `AVG`/`MIN`/`MAX`/`SUM` report `None`).
#[derive(Debug, Clone)]
pub struct AggregateBucket {
    pub bucket_start: DateTime<Utc>,
    pub value: Option<f64>,
}

/// A failed write to a single path, carried back as part of a partial
/// write result.
#[derive(Debug)]
pub struct WriteRejection {
    pub path: String,
    pub reason: String,
}

enum PointOutcome {
    Written,
    Rejected(String),
}

const PATH_PREFIX: &str = "root.iotflow.devices.device_";

fn device_path(device_id: i64, measurement: &str) -> String {
    format!("{PATH_PREFIX}{device_id}.{measurement}")
}

fn device_path_glob(device_id: i64) -> String {
    format!("{PATH_PREFIX}{device_id}.%")
}

/// Measurement name is whatever comes after `device_{id}.` in the path.
fn measurement_from_path(path: &str) -> Option<&str> {
    path.rsplit_once('.').map(|(_, tail)| tail)
}

/// Distinguish errors worth retrying (locked/busy, connection drop) from
/// ones that won't resolve by trying again (constraint violation, bad
/// path type) — retrying the latter would just waste the attempt budget.
fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = db_err.message().to_ascii_lowercase();
            msg.contains("locked") || msg.contains("busy")
        }
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        _ => false,
    }
}

async fn with_retry<F, Fut, T>(op_name: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempt = 0u32;
    let mut delay = RETRY_BASE;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < RETRY_MAX_ATTEMPTS && is_transient(&err) => {
                tracing::warn!(
                    op = op_name,
                    attempt,
                    error = %err,
                    "transient time-series error, retrying"
                );
                sleep(delay).await;
                delay = std::cmp::min(delay * RETRY_FACTOR, RETRY_CEILING);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("{op_name} failed after {attempt} attempt(s)"))
            }
        }
    }
}

impl TimeSeriesAdapter {
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to time-series store: {db_url}"))?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./ts_migrations")
            .run(&self.pool)
            .await
            .context("failed to run time-series store migrations")?;
        Ok(())
    }

    /// Look up (or lazily fix) the data type a path was first written
    /// with. Returns `None` for a brand new path — the caller is free to
    /// fix it to whatever kind the first sample carries.
    async fn path_kind(&self, path: &str) -> Result<Option<MetricKind>> {
        let row = with_retry("path_kind lookup", || {
            sqlx::query("SELECT data_type FROM path_types WHERE path = ?")
                .bind(path)
                .fetch_optional(&self.pool)
        })
        .await?;

        Ok(row.and_then(|r| {
            let raw: String = r.get("data_type");
            MetricKind::parse(&raw)
        }))
    }

    async fn fix_path_kind(&self, path: &str, kind: MetricKind) -> Result<()> {
        with_retry("path_kind insert", || {
            sqlx::query("INSERT INTO path_types (path, data_type) VALUES (?, ?) ON CONFLICT(path) DO NOTHING")
                .bind(path)
                .bind(kind.as_str())
        })
        .await?;
        Ok(())
    }

    /// Write one device's batch of points. Each point is checked against
    /// its path's fixed type (coercing int->float when a prior float path
    /// exists); a mismatch rejects that single point without failing the
    /// rest of the batch, matching the partial-write semantics the
    /// telemetry pipeline surfaces to callers.
    /// Returns the per-point rejections (permanent type mismatches — the
    /// caller turns these into `PartialWrite`). Returns `Err` only when a
    /// transient failure survives every retry attempt, meaning the store
    /// itself is unavailable — the caller turns that into `StoreUnavailable`
    /// rather than folding it into the rejection list.
    pub async fn write_batch(
        &self,
        device_id: i64,
        points: &[TelemetryPoint],
    ) -> Result<Vec<WriteRejection>> {
        let mut rejections = Vec::new();

        for point in points {
            let path = device_path(device_id, &point.measurement);
            match self.write_one(&path, point).await? {
                PointOutcome::Written => {}
                PointOutcome::Rejected(reason) => rejections.push(WriteRejection { path, reason }),
            }
        }

        Ok(rejections)
    }

    async fn write_one(&self, path: &str, point: &TelemetryPoint) -> Result<PointOutcome> {
        let existing_kind = self.path_kind(path).await?;

        let value = match existing_kind {
            None => {
                self.fix_path_kind(path, point.value.kind()).await?;
                point.value.clone()
            }
            Some(kind) if kind == point.value.kind() => point.value.clone(),
            Some(MetricKind::Float) => match point.value.coerce_to_float() {
                Some(f) => MetricValue::Float(f),
                None => {
                    return Ok(PointOutcome::Rejected(format!(
                        "path {path} is fixed to float, value is not float-coercible"
                    )))
                }
            },
            Some(kind) => {
                return Ok(PointOutcome::Rejected(format!(
                    "path {path} is fixed to {}, got {:?}",
                    kind.as_str(),
                    point.value.kind()
                )))
            }
        };

        let (value_num, value_text, value_bool) = match &value {
            MetricValue::Int(i) => (Some(*i as f64), None, None),
            MetricValue::Float(f) => (Some(*f), None, None),
            MetricValue::Bool(b) => (None, None, Some(*b)),
            MetricValue::Text(t) => (None, Some(t.clone()), None),
        };
        let tags_json = point
            .tags
            .as_ref()
            .map(|t| serde_json::to_string(t))
            .transpose()
            .context("failed to serialize tags")?;

        with_retry("points insert", || {
            sqlx::query(
                "INSERT INTO points (path, ts, value_num, value_text, value_bool, tags) \
                 VALUES (?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(path, ts) DO UPDATE SET \
                 value_num = excluded.value_num, value_text = excluded.value_text, \
                 value_bool = excluded.value_bool, tags = excluded.tags",
            )
            .bind(path)
            .bind(point.timestamp.timestamp())
            .bind(value_num)
            .bind(&value_text)
            .bind(value_bool)
            .bind(&tags_json)
        })
        .await?;

        Ok(PointOutcome::Written)
    }

    fn row_to_point(measurement: String, row: &sqlx::sqlite::SqliteRow) -> Result<StoredPoint> {
        let ts: i64 = row.get("ts");
        let value_num: Option<f64> = row.get("value_num");
        let value_text: Option<String> = row.get("value_text");
        let value_bool: Option<bool> = row.get("value_bool");
        let tags_raw: Option<String> = row.get("tags");

        let value = if let Some(b) = value_bool {
            MetricValue::Bool(b)
        } else if let Some(t) = value_text {
            MetricValue::Text(t)
        } else if let Some(n) = value_num {
            if n.fract() == 0.0 && n.abs() < (1i64 << 53) as f64 {
                MetricValue::Int(n as i64)
            } else {
                MetricValue::Float(n)
            }
        } else {
            anyhow::bail!("point at {measurement}@{ts} has no value in any column");
        };

        let tags = tags_raw
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .context("failed to deserialize tags")?;

        Ok(StoredPoint {
            measurement,
            timestamp: Utc.timestamp_opt(ts, 0).single().context("invalid timestamp")?,
            value,
            tags,
        })
    }

    /// With `measurement` given, the latest point on that exact path.
    /// With `measurement` absent, the latest point across every path
    /// under the device, regardless of which measurement it belongs to.
    pub async fn query_latest(&self, device_id: i64, measurement: Option<&str>) -> Result<Option<StoredPoint>> {
        match measurement {
            Some(measurement) => {
                let path = device_path(device_id, measurement);
                let row = with_retry("query_latest", || {
                    sqlx::query(
                        "SELECT ts, value_num, value_text, value_bool, tags FROM points \
                         WHERE path = ? ORDER BY ts DESC LIMIT 1",
                    )
                    .bind(&path)
                    .fetch_optional(&self.pool)
                })
                .await?;

                row.map(|r| Self::row_to_point(measurement.to_string(), &r)).transpose()
            }
            None => {
                let glob = device_path_glob(device_id);
                let row = with_retry("query_latest_any_path", || {
                    sqlx::query(
                        "SELECT path, ts, value_num, value_text, value_bool, tags FROM points \
                         WHERE path LIKE ? ORDER BY ts DESC LIMIT 1",
                    )
                    .bind(&glob)
                    .fetch_optional(&self.pool)
                })
                .await?;

                row.map(|r| {
                    let path: String = r.get("path");
                    let measurement = measurement_from_path(&path)
                        .context("stored path has no measurement suffix")?
                        .to_string();
                    Self::row_to_point(measurement, &r)
                })
                .transpose()
            }
        }
    }

    pub async fn query_range(
        &self,
        device_id: i64,
        measurement: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StoredPoint>> {
        let path = device_path(device_id, measurement);
        let rows = with_retry("query_range", || {
            sqlx::query(
                "SELECT ts, value_num, value_text, value_bool, tags FROM points \
                 WHERE path = ? AND ts >= ? AND ts <= ? ORDER BY ts ASC LIMIT ?",
            )
            .bind(&path)
            .bind(from.timestamp())
            .bind(to.timestamp())
            .bind(limit)
            .fetch_all(&self.pool)
        })
        .await?;

        rows.iter()
            .map(|r| Self::row_to_point(measurement.to_string(), r))
            .collect()
    }

    /// Bucketed aggregation: one `(bucket_start, value)` pair per
    /// `window_secs`-wide bucket that has at least one point in range,
    /// ordered oldest first.
    pub async fn query_aggregate(
        &self,
        device_id: i64,
        measurement: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        window_secs: i64,
        aggregate: Aggregate,
    ) -> Result<Vec<AggregateBucket>> {
        let path = device_path(device_id, measurement);
        let func = match aggregate {
            Aggregate::Avg => "AVG",
            Aggregate::Min => "MIN",
            Aggregate::Max => "MAX",
            Aggregate::Sum => "SUM",
            Aggregate::Count => "COUNT",
        };
        let sql = format!(
            "SELECT (ts / ?) * ? as bucket_start, {func}(value_num) as agg FROM points \
             WHERE path = ? AND ts >= ? AND ts <= ? \
             GROUP BY bucket_start ORDER BY bucket_start ASC"
        );

        let rows = with_retry("query_aggregate", || {
            sqlx::query(&sql)
                .bind(window_secs)
                .bind(window_secs)
                .bind(&path)
                .bind(from.timestamp())
                .bind(to.timestamp())
                .fetch_all(&self.pool)
        })
        .await?;

        rows.into_iter()
            .map(|r| {
                let bucket_start: i64 = r.get("bucket_start");
                let value: Option<f64> = r.get("agg");
                Ok(AggregateBucket {
                    bucket_start: Utc.timestamp_opt(bucket_start, 0).single().context("invalid bucket timestamp")?,
                    value,
                })
            })
            .collect()
    }

    /// Count of points written across every device path in the last hour,
    /// for the detailed health report.
    pub async fn recent_point_count(&self, since: DateTime<Utc>) -> Result<i64> {
        let row = with_retry("recent_point_count", || {
            sqlx::query("SELECT COUNT(*) as n FROM points WHERE ts >= ?")
                .bind(since.timestamp())
                .fetch_one(&self.pool)
        })
        .await?;
        Ok(row.get("n"))
    }

    /// Best-effort deletion of everything under a device's path prefix.
    /// Called by the credential store on device deletion; failures here
    /// are logged, not propagated — the device record itself is already
    /// gone and re-running this later would be harmless.
    pub async fn delete_device(&self, device_id: i64) -> Result<()> {
        let prefix = device_path_glob(device_id);
        with_retry("delete_device points", || {
            sqlx::query("DELETE FROM points WHERE path LIKE ?").bind(&prefix)
        })
        .await?;
        with_retry("delete_device path_types", || {
            sqlx::query("DELETE FROM path_types WHERE path LIKE ?").bind(&prefix)
        })
        .await?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("time-series store health check failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    async fn test_adapter() -> TimeSeriesAdapter {
        let adapter = TimeSeriesAdapter::connect("sqlite::memory:").await.unwrap();
        adapter.migrate().await.unwrap();
        adapter
    }

    fn point(measurement: &str, value: MetricValue, at: DateTime<Utc>) -> TelemetryPoint {
        TelemetryPoint {
            measurement: measurement.to_string(),
            timestamp: at,
            value,
            tags: None,
        }
    }

    #[tokio::test]
    async fn write_then_query_latest_round_trips() {
        let adapter = test_adapter().await;
        let now = Utc::now();
        let rejections = adapter
            .write_batch(1, &[point("temperature", MetricValue::Float(21.5), now)])
            .await
            .unwrap();
        assert!(rejections.is_empty());

        let latest = adapter.query_latest(1, Some("temperature")).await.unwrap().unwrap();
        assert_eq!(latest.value, MetricValue::Float(21.5));
    }

    #[tokio::test]
    async fn query_latest_without_measurement_returns_newest_across_paths() {
        let adapter = test_adapter().await;
        let t0 = Utc::now();
        adapter
            .write_batch(1, &[point("temperature", MetricValue::Float(21.5), t0)])
            .await
            .unwrap();
        let t1 = t0 + ChronoDuration::seconds(1);
        adapter
            .write_batch(1, &[point("humidity", MetricValue::Float(48.0), t1)])
            .await
            .unwrap();

        let latest = adapter.query_latest(1, None).await.unwrap().unwrap();
        assert_eq!(latest.measurement, "humidity");
        assert_eq!(latest.value, MetricValue::Float(48.0));
    }

    #[tokio::test]
    async fn duplicate_timestamp_delivery_is_idempotent() {
        let adapter = test_adapter().await;
        let at = Utc::now();
        adapter
            .write_batch(1, &[point("temperature", MetricValue::Float(1.0), at)])
            .await
            .unwrap();
        adapter
            .write_batch(1, &[point("temperature", MetricValue::Float(1.0), at)])
            .await
            .unwrap();

        let range = adapter
            .query_range(1, "temperature", at - ChronoDuration::seconds(1), at + ChronoDuration::seconds(1), 100)
            .await
            .unwrap();
        assert_eq!(range.len(), 1);
    }

    #[tokio::test]
    async fn int_coerces_to_float_when_path_already_float() {
        let adapter = test_adapter().await;
        let t0 = Utc::now();
        adapter
            .write_batch(1, &[point("humidity", MetricValue::Float(50.0), t0)])
            .await
            .unwrap();

        let t1 = t0 + ChronoDuration::seconds(1);
        let rejections = adapter
            .write_batch(1, &[point("humidity", MetricValue::Int(55), t1)])
            .await
            .unwrap();
        assert!(rejections.is_empty());

        let latest = adapter.query_latest(1, Some("humidity")).await.unwrap().unwrap();
        assert_eq!(latest.value, MetricValue::Float(55.0));
    }

    #[tokio::test]
    async fn incompatible_kind_is_rejected_without_failing_batch() {
        let adapter = test_adapter().await;
        let t0 = Utc::now();
        adapter
            .write_batch(1, &[point("status", MetricValue::Text("ok".into()), t0)])
            .await
            .unwrap();

        let t1 = t0 + ChronoDuration::seconds(1);
        let rejections = adapter
            .write_batch(1, &[point("status", MetricValue::Bool(true), t1)])
            .await
            .unwrap();
        assert_eq!(rejections.len(), 1);
        assert!(rejections[0].path.ends_with("status"));
    }

    #[tokio::test]
    async fn query_range_respects_window_and_order() {
        let adapter = test_adapter().await;
        let base = Utc::now();
        let points: Vec<_> = (0..5)
            .map(|i| point("counter", MetricValue::Int(i), base + ChronoDuration::seconds(i)))
            .collect();
        adapter.write_batch(1, &points).await.unwrap();

        let range = adapter
            .query_range(1, "counter", base + ChronoDuration::seconds(1), base + ChronoDuration::seconds(3), 100)
            .await
            .unwrap();
        assert_eq!(range.len(), 3);
        assert_eq!(range[0].value, MetricValue::Int(1));
        assert_eq!(range[2].value, MetricValue::Int(3));
    }

    #[tokio::test]
    async fn query_aggregate_computes_avg_in_one_bucket() {
        let adapter = test_adapter().await;
        let base = Utc::now();
        let points = vec![
            point("temperature", MetricValue::Float(10.0), base),
            point("temperature", MetricValue::Float(20.0), base + ChronoDuration::seconds(1)),
        ];
        adapter.write_batch(1, &points).await.unwrap();

        let buckets = adapter
            .query_aggregate(
                1,
                "temperature",
                base - ChronoDuration::seconds(1),
                base + ChronoDuration::seconds(2),
                3600,
                Aggregate::Avg,
            )
            .await
            .unwrap();
        assert_eq!(buckets.len(), 1);
        assert!((buckets[0].value.unwrap() - 15.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn query_aggregate_splits_into_multiple_buckets() {
        let adapter = test_adapter().await;
        let base = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        let points = vec![
            point("temperature", MetricValue::Float(10.0), base),
            point("temperature", MetricValue::Float(30.0), base + ChronoDuration::seconds(120)),
        ];
        adapter.write_batch(1, &points).await.unwrap();

        let buckets = adapter
            .query_aggregate(
                1,
                "temperature",
                base - ChronoDuration::seconds(1),
                base + ChronoDuration::seconds(121),
                60,
                Aggregate::Avg,
            )
            .await
            .unwrap();
        assert_eq!(buckets.len(), 2);
        assert!((buckets[0].value.unwrap() - 10.0).abs() < 1e-9);
        assert!((buckets[1].value.unwrap() - 30.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn delete_device_clears_points_and_path_types() {
        let adapter = test_adapter().await;
        let now = Utc::now();
        adapter
            .write_batch(1, &[point("temperature", MetricValue::Float(1.0), now)])
            .await
            .unwrap();

        adapter.delete_device(1).await.unwrap();
        assert!(adapter.query_latest(1, Some("temperature")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn health_check_succeeds() {
        let adapter = test_adapter().await;
        adapter.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn recent_point_count_excludes_points_before_cutoff() {
        let adapter = test_adapter().await;
        let now = Utc::now();
        adapter
            .write_batch(1, &[point("temperature", MetricValue::Float(1.0), now - ChronoDuration::hours(2))])
            .await
            .unwrap();
        adapter.write_batch(2, &[point("temperature", MetricValue::Float(2.0), now)]).await.unwrap();

        let count = adapter.recent_point_count(now - ChronoDuration::hours(1)).await.unwrap();
        assert_eq!(count, 1);
    }
}
