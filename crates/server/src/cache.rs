//! Liveness Cache adapter: device online/offline tracking and
//! fixed-window rate limiting, backed by Redis. Fails open on cache
//! errors — a cache outage degrades to "treat everyone as live, let
//! everyone through" rather than taking the whole ingress path down.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

/// Atomic fixed-window counter: increments the window bucket and sets its
/// TTL only on the first hit, all in one round trip so concurrent
/// requests can't race past the limit.
const RATE_LIMIT_SCRIPT: &str = r#"
local current = redis.call("INCR", KEYS[1])
if current == 1 then
    redis.call("EXPIRE", KEYS[1], ARGV[1])
end
local ttl = redis.call("TTL", KEYS[1])
return {current, ttl}
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitOutcome {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: i64,
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub online_devices: u64,
}

#[async_trait]
pub trait LivenessCache: Send + Sync {
    /// Mark a device online, recording the instant it was actually seen
    /// (not necessarily "now" by the time this call lands) so readers get
    /// a real `last_seen` rather than just a boolean flag.
    async fn set_online(&self, device_id: i64, seen_at: DateTime<Utc>, ttl: Duration) -> Result<()>;
    async fn get_status(&self, device_id: i64) -> Result<LivenessStatus>;
    /// `last_seen` as recorded by the most recent `set_online`, regardless
    /// of whether the TTL window has since lapsed.
    async fn get_last_seen(&self, device_id: i64) -> Result<Option<DateTime<Utc>>>;
    async fn clear_status(&self, device_id: i64) -> Result<()>;
    async fn clear_all(&self) -> Result<()>;
    async fn rate_limit(&self, key: &str, limit: u32, window: Duration) -> Result<RateLimitOutcome>;
    async fn stats(&self) -> Result<CacheStats>;
}

fn liveness_key(device_id: i64) -> String {
    format!("iotflow:liveness:{device_id}")
}

fn lastseen_key(device_id: i64) -> String {
    format!("iotflow:lastseen:{device_id}")
}

pub struct RedisLivenessCache {
    conn: ConnectionManager,
}

impl RedisLivenessCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let conn = client
            .get_connection_manager()
            .await
            .context("failed to connect to liveness cache")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl LivenessCache for RedisLivenessCache {
    async fn set_online(&self, device_id: i64, seen_at: DateTime<Utc>, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = liveness_key(device_id);
        conn.set_ex::<_, _, ()>(&key, 1, ttl.as_secs().max(1))
            .await
            .context("set_online failed")?;
        conn.set::<_, _, ()>(lastseen_key(device_id), seen_at.timestamp())
            .await
            .context("set_online last_seen write failed")?;
        Ok(())
    }

    async fn get_status(&self, device_id: i64) -> Result<LivenessStatus> {
        let mut conn = self.conn.clone();
        let key = liveness_key(device_id);
        let exists: bool = conn.exists(&key).await.context("get_status failed")?;
        Ok(if exists { LivenessStatus::Online } else { LivenessStatus::Offline })
    }

    async fn get_last_seen(&self, device_id: i64) -> Result<Option<DateTime<Utc>>> {
        let mut conn = self.conn.clone();
        let raw: Option<i64> = conn.get(lastseen_key(device_id)).await.context("get_last_seen failed")?;
        Ok(raw.and_then(|ts| Utc.timestamp_opt(ts, 0).single()))
    }

    async fn clear_status(&self, device_id: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>((liveness_key(device_id), lastseen_key(device_id)))
            .await
            .context("clear_status failed")?;
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut keys: Vec<String> = conn.keys("iotflow:liveness:*").await.context("clear_all scan failed")?;
        keys.extend(conn.keys::<_, Vec<String>>("iotflow:lastseen:*").await.context("clear_all scan failed")?);
        if !keys.is_empty() {
            conn.del::<_, ()>(keys).await.context("clear_all delete failed")?;
        }
        Ok(())
    }

    async fn rate_limit(&self, key: &str, limit: u32, window: Duration) -> Result<RateLimitOutcome> {
        let mut conn = self.conn.clone();
        let full_key = format!("iotflow:ratelimit:{key}");
        let window_secs = window.as_secs().max(1);

        // `Script::invoke_async` handles EVALSHA-with-EVAL-fallback on a
        // NOSCRIPT cache miss internally — no manual SHA bookkeeping needed.
        let (count, ttl): (u32, i64) = redis::Script::new(RATE_LIMIT_SCRIPT)
            .key(&full_key)
            .arg(window_secs)
            .invoke_async(&mut conn)
            .await
            .context("rate_limit script invocation failed")?;

        let reset_at = chrono::Utc::now().timestamp() + ttl.max(0);
        Ok(RateLimitOutcome {
            allowed: count <= limit,
            limit,
            remaining: limit.saturating_sub(count),
            reset_at,
        })
    }

    async fn stats(&self) -> Result<CacheStats> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys("iotflow:liveness:*").await.context("stats scan failed")?;
        Ok(CacheStats { online_devices: keys.len() as u64 })
    }
}

/// In-process test double used by unit tests across the crate so auth
/// and rate-limit logic can be exercised without a live Redis instance
/// (spec's "Test tooling" ambient-stack requirement).
#[derive(Default)]
pub struct InMemoryLivenessCache {
    online: Mutex<HashMap<i64, (DateTime<Utc>, std::time::Instant)>>,
    ttls: Mutex<HashMap<i64, Duration>>,
    counters: Mutex<HashMap<String, (u32, std::time::Instant)>>,
}

impl InMemoryLivenessCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LivenessCache for InMemoryLivenessCache {
    async fn set_online(&self, device_id: i64, seen_at: DateTime<Utc>, ttl: Duration) -> Result<()> {
        self.online.lock().await.insert(device_id, (seen_at, std::time::Instant::now()));
        self.ttls.lock().await.insert(device_id, ttl);
        Ok(())
    }

    async fn get_status(&self, device_id: i64) -> Result<LivenessStatus> {
        let online = self.online.lock().await;
        let ttls = self.ttls.lock().await;
        match (online.get(&device_id), ttls.get(&device_id)) {
            (Some((_, recorded_at)), Some(ttl)) if recorded_at.elapsed() < *ttl => Ok(LivenessStatus::Online),
            _ => Ok(LivenessStatus::Offline),
        }
    }

    async fn get_last_seen(&self, device_id: i64) -> Result<Option<DateTime<Utc>>> {
        Ok(self.online.lock().await.get(&device_id).map(|(seen_at, _)| *seen_at))
    }

    async fn clear_status(&self, device_id: i64) -> Result<()> {
        self.online.lock().await.remove(&device_id);
        self.ttls.lock().await.remove(&device_id);
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        self.online.lock().await.clear();
        self.ttls.lock().await.clear();
        Ok(())
    }

    async fn rate_limit(&self, key: &str, limit: u32, window: Duration) -> Result<RateLimitOutcome> {
        let mut counters = self.counters.lock().await;
        let now = std::time::Instant::now();
        let entry = counters.entry(key.to_string()).or_insert((0, now));

        if entry.1.elapsed() >= window {
            *entry = (0, now);
        }
        entry.0 += 1;

        let reset_at = chrono::Utc::now().timestamp() + window.as_secs() as i64;
        Ok(RateLimitOutcome {
            allowed: entry.0 <= limit,
            limit,
            remaining: limit.saturating_sub(entry.0),
            reset_at,
        })
    }

    async fn stats(&self) -> Result<CacheStats> {
        let online = self.online.lock().await;
        let ttls = self.ttls.lock().await;
        let count = online
            .iter()
            .filter(|(id, (_, recorded_at))| ttls.get(id).is_some_and(|ttl| recorded_at.elapsed() < *ttl))
            .count();
        Ok(CacheStats { online_devices: count as u64 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_device_is_offline() {
        let cache = InMemoryLivenessCache::new();
        assert_eq!(cache.get_status(1).await.unwrap(), LivenessStatus::Offline);
    }

    #[tokio::test]
    async fn set_online_then_get_status_reports_online() {
        let cache = InMemoryLivenessCache::new();
        cache.set_online(1, Utc::now(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get_status(1).await.unwrap(), LivenessStatus::Online);
    }

    #[tokio::test]
    async fn set_online_records_seen_at_for_later_retrieval() {
        let cache = InMemoryLivenessCache::new();
        let seen_at = Utc::now() - chrono::Duration::seconds(30);
        cache.set_online(1, seen_at, Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get_last_seen(1).await.unwrap().unwrap().timestamp(), seen_at.timestamp());
    }

    #[tokio::test]
    async fn clear_status_reverts_to_offline() {
        let cache = InMemoryLivenessCache::new();
        cache.set_online(1, Utc::now(), Duration::from_secs(60)).await.unwrap();
        cache.clear_status(1).await.unwrap();
        assert_eq!(cache.get_status(1).await.unwrap(), LivenessStatus::Offline);
    }

    #[tokio::test]
    async fn rate_limit_allows_up_to_limit_then_blocks() {
        let cache = InMemoryLivenessCache::new();
        for _ in 0..5 {
            let outcome = cache.rate_limit("device:1", 5, Duration::from_secs(60)).await.unwrap();
            assert!(outcome.allowed);
        }
        let sixth = cache.rate_limit("device:1", 5, Duration::from_secs(60)).await.unwrap();
        assert!(!sixth.allowed);
        assert_eq!(sixth.remaining, 0);
    }

    #[tokio::test]
    async fn rate_limit_keys_are_independent() {
        let cache = InMemoryLivenessCache::new();
        for _ in 0..5 {
            cache.rate_limit("device:1", 5, Duration::from_secs(60)).await.unwrap();
        }
        let other = cache.rate_limit("device:2", 5, Duration::from_secs(60)).await.unwrap();
        assert!(other.allowed);
    }

    #[tokio::test]
    async fn stats_counts_only_live_entries() {
        let cache = InMemoryLivenessCache::new();
        cache.set_online(1, Utc::now(), Duration::from_secs(60)).await.unwrap();
        cache.set_online(2, Utc::now(), Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.online_devices, 1);
    }

    #[tokio::test]
    async fn clear_all_removes_every_device() {
        let cache = InMemoryLivenessCache::new();
        cache.set_online(1, Utc::now(), Duration::from_secs(60)).await.unwrap();
        cache.set_online(2, Utc::now(), Duration::from_secs(60)).await.unwrap();
        cache.clear_all().await.unwrap();
        assert_eq!(cache.stats().await.unwrap().online_devices, 0);
    }
}
