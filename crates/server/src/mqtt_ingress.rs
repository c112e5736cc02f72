//! MQTT Ingress: a single `rumqttc` session supervisor subscribed to the
//! device telemetry/status topic tree, dispatching parsed envelopes into
//! the same Telemetry Pipeline / Liveness Cache used by the HTTP ingress.

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use crate::auth::{AuthService, TelemetryAuthorization};
use crate::cache::LivenessCache;
use crate::config::RateLimitSettings;
use crate::credential_store::CredentialStore;
use crate::health::MqttHealthFlag;
use crate::models::{StatusEnvelope, TelemetryEnvelope};
use crate::telemetry::TelemetryPipeline;

const TELEMETRY_WILDCARD: &str = "iotflow/devices/+/telemetry/#";
const STATUS_WILDCARD: &str = "iotflow/devices/+/status/#";
const COMMANDS_WILDCARD: &str = "iotflow/devices/+/commands/#";
const OFFLINE_TOPIC: &str = "$SYS/iotflow/ingress/offline";

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_FACTOR: u32 = 2;
const RECONNECT_CEILING: Duration = Duration::from_secs(30);

const INBOX_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageKind {
    Telemetry,
    Status,
}

struct InboxMessage {
    kind: MessageKind,
    device_id: i64,
    payload: Vec<u8>,
}

/// Bounded FIFO with priority-aware backpressure: telemetry volume is
/// high and individual points are cheap to lose, status messages are
/// rare and carry liveness/auth signal. When full, a push evicts the
/// oldest queued telemetry message rather than refusing the new one;
/// only when the queue is wall-to-wall status does it fall back to
/// dropping the incoming message.
struct Inbox {
    queue: Mutex<VecDeque<InboxMessage>>,
    notify: Notify,
    capacity: usize,
}

impl Inbox {
    fn new(capacity: usize) -> Self {
        Self { queue: Mutex::new(VecDeque::with_capacity(capacity)), notify: Notify::new(), capacity }
    }

    async fn push(&self, message: InboxMessage) {
        let mut queue = self.queue.lock().await;
        if queue.len() >= self.capacity {
            let oldest_telemetry = queue.iter().position(|m| m.kind == MessageKind::Telemetry);
            match oldest_telemetry {
                Some(index) => {
                    queue.remove(index);
                    tracing::warn!("mqtt inbox full, dropped oldest queued telemetry message to make room");
                }
                None => {
                    tracing::warn!(
                        kind = ?message.kind,
                        device_id = message.device_id,
                        "mqtt inbox full of status messages, dropping incoming message"
                    );
                    return;
                }
            }
        }
        queue.push_back(message);
        drop(queue);
        self.notify.notify_one();
    }

    async fn pop(&self) -> InboxMessage {
        loop {
            {
                let mut queue = self.queue.lock().await;
                if let Some(message) = queue.pop_front() {
                    return message;
                }
            }
            self.notify.notified().await;
        }
    }
}

pub struct MqttIngress {
    client: AsyncClient,
}

impl MqttIngress {
    /// Start the supervisor task and return a handle that owns the
    /// publish-capable client (used elsewhere to push outbound commands,
    /// if the deployment wires that up).
    pub fn spawn(
        host: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        pipeline: Arc<TelemetryPipeline>,
        auth: Arc<AuthService>,
        store: Arc<CredentialStore>,
        cache: Arc<dyn LivenessCache>,
        rate_limits: RateLimitSettings,
        heartbeat_ttl: Duration,
        mqtt_flag: Arc<MqttHealthFlag>,
    ) -> Self {
        let client_id = format!("iotflow-ingress-{}", uuid::Uuid::new_v4());
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(false);
        options.set_last_will(LastWill::new(OFFLINE_TOPIC, b"offline".to_vec(), QoS::AtLeastOnce, true));
        if let (Some(user), Some(pass)) = (username, password) {
            options.set_credentials(user, pass);
        }

        let (client, event_loop) = AsyncClient::new(options, INBOX_CAPACITY);
        let inbox = Arc::new(Inbox::new(INBOX_CAPACITY));

        tokio::spawn(supervise(client.clone(), event_loop, inbox.clone(), mqtt_flag));
        tokio::spawn(drain(inbox, pipeline, auth, store, cache, rate_limits, heartbeat_ttl));

        Self { client }
    }

    pub async fn shutdown(&self) {
        if let Err(err) = self.client.disconnect().await {
            tracing::warn!(error = %err, "error disconnecting mqtt client during shutdown");
        }
    }
}

/// Owns the broker connection: subscribes on every successful connect,
/// feeds parsed inbound messages onto the bounded inbox channel, and
/// reconnects with exponential backoff on any event-loop error.
async fn supervise(
    client: AsyncClient,
    mut event_loop: EventLoop,
    inbox: Arc<Inbox>,
    mqtt_flag: Arc<MqttHealthFlag>,
) {
    let mut backoff = RECONNECT_BASE;

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                backoff = RECONNECT_BASE;
                mqtt_flag.set_healthy(true);
                for topic in [TELEMETRY_WILDCARD, STATUS_WILDCARD, COMMANDS_WILDCARD] {
                    if let Err(err) = client.subscribe(topic, QoS::AtLeastOnce).await {
                        tracing::error!(error = %err, topic, "mqtt subscribe failed");
                    }
                }
                tracing::info!("mqtt ingress connected and resubscribed");
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if let Some((kind, device_id)) = parse_topic(&publish.topic) {
                    inbox.push(InboxMessage { kind, device_id, payload: publish.payload.to_vec() }).await;
                }
            }
            Ok(_) => {}
            Err(err) => {
                mqtt_flag.set_healthy(false);
                tracing::warn!(error = %err, backoff_secs = backoff.as_secs(), "mqtt event loop error, reconnecting");
                tokio::time::sleep(backoff).await;
                backoff = std::cmp::min(backoff * RECONNECT_FACTOR, RECONNECT_CEILING);
            }
        }
    }
}

/// Parse `iotflow/devices/{id}/{telemetry|status}/{suffix}` into a
/// dispatchable (kind, device_id) pair. Unknown shapes (including the
/// outbound `commands/*` topics we subscribe to only for loopback
/// verification) are silently ignored.
fn parse_topic(topic: &str) -> Option<(MessageKind, i64)> {
    let mut parts = topic.split('/');
    if parts.next()? != "iotflow" || parts.next()? != "devices" {
        return None;
    }
    let device_id: i64 = parts.next()?.parse().ok()?;
    let kind = match parts.next()? {
        "telemetry" => MessageKind::Telemetry,
        "status" => MessageKind::Status,
        _ => return None,
    };
    Some((kind, device_id))
}

#[derive(Debug, Deserialize)]
struct MqttTelemetryBody {
    api_key: String,
    #[serde(default)]
    timestamp: Option<chrono::DateTime<chrono::Utc>>,
    data: std::collections::HashMap<String, serde_json::Value>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

async fn drain(
    inbox: Arc<Inbox>,
    pipeline: Arc<TelemetryPipeline>,
    auth: Arc<AuthService>,
    store: Arc<CredentialStore>,
    cache: Arc<dyn LivenessCache>,
    rate_limits: RateLimitSettings,
    heartbeat_ttl: Duration,
) {
    loop {
        let message = inbox.pop().await;
        match message.kind {
            MessageKind::Telemetry => {
                if let Err(err) = handle_telemetry(&message, &pipeline, &cache, &rate_limits).await {
                    tracing::warn!(device_id = message.device_id, error = %err, "mqtt telemetry message rejected");
                }
            }
            MessageKind::Status => {
                if let Err(err) =
                    handle_status(&message, &auth, &store, &cache, &rate_limits, heartbeat_ttl).await
                {
                    tracing::warn!(device_id = message.device_id, error = %err, "mqtt status message rejected");
                }
            }
        }
    }
}

async fn check_rate_limit(cache: &Arc<dyn LivenessCache>, device_id: i64, scope: &str, rule: &crate::config::RateLimitRule) -> Result<()> {
    let key = format!("{scope}:{device_id}");
    let outcome = cache.rate_limit(&key, rule.limit, rule.window).await.context("rate limit check failed")?;
    if !outcome.allowed {
        anyhow::bail!("rate limit exceeded for {key}");
    }
    Ok(())
}

async fn handle_telemetry(
    message: &InboxMessage,
    pipeline: &TelemetryPipeline,
    cache: &Arc<dyn LivenessCache>,
    rate_limits: &RateLimitSettings,
) -> Result<()> {
    check_rate_limit(cache, message.device_id, "telemetry", &rate_limits.telemetry).await?;

    let body: MqttTelemetryBody =
        serde_json::from_slice(&message.payload).context("malformed mqtt telemetry payload")?;

    let envelope = TelemetryEnvelope {
        device_id: Some(message.device_id),
        api_key: body.api_key,
        timestamp: body.timestamp,
        data: body.data,
        metadata: body.metadata,
    };

    pipeline
        .ingest(envelope)
        .await
        .map(|_| ())
        .map_err(|err| anyhow::anyhow!("pipeline rejected mqtt telemetry: {err}"))
}

async fn handle_status(
    message: &InboxMessage,
    auth: &AuthService,
    store: &Arc<CredentialStore>,
    cache: &Arc<dyn LivenessCache>,
    rate_limits: &RateLimitSettings,
    heartbeat_ttl: Duration,
) -> Result<()> {
    check_rate_limit(cache, message.device_id, "heartbeat", &rate_limits.heartbeat).await?;

    let body: StatusEnvelope =
        serde_json::from_slice(&message.payload).context("malformed mqtt status payload")?;
    let _ = body.status;

    let device = auth
        .authenticate(&body.api_key)
        .await
        .context("auth lookup failed for mqtt status message")?
        .context("unknown api_key on mqtt status message")?;
    if device.id != message.device_id {
        anyhow::bail!("api_key does not belong to topic device_id {}", message.device_id);
    }
    if auth.authorize_heartbeat(&device) == TelemetryAuthorization::DeviceSuspended {
        anyhow::bail!("device {} is suspended, refusing mqtt status message", device.id);
    }

    let seen_at = chrono::Utc::now();
    cache
        .set_online(device.id, seen_at, heartbeat_ttl)
        .await
        .context("liveness cache update failed for mqtt status message")?;
    store
        .touch_last_seen(device.id, seen_at)
        .await
        .context("store last_seen update failed for mqtt status message")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_telemetry_topic() {
        let (kind, id) = parse_topic("iotflow/devices/42/telemetry/sensors").unwrap();
        assert_eq!(kind, MessageKind::Telemetry);
        assert_eq!(id, 42);
    }

    #[test]
    fn parses_status_topic() {
        let (kind, id) = parse_topic("iotflow/devices/7/status/heartbeat").unwrap();
        assert_eq!(kind, MessageKind::Status);
        assert_eq!(id, 7);
    }

    #[test]
    fn ignores_commands_topic() {
        assert!(parse_topic("iotflow/devices/7/commands/control").is_none());
    }

    #[test]
    fn ignores_malformed_device_id() {
        assert!(parse_topic("iotflow/devices/not-a-number/telemetry/sensors").is_none());
    }

    #[test]
    fn ignores_unrelated_namespace() {
        assert!(parse_topic("other/devices/7/telemetry/sensors").is_none());
    }

    fn msg(kind: MessageKind, device_id: i64) -> InboxMessage {
        InboxMessage { kind, device_id, payload: Vec::new() }
    }

    #[tokio::test]
    async fn full_inbox_evicts_oldest_telemetry_to_make_room_for_status() {
        let inbox = Inbox::new(2);
        inbox.push(msg(MessageKind::Telemetry, 1)).await;
        inbox.push(msg(MessageKind::Telemetry, 2)).await;
        inbox.push(msg(MessageKind::Status, 3)).await;

        let first = inbox.pop().await;
        assert_eq!((first.kind, first.device_id), (MessageKind::Telemetry, 2));
        let second = inbox.pop().await;
        assert_eq!((second.kind, second.device_id), (MessageKind::Status, 3));
    }

    #[tokio::test]
    async fn full_inbox_of_status_messages_drops_newest_incoming() {
        let inbox = Inbox::new(1);
        inbox.push(msg(MessageKind::Status, 1)).await;
        inbox.push(msg(MessageKind::Status, 2)).await;

        let only = inbox.pop().await;
        assert_eq!(only.device_id, 1);
    }
}
