//! MQTT telemetry publishing.

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::sync::oneshot;
use tokio::time::sleep;

use irrigation_core::{TelemetrySink, ZoneSnapshot};

use crate::config::MqttSection;
use crate::state::SharedStatus;

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub(crate) struct TelemetryMsg<'a> {
    pub(crate) ts: i64,
    pub(crate) zones: &'a [ZoneSnapshot],
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// "tele/<node_id>/zones"
pub(crate) fn telemetry_topic(node_id: &str) -> String {
    format!("tele/{node_id}/zones")
}

pub(crate) fn encode(ts: i64, zones: &[ZoneSnapshot]) -> Result<Vec<u8>> {
    serde_json::to_vec(&TelemetryMsg { ts, zones }).context("failed to encode telemetry")
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// Publishes zone batches to `tele/<node_id>/zones`, at most once per
/// `interval`.
///
/// Uses `try_publish`, so a full request queue (broker down) drops the
/// batch instead of stalling the control thread.
pub struct MqttSink {
    client: AsyncClient,
    topic: String,
    interval: Duration,
    last: Option<Instant>,
}

impl MqttSink {
    pub fn new(client: AsyncClient, node_id: &str, interval: Duration) -> Self {
        Self {
            client,
            topic: telemetry_topic(node_id),
            interval,
            last: None,
        }
    }

    fn due(&self, now: Instant) -> bool {
        self.last
            .map_or(true, |t| now.saturating_duration_since(t) >= self.interval)
    }
}

impl TelemetrySink for MqttSink {
    fn publish(&mut self, batch: &[ZoneSnapshot]) -> Result<()> {
        let now = Instant::now();
        if !self.due(now) {
            return Ok(());
        }
        self.last = Some(now);

        let payload = encode(now_unix(), batch)?;
        self.client
            .try_publish(self.topic.as_str(), QoS::AtMostOnce, false, payload)
            .with_context(|| format!("publish to {} failed", self.topic))
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Start the MQTT event loop and wait up to `connect_timeout_s` for the
/// first ConnAck.
///
/// The event loop keeps reconnecting in the background either way, so the
/// returned sink starts delivering once the broker becomes reachable.
pub async fn connect(cfg: &MqttSection, node_id: &str, status: SharedStatus) -> MqttSink {
    let client_id = format!("irrigation-{node_id}");
    let mut opts = MqttOptions::new(client_id, cfg.host.clone(), cfg.port);
    opts.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(opts, 10);
    let (ready_tx, ready_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let mut ready = Some(ready_tx);
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    tracing::info!("mqtt connected");
                    status.write().await.set_mqtt_connected(true);
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(());
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    tracing::warn!("mqtt disconnected");
                    status.write().await.set_mqtt_connected(false);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("mqtt error: {e}. reconnecting...");
                    status.write().await.set_mqtt_connected(false);
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    let timeout = Duration::from_secs(cfg.connect_timeout_s);
    match tokio::time::timeout(timeout, ready_rx).await {
        Ok(Ok(())) => {}
        _ => tracing::warn!(
            host = %cfg.host,
            port = cfg.port,
            "mqtt broker not reachable after {}s, telemetry will start when it is",
            cfg.connect_timeout_s
        ),
    }

    let sink = MqttSink::new(
        client,
        node_id,
        Duration::from_millis(cfg.publish_interval_ms),
    );
    tracing::info!(topic = %sink.topic, "publishing zone telemetry");
    sink
}

// ===========================================================================
// Tests
// ===========================================================================
