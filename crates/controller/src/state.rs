//! In-memory controller status served by the web endpoint.

use anyhow::Result;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use irrigation_core::{TelemetrySink, ValveState, ZoneSnapshot};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedStatus = Arc<RwLock<StatusState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct StatusState {
    pub started_at: Instant,
    pub node_id: String,
    pub mqtt_connected: bool,
    pub batches: u64,
    pub zones: Vec<ZoneSnapshot>,
    pub updated_at: Option<OffsetDateTime>,
    pub events: VecDeque<StatusEvent>,
}

#[derive(Clone, Serialize)]
pub struct StatusEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Valve,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub ticks: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
    pub zones: Vec<ZoneSnapshot>,
    pub events: Vec<StatusEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl StatusState {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            started_at: Instant::now(),
            node_id: node_id.into(),
            mqtt_connected: false,
            batches: 0,
            zones: Vec::new(),
            updated_at: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared(node_id: impl Into<String>) -> SharedStatus {
        Arc::new(RwLock::new(Self::new(node_id)))
    }

    /// Replace the zone table with `batch`, logging an event per valve
    /// change.
    pub fn record_batch(&mut self, batch: &[ZoneSnapshot]) {
        let changes: Vec<(String, ValveState)> = batch
            .iter()
            .filter(|snap| {
                let before = self
                    .zones
                    .iter()
                    .find(|z| z.zone_id == snap.zone_id)
                    .map(|z| z.valve)
                    .unwrap_or_default();
                before != snap.valve
            })
            .map(|snap| (snap.zone_id.clone(), snap.valve))
            .collect();

        for (zone_id, valve) in changes {
            self.push_event(EventKind::Valve, format!("{zone_id} {valve}"));
        }

        self.zones = batch.to_vec();
        self.batches += 1;
        self.updated_at = Some(OffsetDateTime::now_utc());
    }

    pub fn set_mqtt_connected(&mut self, connected: bool) {
        if self.mqtt_connected != connected {
            self.mqtt_connected = connected;
            let detail = if connected {
                "mqtt connected"
            } else {
                "mqtt disconnected"
            };
            self.push_event(EventKind::System, detail.to_string());
        }
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            node_id: self.node_id.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            ticks: self.batches,
            updated_at: self.updated_at,
            zones: self.zones.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(StatusEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// Feeds control-loop batches into the shared status.
///
/// Runs on the control thread, so it never waits for the lock: a batch that
/// arrives while a request holds the read guard is skipped and the next one
/// lands instead.
pub struct StatusBoard {
    shared: SharedStatus,
    skipped: u64,
}

impl StatusBoard {
    pub fn new(shared: SharedStatus) -> Self {
        Self { shared, skipped: 0 }
    }
}

impl TelemetrySink for StatusBoard {
    fn publish(&mut self, batch: &[ZoneSnapshot]) -> Result<()> {
        match self.shared.try_write() {
            Ok(mut st) => {
                st.record_batch(batch);
                Ok(())
            }
            Err(_) => {
                self.skipped += 1;
                anyhow::bail!("status busy, batch skipped ({} so far)", self.skipped)
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
