//! Per-tick zone snapshots and the sinks that consume them.

use anyhow::Result;
use serde::Serialize;

use crate::valve::ValveState;

/// State of one zone at the end of a tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneSnapshot {
    pub zone_id: String,
    pub moisture_percent: f32,
    pub valve: ValveState,
    pub flow_rate: f32,
}

/// Consumer of snapshot batches.
///
/// Publishing is fire-and-forget: the control loop logs a returned error at
/// debug level and moves on. Implementations must not block the loop.
pub trait TelemetrySink {
    fn publish(&mut self, batch: &[ZoneSnapshot]) -> Result<()>;
}

/// Emits each batch as a `tracing` debug event.
#[derive(Debug, Default)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn publish(&mut self, batch: &[ZoneSnapshot]) -> Result<()> {
        let line = batch
            .iter()
            .map(|z| {
                format!(
                    "{}={:.1}%/{}/{:.2}",
                    z.zone_id, z.moisture_percent, z.valve, z.flow_rate
                )
            })
            .collect::<Vec<_>>()
            .join(" | ");
        tracing::debug!(zones = batch.len(), "{line}");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
