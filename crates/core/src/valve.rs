//! Threshold valve control.
//!
//! ```text
//! Closed ──[percent < threshold]──▶ Open
//!   ▲                                │
//!   └────[percent >= threshold]──────┘
//! ```
//!
//! There is no hysteresis band: a reading hovering on the threshold makes
//! the valve chatter.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::zone::Zone;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValveState {
    Open,
    #[default]
    Closed,
}

impl ValveState {
    /// Logic level on the valve output: `Open` is high.
    pub fn level(self) -> bool {
        matches!(self, Self::Open)
    }
}

impl fmt::Display for ValveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// `Open` iff the soil is drier than the threshold.
pub fn decide(percent: f32, threshold: f32) -> ValveState {
    if percent < threshold {
        ValveState::Open
    } else {
        ValveState::Closed
    }
}

/// Decide from the zone's current moisture and drive its output.
///
/// The output is re-driven every call, changed or not.
pub fn actuate(zone: &mut Zone) -> ValveState {
    let next = decide(zone.moisture_percent, zone.threshold());
    zone.valve_output.set_level(next.level());

    if next != zone.valve {
        tracing::info!(
            zone = %zone.id(),
            moisture = format!("{:.1}", zone.moisture_percent),
            threshold = format!("{:.1}", zone.threshold()),
            from = %zone.valve,
            to = %next,
            "valve state change"
        );
        zone.valve = next;
    }
    next
}

/// Re-drive the zone's output at its held state without deciding.
pub(crate) fn reassert(zone: &mut Zone) {
    zone.valve_output.set_level(zone.valve.level());
}

// ===========================================================================
// Tests
// ===========================================================================
