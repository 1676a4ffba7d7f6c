//! Zone registry entries.

use std::fmt;

use crate::calibration::CalibrationBounds;
use crate::flow::PulseCounter;
use crate::io::DigitalOutput;
use crate::telemetry::ZoneSnapshot;
use crate::valve::ValveState;

/// Threshold percent used when a zone does not configure one.
pub const DEFAULT_THRESHOLD: f32 = 50.0;

/// One independently controlled irrigation unit.
pub struct Zone {
    id: String,
    moisture_channel: u8,
    bounds: CalibrationBounds,
    threshold: f32,
    pub(crate) valve_output: Box<dyn DigitalOutput + Send>,
    flow: Option<PulseCounter>,

    pub(crate) moisture_percent: f32,
    pub(crate) valve: ValveState,
    pub(crate) flow_rate: f32,
    pub(crate) read_failures: u32,
}

impl Zone {
    /// Build a zone with its valve driven closed.
    pub fn new(
        id: impl Into<String>,
        moisture_channel: u8,
        bounds: CalibrationBounds,
        mut valve_output: Box<dyn DigitalOutput + Send>,
    ) -> Self {
        valve_output.set_level(false);
        Self {
            id: id.into(),
            moisture_channel,
            bounds,
            threshold: DEFAULT_THRESHOLD,
            valve_output,
            flow: None,
            moisture_percent: 0.0,
            valve: ValveState::Closed,
            flow_rate: 0.0,
            read_failures: 0,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_flow(mut self, counter: PulseCounter) -> Self {
        self.flow = Some(counter);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn moisture_channel(&self) -> u8 {
        self.moisture_channel
    }

    pub fn bounds(&self) -> CalibrationBounds {
        self.bounds
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn moisture_percent(&self) -> f32 {
        self.moisture_percent
    }

    pub fn valve(&self) -> ValveState {
        self.valve
    }

    pub fn flow_rate(&self) -> f32 {
        self.flow_rate
    }

    pub fn has_flow_meter(&self) -> bool {
        self.flow.is_some()
    }

    pub(crate) fn flow_counter(&self) -> Option<&PulseCounter> {
        self.flow.as_ref()
    }

    pub fn snapshot(&self) -> ZoneSnapshot {
        ZoneSnapshot {
            zone_id: self.id.clone(),
            moisture_percent: self.moisture_percent,
            valve: self.valve,
            flow_rate: self.flow_rate,
        }
    }
}

impl fmt::Debug for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Zone")
            .field("id", &self.id)
            .field("moisture_channel", &self.moisture_channel)
            .field("bounds", &self.bounds)
            .field("threshold", &self.threshold)
            .field("flow_meter", &self.flow.is_some())
            .field("moisture_percent", &self.moisture_percent)
            .field("valve", &self.valve)
            .field("flow_rate", &self.flow_rate)
            .finish()
    }
}
