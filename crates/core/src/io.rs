//! Hardware seams. Backends (ADS1115 + rppal, or the simulator) implement
//! these; the control loop only ever sees the traits.

use anyhow::Result;

/// An analog-to-digital converter with one or more physical inputs.
pub trait AnalogSource {
    /// Run a single conversion on physical input `input` and return the raw
    /// value in converter-native units.
    fn convert(&mut self, input: u8) -> Result<u16>;
}

/// A binary output line (valve relay, mux address bit, mux enable).
pub trait DigitalOutput {
    /// Drive the line high (`true`) or low (`false`).
    fn set_level(&mut self, high: bool);
}
