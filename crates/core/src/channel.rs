//! Raw sample acquisition for logical sensor channels.
//!
//! Two strategies, fixed at construction:
//!
//! - **Direct**: the logical channel is the converter's physical input.
//! - **Multiplexed**: a shared converter input sits behind an analog mux.
//!   Selecting a channel drives the address lines (LSB first) to the
//!   channel's binary index, then waits a settle delay before converting.

use std::thread;
use std::time::Duration;

use anyhow::{ensure, Result};

use crate::io::{AnalogSource, DigitalOutput};

/// Settle time after switching the mux before the signal is valid.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(5);

type Line = Box<dyn DigitalOutput + Send>;

/// Address bus of an analog multiplexer in front of one converter input.
pub struct MuxBus {
    lines: Vec<Line>,
    signal_input: u8,
    settle: Duration,
}

impl MuxBus {
    /// `lines` are ordered least-significant bit first. All lines are driven
    /// low so the bus starts on channel 0.
    pub fn new(mut lines: Vec<Line>, signal_input: u8, settle: Duration) -> Result<Self> {
        ensure!(!lines.is_empty(), "mux bus needs at least one address line");
        ensure!(
            lines.len() <= 8,
            "mux bus has {} address lines, at most 8 supported",
            lines.len()
        );
        for line in &mut lines {
            line.set_level(false);
        }
        Ok(Self {
            lines,
            signal_input,
            settle,
        })
    }

    /// Number of channels addressable by this bus.
    pub fn capacity(&self) -> usize {
        1 << self.lines.len()
    }

    fn select(&mut self, channel: u8) {
        for (bit, line) in self.lines.iter_mut().enumerate() {
            line.set_level((channel >> bit) & 1 == 1);
        }
    }
}

/// Number of address lines needed to reach `channel_count` channels,
/// i.e. `ceil(log2(channel_count))`, never less than one.
pub fn address_width(channel_count: usize) -> usize {
    if channel_count <= 2 {
        return 1;
    }
    (usize::BITS - (channel_count - 1).leading_zeros()) as usize
}

enum Strategy {
    Direct,
    Multiplexed(MuxBus),
}

/// Reads raw samples for logical channels using one fixed strategy.
///
/// Multiplexed reads mutate the shared address lines, which is why `read`
/// takes `&mut self`: only the control-loop thread owns the reader.
pub struct ChannelReader {
    adc: Box<dyn AnalogSource + Send>,
    strategy: Strategy,
}

impl ChannelReader {
    pub fn direct(adc: Box<dyn AnalogSource + Send>) -> Self {
        Self {
            adc,
            strategy: Strategy::Direct,
        }
    }

    pub fn multiplexed(adc: Box<dyn AnalogSource + Send>, bus: MuxBus) -> Self {
        Self {
            adc,
            strategy: Strategy::Multiplexed(bus),
        }
    }

    pub fn is_multiplexed(&self) -> bool {
        matches!(self.strategy, Strategy::Multiplexed(_))
    }

    /// Acquire one raw sample for `channel`.
    ///
    /// Out-of-range values are returned as-is; only converter transport
    /// failures are errors.
    pub fn read(&mut self, channel: u8) -> Result<u16> {
        match &mut self.strategy {
            Strategy::Direct => self.adc.convert(channel),
            Strategy::Multiplexed(bus) => {
                ensure!(
                    (channel as usize) < bus.capacity(),
                    "channel {channel} not addressable by {}-line mux",
                    bus.lines.len()
                );
                bus.select(channel);
                if !bus.settle.is_zero() {
                    thread::sleep(bus.settle);
                }
                self.adc.convert(bus.signal_input)
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
