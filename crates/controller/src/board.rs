//! Hardware backend seam and zone registry assembly.
//!
//! The `gpio` feature selects the Raspberry Pi backend (ADS1115 over I2C,
//! rppal GPIO); otherwise the simulator is used.

use anyhow::{Context, Result};

use irrigation_core::io::{AnalogSource, DigitalOutput};
use irrigation_core::{pulse_counter, ChannelReader, MuxBus, PulseEdge, Zone};

use crate::config::{Config, SensorSection, Strategy, ZoneEntry};

#[cfg(feature = "gpio")]
pub use crate::gpio::{GpioBoard as ActiveBoard, ADC_FULL_SCALE, DIRECT_INPUTS};

#[cfg(all(feature = "sim", not(feature = "gpio")))]
pub use crate::sim::{SimBoard as ActiveBoard, ADC_FULL_SCALE, DIRECT_INPUTS};

pub type Line = Box<dyn DigitalOutput + Send>;

/// Everything the control loop needs from one hardware backend.
///
/// The board itself must outlive the control loop: it owns resources (held
/// enable line, interrupt registrations, simulator threads) that stop
/// working when dropped.
pub trait Board {
    fn converter(&mut self, sensors: &SensorSection) -> Result<Box<dyn AnalogSource + Send>>;

    /// Output line for mux address bit `bit`.
    fn address_line(&mut self, pin: u8, bit: u8) -> Result<Line>;

    /// Drive the active-low mux enable low and keep it there.
    fn enable_mux(&mut self, pin: u8) -> Result<()>;

    fn valve(&mut self, zone: &ZoneEntry, active_low: bool) -> Result<Line>;

    /// Route rising edges on `pin` to `edge`.
    fn flow_meter(&mut self, zone: &ZoneEntry, pin: u8, edge: PulseEdge) -> Result<()>;
}

/// Reader and zone registry ready to move into the control loop.
pub struct Assembly {
    pub reader: ChannelReader,
    pub zones: Vec<Zone>,
}

/// Open the backend selected at build time.
pub fn open(cfg: &Config) -> Result<ActiveBoard> {
    ActiveBoard::open(cfg)
}

/// Build the channel reader and the zone registry on `board`.
///
/// Valves come up closed and flow counters are wired before the loop
/// starts; the loop discards any pulses counted in between.
pub fn assemble<B: Board>(cfg: &Config, board: &mut B) -> Result<Assembly> {
    let adc = board
        .converter(&cfg.sensors)
        .context("failed to open analog converter")?;

    let reader = match cfg.sensors.strategy {
        Strategy::Direct => ChannelReader::direct(adc),
        Strategy::Multiplexed => {
            if let Some(pin) = cfg.sensors.enable_pin {
                board
                    .enable_mux(pin as u8)
                    .with_context(|| format!("failed to enable mux on gpio {pin}"))?;
            }
            let lines = cfg
                .sensors
                .address_pins
                .iter()
                .enumerate()
                .map(|(bit, &pin)| {
                    board
                        .address_line(pin as u8, bit as u8)
                        .with_context(|| format!("failed to open mux address gpio {pin}"))
                })
                .collect::<Result<Vec<_>>>()?;
            let bus = MuxBus::new(lines, cfg.sensors.signal_input as u8, cfg.settle())?;
            ChannelReader::multiplexed(adc, bus)
        }
    };

    let mut zones = Vec::with_capacity(cfg.zones.len());
    for entry in &cfg.zones {
        let valve = board
            .valve(entry, cfg.valves.active_low)
            .with_context(|| format!("failed to open valve for zone '{}'", entry.zone_id))?;

        let mut zone = Zone::new(
            entry.zone_id.clone(),
            entry.moisture_channel as u8,
            cfg.bounds_for(entry),
            valve,
        )
        .with_threshold(Config::threshold_for(entry));

        if let Some(pin) = entry.flow_pin {
            let (counter, edge) = pulse_counter();
            board.flow_meter(entry, pin as u8, edge).with_context(|| {
                format!("failed to attach flow meter for zone '{}'", entry.zone_id)
            })?;
            zone = zone.with_flow(counter);
        }

        tracing::info!(
            zone = %entry.zone_id,
            channel = entry.moisture_channel,
            valve_pin = entry.valve_pin,
            flow_pin = ?entry.flow_pin,
            threshold = zone.threshold(),
            "zone registered"
        );
        zones.push(zone);
    }

    Ok(Assembly { reader, zones })
}

// ===========================================================================
// Tests
// ===========================================================================
