//! Raspberry Pi backend: ADS1115 over I2C, relay valves and flow-meter
//! interrupts via rppal GPIO.

use anyhow::Result;
use rppal::gpio::{Gpio, InputPin, OutputPin, Trigger};

use irrigation_core::io::{AnalogSource, DigitalOutput};
use irrigation_core::PulseEdge;

use crate::adc::{Ads1115, FULL_SCALE, MAX_INPUT};
use crate::board::{Board, Line};
use crate::config::{Config, SensorSection, ZoneEntry};

/// ADS1115 single-ended full scale.
pub const ADC_FULL_SCALE: i64 = FULL_SCALE as i64;

/// Single-ended inputs on the ADS1115.
pub const DIRECT_INPUTS: usize = MAX_INPUT as usize + 1;

/// Relay line. The core asks for "high = open"; active-low boards invert
/// that at the pin.
struct RelayLine {
    pin: OutputPin,
    active_low: bool,
}

impl DigitalOutput for RelayLine {
    fn set_level(&mut self, high: bool) {
        if high != self.active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
    }
}

/// Mux address line.
struct AddressLine(OutputPin);

impl DigitalOutput for AddressLine {
    fn set_level(&mut self, high: bool) {
        if high {
            self.0.set_high();
        } else {
            self.0.set_low();
        }
    }
}

/// Real board. Pins held here stay configured until the board drops.
pub struct GpioBoard {
    gpio: Gpio,
    #[allow(dead_code)]
    held: Vec<OutputPin>,
    /// Dropping an input cancels its interrupt.
    #[allow(dead_code)]
    flow_inputs: Vec<InputPin>,
}

impl GpioBoard {
    pub fn open(_cfg: &Config) -> Result<Self> {
        let gpio = Gpio::new()?;
        tracing::info!("gpio board initialised");
        Ok(Self {
            gpio,
            held: Vec::new(),
            flow_inputs: Vec::new(),
        })
    }
}

impl Board for GpioBoard {
    fn converter(&mut self, sensors: &SensorSection) -> Result<Box<dyn AnalogSource + Send>> {
        Ok(Box::new(Ads1115::new(sensors.i2c_addr)?))
    }

    fn address_line(&mut self, pin: u8, bit: u8) -> Result<Line> {
        let out = self.gpio.get(pin)?.into_output_low();
        tracing::debug!(gpio = pin, bit, "mux address line");
        Ok(Box::new(AddressLine(out)))
    }

    fn enable_mux(&mut self, pin: u8) -> Result<()> {
        let out = self.gpio.get(pin)?.into_output_low();
        self.held.push(out);
        tracing::debug!(gpio = pin, "mux enabled");
        Ok(())
    }

    fn valve(&mut self, zone: &ZoneEntry, active_low: bool) -> Result<Line> {
        let pin = self.gpio.get(zone.valve_pin as u8)?;

        // Fail-safe: relay OFF from the moment the line becomes an output.
        let out = if active_low {
            pin.into_output_high()
        } else {
            pin.into_output_low()
        };
        tracing::debug!(zone = %zone.zone_id, gpio = zone.valve_pin, active_low, "valve line");
        Ok(Box::new(RelayLine {
            pin: out,
            active_low,
        }))
    }

    fn flow_meter(&mut self, zone: &ZoneEntry, pin: u8, edge: PulseEdge) -> Result<()> {
        let mut input = self.gpio.get(pin)?.into_input_pulldown();
        input.set_async_interrupt(Trigger::RisingEdge, None, move |_event| edge.record())?;
        self.flow_inputs.push(input);
        tracing::debug!(zone = %zone.zone_id, gpio = pin, "flow meter interrupt armed");
        Ok(())
    }
}
