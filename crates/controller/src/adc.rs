//! ADS1115 16-bit ADC driver over I2C for soil moisture sensing.
//!
//! Reads single-ended inputs at PGA ±4.096 V, 128 SPS, single-shot mode.
//! Capacitive probes powered from 3.3 V land roughly between 12000 (wet)
//! and 26000 (dry) in this range.

use anyhow::{ensure, Result};
use rppal::i2c::I2c;
use std::{thread, time::Duration};

use irrigation_core::io::AnalogSource;

// ── ADS1115 register addresses ──────────────────────────────────────────────

/// Conversion result register (read-only, 16-bit signed).
const REG_CONVERSION: u8 = 0x00;
/// Configuration register (read/write).
const REG_CONFIG: u8 = 0x01;

// ── Config register bit fields ──────────────────────────────────────────────
//
// Layout (MSB first):
//   [15]    OS       : write 1 to start single-shot conversion
//   [14:12] MUX      : input multiplexer (input selection)
//   [11:9]  PGA      : programmable gain amplifier
//   [8]     MODE     : 0 = continuous, 1 = single-shot
//   [7:5]   DR       : data rate
//   [4]     COMP_MODE
//   [3]     COMP_POL
//   [2]     COMP_LAT
//   [1:0]   COMP_QUE : 11 = disable comparator (default)

/// Bits common to all reads:
///   OS=1 (start), PGA=001 (±4.096 V), MODE=1 (single-shot),
///   DR=100 (128 SPS), COMP_QUE=11 (comparator off).
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;

/// MUX values for single-ended reads (AINx vs GND).
const MUX_SHIFT: u8 = 12;
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];

/// Highest single-ended input index.
pub const MAX_INPUT: u8 = 3;

/// Largest single-ended conversion result.
pub const FULL_SCALE: u16 = 32767;

/// Conversion time at 128 SPS is ~7.8 ms.
const CONVERSION_WAIT: Duration = Duration::from_millis(9);

/// Bit 15 of the config register: conversion-ready flag when read.
const OS_READY_BIT: u16 = 1 << 15;

/// Build the config register value for a single-ended read on `input`.
fn config_for_input(input: u8) -> u16 {
    CONFIG_BASE | (MUX_SINGLE_ENDED[input as usize] << MUX_SHIFT)
}

/// Clamp a signed conversion result into the single-ended range.
fn single_ended(raw: i16) -> u16 {
    raw.max(0) as u16
}

// ── Driver ──────────────────────────────────────────────────────────────────

/// ADS1115 driver backed by `rppal::i2c`.
pub struct Ads1115 {
    i2c: I2c,
}

impl Ads1115 {
    /// Open I2C bus 1 and address the ADS1115 at `addr`.
    pub fn new(addr: u16) -> Result<Self> {
        let mut i2c = I2c::new()?;
        i2c.set_slave_address(addr)?;

        tracing::info!(addr = format_args!("0x{addr:02x}"), "ads1115 initialised");

        Ok(Self { i2c })
    }
}

impl AnalogSource for Ads1115 {
    /// Single-shot conversion on `input`, 0..=32767.
    fn convert(&mut self, input: u8) -> Result<u16> {
        ensure!(
            input <= MAX_INPUT,
            "ADS1115 input {input} out of range (0-{MAX_INPUT})"
        );

        let config = config_for_input(input);
        self.i2c.block_write(REG_CONFIG, &config.to_be_bytes())?;

        thread::sleep(CONVERSION_WAIT);

        // One wait is normally enough at 128 SPS.
        for _ in 0..3 {
            let mut buf = [0u8; 2];
            self.i2c.block_read(REG_CONFIG, &mut buf)?;
            if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }

        let mut buf = [0u8; 2];
        self.i2c.block_read(REG_CONVERSION, &mut buf)?;
        Ok(single_ended(i16::from_be_bytes(buf)))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
