//! TOML config file loading, environment overrides, and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::time::Duration;

use irrigation_core::channel::{address_width, DEFAULT_SETTLE};
use irrigation_core::flow::{DEFAULT_PULSES_PER_UNIT, DEFAULT_TIME_BASE, DEFAULT_WINDOW};
use irrigation_core::scheduler::DEFAULT_TICK;
use irrigation_core::zone::DEFAULT_THRESHOLD;
use irrigation_core::{CalibrationBounds, FlowRateEstimator, LoopSettings};

use crate::board::{ADC_FULL_SCALE, DIRECT_INPUTS};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerSection,
    #[serde(default)]
    pub sensors: SensorSection,
    pub calibration: CalibrationSection,
    #[serde(default)]
    pub flow: FlowSection,
    #[serde(default)]
    pub valves: ValveSection,
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
    pub mqtt: Option<MqttSection>,
    pub web: Option<WebSection>,
}

#[derive(Debug, Deserialize)]
pub struct ControllerSection {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    Direct,
    Multiplexed,
}

#[derive(Debug, Deserialize)]
pub struct SensorSection {
    #[serde(default)]
    pub strategy: Strategy,
    /// Mux address pins, least-significant bit first.
    #[serde(default)]
    pub address_pins: Vec<i64>,
    /// Active-low mux enable, held low while the controller runs.
    pub enable_pin: Option<i64>,
    /// Converter input wired to the mux common output.
    #[serde(default)]
    pub signal_input: i64,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: i64,
    #[serde(default = "default_i2c_addr")]
    pub i2c_addr: u16,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CalibrationSection {
    pub driest_raw: i64,
    pub wettest_raw: i64,
}

#[derive(Debug, Deserialize)]
pub struct FlowSection {
    #[serde(default = "default_pulses_per_unit")]
    pub pulses_per_unit: f32,
    #[serde(default = "default_window_ms")]
    pub window_ms: i64,
    #[serde(default = "default_time_base_ms")]
    pub time_base_ms: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ValveSection {
    /// Many relay boards switch on a low level.
    #[serde(default)]
    pub active_low: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneEntry {
    pub zone_id: String,
    pub moisture_channel: i64,
    pub valve_pin: i64,
    pub flow_pin: Option<i64>,
    pub threshold: Option<f32>,
    pub driest_raw: Option<i64>,
    pub wettest_raw: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct MqttSection {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout_s")]
    pub connect_timeout_s: u64,
    #[serde(default = "default_publish_interval_ms")]
    pub publish_interval_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct WebSection {
    #[serde(default = "default_web_port")]
    pub port: u16,
}

fn default_node_id() -> String {
    "node-a".to_string()
}
fn default_tick_ms() -> i64 {
    DEFAULT_TICK.as_millis() as i64
}
fn default_settle_ms() -> i64 {
    DEFAULT_SETTLE.as_millis() as i64
}
fn default_i2c_addr() -> u16 {
    0x48
}
fn default_pulses_per_unit() -> f32 {
    DEFAULT_PULSES_PER_UNIT
}
fn default_window_ms() -> i64 {
    DEFAULT_WINDOW.as_millis() as i64
}
fn default_time_base_ms() -> i64 {
    DEFAULT_TIME_BASE.as_millis() as i64
}
fn default_mqtt_host() -> String {
    "127.0.0.1".to_string()
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_connect_timeout_s() -> u64 {
    5
}
fn default_publish_interval_ms() -> u64 {
    1000
}
fn default_web_port() -> u16 {
    8080
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            tick_ms: default_tick_ms(),
        }
    }
}

impl Default for SensorSection {
    fn default() -> Self {
        Self {
            strategy: Strategy::Direct,
            address_pins: Vec::new(),
            enable_pin: None,
            signal_input: 0,
            settle_ms: default_settle_ms(),
            i2c_addr: default_i2c_addr(),
        }
    }
}

impl Default for FlowSection {
    fn default() -> Self {
        Self {
            pulses_per_unit: default_pulses_per_unit(),
            window_ms: default_window_ms(),
            time_base_ms: default_time_base_ms(),
        }
    }
}

impl MqttSection {
    fn with_defaults() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            connect_timeout_s: default_connect_timeout_s(),
            publish_interval_ms: default_publish_interval_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// Physical inputs on the converter; caps `signal_input`.
const CONVERTER_INPUTS: i64 = DIRECT_INPUTS as i64;

// ---------------------------------------------------------------------------
// Derived settings
// ---------------------------------------------------------------------------

impl Config {
    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            tick: Duration::from_millis(self.controller.tick_ms as u64),
            flow_window: Duration::from_millis(self.flow.window_ms as u64),
            estimator: FlowRateEstimator::new(
                self.flow.pulses_per_unit,
                Duration::from_millis(self.flow.time_base_ms as u64),
            ),
        }
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.sensors.settle_ms as u64)
    }

    /// Zone override if both bounds are given, otherwise the deployment
    /// default.
    pub fn bounds_for(&self, zone: &ZoneEntry) -> CalibrationBounds {
        let driest = zone.driest_raw.unwrap_or(self.calibration.driest_raw);
        let wettest = zone.wettest_raw.unwrap_or(self.calibration.wettest_raw);
        CalibrationBounds::new(driest as u16, wettest as u16)
    }

    pub fn threshold_for(zone: &ZoneEntry) -> f32 {
        zone.threshold.unwrap_or(DEFAULT_THRESHOLD)
    }

    /// Number of logical channels the configured strategy can address.
    pub fn channel_capacity(&self) -> usize {
        match self.sensors.strategy {
            Strategy::Direct => DIRECT_INPUTS,
            Strategy::Multiplexed => 1usize << self.sensors.address_pins.len().min(8),
        }
    }

    /// Apply `NODE_ID`, `MQTT_HOST`, `MQTT_PORT` and `WEB_PORT` overrides.
    /// Setting `MQTT_HOST` enables MQTT even without an `[mqtt]` section.
    pub fn apply_env(&mut self) {
        if let Ok(node_id) = env::var("NODE_ID") {
            self.controller.node_id = node_id;
        }
        if let Ok(host) = env::var("MQTT_HOST") {
            self.mqtt.get_or_insert_with(MqttSection::with_defaults).host = host;
        }
        if let Some(port) = env::var("MQTT_PORT").ok().and_then(|s| s.parse().ok()) {
            if let Some(mqtt) = self.mqtt.as_mut() {
                mqtt.port = port;
            }
        }
        if let Some(port) = env::var("WEB_PORT").ok().and_then(|s| s.parse().ok()) {
            self.web.get_or_insert(WebSection { port }).port = port;
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_timing(&mut errors);
        self.validate_calibration(&mut errors);
        let mut seen_pins: HashSet<i64> = HashSet::new();
        self.validate_sensors(&mut errors, &mut seen_pins);
        self.validate_zones(&mut errors, &mut seen_pins);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        if self.controller.node_id.trim().is_empty() {
            errors.push("controller: node_id is empty".to_string());
        }
        if self.controller.tick_ms <= 0 {
            errors.push(format!(
                "controller: tick_ms must be positive, got {}",
                self.controller.tick_ms
            ));
        }
        if self.flow.window_ms <= 0 {
            errors.push(format!(
                "flow: window_ms must be positive, got {}",
                self.flow.window_ms
            ));
        }
        if self.flow.time_base_ms <= 0 {
            errors.push(format!(
                "flow: time_base_ms must be positive, got {}",
                self.flow.time_base_ms
            ));
        }
        if !(self.flow.pulses_per_unit > 0.0) {
            errors.push(format!(
                "flow: pulses_per_unit must be positive, got {}",
                self.flow.pulses_per_unit
            ));
        }
        if let Some(mqtt) = &self.mqtt {
            if mqtt.host.trim().is_empty() {
                errors.push("mqtt: host is empty".to_string());
            }
            if mqtt.connect_timeout_s == 0 {
                errors.push("mqtt: connect_timeout_s must be positive, got 0".to_string());
            }
        }
    }

    fn validate_calibration(&self, errors: &mut Vec<String>) {
        check_bounds(
            "calibration",
            self.calibration.driest_raw,
            self.calibration.wettest_raw,
            errors,
        );
    }

    fn validate_sensors(&self, errors: &mut Vec<String>, seen_pins: &mut HashSet<i64>) {
        let s = &self.sensors;

        if s.settle_ms < 0 {
            errors.push(format!("sensors: settle_ms must not be negative, got {}", s.settle_ms));
        }

        match s.strategy {
            Strategy::Direct => {
                if !s.address_pins.is_empty() {
                    errors.push("sensors: address_pins set but strategy is direct".to_string());
                }
            }
            Strategy::Multiplexed => {
                if s.address_pins.is_empty() {
                    errors.push("sensors: multiplexed strategy needs address_pins".to_string());
                } else if s.address_pins.len() > 8 {
                    errors.push(format!(
                        "sensors: {} address_pins, at most 8 supported",
                        s.address_pins.len()
                    ));
                }
                if !(0..CONVERTER_INPUTS).contains(&s.signal_input) {
                    errors.push(format!(
                        "sensors: signal_input {} out of converter range [0, {}]",
                        s.signal_input,
                        CONVERTER_INPUTS - 1
                    ));
                }
                for (bit, &pin) in s.address_pins.iter().enumerate() {
                    check_pin(&format!("sensors: address_pins[{bit}]"), pin, seen_pins, errors);
                }
                if let Some(pin) = s.enable_pin {
                    check_pin("sensors: enable_pin", pin, seen_pins, errors);
                }
            }
        }
    }

    fn validate_zones(&self, errors: &mut Vec<String>, seen_pins: &mut HashSet<i64>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();
        let capacity = self.channel_capacity() as i64;

        for (i, z) in self.zones.iter().enumerate() {
            let ctx = if z.zone_id.is_empty() {
                format!("zones[{i}]")
            } else {
                format!("zone '{}'", z.zone_id)
            };

            // ── Identity ────────────────────────────────────────
            if z.zone_id.trim().is_empty() {
                errors.push(format!("{ctx}: zone_id is empty"));
            } else if !seen_ids.insert(&z.zone_id) {
                errors.push(format!("{ctx}: duplicate zone_id"));
            }

            // ── Moisture channel ────────────────────────────────
            if !(0..capacity).contains(&z.moisture_channel) {
                let mut msg = format!(
                    "{ctx}: moisture_channel {} out of range [0, {}] for {:?} sensors",
                    z.moisture_channel,
                    capacity - 1,
                    self.sensors.strategy
                );
                if self.sensors.strategy == Strategy::Multiplexed && z.moisture_channel >= 0 {
                    let needed = address_width(z.moisture_channel as usize + 1);
                    msg.push_str(&format!(" (needs {needed} address pins)"));
                }
                errors.push(msg);
            }

            // ── Threshold ───────────────────────────────────────
            if let Some(t) = z.threshold {
                if !(0.0..=100.0).contains(&t) {
                    errors.push(format!("{ctx}: threshold {t} out of range [0, 100]"));
                }
            }

            // ── Calibration override ────────────────────────────
            match (z.driest_raw, z.wettest_raw) {
                (Some(_), Some(_)) | (None, None) => {}
                _ => errors.push(format!(
                    "{ctx}: driest_raw and wettest_raw must be overridden together"
                )),
            }
            if z.driest_raw.is_some() || z.wettest_raw.is_some() {
                check_bounds(
                    &ctx,
                    z.driest_raw.unwrap_or(self.calibration.driest_raw),
                    z.wettest_raw.unwrap_or(self.calibration.wettest_raw),
                    errors,
                );
            }

            // ── GPIO pins ───────────────────────────────────────
            check_pin(&format!("{ctx}: valve_pin"), z.valve_pin, seen_pins, errors);
            if let Some(pin) = z.flow_pin {
                check_pin(&format!("{ctx}: flow_pin"), pin, seen_pins, errors);
            }
        }
    }
}

fn check_bounds(ctx: &str, driest: i64, wettest: i64, errors: &mut Vec<String>) {
    if !(0..=ADC_FULL_SCALE).contains(&driest) {
        errors.push(format!(
            "{ctx}: driest_raw {driest} out of converter range [0, {ADC_FULL_SCALE}]"
        ));
    }
    if !(0..=ADC_FULL_SCALE).contains(&wettest) {
        errors.push(format!(
            "{ctx}: wettest_raw {wettest} out of converter range [0, {ADC_FULL_SCALE}]"
        ));
    }
    if driest == wettest {
        errors.push(format!(
            "{ctx}: driest_raw and wettest_raw are both {driest}, calibration range is zero"
        ));
    }
}

fn check_pin(ctx: &str, pin: i64, seen: &mut HashSet<i64>, errors: &mut Vec<String>) {
    if !VALID_GPIO_PINS.contains(&pin) {
        errors.push(format!(
            "{ctx} {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
        ));
    } else if !seen.insert(pin) {
        errors.push(format!("{ctx} {pin} is already in use"));
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file, apply environment overrides, validate.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let mut config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config.apply_env();
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        path,
        zones = config.zones.len(),
        strategy = ?config.sensors.strategy,
        mqtt = config.mqtt.is_some(),
        web = config.web.is_some(),
        "config loaded"
    );
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
