//! Simulated board for local development.
//!
//! Soil channels model realistic probe behaviour:
//! - Temporal coherence via random walk with mean reversion
//! - Gradual drying drift (evaporation)
//! - Per-reading converter noise
//! - Occasional spikes (sensor flakiness)
//! - Diurnal (day/night) cycle
//! - Per-sensor calibration offsets
//! - Closed-loop watering response (moisture rises while the valve is open)
//!
//! Flow meters run on their own threads and emit pulses while their zone's
//! valve is open, the way a hall-effect sensor fires GPIO interrupts.
//!
//! The mux address lines are simulated too: the converter's signal input
//! returns whichever channel the address lines currently select.

use anyhow::Result;
use std::env;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use irrigation_core::io::{AnalogSource, DigitalOutput};
use irrigation_core::{CalibrationBounds, PulseEdge};

use crate::board::{Board, Line};
use crate::config::{Config, SensorSection, Strategy, ZoneEntry};

/// Simulated converter resolution (12-bit).
pub const ADC_FULL_SCALE: i64 = 4095;

/// Physical inputs on the simulated converter.
pub const DIRECT_INPUTS: usize = 16;

/// Nominal simulated flow while a valve is open, in rate units.
const NOMINAL_FLOW: f64 = 10.0;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-range, steady drift toward dry. Moderate noise. Zones
    /// cycle their valves regularly.
    Drying,
    /// Hovers near the centre. Low noise, rare spikes.
    Stable,
    /// High noise, frequent large spikes. Exercises clamping and valve
    /// chatter around the threshold.
    Flaky,
    /// Starts near the wet end, dries very slowly. Valves should stay shut.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

/// Rates are per second of simulated time, in wetness fraction (0 = driest
/// bound, 1 = wettest bound).
struct Params {
    drift_per_s: f64,
    walk_sigma: f64,
    mean_reversion_per_s: f64,
    noise_sigma: f64,
    spike_prob: f32,
    spike_sigma: f64,
    start_frac: f64,
}

impl Scenario {
    fn params(self) -> Params {
        let (drift, walk, rev, noise, spike_prob, spike_sigma, start) = match self {
            Self::Drying => (0.004, 0.004, 0.002, 0.010, 0.003_f32, 0.15, 0.55),
            Self::Stable => (0.0005, 0.002, 0.01, 0.005, 0.0005, 0.07, 0.5),
            Self::Flaky => (0.003, 0.008, 0.002, 0.030, 0.02, 0.25, 0.5),
            Self::Wet => (0.0008, 0.003, 0.002, 0.008, 0.002, 0.10, 0.85),
        };
        Params {
            drift_per_s: drift,
            walk_sigma: walk,
            mean_reversion_per_s: rev,
            noise_sigma: noise,
            spike_prob,
            spike_sigma,
            start_frac: start,
        }
    }
}

// ---------------------------------------------------------------------------
// Soil model
// ---------------------------------------------------------------------------

/// Internal state for a single simulated channel.
struct SensorState {
    bounds: CalibrationBounds,
    /// Current "true" wetness. Evolves with elapsed time.
    wetness: f64,
    /// Permanent per-sensor offset; two probes in the same soil never read
    /// identically.
    offset: f64,
    noise_sigma: f64,
    last: Option<Instant>,
}

/// Stateful simulator producing realistic raw soil-moisture samples.
pub struct SoilMoistureSim {
    sensors: Vec<SensorState>,
    params: Params,
    center: f64,
    diurnal_amplitude: f64,
    diurnal_period_s: f64,
    wet_rate_per_s: f64,
}

impl SoilMoistureSim {
    /// One sensor per entry of `bounds`. `diurnal_period_s` controls the
    /// day/night cycle length: 600 (10 min) for fast iteration, 86400 for
    /// real time.
    pub fn new(scenario: Scenario, bounds: Vec<CalibrationBounds>, diurnal_period_s: f64) -> Self {
        let params = scenario.params();
        let sensors = bounds
            .into_iter()
            .map(|bounds| SensorState {
                bounds,
                wetness: (params.start_frac + gaussian(0.0, 0.03)).clamp(0.0, 1.0),
                offset: gaussian(0.0, 0.02),
                noise_sigma: params.noise_sigma * (1.0 + 0.2 * approx_std_normal()).max(0.3),
                last: None,
            })
            .collect();

        Self {
            sensors,
            params,
            center: 0.5,
            diurnal_amplitude: 0.03,
            diurnal_period_s,
            wet_rate_per_s: 0.03,
        }
    }

    /// Produce the next raw sample for channel `index` as of `now`.
    ///
    /// The underlying wetness evolves by the time since this channel was
    /// last sampled, so the loop's tick rate does not change the dynamics.
    pub fn sample(&mut self, index: usize, watering: bool, now: Instant) -> u16 {
        let p = &self.params;
        let sensor = &mut self.sensors[index];

        let dt = sensor
            .last
            .map(|t| now.saturating_duration_since(t).as_secs_f64().min(5.0))
            .unwrap_or(0.0);
        sensor.last = Some(now);

        // -- Evolve the underlying wetness --------------------------------

        let pull = p.mean_reversion_per_s * (self.center - sensor.wetness);
        let wet = if watering { self.wet_rate_per_s } else { 0.0 };
        let walk = gaussian(0.0, p.walk_sigma * dt.sqrt());

        sensor.wetness =
            (sensor.wetness + (pull + wet - p.drift_per_s) * dt + walk).clamp(-0.05, 1.05);

        // -- Build the instantaneous reading ------------------------------

        let now_s = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let phase = 2.0 * std::f64::consts::PI * now_s / self.diurnal_period_s;
        let diurnal = -self.diurnal_amplitude * phase.sin();

        let noise = gaussian(0.0, sensor.noise_sigma);
        let spike = if fastrand::f32() < p.spike_prob {
            gaussian(0.0, p.spike_sigma)
        } else {
            0.0
        };

        let frac = sensor.wetness + sensor.offset + diurnal + noise + spike;
        let dry = sensor.bounds.driest_raw as f64;
        let span = sensor.bounds.wettest_raw as f64 - dry;
        (dry + frac * span)
            .round()
            .clamp(0.0, ADC_FULL_SCALE as f64) as u16
    }

    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }
}

// ---------------------------------------------------------------------------
// Board pieces
// ---------------------------------------------------------------------------

/// Per-channel "valve is watering this soil" flags.
type Watering = Arc<Vec<AtomicBool>>;

struct SimAdc {
    soil: SoilMoistureSim,
    watering: Watering,
    /// Mux address and the input wired to its common output.
    mux: Option<(Arc<AtomicU8>, u8)>,
}

impl AnalogSource for SimAdc {
    fn convert(&mut self, input: u8) -> Result<u16> {
        let channel = match &self.mux {
            Some((address, signal)) if input == *signal => address.load(Ordering::Acquire),
            Some(_) => return Ok(0), // nothing wired
            None => input,
        };
        let index = channel as usize;
        anyhow::ensure!(
            index < self.soil.sensor_count(),
            "simulated input {channel} does not exist"
        );
        let watering = self.watering[index].load(Ordering::Relaxed);
        Ok(self.soil.sample(index, watering, Instant::now()))
    }
}

struct SimAddressLine {
    bit: u8,
    address: Arc<AtomicU8>,
}

impl DigitalOutput for SimAddressLine {
    fn set_level(&mut self, high: bool) {
        if high {
            self.address.fetch_or(1 << self.bit, Ordering::AcqRel);
        } else {
            self.address.fetch_and(!(1 << self.bit), Ordering::AcqRel);
        }
    }
}

struct SimValve {
    zone_id: String,
    active_low: bool,
    open: Arc<AtomicBool>,
    watering: Watering,
    channel: usize,
}

impl DigitalOutput for SimValve {
    fn set_level(&mut self, high: bool) {
        // `high` means open; active-low relays see the inverted pin level.
        let open = high;
        if self.open.swap(open, Ordering::AcqRel) != open {
            tracing::debug!(
                zone = %self.zone_id,
                pin_high = high != self.active_low,
                "[sim] valve {}",
                if open { "ON" } else { "OFF" }
            );
        }
        self.watering[self.channel].store(open, Ordering::Relaxed);
    }
}

/// Emit pulses on `edge` at roughly `pulses_per_s` while `open` is set.
fn spawn_flow_meter(
    zone_id: String,
    open: Arc<AtomicBool>,
    edge: PulseEdge,
    pulses_per_s: f64,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("sim-flow-{zone_id}"))
        .spawn(move || {
            const STEP: Duration = Duration::from_millis(5);
            let mut owed = 0.0_f64;
            let mut last = Instant::now();
            loop {
                thread::sleep(STEP);
                let now = Instant::now();
                let dt = now.duration_since(last).as_secs_f64();
                last = now;

                if !open.load(Ordering::Acquire) {
                    owed = 0.0;
                    continue;
                }
                owed += pulses_per_s * dt * (1.0 + gaussian(0.0, 0.05)).max(0.0);
                while owed >= 1.0 {
                    edge.record();
                    owed -= 1.0;
                }
            }
        })
}

/// Simulated board. Holds the flow-meter threads for the life of the
/// process.
pub struct SimBoard {
    scenario: Scenario,
    diurnal_period_s: f64,
    channel_bounds: Vec<CalibrationBounds>,
    watering: Watering,
    address: Arc<AtomicU8>,
    valves_open: Vec<(String, Arc<AtomicBool>)>,
    pulses_per_s: f64,
    #[allow(dead_code)]
    flow_threads: Vec<JoinHandle<()>>,
}

impl SimBoard {
    pub fn open(cfg: &Config) -> Result<Self> {
        let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
        let diurnal_period_s: f64 = env::var("SIM_DIURNAL_S")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(600.0);

        let channels = match cfg.sensors.strategy {
            Strategy::Direct => DIRECT_INPUTS,
            Strategy::Multiplexed => cfg.channel_capacity(),
        };

        // Unassigned channels read like a probe at the default calibration.
        let default_bounds = CalibrationBounds::new(
            cfg.calibration.driest_raw as u16,
            cfg.calibration.wettest_raw as u16,
        );
        let mut channel_bounds = vec![default_bounds; channels];
        for z in &cfg.zones {
            if let Some(slot) = channel_bounds.get_mut(z.moisture_channel as usize) {
                *slot = cfg.bounds_for(z);
            }
        }

        // Pulses for NOMINAL_FLOW under the configured factor and time base.
        let time_base_s = cfg.flow.time_base_ms as f64 / 1000.0;
        let pulses_per_s = NOMINAL_FLOW * cfg.flow.pulses_per_unit as f64 / time_base_s;

        tracing::info!(
            %scenario,
            channels,
            diurnal_period_s,
            pulses_per_s,
            "[sim] board initialised (no hardware)"
        );

        Ok(Self {
            scenario,
            diurnal_period_s,
            channel_bounds,
            watering: Arc::new((0..channels).map(|_| AtomicBool::new(false)).collect()),
            address: Arc::new(AtomicU8::new(0)),
            valves_open: Vec::new(),
            pulses_per_s,
            flow_threads: Vec::new(),
        })
    }

    fn valve_flag(&self, zone_id: &str) -> Option<Arc<AtomicBool>> {
        self.valves_open
            .iter()
            .find(|(id, _)| id == zone_id)
            .map(|(_, flag)| Arc::clone(flag))
    }
}

impl Board for SimBoard {
    fn converter(&mut self, sensors: &SensorSection) -> Result<Box<dyn AnalogSource + Send>> {
        let soil = SoilMoistureSim::new(
            self.scenario,
            self.channel_bounds.clone(),
            self.diurnal_period_s,
        );
        let mux = match sensors.strategy {
            Strategy::Direct => None,
            Strategy::Multiplexed => Some((Arc::clone(&self.address), sensors.signal_input as u8)),
        };
        tracing::debug!(
            i2c_addr = format_args!("0x{:02x}", sensors.i2c_addr),
            multiplexed = mux.is_some(),
            "[sim] converter ready"
        );
        Ok(Box::new(SimAdc {
            soil,
            watering: Arc::clone(&self.watering),
            mux,
        }))
    }

    fn address_line(&mut self, pin: u8, bit: u8) -> Result<Line> {
        tracing::debug!(pin, bit, "[sim] mux address line");
        Ok(Box::new(SimAddressLine {
            bit,
            address: Arc::clone(&self.address),
        }))
    }

    fn enable_mux(&mut self, pin: u8) -> Result<()> {
        tracing::debug!(pin, "[sim] mux enabled");
        Ok(())
    }

    fn valve(&mut self, zone: &ZoneEntry, active_low: bool) -> Result<Line> {
        let open = Arc::new(AtomicBool::new(false));
        self.valves_open
            .push((zone.zone_id.clone(), Arc::clone(&open)));
        tracing::debug!(
            zone = %zone.zone_id,
            gpio = zone.valve_pin,
            "[sim] valve registered (not wired)"
        );
        Ok(Box::new(SimValve {
            zone_id: zone.zone_id.clone(),
            active_low,
            open,
            watering: Arc::clone(&self.watering),
            channel: zone.moisture_channel as usize,
        }))
    }

    fn flow_meter(&mut self, zone: &ZoneEntry, pin: u8, edge: PulseEdge) -> Result<()> {
        let open = self
            .valve_flag(&zone.zone_id)
            .ok_or_else(|| anyhow::anyhow!("zone '{}' has no valve", zone.zone_id))?;
        let handle = spawn_flow_meter(zone.zone_id.clone(), open, edge, self.pulses_per_s)?;
        self.flow_threads.push(handle);
        tracing::debug!(zone = %zone.zone_id, gpio = pin, "[sim] flow meter running");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
