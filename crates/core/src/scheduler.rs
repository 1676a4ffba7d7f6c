//! Fixed-cadence control loop.
//!
//! Each tick, in order:
//!
//! 1. every zone (registry order): read raw moisture, calibrate, run the
//!    threshold decision, drive the valve;
//! 2. if the flow window has elapsed (wall clock, not tick count): drain
//!    each flow counter and recompute its rate;
//! 3. snapshot every zone and hand the batch to each sink.
//!
//! Flow rates may therefore be up to one window older than the moisture
//! reading in the same snapshot.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::channel::ChannelReader;
use crate::flow::{FlowRateEstimator, FlowWindow, DEFAULT_WINDOW};
use crate::telemetry::{TelemetrySink, ZoneSnapshot};
use crate::valve;
use crate::zone::Zone;

/// Default inter-tick period.
pub const DEFAULT_TICK: Duration = Duration::from_millis(10);

/// Loop timing and flow estimation parameters.
#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub tick: Duration,
    pub flow_window: Duration,
    pub estimator: FlowRateEstimator,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            flow_window: DEFAULT_WINDOW,
            estimator: FlowRateEstimator::default(),
        }
    }
}

pub struct ControlLoop {
    reader: ChannelReader,
    zones: Vec<Zone>,
    settings: LoopSettings,
    window: FlowWindow,
    sinks: Vec<Box<dyn TelemetrySink + Send>>,
    ticks: u64,
}

impl ControlLoop {
    /// Take ownership of the reader and zone registry. Any pulses recorded
    /// while the hardware was being wired up are discarded here, so the
    /// first window starts from zero.
    pub fn new(
        reader: ChannelReader,
        zones: Vec<Zone>,
        settings: LoopSettings,
        now: Instant,
    ) -> Self {
        for zone in &zones {
            if let Some(counter) = zone.flow_counter() {
                counter.sample_and_reset();
            }
        }

        Self {
            reader,
            zones,
            settings,
            window: FlowWindow::new(settings.flow_window, now),
            sinks: Vec::new(),
            ticks: 0,
        }
    }

    pub fn add_sink(&mut self, sink: Box<dyn TelemetrySink + Send>) {
        self.sinks.push(sink);
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Run one tick as of `now` and return the published batch.
    pub fn tick(&mut self, now: Instant) -> Vec<ZoneSnapshot> {
        self.ticks += 1;

        for zone in &mut self.zones {
            match self.reader.read(zone.moisture_channel()) {
                Ok(raw) => {
                    if zone.read_failures > 0 {
                        info!(
                            zone = %zone.id(),
                            failed_reads = zone.read_failures,
                            "moisture channel recovered"
                        );
                        zone.read_failures = 0;
                    }
                    zone.moisture_percent = zone.bounds().to_percent(raw);
                    valve::actuate(zone);
                }
                Err(e) => {
                    // Hold the previous valve state until the channel reads again.
                    if zone.read_failures == 0 {
                        warn!(
                            zone = %zone.id(),
                            channel = zone.moisture_channel(),
                            "moisture read failed, holding valve {}: {e:#}",
                            zone.valve()
                        );
                    }
                    zone.read_failures = zone.read_failures.saturating_add(1);
                    valve::reassert(zone);
                }
            }
        }

        if let Some(elapsed) = self.window.poll(now) {
            for zone in &mut self.zones {
                let Some(counter) = zone.flow_counter() else {
                    continue;
                };
                let pulses = counter.sample_and_reset();
                zone.flow_rate = self.settings.estimator.estimate(pulses, elapsed);
                debug!(
                    zone = %zone.id(),
                    pulses,
                    elapsed_ms = elapsed.as_millis() as u64,
                    rate = zone.flow_rate,
                    "flow window closed"
                );
            }
        }

        let batch: Vec<ZoneSnapshot> = self.zones.iter().map(Zone::snapshot).collect();
        for sink in &mut self.sinks {
            if let Err(e) = sink.publish(&batch) {
                debug!("telemetry publish dropped: {e:#}");
            }
        }
        batch
    }

    /// Tick forever at the configured period. Never returns.
    pub fn run(mut self) {
        info!(
            zones = self.zones.len(),
            tick_ms = self.settings.tick.as_millis() as u64,
            window_ms = self.settings.flow_window.as_millis() as u64,
            multiplexed = self.reader.is_multiplexed(),
            sinks = self.sinks.len(),
            "control loop started"
        );

        let mut next = Instant::now();
        loop {
            self.tick(Instant::now());

            next += self.settings.tick;
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            } else {
                // Overran the period (slow reads); restart the cadence from here.
                next = now;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationBounds;
    use crate::channel::MuxBus;
    use crate::flow::{pulse_counter, PulseEdge};
    use crate::io::{AnalogSource, DigitalOutput};
    use crate::valve::ValveState;
    use anyhow::{bail, Result};
    use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const BOUNDS: CalibrationBounds = CalibrationBounds::new(1140, 3333);

    /// One settable raw value per direct input; a flag makes every read fail.
    #[derive(Clone)]
    struct FakeAdc {
        raw: Arc<Vec<AtomicU16>>,
        broken: Arc<AtomicBool>,
    }

    impl FakeAdc {
        fn new(channels: usize) -> Self {
            Self {
                raw: Arc::new((0..channels).map(|_| AtomicU16::new(3333)).collect()),
                broken: Arc::new(AtomicBool::new(false)),
            }
        }

        fn set(&self, channel: usize, raw: u16) {
            self.raw[channel].store(raw, Ordering::SeqCst);
        }
    }

    impl AnalogSource for FakeAdc {
        fn convert(&mut self, input: u8) -> Result<u16> {
            if self.broken.load(Ordering::SeqCst) {
                bail!("i2c nack");
            }
            Ok(self.raw[input as usize].load(Ordering::SeqCst))
        }
    }

    /// Output line remembering its level and how often it was written.
    #[derive(Clone, Default)]
    struct Level {
        high: Arc<AtomicBool>,
        writes: Arc<AtomicUsize>,
    }

    impl DigitalOutput for Level {
        fn set_level(&mut self, high: bool) {
            self.high.store(high, Ordering::SeqCst);
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Level {
        fn is_high(&self) -> bool {
            self.high.load(Ordering::SeqCst)
        }

        fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    /// Mux address lines folding their bits into one shared address.
    struct AddressBit {
        bit: u8,
        address: Arc<AtomicU8>,
    }

    impl DigitalOutput for AddressBit {
        fn set_level(&mut self, high: bool) {
            if high {
                self.address.fetch_or(1 << self.bit, Ordering::SeqCst);
            } else {
                self.address.fetch_and(!(1 << self.bit), Ordering::SeqCst);
            }
        }
    }

    /// Converter whose signal input carries the channel the mux selects.
    struct MuxedAdc {
        adc: FakeAdc,
        address: Arc<AtomicU8>,
        signal_input: u8,
    }

    impl AnalogSource for MuxedAdc {
        fn convert(&mut self, input: u8) -> Result<u16> {
            if input != self.signal_input {
                bail!("input {input} is not wired");
            }
            let channel = self.address.load(Ordering::SeqCst);
            self.adc.convert(channel)
        }
    }

    /// Sink remembering every batch it was given.
    #[derive(Clone, Default)]
    struct CaptureSink(Arc<Mutex<Vec<Vec<ZoneSnapshot>>>>);

    impl TelemetrySink for CaptureSink {
        fn publish(&mut self, batch: &[ZoneSnapshot]) -> Result<()> {
            self.0.lock().unwrap().push(batch.to_vec());
            Ok(())
        }
    }

    struct FailingSink;

    impl TelemetrySink for FailingSink {
        fn publish(&mut self, _batch: &[ZoneSnapshot]) -> Result<()> {
            bail!("broker unreachable")
        }
    }

    struct Rig {
        adc: FakeAdc,
        valves: Vec<Level>,
        edge: PulseEdge,
        control: ControlLoop,
        t0: Instant,
    }

    /// Two zones: z1 on channel 0 with a flow meter, z2 on channel 1 without.
    fn rig() -> Rig {
        let adc = FakeAdc::new(2);
        let valves = vec![Level::default(), Level::default()];
        let (counter, edge) = pulse_counter();

        let zones = vec![
            Zone::new("z1", 0, BOUNDS, Box::new(valves[0].clone())).with_flow(counter),
            Zone::new("z2", 1, BOUNDS, Box::new(valves[1].clone())),
        ];

        let t0 = Instant::now();
        let control = ControlLoop::new(
            ChannelReader::direct(Box::new(adc.clone())),
            zones,
            LoopSettings::default(),
            t0,
        );
        Rig {
            adc,
            valves,
            edge,
            control,
            t0,
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    // -- Moisture → valve -------------------------------------------------

    #[test]
    fn dry_zone_opens_wet_zone_stays_closed() {
        let mut r = rig();
        r.adc.set(0, 1140); // 0 %
        r.adc.set(1, 3333); // 100 %

        let batch = r.control.tick(r.t0 + ms(10));

        assert_eq!(batch[0].valve, ValveState::Open);
        assert_eq!(batch[0].moisture_percent, 0.0);
        assert_eq!(batch[1].valve, ValveState::Closed);
        assert_eq!(batch[1].moisture_percent, 100.0);
        assert!(r.valves[0].is_high());
        assert!(!r.valves[1].is_high());
    }

    #[test]
    fn valve_follows_moisture_across_ticks() {
        let mut r = rig();
        r.adc.set(0, 1500);
        r.control.tick(r.t0 + ms(10));
        assert!(r.valves[0].is_high());

        r.adc.set(0, 3000);
        r.control.tick(r.t0 + ms(20));
        assert!(!r.valves[0].is_high());
        assert_eq!(r.control.zones()[0].valve(), ValveState::Closed);
    }

    #[test]
    fn batch_keeps_registry_order() {
        let mut r = rig();
        let batch = r.control.tick(r.t0 + ms(10));
        let ids: Vec<_> = batch.iter().map(|s| s.zone_id.as_str()).collect();
        assert_eq!(ids, ["z1", "z2"]);
    }

    // -- Flow window ------------------------------------------------------

    #[test]
    fn flow_rate_updates_only_when_window_elapses() {
        let mut r = rig();
        for _ in 0..75 {
            r.edge.record();
        }

        // 99 ticks inside the first second: rate not computed yet.
        for i in 1..100 {
            let batch = r.control.tick(r.t0 + ms(i * 10));
            assert_eq!(batch[0].flow_rate, 0.0, "tick {i}");
        }

        let batch = r.control.tick(r.t0 + ms(1000));
        assert!((batch[0].flow_rate - 10.0).abs() < 1e-4, "{}", batch[0].flow_rate);
        assert_eq!(r.control.zones()[0].flow_rate(), batch[0].flow_rate);
    }

    #[test]
    fn window_uses_time_not_tick_count() {
        let mut r = rig();
        for _ in 0..75 {
            r.edge.record();
        }
        // A single slow tick two seconds in: one window, real elapsed time.
        let batch = r.control.tick(r.t0 + ms(2000));
        assert!((batch[0].flow_rate - 5.0).abs() < 1e-4, "{}", batch[0].flow_rate);
    }

    #[test]
    fn pulses_are_not_counted_twice_across_windows() {
        let mut r = rig();
        for _ in 0..15 {
            r.edge.record();
        }
        let first = r.control.tick(r.t0 + ms(1000));
        assert!((first[0].flow_rate - 2.0).abs() < 1e-4);

        let second = r.control.tick(r.t0 + ms(2000));
        assert_eq!(second[0].flow_rate, 0.0);
    }

    #[test]
    fn pulses_before_start_are_discarded() {
        let adc = FakeAdc::new(1);
        let (counter, edge) = pulse_counter();
        for _ in 0..500 {
            edge.record();
        }
        let zones =
            vec![Zone::new("z1", 0, BOUNDS, Box::new(Level::default())).with_flow(counter)];
        let t0 = Instant::now();
        let mut control = ControlLoop::new(
            ChannelReader::direct(Box::new(adc)),
            zones,
            LoopSettings::default(),
            t0,
        );

        let batch = control.tick(t0 + ms(1000));
        assert_eq!(batch[0].flow_rate, 0.0);
    }

    #[test]
    fn zone_without_flow_meter_reports_zero() {
        let mut r = rig();
        for _ in 0..1000 {
            r.edge.record();
        }
        let batch = r.control.tick(r.t0 + ms(1000));
        assert!(batch[0].flow_rate > 0.0);
        assert_eq!(batch[1].flow_rate, 0.0);
        assert!(!r.control.zones()[1].has_flow_meter());
    }

    // -- Sinks ------------------------------------------------------------

    #[test]
    fn every_tick_publishes_one_batch_per_sink() {
        let mut r = rig();
        let a = CaptureSink::default();
        let b = CaptureSink::default();
        r.control.add_sink(Box::new(a.clone()));
        r.control.add_sink(Box::new(b.clone()));

        for i in 1..=3 {
            r.control.tick(r.t0 + ms(i * 10));
        }

        assert_eq!(a.0.lock().unwrap().len(), 3);
        assert_eq!(b.0.lock().unwrap().len(), 3);
        assert_eq!(a.0.lock().unwrap()[0].len(), 2);
        assert_eq!(r.control.ticks(), 3);
    }

    #[test]
    fn failing_sink_does_not_affect_control() {
        let mut r = rig();
        let capture = CaptureSink::default();
        r.control.add_sink(Box::new(FailingSink));
        r.control.add_sink(Box::new(capture.clone()));

        r.adc.set(0, 1140);
        let batch = r.control.tick(r.t0 + ms(10));

        assert_eq!(batch[0].valve, ValveState::Open);
        assert!(r.valves[0].is_high());
        assert_eq!(capture.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn runs_without_any_sink() {
        let mut r = rig();
        r.adc.set(0, 1140);
        let batch = r.control.tick(r.t0 + ms(10));
        assert_eq!(batch.len(), 2);
        assert!(r.valves[0].is_high());
    }

    // -- Read failures ----------------------------------------------------

    #[test]
    fn read_failure_holds_previous_state() {
        let mut r = rig();
        r.adc.set(0, 1140);
        r.control.tick(r.t0 + ms(10));
        assert!(r.valves[0].is_high());

        r.adc.broken.store(true, Ordering::SeqCst);
        let batch = r.control.tick(r.t0 + ms(20));
        assert_eq!(batch[0].valve, ValveState::Open);
        assert_eq!(batch[0].moisture_percent, 0.0);
        assert!(r.valves[0].is_high());

        r.adc.broken.store(false, Ordering::SeqCst);
        r.adc.set(0, 3333);
        let batch = r.control.tick(r.t0 + ms(30));
        assert_eq!(batch[0].valve, ValveState::Closed);
        assert_eq!(r.control.zones()[0].read_failures, 0);
    }

    #[test]
    fn failed_reads_keep_driving_the_held_valve() {
        let mut r = rig();
        r.adc.set(0, 1140);
        r.control.tick(r.t0 + ms(10));
        let before = r.valves[0].writes();

        r.adc.broken.store(true, Ordering::SeqCst);
        for i in 2..=101 {
            r.control.tick(r.t0 + ms(i * 10));
        }

        assert_eq!(r.valves[0].writes(), before + 100);
        assert!(r.valves[0].is_high());
        assert_eq!(r.control.zones()[0].valve(), ValveState::Open);
        assert_eq!(r.control.zones()[0].read_failures, 100);
        assert_eq!(r.control.zones()[0].moisture_percent(), 0.0);
    }

    #[test]
    fn held_valve_is_corrected_while_reads_fail() {
        let mut r = rig();
        r.adc.set(1, 3333);
        r.control.tick(r.t0 + ms(10));
        assert!(!r.valves[1].is_high());

        // Something else flipped the relay line; the next tick puts it back.
        r.adc.broken.store(true, Ordering::SeqCst);
        r.valves[1].high.store(true, Ordering::SeqCst);
        r.control.tick(r.t0 + ms(20));
        assert!(!r.valves[1].is_high());
    }

    // -- Multiplexed channels ---------------------------------------------

    #[test]
    fn mux_zones_read_their_own_channel() {
        let adc = FakeAdc::new(4);
        let address = Arc::new(AtomicU8::new(0));
        let lines = (0..2)
            .map(|bit| {
                Box::new(AddressBit {
                    bit,
                    address: Arc::clone(&address),
                }) as Box<dyn DigitalOutput + Send>
            })
            .collect();
        let bus = MuxBus::new(lines, 1, Duration::ZERO).unwrap();
        let reader = ChannelReader::multiplexed(
            Box::new(MuxedAdc {
                adc: adc.clone(),
                address: Arc::clone(&address),
                signal_input: 1,
            }),
            bus,
        );

        let valves = vec![Level::default(), Level::default()];
        let zones = vec![
            Zone::new("z1", 2, BOUNDS, Box::new(valves[0].clone())),
            Zone::new("z2", 3, BOUNDS, Box::new(valves[1].clone())),
        ];
        let t0 = Instant::now();
        let mut control = ControlLoop::new(reader, zones, LoopSettings::default(), t0);

        adc.set(0, 1140);
        adc.set(1, 1140);
        adc.set(2, 1140); // 0 %
        adc.set(3, 3333); // 100 %

        let batch = control.tick(t0 + ms(10));
        assert_eq!(batch[0].moisture_percent, 0.0);
        assert_eq!(batch[0].valve, ValveState::Open);
        assert_eq!(batch[1].moisture_percent, 100.0);
        assert_eq!(batch[1].valve, ValveState::Closed);
        assert_eq!(address.load(Ordering::SeqCst), 3, "last zone selected last");
        assert!(valves[0].is_high());
        assert!(!valves[1].is_high());

        adc.set(2, 3333);
        adc.set(3, 1140);
        control.tick(t0 + ms(20));
        assert_eq!(control.zones()[0].moisture_percent(), 100.0);
        assert_eq!(control.zones()[1].moisture_percent(), 0.0);
        assert!(!valves[0].is_high());
        assert!(valves[1].is_high());
    }
}
