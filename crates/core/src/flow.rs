//! Interrupt-driven flow metering.
//!
//! A flow sensor emits one pulse per fixed volume of water. The edge handler
//! (GPIO interrupt thread, or a simulator thread) increments a shared atomic
//! counter; the control loop swaps it back to zero once per estimation
//! window and turns the count into a rate.
//!
//! The counter is split in two so each side only gets the operation it is
//! allowed to perform:
//!
//! - [`PulseEdge`]: `record()` only. Cheap to clone, `Send`, safe to call from
//!   interrupt context.
//! - [`PulseCounter`]: `sample_and_reset()` only. Owned by the zone on the
//!   control-loop thread. There is no plain read: every read
//!   clears, so pulses can never be counted twice.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// YF-S201 style sensors: pulse frequency (Hz) = 7.5 × flow (L/min).
pub const DEFAULT_PULSES_PER_UNIT: f32 = 7.5;

/// Interval over which `pulses_per_unit` is rated (see [`FlowRateEstimator`]).
pub const DEFAULT_TIME_BASE: Duration = Duration::from_secs(1);

/// Length of one estimation window.
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(1000);

/// Create a zeroed counter and the edge handle that feeds it.
pub fn pulse_counter() -> (PulseCounter, PulseEdge) {
    let count = Arc::new(AtomicU32::new(0));
    (
        PulseCounter {
            count: Arc::clone(&count),
        },
        PulseEdge { count },
    )
}

/// Edge-detector side of a flow counter.
#[derive(Debug, Clone)]
pub struct PulseEdge {
    count: Arc<AtomicU32>,
}

impl PulseEdge {
    /// Count one rising edge. Does nothing else; must stay interrupt-safe.
    #[inline]
    pub fn record(&self) {
        // Wraps on overflow; the counter is drained every window long
        // before that matters.
        self.count.fetch_add(1, Ordering::AcqRel);
    }
}

/// Control-loop side of a flow counter.
#[derive(Debug)]
pub struct PulseCounter {
    count: Arc<AtomicU32>,
}

impl PulseCounter {
    /// Atomically take every pulse recorded since the previous call.
    pub fn sample_and_reset(&self) -> u32 {
        self.count.swap(0, Ordering::AcqRel)
    }
}

/// Turns a windowed pulse count into a flow rate.
///
/// `rate = pulses / pulses_per_unit × (time_base / elapsed)`
///
/// `time_base` is the interval the sensor's factor is rated over. With a
/// 60 s base this is `pulses / pulses_per_unit / elapsed_minutes`. The
/// default 1 s base matches the usual datasheet rating (Hz per L/min), so
/// counting for one second and dividing by the factor gives L/min.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowRateEstimator {
    pulses_per_unit: f32,
    time_base: Duration,
}

impl Default for FlowRateEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_PULSES_PER_UNIT, DEFAULT_TIME_BASE)
    }
}

impl FlowRateEstimator {
    pub fn new(pulses_per_unit: f32, time_base: Duration) -> Self {
        Self {
            pulses_per_unit,
            time_base,
        }
    }

    pub fn pulses_per_unit(&self) -> f32 {
        self.pulses_per_unit
    }

    pub fn estimate(&self, pulses: u32, elapsed: Duration) -> f32 {
        if elapsed.is_zero() || self.pulses_per_unit <= 0.0 {
            return 0.0;
        }
        let scale = self.time_base.as_secs_f64() / elapsed.as_secs_f64();
        (pulses as f64 / self.pulses_per_unit as f64 * scale) as f32
    }
}

/// Wall-clock estimation window, independent of how many ticks pass.
#[derive(Debug, Clone, Copy)]
pub struct FlowWindow {
    length: Duration,
    started: Instant,
}

impl FlowWindow {
    pub fn new(length: Duration, now: Instant) -> Self {
        Self {
            length,
            started: now,
        }
    }

    /// If the window has run its length by `now`, start a new one and return
    /// the actual elapsed time of the window that just closed.
    pub fn poll(&mut self, now: Instant) -> Option<Duration> {
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed < self.length {
            return None;
        }
        self.started = now;
        Some(elapsed)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    // -- Counter ----------------------------------------------------------

    #[test]
    fn counter_starts_at_zero() {
        let (counter, _edge) = pulse_counter();
        assert_eq!(counter.sample_and_reset(), 0);
    }

    #[test]
    fn sample_returns_recorded_pulses_then_clears() {
        let (counter, edge) = pulse_counter();
        for _ in 0..42 {
            edge.record();
        }
        assert_eq!(counter.sample_and_reset(), 42);
        assert_eq!(counter.sample_and_reset(), 0);

        edge.record();
        assert_eq!(counter.sample_and_reset(), 1);
    }

    #[test]
    fn cloned_edges_feed_same_counter() {
        let (counter, edge) = pulse_counter();
        let other = edge.clone();
        edge.record();
        other.record();
        assert_eq!(counter.sample_and_reset(), 2);
    }

    #[test]
    fn resets_interleaved_with_increments_lose_nothing() {
        const THREADS: u32 = 4;
        const PER_THREAD: u32 = 50_000;

        let (counter, edge) = pulse_counter();
        let done = Arc::new(AtomicBool::new(false));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let edge = edge.clone();
                thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        edge.record();
                    }
                })
            })
            .collect();

        // Keep resetting while the edge threads are still firing.
        let sampler = {
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut total: u64 = 0;
                while !done.load(Ordering::Acquire) {
                    total += counter.sample_and_reset() as u64;
                }
                total += counter.sample_and_reset() as u64;
                total
            })
        };

        for h in handles {
            h.join().unwrap();
        }
        done.store(true, Ordering::Release);
        let total = sampler.join().unwrap();

        assert_eq!(total, (THREADS * PER_THREAD) as u64);
    }

    // -- Estimator --------------------------------------------------------

    #[test]
    fn seventy_five_pulses_in_one_second_is_ten() {
        let est = FlowRateEstimator::default();
        let rate = est.estimate(75, Duration::from_secs(1));
        assert!((rate - 10.0).abs() < 1e-4, "rate={rate}");
    }

    #[test]
    fn one_minute_window_with_minute_base_is_count_over_factor() {
        let est = FlowRateEstimator::new(7.5, Duration::from_secs(60));
        for k in [0_u32, 1, 15, 450, 10_000] {
            let rate = est.estimate(k, Duration::from_secs(60));
            let expected = k as f32 / 7.5;
            assert!((rate - expected).abs() < 1e-3, "k={k} rate={rate}");
        }
    }

    #[test]
    fn doubling_window_halves_rate() {
        for est in [
            FlowRateEstimator::default(),
            FlowRateEstimator::new(7.5, Duration::from_secs(60)),
            FlowRateEstimator::new(450.0, Duration::from_secs(60)),
        ] {
            let short = est.estimate(300, Duration::from_millis(1500));
            let long = est.estimate(300, Duration::from_millis(3000));
            assert!((short / 2.0 - long).abs() < 1e-4, "{short} vs {long}");
        }
    }

    #[test]
    fn zero_elapsed_is_zero_rate() {
        let est = FlowRateEstimator::default();
        assert_eq!(est.estimate(100, Duration::ZERO), 0.0);
    }

    // -- Window -----------------------------------------------------------

    #[test]
    fn window_fires_on_elapsed_time_not_calls() {
        let t0 = Instant::now();
        let mut win = FlowWindow::new(Duration::from_millis(1000), t0);

        // Many polls inside the window never fire.
        for ms in (0..1000).step_by(10) {
            assert_eq!(win.poll(t0 + Duration::from_millis(ms)), None);
        }

        // One poll after a long gap fires once with the real elapsed time.
        let late = t0 + Duration::from_millis(1230);
        assert_eq!(win.poll(late), Some(Duration::from_millis(1230)));
        assert_eq!(win.poll(late + Duration::from_millis(999)), None);
        assert_eq!(
            win.poll(late + Duration::from_millis(1000)),
            Some(Duration::from_millis(1000))
        );
    }
}
