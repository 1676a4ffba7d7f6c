//! Raw sample → moisture percent.

use serde::{Deserialize, Serialize};

/// Raw converter values at 0 % and 100 % moisture for one probe/soil pair.
///
/// Either ordering is valid. Resistive probes usually read higher when dry
/// (`driest_raw > wettest_raw`); some capacitive boards read the other way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationBounds {
    pub driest_raw: u16,
    pub wettest_raw: u16,
}

impl CalibrationBounds {
    pub const fn new(driest_raw: u16, wettest_raw: u16) -> Self {
        Self {
            driest_raw,
            wettest_raw,
        }
    }

    /// Linear map from `raw` to 0–100, clamped at both ends so that
    /// out-of-calibration samples read as a boundary value.
    ///
    /// A degenerate calibration (both bounds equal) reads 0.
    pub fn to_percent(&self, raw: u16) -> f32 {
        let span = self.wettest_raw as f32 - self.driest_raw as f32;
        if span == 0.0 {
            return 0.0;
        }
        let pct = (raw as f32 - self.driest_raw as f32) / span * 100.0;
        pct.clamp(0.0, 100.0)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const RISING: CalibrationBounds = CalibrationBounds::new(1140, 3333);
    const FALLING: CalibrationBounds = CalibrationBounds::new(26000, 12000);

    // -- Calibration endpoints --------------------------------------------

    #[test]
    fn driest_bound_reads_zero() {
        assert_eq!(RISING.to_percent(1140), 0.0);
    }

    #[test]
    fn wettest_bound_reads_hundred() {
        assert_eq!(RISING.to_percent(3333), 100.0);
    }

    #[test]
    fn midpoint_reads_about_fifty() {
        let pct = RISING.to_percent(2236);
        assert!((pct - 50.0).abs() < 0.1, "midpoint read {pct}");
    }

    // -- Clamping ---------------------------------------------------------

    #[test]
    fn below_driest_clamps_to_zero() {
        for raw in [0, 1, 500, 1139] {
            assert_eq!(RISING.to_percent(raw), 0.0, "raw={raw}");
        }
    }

    #[test]
    fn above_wettest_clamps_to_hundred() {
        for raw in [3334, 4000, 4095, u16::MAX] {
            assert_eq!(RISING.to_percent(raw), 100.0, "raw={raw}");
        }
    }

    #[test]
    fn falling_bounds_clamp_both_ends() {
        assert_eq!(FALLING.to_percent(30000), 0.0);
        assert_eq!(FALLING.to_percent(5000), 100.0);
    }

    // -- Monotonicity -----------------------------------------------------

    #[test]
    fn falling_bounds_non_increasing_in_raw() {
        let mut prev = f32::INFINITY;
        for raw in (10000..=28000).step_by(37) {
            let pct = FALLING.to_percent(raw);
            assert!(pct <= prev, "raw={raw} pct={pct} prev={prev}");
            assert!((0.0..=100.0).contains(&pct));
            prev = pct;
        }
    }

    #[test]
    fn rising_bounds_non_decreasing_in_raw() {
        let mut prev = f32::NEG_INFINITY;
        for raw in (0..=4095).step_by(13) {
            let pct = RISING.to_percent(raw);
            assert!(pct >= prev, "raw={raw} pct={pct} prev={prev}");
            prev = pct;
        }
    }

    #[test]
    fn degenerate_bounds_read_zero() {
        let flat = CalibrationBounds::new(2000, 2000);
        assert_eq!(flat.to_percent(0), 0.0);
        assert_eq!(flat.to_percent(2000), 0.0);
        assert_eq!(flat.to_percent(4095), 0.0);
    }
}
