//! Fixed-point single-pole low-pass filter
//!
//! Chip output is band-limited before resampling with a first-order IIR:
//! `y = (x * alpha + y_prev * (1 - alpha)) >> 16`, alpha in `[0, 0x10000]`.

use crate::constants::{LOWPASS_SHIFT, LOWPASS_UNIT};
use std::f64::consts::PI;

/// Derive the fixed-point filter coefficient for a cutoff frequency.
///
/// `sample_period` is the source's native sample period in seconds
/// (`sample_divider / master_clock`). Degenerate inputs never fail:
/// a non-finite or non-positive cutoff (or period) disables filtering
/// (alpha = 1.0), and finite results are clamped to `[1, 0x10000]`.
pub fn lowpass_alpha(cutoff_hz: f64, sample_period: f64) -> u32 {
    if !(cutoff_hz.is_finite() && cutoff_hz > 0.0) || !(sample_period.is_finite() && sample_period > 0.0) {
        log::warn!("Degenerate low-pass cutoff {cutoff_hz} Hz, filtering disabled");
        return LOWPASS_UNIT;
    }
    let rc = (1.0 / cutoff_hz) / (2.0 * PI);
    let alpha = sample_period / (sample_period + rc);
    let fixed = (LOWPASS_UNIT as f64 * alpha) as i64;
    fixed.clamp(1, LOWPASS_UNIT as i64) as u32
}

/// Apply one filter step
#[inline]
pub fn lowpass_sample(alpha: u32, last: i16, current: i16) -> i16 {
    let alpha = alpha.min(LOWPASS_UNIT) as i64;
    let tmp = current as i64 * alpha + last as i64 * (LOWPASS_UNIT as i64 - alpha);
    (tmp >> LOWPASS_SHIFT) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    const GENESIS_PERIOD: f64 = 144.0 * 7.0 / 53_693_175.0;

    #[test]
    fn test_alpha_in_range() {
        let alpha = lowpass_alpha(3390.0, GENESIS_PERIOD);
        assert!(alpha > 0 && alpha < LOWPASS_UNIT, "alpha {alpha}");
    }

    #[test]
    fn test_higher_cutoff_passes_more() {
        let low = lowpass_alpha(1000.0, GENESIS_PERIOD);
        let high = lowpass_alpha(10_000.0, GENESIS_PERIOD);
        assert!(high > low);
    }

    #[test]
    fn test_degenerate_cutoff_is_clamped() {
        assert_eq!(lowpass_alpha(0.0, GENESIS_PERIOD), LOWPASS_UNIT);
        assert_eq!(lowpass_alpha(-5.0, GENESIS_PERIOD), LOWPASS_UNIT);
        assert_eq!(lowpass_alpha(f64::NAN, GENESIS_PERIOD), LOWPASS_UNIT);
        assert_eq!(lowpass_alpha(f64::INFINITY, GENESIS_PERIOD), LOWPASS_UNIT);
        // vanishingly small cutoff still lets something through
        assert_eq!(lowpass_alpha(1e-12, GENESIS_PERIOD), 1);
    }

    #[test]
    fn test_unit_alpha_is_passthrough() {
        assert_eq!(lowpass_sample(LOWPASS_UNIT, 1234, -4321), -4321);
        assert_eq!(lowpass_sample(LOWPASS_UNIT, i16::MIN, i16::MAX), i16::MAX);
    }

    #[test]
    fn test_constant_input_converges_monotonically() {
        for &(target, alpha) in &[(20_000i16, 5_000u32), (-15_000, 20_000), (32_767, 65_535)] {
            let mut y: i16 = 0;
            let mut prev_gap = (target as i32 - y as i32).abs();
            for _ in 0..10_000 {
                y = lowpass_sample(alpha, y, target);
                let gap = (target as i32 - y as i32).abs();
                assert!(gap <= prev_gap, "filter moved away from the input");
                // never overshoots the input
                if target > 0 {
                    assert!(y <= target);
                } else {
                    assert!(y >= target);
                }
                prev_gap = gap;
            }
            // floor rounding can leave a residue of at most 0x10000 / alpha
            let residue = LOWPASS_UNIT as i32 / alpha as i32 + 1;
            assert!(prev_gap <= residue, "gap {prev_gap} residue {residue}");
        }
    }
}
