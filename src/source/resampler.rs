//! Fixed-point rate conversion
//!
//! Each emulated sample advances an accumulator by `buffer_inc`
//! (host rate / emulated rate in units of [`BUFFER_INC_RES`]). Every time the
//! accumulator passes one whole unit an output sample is due, linearly
//! interpolated between the previous and current input. Depending on the
//! ratio, one input can therefore produce zero, one or several outputs.

use crate::constants::{BUFFER_INC_RES, LOWPASS_SHIFT, LOWPASS_UNIT};

/// Compute `floor(BUFFER_INC_RES * sample_rate * sample_divider / master_clock)`.
///
/// Never returns 0 so that interpolation weights stay defined.
pub fn resample_increment(sample_rate: u32, master_clock: u64, sample_divider: u64) -> u64 {
    let master_clock = master_clock.max(1) as u128;
    let inc = BUFFER_INC_RES as u128 * sample_rate as u128 * sample_divider as u128 / master_clock;
    inc.clamp(1, u64::MAX as u128) as u64
}

/// Resample accumulator state
#[derive(Debug, Clone, Default)]
pub struct Resampler {
    /// Fractional sample-time progress (`buffer_fraction`)
    fraction: u64,
}

impl Resampler {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Resampler { fraction: 0 }
    }

    /// Account for one input sample and iterate the output points it crosses.
    ///
    /// Each item is the 16.16 weight of the *previous* input at that output point.
    pub fn feed(&mut self, increment: u64) -> Emissions<'_> {
        let increment = increment.max(1);
        self.fraction += increment;
        Emissions {
            resampler: self,
            increment,
        }
    }

    /// Current accumulator value
    pub fn fraction(&self) -> u64 {
        self.fraction
    }

    /// Clear the accumulator
    pub fn reset(&mut self) {
        self.fraction = 0;
    }
}

/// Output points produced by one [`Resampler::feed`] call
pub struct Emissions<'a> {
    resampler: &'a mut Resampler,
    increment: u64,
}

impl Iterator for Emissions<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.resampler.fraction > BUFFER_INC_RES {
            self.resampler.fraction -= BUFFER_INC_RES;
            let weight = (self.resampler.fraction << LOWPASS_SHIFT) / self.increment;
            Some(weight.min(LOWPASS_UNIT as u64) as u32)
        } else {
            None
        }
    }
}

/// Blend two samples; `weight` (16.16) applies to `last`.
#[inline]
pub fn interpolate(weight: u32, last: i16, current: i16) -> i16 {
    let weight = weight.min(LOWPASS_UNIT) as i64;
    let tmp = last as i64 * weight + current as i64 * (LOWPASS_UNIT as i64 - weight);
    (tmp >> LOWPASS_SHIFT) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Genesis YM2612: 53.693175 MHz master, one sample every 144*7 clocks
    const MASTER: u64 = 53_693_175;
    const DIVIDER: u64 = 144 * 7;

    #[test]
    fn test_increment_formula() {
        let inc = resample_increment(48_000, MASTER, DIVIDER);
        let expected = (BUFFER_INC_RES as f64 * 48_000.0 * DIVIDER as f64 / MASTER as f64) as u64;
        assert!(inc.abs_diff(expected) <= 1);
        // downsampling from ~53 kHz
        assert!(inc < BUFFER_INC_RES);
    }

    #[test]
    fn test_increment_never_zero() {
        assert_eq!(resample_increment(48_000, u64::MAX, 1), 1);
        assert!(resample_increment(48_000, 0, 1) > 0);
    }

    #[test]
    fn test_output_count_is_ratio_faithful() {
        for &(rate, master, divider) in &[
            (48_000u32, MASTER, DIVIDER),
            (44_100, MASTER, DIVIDER),
            (48_000, 3_579_545, 16), // PSG at ~224 kHz
            (48_000, 8_000, 1),      // 6x upsample
            (22_050, 48_000, 1),
        ] {
            let inc = resample_increment(rate, master, divider);
            for n in [1u64, 17, 1000, 48_000] {
                let mut resampler = Resampler::new();
                let produced: u64 = (0..n).map(|_| resampler.feed(inc).count() as u64).sum();
                let ideal = n * inc / BUFFER_INC_RES;
                assert!(
                    produced.abs_diff(ideal) <= 1,
                    "rate {rate} n {n}: produced {produced}, ideal {ideal}"
                );
            }
        }
    }

    #[test]
    fn test_weights_stay_in_unit_range() {
        let inc = resample_increment(48_000, 8_000, 1);
        let mut resampler = Resampler::new();
        for _ in 0..100 {
            for weight in resampler.feed(inc) {
                assert!(weight <= LOWPASS_UNIT);
            }
            assert!(resampler.fraction() <= BUFFER_INC_RES);
        }
    }

    #[test]
    fn test_interpolate_endpoints() {
        assert_eq!(interpolate(LOWPASS_UNIT, 1000, -1000), 1000);
        assert_eq!(interpolate(0, 1000, -1000), -1000);
        assert_eq!(interpolate(LOWPASS_UNIT / 2, 1000, 3000), 2000);
    }
}
