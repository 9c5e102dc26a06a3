//! Clock drift controller (free-running mode)
//!
//! The emulated audio clock and the host device clock are independent and
//! both imprecise, so buffer occupancy slowly creeps up or down. Once per
//! video frame the controller looks at the minimum occupancy across sources,
//! tracks its trend with an exponential moving average and, when the trend
//! threatens an underflow or overflow, scales every source's resample ratio
//! by a small fraction. Corrections are kept below `0.0125 / source_hz` so
//! the pitch change stays inaudible.

use crate::constants::{
    BASE_MAX_ADJUST, BUFFER_FRAMES_THRESHOLD, DRIFT_AVERAGE_DECAY, DRIFT_RESPONSE,
};

/// What the controller wants done this frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftDecision {
    /// Fraction to scale every resample increment by (`inc *= 1 + ratio`)
    pub adjust_ratio: f32,
    /// An underrun happened; the host device must be paused until refilled
    pub pause_device: bool,
    /// Estimated frames before an underflow or overflow at the current trend
    pub frames_to_problem: f32,
}

impl DriftDecision {
    /// Whether any correction is requested
    pub fn is_correction(&self) -> bool {
        self.adjust_ratio != 0.0
    }
}

/// Snapshot of the controller state
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DriftStats {
    /// Moving average of the frame-to-frame change in minimum occupancy
    pub average_change: f32,
    /// Minimum occupancy observed last frame, if any since the last reset
    pub last_buffered: Option<i32>,
    /// Non-zero corrections applied so far
    pub corrections: u64,
    /// Underrun recoveries so far
    pub underruns: u64,
}

/// Proportional-trend controller
#[derive(Debug, Clone)]
pub struct DriftController {
    sample_rate: u32,
    source_hz: u32,
    max_adjust: f32,
    average_change: f32,
    last_buffered: Option<i32>,
    corrections: u64,
    underruns: u64,
}

impl DriftController {
    /// Create a controller for the given host sample rate and video rate
    pub fn new(sample_rate: u32, source_hz: u32) -> Self {
        let mut controller = DriftController {
            sample_rate: sample_rate.max(1),
            source_hz: 1,
            max_adjust: BASE_MAX_ADJUST,
            average_change: 0.0,
            last_buffered: None,
            corrections: 0,
            underruns: 0,
        };
        controller.set_source_hz(source_hz);
        controller
    }

    /// Retune the correction envelope for a new source frame rate
    pub fn set_source_hz(&mut self, source_hz: u32) {
        self.source_hz = source_hz.max(1);
        self.max_adjust = BASE_MAX_ADJUST / self.source_hz as f32;
    }

    /// Largest ratio applied in a single frame
    pub fn max_adjust(&self) -> f32 {
        self.max_adjust
    }

    /// Forget the trend
    pub fn reset(&mut self) {
        self.average_change = 0.0;
        self.last_buffered = None;
    }

    /// Current trend and counters
    pub fn stats(&self) -> DriftStats {
        DriftStats {
            average_change: self.average_change,
            last_buffered: self.last_buffered,
            corrections: self.corrections,
            underruns: self.underruns,
        }
    }

    /// Feed this frame's observation and decide on a correction.
    ///
    /// `cur_min_buffered` is the minimum frames left buffered across sources
    /// (negative after an underrun), `min_remaining` the minimum free ring
    /// space and `min_buffered` the steady-state target.
    pub fn update(
        &mut self,
        cur_min_buffered: i32,
        min_remaining: u32,
        min_buffered: u32,
    ) -> DriftDecision {
        if let Some(last) = self.last_buffered {
            self.average_change = self.average_change * DRIFT_AVERAGE_DECAY
                + (cur_min_buffered - last) as f32 * (1.0 - DRIFT_AVERAGE_DECAY);
        }
        self.last_buffered = Some(cur_min_buffered);

        let avg = self.average_change;
        let frames_to_problem = if avg < 0.0 {
            cur_min_buffered as f32 / -avg
        } else {
            min_remaining as f32 / avg
        };

        let cur = cur_min_buffered as i64;
        let target = min_buffered as i64;
        let mut pause_device = false;
        let mut adjust_ratio = 0.0f32;

        if frames_to_problem < BUFFER_FRAMES_THRESHOLD
            || (avg < 0.0 && cur < 3 * target / 4)
            || (avg > 0.0 && cur > 5 * target / 4)
            || cur < 0
        {
            if cur < 0 {
                adjust_ratio = self.max_adjust;
                pause_device = true;
                self.last_buffered = None;
                self.underruns += 1;
            } else {
                let ratio = -avg / (self.sample_rate as f32 / self.source_hz as f32)
                    / (DRIFT_RESPONSE * self.source_hz as f32);
                adjust_ratio = ratio.clamp(-self.max_adjust, self.max_adjust);
            }
        } else if cur < target / 2 {
            adjust_ratio = self.max_adjust;
        }

        if adjust_ratio != 0.0 {
            self.average_change = 0.0;
            self.corrections += 1;
            log::trace!(
                "drift correction {adjust_ratio:+.6} (buffered {cur_min_buffered}, {frames_to_problem:.1} frames to problem)"
            );
        }

        DriftDecision {
            adjust_ratio,
            pause_device,
            frames_to_problem,
        }
    }
}
