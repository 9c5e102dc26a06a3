//! Timing and Buffering Constants
//!
//! Shared fixed-point units, limits and tuning values used across the
//! audio sources, the mixer and the synchronization controllers.

/// Fixed-point unit of the resample accumulator (2^30).
///
/// `buffer_inc` is the host/emulated sample-rate ratio expressed in this unit,
/// so one whole output sample is emitted each time the accumulator passes it.
pub const BUFFER_INC_RES: u64 = 1 << 30;

/// Maximum number of concurrently active audio sources.
pub const MAX_SOURCES: usize = 8;

/// Fixed-point unit of the low-pass filter coefficient (alpha = 1.0).
pub const LOWPASS_UNIT: u32 = 0x10000;

/// Shift that converts a `LOWPASS_UNIT`-scaled product back to a sample.
pub const LOWPASS_SHIFT: u32 = 16;

/// Default host sample rate requested from the audio device.
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// Default host callback buffer size, in frames.
pub const DEFAULT_BUFFER_SAMPLES: u32 = 512;

/// Default low-pass cutoff frequency in Hz.
pub const DEFAULT_LOWPASS_CUTOFF: f64 = 3390.0;

/// Base drift correction envelope; divided by the source frame rate.
pub const BASE_MAX_ADJUST: f32 = 0.0125;

/// Frames-to-problem estimate below which the drift controller intervenes.
pub const BUFFER_FRAMES_THRESHOLD: f32 = 6.0;

/// Weight of the previous average in the buffered-change moving average.
pub const DRIFT_AVERAGE_DECAY: f32 = 0.9;

/// Divisor applied (times the source rate) when turning a trend into a ratio.
pub const DRIFT_RESPONSE: f32 = 2.5;

/// Scanlines of emulated time between producer handoffs in free-running mode.
pub const SYNC_LINES: u32 = 8;

/// Maximum pacing table length (one nominal second at 60 Hz).
pub const MAX_SOURCE_HZ: usize = 60;

/// Scale of the pacing accumulator (one display frame).
pub const PACING_UNIT: u32 = 100_000;
