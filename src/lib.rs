//! Audio/video synchronization core for emulator frontends
//!
//! Takes the sample streams of emulated sound chips, each running on its own
//! emulated clock, and delivers them to a host audio device running on an
//! independent real-time clock, while deciding how often each emulated video
//! frame is presented on a host display of a different refresh rate.
//!
//! # Features
//! - Per-chip audio sources with a fixed-point low-pass filter and linear
//!   interpolation resampler
//! - Audio-locked mode: the host callback paces emulation through a bounded
//!   buffer handoff
//! - Free-running mode: video paces emulation, a drift controller nudges the
//!   resample ratio to keep the ring buffers near their target occupancy
//! - Frame pacing table repeating or dropping frames for mismatched refresh rates
//! - Up to 8 concurrently mixed sources
//!
//! # Crate feature flags
//! - `streaming` (opt-in): rodio-backed host audio device and the demo binary
//!
//! # Quick start
//! ```no_run
//! use avsync::{AudioContext, AudioSpec, Channels, FrameInfo, SyncConfig};
//!
//! let config = SyncConfig::free_running();
//! let mut ctx = AudioContext::new(&config, AudioSpec::requested(&config), 60).unwrap();
//! // YM2612: 53.69 MHz master clock, one sample every 144 * 7 clocks
//! let mut fm = ctx.create_source(53_693_175, 144 * 7, Channels::Stereo).unwrap();
//!
//! // host audio thread
//! let mixer = ctx.mixer();
//! std::thread::spawn(move || {
//!     let mut out = vec![0i16; 2 * mixer.buffer_samples() as usize];
//!     loop {
//!         mixer.fill_s16(&mut out);
//!         // hand `out` to the device
//!     }
//! });
//!
//! // emulation thread
//! loop {
//!     for _ in 0..888 {
//!         fm.put_stereo_sample(0, 0);
//!     }
//!     ctx.frame_complete(FrameInfo::progressive(320), &mut || { /* swap buffers */ });
//! }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod constants;
pub mod context;
pub mod mixer;
pub mod source;
pub mod streaming; // Ring buffer & host device
pub mod sync;

/// Error types for synchronization operations
#[derive(thiserror::Error, Debug)]
pub enum AvSyncError {
    /// All source slots are taken
    #[error("Too many audio sources (max {max})")]
    TooManySources {
        /// Slot limit
        max: usize,
    },

    /// Audio device error
    #[error("Audio device error: {0}")]
    AudioDeviceError(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// Ring buffer sizing error
    #[error("Invalid buffer: {0}")]
    InvalidBuffer(String),

    /// IO error from filesystem or device
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed configuration file
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for AvSyncError {
    /// Converts a String into `AvSyncError::Other`.
    ///
    /// Prefer a specific variant (`ConfigError`, `AudioDeviceError`, ...)
    /// where one applies.
    fn from(msg: String) -> Self {
        AvSyncError::Other(msg)
    }
}

impl From<&str> for AvSyncError {
    /// Converts a string slice into `AvSyncError::Other`.
    fn from(msg: &str) -> Self {
        AvSyncError::Other(msg.to_string())
    }
}

/// Result type for synchronization operations
pub type Result<T> = std::result::Result<T, AvSyncError>;

// Public API exports
pub use config::{AudioSpec, SampleFormat, SyncConfig, SyncSource, VideoStandard};
pub use context::AudioContext;
pub use mixer::{MixReport, Mixer, OutputSample};
pub use source::{AudioSource, Channels, SourceId, SourceStats};
#[cfg(feature = "streaming")]
pub use streaming::AudioDevice;
pub use streaming::SampleRing;
pub use sync::{
    DriftController, DriftDecision, DriftStats, FieldParity, FrameInfo, FramePacingTable,
    FrameSink, PresentOutcome,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_errors_map_to_other() {
        let err: AvSyncError = "boom".into();
        assert!(matches!(err, AvSyncError::Other(ref m) if m == "boom"));
        let err: AvSyncError = String::from("bang").into();
        assert_eq!(err.to_string(), "bang");
    }

    #[test]
    fn test_too_many_sources_message() {
        let err = AvSyncError::TooManySources { max: 8 };
        assert_eq!(err.to_string(), "Too many audio sources (max 8)");
    }
}
