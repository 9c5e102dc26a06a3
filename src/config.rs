//! Synchronization configuration
//!
//! User-facing settings (sync source, low-pass cutoff, requested device
//! parameters) plus the negotiated host audio spec and video standard.

use crate::constants::{DEFAULT_BUFFER_SAMPLES, DEFAULT_LOWPASS_CUTOFF, DEFAULT_SAMPLE_RATE};
use crate::{AvSyncError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Which clock drives emulation pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncSource {
    /// Audio-locked: the producer blocks until the host device consumes its buffer
    Audio,
    /// Free-running: video drives pacing, audio resample ratio absorbs drift
    #[default]
    Video,
}

/// Configuration for the synchronization core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Clock that paces emulation
    pub sync_source: SyncSource,
    /// Low-pass cutoff frequency in Hz applied to every source
    pub lowpass_cutoff: f64,
    /// Requested host sample rate in Hz
    pub sample_rate: u32,
    /// Requested host callback buffer size, in frames
    pub buffer_samples: u32,
}

impl SyncConfig {
    /// Audio-locked configuration with default device parameters
    pub fn audio_locked() -> Self {
        SyncConfig {
            sync_source: SyncSource::Audio,
            ..Self::default()
        }
    }

    /// Free-running configuration with default device parameters
    pub fn free_running() -> Self {
        SyncConfig {
            sync_source: SyncSource::Video,
            ..Self::default()
        }
    }

    /// True when the audio device paces emulation
    pub fn sync_to_audio(&self) -> bool {
        self.sync_source == SyncSource::Audio
    }

    /// Parse a configuration from JSON. Missing keys take their defaults.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: SyncConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Reject values the device negotiation cannot work with.
    ///
    /// The low-pass cutoff is not validated here: degenerate values are
    /// clamped when the filter coefficient is derived.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(AvSyncError::ConfigError(
                "sample rate must be greater than 0".into(),
            ));
        }
        if self.buffer_samples == 0 {
            return Err(AvSyncError::ConfigError(
                "buffer size must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            sync_source: SyncSource::default(),
            lowpass_cutoff: DEFAULT_LOWPASS_CUTOFF,
            sample_rate: DEFAULT_SAMPLE_RATE,
            buffer_samples: DEFAULT_BUFFER_SAMPLES,
        }
    }
}

/// Sample format negotiated with the host device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleFormat {
    /// Interleaved signed 16-bit
    S16,
    /// Interleaved 32-bit float
    F32,
    /// Anything else; mixing degrades to silence
    Unsupported(String),
}

/// Parameters the host audio device actually granted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSpec {
    /// Output sample rate in Hz
    pub sample_rate: u32,
    /// Callback buffer size, in frames
    pub buffer_samples: u32,
    /// Output sample format
    pub format: SampleFormat,
}

impl AudioSpec {
    /// The spec a device would grant if it honoured the request exactly
    pub fn requested(config: &SyncConfig) -> Self {
        AudioSpec {
            sample_rate: config.sample_rate,
            buffer_samples: config.buffer_samples,
            format: SampleFormat::S16,
        }
    }

    /// Same spec with a different sample format
    pub fn with_format(mut self, format: SampleFormat) -> Self {
        self.format = format;
        self
    }
}

/// Emulated video standard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoStandard {
    /// 60 Hz, 262 lines
    #[default]
    Ntsc,
    /// 50 Hz, 313 lines
    Pal,
}

impl VideoStandard {
    /// Nominal source frame rate
    pub fn source_hz(self) -> u32 {
        match self {
            VideoStandard::Ntsc => 60,
            VideoStandard::Pal => 50,
        }
    }

    /// Scanlines per frame
    pub fn lines_per_frame(self) -> u32 {
        match self {
            VideoStandard::Ntsc => 262,
            VideoStandard::Pal => 313,
        }
    }
}
