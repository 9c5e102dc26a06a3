//! Audio device integration using rodio
//!
//! Plays the mixer output on the system audio device. rodio pulls samples
//! from an iterator, so the device source refills a callback-sized buffer
//! from the [`Mixer`] whenever it runs dry, which gives the mixer the same
//! cadence a native audio callback would.

use crate::config::{AudioSpec, SampleFormat, SyncConfig};
use crate::mixer::Mixer;
use crate::{AvSyncError, Result};
use rodio::{OutputStream, Sink, Source};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CHANNELS: u16 = 2;

/// rodio source that pulls from the mixer
struct MixerSource {
    mixer: Mixer,
    finished: Arc<AtomicBool>,
    /// One host callback worth of interleaved stereo samples
    buffer: Vec<f32>,
    buffer_pos: usize,
}

impl MixerSource {
    fn new(mixer: Mixer, finished: Arc<AtomicBool>) -> Self {
        let len = CHANNELS as usize * mixer.buffer_samples().max(1) as usize;
        MixerSource {
            mixer,
            finished,
            buffer: vec![0.0; len],
            buffer_pos: len, // refill on first pull
        }
    }

    fn refill(&mut self) {
        self.buffer_pos = 0;
        if self.mixer.is_paused() {
            // gated off: keep the stream alive without touching the sources
            self.buffer.fill(0.0);
            return;
        }
        let report = self.mixer.fill_f32(&mut self.buffer);
        if report.underrun() {
            log::trace!("device pass underran: {report:?}");
        }
    }
}

impl Source for MixerSource {
    fn current_frame_len(&self) -> Option<usize> {
        Some(self.buffer.len() - self.buffer_pos.min(self.buffer.len())).filter(|&n| n > 0)
    }

    fn channels(&self) -> u16 {
        CHANNELS
    }

    fn sample_rate(&self) -> u32 {
        self.mixer.sample_rate()
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

impl Iterator for MixerSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.finished.load(Ordering::Relaxed) {
            return None;
        }
        if self.buffer_pos >= self.buffer.len() {
            self.refill();
        }
        let sample = self.buffer.get(self.buffer_pos).copied().unwrap_or(0.0);
        self.buffer_pos += 1;
        Some(sample)
    }
}

/// Host audio output using rodio
pub struct AudioDevice {
    _stream: OutputStream,
    sink: Sink,
    finished: Arc<AtomicBool>,
}

impl AudioDevice {
    /// Spec the device will run with for a configuration.
    ///
    /// rodio converts whatever rate the source reports to the device's native
    /// rate, so the requested rate and buffer are granted as-is in f32.
    pub fn negotiate(config: &SyncConfig) -> AudioSpec {
        AudioSpec::requested(config).with_format(SampleFormat::F32)
    }

    /// Open the default output device and start pulling from `mixer`
    ///
    /// # Errors
    ///
    /// [`AvSyncError::AudioDeviceError`] when no output stream or sink can be
    /// created.
    pub fn open(mixer: Mixer) -> Result<Self> {
        let (stream, stream_handle) = OutputStream::try_default().map_err(|e| {
            AvSyncError::AudioDeviceError(format!("Failed to create audio stream: {e}"))
        })?;
        let sink = Sink::try_new(&stream_handle).map_err(|e| {
            AvSyncError::AudioDeviceError(format!("Failed to create audio sink: {e}"))
        })?;

        let finished = Arc::new(AtomicBool::new(false));
        log::info!(
            "Opened audio output at {} Hz, {} frame buffer",
            mixer.sample_rate(),
            mixer.buffer_samples()
        );
        sink.append(MixerSource::new(mixer, Arc::clone(&finished)));

        Ok(AudioDevice {
            _stream: stream,
            sink,
            finished,
        })
    }

    /// Stop pulling; the mixer is not invoked again
    pub fn close(&self) {
        self.finished.store(true, Ordering::Relaxed);
        self.sink.stop();
    }
}

impl Drop for AudioDevice {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Channels;
    use crate::AudioContext;

    fn context() -> AudioContext {
        let config = SyncConfig {
            buffer_samples: 32,
            ..SyncConfig::free_running()
        };
        AudioContext::new(&config, AudioDevice::negotiate(&config), 60).unwrap()
    }

    #[test]
    fn test_negotiated_format_is_float() {
        let spec = AudioDevice::negotiate(&SyncConfig::default());
        assert_eq!(spec.format, SampleFormat::F32);
        assert_eq!(spec.sample_rate, 48_000);
    }

    #[test]
    fn test_source_reports_mixer_layout() {
        let ctx = context();
        let source = MixerSource::new(ctx.mixer(), Arc::new(AtomicBool::new(false)));
        assert_eq!(source.channels(), 2);
        assert_eq!(source.sample_rate(), 48_000);
        assert_eq!(source.current_frame_len(), None);
    }

    #[test]
    fn test_paused_device_yields_silence() {
        let ctx = context();
        let _src = ctx.create_source(48_000, 1, Channels::Stereo).unwrap();
        let mut source = MixerSource::new(ctx.mixer(), Arc::new(AtomicBool::new(false)));
        assert!(ctx.is_device_paused());
        assert!((0..256).all(|_| source.next() == Some(0.0)));
    }

    #[test]
    fn test_finished_ends_stream() {
        let ctx = context();
        let finished = Arc::new(AtomicBool::new(false));
        let mut source = MixerSource::new(ctx.mixer(), Arc::clone(&finished));
        assert!(source.next().is_some());
        finished.store(true, Ordering::Relaxed);
        assert_eq!(source.next(), None);
    }

    #[test]
    fn test_open_when_backend_available() {
        let ctx = context();
        match AudioDevice::open(ctx.mixer()) {
            Ok(device) => device.close(),
            Err(err) => {
                eprintln!("Skipping audio device test (audio backend unavailable): {err}");
            }
        }
    }
}
