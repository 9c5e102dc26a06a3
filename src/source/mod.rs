//! Audio sources
//!
//! One [`AudioSource`] per emulated sound generator (chip or channel group).
//! The emulation thread owns the source and feeds it one sample per emulated
//! audio tick; each sample is low-pass filtered, resampled to the host rate
//! and handed to the mixer:
//! - audio-locked: into a back buffer that is sent over a capacity-1 channel
//!   when full (the send blocks while the previous buffer is still pending)
//! - free-running: into a [`SampleRing`] whose write cursor is published
//!   every few scanlines of emulated time; never blocks

pub mod lowpass;
pub mod resampler;

pub use lowpass::{lowpass_alpha, lowpass_sample};
pub use resampler::{interpolate, resample_increment, Resampler};

use crate::context::Shared;
use crate::streaming::SampleRing;
use crate::AvSyncError;
use crossbeam::channel::{Receiver, Sender};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Channel layout of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channels {
    /// One channel, duplicated to both outputs when mixed
    Mono,
    /// Interleaved left/right
    Stereo,
}

impl Channels {
    /// Number of interleaved samples per frame
    pub fn count(self) -> u32 {
        match self {
            Channels::Mono => 1,
            Channels::Stereo => 2,
        }
    }
}

impl TryFrom<u8> for Channels {
    type Error = AvSyncError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Channels::Mono),
            2 => Ok(Channels::Stereo),
            other => Err(AvSyncError::ConfigError(format!(
                "audio sources have 1 or 2 channels, got {other}"
            ))),
        }
    }
}

/// Identity of a registered source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub(crate) u64);

/// Per-source counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    /// Emulated samples received
    pub samples_in: u64,
    /// Host-rate frames emitted by the resampler
    pub frames_out: u64,
    /// Ready signals raised (buffer swaps or cursor publications)
    pub handoffs: u64,
}

/// Source state visible to the mixer and the drift controller
#[derive(Debug)]
pub(crate) struct SourceShared {
    pub(crate) id: SourceId,
    pub(crate) channels: Channels,
    /// Native sample period in seconds (`sample_divider / master_clock`)
    pub(crate) sample_period: f64,
    /// Resample ratio in `BUFFER_INC_RES` units (`buffer_inc`)
    pub(crate) buffer_inc: AtomicU64,
    pub(crate) lowpass_alpha: AtomicU32,
    /// Bumped whenever the context swaps in a larger ring
    pub(crate) ring_generation: AtomicU32,
}

impl SourceShared {
    /// Scale the resample ratio by `1 + ratio`, rounding to nearest
    pub(crate) fn scale_increment(&self, ratio: f32) {
        let inc = self.buffer_inc.load(Ordering::Relaxed) as f64;
        let scaled = (inc + inc * ratio as f64 + 0.5).max(1.0) as u64;
        self.buffer_inc.store(scaled, Ordering::Relaxed);
    }
}

/// Mixer-side half of a source's output path
#[derive(Debug)]
pub(crate) enum SlotLink {
    Locked {
        ready_rx: Receiver<Vec<i16>>,
        recycle_tx: Sender<Vec<i16>>,
    },
    FreeRunning {
        ring: Arc<SampleRing>,
    },
}

/// Registry entry owned by the context
#[derive(Debug)]
pub(crate) struct SourceSlot {
    pub(crate) source: Arc<SourceShared>,
    pub(crate) link: SlotLink,
}

/// Producer-side half of a source's output path
enum Output {
    Locked {
        back: Vec<i16>,
        pos: usize,
        ready_tx: Sender<Vec<i16>>,
        recycle_rx: Receiver<Vec<i16>>,
    },
    FreeRunning {
        ring: Arc<SampleRing>,
        write_pos: u32,
        /// Producer's copy of `read_end`
        published: u32,
        /// `ring_generation` this ring belongs to
        generation: u32,
    },
}

impl Output {
    #[inline]
    fn write(&mut self, sample: i16) {
        match self {
            Output::Locked { back, pos, .. } => {
                if let Some(slot) = back.get_mut(*pos) {
                    *slot = sample;
                }
                *pos += 1;
            }
            Output::FreeRunning {
                ring, write_pos, ..
            } => {
                *write_pos = ring.push(*write_pos, sample);
            }
        }
    }

    /// Called after each complete output frame; runs the ready protocol
    /// once enough frames have accumulated.
    fn frame_written(&mut self, context: &Shared, channels: u32, stats: &mut SourceStats) {
        match self {
            Output::Locked {
                back,
                pos,
                ready_tx,
                recycle_rx,
            } => {
                if *pos < back.len() {
                    return;
                }
                let spare = recycle_rx
                    .try_recv()
                    .unwrap_or_else(|_| vec![0; back.len()]);
                let full = std::mem::replace(back, spare);
                *pos = 0;
                stats.handoffs += 1;
                // blocks while the previous buffer is still pending; fails
                // only once the context has shut down
                if ready_tx.send(full).is_err() {
                    log::trace!("handoff dropped, mixer is gone");
                }
            }
            Output::FreeRunning {
                ring,
                write_pos,
                published,
                ..
            } => {
                let pending = ring.distance(*published, *write_pos) / channels;
                if pending < context.sync_samples() {
                    return;
                }
                ring.publish(*write_pos);
                *published = *write_pos;
                stats.handoffs += 1;
                let buffered = ring.available() / channels;
                if buffered >= context.min_buffered() && context.device_paused() {
                    context.set_device_paused(false);
                }
            }
        }
    }
}

/// Producer handle for one emulated sound generator
///
/// Created by [`AudioContext::create_source`](crate::AudioContext::create_source).
/// Dropping the handle unregisters it from the mixer.
pub struct AudioSource {
    shared: Arc<SourceShared>,
    context: Arc<Shared>,
    resampler: Resampler,
    last_left: i16,
    last_right: i16,
    output: Output,
    stats: SourceStats,
}

impl AudioSource {
    pub(crate) fn new_locked(
        shared: Arc<SourceShared>,
        context: Arc<Shared>,
        buffer_len: usize,
        ready_tx: Sender<Vec<i16>>,
        recycle_rx: Receiver<Vec<i16>>,
    ) -> Self {
        Self::with_output(
            shared,
            context,
            Output::Locked {
                back: vec![0; buffer_len],
                pos: 0,
                ready_tx,
                recycle_rx,
            },
        )
    }

    pub(crate) fn new_free_running(
        shared: Arc<SourceShared>,
        context: Arc<Shared>,
        ring: Arc<SampleRing>,
    ) -> Self {
        Self::with_output(
            shared,
            context,
            Output::FreeRunning {
                ring,
                write_pos: 0,
                published: 0,
                generation: 0,
            },
        )
    }

    fn with_output(shared: Arc<SourceShared>, context: Arc<Shared>, output: Output) -> Self {
        AudioSource {
            shared,
            context,
            resampler: Resampler::new(),
            last_left: 0,
            last_right: 0,
            output,
            stats: SourceStats::default(),
        }
    }

    /// Registry identity
    pub fn id(&self) -> SourceId {
        self.shared.id
    }

    /// Channel layout fixed at creation
    pub fn channels(&self) -> Channels {
        self.shared.channels
    }

    /// Current resample ratio in `BUFFER_INC_RES` units
    pub fn resample_increment(&self) -> u64 {
        self.shared.buffer_inc.load(Ordering::Relaxed)
    }

    /// Current fixed-point low-pass coefficient
    pub fn lowpass_alpha(&self) -> u32 {
        self.shared.lowpass_alpha.load(Ordering::Relaxed)
    }

    /// Producer counters
    pub fn stats(&self) -> SourceStats {
        self.stats
    }

    /// Recompute the resample ratio after the emulated clock divider changed.
    ///
    /// Filter history and cursors are left untouched.
    pub fn adjust_clock(&mut self, master_clock: u64, sample_divider: u64) {
        let inc = resample_increment(self.context.sample_rate(), master_clock, sample_divider);
        self.shared.buffer_inc.store(inc, Ordering::Relaxed);
    }

    /// Switch to the ring the context allocated after a retime, starting it
    /// from empty. Unpublished samples in the old ring are lost.
    fn follow_ring(&mut self) {
        let Output::FreeRunning {
            ring,
            write_pos,
            published,
            generation,
        } = &mut self.output
        else {
            return;
        };
        let current = self.shared.ring_generation.load(Ordering::Acquire);
        if current == *generation {
            return;
        }
        if let Some(fresh) = self.context.ring_of(self.shared.id) {
            log::debug!(
                "source {:?} moved to a {} sample ring",
                self.shared.id,
                fresh.capacity()
            );
            *ring = fresh;
            *write_pos = 0;
            *published = 0;
            self.resampler.reset();
        }
        *generation = current;
    }

    /// Feed one mono sample
    pub fn put_mono_sample(&mut self, value: i16) {
        if self.shared.channels == Channels::Stereo {
            self.put_stereo_sample(value, value);
            return;
        }
        self.follow_ring();
        let alpha = self.shared.lowpass_alpha.load(Ordering::Relaxed);
        let value = lowpass_sample(alpha, self.last_left, value);
        let inc = self.shared.buffer_inc.load(Ordering::Relaxed);
        self.stats.samples_in += 1;

        for weight in self.resampler.feed(inc) {
            self.output.write(interpolate(weight, self.last_left, value));
            self.stats.frames_out += 1;
            self.output.frame_written(&self.context, 1, &mut self.stats);
        }
        self.last_left = value;
    }

    /// Feed one stereo sample pair
    pub fn put_stereo_sample(&mut self, left: i16, right: i16) {
        if self.shared.channels == Channels::Mono {
            self.put_mono_sample(((left as i32 + right as i32) / 2) as i16);
            return;
        }
        self.follow_ring();
        let alpha = self.shared.lowpass_alpha.load(Ordering::Relaxed);
        let left = lowpass_sample(alpha, self.last_left, left);
        let right = lowpass_sample(alpha, self.last_right, right);
        let inc = self.shared.buffer_inc.load(Ordering::Relaxed);
        self.stats.samples_in += 1;

        for weight in self.resampler.feed(inc) {
            self.output.write(interpolate(weight, self.last_left, left));
            self.output.write(interpolate(weight, self.last_right, right));
            self.stats.frames_out += 1;
            self.output.frame_written(&self.context, 2, &mut self.stats);
        }
        self.last_left = left;
        self.last_right = right;
    }
}

impl Drop for AudioSource {
    fn drop(&mut self) {
        self.context.unregister(self.shared.id);
    }
}

impl std::fmt::Debug for AudioSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioSource")
            .field("id", &self.shared.id)
            .field("channels", &self.shared.channels)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AudioSpec, SyncConfig};
    use crate::constants::BUFFER_INC_RES;
    use crate::AudioContext;

    fn context(config: SyncConfig) -> AudioContext {
        AudioContext::new(&config, AudioSpec::requested(&config), 60).unwrap()
    }

    #[test]
    fn test_channels_from_count() {
        assert_eq!(Channels::try_from(1).unwrap(), Channels::Mono);
        assert_eq!(Channels::try_from(2).unwrap(), Channels::Stereo);
        assert!(Channels::try_from(3).is_err());
    }

    #[test]
    fn test_scale_increment_rounds() {
        let shared = SourceShared {
            id: SourceId(0),
            channels: Channels::Mono,
            sample_period: 1.0 / 48_000.0,
            buffer_inc: AtomicU64::new(BUFFER_INC_RES),
            lowpass_alpha: AtomicU32::new(0x10000),
            ring_generation: AtomicU32::new(0),
        };
        shared.scale_increment(0.001);
        let expected = (BUFFER_INC_RES as f64 * 1.001).round() as u64;
        assert!(shared.buffer_inc.load(Ordering::Relaxed).abs_diff(expected) <= 1);
    }

    #[test]
    fn test_adjust_clock_keeps_counters() {
        let ctx = context(SyncConfig::free_running());
        let mut src = ctx.create_source(53_693_175, 144 * 7, Channels::Stereo).unwrap();
        for _ in 0..100 {
            src.put_stereo_sample(1000, -1000);
        }
        let before = src.stats();
        let old_inc = src.resample_increment();
        // PAL master clock
        src.adjust_clock(53_203_424, 144 * 7);
        assert!(src.resample_increment() > old_inc);
        assert_eq!(src.stats(), before);
    }

    #[test]
    fn test_free_running_publishes_every_sync_interval() {
        let ctx = context(SyncConfig::free_running());
        let mut src = ctx.create_source(48_000, 1, Channels::Mono).unwrap();
        let sync = ctx.sync_samples() as u64;
        for _ in 0..(sync * 10 + 1) {
            src.put_mono_sample(500);
        }
        let stats = src.stats();
        assert_eq!(stats.frames_out, sync * 10);
        assert_eq!(stats.handoffs, 10);
    }

    #[test]
    fn test_mono_sample_on_stereo_source_duplicates() {
        let ctx = context(SyncConfig::free_running());
        let mut src = ctx.create_source(48_000, 1, Channels::Stereo).unwrap();
        src.put_mono_sample(1000);
        src.put_mono_sample(1000);
        assert_eq!(src.stats().samples_in, 2);
        assert_eq!(src.stats().frames_out, 1);
    }
}
