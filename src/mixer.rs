//! Mixer invoked from the host audio callback
//!
//! Sums every active source into the callback's interleaved stereo buffer.
//! The destination is zero-filled first and sources are added on top with no
//! clipping: several loud sources can wrap in 16-bit output.
//!
//! In audio-locked mode a pass waits until every active source has handed
//! over a full buffer. In free-running mode it drains whatever each source's
//! ring holds and records the buffer occupancy the drift controller consumes.

use crate::config::{SampleFormat, SyncSource};
use crate::constants::MAX_SOURCES;
use crate::context::Shared;
use crate::source::{Channels, SlotLink, SourceId};
use crate::streaming::SampleRing;
use crossbeam::channel::{Receiver, Select};
use smallvec::SmallVec;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Occupancy recorded by the last free-running mix pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BufferObservation {
    /// Minimum frames left buffered across sources; negative after an underrun
    pub(crate) cur_min_buffered: i32,
    /// Minimum free ring capacity across sources, in frames
    pub(crate) min_remaining: u32,
    /// Completed passes since the context was created
    pub(crate) mix_passes: u64,
}

/// Host output sample type
pub trait OutputSample: Copy {
    /// Value the destination is cleared to
    const SILENCE: Self;

    /// Add one 16-bit source sample to this output sample
    fn accumulate(&mut self, sample: i16);
}

impl OutputSample for i16 {
    const SILENCE: Self = 0;

    #[inline]
    fn accumulate(&mut self, sample: i16) {
        *self = self.wrapping_add(sample);
    }
}

impl OutputSample for f32 {
    const SILENCE: Self = 0.0;

    #[inline]
    fn accumulate(&mut self, sample: i16) {
        *self += sample as f32 / i16::MAX as f32;
    }
}

/// Outcome of one callback pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MixReport {
    /// Sources summed into the destination
    pub sources_mixed: usize,
    /// Free-running only: minimum frames still buffered after the pass,
    /// negative by the shortfall when a source ran dry
    pub min_buffered: Option<i32>,
}

impl MixReport {
    /// Whether at least one source could not fill the destination
    pub fn underrun(&self) -> bool {
        matches!(self.min_buffered, Some(frames) if frames < 0)
    }
}

/// Sum one buffer of source samples into interleaved stereo output
fn accumulate_frames<S: OutputSample>(out: &mut [S], data: &[i16], channels: Channels) {
    match channels {
        Channels::Mono => {
            for (frame, &sample) in out.chunks_exact_mut(2).zip(data) {
                frame[0].accumulate(sample);
                frame[1].accumulate(sample);
            }
        }
        Channels::Stereo => {
            for (frame, pair) in out.chunks_exact_mut(2).zip(data.chunks_exact(2)) {
                frame[0].accumulate(pair[0]);
                frame[1].accumulate(pair[1]);
            }
        }
    }
}

/// Mix one ring into `out`, returning the frames still available afterwards
/// or, if the ring ran dry first, the negated shortfall.
///
/// With `consume` unset the read cursor is left where it was.
fn mix_ring<S: OutputSample>(
    out: &mut [S],
    ring: &SampleRing,
    channels: Channels,
    consume: bool,
) -> i32 {
    let wanted = out.len() / 2;
    let end = ring.read_end();
    let mut pos = ring.read_start();
    let mut frames = 0;

    for frame in out.chunks_exact_mut(2) {
        if pos == end {
            break;
        }
        match channels {
            Channels::Mono => {
                let sample = ring.peek(pos);
                frame[0].accumulate(sample);
                frame[1].accumulate(sample);
                pos = pos.wrapping_add(1) & ring.mask();
            }
            Channels::Stereo => {
                frame[0].accumulate(ring.peek(pos));
                frame[1].accumulate(ring.peek(pos.wrapping_add(1)));
                pos = pos.wrapping_add(2) & ring.mask();
            }
        }
        frames += 1;
    }

    if consume {
        ring.advance_read(pos);
    }
    if frames < wanted {
        let shortfall = wanted - frames;
        log::debug!(
            "Underflow of {shortfall} samples, read_start: {pos}, read_end: {end}, mask: {:X}",
            ring.mask()
        );
        -(shortfall as i32)
    } else {
        (ring.distance(pos, end) / channels.count()) as i32
    }
}

/// Handle the host audio callback drives
///
/// Cloneable and `Send`; all clones mix the same context. Each clone keeps
/// its own scratch buffers for [`Mixer::fill_bytes`].
#[derive(Clone)]
pub struct Mixer {
    shared: Arc<Shared>,
    scratch_s16: Vec<i16>,
    scratch_f32: Vec<f32>,
}

/// Borrow the first `len` samples of a grow-only scratch buffer
fn scratch<S: OutputSample>(buffer: &mut Vec<S>, len: usize) -> &mut [S] {
    if buffer.len() < len {
        buffer.resize(len, S::SILENCE);
    }
    &mut buffer[..len]
}

impl Mixer {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Mixer {
            shared,
            scratch_s16: Vec::new(),
            scratch_f32: Vec::new(),
        }
    }

    /// Negotiated host sample rate
    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate()
    }

    /// Negotiated callback size in frames
    pub fn buffer_samples(&self) -> u32 {
        self.shared.spec().buffer_samples
    }

    /// Negotiated sample format
    pub fn format(&self) -> &SampleFormat {
        &self.shared.spec().format
    }

    /// Whether the context currently gates the host device off
    pub fn is_paused(&self) -> bool {
        self.shared.device_paused()
    }

    /// Fill interleaved 16-bit stereo output
    pub fn fill_s16(&self, out: &mut [i16]) -> MixReport {
        self.fill(out)
    }

    /// Fill interleaved 32-bit float stereo output
    pub fn fill_f32(&self, out: &mut [f32]) -> MixReport {
        self.fill(out)
    }

    /// Fill a raw callback buffer of `out.len()` bytes in the negotiated
    /// format (native endian).
    ///
    /// The intermediate buffer only grows, so a callback of steady size stops
    /// allocating after its first pass.
    pub fn fill_bytes(&mut self, out: &mut [u8]) -> MixReport {
        out.fill(0);
        let shared = Arc::clone(&self.shared);
        match &shared.spec().format {
            SampleFormat::S16 => {
                let mut buffer = std::mem::take(&mut self.scratch_s16);
                let samples = scratch(&mut buffer, out.len() / 2);
                let report = self.fill(samples);
                for (dst, sample) in out.chunks_exact_mut(2).zip(samples.iter()) {
                    dst.copy_from_slice(&sample.to_ne_bytes());
                }
                self.scratch_s16 = buffer;
                report
            }
            SampleFormat::F32 => {
                let mut buffer = std::mem::take(&mut self.scratch_f32);
                let samples = scratch(&mut buffer, out.len() / 4);
                let report = self.fill(samples);
                for (dst, sample) in out.chunks_exact_mut(4).zip(samples.iter()) {
                    dst.copy_from_slice(&sample.to_ne_bytes());
                }
                self.scratch_f32 = buffer;
                report
            }
            SampleFormat::Unsupported(_) => self.null_mix(),
        }
    }

    /// Mix without consuming any ring data (free-running mode only).
    ///
    /// Used to inspect what the next pass would produce; the drift
    /// observation is not updated.
    pub fn peek_s16(&self, out: &mut [i16]) -> MixReport {
        out.fill(i16::SILENCE);
        if self.shared.mode() != SyncSource::Video {
            return MixReport::default();
        }
        let state = self.shared.state.lock();
        let mut report = MixReport::default();
        for slot in state.active.iter() {
            if let SlotLink::FreeRunning { ring } = &slot.link {
                let buffered = mix_ring(out, ring, slot.source.channels, false);
                report.sources_mixed += 1;
                report.min_buffered = Some(report.min_buffered.map_or(buffered, |m| m.min(buffered)));
            }
        }
        report
    }

    fn fill<S: OutputSample>(&self, out: &mut [S]) -> MixReport {
        out.fill(S::SILENCE);
        if matches!(self.format(), SampleFormat::Unsupported(_)) {
            return self.null_mix();
        }
        match self.shared.mode() {
            SyncSource::Audio => self.mix_locked(Some(out)),
            SyncSource::Video => {
                if self.shared.device_paused() {
                    return MixReport::default();
                }
                self.mix_free_running(out)
            }
        }
    }

    /// Discard everything; keeps locked-mode producers from stalling
    fn null_mix(&self) -> MixReport {
        if !self.shared.null_mix_warned.swap(true, Ordering::Relaxed) {
            log::warn!("Audio format {:?} is not supported, audio output disabled", self.format());
        }
        if self.shared.mode() == SyncSource::Audio {
            self.mix_locked::<i16>(None);
        }
        MixReport::default()
    }

    /// Wait for every active source's buffer, then sum them
    fn mix_locked<S: OutputSample>(&self, mut out: Option<&mut [S]>) -> MixReport {
        let mut delivered: SmallVec<[(SourceId, Vec<i16>); MAX_SOURCES]> = SmallVec::new();

        loop {
            if self.shared.quitting() {
                return MixReport::default();
            }
            let pending: SmallVec<[(SourceId, Receiver<Vec<i16>>); MAX_SOURCES]> = {
                let state = self.shared.state.lock();
                // buffers from sources paused or destroyed meanwhile are dropped
                delivered.retain(|(id, _)| state.active.iter().any(|slot| slot.source.id == *id));
                state
                    .active
                    .iter()
                    .filter(|slot| !delivered.iter().any(|(id, _)| *id == slot.source.id))
                    .filter_map(|slot| match &slot.link {
                        SlotLink::Locked { ready_rx, .. } => Some((slot.source.id, ready_rx.clone())),
                        SlotLink::FreeRunning { .. } => None,
                    })
                    .collect()
            };
            if pending.is_empty() {
                break;
            }

            let mut select = Select::new();
            for (_, ready_rx) in &pending {
                select.recv(ready_rx);
            }
            let wake = select.recv(&self.shared.wake_rx);
            let op = select.select();
            let index = op.index();
            if index == wake {
                let _ = op.recv(&self.shared.wake_rx);
                continue;
            }
            let (id, ready_rx) = &pending[index];
            // a disconnected producer contributes nothing
            let buffer = op.recv(ready_rx).unwrap_or_default();
            delivered.push((*id, buffer));
        }

        let state = self.shared.state.lock();
        let mut report = MixReport::default();
        for (id, buffer) in delivered {
            let Some(slot) = state.active.iter().find(|slot| slot.source.id == id) else {
                continue;
            };
            if let Some(out) = out.as_deref_mut() {
                accumulate_frames(out, &buffer, slot.source.channels);
                report.sources_mixed += 1;
            }
            if let SlotLink::Locked { recycle_tx, .. } = &slot.link {
                let _ = recycle_tx.try_send(buffer);
            }
        }
        report
    }

    fn mix_free_running<S: OutputSample>(&self, out: &mut [S]) -> MixReport {
        let mut state = self.shared.state.lock();
        if state.observation.cur_min_buffered < 0 {
            // underflow last pass; the presenter has not paused the device yet
            return MixReport::default();
        }

        let mut cur_min = i32::MAX;
        let mut min_remaining = u32::MAX;
        let mut mixed = 0;
        for slot in state.active.iter() {
            let SlotLink::FreeRunning { ring } = &slot.link else {
                continue;
            };
            let channels = slot.source.channels;
            let buffered = mix_ring(out, ring, channels, true);
            let capacity = (ring.capacity() as u32 / channels.count()) as i64;
            let remaining = (capacity - buffered as i64).clamp(0, u32::MAX as i64) as u32;
            cur_min = cur_min.min(buffered);
            min_remaining = min_remaining.min(remaining);
            mixed += 1;
        }

        if mixed == 0 {
            return MixReport::default();
        }
        let passes = state.observation.mix_passes + 1;
        state.observation = BufferObservation {
            cur_min_buffered: cur_min,
            min_remaining,
            mix_passes: passes,
        };
        MixReport {
            sources_mixed: mixed,
            min_buffered: Some(cur_min),
        }
    }
}

impl std::fmt::Debug for Mixer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mixer")
            .field("mode", &self.shared.mode())
            .field("spec", self.shared.spec())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AudioSpec, SyncConfig};
    use crate::AudioContext;
    use approx::assert_relative_eq;
    use std::thread;

    fn context(config: SyncConfig) -> AudioContext {
        AudioContext::new(&config, AudioSpec::requested(&config), 60).unwrap()
    }

    fn small_locked() -> AudioContext {
        let config = SyncConfig {
            buffer_samples: 64,
            ..SyncConfig::audio_locked()
        };
        context(config)
    }

    #[test]
    fn test_accumulate_mono_duplicates() {
        let mut out = [0i16; 6];
        accumulate_frames(&mut out, &[1, 2, 3], Channels::Mono);
        assert_eq!(out, [1, 1, 2, 2, 3, 3]);
    }

    #[test]
    fn test_f32_scaling() {
        let mut out = [0.0f32; 2];
        accumulate_frames(&mut out, &[i16::MAX, -16_384], Channels::Stereo);
        assert_relative_eq!(out[0], 1.0);
        assert_relative_eq!(out[1], -0.5, epsilon = 1e-4);
    }

    #[test]
    fn test_additive_mix_wraps_without_clipping() {
        // known limitation: loud sources overflow 16-bit output
        let mut out = [0i16; 2];
        accumulate_frames(&mut out, &[30_000, 30_000], Channels::Stereo);
        accumulate_frames(&mut out, &[10_000, 10_000], Channels::Stereo);
        assert_eq!(out[0], 30_000i16.wrapping_add(10_000));
        assert!(out[0] < 0);
    }

    #[test]
    fn test_mix_ring_reports_remaining_and_shortfall() {
        let ring = SampleRing::new(64).unwrap();
        let pos = (0..20).fold(0, |p, i| ring.push(p, i as i16));
        ring.publish(pos);

        // 10 stereo frames published, 4 requested
        let mut out = [0i16; 8];
        assert_eq!(mix_ring(&mut out, &ring, Channels::Stereo, true), 6);
        assert_eq!(out, [0, 1, 2, 3, 4, 5, 6, 7]);

        // 6 left, 8 requested
        let mut out = [0i16; 16];
        assert_eq!(mix_ring(&mut out, &ring, Channels::Stereo, true), -2);
        assert_eq!(&out[12..], &[0, 0, 0, 0]);
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let ring = SampleRing::new(16).unwrap();
        let pos = (0..6).fold(0, |p, i| ring.push(p, i as i16 + 1));
        ring.publish(pos);
        let mut out = [0i16; 4];
        assert_eq!(mix_ring(&mut out, &ring, Channels::Mono, false), 4);
        assert_eq!(ring.available(), 6);
    }

    #[test]
    fn test_paused_device_outputs_silence() {
        let ctx = context(SyncConfig::free_running());
        let _src = ctx.create_source(48_000, 1, Channels::Stereo).unwrap();
        assert!(ctx.is_device_paused());
        let mut out = [1234i16; 32];
        let report = ctx.mixer().fill_s16(&mut out);
        assert_eq!(report, MixReport::default());
        assert!(out.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_free_running_records_observation() {
        let ctx = context(SyncConfig::free_running());
        let mut src = ctx.create_source(48_000, 1, Channels::Stereo).unwrap();
        let target = ctx.min_buffered() as usize + ctx.sync_samples() as usize + 1;
        for i in 0..target {
            src.put_stereo_sample(i as i16, -(i as i16));
        }
        assert!(!ctx.is_device_paused(), "device starts once min_buffered is reached");

        let mut out = vec![0i16; 2 * 256];
        let report = ctx.mixer().fill_s16(&mut out);
        assert_eq!(report.sources_mixed, 1);
        let left = report.min_buffered.unwrap();
        assert!(left > 0 && !report.underrun());

        let observation = ctx.observation();
        assert_eq!(observation.cur_min_buffered, left);
        assert_eq!(observation.mix_passes, 1);
    }

    #[test]
    fn test_unsupported_format_is_null_mix() {
        let config = SyncConfig::free_running();
        let spec = AudioSpec::requested(&config).with_format(SampleFormat::Unsupported("u8".into()));
        let ctx = AudioContext::new(&config, spec, 60).unwrap();
        let mut mixer = ctx.mixer();
        let mut out = [7u8; 64];
        assert_eq!(mixer.fill_bytes(&mut out), MixReport::default());
        assert!(out.iter().all(|&b| b == 0));
        let mut out = [7i16; 8];
        assert_eq!(mixer.fill_s16(&mut out), MixReport::default());
        assert!(out.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_fill_bytes_s16_layout() {
        let ctx = small_locked();
        let mut src = ctx.create_source(48_000, 1, Channels::Mono).unwrap();
        for _ in 0..=64 {
            src.put_mono_sample(0x0102);
        }
        let mut out = vec![0u8; 64 * 4];
        let report = ctx.mixer().fill_bytes(&mut out);
        assert_eq!(report.sources_mixed, 1);
        // the last frames carry the settled filter output
        let tail = i16::from_ne_bytes([out[out.len() - 2], out[out.len() - 1]]);
        assert!(tail > 0);
    }

    #[test]
    fn test_fill_bytes_reuses_scratch() {
        let ctx = context(SyncConfig::free_running());
        let mut mixer = ctx.mixer();
        let mut out = vec![0u8; 256 * 4];
        mixer.fill_bytes(&mut out);
        let first = mixer.scratch_s16.as_ptr();
        mixer.fill_bytes(&mut out);
        assert_eq!(mixer.scratch_s16.as_ptr(), first);

        // smaller callbacks borrow a prefix
        mixer.fill_bytes(&mut out[..64]);
        assert_eq!(mixer.scratch_s16.len(), 512);
        assert_eq!(mixer.scratch_s16.as_ptr(), first);
    }

    #[test]
    fn test_peek_s16_leaves_state_untouched() {
        let ctx = context(SyncConfig::free_running());
        let mut src = ctx.create_source(48_000, 1, Channels::Mono).unwrap();
        let target = ctx.min_buffered() as usize + ctx.sync_samples() as usize + 1;
        for _ in 0..target {
            src.put_mono_sample(2000);
        }
        let mixer = ctx.mixer();
        let read_start = {
            let state = ctx.shared_state();
            match &state.active[0].link {
                SlotLink::FreeRunning { ring } => ring.read_start(),
                SlotLink::Locked { .. } => unreachable!(),
            }
        };

        let mut first = vec![0i16; 2 * 128];
        let mut second = vec![0i16; 2 * 128];
        let a = mixer.peek_s16(&mut first);
        let b = mixer.peek_s16(&mut second);
        assert_eq!(a, b);
        assert_eq!(first, second);
        assert_eq!(a.sources_mixed, 1);
        assert!(a.min_buffered.unwrap() > 0);

        let state = ctx.shared_state();
        match &state.active[0].link {
            SlotLink::FreeRunning { ring } => assert_eq!(ring.read_start(), read_start),
            SlotLink::Locked { .. } => unreachable!(),
        }
        assert_eq!(state.observation.mix_passes, 0);
    }

    #[test]
    fn test_peek_s16_is_silent_when_locked() {
        let ctx = small_locked();
        let _src = ctx.create_source(48_000, 1, Channels::Stereo).unwrap();
        let mut out = [9i16; 16];
        assert_eq!(ctx.mixer().peek_s16(&mut out), MixReport::default());
        assert!(out.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_locked_mix_waits_for_every_source() {
        let ctx = small_locked();
        let mut a = ctx.create_source(48_000, 1, Channels::Stereo).unwrap();
        let mut b = ctx.create_source(48_000, 1, Channels::Mono).unwrap();
        let mixer = ctx.mixer();

        let callback = thread::spawn(move || {
            let mut out = vec![0i16; 128];
            let report = mixer.fill_s16(&mut out);
            (report, out)
        });
        // the first input only primes the interpolator
        for _ in 0..=64 {
            a.put_stereo_sample(100, 200);
        }
        for _ in 0..=64 {
            b.put_mono_sample(1000);
        }
        let (report, out) = callback.join().unwrap();
        assert_eq!(report.sources_mixed, 2);
        assert!(out.iter().all(|&s| s != 0));
        assert_eq!(a.stats().handoffs, 1);
        assert_eq!(b.stats().handoffs, 1);
    }

    #[test]
    fn test_locked_mix_returns_on_shutdown() {
        let ctx = small_locked();
        let _src = ctx.create_source(48_000, 1, Channels::Stereo).unwrap();
        let mixer = ctx.mixer();
        let callback = thread::spawn(move || {
            let mut out = vec![5i16; 128];
            (mixer.fill_s16(&mut out), out)
        });
        thread::sleep(std::time::Duration::from_millis(20));
        ctx.shutdown();
        let (report, out) = callback.join().unwrap();
        assert_eq!(report.sources_mixed, 0);
        assert!(out.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_locked_mix_skips_paused_source() {
        let ctx = small_locked();
        let mut a = ctx.create_source(48_000, 1, Channels::Stereo).unwrap();
        let b = ctx.create_source(48_000, 1, Channels::Stereo).unwrap();
        ctx.pause_source(&b);
        for _ in 0..=64 {
            a.put_stereo_sample(300, 300);
        }
        let mut out = vec![0i16; 128];
        let report = ctx.mixer().fill_s16(&mut out);
        assert_eq!(report.sources_mixed, 1);
    }
}
