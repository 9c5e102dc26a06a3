//! Synchronization context
//!
//! [`AudioContext`] is created when the audio subsystem starts and dropped at
//! teardown. It owns the configuration snapshot, the registry of active and
//! paused sources, and the frame presenter with its pacing table and drift
//! controller. The parts the audio callback needs live in a shared block
//! that the [`Mixer`] handle and every [`AudioSource`] reference.

use crate::config::{AudioSpec, SyncConfig, SyncSource, VideoStandard};
use crate::constants::{MAX_SOURCES, SYNC_LINES};
use crate::mixer::{BufferObservation, Mixer};
use crate::source::{
    lowpass_alpha, resample_increment, AudioSource, Channels, SlotLink, SourceId, SourceShared,
    SourceSlot,
};
use crate::streaming::SampleRing;
use crate::sync::{DriftStats, FrameInfo, FramePacingTable, FramePresenter, FrameSink, PresentOutcome};
use crate::{AvSyncError, Result};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Bounded set of registered sources
pub(crate) type SourceSet = SmallVec<[SourceSlot; MAX_SOURCES]>;

/// Everything guarded by the mixing lock
#[derive(Debug, Default)]
pub(crate) struct MixState {
    pub(crate) active: SourceSet,
    pub(crate) inactive: SourceSet,
    pub(crate) observation: BufferObservation,
}

/// State shared between the emulation thread and the audio callback
#[derive(Debug)]
pub(crate) struct Shared {
    mode: SyncSource,
    spec: AudioSpec,
    pub(crate) state: Mutex<MixState>,
    /// Host device gate; the device starts paused
    paused: AtomicBool,
    quitting: AtomicBool,
    min_buffered: AtomicU32,
    sync_samples: AtomicU32,
    wake_tx: Sender<()>,
    pub(crate) wake_rx: Receiver<()>,
    next_id: AtomicU64,
    pub(crate) null_mix_warned: AtomicBool,
}

/// Ring length, in samples, for a source at the given occupancy target
fn ring_size(min_buffered: u32, channels: Channels) -> usize {
    4 * min_buffered as usize * channels.count() as usize
}

fn take_slot(set: &mut SourceSet, id: SourceId) -> Option<SourceSlot> {
    let index = set.iter().position(|slot| slot.source.id == id)?;
    Some(set.swap_remove(index))
}

impl Shared {
    pub(crate) fn mode(&self) -> SyncSource {
        self.mode
    }

    pub(crate) fn spec(&self) -> &AudioSpec {
        &self.spec
    }

    pub(crate) fn sample_rate(&self) -> u32 {
        self.spec.sample_rate
    }

    pub(crate) fn sync_samples(&self) -> u32 {
        self.sync_samples.load(Ordering::Relaxed)
    }

    pub(crate) fn min_buffered(&self) -> u32 {
        self.min_buffered.load(Ordering::Relaxed)
    }

    pub(crate) fn device_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub(crate) fn set_device_paused(&self, paused: bool) {
        if self.paused.swap(paused, Ordering::AcqRel) != paused {
            log::debug!("audio device {}", if paused { "paused" } else { "resumed" });
        }
    }

    pub(crate) fn quitting(&self) -> bool {
        self.quitting.load(Ordering::Acquire)
    }

    /// Nudge a mixer blocked in the audio-locked handoff to re-check the active set
    pub(crate) fn wake_mixer(&self) {
        // capacity 1: a pending wake already covers this one
        let _ = self.wake_tx.try_send(());
    }

    /// Current ring of a registered free-running source
    pub(crate) fn ring_of(&self, id: SourceId) -> Option<Arc<SampleRing>> {
        let state = self.state.lock();
        state
            .active
            .iter()
            .chain(state.inactive.iter())
            .find(|slot| slot.source.id == id)
            .and_then(|slot| match &slot.link {
                SlotLink::FreeRunning { ring } => Some(Arc::clone(ring)),
                SlotLink::Locked { .. } => None,
            })
    }

    /// Remove a source from whichever set holds it, pausing the device if
    /// nothing is left to mix.
    pub(crate) fn unregister(&self, id: SourceId) {
        let (slot, was_active, now_empty) = {
            let mut state = self.state.lock();
            let active = take_slot(&mut state.active, id);
            let was_active = active.is_some();
            let slot = active.or_else(|| take_slot(&mut state.inactive, id));
            (slot, was_active, state.active.is_empty())
        };
        if was_active {
            self.wake_mixer();
            if now_empty {
                self.set_device_paused(true);
            }
        }
        // the handoff receiver closes here, outside the lock
        drop(slot);
    }
}

/// Explicit context for one audio subsystem lifetime
pub struct AudioContext {
    shared: Arc<Shared>,
    config: SyncConfig,
    video_standard: VideoStandard,
    display_hz: u32,
    presenter: FramePresenter,
}

impl AudioContext {
    /// Create the context from the configuration and the audio spec the host
    /// device actually granted.
    ///
    /// `display_hz` is the host display refresh rate; 0 means unknown.
    pub fn new(config: &SyncConfig, spec: AudioSpec, display_hz: u32) -> Result<Self> {
        config.validate()?;
        if spec.sample_rate == 0 || spec.buffer_samples == 0 {
            return Err(AvSyncError::AudioDeviceError(format!(
                "device granted {} Hz with a {} sample buffer",
                spec.sample_rate, spec.buffer_samples
            )));
        }
        log::info!(
            "Initialized audio at frequency {} with a {} sample buffer, {:?} format",
            spec.sample_rate,
            spec.buffer_samples,
            spec.format
        );

        let (wake_tx, wake_rx) = channel::bounded(1);
        let shared = Arc::new(Shared {
            mode: config.sync_source,
            spec,
            state: Mutex::new(MixState::default()),
            paused: AtomicBool::new(true),
            quitting: AtomicBool::new(false),
            min_buffered: AtomicU32::new(0),
            sync_samples: AtomicU32::new(1),
            wake_tx,
            wake_rx,
            next_id: AtomicU64::new(0),
            null_mix_warned: AtomicBool::new(false),
        });

        let video_standard = VideoStandard::default();
        let presenter = FramePresenter::new(
            config.sync_source,
            shared.sample_rate(),
            video_standard.source_hz(),
            display_hz,
        );
        let mut context = AudioContext {
            shared,
            config: config.clone(),
            video_standard,
            display_hz,
            presenter,
        };
        context.retime();
        Ok(context)
    }

    /// Handle for the host audio callback
    pub fn mixer(&self) -> Mixer {
        Mixer::new(Arc::clone(&self.shared))
    }

    /// Active sync mode
    pub fn sync_source(&self) -> SyncSource {
        self.shared.mode()
    }

    /// Negotiated host sample rate
    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate()
    }

    /// Negotiated host callback buffer size, in frames
    pub fn buffer_samples(&self) -> u32 {
        self.shared.spec().buffer_samples
    }

    /// Full negotiated spec
    pub fn audio_spec(&self) -> &AudioSpec {
        self.shared.spec()
    }

    /// Current configuration snapshot
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Target steady-state buffered frames per source
    pub fn min_buffered(&self) -> u32 {
        self.shared.min_buffered()
    }

    /// Frames a source accumulates between ready signals
    pub fn sync_samples(&self) -> u32 {
        self.shared.sync_samples()
    }

    /// Emulated video standard
    pub fn video_standard(&self) -> VideoStandard {
        self.video_standard
    }

    /// Host display refresh rate the pacing table was built for
    pub fn display_hz(&self) -> u32 {
        self.display_hz
    }

    /// Current frame pacing table
    pub fn pacing_table(&self) -> &FramePacingTable {
        self.presenter.table()
    }

    /// Drift controller snapshot
    pub fn drift_stats(&self) -> DriftStats {
        self.presenter.drift_stats()
    }

    /// Whether the host device is currently gated off
    pub fn is_device_paused(&self) -> bool {
        self.shared.device_paused()
    }

    /// Number of sources being mixed
    pub fn active_sources(&self) -> usize {
        self.shared.state.lock().active.len()
    }

    /// Number of paused sources retained for resume
    pub fn inactive_sources(&self) -> usize {
        self.shared.state.lock().inactive.len()
    }

    /// Register a new source producing one sample every `sample_divider`
    /// ticks of `master_clock`.
    ///
    /// # Errors
    ///
    /// [`AvSyncError::TooManySources`] when [`MAX_SOURCES`] are already active.
    pub fn create_source(
        &self,
        master_clock: u64,
        sample_divider: u64,
        channels: Channels,
    ) -> Result<AudioSource> {
        let sample_rate = self.shared.sample_rate();
        let sample_period = sample_divider as f64 / master_clock.max(1) as f64;
        let id = SourceId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let shared = Arc::new(SourceShared {
            id,
            channels,
            sample_period,
            buffer_inc: AtomicU64::new(resample_increment(sample_rate, master_clock, sample_divider)),
            lowpass_alpha: AtomicU32::new(lowpass_alpha(self.config.lowpass_cutoff, sample_period)),
            ring_generation: AtomicU32::new(0),
        });

        let (link, source) = match self.shared.mode() {
            SyncSource::Audio => {
                let len = (channels.count() * self.buffer_samples()) as usize;
                let (ready_tx, ready_rx) = channel::bounded(1);
                let (recycle_tx, recycle_rx) = channel::bounded(2);
                let source = AudioSource::new_locked(
                    Arc::clone(&shared),
                    Arc::clone(&self.shared),
                    len,
                    ready_tx,
                    recycle_rx,
                );
                (SlotLink::Locked { ready_rx, recycle_tx }, source)
            }
            SyncSource::Video => {
                let ring = Arc::new(SampleRing::new(ring_size(self.min_buffered(), channels))?);
                let source = AudioSource::new_free_running(
                    Arc::clone(&shared),
                    Arc::clone(&self.shared),
                    Arc::clone(&ring),
                );
                (SlotLink::FreeRunning { ring }, source)
            }
        };

        {
            let mut state = self.shared.state.lock();
            if state.active.len() >= MAX_SOURCES {
                drop(state);
                // unregistering an unknown id is a no-op
                drop(source);
                return Err(AvSyncError::TooManySources { max: MAX_SOURCES });
            }
            state.active.push(SourceSlot { source: shared, link });
        }

        if self.shared.mode() == SyncSource::Audio {
            self.shared.set_device_paused(false);
        }
        Ok(source)
    }

    /// Stop mixing a source without releasing it
    pub fn pause_source(&self, source: &AudioSource) {
        let now_empty = {
            let mut state = self.shared.state.lock();
            let Some(slot) = take_slot(&mut state.active, source.id()) else {
                return;
            };
            state.inactive.push(slot);
            state.active.is_empty()
        };
        self.shared.wake_mixer();
        if now_empty {
            self.shared.set_device_paused(true);
        }
    }

    /// Put a paused source back into the mix
    ///
    /// # Errors
    ///
    /// [`AvSyncError::TooManySources`] when the active set is full; the source
    /// stays paused.
    pub fn resume_source(&self, source: &AudioSource) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.active.iter().any(|slot| slot.source.id == source.id()) {
                return Ok(());
            }
            if state.active.len() >= MAX_SOURCES {
                return Err(AvSyncError::TooManySources { max: MAX_SOURCES });
            }
            let Some(slot) = take_slot(&mut state.inactive, source.id()) else {
                return Ok(());
            };
            state.active.push(slot);
        }
        self.shared.wake_mixer();
        if self.shared.mode() == SyncSource::Audio {
            self.shared.set_device_paused(false);
        }
        Ok(())
    }

    /// Pause and release a source
    pub fn destroy_source(&self, source: AudioSource) {
        drop(source);
    }

    /// Recompute a source's resample ratio for a new clock divider
    pub fn adjust_clock(&self, source: &mut AudioSource, master_clock: u64, sample_divider: u64) {
        source.adjust_clock(master_clock, sample_divider);
    }

    /// Switch between NTSC and PAL timing
    pub fn set_video_standard(&mut self, standard: VideoStandard) {
        self.video_standard = standard;
        self.retime();
    }

    /// React to a (re)detected host display refresh rate
    pub fn set_display_refresh(&mut self, display_hz: u32) {
        self.display_hz = display_hz;
        self.retime();
    }

    /// Change the low-pass cutoff for every registered source
    pub fn set_lowpass_cutoff(&mut self, cutoff_hz: f64) {
        self.config.lowpass_cutoff = cutoff_hz;
        let state = self.shared.state.lock();
        for slot in state.active.iter().chain(state.inactive.iter()) {
            let alpha = lowpass_alpha(cutoff_hz, slot.source.sample_period);
            slot.source.lowpass_alpha.store(alpha, Ordering::Relaxed);
        }
    }

    /// Video-frame-complete event: present the frame as many times as the
    /// pacing policy asks and run drift control.
    pub fn frame_complete<S: FrameSink + ?Sized>(
        &mut self,
        frame: FrameInfo,
        sink: &mut S,
    ) -> PresentOutcome {
        self.presenter.frame_complete(&self.shared, frame, sink)
    }

    #[cfg(test)]
    pub(crate) fn observation(&self) -> BufferObservation {
        self.shared.state.lock().observation
    }

    #[cfg(test)]
    pub(crate) fn shared_state(&self) -> parking_lot::MutexGuard<'_, MixState> {
        self.shared.state.lock()
    }

    /// Stop all handoffs; blocked producers and mixers return immediately
    pub fn shutdown(&self) {
        if self.shared.quitting.swap(true, Ordering::AcqRel) {
            return;
        }
        let released: Vec<SourceSlot> = {
            let mut state = self.shared.state.lock();
            let mut slots: Vec<SourceSlot> = state.active.drain(..).collect();
            slots.extend(state.inactive.drain(..));
            slots
        };
        self.shared.wake_mixer();
        self.shared.set_device_paused(true);
        drop(released);
    }

    /// Rebuild everything derived from the source and display rates
    fn retime(&mut self) {
        let source_hz = self.video_standard.source_hz();
        let sample_rate = self.shared.sample_rate();
        let table = self.presenter.rebuild(source_hz, self.display_hz);
        let min_buffered = table.min_buffered(sample_rate);

        let sync_samples = match self.shared.mode() {
            SyncSource::Audio => self.buffer_samples(),
            SyncSource::Video => {
                let lines = self.video_standard.lines_per_frame();
                (SYNC_LINES * sample_rate / (source_hz * lines)).max(1)
            }
        };
        self.shared.min_buffered.store(min_buffered, Ordering::Relaxed);
        self.shared.sync_samples.store(sync_samples, Ordering::Relaxed);
        log::info!("Min samples buffered before audio start: {min_buffered}");

        if self.shared.mode() == SyncSource::Video {
            self.grow_rings(min_buffered);
        }
    }

    /// Replace every ring too small for the new occupancy target with an
    /// empty one; producers pick it up on their next sample.
    fn grow_rings(&self, min_buffered: u32) {
        let mut grown = 0;
        {
            let mut state = self.shared.state.lock();
            let MixState {
                active, inactive, ..
            } = &mut *state;
            for slot in active.iter_mut().chain(inactive.iter_mut()) {
                let SlotLink::FreeRunning { ring } = &mut slot.link else {
                    continue;
                };
                let wanted = ring_size(min_buffered, slot.source.channels);
                if ring.capacity() >= wanted.next_power_of_two() {
                    continue;
                }
                match SampleRing::new(wanted) {
                    Ok(fresh) => {
                        *ring = Arc::new(fresh);
                        slot.source.ring_generation.fetch_add(1, Ordering::AcqRel);
                        grown += 1;
                    }
                    Err(e) => log::warn!("keeping {} sample ring: {e}", ring.capacity()),
                }
            }
            if grown > 0 {
                state.observation.cur_min_buffered = 0;
            }
        }
        if grown > 0 {
            log::debug!("reallocated {grown} source rings");
            // the new rings start empty; refill before playing again
            self.shared.set_device_paused(true);
        }
    }
}

impl Drop for AudioContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for AudioContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioContext")
            .field("sync_source", &self.shared.mode())
            .field("spec", self.shared.spec())
            .field("video_standard", &self.video_standard)
            .field("display_hz", &self.display_hz)
            .finish_non_exhaustive()
    }
}
