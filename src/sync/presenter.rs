//! Frame presenter
//!
//! Called on every video-frame-complete event. In audio-locked mode the
//! frame is presented once and audio throttles everything. In free-running
//! mode the pacing table decides how often the frame is shown, after which
//! the drift controller gets one look at the latest buffer occupancy.

use super::drift::{DriftController, DriftDecision, DriftStats};
use super::frame_pacing::FramePacingTable;
use crate::config::SyncSource;
use crate::context::Shared;

/// The external "present frame" operation
pub trait FrameSink {
    /// Show the current framebuffer once
    fn present_frame(&mut self);
}

impl<F: FnMut()> FrameSink for F {
    fn present_frame(&mut self) {
        self()
    }
}

/// Which part of the video signal a completed buffer holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldParity {
    /// Non-interlaced frame
    #[default]
    Progressive,
    /// Odd field of an interlaced frame
    Odd,
    /// Even field of an interlaced frame
    Even,
    /// Frontend overlay (menus); presented once, never paced
    Overlay,
}

/// Description of a just-rendered frame; pixel data never passes through here
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Active width in pixels
    pub width: u32,
    /// Field the buffer holds
    pub field: FieldParity,
}

impl FrameInfo {
    /// Non-interlaced frame of the given width
    pub fn progressive(width: u32) -> Self {
        FrameInfo {
            width,
            field: FieldParity::Progressive,
        }
    }

    /// Interlaced field or overlay
    pub fn field(width: u32, field: FieldParity) -> Self {
        FrameInfo { width, field }
    }
}

/// Result of one frame-complete event
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PresentOutcome {
    /// Times the sink was invoked
    pub presentations: u32,
    /// Drift decision taken this frame, if the controller ran
    pub correction: Option<DriftDecision>,
}

/// Pacing table, drift controller and presentation bookkeeping
#[derive(Debug)]
pub struct FramePresenter {
    mode: SyncSource,
    table: FramePacingTable,
    drift: DriftController,
    last_mix_pass: u64,
    last_width: Option<u32>,
    frames: u64,
}

impl FramePresenter {
    /// Presenter for a sync mode, starting at slot 0 of a fresh table
    pub fn new(mode: SyncSource, sample_rate: u32, source_hz: u32, display_hz: u32) -> Self {
        let table = FramePacingTable::build(source_hz, display_hz);
        let drift = DriftController::new(sample_rate, table.source_hz());
        FramePresenter {
            mode,
            table,
            drift,
            last_mix_pass: 0,
            last_width: None,
            frames: 0,
        }
    }

    /// Rebuild the pacing table, retune the drift envelope and forget the
    /// occupancy trend measured under the old rates
    pub fn rebuild(&mut self, source_hz: u32, display_hz: u32) -> &FramePacingTable {
        self.table = FramePacingTable::build(source_hz, display_hz);
        self.drift.set_source_hz(self.table.source_hz());
        self.drift.reset();
        &self.table
    }

    /// Current pacing table
    pub fn table(&self) -> &FramePacingTable {
        &self.table
    }

    /// Drift controller snapshot
    pub fn drift_stats(&self) -> DriftStats {
        self.drift.stats()
    }

    /// Frame-complete events handled so far
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub(crate) fn frame_complete<S: FrameSink + ?Sized>(
        &mut self,
        shared: &Shared,
        frame: FrameInfo,
        sink: &mut S,
    ) -> PresentOutcome {
        self.frames += 1;
        if self.last_width != Some(frame.width) {
            log::debug!("frame width changed to {}", frame.width);
            self.last_width = Some(frame.width);
        }

        if self.mode == SyncSource::Audio || frame.field == FieldParity::Overlay {
            sink.present_frame();
            return PresentOutcome {
                presentations: 1,
                correction: None,
            };
        }

        let count = self.table.current_count();
        let mut presentations = 0;
        if count >= 0 {
            for _ in 0..=count {
                sink.present_frame();
                presentations += 1;
            }
        }
        self.table.advance();

        PresentOutcome {
            presentations,
            correction: self.run_drift_control(shared),
        }
    }

    /// Apply the drift controller to the mixer's latest observation, once
    /// per mix pass
    fn run_drift_control(&mut self, shared: &Shared) -> Option<DriftDecision> {
        let mut state = shared.state.lock();
        let observation = state.observation;
        if observation.mix_passes == self.last_mix_pass {
            return None;
        }
        self.last_mix_pass = observation.mix_passes;

        let decision = self.drift.update(
            observation.cur_min_buffered,
            observation.min_remaining,
            shared.min_buffered(),
        );
        if decision.pause_device {
            state.observation.cur_min_buffered = 0;
        }
        if decision.is_correction() {
            for slot in state.active.iter() {
                slot.source.scale_increment(decision.adjust_ratio);
            }
        }
        drop(state);

        if decision.pause_device {
            shared.set_device_paused(true);
        }
        Some(decision)
    }
}
