//! Audio/video synchronization
//!
//! - [`FramePacingTable`]: repeat/drop policy mapping emulated frames onto
//!   the host display refresh
//! - [`DriftController`]: resample ratio corrections in free-running mode
//! - [`FramePresenter`]: per-frame entry point tying both together

pub mod drift;
pub mod frame_pacing;
pub mod presenter;

pub use drift::{DriftController, DriftDecision, DriftStats};
pub use frame_pacing::FramePacingTable;
pub use presenter::{FieldParity, FrameInfo, FramePresenter, FrameSink, PresentOutcome};
