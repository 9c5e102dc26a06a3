//! Sample transport between the emulation thread and the host device
//!
//! The ring buffer is always available; the rodio-backed output device is
//! compiled with the `streaming` feature.

#[cfg(feature = "streaming")]
pub mod audio_device;
pub mod ring_buffer;

#[cfg(feature = "streaming")]
pub use audio_device::AudioDevice;
pub use ring_buffer::SampleRing;
