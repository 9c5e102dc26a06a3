//! Ring buffer for resampled source output
//!
//! A single-producer/single-consumer circular buffer of interleaved i16 samples:
//! - Producer (emulation thread): writes slots at its private write cursor and
//!   publishes the cursor as `read_end` at each handoff
//! - Consumer (audio callback): reads from `read_start` up to `read_end`
//!
//! Capacity is always a power of two and every cursor is kept masked, so
//! `(end - start) & mask` is the number of valid samples between two cursors.

use crate::{AvSyncError, Result};
use std::sync::atomic::{AtomicI16, AtomicU32, Ordering};

/// Largest ring we agree to allocate (256 MB worth of i16 samples)
const MAX_CAPACITY: usize = 256 * 1024 * 1024 / std::mem::size_of::<i16>();

/// Lock-free sample ring
///
/// # Thread Safety
/// - `push`/`publish` are called only by the producer
/// - `advance_read` is called only by the consumer
/// - Slot stores are relaxed; `publish` releases them to the consumer's
///   acquire load of `read_end`
#[derive(Debug)]
pub struct SampleRing {
    slots: Box<[AtomicI16]>,
    /// Capacity mask for fast modulo: `pos & mask == pos % capacity`
    mask: u32,
    /// First unread sample (consumer)
    read_start: AtomicU32,
    /// One past the last published sample (producer)
    read_end: AtomicU32,
}

impl SampleRing {
    /// Create a new ring buffer
    /// Capacity will be rounded up to the next power of 2
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Requested capacity is 0
    /// - Requested capacity would exceed maximum safe allocation
    pub fn new(requested_capacity: usize) -> Result<Self> {
        if requested_capacity == 0 {
            return Err(AvSyncError::InvalidBuffer(
                "Ring buffer capacity must be greater than 0".into(),
            ));
        }

        let capacity = requested_capacity.next_power_of_two();
        if capacity > MAX_CAPACITY {
            return Err(AvSyncError::InvalidBuffer(format!(
                "Ring buffer capacity {capacity} exceeds maximum safe size {MAX_CAPACITY}"
            )));
        }

        let slots = (0..capacity).map(|_| AtomicI16::new(0)).collect();
        Ok(SampleRing {
            slots,
            mask: (capacity - 1) as u32,
            read_start: AtomicU32::new(0),
            read_end: AtomicU32::new(0),
        })
    }

    /// Number of sample slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Cursor mask (`capacity - 1`)
    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// Store `value` at `pos` and return the next masked write position
    #[inline]
    pub fn push(&self, pos: u32, value: i16) -> u32 {
        self.slots[(pos & self.mask) as usize].store(value, Ordering::Relaxed);
        pos.wrapping_add(1) & self.mask
    }

    /// Read the sample stored at `pos` without consuming it
    #[inline]
    pub fn peek(&self, pos: u32) -> i16 {
        self.slots[(pos & self.mask) as usize].load(Ordering::Relaxed)
    }

    /// Make everything before `write_pos` visible to the consumer
    pub fn publish(&self, write_pos: u32) {
        self.read_end.store(write_pos & self.mask, Ordering::Release);
    }

    /// Mark everything before `pos` as consumed
    pub fn advance_read(&self, pos: u32) {
        self.read_start.store(pos & self.mask, Ordering::Release);
    }

    /// Consumer cursor
    pub fn read_start(&self) -> u32 {
        self.read_start.load(Ordering::Acquire)
    }

    /// Producer's last published cursor
    pub fn read_end(&self) -> u32 {
        self.read_end.load(Ordering::Acquire)
    }

    /// Masked distance from `from` to `to`
    #[inline]
    pub fn distance(&self, from: u32, to: u32) -> u32 {
        to.wrapping_sub(from) & self.mask
    }

    /// Samples published but not yet consumed
    pub fn available(&self) -> u32 {
        self.distance(self.read_start(), self.read_end())
    }
}
