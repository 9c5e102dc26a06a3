//! Frame pacing table
//!
//! Maps one nominal second of emulated frames onto host display refreshes.
//! Each source frame slot holds a repeat count: the frame is presented
//! `1 + repeat` times, so `-1` drops it and `1` shows it twice. Over a full
//! cycle the presentations add up to exactly `display_hz`.

use crate::constants::{MAX_SOURCE_HZ, PACING_UNIT};

/// Repeat counts for one second of source frames plus the playback cursor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePacingTable {
    source_hz: u32,
    display_hz: u32,
    repeats: Vec<i32>,
    max_repeat: i32,
    source_frame: usize,
    source_frame_count: i32,
}

impl FramePacingTable {
    /// Build the table for an emulated rate and a host display rate.
    ///
    /// Rates within 2 Hz of each other are treated as identical. A display
    /// rate of 0 means "unknown" and also yields a passthrough table.
    pub fn build(source_hz: u32, display_hz: u32) -> Self {
        let source_hz = source_hz.clamp(1, MAX_SOURCE_HZ as u32);
        let display_hz = if display_hz == 0 {
            log::warn!("Display refresh rate unknown, assuming {source_hz} Hz");
            source_hz
        } else {
            display_hz
        };

        let mut repeats = vec![0i32; source_hz as usize];
        if source_hz.abs_diff(display_hz) >= 2 {
            let inc = display_hz as u64 * PACING_UNIT as u64 / source_hz as u64;
            let mut accum = 0u64;
            let mut dst_frames = 0u32;
            for slot in repeats.iter_mut() {
                *slot = -1;
                accum += inc;
                while accum > PACING_UNIT as u64 {
                    accum -= PACING_UNIT as u64;
                    *slot += 1;
                    dst_frames += 1;
                }
            }
            if let Some(last) = repeats.last_mut() {
                *last += display_hz as i32 - dst_frames as i32;
            }
        }

        let max_repeat = repeats.iter().copied().max().unwrap_or(0).max(0);
        let source_frame_count = repeats.first().copied().unwrap_or(0);
        FramePacingTable {
            source_hz,
            display_hz,
            repeats,
            max_repeat,
            source_frame: 0,
            source_frame_count,
        }
    }

    /// Emulated frames per second
    pub fn source_hz(&self) -> u32 {
        self.source_hz
    }

    /// Display refreshes per second the table targets
    pub fn display_hz(&self) -> u32 {
        self.display_hz
    }

    /// Repeat count per source frame slot
    pub fn repeats(&self) -> &[i32] {
        &self.repeats
    }

    /// True when every frame is presented exactly once
    pub fn is_passthrough(&self) -> bool {
        self.repeats.iter().all(|&r| r == 0)
    }

    /// Presentations over one full cycle of the table
    pub fn total_presentations(&self) -> i64 {
        self.repeats.iter().map(|&r| 1 + r as i64).sum()
    }

    /// Largest repeat count in the table (never negative)
    pub fn max_repeat(&self) -> i32 {
        self.max_repeat
    }

    /// Steady-state buffered frames needed to ride out the longest repeat:
    /// `ceil((max_repeat + 1) * sample_rate / source_hz)`
    pub fn min_buffered(&self, sample_rate: u32) -> u32 {
        let numerator = (self.max_repeat as u64 + 1) * sample_rate as u64;
        numerator.div_ceil(self.source_hz as u64) as u32
    }

    /// Slot the next emulated frame falls in
    pub fn source_frame(&self) -> usize {
        self.source_frame
    }

    /// Repeat count of the current slot
    pub fn current_count(&self) -> i32 {
        self.source_frame_count
    }

    /// Move to the next slot, wrapping at `source_hz`
    pub fn advance(&mut self) {
        self.source_frame += 1;
        if self.source_frame >= self.repeats.len() {
            self.source_frame = 0;
        }
        self.source_frame_count = self.repeats[self.source_frame];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_rates_are_passthrough() {
        for (source, display) in [(60, 60), (60, 59), (60, 61), (50, 51), (50, 49)] {
            let table = FramePacingTable::build(source, display);
            assert!(table.is_passthrough(), "{source} -> {display}");
            assert_eq!(table.max_repeat(), 0);
        }
    }

    #[test]
    fn test_unknown_display_is_passthrough() {
        let table = FramePacingTable::build(50, 0);
        assert!(table.is_passthrough());
        assert_eq!(table.display_hz(), 50);
    }

    #[test]
    fn test_pal_on_60hz_display() {
        let table = FramePacingTable::build(50, 60);
        assert_eq!(table.repeats().len(), 50);
        assert_eq!(table.repeats().iter().filter(|&&r| r == 1).count(), 10);
        assert_eq!(table.repeats().iter().filter(|&&r| r == 0).count(), 40);
        assert_eq!(table.total_presentations(), 60);
        assert_eq!(table.max_repeat(), 1);
    }

    #[test]
    fn test_presentations_sum_to_display_rate() {
        for source in [50u32, 60] {
            for display in (1..=240u32).filter(|d| source.abs_diff(*d) >= 2) {
                let table = FramePacingTable::build(source, display);
                assert_eq!(
                    table.total_presentations(),
                    display as i64,
                    "{source} Hz on a {display} Hz display"
                );
            }
        }
    }

    #[test]
    fn test_slow_display_drops_frames() {
        let table = FramePacingTable::build(60, 50);
        assert!(table.repeats().iter().any(|&r| r == -1));
        assert_eq!(table.total_presentations(), 50);
        assert_eq!(table.max_repeat(), 0);
    }

    #[test]
    fn test_min_buffered_rounds_up() {
        let table = FramePacingTable::build(60, 60);
        assert_eq!(table.min_buffered(48_000), 800);
        assert_eq!(table.min_buffered(44_100), 735);
        let table = FramePacingTable::build(50, 60);
        assert_eq!(table.min_buffered(48_000), 1920);
        let table = FramePacingTable::build(60, 144);
        assert_eq!(table.max_repeat(), 2);
        assert_eq!(table.min_buffered(44_100), 2205);
        assert_eq!(FramePacingTable::build(60, 60).min_buffered(22_049), 368);
    }

    #[test]
    fn test_cursor_wraps() {
        let mut table = FramePacingTable::build(50, 60);
        let mut seen = Vec::new();
        for _ in 0..100 {
            seen.push(table.current_count());
            table.advance();
        }
        assert_eq!(table.source_frame(), 0);
        assert_eq!(&seen[..50], &seen[50..]);
        assert_eq!(&seen[..50], table.repeats());
    }
}
