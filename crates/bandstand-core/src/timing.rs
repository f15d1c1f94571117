//! Timing primitives for transport and position tracking.
//!
//! This module provides the fundamental timing types of the playback core:
//!
//! - [`Position`] - Musical position as a (bar, beat) pair
//! - [`TickRange`] - Half-open tick interval of a playback session
//! - [`beat_index_at_tick`] - Device-tick to beat-index conversion
//!
//! The sequencer device always runs at [`SEQUENCER_REF_TEMPO`]; actual tempo
//! is synthesized by multiplying independent tempo factors on top of it.

/// Device ticks per quarter-note beat.
pub const PPQ_RESOLUTION: i64 = 480;

/// The fixed reference tempo (BPM) the sequencer device runs at.
///
/// Effective tempo is `SEQUENCER_REF_TEMPO * song_factor * song_part_factor`.
pub const SEQUENCER_REF_TEMPO: f32 = 120.0;

/// A musical position: bar index plus beat offset within the bar.
///
/// Comparison and equality are by the (bar, beat) tuple. Beat 0.0 of a bar is
/// the sentinel used to detect bar and song-part boundaries.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Position {
    /// Bar index, starting at 0.
    pub bar: u32,
    /// Beat offset within the bar, starting at 0.0.
    pub beat: f32,
}

impl Position {
    /// Create a new position.
    pub fn new(bar: u32, beat: f32) -> Self {
        Self { bar, beat }
    }

    /// True if this position is exactly the first beat of its bar.
    pub fn is_first_bar_beat(&self) -> bool {
        self.beat == 0.0
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}]", self.bar, self.beat)
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        match self.bar.cmp(&other.bar) {
            std::cmp::Ordering::Equal => self.beat.partial_cmp(&other.beat),
            ord => Some(ord),
        }
    }
}

/// Half-open tick interval `[start, end)` of a playback session.
///
/// `start` may be negative when the session carries a pre-roll (count-in)
/// before the musical range proper.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TickRange {
    pub start: i64,
    pub end: i64,
}

impl TickRange {
    /// Create a new tick range. `end` is clamped to at least `start`.
    pub fn new(start: i64, end: i64) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    /// Length of the range in ticks.
    pub fn len(&self) -> i64 {
        self.end - self.start
    }

    /// True if the range contains no ticks.
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// True if `tick` falls within `[start, end)`.
    pub fn contains(&self, tick: i64) -> bool {
        tick >= self.start && tick < self.end
    }
}

/// Convert a raw tick (relative to the session tick start) to a beat index.
///
/// A tick within half a resolution unit of the next beat boundary rounds up
/// to that beat; ties at exactly half round up as well. Negative ticks (inside
/// a pre-roll) resolve to beat index 0.
pub fn beat_index_at_tick(relative_tick: i64) -> usize {
    if relative_tick <= 0 {
        return 0;
    }
    let index = relative_tick / PPQ_RESOLUTION;
    let remainder = relative_tick % PPQ_RESOLUTION;
    let index = if remainder * 2 >= PPQ_RESOLUTION {
        index + 1
    } else {
        index
    };
    index as usize
}

/// Number of bars covered by a half-open bar interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BarRange {
    pub from: u32,
    pub to: u32,
}

impl BarRange {
    /// Create a new bar range `[from, to)`. `to` is clamped to at least `from`.
    pub fn new(from: u32, to: u32) -> Self {
        Self {
            from,
            to: to.max(from),
        }
    }

    /// True if the range contains no bars.
    pub fn is_empty(&self) -> bool {
        self.to <= self.from
    }

    /// True if `bar` falls within `[from, to)`.
    pub fn contains(&self, bar: u32) -> bool {
        bar >= self.from && bar < self.to
    }

    /// Number of bars in the range.
    pub fn len(&self) -> u32 {
        self.to - self.from
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_ordering() {
        assert!(Position::new(2, 0.0) > Position::new(1, 3.5));
        assert!(Position::new(1, 2.0) > Position::new(1, 1.5));
        assert_eq!(Position::new(3, 1.0), Position::new(3, 1.0));
    }

    #[test]
    fn test_first_bar_beat() {
        assert!(Position::new(5, 0.0).is_first_bar_beat());
        assert!(!Position::new(5, 0.5).is_first_bar_beat());
    }

    #[test]
    fn test_tick_range() {
        let range = TickRange::new(-PPQ_RESOLUTION, 4 * PPQ_RESOLUTION);
        assert!(range.contains(-1));
        assert!(range.contains(0));
        assert!(!range.contains(4 * PPQ_RESOLUTION));
        assert_eq!(range.len(), 5 * PPQ_RESOLUTION);
        assert!(TickRange::new(10, 10).is_empty());
    }

    #[test]
    fn test_beat_index_rounding() {
        // Exactly on a boundary
        assert_eq!(beat_index_at_tick(0), 0);
        assert_eq!(beat_index_at_tick(PPQ_RESOLUTION), 1);
        assert_eq!(beat_index_at_tick(3 * PPQ_RESOLUTION), 3);

        // Just below half stays on the current beat
        assert_eq!(beat_index_at_tick(PPQ_RESOLUTION / 2 - 1), 0);

        // Ties at exactly half round up (inclusive upper half)
        assert_eq!(beat_index_at_tick(PPQ_RESOLUTION / 2), 1);
        assert_eq!(beat_index_at_tick(PPQ_RESOLUTION + PPQ_RESOLUTION / 2), 2);

        // Above half rounds up
        assert_eq!(beat_index_at_tick(PPQ_RESOLUTION / 2 + 1), 1);
    }

    #[test]
    fn test_beat_index_negative_tick() {
        // Pre-roll ticks resolve to the first beat
        assert_eq!(beat_index_at_tick(-PPQ_RESOLUTION), 0);
        assert_eq!(beat_index_at_tick(-1), 0);
    }

    #[test]
    fn test_bar_range() {
        let range = BarRange::new(2, 10);
        assert!(range.contains(2));
        assert!(range.contains(9));
        assert!(!range.contains(10));
        assert_eq!(range.len(), 8);
        assert!(BarRange::new(4, 4).is_empty());
    }
}
