//! Musical-model snapshot consumed by the playback core.
//!
//! The playback core does not own the song data model. It consumes an
//! immutable [`SongContext`] snapshot built by the surrounding application:
//!
//! - [`SongContext`] - Bar range, chords, song parts and voices of one arrangement
//! - [`ChordSymbol`] / [`SongPart`] / [`VoiceSpec`] - Domain payloads forwarded to listeners
//! - [`PositionMap`] - Tick to bar/beat mapping collaborator
//! - [`LinearPositionMap`] - Mapping for a constant time signature

use crate::timing::{BarRange, Position, PPQ_RESOLUTION};
use std::sync::Arc;

/// Identifier of a logical musical part ("bass", "drums", ...).
pub type VoiceId = String;

/// A chord symbol placed at a musical position.
#[derive(Clone, Debug, PartialEq)]
pub struct ChordSymbol {
    /// Chord name as written on the lead sheet, e.g. "C#7".
    pub name: String,
    /// Where the chord sits in the arrangement.
    pub position: Position,
}

impl ChordSymbol {
    pub fn new(name: impl Into<String>, position: Position) -> Self {
        Self {
            name: name.into(),
            position,
        }
    }
}

/// A section of the song structure with its own rhythm and tempo feel.
#[derive(Clone, Debug, PartialEq)]
pub struct SongPart {
    /// Display name, e.g. "A", "Bridge".
    pub name: String,
    /// First bar of the part.
    pub start_bar: u32,
    /// Number of bars in the part.
    pub bar_count: u32,
    /// Tempo factor of this part relative to the song tempo.
    pub tempo_factor: f32,
}

impl SongPart {
    pub fn new(name: impl Into<String>, start_bar: u32, bar_count: u32) -> Self {
        Self {
            name: name.into(),
            start_bar,
            bar_count,
            tempo_factor: 1.0,
        }
    }

    /// True if `bar` falls inside this part.
    pub fn contains_bar(&self, bar: u32) -> bool {
        bar >= self.start_bar && bar < self.start_bar + self.bar_count
    }
}

/// A logical voice and the device channel it plays on.
#[derive(Clone, Debug, PartialEq)]
pub struct VoiceSpec {
    pub id: VoiceId,
    /// MIDI channel (0-15).
    pub channel: u8,
    /// Initial mute flag from the mix model.
    pub muted: bool,
}

impl VoiceSpec {
    pub fn new(id: impl Into<VoiceId>, channel: u8) -> Self {
        Self {
            id: id.into(),
            channel,
            muted: false,
        }
    }
}

/// Tick to bar/beat mapping for one arrangement.
///
/// Ticks are relative to the start of the musical range (tick 0 = first beat
/// of the first bar of the range); a pre-roll lives at negative ticks.
pub trait PositionMap: Send + Sync {
    /// Position at the given relative tick, or `None` if past the range end.
    fn position_at_tick(&self, relative_tick: i64) -> Option<Position>;

    /// Relative tick of the given position, or `None` if outside the range.
    fn tick_at_position(&self, position: &Position) -> Option<i64>;

    /// Number of beats per bar.
    fn beats_per_bar(&self) -> u32;
}

/// Position mapping for a constant time signature over a bar range.
#[derive(Clone, Debug)]
pub struct LinearPositionMap {
    bar_range: BarRange,
    beats_per_bar: u32,
}

impl LinearPositionMap {
    pub fn new(bar_range: BarRange, beats_per_bar: u32) -> Self {
        Self {
            bar_range,
            beats_per_bar: beats_per_bar.max(1),
        }
    }
}

impl PositionMap for LinearPositionMap {
    fn position_at_tick(&self, relative_tick: i64) -> Option<Position> {
        if relative_tick < 0 {
            // Inside the pre-roll: resolve to the range start
            return Some(Position::new(self.bar_range.from, 0.0));
        }
        let beats = relative_tick as f64 / PPQ_RESOLUTION as f64;
        let bar_offset = (beats / self.beats_per_bar as f64) as u32;
        let bar = self.bar_range.from + bar_offset;
        if bar >= self.bar_range.to {
            return None;
        }
        let beat = (beats % self.beats_per_bar as f64) as f32;
        Some(Position::new(bar, beat))
    }

    fn tick_at_position(&self, position: &Position) -> Option<i64> {
        if !self.bar_range.contains(position.bar) {
            return None;
        }
        let bars = (position.bar - self.bar_range.from) as i64;
        let beats = bars * self.beats_per_bar as i64;
        let tick = beats * PPQ_RESOLUTION + (position.beat as f64 * PPQ_RESOLUTION as f64) as i64;
        Some(tick)
    }

    fn beats_per_bar(&self) -> u32 {
        self.beats_per_bar
    }
}

/// Immutable snapshot of the musical model for one playback session.
///
/// Built by the surrounding application (lead sheet editor, song structure
/// editor) and handed to the playback core. The core never mutates it; model
/// changes are communicated separately and outdate the session instead.
pub struct SongContext {
    /// Song title, used for logging only.
    pub title: String,
    /// The playable bar range of this context.
    pub bar_range: BarRange,
    /// Song tempo in BPM.
    pub tempo_bpm: f32,
    /// Chord symbols in playback order.
    pub chords: Vec<ChordSymbol>,
    /// Song structure parts, ordered by start bar.
    pub parts: Vec<SongPart>,
    /// Voices of the arrangement.
    pub voices: Vec<VoiceSpec>,
    /// Tick to position mapping for this arrangement.
    pub position_map: Arc<dyn PositionMap>,
}

impl SongContext {
    /// Chord symbol at the given index of the chord sequence.
    pub fn chord_at_index(&self, index: usize) -> Option<&ChordSymbol> {
        self.chords.get(index)
    }

    /// The chord in effect at `position`: the last chord at or before it.
    pub fn chord_in_effect(&self, position: &Position) -> Option<&ChordSymbol> {
        self.chords
            .iter()
            .take_while(|cs| cs.position <= *position)
            .last()
    }

    /// The song part containing `bar`, if any.
    pub fn part_at_bar(&self, bar: u32) -> Option<&SongPart> {
        self.parts.iter().find(|p| p.contains_bar(bar))
    }

    /// The song part starting exactly at `bar`, if any.
    pub fn part_starting_at_bar(&self, bar: u32) -> Option<&SongPart> {
        self.parts.iter().find(|p| p.start_bar == bar)
    }
}

impl std::fmt::Debug for SongContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SongContext")
            .field("title", &self.title)
            .field("bar_range", &self.bar_range)
            .field("tempo_bpm", &self.tempo_bpm)
            .field("chords", &self.chords.len())
            .field("parts", &self.parts.len())
            .field("voices", &self.voices.len())
            .finish_non_exhaustive()
    }
}
