//! The built timeline artifact loaded into the sequencer device.
//!
//! A [`MidiSequence`] is an ordered set of tracks of tick-stamped events,
//! immutable once built. Besides the musical tracks it carries a control
//! track holding the events the engine listens for:
//!
//! - a beat-marker controller event on every beat ([`CTRL_BEAT_MARKER`])
//! - tempo-factor controller events for song parts ([`CTRL_TEMPO_FACTOR`])
//! - chord markers encoding an index into the session chord sequence
//! - the end-of-track marker

use crate::song::SongContext;
use crate::timing::{TickRange, PPQ_RESOLUTION};

/// Controller number of the per-beat position marker.
pub const CTRL_BEAT_MARKER: u8 = 110;

/// Controller number carrying the song-part tempo factor.
pub const CTRL_TEMPO_FACTOR: u8 = 111;

/// Controller value encoding a tempo factor of 1.0.
const TEMPO_FACTOR_UNIT: f32 = 64.0;

/// Decode a tempo factor from a controller value (64 = 1.0).
pub fn tempo_factor_from_value(value: u8) -> f32 {
    value as f32 / TEMPO_FACTOR_UNIT
}

/// Encode a tempo factor as a controller value, saturating at the 7-bit range.
pub fn tempo_factor_to_value(factor: f32) -> u8 {
    (factor * TEMPO_FACTOR_UNIT).round().clamp(0.0, 127.0) as u8
}

/// Marker text for the chord at `index` of the session chord sequence.
pub fn chord_marker(index: usize) -> String {
    format!("csIndex={index}")
}

/// Parse a chord marker text back into a chord-sequence index.
pub fn parse_chord_marker(text: &str) -> Option<usize> {
    text.strip_prefix("csIndex=")?.parse().ok()
}

/// One tick-stamped event on a sequence track.
#[derive(Clone, Debug, PartialEq)]
pub struct TimedEvent {
    /// Absolute device tick of the event.
    pub tick: i64,
    pub kind: EventKind,
}

/// The event payloads a sequence track can carry.
#[derive(Clone, Debug, PartialEq)]
pub enum EventKind {
    NoteOn { channel: u8, pitch: u8, velocity: u8 },
    NoteOff { channel: u8, pitch: u8 },
    Controller { controller: u8, value: u8 },
    Marker(String),
    EndOfTrack,
}

/// A single track of a sequence, events ordered by tick.
#[derive(Clone, Debug, Default)]
pub struct SequenceTrack {
    /// Track label, used for logging only.
    pub name: String,
    events: Vec<TimedEvent>,
}

impl SequenceTrack {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: Vec::new(),
        }
    }

    /// Insert an event, keeping the track ordered by tick.
    pub fn add_event(&mut self, tick: i64, kind: EventKind) {
        let index = self.events.partition_point(|e| e.tick <= tick);
        self.events.insert(index, TimedEvent { tick, kind });
    }

    /// Events of this track in tick order.
    pub fn events(&self) -> &[TimedEvent] {
        &self.events
    }

    /// Tick of the last event, or 0 for an empty track.
    pub fn end_tick(&self) -> i64 {
        self.events.last().map(|e| e.tick).unwrap_or(0)
    }
}

/// An immutable-once-built timeline of timed musical events.
#[derive(Clone, Debug, Default)]
pub struct MidiSequence {
    tracks: Vec<SequenceTrack>,
}

impl MidiSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a track and return its index.
    pub fn add_track(&mut self, track: SequenceTrack) -> usize {
        self.tracks.push(track);
        self.tracks.len() - 1
    }

    pub fn tracks(&self) -> &[SequenceTrack] {
        &self.tracks
    }

    pub fn track(&self, index: usize) -> Option<&SequenceTrack> {
        self.tracks.get(index)
    }

    /// Tick of the last event across all tracks.
    pub fn end_tick(&self) -> i64 {
        self.tracks.iter().map(|t| t.end_tick()).max().unwrap_or(0)
    }
}

/// Build the control track for a song context over the given tick range.
///
/// Emits one beat marker per beat of the range, a chord marker for every
/// chord symbol of the context, and the end-of-track marker at range end.
pub fn build_control_track(context: &SongContext, range: TickRange) -> SequenceTrack {
    let mut track = SequenceTrack::new("control");

    let beats_per_bar = context.position_map.beats_per_bar() as i64;
    let total_beats = context.bar_range.len() as i64 * beats_per_bar;
    for beat in 0..total_beats {
        track.add_event(
            beat * PPQ_RESOLUTION,
            EventKind::Controller {
                controller: CTRL_BEAT_MARKER,
                value: 0,
            },
        );
    }

    for (index, chord) in context.chords.iter().enumerate() {
        if let Some(tick) = context.position_map.tick_at_position(&chord.position) {
            track.add_event(tick, EventKind::Marker(chord_marker(index)));
        } else {
            log::warn!(
                "build_control_track() chord '{}' at {} is outside the context range, skipped",
                chord.name,
                chord.position
            );
        }
    }

    for part in &context.parts {
        if let Some(tick) = context
            .position_map
            .tick_at_position(&crate::timing::Position::new(part.start_bar, 0.0))
        {
            track.add_event(
                tick,
                EventKind::Controller {
                    controller: CTRL_TEMPO_FACTOR,
                    value: tempo_factor_to_value(part.tempo_factor),
                },
            );
        }
    }

    track.add_event(range.len().max(0), EventKind::EndOfTrack);
    track
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::song::{ChordSymbol, LinearPositionMap, SongPart, VoiceSpec};
    use crate::timing::{BarRange, Position};
    use std::sync::Arc;

    #[test]
    fn test_tempo_factor_encoding() {
        assert_eq!(tempo_factor_to_value(1.0), 64);
        assert!((tempo_factor_from_value(64) - 1.0).abs() < 0.001);
        assert!((tempo_factor_from_value(32) - 0.5).abs() < 0.001);
        // Saturates rather than wrapping
        assert_eq!(tempo_factor_to_value(10.0), 127);
    }

    #[test]
    fn test_chord_marker_roundtrip() {
        assert_eq!(parse_chord_marker(&chord_marker(12)), Some(12));
        assert_eq!(parse_chord_marker("csIndex=0"), Some(0));
        assert_eq!(parse_chord_marker("loop=3"), None);
        assert_eq!(parse_chord_marker("csIndex=abc"), None);
    }

    #[test]
    fn test_track_ordering() {
        let mut track = SequenceTrack::new("t");
        track.add_event(100, EventKind::NoteOff { channel: 0, pitch: 60 });
        track.add_event(
            0,
            EventKind::NoteOn {
                channel: 0,
                pitch: 60,
                velocity: 90,
            },
        );
        track.add_event(50, EventKind::NoteOff { channel: 0, pitch: 62 });
        let ticks: Vec<i64> = track.events().iter().map(|e| e.tick).collect();
        assert_eq!(ticks, vec![0, 50, 100]);
        assert_eq!(track.end_tick(), 100);
    }

    #[test]
    fn test_control_track_contents() {
        let bar_range = BarRange::new(0, 2);
        let context = SongContext {
            title: "t".to_string(),
            bar_range,
            tempo_bpm: 120.0,
            chords: vec![
                ChordSymbol::new("C7", Position::new(0, 0.0)),
                ChordSymbol::new("F7", Position::new(1, 0.0)),
            ],
            parts: vec![SongPart::new("A", 0, 2)],
            voices: vec![VoiceSpec::new("bass", 1)],
            position_map: Arc::new(LinearPositionMap::new(bar_range, 4)),
        };
        let range = TickRange::new(0, 8 * PPQ_RESOLUTION);
        let track = build_control_track(&context, range);

        let beats = track
            .events()
            .iter()
            .filter(|e| {
                matches!(
                    e.kind,
                    EventKind::Controller {
                        controller: CTRL_BEAT_MARKER,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(beats, 8);

        let markers: Vec<&TimedEvent> = track
            .events()
            .iter()
            .filter(|e| matches!(e.kind, EventKind::Marker(_)))
            .collect();
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[1].tick, 4 * PPQ_RESOLUTION);

        assert_eq!(
            track.events().last().map(|e| &e.kind),
            Some(&EventKind::EndOfTrack)
        );
    }
}
