//! Playback sessions: one generated arrangement armed for transport.
//!
//! A [`PlaybackSession`] owns everything the engine needs to play one
//! arrangement: the built [`MidiSequence`], its tick range, the voice to
//! track map used for mute synchronization, and the natural beat positions
//! used to translate device ticks back into musical positions.
//!
//! Lifecycle: `New -> Generating -> Active -> Outdated -> Closed`. When the
//! musical model changes the session is outdated; playing it again first
//! regenerates it from the same context. `Closed` is terminal.

use crate::error::{PlaybackError, Result};
use crate::generator::{generate_with_post_processing, PostProcessor, SequenceGenerator};
use crate::sequence::{build_control_track, MidiSequence};
use crate::song::{SongContext, VoiceId};
use crate::timing::{Position, TickRange, PPQ_RESOLUTION};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Loop count value meaning "loop until stopped".
pub const LOOP_FOREVER: i32 = -1;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A session shared between the engine, the generation queue and listeners.
pub type SharedSession = Arc<Mutex<PlaybackSession>>;

/// Lifecycle state of a playback session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Built but not yet generated.
    New,
    /// Generation in progress on some thread.
    Generating,
    /// Generated and playable.
    Active,
    /// The musical model changed since generation; no longer playable.
    Outdated,
    /// Resources released. Terminal.
    Closed,
}

/// One arrangement prepared (or being prepared) for playback.
pub struct PlaybackSession {
    id: u64,
    state: SessionState,
    sequence: Option<Arc<MidiSequence>>,
    tick_range: TickRange,
    loop_count: i32,
    voice_tracks: HashMap<VoiceId, usize>,
    /// Musical position of each beat of the playable range, by beat index.
    beat_positions: Vec<Position>,
    control_track: Option<usize>,
    song_context: Option<Arc<SongContext>>,
    generator: Option<Arc<dyn SequenceGenerator>>,
    post_processors: Vec<Box<dyn PostProcessor>>,
    dirty: bool,
}

impl PlaybackSession {
    /// Build a new (ungenerated) session for a song context.
    ///
    /// `tick_start` may be negative to leave room for a precount before the
    /// musical range; the range end is derived from the context bar range.
    pub fn build(
        context: Arc<SongContext>,
        generator: Arc<dyn SequenceGenerator>,
        tick_start: i64,
        loop_count: i32,
        post_processors: Vec<Box<dyn PostProcessor>>,
    ) -> SharedSession {
        let beats_per_bar = context.position_map.beats_per_bar();
        let total_beats = context.bar_range.len() as i64 * beats_per_bar as i64;
        let tick_range = TickRange::new(tick_start, total_beats * PPQ_RESOLUTION);

        let mut beat_positions = Vec::with_capacity(total_beats as usize);
        for bar in context.bar_range.from..context.bar_range.to {
            for beat in 0..beats_per_bar {
                beat_positions.push(Position::new(bar, beat as f32));
            }
        }

        let session = Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            state: SessionState::New,
            sequence: None,
            tick_range,
            loop_count,
            voice_tracks: HashMap::new(),
            beat_positions,
            control_track: None,
            song_context: Some(context),
            generator: Some(generator),
            post_processors,
            dirty: false,
        };
        log::debug!("build() new session id={}", session.id);
        Arc::new(Mutex::new(session))
    }

    /// Wrap an already-built sequence as an immediately active session.
    ///
    /// This is the trusted entry point used by tick-indexed playback of
    /// precomputed material (count-ins, intros). No song context is attached.
    pub fn from_sequence(
        sequence: Arc<MidiSequence>,
        tick_range: TickRange,
        loop_count: i32,
    ) -> SharedSession {
        let session = Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            state: SessionState::Active,
            sequence: Some(sequence),
            tick_range,
            loop_count,
            voice_tracks: HashMap::new(),
            beat_positions: Vec::new(),
            control_track: None,
            song_context: None,
            generator: None,
            post_processors: Vec::new(),
            dirty: false,
        };
        Arc::new(Mutex::new(session))
    }

    /// Run generation if the session is `New`, or regenerate it if the
    /// musical model outdated it.
    ///
    /// Generating an `Active` session is a no-op; a `Closed` session errors.
    /// On generation failure the session keeps its previous state so the
    /// caller may retry or discard it.
    pub fn generate(&mut self) -> Result<()> {
        let rollback = match self.state {
            SessionState::New | SessionState::Outdated => self.state,
            SessionState::Closed => return Err(PlaybackError::SessionClosed),
            _ => return Ok(()),
        };
        let context = self
            .song_context
            .clone()
            .ok_or_else(|| PlaybackError::Generation("session has no song context".to_string()))?;
        let generator = self
            .generator
            .clone()
            .ok_or_else(|| PlaybackError::Generation("session has no generator".to_string()))?;

        self.set_state(SessionState::Generating);
        let generated =
            match generate_with_post_processing(&*generator, &context, &self.post_processors) {
                Ok(g) => g,
                Err(e) => {
                    self.set_state(rollback);
                    return Err(e);
                }
            };

        let mut sequence = generated.sequence;
        self.control_track = Some(
            sequence.add_track(build_control_track(&context, self.tick_range)),
        );
        self.voice_tracks = generated.voice_tracks;
        self.sequence = Some(Arc::new(sequence));
        self.dirty = false;
        self.set_state(SessionState::Active);
        Ok(())
    }

    /// Mark an `Active` session outdated after a musical model change.
    pub fn mark_outdated(&mut self) {
        if self.state == SessionState::Active {
            self.set_state(SessionState::Outdated);
        }
    }

    /// Release session resources. Idempotent; the session becomes `Closed`.
    pub fn cleanup(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.sequence = None;
        self.voice_tracks.clear();
        self.generator = None;
        self.post_processors.clear();
        self.set_state(SessionState::Closed);
    }

    fn set_state(&mut self, new: SessionState) {
        log::debug!(
            "session {} state {:?} -> {:?}",
            self.id,
            self.state,
            new
        );
        self.state = new;
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The built sequence, present once the session is `Active` or `Outdated`.
    pub fn sequence(&self) -> Option<&Arc<MidiSequence>> {
        self.sequence.as_ref()
    }

    pub fn tick_range(&self) -> TickRange {
        self.tick_range
    }

    pub fn loop_count(&self) -> i32 {
        self.loop_count
    }

    pub fn set_loop_count(&mut self, loop_count: i32) {
        self.loop_count = loop_count;
    }

    /// The song context, if this session was built from the musical model.
    ///
    /// Sessions wrapped from a bare sequence return `None`; callers needing
    /// chord/song-part tracking must check this instead of assuming it.
    pub fn song_context(&self) -> Option<&Arc<SongContext>> {
        self.song_context.as_ref()
    }

    /// Track index of a voice, used to apply mute changes.
    pub fn track_for_voice(&self, voice: &str) -> Option<usize> {
        self.voice_tracks.get(voice).copied()
    }

    /// Index of the control track carrying beat markers and chord markers.
    pub fn control_track(&self) -> Option<usize> {
        self.control_track
    }

    /// Forget the voice to track map after a channel reassignment.
    pub fn clear_voice_tracks(&mut self) {
        self.voice_tracks.clear();
    }

    /// Musical position of a beat index, clamped to the playable range.
    pub fn position_at_beat_index(&self, index: usize) -> Option<Position> {
        if self.beat_positions.is_empty() {
            return None;
        }
        let index = index.min(self.beat_positions.len() - 1);
        Some(self.beat_positions[index])
    }

    /// Relative tick of the first beat of `bar`, if inside the range.
    pub fn tick_at_bar(&self, bar: u32) -> Option<i64> {
        let context = self.song_context.as_ref()?;
        context
            .position_map
            .tick_at_position(&Position::new(bar, 0.0))
    }

    /// True if the session content no longer matches what the device plays.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

impl std::fmt::Debug for PlaybackSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackSession")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("tick_range", &self.tick_range)
            .field("loop_count", &self.loop_count)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::GeneratedSequence;
    use crate::sequence::{EventKind, SequenceTrack};
    use crate::song::{ChordSymbol, LinearPositionMap, SongPart, VoiceSpec};
    use crate::timing::BarRange;

    pub(crate) struct TestGenerator;

    impl SequenceGenerator for TestGenerator {
        fn generate(&self, context: &SongContext) -> Result<GeneratedSequence> {
            let mut generated = GeneratedSequence::default();
            for voice in &context.voices {
                let mut track = SequenceTrack::new(voice.id.clone());
                track.add_event(
                    0,
                    EventKind::NoteOn {
                        channel: voice.channel,
                        pitch: 40,
                        velocity: 80,
                    },
                );
                let index = generated.sequence.add_track(track);
                generated.voice_tracks.insert(voice.id.clone(), index);
            }
            Ok(generated)
        }
    }

    pub(crate) fn make_context() -> Arc<SongContext> {
        let bar_range = BarRange::new(0, 4);
        Arc::new(SongContext {
            title: "test".to_string(),
            bar_range,
            tempo_bpm: 120.0,
            chords: vec![
                ChordSymbol::new("Dm7", Position::new(0, 0.0)),
                ChordSymbol::new("G7", Position::new(2, 0.0)),
            ],
            parts: vec![SongPart::new("A", 0, 4)],
            voices: vec![VoiceSpec::new("bass", 1), VoiceSpec::new("drums", 9)],
            position_map: Arc::new(LinearPositionMap::new(bar_range, 4)),
        })
    }

    #[test]
    fn test_lifecycle() {
        let session = PlaybackSession::build(
            make_context(),
            Arc::new(TestGenerator),
            0,
            0,
            Vec::new(),
        );
        let mut s = session.lock().unwrap();
        assert_eq!(s.state(), SessionState::New);
        assert!(s.sequence().is_none());

        s.generate().unwrap();
        assert_eq!(s.state(), SessionState::Active);
        assert!(s.sequence().is_some());
        // Two voice tracks plus the control track
        assert_eq!(s.sequence().unwrap().tracks().len(), 3);
        assert_eq!(s.control_track(), Some(2));

        s.mark_outdated();
        assert_eq!(s.state(), SessionState::Outdated);

        s.cleanup();
        assert_eq!(s.state(), SessionState::Closed);
        s.cleanup(); // idempotent
        assert_eq!(s.state(), SessionState::Closed);
        assert!(matches!(s.generate(), Err(PlaybackError::SessionClosed)));
    }

    #[test]
    fn test_generate_is_noop_when_active() {
        let session = PlaybackSession::build(
            make_context(),
            Arc::new(TestGenerator),
            0,
            0,
            Vec::new(),
        );
        let mut s = session.lock().unwrap();
        s.generate().unwrap();
        let seq = Arc::clone(s.sequence().unwrap());
        s.generate().unwrap();
        assert!(Arc::ptr_eq(&seq, s.sequence().unwrap()));
    }

    #[test]
    fn test_outdated_session_regenerates() {
        let session = PlaybackSession::build(
            make_context(),
            Arc::new(TestGenerator),
            0,
            0,
            Vec::new(),
        );
        let mut s = session.lock().unwrap();
        s.generate().unwrap();
        s.mark_dirty();
        s.mark_outdated();
        s.generate().unwrap();
        assert_eq!(s.state(), SessionState::Active);
        assert!(!s.is_dirty());
    }

    #[test]
    fn test_generation_failure_keeps_session_new() {
        struct Failing;
        impl SequenceGenerator for Failing {
            fn generate(&self, _: &SongContext) -> Result<GeneratedSequence> {
                Err(PlaybackError::Generation("boom".to_string()))
            }
        }
        let session =
            PlaybackSession::build(make_context(), Arc::new(Failing), 0, 0, Vec::new());
        let mut s = session.lock().unwrap();
        assert!(s.generate().is_err());
        assert_eq!(s.state(), SessionState::New);
    }

    #[test]
    fn test_beat_positions_clamped() {
        let session = PlaybackSession::build(
            make_context(),
            Arc::new(TestGenerator),
            0,
            0,
            Vec::new(),
        );
        let s = session.lock().unwrap();
        assert_eq!(s.position_at_beat_index(0), Some(Position::new(0, 0.0)));
        assert_eq!(s.position_at_beat_index(5), Some(Position::new(1, 1.0)));
        // Past the end clamps to the last beat
        assert_eq!(s.position_at_beat_index(999), Some(Position::new(3, 3.0)));
    }

    #[test]
    fn test_tick_range_with_precount() {
        let session = PlaybackSession::build(
            make_context(),
            Arc::new(TestGenerator),
            -2 * PPQ_RESOLUTION,
            LOOP_FOREVER,
            Vec::new(),
        );
        let s = session.lock().unwrap();
        assert_eq!(s.tick_range().start, -2 * PPQ_RESOLUTION);
        assert_eq!(s.tick_range().end, 16 * PPQ_RESOLUTION);
        assert_eq!(s.loop_count(), LOOP_FOREVER);
    }

    #[test]
    fn test_voice_track_map() {
        let session = PlaybackSession::build(
            make_context(),
            Arc::new(TestGenerator),
            0,
            0,
            Vec::new(),
        );
        let mut s = session.lock().unwrap();
        s.generate().unwrap();
        assert!(s.track_for_voice("bass").is_some());
        assert!(s.track_for_voice("horns").is_none());
        s.clear_voice_tracks();
        assert!(s.track_for_voice("bass").is_none());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = PlaybackSession::from_sequence(
            Arc::new(MidiSequence::new()),
            TickRange::new(0, 0),
            0,
        );
        let b = PlaybackSession::from_sequence(
            Arc::new(MidiSequence::new()),
            TickRange::new(0, 0),
            0,
        );
        assert_ne!(a.lock().unwrap().id(), b.lock().unwrap().id());
    }
}
