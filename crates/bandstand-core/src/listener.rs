//! Listener traits and the registries holding them.
//!
//! Four listener kinds observe the engine:
//!
//! - [`StateListener`] - Transport state transitions
//! - [`NoteListener`] - Raw note on/off traffic
//! - [`PlaybackListener`] - Musical progress (beats, bars, chords, song parts)
//! - [`PrePlaybackVeto`] - May refuse a playback start before it happens
//!
//! Registration is `Arc` identity based: adding the same `Arc` twice is a
//! no-op, removal matches by pointer. Notification iterates over a snapshot
//! so listeners may add or remove themselves while being notified.

use crate::engine::PlaybackState;
use crate::song::{ChordSymbol, SongContext, SongPart};
use crate::timing::Position;
use std::sync::{Arc, Mutex};

/// Observes transport state transitions.
pub trait StateListener: Send + Sync {
    fn state_changed(&self, old: PlaybackState, new: PlaybackState);
}

/// Observes raw note traffic, dispatched latency-compensated.
pub trait NoteListener: Send + Sync {
    fn note_on(&self, _channel: u8, _pitch: u8, _velocity: u8) {}

    fn note_off(&self, _channel: u8, _pitch: u8) {}
}

/// Observes musical progress, dispatched latency-compensated.
///
/// All methods default to no-ops so implementors pick what they need.
pub trait PlaybackListener: Send + Sync {
    /// Playback listening became (un)available, e.g. on device arbitration.
    fn enabled_changed(&self, _enabled: bool) {}

    /// Fired on every beat. Always precedes `bar_changed` for the same tick.
    fn beat_changed(&self, _old: Position, _new: Position) {}

    /// Fired when the beat lands on the first beat of a new bar.
    fn bar_changed(&self, _old_bar: u32, _new_bar: u32) {}

    /// The chord symbol now sounding.
    fn chord_symbol_changed(&self, _chord: &ChordSymbol) {}

    /// The song part now playing.
    fn song_part_changed(&self, _part: &SongPart) {}

    /// Coalesced MIDI activity on a channel (at most one per channel per
    /// activity period).
    fn midi_activity(&self, _channel: u8) {}
}

/// A refused playback start.
///
/// `reason` is `None` when the vetoing listener already reported the problem
/// to the user itself; callers must not report it again.
#[derive(Clone, Debug)]
pub struct Veto {
    pub reason: Option<String>,
}

/// Consulted before every playback start; may refuse it.
pub trait PrePlaybackVeto: Send + Sync {
    fn check_playback(&self, context: &SongContext) -> std::result::Result<(), Veto>;
}

/// Duplicate-free listener registry with snapshot-on-notify semantics.
pub struct Registry<T: ?Sized> {
    entries: Mutex<Vec<Arc<T>>>,
}

impl<T: ?Sized> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<T: ?Sized> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Adding the same `Arc` twice is a no-op.
    pub fn add(&self, listener: Arc<T>) {
        let mut entries = self.entries.lock().expect("listener registry poisoned");
        if !entries.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            entries.push(listener);
        }
    }

    /// Unregister a listener by `Arc` identity.
    pub fn remove(&self, listener: &Arc<T>) {
        let mut entries = self.entries.lock().expect("listener registry poisoned");
        entries.retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Snapshot of the current listeners, safe to iterate while they mutate
    /// the registry.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries
            .lock()
            .expect("listener registry poisoned")
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("listener registry poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    impl PlaybackListener for Counter {
        fn midi_activity(&self, _channel: u8) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_add_is_identity_deduplicated() {
        let registry: Registry<dyn PlaybackListener> = Registry::new();
        let listener: Arc<dyn PlaybackListener> = Arc::new(Counter(AtomicUsize::new(0)));
        registry.add(Arc::clone(&listener));
        registry.add(Arc::clone(&listener));
        assert_eq!(registry.len(), 1);

        // A distinct instance is a distinct registration
        let other: Arc<dyn PlaybackListener> = Arc::new(Counter(AtomicUsize::new(0)));
        registry.add(other);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remove_by_identity() {
        let registry: Registry<dyn PlaybackListener> = Registry::new();
        let a: Arc<dyn PlaybackListener> = Arc::new(Counter(AtomicUsize::new(0)));
        let b: Arc<dyn PlaybackListener> = Arc::new(Counter(AtomicUsize::new(0)));
        registry.add(Arc::clone(&a));
        registry.add(Arc::clone(&b));
        registry.remove(&a);
        assert_eq!(registry.len(), 1);
        registry.remove(&a); // absent, no-op
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_snapshot_isolated_from_mutation() {
        let registry: Registry<dyn PlaybackListener> = Registry::new();
        let a: Arc<dyn PlaybackListener> = Arc::new(Counter(AtomicUsize::new(0)));
        registry.add(Arc::clone(&a));
        let snapshot = registry.snapshot();
        registry.remove(&a);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.len(), 0);
    }
}
