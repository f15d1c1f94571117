//! Playback and sequencing core of the Bandstand jazz arrangement tool.
//!
//! The crate turns an immutable snapshot of the musical model into MIDI
//! playback with latency-compensated UI notifications:
//!
//! - [`engine::PlaybackEngine`] - Transport state machine and event translation
//! - [`session::PlaybackSession`] - One generated arrangement armed for playback
//! - [`device::SequencerDevice`] - The sequencer hardware seam, with
//!   [`device::VirtualSequencer`] as the software implementation
//! - [`dispatch::EventDispatcher`] - The single notification thread
//! - [`builder::GenerationQueue`] - Background generation with stale-result discard
//!
//! ```no_run
//! use bandstand_core::engine::PlaybackEngine;
//!
//! let engine = PlaybackEngine::with_system_output("FluidSynth")?;
//! // arm a session built from the musical model, then:
//! // engine.play_session(&session, 0)?;
//! # Ok::<(), bandstand_core::error::PlaybackError>(())
//! ```

pub mod builder;
pub mod device;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod generator;
pub mod listener;
pub mod prefs;
pub mod sequence;
pub mod session;
pub mod song;
pub mod timing;

pub use device::{DeviceEvent, SequencerDevice, SharedDevice, VirtualSequencer};
pub use engine::{MixEvent, PlaybackEngine, PlaybackState};
pub use error::{PlaybackError, Result};
pub use generator::{GeneratedSequence, PostProcessor, SequenceGenerator};
pub use listener::{NoteListener, PlaybackListener, PrePlaybackVeto, StateListener};
pub use session::{PlaybackSession, SessionState, SharedSession, LOOP_FOREVER};
pub use song::{ChordSymbol, SongContext, SongPart, VoiceSpec};
pub use timing::{BarRange, Position, TickRange, PPQ_RESOLUTION, SEQUENCER_REF_TEMPO};
