//! Error types for the playback core.

use thiserror::Error;

/// Errors that can occur when driving the playback engine.
#[derive(Error, Debug)]
pub enum PlaybackError {
    /// No MIDI output is configured on the sequencer device.
    #[error("No MIDI output device is configured")]
    NoOutputDevice,

    /// A play request arrived while something is already playing.
    #[error("A song is already playing")]
    AlreadyPlaying,

    /// The engine is disabled because the device is held by an external owner.
    #[error("Playback is disabled (device acquired by {holder})")]
    PlaybackDisabled { holder: String },

    /// The session bar range is empty.
    #[error("Nothing to play")]
    NothingToPlay,

    /// The requested start bar is outside the session bar range.
    #[error("Bar {bar} is outside the playable range [{from}, {to})")]
    BarOutOfRange { bar: u32, from: u32, to: u32 },

    /// The requested start tick is not representable by the built sequence.
    #[error("Tick {tick} is outside the built sequence")]
    TickOutOfRange { tick: i64 },

    /// A pre-playback listener vetoed the start.
    ///
    /// A `None` reason means the vetoing listener has already notified the
    /// user and the caller must not notify again.
    #[error("Playback vetoed{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    Vetoed { reason: Option<String> },

    /// The sequence could not be generated from the musical model.
    #[error("Music generation failed: {0}")]
    Generation(String),

    /// Operation attempted on a closed session.
    #[error("The playback session is closed")]
    SessionClosed,

    /// The sequencer device reported a fault.
    #[error("Sequencer device error: {0}")]
    Device(String),

    /// Device release attempted by an entity that does not hold the lock.
    #[error("Device lock holder mismatch: {attempted} does not hold the device")]
    LockHolderMismatch { attempted: String },

    /// A tuning parameter was outside its documented range.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Result type alias using [`PlaybackError`].
pub type Result<T> = std::result::Result<T, PlaybackError>;
