//! Sequence generation seams.
//!
//! The playback core never composes music itself. A [`SequenceGenerator`]
//! implementation (the arranger engine of the surrounding application) turns a
//! [`SongContext`] into a [`GeneratedSequence`]; zero or more
//! [`PostProcessor`]s then rework the result in place before the session
//! adopts it.

use crate::error::Result;
use crate::sequence::MidiSequence;
use crate::song::{SongContext, VoiceId};
use std::collections::HashMap;

/// The output of one generation run.
#[derive(Debug, Default)]
pub struct GeneratedSequence {
    /// The built timeline.
    pub sequence: MidiSequence,
    /// Map from voice id to the index of its track in `sequence`.
    pub voice_tracks: HashMap<VoiceId, usize>,
}

/// Turns a musical-model snapshot into a playable sequence.
///
/// `generate` may be slow (seconds for a long arrangement); callers that need
/// responsiveness run it through the generation queue instead of inline.
pub trait SequenceGenerator: Send + Sync {
    fn generate(&self, context: &SongContext) -> Result<GeneratedSequence>;
}

/// Reworks a generated sequence in place before the session adopts it.
///
/// Post processors run on the generation thread, in registration order, after
/// the generator succeeded. Typical uses: humanization, velocity shaping,
/// click-track injection.
pub trait PostProcessor: Send + Sync {
    /// Short name for logging.
    fn name(&self) -> &str;

    fn process(&self, generated: &mut GeneratedSequence);
}

/// Run `generator` then every post processor, logging each stage.
pub fn generate_with_post_processing(
    generator: &dyn SequenceGenerator,
    context: &SongContext,
    post_processors: &[Box<dyn PostProcessor>],
) -> Result<GeneratedSequence> {
    log::debug!(
        "generate_with_post_processing() context={:?} post_processors={}",
        context,
        post_processors.len()
    );
    let mut generated = generator.generate(context)?;
    for pp in post_processors {
        log::debug!("generate_with_post_processing() running '{}'", pp.name());
        pp.process(&mut generated);
    }
    Ok(generated)
}
