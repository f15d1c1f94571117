//! The playback engine: transport state machine and event translation.
//!
//! [`PlaybackEngine`] owns the sequencer device and the armed playback
//! session, and drives the transport state machine:
//!
//! ```text
//! Stopped -> Playing -> Paused -> Playing
//!    ^          |          |
//!    |          v          v
//!    +------- Stopped <- Stopped        Disabled <-> Stopped (arbitration)
//! ```
//!
//! Raw [`DeviceEvent`]s coming off the device thread are pumped onto the
//! dispatcher thread and translated there into musical notifications: beat
//! and bar changes, chord symbols, song parts, coalesced MIDI activity.
//! All listener delivery is latency compensated through the dispatcher.

use crate::device::{DeviceEvent, SequencerDevice, SharedDevice};
use crate::dispatch::{EventDispatcher, OutputLatency};
use crate::error::{PlaybackError, Result};
use crate::listener::{NoteListener, PlaybackListener, PrePlaybackVeto, Registry, StateListener};
use crate::prefs::Preferences;
use crate::sequence::{parse_chord_marker, tempo_factor_from_value, CTRL_BEAT_MARKER, CTRL_TEMPO_FACTOR};
use crate::session::{SessionState, SharedSession};
use crate::song::{SongContext, VoiceId};
use crate::timing::{beat_index_at_tick, Position, TickRange, SEQUENCER_REF_TEMPO};
use crossbeam_channel::Sender;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Minimum period between two MIDI-activity notifications per channel.
pub const ACTIVITY_MIN_PERIOD: Duration = Duration::from_millis(100);

/// Transport state of the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackState {
    /// The device is held by an external acquirer; transport requests fail.
    Disabled,
    /// Not playing, transport at the session start.
    Stopped,
    /// Not playing, transport holding its position.
    Paused,
    Playing,
}

/// A change in the mix model the engine must react to.
#[derive(Clone, Debug)]
pub enum MixEvent {
    /// A voice was muted or unmuted. Applied live through the session's
    /// voice to track map.
    Mute { voice: VoiceId, muted: bool },
    /// A voice moved to another channel. Structural; also invalidates the
    /// voice to track map.
    ChannelReassigned,
    /// Drum traffic was rerouted. Structural.
    DrumsRerouted,
    /// An instrument transposition changed. Structural.
    InstrumentTransposed,
    /// A velocity shift changed. Structural.
    VelocityShifted,
    /// A drum key map changed. Structural.
    KeyMapChanged,
}

enum StartAt {
    Bar(u32),
    Tick(i64),
}

struct Core {
    state: PlaybackState,
    device: SharedDevice,
    session: Option<SharedSession>,
    position: Position,
    song_tempo_factor: f32,
    song_part_tempo_factor: f32,
    device_holder: Option<String>,
    event_tx: Option<Sender<DeviceEvent>>,
    last_activity: HashMap<u8, Instant>,
}

struct Shared {
    core: Mutex<Core>,
    dispatcher: EventDispatcher,
    latency: OutputLatency,
    state_listeners: Registry<dyn StateListener>,
    note_listeners: Registry<dyn NoteListener>,
    playback_listeners: Registry<dyn PlaybackListener>,
    vetoes: Registry<dyn PrePlaybackVeto>,
}

impl Shared {
    fn lock_core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().expect("engine core poisoned")
    }

    fn set_state(&self, core: &mut Core, new: PlaybackState) {
        if core.state == new {
            return;
        }
        let old = core.state;
        core.state = new;
        log::debug!("transport {old:?} -> {new:?}");
        let listeners = self.state_listeners.snapshot();
        self.dispatcher.submit(Box::new(move || {
            for l in &listeners {
                l.state_changed(old, new);
            }
        }));
    }

    /// Re-apply the composed tempo factor to the device.
    fn apply_tempo(&self, core: &Core) {
        let factor = core.song_tempo_factor * core.song_part_tempo_factor;
        core.device
            .lock()
            .expect("device poisoned")
            .set_tempo_factor(factor);
    }

    fn notify_playback(&self, f: impl Fn(&dyn PlaybackListener) + Send + 'static) {
        let listeners = self.playback_listeners.snapshot();
        if listeners.is_empty() {
            return;
        }
        self.dispatcher.dispatch(
            &self.latency,
            Box::new(move || {
                for l in &listeners {
                    f(l.as_ref());
                }
            }),
        );
    }

    fn notify_notes(&self, f: impl Fn(&dyn NoteListener) + Send + 'static) {
        let listeners = self.note_listeners.snapshot();
        if listeners.is_empty() {
            return;
        }
        self.dispatcher.dispatch(
            &self.latency,
            Box::new(move || {
                for l in &listeners {
                    f(l.as_ref());
                }
            }),
        );
    }

    fn notify_enabled(&self, enabled: bool) {
        let listeners = self.playback_listeners.snapshot();
        self.dispatcher.submit(Box::new(move || {
            for l in &listeners {
                l.enabled_changed(enabled);
            }
        }));
    }
}

/// Plays one session at a time on the sequencer device.
pub struct PlaybackEngine {
    shared: Arc<Shared>,
    prefs: Mutex<Preferences>,
    pump: Option<JoinHandle<()>>,
}

impl PlaybackEngine {
    /// Create an engine around a sequencer device.
    ///
    /// The engine installs itself as the device's event sink.
    pub fn new(mut device: Box<dyn SequencerDevice>, prefs: Preferences) -> Self {
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        device.set_event_sink(Some(event_tx.clone()));

        let shared = Arc::new(Shared {
            core: Mutex::new(Core {
                state: PlaybackState::Stopped,
                device: Arc::new(Mutex::new(device)),
                session: None,
                position: Position::default(),
                song_tempo_factor: 1.0,
                song_part_tempo_factor: 1.0,
                device_holder: None,
                event_tx: Some(event_tx),
                last_activity: HashMap::new(),
            }),
            dispatcher: EventDispatcher::new(),
            latency: OutputLatency::default(),
            state_listeners: Registry::new(),
            note_listeners: Registry::new(),
            playback_listeners: Registry::new(),
            vetoes: Registry::new(),
        });

        // Pump raw device events onto the dispatcher thread, where all
        // translation and listener delivery happens.
        let pump_shared = Arc::clone(&shared);
        let pump = thread::spawn(move || {
            for event in event_rx {
                let shared = Arc::clone(&pump_shared);
                pump_shared
                    .dispatcher
                    .submit(Box::new(move || translate_event(&shared, event)));
            }
        });

        Self {
            shared,
            prefs: Mutex::new(prefs),
            pump: Some(pump),
        }
    }

    /// Create an engine driving a real MIDI output port.
    ///
    /// Fails if no output port matches `port_fragment`.
    pub fn with_system_output(port_fragment: &str) -> Result<Self> {
        let connection = crate::device::open_output(port_fragment)?;
        let mut sequencer = crate::device::VirtualSequencer::new();
        sequencer.set_output(Some(connection));
        Ok(Self::new(Box::new(sequencer), Preferences::open()))
    }

    // ----- transport ------------------------------------------------------

    /// Play the armed session from `from_bar`.
    pub fn play_from(&self, from_bar: u32) -> Result<()> {
        let session = self
            .shared
            .lock_core()
            .session
            .clone()
            .ok_or(PlaybackError::NothingToPlay)?;
        self.play_session(&session, from_bar)
    }

    /// Arm `session` and play it from `from_bar`.
    ///
    /// A `New` session is generated inline; a session outdated or dirtied by
    /// model changes is regenerated first. On any failure the engine state is
    /// unchanged.
    pub fn play_session(&self, session: &SharedSession, from_bar: u32) -> Result<()> {
        self.check_startable()?;
        let context = {
            let s = session.lock().expect("session poisoned");
            if s.state() == SessionState::Closed {
                return Err(PlaybackError::SessionClosed);
            }
            s.song_context().cloned()
        };
        let Some(ctx) = &context else {
            return Err(PlaybackError::InvalidParameter(
                "bar-indexed playback needs a song session".to_string(),
            ));
        };
        if ctx.bar_range.is_empty() {
            return Err(PlaybackError::NothingToPlay);
        }
        if !ctx.bar_range.contains(from_bar) {
            return Err(PlaybackError::BarOutOfRange {
                bar: from_bar,
                from: ctx.bar_range.from,
                to: ctx.bar_range.to,
            });
        }
        self.run_vetoes(ctx)?;
        self.regenerate_if_needed(session)?;
        self.arm_and_start(session, StartAt::Bar(from_bar))
    }

    /// Arm `session` and play it from a raw tick.
    ///
    /// This is the trusted entry point for precomputed material; `from_tick`
    /// is not validated against the musical range, only against the built
    /// sequence itself.
    pub fn play_session_from_tick(&self, session: &SharedSession, from_tick: i64) -> Result<()> {
        self.check_startable()?;
        let context = {
            let s = session.lock().expect("session poisoned");
            if s.state() == SessionState::Closed {
                return Err(PlaybackError::SessionClosed);
            }
            s.song_context().cloned()
        };
        if let Some(ctx) = &context {
            self.run_vetoes(ctx)?;
        }
        self.regenerate_if_needed(session)?;
        {
            let s = session.lock().expect("session poisoned");
            let range = s.tick_range();
            let sequence_end = s.sequence().map(|seq| seq.end_tick()).unwrap_or(range.end);
            if from_tick < range.start || from_tick > sequence_end {
                return Err(PlaybackError::TickOutOfRange { tick: from_tick });
            }
        }
        self.arm_and_start(session, StartAt::Tick(from_tick))
    }

    /// Pause playback, holding the transport position.
    ///
    /// A session dirtied since it was generated cannot be meaningfully
    /// resumed, so pausing it stops instead. No-op unless `Playing`.
    pub fn pause(&self) -> Result<()> {
        let shared = &self.shared;
        let mut core = shared.lock_core();
        if core.state != PlaybackState::Playing {
            return Ok(());
        }
        let stale = core
            .session
            .as_ref()
            .map(|session| {
                let s = session.lock().expect("session poisoned");
                s.is_dirty() || s.state() == SessionState::Outdated
            })
            .unwrap_or(false);
        if stale {
            stop_core(shared, &mut core);
            return Ok(());
        }
        core.device.lock().expect("device poisoned").stop();
        shared.dispatcher.cancel_pending();
        shared.set_state(&mut core, PlaybackState::Paused);
        Ok(())
    }

    /// Resume from a pause.
    ///
    /// A session that went stale while paused cannot be restarted in place;
    /// it is replayed from the range start instead, regenerating first.
    pub fn resume(&self) -> Result<()> {
        let shared = &self.shared;
        let mut core = shared.lock_core();
        match core.state {
            PlaybackState::Paused => {}
            PlaybackState::Disabled => {
                return Err(PlaybackError::PlaybackDisabled {
                    holder: core.device_holder.clone().unwrap_or_default(),
                })
            }
            _ => return Ok(()),
        }
        let stale_session = core.session.clone().filter(|session| {
            let s = session.lock().expect("session poisoned");
            s.is_dirty() || s.state() == SessionState::Outdated
        });
        if let Some(session) = stale_session {
            log::debug!("resume() session changed while paused, replaying from the start");
            stop_core(shared, &mut core);
            drop(core);
            let from_bar = session
                .lock()
                .expect("session poisoned")
                .song_context()
                .map(|ctx| ctx.bar_range.from)
                .ok_or(PlaybackError::NothingToPlay)?;
            return self.play_session(&session, from_bar);
        }
        // Restate what is sounding at the held position before the transport
        // moves again
        if let Some(session) = core.session.clone() {
            let s = session.lock().expect("session poisoned");
            if let Some(ctx) = s.song_context() {
                announce_position(shared, ctx, core.position);
            }
        }
        core.device.lock().expect("device poisoned").start()?;
        shared.set_state(&mut core, PlaybackState::Playing);
        Ok(())
    }

    /// Stop playback and rewind to the session start. No-op when already
    /// `Stopped` or `Disabled`.
    pub fn stop(&self) {
        let shared = &self.shared;
        let mut core = shared.lock_core();
        stop_core(shared, &mut core);
    }

    // ----- device arbitration ----------------------------------------------

    /// Hand the sequencer device to an external `holder`.
    ///
    /// Succeeds only while `Stopped` with no current holder. The engine
    /// detaches its event sink and goes `Disabled` until [`release_device`].
    ///
    /// [`release_device`]: Self::release_device
    pub fn acquire_device(&self, holder: impl Into<String>) -> Option<SharedDevice> {
        let shared = &self.shared;
        let mut core = shared.lock_core();
        if core.state != PlaybackState::Stopped || core.device_holder.is_some() {
            return None;
        }
        let holder = holder.into();
        log::debug!("acquire_device() holder='{holder}'");
        core.device_holder = Some(holder);
        core.device
            .lock()
            .expect("device poisoned")
            .set_event_sink(None);
        shared.set_state(&mut core, PlaybackState::Disabled);
        shared.notify_enabled(false);
        Some(Arc::clone(&core.device))
    }

    /// Take the device back from `holder` and re-enable playback.
    ///
    /// The armed session is marked dirty since the holder may have left the
    /// device in any state.
    pub fn release_device(&self, holder: &str) -> Result<()> {
        let shared = &self.shared;
        let mut core = shared.lock_core();
        match &core.device_holder {
            Some(h) if h == holder => {}
            _ => {
                return Err(PlaybackError::LockHolderMismatch {
                    attempted: holder.to_string(),
                })
            }
        }
        log::debug!("release_device() holder='{holder}'");
        core.device_holder = None;
        let sink = core.event_tx.clone();
        core.device
            .lock()
            .expect("device poisoned")
            .set_event_sink(sink);
        if let Some(session) = &core.session {
            session.lock().expect("session poisoned").mark_dirty();
        }
        shared.set_state(&mut core, PlaybackState::Stopped);
        shared.notify_enabled(true);
        Ok(())
    }

    // ----- tuning -----------------------------------------------------------

    /// Change the loop count of the armed session. No-op while `Disabled`.
    pub fn set_loop_count(&self, count: i32) {
        let core = self.shared.lock_core();
        if core.state == PlaybackState::Disabled {
            return;
        }
        if let Some(session) = &core.session {
            let mut s = session.lock().expect("session poisoned");
            s.set_loop_count(count);
            core.device
                .lock()
                .expect("device poisoned")
                .set_loop(TickRange::new(0, s.tick_range().end), count);
        }
    }

    /// Change the song tempo, recomputing the song tempo factor only.
    pub fn set_song_tempo(&self, bpm: f32) {
        let shared = &self.shared;
        let mut core = shared.lock_core();
        core.song_tempo_factor = bpm / SEQUENCER_REF_TEMPO;
        shared.apply_tempo(&core);
    }

    /// React to a mix model change.
    pub fn handle_mix_event(&self, event: MixEvent) {
        let shared = &self.shared;
        let mut core = shared.lock_core();
        let Some(session) = core.session.clone() else {
            return;
        };
        match event {
            MixEvent::Mute { voice, muted } => {
                let s = session.lock().expect("session poisoned");
                match s.track_for_voice(&voice) {
                    Some(track) => core
                        .device
                        .lock()
                        .expect("device poisoned")
                        .set_track_mute(track, muted),
                    None => {
                        log::debug!("handle_mix_event() no track for voice '{voice}', skipped")
                    }
                }
            }
            structural => {
                {
                    let mut s = session.lock().expect("session poisoned");
                    s.mark_dirty();
                    if matches!(structural, MixEvent::ChannelReassigned) {
                        s.clear_voice_tracks();
                    }
                }
                // A paused session that no longer matches the model cannot be
                // resumed; drop back to Stopped right away.
                if core.state == PlaybackState::Paused {
                    stop_core(shared, &mut core);
                }
            }
        }
    }

    /// Set the key transposition applied to generated music, in `[-11, 0]`.
    pub fn set_playback_key_transposition(&self, t: i8) -> Result<()> {
        self.prefs
            .lock()
            .expect("preferences poisoned")
            .set_key_transposition(t)?;
        let core = self.shared.lock_core();
        if let Some(session) = &core.session {
            session.lock().expect("session poisoned").mark_dirty();
        }
        Ok(())
    }

    pub fn playback_key_transposition(&self) -> i8 {
        self.prefs
            .lock()
            .expect("preferences poisoned")
            .key_transposition()
    }

    /// Set the output latency used for listener dispatch, in milliseconds.
    pub fn set_output_latency(&self, millis: u32) {
        self.shared.latency.set_millis(millis);
    }

    pub fn output_latency(&self) -> u32 {
        self.shared.latency.millis()
    }

    // ----- queries ----------------------------------------------------------

    pub fn state(&self) -> PlaybackState {
        self.shared.lock_core().state
    }

    /// The current musical position, updated on every beat.
    pub fn beat_position(&self) -> Position {
        self.shared.lock_core().position
    }

    /// The armed session, if any.
    pub fn session(&self) -> Option<SharedSession> {
        self.shared.lock_core().session.clone()
    }

    /// The song context of the armed session, if any.
    pub fn context(&self) -> Option<Arc<SongContext>> {
        self.shared
            .lock_core()
            .session
            .as_ref()
            .and_then(|s| s.lock().expect("session poisoned").song_context().cloned())
    }

    pub fn loop_count(&self) -> Option<i32> {
        self.shared
            .lock_core()
            .session
            .as_ref()
            .map(|s| s.lock().expect("session poisoned").loop_count())
    }

    // ----- listeners ---------------------------------------------------------

    pub fn add_state_listener(&self, listener: Arc<dyn StateListener>) {
        self.shared.state_listeners.add(listener);
    }

    pub fn remove_state_listener(&self, listener: &Arc<dyn StateListener>) {
        self.shared.state_listeners.remove(listener);
    }

    pub fn add_note_listener(&self, listener: Arc<dyn NoteListener>) {
        self.shared.note_listeners.add(listener);
    }

    pub fn remove_note_listener(&self, listener: &Arc<dyn NoteListener>) {
        self.shared.note_listeners.remove(listener);
    }

    pub fn add_playback_listener(&self, listener: Arc<dyn PlaybackListener>) {
        self.shared.playback_listeners.add(listener);
    }

    pub fn remove_playback_listener(&self, listener: &Arc<dyn PlaybackListener>) {
        self.shared.playback_listeners.remove(listener);
    }

    pub fn add_pre_playback_veto(&self, veto: Arc<dyn PrePlaybackVeto>) {
        self.shared.vetoes.add(veto);
    }

    pub fn remove_pre_playback_veto(&self, veto: &Arc<dyn PrePlaybackVeto>) {
        self.shared.vetoes.remove(veto);
    }

    // ----- internals -----------------------------------------------------------

    fn check_startable(&self) -> Result<()> {
        let core = self.shared.lock_core();
        match core.state {
            PlaybackState::Playing => Err(PlaybackError::AlreadyPlaying),
            PlaybackState::Disabled => Err(PlaybackError::PlaybackDisabled {
                holder: core.device_holder.clone().unwrap_or_default(),
            }),
            _ => {
                if !core.device.lock().expect("device poisoned").has_output() {
                    return Err(PlaybackError::NoOutputDevice);
                }
                Ok(())
            }
        }
    }

    fn run_vetoes(&self, context: &SongContext) -> Result<()> {
        for veto in self.shared.vetoes.snapshot() {
            if let Err(v) = veto.check_playback(context) {
                log::debug!("playback vetoed: {:?}", v.reason);
                return Err(PlaybackError::Vetoed { reason: v.reason });
            }
        }
        Ok(())
    }

    /// (Re)generate the session when it is new, outdated or dirty.
    fn regenerate_if_needed(&self, session: &SharedSession) -> Result<()> {
        let mut s = session.lock().expect("session poisoned");
        if s.is_dirty() {
            s.mark_outdated();
        }
        s.generate()
    }

    fn arm_and_start(&self, session: &SharedSession, at: StartAt) -> Result<()> {
        let shared = &self.shared;
        let mut core = shared.lock_core();
        match core.state {
            PlaybackState::Playing => return Err(PlaybackError::AlreadyPlaying),
            PlaybackState::Disabled => {
                return Err(PlaybackError::PlaybackDisabled {
                    holder: core.device_holder.clone().unwrap_or_default(),
                })
            }
            _ => {}
        }

        // Replacing the armed session releases the old one
        if let Some(old) = core.session.clone() {
            if !Arc::ptr_eq(&old, session) {
                old.lock().expect("session poisoned").cleanup();
            }
        }

        let s = session.lock().expect("session poisoned");
        let sequence = Arc::clone(s.sequence().ok_or(PlaybackError::NothingToPlay)?);
        let tick_range = s.tick_range();
        let (start_tick, start_position) = match at {
            StartAt::Bar(bar) => {
                let ctx = s.song_context().ok_or(PlaybackError::NothingToPlay)?;
                // Starting at the very first bar includes the precount
                let tick = if bar == ctx.bar_range.from {
                    tick_range.start
                } else {
                    s.tick_at_bar(bar).ok_or(PlaybackError::BarOutOfRange {
                        bar,
                        from: ctx.bar_range.from,
                        to: ctx.bar_range.to,
                    })?
                };
                (tick, Position::new(bar, 0.0))
            }
            StartAt::Tick(tick) => {
                let position = s
                    .song_context()
                    .and_then(|ctx| ctx.position_map.position_at_tick(tick))
                    .unwrap_or_default();
                (tick, position)
            }
        };

        {
            let mut device = core.device.lock().expect("device poisoned");
            device.load(sequence, tick_range)?;
            device.set_loop(TickRange::new(0, tick_range.end), s.loop_count());
            if let Some(ctx) = s.song_context() {
                for voice in &ctx.voices {
                    if voice.muted {
                        match s.track_for_voice(&voice.id) {
                            Some(track) => device.set_track_mute(track, true),
                            None => log::debug!("no track for muted voice '{}'", voice.id),
                        }
                    }
                }
            }
            device.set_tick_position(start_tick)?;
        }

        if let Some(ctx) = s.song_context() {
            core.song_tempo_factor = ctx.tempo_bpm / SEQUENCER_REF_TEMPO;
            core.song_part_tempo_factor = ctx
                .part_at_bar(start_position.bar)
                .map(|p| p.tempo_factor)
                .unwrap_or(1.0);
        } else {
            core.song_tempo_factor = 1.0;
            core.song_part_tempo_factor = 1.0;
        }
        shared.apply_tempo(&core);
        core.position = start_position;

        if let Some(ctx) = s.song_context() {
            announce_position(shared, ctx, start_position);
        }
        drop(s);

        core.device.lock().expect("device poisoned").start()?;
        core.session = Some(Arc::clone(session));
        shared.set_state(&mut core, PlaybackState::Playing);
        Ok(())
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        {
            let mut core = self.shared.lock_core();
            let mut device = core.device.lock().expect("device poisoned");
            device.stop();
            device.set_event_sink(None);
            drop(device);
            core.event_tx = None;
        }
        if let Some(pump) = self.pump.take() {
            if pump.join().is_err() {
                log::warn!("device event pump panicked");
            }
        }
    }
}

/// Announce the chord symbol in effect and the song part at `position`,
/// fired on every (re)start before any beat marker arrives.
fn announce_position(shared: &Shared, ctx: &SongContext, position: Position) {
    if let Some(chord) = ctx.chord_in_effect(&position).cloned() {
        shared.notify_playback(move |l| l.chord_symbol_changed(&chord));
    }
    if let Some(part) = ctx.part_at_bar(position.bar).cloned() {
        shared.notify_playback(move |l| l.song_part_changed(&part));
    }
}

fn stop_core(shared: &Shared, core: &mut Core) {
    if core.state == PlaybackState::Disabled {
        return;
    }
    core.device.lock().expect("device poisoned").stop();
    shared.dispatcher.cancel_pending();
    if let Some(session) = core.session.clone() {
        let s = session.lock().expect("session poisoned");
        if let Err(e) = core
            .device
            .lock()
            .expect("device poisoned")
            .set_tick_position(s.tick_range().start)
        {
            log::warn!("could not rewind the device: {e}");
        }
        core.position = s
            .song_context()
            .map(|ctx| Position::new(ctx.bar_range.from, 0.0))
            .unwrap_or_default();
    }
    shared.set_state(core, PlaybackState::Stopped);
}

/// Translate one raw device event into musical notifications.
///
/// Runs on the dispatcher thread.
fn translate_event(shared: &Arc<Shared>, event: DeviceEvent) {
    match event {
        DeviceEvent::NoteOn {
            channel,
            pitch,
            velocity,
        } => {
            shared.notify_notes(move |l| l.note_on(channel, pitch, velocity));
            register_activity(shared, channel);
        }
        DeviceEvent::NoteOff { channel, pitch } => {
            shared.notify_notes(move |l| l.note_off(channel, pitch));
        }
        DeviceEvent::Controller {
            controller: CTRL_BEAT_MARKER,
            tick,
            ..
        } => handle_beat(shared, tick),
        DeviceEvent::Controller {
            controller: CTRL_TEMPO_FACTOR,
            value,
            ..
        } => {
            let mut core = shared.lock_core();
            core.song_part_tempo_factor = tempo_factor_from_value(value);
            shared.apply_tempo(&core);
        }
        DeviceEvent::Controller { controller, .. } => {
            log::trace!("ignoring controller {controller}");
        }
        DeviceEvent::Marker { text, .. } => handle_marker(shared, &text),
        DeviceEvent::EndOfTrack => {
            log::debug!("end of track reached");
            let mut core = shared.lock_core();
            stop_core(shared, &mut core);
        }
    }
}

fn handle_beat(shared: &Shared, tick: i64) {
    let (old, new) = {
        let mut core = shared.lock_core();
        if core.state != PlaybackState::Playing {
            return;
        }
        let Some(session) = core.session.clone() else {
            return;
        };
        let s = session.lock().expect("session poisoned");
        let Some(new) = s.position_at_beat_index(beat_index_at_tick(tick)) else {
            return;
        };
        let old = core.position;
        core.position = new;
        (old, new)
    };
    // Beat first, then bar, for the same device tick. The bar notification
    // goes out whenever the new beat opens a bar, even for the same bar
    // (start position, one-bar loop wrap).
    shared.notify_playback(move |l| l.beat_changed(old, new));
    if new.is_first_bar_beat() {
        shared.notify_playback(move |l| l.bar_changed(old.bar, new.bar));
    }
}

fn handle_marker(shared: &Shared, text: &str) {
    let Some(index) = parse_chord_marker(text) else {
        log::warn!("unrecognized sequence marker '{text}'");
        return;
    };
    let (chord, part) = {
        let core = shared.lock_core();
        if core.state != PlaybackState::Playing {
            return;
        }
        let Some(session) = core.session.clone() else {
            return;
        };
        let s = session.lock().expect("session poisoned");
        let Some(ctx) = s.song_context() else {
            return;
        };
        let Some(chord) = ctx.chord_at_index(index) else {
            log::warn!("chord marker index {index} out of range");
            return;
        };
        // A chord on a bar's first beat may also open a song part; the chord
        // notification goes out first
        let part = if chord.position.is_first_bar_beat() {
            ctx.part_starting_at_bar(chord.position.bar).cloned()
        } else {
            None
        };
        (chord.clone(), part)
    };
    shared.notify_playback(move |l| l.chord_symbol_changed(&chord));
    if let Some(part) = part {
        shared.notify_playback(move |l| l.song_part_changed(&part));
    }
}

fn register_activity(shared: &Shared, channel: u8) {
    let now = Instant::now();
    {
        let mut core = shared.lock_core();
        if let Some(last) = core.last_activity.get(&channel) {
            if now.duration_since(*last) < ACTIVITY_MIN_PERIOD {
                return;
            }
        }
        core.last_activity.insert(channel, now);
    }
    shared.notify_playback(move |l| l.midi_activity(channel));
}
