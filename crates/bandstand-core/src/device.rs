//! The sequencer device seam and its software implementation.
//!
//! [`SequencerDevice`] is the engine's only view of MIDI playback hardware:
//! load a sequence, position the transport, start/stop, mute tracks, scale
//! tempo. Events observed during playback (notes, control-track markers,
//! end of track) are pushed as [`DeviceEvent`] values into a crossbeam
//! channel sink; the device never calls back into the engine directly.
//!
//! [`VirtualSequencer`] is the bundled implementation: a software transport
//! thread walking the loaded sequence in tick order at the reference tempo
//! scaled by the tempo factor, optionally forwarding note traffic to a real
//! MIDI output port through `midir`.

use crate::error::{PlaybackError, Result};
use crate::sequence::{EventKind, MidiSequence};
use crate::timing::{TickRange, PPQ_RESOLUTION, SEQUENCER_REF_TEMPO};
use crossbeam_channel::{RecvTimeoutError, Sender};
use midir::{MidiOutput, MidiOutputConnection};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// An event observed by the device during playback.
///
/// `tick` is relative to the start of the musical range (negative during a
/// precount), matching the tick space of the loaded sequence.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceEvent {
    NoteOn { channel: u8, pitch: u8, velocity: u8 },
    NoteOff { channel: u8, pitch: u8 },
    Controller { controller: u8, value: u8, tick: i64 },
    Marker { text: String, tick: i64 },
    EndOfTrack,
}

/// A device handle shared between the engine and an external acquirer.
pub type SharedDevice = Arc<Mutex<Box<dyn SequencerDevice>>>;

/// Transport-level MIDI sequencer abstraction.
///
/// All tick arguments are in the tick space of the loaded sequence. The
/// device plays at [`SEQUENCER_REF_TEMPO`] scaled by the tempo factor.
pub trait SequencerDevice: Send {
    /// Load a sequence and its playable tick range, replacing any previous one.
    fn load(&mut self, sequence: Arc<MidiSequence>, tick_range: TickRange) -> Result<()>;

    /// Move the transport to `tick`. Only valid while stopped.
    fn set_tick_position(&mut self, tick: i64) -> Result<()>;

    /// Current transport tick.
    fn tick_position(&self) -> i64;

    /// Configure looping over `range`, `count` additional passes
    /// ([`LOOP_FOREVER`] for endless).
    ///
    /// [`LOOP_FOREVER`]: crate::session::LOOP_FOREVER
    fn set_loop(&mut self, range: TickRange, count: i32);

    /// Mute or unmute a track by index.
    fn set_track_mute(&mut self, track: usize, mute: bool);

    /// Scale the reference tempo by `factor`.
    fn set_tempo_factor(&mut self, factor: f32);

    /// Start playing from the current transport position.
    fn start(&mut self) -> Result<()>;

    /// Stop playing, keeping the transport position.
    fn stop(&mut self);

    fn is_running(&self) -> bool;

    /// Attach or detach the channel receiving [`DeviceEvent`]s.
    fn set_event_sink(&mut self, sink: Option<Sender<DeviceEvent>>);

    /// True if the device can deliver audible or observable output.
    fn has_output(&self) -> bool;
}

/// Open a MIDI output connection whose port name contains `name_fragment`.
pub fn open_output(name_fragment: &str) -> Result<MidiOutputConnection> {
    let output = MidiOutput::new("bandstand")
        .map_err(|e| PlaybackError::Device(e.to_string()))?;
    let port = output
        .ports()
        .into_iter()
        .find(|p| {
            output
                .port_name(p)
                .map(|n| n.contains(name_fragment))
                .unwrap_or(false)
        })
        .ok_or_else(|| {
            PlaybackError::Device(format!("no MIDI output port matching '{name_fragment}'"))
        })?;
    output
        .connect(&port, "bandstand-out")
        .map_err(|e| PlaybackError::Device(e.to_string()))
}

struct SequencerState {
    sequence: Option<Arc<MidiSequence>>,
    position: i64,
    tempo_factor: f32,
    muted: HashSet<usize>,
    loop_config: Option<(TickRange, i32)>,
    sink: Option<Sender<DeviceEvent>>,
    output: Option<MidiOutputConnection>,
}

/// Software sequencer: a transport thread walking the sequence in tick order.
pub struct VirtualSequencer {
    state: Arc<Mutex<SequencerState>>,
    stop_tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl VirtualSequencer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SequencerState {
                sequence: None,
                position: 0,
                tempo_factor: 1.0,
                muted: HashSet::new(),
                loop_config: None,
                sink: None,
                output: None,
            })),
            stop_tx: None,
            worker: None,
        }
    }

    /// Attach a real MIDI output for note traffic.
    pub fn set_output(&mut self, output: Option<MidiOutputConnection>) {
        self.lock_state().output = output;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SequencerState> {
        self.state.lock().expect("sequencer state poisoned")
    }

    fn join_worker(&mut self) {
        self.stop_tx = None; // dropping the sender wakes the worker
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("sequencer transport thread panicked");
            }
        }
    }
}

impl Default for VirtualSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for VirtualSequencer {
    fn drop(&mut self) {
        self.join_worker();
    }
}

impl SequencerDevice for VirtualSequencer {
    fn load(&mut self, sequence: Arc<MidiSequence>, tick_range: TickRange) -> Result<()> {
        if self.is_running() {
            return Err(PlaybackError::Device(
                "cannot load a sequence while running".to_string(),
            ));
        }
        let mut state = self.lock_state();
        state.position = tick_range.start;
        state.sequence = Some(sequence);
        state.muted.clear();
        state.loop_config = None;
        Ok(())
    }

    fn set_tick_position(&mut self, tick: i64) -> Result<()> {
        if self.is_running() {
            return Err(PlaybackError::Device(
                "cannot reposition while running".to_string(),
            ));
        }
        self.lock_state().position = tick;
        Ok(())
    }

    fn tick_position(&self) -> i64 {
        self.lock_state().position
    }

    fn set_loop(&mut self, range: TickRange, count: i32) {
        self.lock_state().loop_config = Some((range, count));
    }

    fn set_track_mute(&mut self, track: usize, mute: bool) {
        let mut state = self.lock_state();
        if mute {
            state.muted.insert(track);
        } else {
            state.muted.remove(&track);
        }
    }

    fn set_tempo_factor(&mut self, factor: f32) {
        self.lock_state().tempo_factor = factor.max(0.01);
    }

    fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        if self.lock_state().sequence.is_none() {
            return Err(PlaybackError::Device("no sequence loaded".to_string()));
        }
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let state = Arc::clone(&self.state);
        self.worker = Some(thread::spawn(move || transport_loop(state, stop_rx)));
        self.stop_tx = Some(stop_tx);
        Ok(())
    }

    fn stop(&mut self) {
        self.join_worker();
    }

    fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map(|w| !w.is_finished())
            .unwrap_or(false)
    }

    fn set_event_sink(&mut self, sink: Option<Sender<DeviceEvent>>) {
        self.lock_state().sink = sink;
    }

    fn has_output(&self) -> bool {
        let state = self.lock_state();
        state.output.is_some() || state.sink.is_some()
    }
}

/// Duration of one device tick at the reference tempo scaled by `factor`.
fn tick_duration(factor: f32) -> Duration {
    let beat_secs = 60.0 / (SEQUENCER_REF_TEMPO as f64 * factor as f64);
    Duration::from_secs_f64(beat_secs / PPQ_RESOLUTION as f64)
}

/// Flattened view of the sequence: (tick, track index, event).
fn merge_events(sequence: &MidiSequence) -> Vec<(i64, usize, EventKind)> {
    let mut events: Vec<(i64, usize, EventKind)> = Vec::new();
    for (track_index, track) in sequence.tracks().iter().enumerate() {
        for event in track.events() {
            events.push((event.tick, track_index, event.kind.clone()));
        }
    }
    events.sort_by_key(|(tick, track, _)| (*tick, *track));
    events
}

fn transport_loop(state: Arc<Mutex<SequencerState>>, stop_rx: crossbeam_channel::Receiver<()>) {
    let (events, mut position) = {
        let state = state.lock().expect("sequencer state poisoned");
        let sequence = match &state.sequence {
            Some(s) => Arc::clone(s),
            None => return,
        };
        (merge_events(&sequence), state.position)
    };

    let mut index = events.partition_point(|(tick, _, _)| *tick < position);
    let mut loops_left = {
        let state = state.lock().expect("sequencer state poisoned");
        state.loop_config.map(|(_, count)| count).unwrap_or(0)
    };

    loop {
        let Some((tick, track, kind)) = events.get(index).cloned() else {
            emit(&state, DeviceEvent::EndOfTrack);
            return;
        };

        // Sleep up to the event tick, bailing out promptly on stop()
        let delta = tick - position;
        if delta > 0 {
            let factor = state.lock().expect("sequencer state poisoned").tempo_factor;
            let wait = tick_duration(factor) * delta as u32;
            match stop_rx.recv_timeout(wait) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
        position = tick;
        state.lock().expect("sequencer state poisoned").position = tick;

        if matches!(kind, EventKind::EndOfTrack) {
            let loop_start = {
                let state = state.lock().expect("sequencer state poisoned");
                state.loop_config.map(|(range, _)| range.start)
            };
            if let Some(start) = loop_start {
                if loops_left != 0 {
                    if loops_left > 0 {
                        loops_left -= 1;
                    }
                    position = start;
                    state.lock().expect("sequencer state poisoned").position = start;
                    index = events.partition_point(|(tick, _, _)| *tick < start);
                    continue;
                }
            }
            emit(&state, DeviceEvent::EndOfTrack);
            return;
        }

        deliver(&state, tick, track, &kind);
        index += 1;
    }
}

fn deliver(state: &Arc<Mutex<SequencerState>>, tick: i64, track: usize, kind: &EventKind) {
    let muted = {
        let state = state.lock().expect("sequencer state poisoned");
        state.muted.contains(&track)
    };
    match kind {
        EventKind::NoteOn {
            channel,
            pitch,
            velocity,
        } => {
            if muted {
                return;
            }
            send_midi(state, &[0x90 | (channel & 0x0F), *pitch, *velocity]);
            emit(
                state,
                DeviceEvent::NoteOn {
                    channel: *channel,
                    pitch: *pitch,
                    velocity: *velocity,
                },
            );
        }
        EventKind::NoteOff { channel, pitch } => {
            if muted {
                return;
            }
            send_midi(state, &[0x80 | (channel & 0x0F), *pitch, 0]);
            emit(
                state,
                DeviceEvent::NoteOff {
                    channel: *channel,
                    pitch: *pitch,
                },
            );
        }
        EventKind::Controller { controller, value } => {
            // Control-track events are internal, never sent to the MIDI port
            emit(
                state,
                DeviceEvent::Controller {
                    controller: *controller,
                    value: *value,
                    tick,
                },
            );
        }
        EventKind::Marker(text) => {
            emit(
                state,
                DeviceEvent::Marker {
                    text: text.clone(),
                    tick,
                },
            );
        }
        EventKind::EndOfTrack => {}
    }
}

fn emit(state: &Arc<Mutex<SequencerState>>, event: DeviceEvent) {
    let sink = {
        let state = state.lock().expect("sequencer state poisoned");
        state.sink.clone()
    };
    if let Some(sink) = sink {
        if sink.send(event).is_err() {
            log::warn!("device event sink disconnected");
        }
    }
}

fn send_midi(state: &Arc<Mutex<SequencerState>>, message: &[u8]) {
    let mut state = state.lock().expect("sequencer state poisoned");
    if let Some(output) = state.output.as_mut() {
        if let Err(e) = output.send(message) {
            log::warn!("MIDI output send failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::SequenceTrack;
    use std::time::Instant;

    fn tiny_sequence() -> Arc<MidiSequence> {
        let mut sequence = MidiSequence::new();
        let mut notes = SequenceTrack::new("notes");
        notes.add_event(
            0,
            EventKind::NoteOn {
                channel: 1,
                pitch: 60,
                velocity: 90,
            },
        );
        notes.add_event(PPQ_RESOLUTION / 8, EventKind::NoteOff { channel: 1, pitch: 60 });
        sequence.add_track(notes);
        let mut control = SequenceTrack::new("control");
        control.add_event(PPQ_RESOLUTION / 4, EventKind::EndOfTrack);
        sequence.add_track(control);
        Arc::new(sequence)
    }

    fn drain_until_eot(
        rx: &crossbeam_channel::Receiver<DeviceEvent>,
    ) -> Vec<DeviceEvent> {
        let mut events = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(DeviceEvent::EndOfTrack) => {
                    events.push(DeviceEvent::EndOfTrack);
                    return events;
                }
                Ok(e) => events.push(e),
                Err(_) => {}
            }
        }
        events
    }

    #[test]
    fn test_plays_events_in_order_and_signals_end() {
        let mut device = VirtualSequencer::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        device.set_event_sink(Some(tx));
        device
            .load(tiny_sequence(), TickRange::new(0, PPQ_RESOLUTION / 4))
            .unwrap();
        device.set_tempo_factor(4.0); // keep the test fast
        device.start().unwrap();
        let events = drain_until_eot(&rx);
        assert!(matches!(events.first(), Some(DeviceEvent::NoteOn { pitch: 60, .. })));
        assert!(matches!(events.get(1), Some(DeviceEvent::NoteOff { pitch: 60, .. })));
        assert_eq!(events.last(), Some(&DeviceEvent::EndOfTrack));
    }

    #[test]
    fn test_muted_track_skips_notes() {
        let mut device = VirtualSequencer::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        device.set_event_sink(Some(tx));
        device
            .load(tiny_sequence(), TickRange::new(0, PPQ_RESOLUTION / 4))
            .unwrap();
        device.set_track_mute(0, true);
        device.set_tempo_factor(4.0);
        device.start().unwrap();
        let events = drain_until_eot(&rx);
        assert_eq!(events, vec![DeviceEvent::EndOfTrack]);
    }

    #[test]
    fn test_stop_keeps_position() {
        let mut device = VirtualSequencer::new();
        let (tx, _rx) = crossbeam_channel::unbounded();
        device.set_event_sink(Some(tx));

        // A long sequence so stop() lands mid-flight
        let mut sequence = MidiSequence::new();
        let mut control = SequenceTrack::new("control");
        control.add_event(100 * PPQ_RESOLUTION, EventKind::EndOfTrack);
        sequence.add_track(control);
        device
            .load(Arc::new(sequence), TickRange::new(0, 100 * PPQ_RESOLUTION))
            .unwrap();
        device.set_tick_position(7 * PPQ_RESOLUTION).unwrap();
        device.start().unwrap();
        assert!(device.is_running());
        device.stop();
        assert!(!device.is_running());
        assert!(device.tick_position() >= 7 * PPQ_RESOLUTION);
    }

    #[test]
    fn test_guards() {
        let mut device = VirtualSequencer::new();
        assert!(device.start().is_err()); // nothing loaded

        device
            .load(tiny_sequence(), TickRange::new(0, PPQ_RESOLUTION / 4))
            .unwrap();
        // No sink and no output port
        assert!(!device.has_output());
        let (tx, _rx) = crossbeam_channel::unbounded();
        device.set_event_sink(Some(tx));
        assert!(device.has_output());
    }

    #[test]
    fn test_looping_repeats_range() {
        let mut device = VirtualSequencer::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        device.set_event_sink(Some(tx));
        let range = TickRange::new(0, PPQ_RESOLUTION / 4);
        device.load(tiny_sequence(), range).unwrap();
        device.set_loop(range, 1); // one extra pass
        device.set_tempo_factor(4.0);
        device.start().unwrap();
        let events = drain_until_eot(&rx);
        let note_ons = events
            .iter()
            .filter(|e| matches!(e, DeviceEvent::NoteOn { .. }))
            .count();
        assert_eq!(note_ons, 2);
    }
}
