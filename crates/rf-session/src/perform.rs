//! Event dispatch
//!
//! Note events walk a track's device chain in order:
//! - MIDI devices pass events on, transposed
//! - an instrument consumes them, starting and releasing voice synths
//! - a rack fans them out to every chain
//!
//! A bypassed MIDI device passes events on untouched; a bypassed instrument
//! swallows them.
//!
//! Events left over at the end of a chain are dropped.

use rf_core::{DeviceKind, MixerError, MixerResult, NodeId};

use crate::engine::{Control, Placement};
use crate::tree::{ContainerRole, NodeBody, Tree};

/// Note event delivered into a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoteEvent {
    On { note: u8, velocity: u8 },
    Off { note: u8 },
}

impl NoteEvent {
    pub fn note(&self) -> u8 {
        match self {
            NoteEvent::On { note, .. } | NoteEvent::Off { note } => *note,
        }
    }

    /// Shift by `semitones`; `None` when the result leaves the MIDI range
    fn transposed(&self, semitones: i8) -> Option<NoteEvent> {
        let note = u8::try_from(i16::from(self.note()) + i16::from(semitones)).ok()?;
        if note > 127 {
            return None;
        }
        Some(match *self {
            NoteEvent::On { velocity, .. } => NoteEvent::On { note, velocity },
            NoteEvent::Off { .. } => NoteEvent::Off { note },
        })
    }
}

/// Equal-tempered frequency of a MIDI note, A4 = 440 Hz
pub fn note_to_frequency(note: u8) -> f32 {
    440.0 * 2f32.powf((f32::from(note) - 69.0) / 12.0)
}

/// What one `perform` call did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PerformReport {
    pub voices_started: usize,
    pub voices_released: usize,
    /// Events that reached the end of a chain unconsumed
    pub dropped: usize,
}

impl Tree {
    /// Deliver `events` into `track` (a track or chain)
    pub(crate) fn perform(&mut self, track: NodeId, events: &[NoteEvent]) -> MixerResult<PerformReport> {
        self.track(track)?;
        if !self.is_bound(track) {
            return Err(MixerError::NotBooted(self.application_of(track).unwrap_or(track)));
        }
        let mut report = PerformReport::default();
        self.run_chain(track, events.to_vec(), &mut report);
        Ok(report)
    }

    fn run_chain(&mut self, track: NodeId, mut events: Vec<NoteEvent>, report: &mut PerformReport) {
        let devices = self
            .part(track, ContainerRole::Devices)
            .map(|d| self.children(d).to_vec())
            .unwrap_or_default();
        for device in devices {
            if events.is_empty() {
                return;
            }
            match self.body(device) {
                Some(NodeBody::Device(body)) => match body.kind {
                    DeviceKind::Midi if !body.is_active => {}
                    DeviceKind::Instrument if !body.is_active => {
                        report.dropped += events.len();
                        return;
                    }
                    DeviceKind::Midi => {
                        let shift = body.transpose;
                        let before = events.len();
                        events = events.iter().filter_map(|e| e.transposed(shift)).collect();
                        report.dropped += before - events.len();
                    }
                    DeviceKind::Instrument => {
                        self.play(track, device, &events, report);
                        return;
                    }
                    DeviceKind::Audio => {}
                },
                Some(NodeBody::Rack(_)) => {
                    let chains = self
                        .part(device, ContainerRole::Chains)
                        .map(|c| self.children(c).to_vec())
                        .unwrap_or_default();
                    if chains.is_empty() {
                        report.dropped += events.len();
                    }
                    for chain in chains {
                        self.run_chain(chain, events.clone(), report);
                    }
                    return;
                }
                _ => {}
            }
        }
        report.dropped += events.len();
    }

    /// Start or release voices of `instrument` writing into `track`'s output
    fn play(&mut self, track: NodeId, instrument: NodeId, events: &[NoteEvent], report: &mut PerformReport) {
        let (Some(group), Some(out), Some(binding)) = (
            self.handle(instrument),
            self.output_bus(track),
            self.binding(instrument).cloned(),
        ) else {
            log::warn!("{} is not allocated", self.label(instrument));
            report.dropped += events.len();
            return;
        };
        let program = match self.body(instrument) {
            Some(NodeBody::Device(d)) => d.program.clone(),
            _ => None,
        };
        let Some(program) = program else {
            report.dropped += events.len();
            return;
        };
        let Ok(node) = self.node_mut(instrument) else {
            return;
        };
        let NodeBody::Device(device) = &mut node.body else {
            return;
        };
        for event in events {
            match *event {
                NoteEvent::On { note, velocity } => {
                    if let Some(previous) = device.voices.remove(&note) {
                        binding.engine.set_control(previous, "gate", 0.0);
                        report.voices_released += 1;
                    }
                    let voice = binding.engine.allocate_synth(
                        Placement::tail(group),
                        &program,
                        &[
                            ("out", Control::Bus(out.start)),
                            ("gate", Control::Value(1.0)),
                            ("frequency", Control::Value(note_to_frequency(note))),
                            ("amplitude", Control::Value(f32::from(velocity) / 127.0)),
                        ],
                    );
                    device.voices.insert(note, voice);
                    device.voice_bus = Some(out.start);
                    report.voices_started += 1;
                }
                NoteEvent::Off { note } => match device.voices.remove(&note) {
                    Some(voice) => {
                        binding.engine.set_control(voice, "gate", 0.0);
                        report.voices_released += 1;
                    }
                    None => report.dropped += 1,
                },
            }
        }
    }
}
