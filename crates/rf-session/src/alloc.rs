//! Four-phase allocation protocol
//!
//! - `pre_allocate`: bind, reserve buses, create groups/synths, recurse
//! - `post_allocate`: wiring that needs the rest of the tree (meters,
//!   transport, sends, receives), recurse, mark `Ready`
//! - `reallocate`: idempotent re-synchronization against logical state
//! - `free`: unregister, recurse, release buses, unbind
//!
//! Every phase is a no-op on unbound nodes, so calls against a session that
//! has not booted leave the logical tree intact.

use std::sync::Arc;

use rf_core::{BusId, BusRange, DeviceKind, NodeId};

use crate::engine::{Control, Engine, Placement, Transport};
use crate::tree::{AllocationState, Binding, NodeBody, StageKind, SynthSignature, Tree};
use crate::track::TrackKind;

/// Synth a node should currently be running
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SynthSpec {
    pub program: String,
    pub buses: Vec<(&'static str, BusId)>,
    pub values: Vec<(&'static str, f32)>,
}

impl SynthSpec {
    pub fn signature(&self) -> SynthSignature {
        SynthSignature {
            program: self.program.clone(),
            buses: self.buses.clone(),
        }
    }

    fn controls(&self) -> Vec<(&'static str, Control)> {
        self.buses
            .iter()
            .map(|(k, b)| (*k, Control::Bus(*b)))
            .chain(self.values.iter().map(|(k, v)| (*k, Control::Value(*v))))
            .collect()
    }
}

/// Shape of a node's remote object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteForm {
    /// Group at the engine root
    Session,
    /// Group at its tree position
    Group,
    /// Group plus owned bus ranges
    GroupWithBuses,
    /// Synth derived from `expected_synth`
    Synth,
    /// No remote object of its own
    None,
}

impl Tree {
    fn remote_form(&self, id: NodeId) -> RemoteForm {
        match self.body(id) {
            Some(NodeBody::Application(_)) => RemoteForm::Session,
            Some(NodeBody::Container(_)) => RemoteForm::Group,
            Some(NodeBody::Track(_) | NodeBody::Rack(_)) => RemoteForm::GroupWithBuses,
            Some(
                NodeBody::Stage(_)
                | NodeBody::DirectOut(_)
                | NodeBody::Send(_)
                | NodeBody::Patch(_)
                | NodeBody::DirectIn(_),
            ) => RemoteForm::Synth,
            Some(NodeBody::Device(d)) => match d.kind {
                DeviceKind::Midi => RemoteForm::None,
                DeviceKind::Instrument => RemoteForm::Group,
                DeviceKind::Audio => RemoteForm::Synth,
            },
            None => RemoteForm::None,
        }
    }

    fn engine_of(&self, id: NodeId) -> Option<Arc<dyn Engine>> {
        self.binding(id).map(|b| Arc::clone(&b.engine))
    }

    /// Placement after the nearest earlier sibling that owns a handle,
    /// otherwise at the head of the parent's group
    pub(crate) fn place(&self, id: NodeId) -> Option<Placement> {
        let parent = self.parent(id)?;
        let parent_handle = self.handle(parent)?;
        let siblings = self.children(parent);
        let position = siblings.iter().position(|c| *c == id)?;
        for sibling in siblings[..position].iter().rev() {
            if let Some(handle) = self.handle(*sibling) {
                return Some(Placement::after(handle));
            }
        }
        Some(Placement::head(parent_handle))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // PHASES
    // ═══════════════════════════════════════════════════════════════════════

    /// Bind `id` and its subtree to `binding`'s engine.
    ///
    /// Returns `false` when the node was already bound to that engine.
    pub(crate) fn pre_allocate(&mut self, id: NodeId, binding: &Binding) -> bool {
        if let Some(current) = self.binding(id).cloned() {
            if current.same_engine(binding) {
                if current.application != binding.application {
                    self.rebind_application(id, binding.application);
                }
                return false;
            }
            self.free(id);
        }
        log::debug!("pre_allocate {}", self.label(id));
        if let Ok(node) = self.node_mut(id) {
            node.binding = Some(binding.clone());
            node.state = AllocationState::Allocating;
        } else {
            return false;
        }
        self.allocate_own(id);
        for child in self.children(id).to_vec() {
            self.pre_allocate(child, binding);
        }
        true
    }

    /// Wire what needs the rest of the tree, then mark `Ready`
    pub(crate) fn post_allocate(&mut self, id: NodeId) {
        if !self.is_bound(id) {
            log::debug!("post_allocate skipped for unbound {}", self.label(id));
            return;
        }
        match self.body(id) {
            Some(NodeBody::Track(_)) => self.register_meters(id),
            Some(NodeBody::Device(_) | NodeBody::Rack(_)) => self.register_with_transport(id),
            Some(NodeBody::Send(_) | NodeBody::Patch(_)) => self.rewire(id),
            _ => {}
        }
        for child in self.children(id).to_vec() {
            self.post_allocate(child);
        }
        if let Ok(node) = self.node_mut(id) {
            node.state = AllocationState::Ready;
        }
    }

    /// Bring remote wiring in line with the logical tree. Produces no
    /// engine traffic when nothing changed.
    pub(crate) fn reallocate(&mut self, id: NodeId) {
        if !self.is_bound(id) {
            return;
        }
        match self.remote_form(id) {
            RemoteForm::GroupWithBuses => {
                self.sync_buses(id);
            }
            RemoteForm::Group => {
                if matches!(self.body(id), Some(NodeBody::Device(_))) {
                    self.sync_voices(id);
                }
            }
            RemoteForm::Synth => {
                if matches!(self.body(id), Some(NodeBody::Send(_) | NodeBody::Patch(_))) {
                    self.rewire(id);
                } else {
                    self.sync_synth(id);
                }
            }
            _ => {}
        }
        for child in self.children(id).to_vec() {
            self.reallocate(child);
        }
    }

    /// Release everything `id` and its subtree hold on the engine
    pub(crate) fn free(&mut self, id: NodeId) {
        self.free_inner(id, true);
    }

    fn free_inner(&mut self, id: NodeId, top: bool) {
        let Some(engine) = self.engine_of(id) else {
            return;
        };
        log::debug!("free {}", self.label(id));
        if let Ok(node) = self.node_mut(id) {
            node.state = AllocationState::Freeing;
        }
        match self.body(id) {
            Some(NodeBody::Track(_)) => self.unregister_meters(id),
            Some(NodeBody::Device(_) | NodeBody::Rack(_)) => self.unregister_with_transport(id),
            _ => {}
        }
        for child in self.children(id).to_vec() {
            self.free_inner(child, false);
        }
        // freeing a group frees its contents remotely
        if let Some(handle) = self.handle(id) {
            if top {
                engine.free(handle);
            }
        }
        self.release_buses(id);
        if let Ok(node) = self.node_mut(id) {
            node.resources.handle = None;
            node.resources.signature = None;
            node.binding = None;
            node.state = AllocationState::Unbound;
            match &mut node.body {
                NodeBody::Send(send) => send.wiring = None,
                NodeBody::Patch(patch) => patch.wiring = None,
                NodeBody::Device(device) => {
                    device.voices.clear();
                    device.voice_bus = None;
                }
                _ => {}
            }
        }
    }

    fn rebind_application(&mut self, id: NodeId, application: NodeId) {
        for node in self.subtree(id) {
            if let Ok(node) = self.node_mut(node) {
                if let Some(binding) = node.binding.as_mut() {
                    binding.application = application;
                }
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // OWN RESOURCES
    // ═══════════════════════════════════════════════════════════════════════

    fn allocate_own(&mut self, id: NodeId) {
        let Some(engine) = self.engine_of(id) else {
            return;
        };
        match self.remote_form(id) {
            RemoteForm::Session => {
                let handle = engine.allocate_group(Placement::tail(engine.root()), &self.label(id));
                self.set_handle(id, handle);
            }
            RemoteForm::Group => self.allocate_group(id, &engine),
            RemoteForm::GroupWithBuses => {
                self.allocate_buses(id, &engine);
                self.allocate_group(id, &engine);
            }
            RemoteForm::Synth => {
                // sends and receives wait for post_allocate, once every peer
                // has buses
                if !matches!(self.body(id), Some(NodeBody::Send(_) | NodeBody::Patch(_))) {
                    self.sync_synth(id);
                }
            }
            RemoteForm::None => {}
        }
    }

    fn allocate_group(&mut self, id: NodeId, engine: &Arc<dyn Engine>) {
        match self.place(id) {
            Some(placement) => {
                let handle = engine.allocate_group(placement, &self.label(id));
                self.set_handle(id, handle);
            }
            None => log::warn!("no remote parent for {}", self.label(id)),
        }
    }

    fn set_handle(&mut self, id: NodeId, handle: rf_core::HandleId) {
        if let Ok(node) = self.node_mut(id) {
            node.resources.handle = Some(handle);
        }
    }

    fn allocate_buses(&mut self, id: NodeId, engine: &Arc<dyn Engine>) {
        let count = self.effective_channel_count(id);
        let wants_input = match self.body(id) {
            Some(NodeBody::Track(t)) => t.kind != TrackKind::Chain,
            Some(NodeBody::Rack(_)) => true,
            _ => false,
        };
        let input = wants_input.then(|| BusRange {
            start: engine.allocate_bus_range(count),
            count,
        });
        let output = BusRange {
            start: engine.allocate_bus_range(count),
            count,
        };
        if let Ok(node) = self.node_mut(id) {
            node.resources.input_bus = input;
            node.resources.output_bus = Some(output);
        }
    }

    fn release_buses(&mut self, id: NodeId) {
        let Some(engine) = self.engine_of(id) else {
            return;
        };
        let Ok(node) = self.node_mut(id) else {
            return;
        };
        let ranges = [node.resources.input_bus.take(), node.resources.output_bus.take()];
        for range in ranges.into_iter().flatten() {
            engine.free_bus_range(range.start);
        }
    }

    /// Reallocate bus ranges whose width no longer matches the channel count
    fn sync_buses(&mut self, id: NodeId) -> bool {
        let count = self.effective_channel_count(id);
        if self.output_bus(id).is_some_and(|b| b.count == count) {
            return false;
        }
        let Some(engine) = self.engine_of(id) else {
            return false;
        };
        log::debug!("reallocate buses of {} at {count} channels", self.label(id));
        self.release_buses(id);
        self.allocate_buses(id, &engine);
        true
    }

    // ═══════════════════════════════════════════════════════════════════════
    // SYNTHS
    // ═══════════════════════════════════════════════════════════════════════

    /// Synth `id` should be running given the current tree
    pub(crate) fn expected_synth(&self, id: NodeId) -> Option<SynthSpec> {
        let programs = self.programs();
        match self.body(id)? {
            NodeBody::Stage(kind) => {
                let owner = self.parent(id)?;
                match kind {
                    StageKind::TrackInput => {
                        let count = self.effective_channel_count(owner);
                        let source = match self.body(owner) {
                            Some(NodeBody::Track(t)) if t.kind == TrackKind::Chain => {
                                self.input_bus(self.owning_rack(owner)?)?
                            }
                            _ => self.input_bus(owner)?,
                        };
                        Some(SynthSpec {
                            program: programs.track_input(count),
                            buses: vec![("in_", source.start), ("out", self.output_bus(owner)?.start)],
                            values: Vec::new(),
                        })
                    }
                    StageKind::TrackOutput => {
                        let count = self.effective_channel_count(owner);
                        let (active, gain) = match self.body(owner) {
                            Some(NodeBody::Track(t)) => (t.is_active, t.gain),
                            _ => (true, 1.0),
                        };
                        Some(SynthSpec {
                            program: programs.track_output(count),
                            buses: vec![("out", self.output_bus(owner)?.start)],
                            values: vec![("active", if active { 1.0 } else { 0.0 }), ("gain", gain)],
                        })
                    }
                    StageKind::RackInput | StageKind::RackOutput => {
                        let track = self.owning_track(owner)?;
                        let track_bus = self.output_bus(track)?;
                        let rack_count = self.effective_channel_count(owner);
                        let track_count = self.effective_channel_count(track);
                        if *kind == StageKind::RackInput {
                            Some(SynthSpec {
                                program: programs.patch(track_count, rack_count),
                                buses: vec![("in_", track_bus.start), ("out", self.input_bus(owner)?.start)],
                                values: Vec::new(),
                            })
                        } else {
                            Some(SynthSpec {
                                program: programs.patch(rack_count, track_count),
                                buses: vec![("in_", self.output_bus(owner)?.start), ("out", track_bus.start)],
                                values: Vec::new(),
                            })
                        }
                    }
                }
            }
            NodeBody::Device(device) => {
                if device.kind != DeviceKind::Audio {
                    return None;
                }
                let track = self.owning_track(id)?;
                Some(SynthSpec {
                    program: device.program.clone()?,
                    buses: vec![("out", self.output_bus(track)?.start)],
                    values: vec![("active", if device.is_active { 1.0 } else { 0.0 })],
                })
            }
            NodeBody::DirectOut(direct) => {
                let track = self.owning_track(id)?;
                let source = self.output_bus(track)?;
                Some(SynthSpec {
                    program: programs.patch(source.count, direct.bus.count),
                    buses: vec![("in_", source.start), ("out", direct.bus.start)],
                    values: Vec::new(),
                })
            }
            NodeBody::DirectIn(direct) => {
                let track = self.owning_track(id)?;
                let target = self.output_bus(track)?;
                Some(SynthSpec {
                    program: programs.patch(direct.bus.count, target.count),
                    buses: vec![("in_", direct.bus.start), ("out", target.start)],
                    values: Vec::new(),
                })
            }
            NodeBody::Send(_) => self.expected_send_synth(id),
            NodeBody::Patch(_) => self.expected_patch_synth(id),
            _ => None,
        }
    }

    /// Recreate the synth of `id` if its signature drifted
    pub(crate) fn sync_synth(&mut self, id: NodeId) -> bool {
        if !self.is_bound(id) {
            return false;
        }
        let expected = self.expected_synth(id);
        let current = self.get(id).and_then(|n| n.resources.signature.clone());
        if expected.as_ref().map(SynthSpec::signature) == current {
            return false;
        }
        self.replace_synth(id, expected);
        true
    }

    /// Swap the synth of `id` for one built from `spec`, keeping its
    /// position (new synth lands after the old one, then the old is freed)
    pub(crate) fn replace_synth(&mut self, id: NodeId, spec: Option<SynthSpec>) {
        let Some(engine) = self.engine_of(id) else {
            return;
        };
        let old = self.node_mut(id).ok().and_then(|n| {
            n.resources.signature = None;
            n.resources.handle.take()
        });
        if let Some(spec) = spec {
            let placement = match old {
                Some(handle) => Some(Placement::after(handle)),
                None => self.place(id),
            };
            match placement {
                Some(placement) => {
                    let handle = engine.allocate_synth(placement, &spec.program, &spec.controls());
                    if let Ok(node) = self.node_mut(id) {
                        node.resources.handle = Some(handle);
                        node.resources.signature = Some(spec.signature());
                    }
                }
                None => log::warn!("no remote parent for {}", self.label(id)),
            }
        }
        if let Some(old) = old {
            engine.free(old);
        }
    }

    /// Point sounding voices at the owning track's current output bus
    pub(crate) fn sync_voices(&mut self, id: NodeId) -> bool {
        let Some(bus) = self.owning_track(id).and_then(|t| self.output_bus(t)) else {
            return false;
        };
        let Some(engine) = self.engine_of(id) else {
            return false;
        };
        let Ok(node) = self.node_mut(id) else {
            return false;
        };
        let NodeBody::Device(device) = &mut node.body else {
            return false;
        };
        if device.voices.is_empty() || device.voice_bus == Some(bus.start) {
            return false;
        }
        log::debug!("repoint {} voices to bus {}", device.voices.len(), bus.start.0);
        for voice in device.voices.values() {
            engine.set_control(*voice, "out", Control::Bus(bus.start).as_f32());
        }
        device.voice_bus = Some(bus.start);
        true
    }

    // ═══════════════════════════════════════════════════════════════════════
    // METERS AND TRANSPORT
    // ═══════════════════════════════════════════════════════════════════════

    fn register_meters(&mut self, id: NodeId) {
        let Some(binding) = self.binding(id).cloned() else {
            return;
        };
        let enabled = self
            .application_body(binding.application)
            .map(|app| app.config.meters_enabled)
            .unwrap_or(false);
        if !enabled || self.get(id).is_some_and(|n| !n.resources.meters.is_empty()) {
            return;
        }
        let mut callbacks = Vec::new();
        for (kind, tag) in [(StageKind::TrackInput, "input"), (StageKind::TrackOutput, "output")] {
            if let Some(handle) = self.stage(id, kind).and_then(|s| self.handle(s)) {
                callbacks.push(binding.engine.register_meter(handle, tag));
            }
        }
        if let Ok(node) = self.node_mut(id) {
            node.resources.meters = callbacks;
        }
    }

    fn unregister_meters(&mut self, id: NodeId) {
        let Some(engine) = self.engine_of(id) else {
            return;
        };
        let callbacks = match self.node_mut(id) {
            Ok(node) => std::mem::take(&mut node.resources.meters),
            Err(_) => return,
        };
        for callback in callbacks {
            engine.unregister_meter(callback);
        }
    }

    fn transport_for(&self, id: NodeId) -> Option<Arc<dyn Transport>> {
        let application = self.binding(id)?.application;
        self.application_body(application).ok()?.transport.clone()
    }

    fn register_with_transport(&mut self, id: NodeId) {
        if !self.device_kind(id).is_some_and(|k| k.receives_events()) {
            return;
        }
        if let Some(transport) = self.transport_for(id) {
            log::debug!("register {} with transport", self.label(id));
            self.notify_transport(TransportNotice::Register(transport, id));
        }
    }

    fn unregister_with_transport(&mut self, id: NodeId) {
        if !self.device_kind(id).is_some_and(|k| k.receives_events()) {
            return;
        }
        if let Some(transport) = self.transport_for(id) {
            self.notify_transport(TransportNotice::Unregister(transport, id));
        }
    }
}

/// Transport call queued during a mutation, delivered once the arena is
/// unlocked
pub(crate) enum TransportNotice {
    Register(Arc<dyn Transport>, NodeId),
    Unregister(Arc<dyn Transport>, NodeId),
}

impl TransportNotice {
    pub fn deliver(self) {
        match self {
            TransportNotice::Register(transport, node) => transport.register(node),
            TransportNotice::Unregister(transport, node) => transport.unregister(node),
        }
    }
}
