//! Receives
//!
//! The pulling counterpart of sends. A track's `Receives` container holds:
//! - receive patches: copy another endpoint's succeeding bus into the
//!   track's output bus
//! - direct ins: copy hardware input buses into the track's output bus
//!
//! A receive patch is registered on its source, so moving or deleting the
//! source rewires every patch pulling from it. Its output bus is fixed (the
//! owning track), so a feedback edge selects a delayed-read program instead
//! of a different bus.

use rf_core::{BusRange, GraphOrder, MixerError, MixerResult, NodeId};

use crate::alloc::SynthSpec;
use crate::send::Wiring;
use crate::tree::{ContainerRole, NodeBody, Tree};

// ═══════════════════════════════════════════════════════════════════════════
// TYPES
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
pub struct PatchBody {
    /// Endpoint pulled from
    pub source: NodeId,
    pub gain: f32,
    /// Last resolved source; mirrors the source's listener set
    pub cached_source: Option<NodeId>,
    pub wiring: Option<Wiring>,
}

impl PatchBody {
    pub fn new(source: NodeId, gain: f32) -> Self {
        Self {
            source,
            gain,
            cached_source: None,
            wiring: None,
        }
    }
}

/// Copy of hardware input buses onto a track's output bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectInBody {
    pub bus: BusRange,
}

// ═══════════════════════════════════════════════════════════════════════════
// RESOLUTION
// ═══════════════════════════════════════════════════════════════════════════

impl Tree {
    fn patch_body(&self, id: NodeId) -> MixerResult<&PatchBody> {
        match &self.node(id)?.body {
            NodeBody::Patch(patch) => Ok(patch),
            _ => Err(MixerError::structural(format!("{} is not a receive", self.label(id)))),
        }
    }

    fn patch_body_mut(&mut self, id: NodeId) -> MixerResult<&mut PatchBody> {
        let label = self.label(id);
        match &mut self.node_mut(id)?.body {
            NodeBody::Patch(patch) => Ok(patch),
            _ => Err(MixerError::structural(format!("{label} is not a receive"))),
        }
    }

    /// Source `patch` currently pulls from, `None` once the source left the
    /// receiving track's tree
    pub fn resolve_source(&self, patch: NodeId) -> Option<NodeId> {
        let source = self.patch_body(patch).ok()?.source;
        let receiver = self.owning_track(patch)?;
        let valid = self.contains(source)
            && self.receive(source).is_some()
            && self.root_of(source) == self.root_of(receiver);
        valid.then_some(source)
    }

    /// Wiring `patch` should have right now, `None` while either endpoint
    /// lacks buses
    pub(crate) fn expected_patch_wiring(&self, patch: NodeId) -> Option<Wiring> {
        let receiver = self.owning_track(patch)?;
        let source = self.resolve_source(patch)?;
        let input = self.receive(source)?.succeeding_bus()?;
        let output = self.output_bus(receiver)?;
        let feedback =
            GraphOrder::feeds_back(&self.graph_order(source), &self.graph_order(receiver));
        Some(Wiring {
            peer: source,
            channel_counts: (
                self.effective_channel_count(source),
                self.effective_channel_count(receiver),
            ),
            input_bus: input.start,
            output_bus: output.start,
            feedback,
        })
    }

    pub(crate) fn expected_patch_synth(&self, patch: NodeId) -> Option<SynthSpec> {
        let wiring = self.expected_patch_wiring(patch)?;
        let gain = self.patch_body(patch).ok()?.gain;
        let active = self.track(wiring.peer).ok().is_none_or(|t| t.is_active);
        let (source_count, target_count) = wiring.channel_counts;
        Some(SynthSpec {
            program: self.programs().receive(source_count, target_count, wiring.feedback),
            buses: vec![("in_", wiring.input_bus), ("out", wiring.output_bus)],
            values: vec![("active", if active { 1.0 } else { 0.0 }), ("gain", gain)],
        })
    }

    /// Move `patch`'s registration to the source it currently resolves to
    fn relink_patch(&mut self, patch: NodeId) {
        let resolved = self.resolve_source(patch);
        let Ok(body) = self.patch_body(patch) else {
            return;
        };
        let previous = body.cached_source;
        if previous == resolved {
            return;
        }
        if let Some(old) = previous.and_then(|s| self.listeners_mut(s)) {
            old.remove(&patch);
        }
        if let Some(new) = resolved.and_then(|s| self.listeners_mut(s)) {
            new.insert(patch);
        }
        if let Ok(body) = self.patch_body_mut(patch) {
            body.cached_source = resolved;
        }
    }

    /// Relink, then rebuild the patch synth if its wiring drifted
    pub(crate) fn reallocate_patch(&mut self, patch: NodeId) {
        self.relink_patch(patch);
        if !self.is_bound(patch) {
            return;
        }
        let expected = self.expected_patch_wiring(patch);
        let current = self.patch_body(patch).ok().and_then(|b| b.wiring);
        let has_handle = self.handle(patch).is_some();
        if expected == current && expected.is_some() == has_handle {
            return;
        }
        log::debug!("rewire {} <- {:?}", self.label(patch), expected.map(|w| w.peer));
        let spec = self.expected_patch_synth(patch);
        self.replace_synth(patch, spec);
        if let Ok(body) = self.patch_body_mut(patch) {
            body.wiring = expected;
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // OPERATIONS
    // ═══════════════════════════════════════════════════════════════════════

    fn receives_of(&self, track: NodeId) -> MixerResult<NodeId> {
        self.track(track)?;
        self.require_part(track, ContainerRole::Receives)
    }

    fn check_source(&self, track: NodeId, source: NodeId) -> MixerResult<()> {
        self.node(source)?;
        if self.receive(source).is_none() {
            return Err(MixerError::InvalidTarget(source));
        }
        if self.root_of(source) != self.root_of(track) {
            return Err(MixerError::scope(format!(
                "{} and {} are in different trees",
                self.label(track),
                self.label(source)
            )));
        }
        Ok(())
    }

    /// Append a patch pulling `source`'s output into `track`
    pub(crate) fn add_receive(&mut self, track: NodeId, source: NodeId) -> MixerResult<NodeId> {
        let container = self.receives_of(track)?;
        self.check_source(track, source)?;
        let gain = self.config_for(track).default_send_gain;
        let patch = self.spawn(None, None, NodeBody::Patch(PatchBody::new(source, gain)));
        self.append(container, patch)?;
        log::debug!("{} receives from {}", self.label(track), self.label(source));
        Ok(patch)
    }

    pub(crate) fn set_receive_source(&mut self, patch: NodeId, source: NodeId) -> MixerResult<()> {
        let track = self
            .owning_track(patch)
            .ok_or_else(|| MixerError::structural(format!("{} has no track", self.label(patch))))?;
        self.patch_body(patch)?;
        self.check_source(track, source)?;
        self.patch_body_mut(patch)?.source = source;
        self.reallocate_patch(patch);
        Ok(())
    }

    pub(crate) fn set_receive_gain(&mut self, patch: NodeId, gain: f32) -> MixerResult<()> {
        self.patch_body_mut(patch)?.gain = gain;
        if let (Some(handle), Some(binding)) = (self.handle(patch), self.binding(patch)) {
            binding.engine.set_control(handle, "gain", gain);
        }
        Ok(())
    }

    /// Resolved source of `patch`, as last wired
    pub fn receive_source(&self, patch: NodeId) -> MixerResult<Option<NodeId>> {
        Ok(self.patch_body(patch)?.cached_source)
    }

    /// Append a direct in copying hardware inputs `[input, input + count)`
    /// onto `track`'s output
    pub(crate) fn add_direct_in(&mut self, track: NodeId, input: usize, count: usize) -> MixerResult<NodeId> {
        let container = self.receives_of(track)?;
        if count == 0 {
            return Err(MixerError::InvalidChannelCount(0));
        }
        let config = self.config_for(track);
        if input + count > config.hardware_input_channels {
            return Err(MixerError::Config(format!(
                "hardware inputs {input}..{} exceed the {} available",
                input + count,
                config.hardware_input_channels
            )));
        }
        let bus = BusRange::new((config.hardware_output_channels + input) as u32, count);
        let direct = self.spawn(None, None, NodeBody::DirectIn(DirectInBody { bus }));
        self.append(container, direct)?;
        Ok(direct)
    }

    /// Detach and drop receive patches or direct ins
    pub(crate) fn remove_receives(&mut self, nodes: &[NodeId]) -> MixerResult<()> {
        for node in nodes {
            match self.body(*node) {
                Some(NodeBody::Patch(_) | NodeBody::DirectIn(_)) => {}
                Some(_) => {
                    return Err(MixerError::structural(format!(
                        "{} is not a receive",
                        self.label(*node)
                    )))
                }
                None => return Err(MixerError::NodeNotFound(*node)),
            }
        }
        for node in nodes {
            self.delete(*node)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StandardPrograms;
    use crate::track::TrackKind;
    use std::sync::Arc;

    fn tree() -> Tree {
        Tree::new(Arc::new(StandardPrograms))
    }

    /// Detached group holding two tracks
    fn group_of_two(tree: &mut Tree) -> (NodeId, NodeId, NodeId) {
        let group = tree.create_track(TrackKind::Group, Some("g"), None);
        let a = tree.create_track(TrackKind::Audio, Some("a"), None);
        let b = tree.create_track(TrackKind::Audio, Some("b"), None);
        let nested = tree.part(group, ContainerRole::Tracks).unwrap();
        tree.replace(nested, 0..0, &[a, b]).unwrap();
        (group, a, b)
    }

    #[test]
    fn test_receive_registers_on_source() {
        let mut tree = tree();
        let (_group, a, b) = group_of_two(&mut tree);
        let patch = tree.add_receive(b, a).unwrap();
        assert_eq!(tree.receive_source(patch).unwrap(), Some(a));
        assert_eq!(tree.receives_from(a), vec![patch]);
        assert!(tree.incoming_sends(a).is_empty());

        let receives = tree.part(b, ContainerRole::Receives).unwrap();
        assert_eq!(tree.children(receives), &[patch]);
    }

    #[test]
    fn test_change_source_moves_registration() {
        let mut tree = tree();
        let (group, a, b) = group_of_two(&mut tree);
        let patch = tree.add_receive(b, a).unwrap();
        tree.set_receive_source(patch, group).unwrap();
        assert!(tree.receives_from(a).is_empty());
        assert_eq!(tree.receives_from(group), vec![patch]);
    }

    #[test]
    fn test_receive_from_chain_rejected() {
        let mut tree = tree();
        let a = tree.create_track(TrackKind::Audio, Some("a"), None);
        let chain = tree.create_track(TrackKind::Chain, Some("c"), None);
        assert!(matches!(
            tree.add_receive(a, chain),
            Err(MixerError::InvalidTarget(id)) if id == chain
        ));
        let receives = tree.part(a, ContainerRole::Receives).unwrap();
        assert!(tree.children(receives).is_empty());
    }

    #[test]
    fn test_receive_across_trees_rejected() {
        let mut tree = tree();
        let a = tree.create_track(TrackKind::Audio, Some("a"), None);
        let b = tree.create_track(TrackKind::Audio, Some("b"), None);
        assert!(matches!(tree.add_receive(a, b), Err(MixerError::ScopeMismatch(_))));
    }

    #[test]
    fn test_removing_receiver_drops_registration() {
        let mut tree = tree();
        let (group, a, b) = group_of_two(&mut tree);
        let patch = tree.add_receive(b, a).unwrap();
        let nested = tree.part(group, ContainerRole::Tracks).unwrap();
        tree.replace(nested, 1..2, &[]).unwrap();
        assert!(tree.receives_from(a).is_empty());
        assert_eq!(tree.resolve_source(patch), None);
    }

    #[test]
    fn test_direct_in_bounds() {
        let mut tree = tree();
        let a = tree.create_track(TrackKind::Audio, Some("a"), None);
        let direct = tree.add_direct_in(a, 2, 2).unwrap();
        match tree.body(direct) {
            // default config: 8 hardware outputs precede the inputs
            Some(NodeBody::DirectIn(body)) => assert_eq!(body.bus, BusRange::new(10, 2)),
            other => panic!("unexpected body {other:?}"),
        }
        assert!(matches!(tree.add_direct_in(a, 7, 2), Err(MixerError::Config(_))));
        assert!(matches!(
            tree.add_direct_in(a, 0, 0),
            Err(MixerError::InvalidChannelCount(0))
        ));
    }
}
