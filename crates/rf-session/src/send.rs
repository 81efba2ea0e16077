//! Sends
//!
//! A send copies its track's output bus into a receive endpoint. The target
//! is either explicit or resolved from the tree every time the send is
//! reallocated, so moving a track re-routes its default send without
//! touching the send itself.
//!
//! Bus choice follows graph order: a feedback edge (target runs before the
//! source) writes the target's preceding bus, a forward edge writes its
//! succeeding bus.

use std::collections::BTreeSet;

use rf_core::{BusId, BusRange, GraphOrder, MixerError, MixerResult, NodeId};

use crate::alloc::SynthSpec;
use crate::tree::{ContainerRole, NodeBody, Tree};
use crate::track::TrackKind;

// ═══════════════════════════════════════════════════════════════════════════
// TYPES
// ═══════════════════════════════════════════════════════════════════════════

/// Send destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Target {
    /// Resolved through the tree: enclosing group, rack or master
    #[default]
    Default,
    Explicit(NodeId),
}

/// Remote wiring a send or receive patch synth was built with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wiring {
    /// Far endpoint: a send's target, a receive's source
    pub peer: NodeId,
    /// (source, target)
    pub channel_counts: (usize, usize),
    pub input_bus: BusId,
    pub output_bus: BusId,
    pub feedback: bool,
}

#[derive(Debug)]
pub struct SendBody {
    pub target: Target,
    pub gain: f32,
    /// Last resolved target; mirrors the target's incoming set
    pub cached_target: Option<NodeId>,
    pub wiring: Option<Wiring>,
}

impl SendBody {
    pub fn new(target: Target, gain: f32) -> Self {
        Self {
            target,
            gain,
            cached_target: None,
            wiring: None,
        }
    }
}

/// Copy of a track's output bus onto hardware buses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectOutBody {
    pub bus: BusRange,
}

// ═══════════════════════════════════════════════════════════════════════════
// RESOLUTION
// ═══════════════════════════════════════════════════════════════════════════

impl Tree {
    fn send_body(&self, id: NodeId) -> MixerResult<&SendBody> {
        match &self.node(id)?.body {
            NodeBody::Send(send) => Ok(send),
            _ => Err(MixerError::structural(format!("{} is not a send", self.label(id)))),
        }
    }

    fn send_body_mut(&mut self, id: NodeId) -> MixerResult<&mut SendBody> {
        let label = self.label(id);
        match &mut self.node_mut(id)?.body {
            NodeBody::Send(send) => Ok(send),
            _ => Err(MixerError::structural(format!("{label} is not a send"))),
        }
    }

    /// Track (or chain) whose output a send reads
    pub fn send_source(&self, send: NodeId) -> Option<NodeId> {
        self.owning_track(send)
    }

    /// Current target of `send`, resolved against the tree
    pub fn resolve_target(&self, send: NodeId) -> Option<NodeId> {
        let body = self.send_body(send).ok()?;
        let source = self.send_source(send)?;
        match body.target {
            Target::Default => self.default_target(source),
            Target::Explicit(target) => {
                let valid = self.contains(target)
                    && self.receive(target).is_some()
                    && self.root_of(target) == self.root_of(source);
                valid.then_some(target)
            }
        }
    }

    /// Nearest ancestor-designated destination for `track`'s default send
    pub fn default_target(&self, track: NodeId) -> Option<NodeId> {
        if let Ok(body) = self.track(track) {
            if !body.kind.is_user() {
                return None;
            }
        }
        for ancestor in self.ancestors(track) {
            let Some(role) = self.container_role(ancestor) else {
                continue;
            };
            let owner = self.parent(ancestor)?;
            match (role, self.body(owner)) {
                (ContainerRole::Tracks | ContainerRole::Returns, Some(NodeBody::Application(_))) => {
                    return self.master_track(owner);
                }
                (ContainerRole::Tracks, Some(NodeBody::Track(t))) if t.kind == TrackKind::Group => {
                    return Some(owner);
                }
                (ContainerRole::Chains, Some(NodeBody::Rack(_))) => return Some(owner),
                _ => {}
            }
        }
        None
    }

    /// Wiring `send` should have right now, `None` while either endpoint
    /// lacks buses
    pub(crate) fn expected_wiring(&self, send: NodeId) -> Option<Wiring> {
        let source = self.send_source(send)?;
        let target = self.resolve_target(send)?;
        let input = self.output_bus(source)?;
        let receive = self.receive(target)?;
        let feedback =
            GraphOrder::feeds_back(&self.graph_order(source), &self.graph_order(target));
        let output = if feedback {
            receive.preceding_bus()?
        } else {
            receive.succeeding_bus()?
        };
        Some(Wiring {
            peer: target,
            channel_counts: (
                self.effective_channel_count(source),
                self.effective_channel_count(target),
            ),
            input_bus: input.start,
            output_bus: output.start,
            feedback,
        })
    }

    pub(crate) fn expected_send_synth(&self, send: NodeId) -> Option<SynthSpec> {
        let wiring = self.expected_wiring(send)?;
        let gain = self.send_body(send).ok()?.gain;
        let active = self
            .send_source(send)
            .and_then(|s| self.track(s).ok())
            .is_none_or(|t| t.is_active);
        let (source_count, target_count) = wiring.channel_counts;
        Some(SynthSpec {
            program: self.programs().send(source_count, target_count),
            buses: vec![("in_", wiring.input_bus), ("out", wiring.output_bus)],
            values: vec![("active", if active { 1.0 } else { 0.0 }), ("gain", gain)],
        })
    }

    /// Move `send`'s registration to the receive it currently resolves to
    pub(crate) fn relink(&mut self, send: NodeId) {
        let resolved = self.resolve_target(send);
        let Ok(body) = self.send_body(send) else {
            return;
        };
        let previous = body.cached_target;
        if previous == resolved {
            return;
        }
        if let Some(old) = previous.and_then(|t| self.incoming_mut(t)) {
            old.remove(&send);
        }
        if let Some(new) = resolved.and_then(|t| self.incoming_mut(t)) {
            new.insert(send);
        }
        if resolved.is_none() {
            log::debug!("{} has no resolvable target", self.label(send));
        }
        if let Ok(body) = self.send_body_mut(send) {
            body.cached_target = resolved;
        }
    }

    /// Relink, then rebuild the send synth if its wiring drifted
    pub(crate) fn reallocate_send(&mut self, send: NodeId) {
        self.relink(send);
        if !self.is_bound(send) {
            return;
        }
        let expected = self.expected_wiring(send);
        let current = self.send_body(send).ok().and_then(|b| b.wiring);
        let has_handle = self.handle(send).is_some();
        if expected == current && expected.is_some() == has_handle {
            return;
        }
        log::debug!("rewire {} -> {:?}", self.label(send), expected.map(|w| w.peer));
        let spec = self.expected_send_synth(send);
        self.replace_synth(send, spec);
        if let Ok(body) = self.send_body_mut(send) {
            body.wiring = expected;
        }
    }

    /// Reallocate a send or receive patch
    pub(crate) fn rewire(&mut self, link: NodeId) {
        match self.body(link) {
            Some(NodeBody::Send(_)) => self.reallocate_send(link),
            Some(NodeBody::Patch(_)) => self.reallocate_patch(link),
            _ => {}
        }
    }

    /// Sends and receive patches inside the subtrees of `nodes`, plus those
    /// registered on any endpoint inside them
    pub(crate) fn links_touching(&self, nodes: &[NodeId]) -> BTreeSet<NodeId> {
        let mut out = BTreeSet::new();
        for node in nodes {
            for id in self.subtree(*node) {
                if matches!(self.body(id), Some(NodeBody::Send(_) | NodeBody::Patch(_))) {
                    out.insert(id);
                }
                if let Some(receive) = self.receive(id) {
                    let registered = receive.incoming().iter().chain(receive.listeners());
                    out.extend(registered.copied().filter(|l| self.contains(*l)));
                }
            }
        }
        out
    }

    /// Explicit sends and receive patches, anywhere in the trees holding
    /// `nodes`, whose far end lies inside the subtrees of `nodes`
    pub(crate) fn links_targeting(&self, nodes: &[NodeId]) -> BTreeSet<NodeId> {
        let mut inside = BTreeSet::new();
        for node in nodes {
            inside.extend(self.subtree(*node));
        }
        let roots: BTreeSet<NodeId> = nodes.iter().map(|n| self.root_of(*n)).collect();
        let mut out = BTreeSet::new();
        for root in roots {
            for id in self.subtree(root) {
                let aimed_inside = match self.body(id) {
                    Some(NodeBody::Send(send)) => {
                        matches!(send.target, Target::Explicit(t) if inside.contains(&t))
                    }
                    Some(NodeBody::Patch(patch)) => inside.contains(&patch.source),
                    _ => false,
                };
                if aimed_inside {
                    out.insert(id);
                }
            }
        }
        out
    }

    // ═══════════════════════════════════════════════════════════════════════
    // OPERATIONS
    // ═══════════════════════════════════════════════════════════════════════

    fn check_target(&self, source: NodeId, target: Target) -> MixerResult<()> {
        if let Target::Explicit(target) = target {
            self.node(target)?;
            if self.receive(target).is_none() {
                return Err(MixerError::InvalidTarget(target));
            }
            if self.root_of(target) != self.root_of(source) {
                return Err(MixerError::scope(format!(
                    "{} and {} are in different trees",
                    self.label(source),
                    self.label(target)
                )));
            }
        }
        Ok(())
    }

    fn sends_container(&self, track: NodeId, post_fader: bool) -> MixerResult<NodeId> {
        self.track(track)?;
        let role = if post_fader {
            ContainerRole::PostFaderSends
        } else {
            ContainerRole::PreFaderSends
        };
        self.require_part(track, role)
    }

    pub(crate) fn append(&mut self, container: NodeId, item: NodeId) -> MixerResult<()> {
        let len = self.children(container).len();
        if let Err(err) = self.replace(container, len..len, &[item]) {
            self.remove_subtree(item);
            return Err(err);
        }
        Ok(())
    }

    /// Append a send to `source`'s pre- or post-fader sends
    pub(crate) fn add_send(
        &mut self,
        source: NodeId,
        target: Target,
        post_fader: bool,
    ) -> MixerResult<NodeId> {
        let container = self.sends_container(source, post_fader)?;
        self.check_target(source, target)?;
        let gain = self.config_for(source).default_send_gain;
        let send = self.spawn(None, None, NodeBody::Send(SendBody::new(target, gain)));
        self.append(container, send)?;
        log::debug!("added {} to {}", self.label(send), self.label(source));
        Ok(send)
    }

    /// Detach and drop sends or direct outs
    pub(crate) fn remove_sends(&mut self, sends: &[NodeId]) -> MixerResult<()> {
        for send in sends {
            match self.body(*send) {
                Some(NodeBody::Send(_) | NodeBody::DirectOut(_)) => {}
                Some(_) => {
                    return Err(MixerError::structural(format!(
                        "{} is not a send",
                        self.label(*send)
                    )))
                }
                None => return Err(MixerError::NodeNotFound(*send)),
            }
            let owner = self.owning_track(*send).and_then(|t| self.track(t).ok());
            if owner.is_some_and(|t| !t.kind.is_user()) {
                return Err(MixerError::structural(format!(
                    "{} belongs to the application",
                    self.label(*send)
                )));
            }
        }
        for send in sends {
            self.delete(*send)?;
        }
        Ok(())
    }

    pub(crate) fn set_send_target(&mut self, send: NodeId, target: Target) -> MixerResult<()> {
        let source = self
            .send_source(send)
            .ok_or_else(|| MixerError::structural(format!("{} has no source", self.label(send))))?;
        self.send_body(send)?;
        self.check_target(source, target)?;
        self.send_body_mut(send)?.target = target;
        self.reallocate_send(send);
        Ok(())
    }

    pub(crate) fn set_send_gain(&mut self, send: NodeId, gain: f32) -> MixerResult<()> {
        self.send_body_mut(send)?.gain = gain;
        if let (Some(handle), Some(binding)) = (self.handle(send), self.binding(send)) {
            binding.engine.set_control(handle, "gain", gain);
        }
        Ok(())
    }

    /// Resolved target of `send`, as last wired
    pub fn send_target(&self, send: NodeId) -> MixerResult<Option<NodeId>> {
        Ok(self.send_body(send)?.cached_target)
    }

    /// Append a direct out copying `track`'s output onto `bus`
    pub(crate) fn add_direct_out(
        &mut self,
        track: NodeId,
        bus: BusRange,
        post_fader: bool,
    ) -> MixerResult<NodeId> {
        let container = self.sends_container(track, post_fader)?;
        if bus.count == 0 {
            return Err(MixerError::InvalidChannelCount(0));
        }
        let direct = self.spawn(None, None, NodeBody::DirectOut(DirectOutBody { bus }));
        self.append(container, direct)?;
        Ok(direct)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StandardPrograms;
    use std::sync::Arc;

    fn tree() -> Tree {
        Tree::new(Arc::new(StandardPrograms))
    }

    #[test]
    fn test_default_send_of_group_child_targets_group() {
        let mut tree = tree();
        let group = tree.create_track(TrackKind::Group, Some("g"), None);
        let child = tree.create_track(TrackKind::Audio, Some("c"), Some(1.0));
        let nested = tree.part(group, ContainerRole::Tracks).unwrap();
        tree.replace(nested, 0..0, &[child]).unwrap();

        let post = tree.part(child, ContainerRole::PostFaderSends).unwrap();
        let send = tree.children(post)[0];
        assert_eq!(tree.resolve_target(send), Some(group));
        assert_eq!(tree.send_target(send).unwrap(), Some(group));
        assert_eq!(tree.incoming_sends(group), vec![send]);
    }

    #[test]
    fn test_detached_default_send_unresolved() {
        let mut tree = tree();
        let track = tree.create_track(TrackKind::Audio, Some("a"), Some(1.0));
        let post = tree.part(track, ContainerRole::PostFaderSends).unwrap();
        let send = tree.children(post)[0];
        assert_eq!(tree.resolve_target(send), None);
        assert!(tree.expected_wiring(send).is_none());
    }

    #[test]
    fn test_explicit_target_across_trees_rejected() {
        let mut tree = tree();
        let a = tree.create_track(TrackKind::Audio, Some("a"), None);
        let b = tree.create_track(TrackKind::Audio, Some("b"), None);
        let err = tree.add_send(a, Target::Explicit(b), true).unwrap_err();
        assert!(matches!(err, MixerError::ScopeMismatch(_)));
    }

    #[test]
    fn test_explicit_target_without_receive_rejected() {
        let mut tree = tree();
        let a = tree.create_track(TrackKind::Audio, Some("a"), None);
        let devices = tree.part(a, ContainerRole::Devices).unwrap();
        let err = tree.add_send(a, Target::Explicit(devices), true).unwrap_err();
        assert!(matches!(err, MixerError::InvalidTarget(id) if id == devices));
        let post = tree.part(a, ContainerRole::PostFaderSends).unwrap();
        assert!(tree.children(post).is_empty());
    }

    #[test]
    fn test_self_send_resolves() {
        let mut tree = tree();
        let a = tree.create_track(TrackKind::Audio, Some("a"), None);
        let send = tree.add_send(a, Target::Explicit(a), true).unwrap();
        assert_eq!(tree.send_target(send).unwrap(), Some(a));
        assert_eq!(tree.incoming_sends(a), vec![send]);
    }

    #[test]
    fn test_retarget_moves_registration() {
        let mut tree = tree();
        let group = tree.create_track(TrackKind::Group, Some("g"), None);
        let a = tree.create_track(TrackKind::Audio, Some("a"), None);
        let b = tree.create_track(TrackKind::Audio, Some("b"), None);
        let nested = tree.part(group, ContainerRole::Tracks).unwrap();
        tree.replace(nested, 0..0, &[a, b]).unwrap();

        let send = tree.add_send(a, Target::Explicit(b), true).unwrap();
        assert_eq!(tree.incoming_sends(b), vec![send]);
        tree.set_send_target(send, Target::Default).unwrap();
        assert!(tree.incoming_sends(b).is_empty());
        assert_eq!(tree.incoming_sends(group), vec![send]);
    }

    #[test]
    fn test_default_target_of_master_is_none() {
        let mut tree = tree();
        let master = tree.create_track(TrackKind::Master, Some("master"), None);
        assert_eq!(tree.default_target(master), None);
    }
}
