//! Mute/solo propagation
//!
//! Activation of a track is derived, never set directly:
//!
//! ```text
//! should_mute = tree_muted || track.is_muted
//! should_solo = tree_soloed || !track.soloed.is_empty()
//! active      = !should_mute && (!any_soloed || should_solo)
//! ```
//!
//! `any_soloed` is read from the scope root: the outermost track container
//! below the application, or the chain container of a rack. Chains therefore
//! never affect activation outside their rack.

use std::collections::BTreeSet;

use rf_core::{MixerError, MixerResult, NodeId};

use crate::tree::{ContainerRole, NodeBody, StageKind, Tree};

/// Tracks whose activation flipped during one propagation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationDiff {
    /// (track, new activation), in visiting order
    pub changes: Vec<(NodeId, bool)>,
}

impl ActivationDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// New activation of `track`, if it changed
    pub fn get(&self, track: NodeId) -> Option<bool> {
        self.changes
            .iter()
            .find(|(id, _)| *id == track)
            .map(|(_, active)| *active)
    }
}

impl Tree {
    // ═══════════════════════════════════════════════════════════════════════
    // SCOPE
    // ═══════════════════════════════════════════════════════════════════════

    /// Root of the mute/solo scope containing `id`
    pub fn scope_root(&self, id: NodeId) -> NodeId {
        let mut outermost = None;
        for node in std::iter::once(id).chain(self.ancestors(id)) {
            match self.body(node) {
                Some(NodeBody::Container(c)) if c.role == ContainerRole::Chains => return node,
                Some(NodeBody::Container(c)) if c.role.holds_tracks() => outermost = Some(node),
                Some(NodeBody::Application(_)) => break,
                _ => {}
            }
        }
        outermost.unwrap_or_else(|| self.root_of(id))
    }

    fn soloed_at(&self, id: NodeId) -> Option<&BTreeSet<NodeId>> {
        match self.body(id)? {
            NodeBody::Container(c) => Some(&c.soloed),
            NodeBody::Track(t) => Some(&t.soloed),
            _ => None,
        }
    }

    /// Strict ancestor track inside the same scope that is muted
    pub(crate) fn ancestor_muted(&self, track: NodeId) -> bool {
        let root = self.scope_root(track);
        for ancestor in self.ancestors(track) {
            if ancestor == root {
                break;
            }
            if self.track(ancestor).is_ok_and(|t| t.is_muted) {
                return true;
            }
        }
        false
    }

    // ═══════════════════════════════════════════════════════════════════════
    // AGGREGATES
    // ═══════════════════════════════════════════════════════════════════════

    /// Recompute the soloed-descendant sets of every track and track
    /// container in the scope below `root`
    pub(crate) fn rebuild_solo(&mut self, root: NodeId) {
        match self.body(root) {
            Some(NodeBody::Container(_)) => {
                self.rebuild_container_solo(root);
            }
            Some(NodeBody::Track(_)) => {
                self.rebuild_track_solo(root);
            }
            _ => {}
        }
    }

    fn rebuild_container_solo(&mut self, container: NodeId) -> BTreeSet<NodeId> {
        let mut soloed = BTreeSet::new();
        for child in self.children(container).to_vec() {
            if self.track(child).is_ok() {
                soloed.extend(self.rebuild_track_solo(child));
            }
        }
        if let Ok(node) = self.node_mut(container) {
            if let NodeBody::Container(c) = &mut node.body {
                c.soloed = soloed.clone();
            }
        }
        soloed
    }

    fn rebuild_track_solo(&mut self, track: NodeId) -> BTreeSet<NodeId> {
        let mut soloed = BTreeSet::new();
        if self.track(track).is_ok_and(|t| t.is_soloed) {
            soloed.insert(track);
        }
        if let Some(nested) = self.part(track, ContainerRole::Tracks) {
            soloed.extend(self.rebuild_container_solo(nested));
        }
        if let Ok(body) = self.track_mut(track) {
            body.soloed = soloed.clone();
        }
        soloed
    }

    // ═══════════════════════════════════════════════════════════════════════
    // PROPAGATION
    // ═══════════════════════════════════════════════════════════════════════

    /// Recompute activation for every track in the scope below `root`,
    /// pushing changes to output stages and sends
    pub(crate) fn propagate(&mut self, root: NodeId) -> ActivationDiff {
        let any_soloed = self.soloed_at(root).is_some_and(|s| !s.is_empty());
        let mut diff = ActivationDiff::default();
        match self.body(root) {
            Some(NodeBody::Container(_)) => {
                self.propagate_container(root, false, false, any_soloed, &mut diff)
            }
            Some(NodeBody::Track(_)) => self.propagate_track(root, false, false, any_soloed, &mut diff),
            _ => {}
        }
        if !diff.is_empty() {
            log::debug!("{} activation changes below {}", diff.len(), self.label(root));
        }
        diff
    }

    fn propagate_container(
        &mut self,
        container: NodeId,
        tree_muted: bool,
        tree_soloed: bool,
        any_soloed: bool,
        diff: &mut ActivationDiff,
    ) {
        for child in self.children(container).to_vec() {
            if self.track(child).is_ok() {
                self.propagate_track(child, tree_muted, tree_soloed, any_soloed, diff);
            }
        }
    }

    fn propagate_track(
        &mut self,
        track: NodeId,
        tree_muted: bool,
        tree_soloed: bool,
        any_soloed: bool,
        diff: &mut ActivationDiff,
    ) {
        let Ok(body) = self.track(track) else {
            return;
        };
        if !body.kind.is_user() {
            return;
        }
        let should_mute = tree_muted || body.is_muted;
        let should_solo = tree_soloed || !body.soloed.is_empty();
        let active = !should_mute && (!any_soloed || should_solo);
        let changed = body.is_active != active;
        let nested_soloed = tree_soloed || body.is_soloed;

        if changed {
            if let Ok(body) = self.track_mut(track) {
                body.is_active = active;
            }
            diff.changes.push((track, active));
            self.apply_activation(track, active);
        }
        if let Some(nested) = self.part(track, ContainerRole::Tracks) {
            self.propagate_container(nested, should_mute, nested_soloed, any_soloed, diff);
        }
    }

    /// Set the `active` control on the track's output stage and on every
    /// allocated send it owns
    fn apply_activation(&self, track: NodeId, active: bool) {
        let Some(binding) = self.binding(track) else {
            return;
        };
        let value = if active { 1.0 } else { 0.0 };
        let mut targets = Vec::new();
        targets.extend(self.stage(track, StageKind::TrackOutput));
        for role in [ContainerRole::PreFaderSends, ContainerRole::PostFaderSends] {
            if let Some(container) = self.part(track, role) {
                targets.extend(
                    self.children(container)
                        .iter()
                        .copied()
                        .filter(|c| matches!(self.body(*c), Some(NodeBody::Send(_)))),
                );
            }
        }
        if let Ok(body) = self.track(track) {
            targets.extend(body.listeners.iter().copied());
        }
        for handle in targets.into_iter().filter_map(|n| self.handle(n)) {
            binding.engine.set_control(handle, "active", value);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // OPERATIONS
    // ═══════════════════════════════════════════════════════════════════════

    fn check_user_track(&self, track: NodeId) -> MixerResult<()> {
        if !self.track(track)?.kind.is_user() {
            return Err(MixerError::structural(format!(
                "{} cannot be muted or soloed",
                self.label(track)
            )));
        }
        Ok(())
    }

    pub(crate) fn mute(&mut self, track: NodeId) -> MixerResult<ActivationDiff> {
        self.set_muted(track, true)
    }

    pub(crate) fn unmute(&mut self, track: NodeId) -> MixerResult<ActivationDiff> {
        self.set_muted(track, false)
    }

    fn set_muted(&mut self, track: NodeId, muted: bool) -> MixerResult<ActivationDiff> {
        self.check_user_track(track)?;
        if self.track(track)?.is_muted == muted {
            return Ok(ActivationDiff::default());
        }
        self.track_mut(track)?.is_muted = muted;
        if self.ancestor_muted(track) {
            log::debug!("{} is already muted by an ancestor", self.label(track));
            return Ok(ActivationDiff::default());
        }
        Ok(self.propagate(self.scope_root(track)))
    }

    /// Solo `track`; with `exclusive`, unsolo every other soloed track in
    /// its scope first
    pub(crate) fn solo(&mut self, track: NodeId, exclusive: bool) -> MixerResult<ActivationDiff> {
        self.check_user_track(track)?;
        if !exclusive && self.track(track)?.is_soloed {
            return Ok(ActivationDiff::default());
        }
        let root = self.scope_root(track);
        if exclusive {
            let others: Vec<NodeId> = self
                .soloed_at(root)
                .map(|s| s.iter().copied().filter(|t| *t != track).collect())
                .unwrap_or_default();
            for other in others {
                if let Ok(body) = self.track_mut(other) {
                    body.is_soloed = false;
                }
            }
        }
        self.track_mut(track)?.is_soloed = true;
        self.rebuild_solo(root);
        Ok(self.propagate(root))
    }

    pub(crate) fn unsolo(&mut self, track: NodeId) -> MixerResult<ActivationDiff> {
        self.check_user_track(track)?;
        if !self.track(track)?.is_soloed {
            return Ok(ActivationDiff::default());
        }
        self.track_mut(track)?.is_soloed = false;
        let root = self.scope_root(track);
        self.rebuild_solo(root);
        Ok(self.propagate(root))
    }
}
