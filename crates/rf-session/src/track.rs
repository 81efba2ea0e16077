//! Tracks and group tracks
//!
//! A track's children, in remote execution order:
//! input stage, nested tracks (group tracks only), receives, devices,
//! pre-fader sends, output stage, post-fader sends.
//!
//! Receives run after nested tracks, so a group pulling from one of its own
//! children reads a finished bus.
//!
//! User tracks (audio, group, return, chain) are created with a default
//! post-fader send whose target resolves through the tree.

use std::collections::BTreeSet;

use rf_core::{MixerError, MixerResult, NodeId, SessionConfig};

use crate::send::{SendBody, Target};
use crate::tree::{ContainerBody, ContainerRole, NodeBody, StageKind, Tree};

// ═══════════════════════════════════════════════════════════════════════════
// TYPES
// ═══════════════════════════════════════════════════════════════════════════

/// Track flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    /// Plain track
    Audio,
    /// Track owning a nested track container
    Group,
    /// Track in the return container
    Return,
    /// Session master, wired to the hardware outputs
    Master,
    /// Cue/monitor bus, wired after the master outputs
    Cue,
    /// Track-like unit inside a rack device
    Chain,
}

impl TrackKind {
    pub fn label(&self) -> &'static str {
        match self {
            TrackKind::Audio => "Track",
            TrackKind::Group => "GroupTrack",
            TrackKind::Return => "ReturnTrack",
            TrackKind::Master => "MasterTrack",
            TrackKind::Cue => "CueTrack",
            TrackKind::Chain => "Chain",
        }
    }

    /// Master and cue are owned by the application and never muted/soloed
    pub fn is_user(&self) -> bool {
        !matches!(self, TrackKind::Master | TrackKind::Cue)
    }
}

/// Track state
#[derive(Debug)]
pub struct TrackBody {
    pub kind: TrackKind,
    pub is_muted: bool,
    pub is_soloed: bool,
    /// Derived audibility, maintained by the mute/solo propagator
    pub is_active: bool,
    /// Soloed tracks at or below this one
    pub soloed: BTreeSet<NodeId>,
    /// Output stage gain
    pub gain: f32,
    /// Sends currently resolved to this track
    pub incoming: BTreeSet<NodeId>,
    /// Receive patches currently pulling from this track
    pub listeners: BTreeSet<NodeId>,
}

impl TrackBody {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            kind,
            is_muted: false,
            is_soloed: false,
            is_active: true,
            soloed: BTreeSet::new(),
            gain: 1.0,
            incoming: BTreeSet::new(),
            listeners: BTreeSet::new(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CONSTRUCTION
// ═══════════════════════════════════════════════════════════════════════════

impl Tree {
    pub(crate) fn spawn_container(&mut self, parent: NodeId, role: ContainerRole) -> NodeId {
        self.spawn(
            Some(parent),
            None,
            NodeBody::Container(ContainerBody {
                role,
                soloed: BTreeSet::new(),
            }),
        )
    }

    /// Attach a detached node as the last child of `parent`, bypassing
    /// container validation. Used while assembling fixed structure.
    pub(crate) fn adopt(&mut self, parent: NodeId, child: NodeId) -> MixerResult<()> {
        self.node_mut(child)?.parent = Some(parent);
        self.node_mut(parent)?.children.push(child);
        Ok(())
    }

    /// Build a detached track subtree.
    ///
    /// `default_send_gain` adds a post-fader send to the default target.
    pub(crate) fn create_track(
        &mut self,
        kind: TrackKind,
        name: Option<&str>,
        default_send_gain: Option<f32>,
    ) -> NodeId {
        let track = self.spawn(
            None,
            name.map(str::to_string),
            NodeBody::Track(TrackBody::new(kind)),
        );
        self.spawn(Some(track), None, NodeBody::Stage(StageKind::TrackInput));
        if kind == TrackKind::Group {
            self.spawn_container(track, ContainerRole::Tracks);
        }
        self.spawn_container(track, ContainerRole::Receives);
        self.spawn_container(track, ContainerRole::Devices);
        self.spawn_container(track, ContainerRole::PreFaderSends);
        self.spawn(Some(track), None, NodeBody::Stage(StageKind::TrackOutput));
        let post = self.spawn_container(track, ContainerRole::PostFaderSends);
        if let Some(gain) = default_send_gain {
            self.spawn(
                Some(post),
                None,
                NodeBody::Send(SendBody::new(Target::Default, gain)),
            );
        }
        track
    }

    /// Configuration of the application containing `id`, or defaults when
    /// detached
    pub(crate) fn config_for(&self, id: NodeId) -> SessionConfig {
        self.application_of(id)
            .and_then(|app| self.application_body(app).ok())
            .map(|app| app.config.clone())
            .unwrap_or_default()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // ACCESS
    // ═══════════════════════════════════════════════════════════════════════

    pub fn track(&self, id: NodeId) -> MixerResult<&TrackBody> {
        match &self.node(id)?.body {
            NodeBody::Track(track) => Ok(track),
            _ => Err(MixerError::structural(format!("{} is not a track", self.label(id)))),
        }
    }

    pub(crate) fn track_mut(&mut self, id: NodeId) -> MixerResult<&mut TrackBody> {
        let label = self.label(id);
        match &mut self.node_mut(id)?.body {
            NodeBody::Track(track) => Ok(track),
            _ => Err(MixerError::structural(format!("{label} is not a track"))),
        }
    }

    /// Track container of an application or group track
    pub(crate) fn track_container(&self, owner: NodeId) -> MixerResult<NodeId> {
        self.require_part(owner, ContainerRole::Tracks)
    }

    /// Container a track of `kind` lives in below `owner`
    fn container_for(&self, owner: NodeId, kind: TrackKind) -> MixerResult<NodeId> {
        match kind {
            TrackKind::Return => self.require_part(owner, ContainerRole::Returns),
            TrackKind::Chain => self.require_part(owner, ContainerRole::Chains),
            _ => self.track_container(owner),
        }
    }

    /// Parent container of `id`, failing for fixed structural children
    pub(crate) fn parent_container(&self, id: NodeId) -> MixerResult<NodeId> {
        let parent = self.parent(id).ok_or_else(|| {
            MixerError::structural(format!("{} is not in a container", self.label(id)))
        })?;
        if self.container_role(parent).is_none() {
            return Err(MixerError::structural(format!(
                "{} is owned by {}",
                self.label(id),
                self.label(parent)
            )));
        }
        Ok(parent)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // OPERATIONS
    // ═══════════════════════════════════════════════════════════════════════

    /// Append a new track of `kind` below `owner` (application, group
    /// track or rack)
    pub(crate) fn add_track(
        &mut self,
        owner: NodeId,
        kind: TrackKind,
        name: Option<&str>,
    ) -> MixerResult<NodeId> {
        let container = self.container_for(owner, kind)?;
        let gain = self.config_for(owner).default_send_gain;
        let track = self.create_track(kind, name, Some(gain));
        let len = self.children(container).len();
        if let Err(err) = self.replace(container, len..len, &[track]) {
            self.remove_subtree(track);
            return Err(err);
        }
        log::debug!("added {} to {}", self.label(track), self.label(owner));
        Ok(track)
    }

    /// Move `track` into `owner`'s matching container at `index`
    pub(crate) fn move_track(&mut self, track: NodeId, owner: NodeId, index: usize) -> MixerResult<()> {
        let kind = self.track(track)?.kind;
        let container = self.container_for(owner, kind)?;
        let len = self.children(container).len();
        if index > len {
            return Err(MixerError::structural(format!(
                "index {index} out of range for {} tracks",
                len
            )));
        }
        self.replace(container, index..index, &[track])
    }

    /// Remove `id` from its container, free it and drop it from the arena
    pub(crate) fn delete(&mut self, id: NodeId) -> MixerResult<()> {
        self.node(id)?;
        if matches!(self.body(id), Some(NodeBody::Application(_))) {
            return Err(MixerError::structural("applications are disposed, not deleted"));
        }
        if self.parent(id).is_some() {
            let container = self.parent_container(id)?;
            let index = self
                .children(container)
                .iter()
                .position(|c| *c == id)
                .unwrap_or(0);
            self.replace(container, index..index + 1, &[])?;
        } else {
            self.free(id);
        }
        log::debug!("deleted {}", self.label(id));
        self.remove_subtree(id);
        Ok(())
    }

    /// Wrap `tracks` in a new group track placed at the first track's
    /// position
    pub(crate) fn group(&mut self, tracks: &[NodeId], name: Option<&str>) -> MixerResult<NodeId> {
        let first = *tracks
            .first()
            .ok_or_else(|| MixerError::scope("no tracks to group"))?;
        let container = self.parent_container(first)?;
        let mut seen = BTreeSet::new();
        for track in tracks {
            let kind = self.track(*track)?.kind;
            if !matches!(kind, TrackKind::Audio | TrackKind::Group) {
                return Err(MixerError::structural(format!(
                    "{} cannot be grouped",
                    self.label(*track)
                )));
            }
            if self.application_of(*track) != self.application_of(first) {
                return Err(MixerError::scope("tracks belong to different applications"));
            }
            if self.parent(*track) != Some(container) {
                return Err(MixerError::scope("tracks do not share a parent"));
            }
            if !seen.insert(*track) {
                return Err(MixerError::structural(format!(
                    "{} listed twice",
                    self.label(*track)
                )));
            }
        }
        let index = self
            .children(container)
            .iter()
            .position(|c| *c == first)
            .unwrap_or(0);
        let gain = self.config_for(container).default_send_gain;
        let group = self.create_track(TrackKind::Group, name, Some(gain));
        if let Err(err) = self.replace(container, index..index, &[group]) {
            self.remove_subtree(group);
            return Err(err);
        }
        let nested = self.track_container(group)?;
        self.replace(nested, 0..0, tracks)?;
        log::debug!("grouped {} tracks into {}", tracks.len(), self.label(group));
        Ok(group)
    }

    /// Dissolve a group track, moving its children to its position
    pub(crate) fn ungroup(&mut self, group: NodeId) -> MixerResult<Vec<NodeId>> {
        if self.track(group)?.kind != TrackKind::Group {
            return Err(MixerError::structural(format!(
                "{} is not a group track",
                self.label(group)
            )));
        }
        let container = self.parent_container(group)?;
        let nested = self.track_container(group)?;
        let children = self.children(nested).to_vec();
        let index = self
            .children(container)
            .iter()
            .position(|c| *c == group)
            .unwrap_or(0);
        self.replace(container, index..index + 1, &children)?;
        self.remove_subtree(group);
        Ok(children)
    }

    /// Set (or clear, with `None`) a node's own channel count
    pub(crate) fn set_channel_count(&mut self, id: NodeId, count: Option<usize>) -> MixerResult<()> {
        match self.body(id) {
            Some(NodeBody::Track(_) | NodeBody::Rack(_)) => {}
            Some(_) => {
                return Err(MixerError::structural(format!(
                    "{} has no channel count of its own",
                    self.label(id)
                )))
            }
            None => return Err(MixerError::NodeNotFound(id)),
        }
        if let Some(count) = count {
            self.config_for(id).check_channel_count(count)?;
        }
        if self.node(id)?.channel_count == count {
            return Ok(());
        }
        self.node_mut(id)?.channel_count = count;
        self.resync(&[id]);
        Ok(())
    }

    /// Output stage gain
    pub(crate) fn set_gain(&mut self, track: NodeId, gain: f32) -> MixerResult<()> {
        self.track_mut(track)?.gain = gain;
        let stage = self.stage(track, StageKind::TrackOutput);
        if let (Some(handle), Some(binding)) = (stage.and_then(|s| self.handle(s)), self.binding(track)) {
            binding.engine.set_control(handle, "gain", gain);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StandardPrograms;
    use std::sync::Arc;

    #[test]
    fn test_track_layout() {
        let mut tree = Tree::new(Arc::new(StandardPrograms));
        let track = tree.create_track(TrackKind::Group, Some("g"), Some(1.0));
        let kinds: Vec<String> = tree
            .children(track)
            .iter()
            .map(|c| tree.label(*c))
            .collect();
        assert_eq!(kinds.len(), 7);
        assert!(kinds[0].starts_with("TrackInput"));
        assert!(kinds[1].starts_with("Tracks"));
        assert!(kinds[2].starts_with("Receives"));
        assert!(kinds[3].starts_with("Devices"));
        assert!(kinds[4].starts_with("PreFaderSends"));
        assert!(kinds[5].starts_with("TrackOutput"));
        assert!(kinds[6].starts_with("PostFaderSends"));

        let post = tree.part(track, ContainerRole::PostFaderSends).unwrap();
        assert_eq!(tree.children(post).len(), 1);
    }

    #[test]
    fn test_plain_track_has_no_nested_container() {
        let mut tree = Tree::new(Arc::new(StandardPrograms));
        let track = tree.create_track(TrackKind::Audio, None, None);
        assert!(tree.part(track, ContainerRole::Tracks).is_none());
        let post = tree.part(track, ContainerRole::PostFaderSends).unwrap();
        assert!(tree.children(post).is_empty());
        assert_eq!(tree.label(track), format!("Track({track})"));
    }

    #[test]
    fn test_user_kinds() {
        assert!(TrackKind::Audio.is_user());
        assert!(TrackKind::Chain.is_user());
        assert!(!TrackKind::Master.is_user());
        assert!(!TrackKind::Cue.is_user());
    }
}
