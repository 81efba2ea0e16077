//! Receive endpoints
//!
//! The target side of a send. Each receiving entity exposes two buses:
//! - preceding: read before the entity's own processing (feedback sends
//!   write here)
//! - succeeding: read after it (feed-forward sends write here)
//!
//! The same endpoint is the source side of receive patches, which pull
//! from its succeeding bus.

use std::collections::BTreeSet;

use rf_core::{BusRange, NodeId};

use crate::device::RackBody;
use crate::track::{TrackBody, TrackKind};
use crate::tree::{Node, NodeBody, Tree};

/// Target side of a send
pub trait Receive {
    /// Node owning this endpoint
    fn owner(&self) -> NodeId;

    /// Bus consumed before the owner's processing
    fn preceding_bus(&self) -> Option<BusRange>;

    /// Bus consumed after the owner's processing
    fn succeeding_bus(&self) -> Option<BusRange>;

    /// Sends currently resolved to this endpoint
    fn incoming(&self) -> &BTreeSet<NodeId>;

    /// Receive patches currently pulling from this endpoint
    fn listeners(&self) -> &BTreeSet<NodeId>;
}

/// Receive endpoint of a track: input bus before, output bus after
pub struct TrackReceive<'a> {
    node: &'a Node,
    body: &'a TrackBody,
}

impl Receive for TrackReceive<'_> {
    fn owner(&self) -> NodeId {
        self.node.id
    }

    fn preceding_bus(&self) -> Option<BusRange> {
        self.node.resources.input_bus
    }

    fn succeeding_bus(&self) -> Option<BusRange> {
        self.node.resources.output_bus
    }

    fn incoming(&self) -> &BTreeSet<NodeId> {
        &self.body.incoming
    }

    fn listeners(&self) -> &BTreeSet<NodeId> {
        &self.body.listeners
    }
}

/// Receive endpoint a rack exposes to its chains and to explicit sends:
/// rack input bus before, rack output bus after
pub struct RackReceive<'a> {
    node: &'a Node,
    body: &'a RackBody,
}

impl Receive for RackReceive<'_> {
    fn owner(&self) -> NodeId {
        self.node.id
    }

    fn preceding_bus(&self) -> Option<BusRange> {
        self.node.resources.input_bus
    }

    fn succeeding_bus(&self) -> Option<BusRange> {
        self.node.resources.output_bus
    }

    fn incoming(&self) -> &BTreeSet<NodeId> {
        &self.body.incoming
    }

    fn listeners(&self) -> &BTreeSet<NodeId> {
        &self.body.listeners
    }
}

impl Tree {
    /// Receive endpoint of `id`, if it can be a send target.
    /// Chains only feed their rack and cannot receive.
    pub fn receive(&self, id: NodeId) -> Option<Box<dyn Receive + '_>> {
        let node = self.get(id)?;
        match &node.body {
            NodeBody::Track(body) if body.kind != TrackKind::Chain => {
                Some(Box::new(TrackReceive { node, body }))
            }
            NodeBody::Rack(body) => Some(Box::new(RackReceive { node, body })),
            _ => None,
        }
    }

    pub(crate) fn incoming_mut(&mut self, id: NodeId) -> Option<&mut BTreeSet<NodeId>> {
        match &mut self.node_mut(id).ok()?.body {
            NodeBody::Track(body) if body.kind != TrackKind::Chain => Some(&mut body.incoming),
            NodeBody::Rack(body) => Some(&mut body.incoming),
            _ => None,
        }
    }

    pub(crate) fn listeners_mut(&mut self, id: NodeId) -> Option<&mut BTreeSet<NodeId>> {
        match &mut self.node_mut(id).ok()?.body {
            NodeBody::Track(body) if body.kind != TrackKind::Chain => Some(&mut body.listeners),
            NodeBody::Rack(body) => Some(&mut body.listeners),
            _ => None,
        }
    }

    /// Receive patches pulling from `id`, in graph order
    pub fn receives_from(&self, id: NodeId) -> Vec<NodeId> {
        let Some(receive) = self.receive(id) else {
            return Vec::new();
        };
        let mut patches: Vec<NodeId> = receive.listeners().iter().copied().collect();
        patches.sort_by_cached_key(|p| self.graph_order(*p));
        patches
    }

    /// Sends resolved to `id`, in graph order
    pub fn incoming_sends(&self, id: NodeId) -> Vec<NodeId> {
        let Some(receive) = self.receive(id) else {
            return Vec::new();
        };
        let mut sends: Vec<NodeId> = receive.incoming().iter().copied().collect();
        sends.sort_by_cached_key(|s| self.graph_order(*s));
        sends
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StandardPrograms;
    use std::sync::Arc;

    #[test]
    fn test_tracks_receive_chains_do_not() {
        let mut tree = Tree::new(Arc::new(StandardPrograms));
        let track = tree.create_track(TrackKind::Audio, Some("a"), None);
        let chain = tree.create_track(TrackKind::Chain, Some("c"), None);
        assert!(tree.receive(track).is_some());
        assert!(tree.receive(chain).is_none());
        assert!(tree.incoming_mut(chain).is_none());
    }

    #[test]
    fn test_unallocated_receive_has_no_buses() {
        let mut tree = Tree::new(Arc::new(StandardPrograms));
        let track = tree.create_track(TrackKind::Audio, Some("a"), None);
        let receive = tree.receive(track).unwrap();
        assert_eq!(receive.owner(), track);
        assert!(receive.preceding_bus().is_none());
        assert!(receive.succeeding_bus().is_none());
        assert!(receive.incoming().is_empty());
        assert!(receive.listeners().is_empty());
    }
}
