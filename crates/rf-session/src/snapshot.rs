//! Serializable view of a session subtree
//!
//! Used for inspection tooling and for comparing session layouts in tests.

use serde::{Deserialize, Serialize};

use rf_core::{BusRange, HandleId, MixerError, MixerResult, NodeId};

use crate::tree::{AllocationState, NodeBody, Tree};

/// One node and everything below it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub label: String,
    pub state: AllocationState,
    pub channel_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<HandleId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_bus: Option<BusRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_bus: Option<BusRange>,
    /// Tracks: activation; devices: `false` while bypassed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    /// Sends: resolved target; receives: resolved source
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeSnapshot>,
}

impl NodeSnapshot {
    /// Capture `id` and its subtree
    pub fn capture(tree: &Tree, id: NodeId) -> MixerResult<Self> {
        let node = tree.node(id)?;
        let (active, target) = match &node.body {
            NodeBody::Track(track) => (Some(track.is_active), None),
            NodeBody::Device(device) => (Some(device.is_active), None),
            NodeBody::Send(send) => (None, send.cached_target),
            NodeBody::Patch(patch) => (None, patch.cached_source),
            _ => (None, None),
        };
        let children = node
            .children
            .iter()
            .map(|c| Self::capture(tree, *c))
            .collect::<MixerResult<Vec<_>>>()?;
        Ok(Self {
            id,
            label: tree.label(id),
            state: node.state,
            channel_count: tree.effective_channel_count(id),
            handle: node.resources.handle,
            input_bus: node.resources.input_bus,
            output_bus: node.resources.output_bus,
            active,
            target,
            children,
        })
    }

    /// Total nodes in this snapshot
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(NodeSnapshot::node_count).sum::<usize>()
    }

    /// Depth-first search by id
    pub fn find(&self, id: NodeId) -> Option<&NodeSnapshot> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(id))
    }

    pub fn to_json(&self) -> MixerResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| MixerError::Config(e.to_string()))
    }

    pub fn from_json(json: &str) -> MixerResult<Self> {
        serde_json::from_str(json).map_err(|e| MixerError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StandardPrograms;
    use rf_core::SessionConfig;
    use std::sync::Arc;

    #[test]
    fn test_capture_application() {
        let mut tree = Tree::new(Arc::new(StandardPrograms));
        let app = tree.create_application(SessionConfig::default()).unwrap();
        let snapshot = NodeSnapshot::capture(&tree, app).unwrap();
        assert_eq!(snapshot.node_count(), tree.subtree(app).len());
        assert_eq!(snapshot.children.len(), 4);
        assert_eq!(snapshot.state, AllocationState::Unbound);

        let master = tree.master_track(app).unwrap();
        assert_eq!(snapshot.find(master).unwrap().active, Some(true));
    }

    #[test]
    fn test_json_round_trip() {
        let mut tree = Tree::new(Arc::new(StandardPrograms));
        let app = tree.create_application(SessionConfig::mono()).unwrap();
        let snapshot = NodeSnapshot::capture(&tree, app).unwrap();
        let json = snapshot.to_json().unwrap();
        assert!(json.contains("MasterTrack"));
        assert_eq!(NodeSnapshot::from_json(&json).unwrap(), snapshot);
    }

    #[test]
    fn test_missing_node() {
        let tree = Tree::new(Arc::new(StandardPrograms));
        assert!(matches!(
            NodeSnapshot::capture(&tree, NodeId(42)),
            Err(MixerError::NodeNotFound(_))
        ));
    }
}
