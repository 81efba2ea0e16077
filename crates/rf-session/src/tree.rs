//! Session arena
//!
//! Every mixer entity (application, containers, tracks, stages, devices,
//! sends, receives) is a `Node` keyed by a stable `NodeId`. Parent/child relations are
//! plain id references; nothing holds a pointer into another node.
//!
//! - Pre-order child lists give graph order
//! - Structural parts (stages, a track's own containers) are found by scanning
//!   the owner's children, so bodies never store placeholder ids
//! - Channel counts inherit down the ancestor chain

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use rf_core::{
    BusId, BusRange, CallbackId, GraphOrder, HandleId, MixerError, MixerResult, NodeId,
    SessionConfig,
};

use crate::alloc::TransportNotice;
use crate::device::{DeviceBody, RackBody};
use crate::engine::{Engine, ProgramLibrary, Transport};
use crate::patch::{DirectInBody, PatchBody};
use crate::send::{DirectOutBody, SendBody};
use crate::track::{TrackBody, TrackKind};

/// Channel count used by detached nodes with nothing to inherit from
pub const DEFAULT_CHANNEL_COUNT: usize = 2;

// ═══════════════════════════════════════════════════════════════════════════
// ALLOCATION STATE
// ═══════════════════════════════════════════════════════════════════════════

/// Allocation lifecycle: `Unbound → Allocating → Ready → Freeing → Unbound`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AllocationState {
    #[default]
    Unbound,
    Allocating,
    Ready,
    Freeing,
}

/// Engine a node is currently allocated on, plus the application that
/// bound it
#[derive(Clone)]
pub struct Binding {
    pub engine: Arc<dyn Engine>,
    pub application: NodeId,
}

impl Binding {
    pub fn same_engine(&self, other: &Binding) -> bool {
        self.engine.id() == other.engine.id()
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("engine", &self.engine.id())
            .field("application", &self.application)
            .finish()
    }
}

/// What a running synth was built from. Dynamic controls (`active`,
/// `gain`, `gate`) are not part of the signature.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthSignature {
    pub program: String,
    pub buses: Vec<(&'static str, BusId)>,
}

/// Remote resources owned by one node
#[derive(Debug, Default)]
pub struct Resources {
    /// The node's single remote object (group or synth)
    pub handle: Option<HandleId>,
    pub input_bus: Option<BusRange>,
    pub output_bus: Option<BusRange>,
    /// Set for synth-owning nodes
    pub signature: Option<SynthSignature>,
    pub meters: Vec<CallbackId>,
}

// ═══════════════════════════════════════════════════════════════════════════
// NODE BODIES
// ═══════════════════════════════════════════════════════════════════════════

/// Declared child type of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerRole {
    /// Audio and group tracks
    Tracks,
    /// Return tracks
    Returns,
    /// Receive patches and direct ins
    Receives,
    /// Devices and racks
    Devices,
    PreFaderSends,
    PostFaderSends,
    /// Chains inside a rack
    Chains,
}

impl ContainerRole {
    pub fn label(&self) -> &'static str {
        match self {
            ContainerRole::Tracks => "Tracks",
            ContainerRole::Returns => "Returns",
            ContainerRole::Receives => "Receives",
            ContainerRole::Devices => "Devices",
            ContainerRole::PreFaderSends => "PreFaderSends",
            ContainerRole::PostFaderSends => "PostFaderSends",
            ContainerRole::Chains => "Chains",
        }
    }

    /// Whether `body` is an acceptable child
    pub fn accepts(&self, body: &NodeBody) -> bool {
        match (self, body) {
            (ContainerRole::Tracks, NodeBody::Track(t)) => {
                matches!(t.kind, TrackKind::Audio | TrackKind::Group)
            }
            (ContainerRole::Returns, NodeBody::Track(t)) => t.kind == TrackKind::Return,
            (ContainerRole::Chains, NodeBody::Track(t)) => t.kind == TrackKind::Chain,
            (ContainerRole::Receives, NodeBody::Patch(_) | NodeBody::DirectIn(_)) => true,
            (ContainerRole::Devices, NodeBody::Device(_) | NodeBody::Rack(_)) => true,
            (
                ContainerRole::PreFaderSends | ContainerRole::PostFaderSends,
                NodeBody::Send(_) | NodeBody::DirectOut(_),
            ) => true,
            _ => false,
        }
    }

    /// Containers whose children take part in mute/solo
    pub fn holds_tracks(&self) -> bool {
        matches!(
            self,
            ContainerRole::Tracks | ContainerRole::Returns | ContainerRole::Chains
        )
    }
}

#[derive(Debug)]
pub struct ContainerBody {
    pub role: ContainerRole,
    /// Soloed tracks anywhere below this container
    pub soloed: BTreeSet<NodeId>,
}

/// Fixed synth stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    TrackInput,
    TrackOutput,
    RackInput,
    RackOutput,
}

pub struct ApplicationBody {
    pub config: SessionConfig,
    pub transport: Option<Arc<dyn Transport>>,
}

impl fmt::Debug for ApplicationBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationBody")
            .field("config", &self.config)
            .field("transport", &self.transport.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub enum NodeBody {
    Application(ApplicationBody),
    Container(ContainerBody),
    Track(TrackBody),
    Stage(StageKind),
    Device(DeviceBody),
    Rack(RackBody),
    Send(SendBody),
    DirectOut(DirectOutBody),
    Patch(PatchBody),
    DirectIn(DirectInBody),
}

// ═══════════════════════════════════════════════════════════════════════════
// NODE
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub name: Option<String>,
    /// Own channel count; `None` inherits
    pub channel_count: Option<usize>,
    pub state: AllocationState,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub binding: Option<Binding>,
    pub resources: Resources,
    pub body: NodeBody,
}

impl Node {
    fn new(id: NodeId, name: Option<String>, body: NodeBody) -> Self {
        Self {
            id,
            name,
            channel_count: None,
            state: AllocationState::Unbound,
            parent: None,
            children: Vec::new(),
            binding: None,
            resources: Resources::default(),
            body,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TREE
// ═══════════════════════════════════════════════════════════════════════════

/// Arena holding every node of every application owned by one registry
pub struct Tree {
    nodes: HashMap<NodeId, Node>,
    next_id: u64,
    programs: Arc<dyn ProgramLibrary>,
    /// Transport calls waiting for the arena lock to be released
    transport_notices: Vec<TransportNotice>,
}

impl Tree {
    pub fn new(programs: Arc<dyn ProgramLibrary>) -> Self {
        Self {
            nodes: HashMap::new(),
            next_id: 1,
            programs,
            transport_notices: Vec::new(),
        }
    }

    pub(crate) fn notify_transport(&mut self, notice: TransportNotice) {
        self.transport_notices.push(notice);
    }

    /// Drain queued transport calls, in the order they were raised
    pub(crate) fn take_transport_notices(&mut self) -> Vec<TransportNotice> {
        std::mem::take(&mut self.transport_notices)
    }

    pub fn programs(&self) -> Arc<dyn ProgramLibrary> {
        Arc::clone(&self.programs)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Create a node, appending it to `parent`'s children
    pub(crate) fn spawn(
        &mut self,
        parent: Option<NodeId>,
        name: Option<String>,
        body: NodeBody,
    ) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        let mut node = Node::new(id, name, body);
        node.parent = parent;
        self.nodes.insert(id, node);
        if let Some(parent) = parent {
            if let Some(p) = self.nodes.get_mut(&parent) {
                p.children.push(id);
            }
        }
        id
    }

    /// Drop a detached subtree from the arena
    pub(crate) fn remove_subtree(&mut self, id: NodeId) {
        for node in self.subtree(id) {
            self.nodes.remove(&node);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // ACCESS
    // ═══════════════════════════════════════════════════════════════════════

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn node(&self, id: NodeId) -> MixerResult<&Node> {
        self.nodes.get(&id).ok_or(MixerError::NodeNotFound(id))
    }

    pub fn node_mut(&mut self, id: NodeId) -> MixerResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(MixerError::NodeNotFound(id))
    }

    pub fn body(&self, id: NodeId) -> Option<&NodeBody> {
        self.nodes.get(&id).map(|n| &n.body)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(&id).and_then(|n| n.parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes
            .get(&id)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn handle(&self, id: NodeId) -> Option<HandleId> {
        self.nodes.get(&id).and_then(|n| n.resources.handle)
    }

    pub fn binding(&self, id: NodeId) -> Option<&Binding> {
        self.nodes.get(&id).and_then(|n| n.binding.as_ref())
    }

    pub fn is_bound(&self, id: NodeId) -> bool {
        self.binding(id).is_some()
    }

    pub fn input_bus(&self, id: NodeId) -> Option<BusRange> {
        self.nodes.get(&id).and_then(|n| n.resources.input_bus)
    }

    pub fn output_bus(&self, id: NodeId) -> Option<BusRange> {
        self.nodes.get(&id).and_then(|n| n.resources.output_bus)
    }

    pub fn container_role(&self, id: NodeId) -> Option<ContainerRole> {
        match self.body(id) {
            Some(NodeBody::Container(c)) => Some(c.role),
            _ => None,
        }
    }

    pub fn application_body(&self, id: NodeId) -> MixerResult<&ApplicationBody> {
        match &self.node(id)?.body {
            NodeBody::Application(app) => Ok(app),
            _ => Err(MixerError::structural(format!(
                "{} is not an application",
                self.label(id)
            ))),
        }
    }

    pub fn application_body_mut(&mut self, id: NodeId) -> MixerResult<&mut ApplicationBody> {
        let label = self.label(id);
        match &mut self.node_mut(id)?.body {
            NodeBody::Application(app) => Ok(app),
            _ => Err(MixerError::structural(format!("{label} is not an application"))),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // TOPOLOGY
    // ═══════════════════════════════════════════════════════════════════════

    /// Strict ancestors, nearest first
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.parent(id);
        while let Some(node) = current {
            out.push(node);
            current = self.parent(node);
        }
        out
    }

    /// Topmost ancestor (or the node itself when detached)
    pub fn root_of(&self, id: NodeId) -> NodeId {
        self.ancestors(id).last().copied().unwrap_or(id)
    }

    /// Application whose tree contains `id`
    pub fn application_of(&self, id: NodeId) -> Option<NodeId> {
        let root = self.root_of(id);
        match self.body(root) {
            Some(NodeBody::Application(_)) => Some(root),
            _ => None,
        }
    }

    /// True if `ancestor` is `id` or one of its ancestors
    pub fn is_ancestor_or_self(&self, ancestor: NodeId, id: NodeId) -> bool {
        ancestor == id || self.ancestors(id).contains(&ancestor)
    }

    /// Pre-order walk of `id` and everything below it
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(node) = stack.pop() {
            if !self.contains(node) {
                continue;
            }
            out.push(node);
            for child in self.children(node).iter().rev() {
                stack.push(*child);
            }
        }
        out
    }

    /// Index path from the root
    pub fn graph_order(&self, id: NodeId) -> GraphOrder {
        let mut path = Vec::new();
        let mut current = id;
        while let Some(parent) = self.parent(current) {
            let index = self
                .children(parent)
                .iter()
                .position(|c| *c == current)
                .unwrap_or(0);
            path.push(index);
            current = parent;
        }
        path.reverse();
        GraphOrder::from_path(&path)
    }

    /// Own channel count or the nearest ancestor's
    pub fn effective_channel_count(&self, id: NodeId) -> usize {
        let mut current = Some(id);
        while let Some(node) = current {
            if let Some(count) = self.nodes.get(&node).and_then(|n| n.channel_count) {
                return count;
            }
            current = self.parent(node);
        }
        DEFAULT_CHANNEL_COUNT
    }

    /// Human-readable label for logs and errors
    pub fn label(&self, id: NodeId) -> String {
        let Some(node) = self.nodes.get(&id) else {
            return format!("Missing({id})");
        };
        let kind = match &node.body {
            NodeBody::Application(_) => "Application".to_string(),
            NodeBody::Container(c) => c.role.label().to_string(),
            NodeBody::Track(t) => t.kind.label().to_string(),
            NodeBody::Stage(s) => format!("{s:?}"),
            NodeBody::Device(_) => "Device".to_string(),
            NodeBody::Rack(_) => "Rack".to_string(),
            NodeBody::Send(_) => "Send".to_string(),
            NodeBody::DirectOut(_) => "DirectOut".to_string(),
            NodeBody::Patch(_) => "Receive".to_string(),
            NodeBody::DirectIn(_) => "DirectIn".to_string(),
        };
        match &node.name {
            Some(name) => format!("{kind}({name:?})"),
            None => format!("{kind}({id})"),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // STRUCTURAL PARTS
    // ═══════════════════════════════════════════════════════════════════════

    /// First child of `owner` matching `predicate`
    pub fn find_child(&self, owner: NodeId, predicate: impl Fn(&NodeBody) -> bool) -> Option<NodeId> {
        self.children(owner)
            .iter()
            .copied()
            .find(|c| self.body(*c).is_some_and(&predicate))
    }

    /// Container with `role` directly owned by `owner`
    pub fn part(&self, owner: NodeId, role: ContainerRole) -> Option<NodeId> {
        self.find_child(owner, |b| matches!(b, NodeBody::Container(c) if c.role == role))
    }

    /// Same as `part`, as an error for operations that require it
    pub fn require_part(&self, owner: NodeId, role: ContainerRole) -> MixerResult<NodeId> {
        self.node(owner)?;
        self.part(owner, role).ok_or_else(|| {
            MixerError::structural(format!(
                "{} has no {} container",
                self.label(owner),
                role.label()
            ))
        })
    }

    pub fn stage(&self, owner: NodeId, kind: StageKind) -> Option<NodeId> {
        self.find_child(owner, |b| matches!(b, NodeBody::Stage(s) if *s == kind))
    }

    /// Nearest track (or chain) at or above `id`
    pub fn owning_track(&self, id: NodeId) -> Option<NodeId> {
        std::iter::once(id)
            .chain(self.ancestors(id))
            .find(|n| matches!(self.body(*n), Some(NodeBody::Track(_))))
    }

    /// Nearest rack strictly above `id`
    pub fn owning_rack(&self, id: NodeId) -> Option<NodeId> {
        self.ancestors(id)
            .into_iter()
            .find(|n| matches!(self.body(*n), Some(NodeBody::Rack(_))))
    }

    pub fn master_track(&self, app: NodeId) -> Option<NodeId> {
        self.find_child(app, |b| matches!(b, NodeBody::Track(t) if t.kind == TrackKind::Master))
    }

    pub fn cue_track(&self, app: NodeId) -> Option<NodeId> {
        self.find_child(app, |b| matches!(b, NodeBody::Track(t) if t.kind == TrackKind::Cue))
    }
}

impl fmt::Debug for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tree")
            .field("nodes", &self.nodes.len())
            .field("next_id", &self.next_id)
            .field("transport_notices", &self.transport_notices.len())
            .finish()
    }
}
