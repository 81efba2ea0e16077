//! In-process engine
//!
//! Mirrors what a remote synthesis server would hold:
//! - node tree (groups and synths) with add-action placement
//! - synth controls
//! - private bus allocation after the hardware buses
//! - metering registrations
//!
//! Every call is appended to a traffic log so callers can assert exactly
//! which commands a mutation produced.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use rf_core::{BusId, CallbackId, EngineId, HandleId, SessionConfig};

use crate::engine::{AddAction, Control, Engine, Placement};

// ═══════════════════════════════════════════════════════════════════════════
// TRAFFIC
// ═══════════════════════════════════════════════════════════════════════════

/// One command sent to the engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    AllocateGroup {
        handle: HandleId,
        placement: Placement,
        name: String,
    },
    AllocateSynth {
        handle: HandleId,
        placement: Placement,
        program: String,
        controls: Vec<(String, f32)>,
    },
    SetControl {
        handle: HandleId,
        key: String,
        value: f32,
    },
    MoveNode {
        handle: HandleId,
        placement: Placement,
    },
    Free {
        handle: HandleId,
    },
    AllocateBuses {
        bus: BusId,
        count: usize,
    },
    FreeBuses {
        bus: BusId,
    },
    RegisterMeter {
        handle: HandleId,
        tag: String,
        callback: CallbackId,
    },
    UnregisterMeter {
        callback: CallbackId,
    },
}

// ═══════════════════════════════════════════════════════════════════════════
// MIRRORED STATE
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
enum LocalKind {
    Group { name: String },
    Synth {
        program: String,
        controls: BTreeMap<String, f32>,
    },
}

#[derive(Debug, Clone)]
struct LocalNode {
    parent: Option<HandleId>,
    children: Vec<HandleId>,
    kind: LocalKind,
}

#[derive(Debug)]
struct LocalState {
    nodes: HashMap<HandleId, LocalNode>,
    /// Allocated ranges: start → count
    buses: BTreeMap<u32, usize>,
    meters: HashMap<CallbackId, (HandleId, String)>,
    traffic: Vec<EngineCall>,
}

const ROOT: HandleId = HandleId(0);

/// In-process engine used for tests and offline sessions
pub struct LocalEngine {
    id: EngineId,
    first_private_bus: u32,
    next_handle: AtomicU64,
    next_callback: AtomicU64,
    state: Mutex<LocalState>,
}

impl LocalEngine {
    pub fn new(first_private_bus: u32) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT,
            LocalNode {
                parent: None,
                children: Vec::new(),
                kind: LocalKind::Group {
                    name: "root".into(),
                },
            },
        );
        Self {
            id: EngineId::next(),
            first_private_bus,
            next_handle: AtomicU64::new(1000),
            next_callback: AtomicU64::new(1),
            state: Mutex::new(LocalState {
                nodes,
                buses: BTreeMap::new(),
                meters: HashMap::new(),
                traffic: Vec::new(),
            }),
        }
    }

    /// Engine whose private buses follow the configured hardware buses
    pub fn for_config(config: &SessionConfig) -> Self {
        Self::new(config.first_private_bus())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // INSPECTION
    // ═══════════════════════════════════════════════════════════════════════

    /// Snapshot of every call so far
    pub fn traffic(&self) -> Vec<EngineCall> {
        self.state.lock().traffic.clone()
    }

    pub fn clear_traffic(&self) {
        self.state.lock().traffic.clear();
    }

    /// Live nodes, excluding the root group
    pub fn live_handles(&self) -> usize {
        self.state.lock().nodes.len() - 1
    }

    /// Number of allocated bus ranges
    pub fn live_bus_ranges(&self) -> usize {
        self.state.lock().buses.len()
    }

    pub fn live_meters(&self) -> usize {
        self.state.lock().meters.len()
    }

    pub fn is_live(&self, handle: HandleId) -> bool {
        self.state.lock().nodes.contains_key(&handle)
    }

    pub fn parent_of(&self, handle: HandleId) -> Option<HandleId> {
        self.state.lock().nodes.get(&handle).and_then(|n| n.parent)
    }

    pub fn children_of(&self, handle: HandleId) -> Vec<HandleId> {
        self.state
            .lock()
            .nodes
            .get(&handle)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    /// Program of a synth, `None` for groups
    pub fn program(&self, handle: HandleId) -> Option<String> {
        match self.state.lock().nodes.get(&handle).map(|n| &n.kind) {
            Some(LocalKind::Synth { program, .. }) => Some(program.clone()),
            _ => None,
        }
    }

    pub fn control(&self, handle: HandleId, key: &str) -> Option<f32> {
        match self.state.lock().nodes.get(&handle).map(|n| &n.kind) {
            Some(LocalKind::Synth { controls, .. }) => controls.get(key).copied(),
            _ => None,
        }
    }

    /// Name of a group, `None` for synths
    pub fn group_name(&self, handle: HandleId) -> Option<String> {
        match self.state.lock().nodes.get(&handle).map(|n| &n.kind) {
            Some(LocalKind::Group { name }) => Some(name.clone()),
            _ => None,
        }
    }

    /// Indented text rendering of the node tree
    pub fn dump(&self) -> String {
        let state = self.state.lock();
        let mut out = String::new();
        dump_node(&state, ROOT, 0, &mut out);
        out
    }

    // ═══════════════════════════════════════════════════════════════════════
    // INTERNALS
    // ═══════════════════════════════════════════════════════════════════════

    fn next_handle(&self) -> HandleId {
        HandleId(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }
}

fn dump_node(state: &LocalState, handle: HandleId, depth: usize, out: &mut String) {
    let Some(node) = state.nodes.get(&handle) else {
        return;
    };
    let indent = "    ".repeat(depth);
    match &node.kind {
        LocalKind::Group { name } => {
            let _ = writeln!(out, "{indent}{handle} group ({name})");
        }
        LocalKind::Synth { program, controls } => {
            let _ = writeln!(out, "{indent}{handle} {program}");
            if !controls.is_empty() {
                let rendered: Vec<String> =
                    controls.iter().map(|(k, v)| format!("{k}: {v}")).collect();
                let _ = writeln!(out, "{indent}    {}", rendered.join(", "));
            }
        }
    }
    for child in &node.children {
        dump_node(state, *child, depth + 1, out);
    }
}

/// Detach `handle` from its parent's child list
fn unlink(state: &mut LocalState, handle: HandleId) {
    let parent = state.nodes.get(&handle).and_then(|n| n.parent);
    if let Some(parent) = parent {
        if let Some(node) = state.nodes.get_mut(&parent) {
            node.children.retain(|c| *c != handle);
        }
    }
}

/// Insert `handle` according to `placement`. Unknown targets fall back to
/// the root group's tail.
fn link(state: &mut LocalState, handle: HandleId, placement: Placement) {
    let (parent, index) = match placement.action {
        AddAction::AddToHead | AddAction::AddToTail => {
            let target = if state.nodes.contains_key(&placement.target) {
                placement.target
            } else {
                ROOT
            };
            let len = state.nodes.get(&target).map_or(0, |n| n.children.len());
            let index = if placement.action == AddAction::AddToHead {
                0
            } else {
                len
            };
            (target, index)
        }
        AddAction::AddBefore | AddAction::AddAfter => {
            let parent = state
                .nodes
                .get(&placement.target)
                .and_then(|n| n.parent)
                .unwrap_or(ROOT);
            let siblings = state
                .nodes
                .get(&parent)
                .map(|n| n.children.clone())
                .unwrap_or_default();
            let position = siblings.iter().position(|c| *c == placement.target);
            let index = match (position, placement.action) {
                (Some(pos), AddAction::AddBefore) => pos,
                (Some(pos), _) => pos + 1,
                (None, _) => siblings.len(),
            };
            (parent, index)
        }
    };
    if let Some(node) = state.nodes.get_mut(&parent) {
        let index = index.min(node.children.len());
        node.children.insert(index, handle);
    }
    if let Some(node) = state.nodes.get_mut(&handle) {
        node.parent = Some(parent);
    }
}

fn remove_subtree(state: &mut LocalState, handle: HandleId) {
    if let Some(node) = state.nodes.remove(&handle) {
        state.meters.retain(|_, (h, _)| *h != handle);
        for child in node.children {
            remove_subtree(state, child);
        }
    }
}

impl Engine for LocalEngine {
    fn id(&self) -> EngineId {
        self.id
    }

    fn root(&self) -> HandleId {
        ROOT
    }

    fn allocate_group(&self, placement: Placement, name: &str) -> HandleId {
        let handle = self.next_handle();
        let mut state = self.state.lock();
        state.nodes.insert(
            handle,
            LocalNode {
                parent: None,
                children: Vec::new(),
                kind: LocalKind::Group { name: name.into() },
            },
        );
        link(&mut state, handle, placement);
        state.traffic.push(EngineCall::AllocateGroup {
            handle,
            placement,
            name: name.into(),
        });
        handle
    }

    fn allocate_synth(
        &self,
        placement: Placement,
        program: &str,
        controls: &[(&str, Control)],
    ) -> HandleId {
        let handle = self.next_handle();
        let controls: Vec<(String, f32)> = controls
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_f32()))
            .collect();
        let mut state = self.state.lock();
        state.nodes.insert(
            handle,
            LocalNode {
                parent: None,
                children: Vec::new(),
                kind: LocalKind::Synth {
                    program: program.into(),
                    controls: controls.iter().cloned().collect(),
                },
            },
        );
        link(&mut state, handle, placement);
        state.traffic.push(EngineCall::AllocateSynth {
            handle,
            placement,
            program: program.into(),
            controls,
        });
        handle
    }

    fn set_control(&self, handle: HandleId, key: &str, value: f32) {
        let mut state = self.state.lock();
        if let Some(LocalKind::Synth { controls, .. }) =
            state.nodes.get_mut(&handle).map(|n| &mut n.kind)
        {
            controls.insert(key.into(), value);
        }
        state.traffic.push(EngineCall::SetControl {
            handle,
            key: key.into(),
            value,
        });
    }

    fn move_node(&self, handle: HandleId, placement: Placement) {
        let mut state = self.state.lock();
        if state.nodes.contains_key(&handle) {
            unlink(&mut state, handle);
            link(&mut state, handle, placement);
        }
        state.traffic.push(EngineCall::MoveNode { handle, placement });
    }

    fn free(&self, handle: HandleId) {
        let mut state = self.state.lock();
        if handle != ROOT && state.nodes.contains_key(&handle) {
            unlink(&mut state, handle);
            remove_subtree(&mut state, handle);
        } else {
            log::debug!("free of unknown handle {handle}");
        }
        state.traffic.push(EngineCall::Free { handle });
    }

    fn allocate_bus_range(&self, count: usize) -> BusId {
        let mut state = self.state.lock();
        // first fit
        let mut start = self.first_private_bus;
        for (&s, &c) in &state.buses {
            if start + count as u32 <= s {
                break;
            }
            start = start.max(s + c as u32);
        }
        state.buses.insert(start, count);
        let bus = BusId(start);
        state.traffic.push(EngineCall::AllocateBuses { bus, count });
        bus
    }

    fn free_bus_range(&self, bus: BusId) {
        let mut state = self.state.lock();
        state.buses.remove(&bus.0);
        state.traffic.push(EngineCall::FreeBuses { bus });
    }

    fn register_meter(&self, handle: HandleId, tag: &str) -> CallbackId {
        let callback = CallbackId(self.next_callback.fetch_add(1, Ordering::Relaxed));
        let mut state = self.state.lock();
        state.meters.insert(callback, (handle, tag.into()));
        state.traffic.push(EngineCall::RegisterMeter {
            handle,
            tag: tag.into(),
            callback,
        });
        callback
    }

    fn unregister_meter(&self, callback: CallbackId) {
        let mut state = self.state.lock();
        state.meters.remove(&callback);
        state.traffic.push(EngineCall::UnregisterMeter { callback });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_placement() {
        let engine = LocalEngine::new(16);
        let a = engine.allocate_group(Placement::tail(engine.root()), "a");
        let c = engine.allocate_group(Placement::tail(engine.root()), "c");
        let b = engine.allocate_group(Placement::after(a), "b");
        let z = engine.allocate_group(Placement::head(engine.root()), "z");
        assert_eq!(engine.children_of(engine.root()), vec![z, a, b, c]);
        let y = engine.allocate_group(Placement::before(c), "y");
        assert_eq!(engine.children_of(engine.root()), vec![z, a, b, y, c]);
    }

    #[test]
    fn test_free_removes_subtree() {
        let engine = LocalEngine::new(16);
        let group = engine.allocate_group(Placement::tail(engine.root()), "g");
        let synth = engine.allocate_synth(
            Placement::tail(group),
            "mixer/track-input/2",
            &[("in_", Control::Bus(BusId(16)))],
        );
        engine.register_meter(synth, "input");
        assert_eq!(engine.live_handles(), 2);
        assert_eq!(engine.live_meters(), 1);

        engine.free(group);
        assert_eq!(engine.live_handles(), 0);
        assert_eq!(engine.live_meters(), 0);
        assert!(!engine.is_live(synth));
    }

    #[test]
    fn test_move_node() {
        let engine = LocalEngine::new(16);
        let a = engine.allocate_group(Placement::tail(engine.root()), "a");
        let b = engine.allocate_group(Placement::tail(engine.root()), "b");
        engine.move_node(a, Placement::tail(b));
        assert_eq!(engine.children_of(engine.root()), vec![b]);
        assert_eq!(engine.parent_of(a), Some(b));
    }

    #[test]
    fn test_bus_first_fit() {
        let engine = LocalEngine::new(16);
        let a = engine.allocate_bus_range(2);
        let b = engine.allocate_bus_range(2);
        let c = engine.allocate_bus_range(2);
        assert_eq!((a.0, b.0, c.0), (16, 18, 20));

        engine.free_bus_range(b);
        assert_eq!(engine.allocate_bus_range(1).0, 18);
        assert_eq!(engine.allocate_bus_range(2).0, 22);
        assert_eq!(engine.live_bus_ranges(), 4);
    }

    #[test]
    fn test_controls_and_traffic() {
        let engine = LocalEngine::new(16);
        let synth = engine.allocate_synth(
            Placement::tail(engine.root()),
            "mixer/track-output/2",
            &[("active", Control::Value(1.0)), ("out", Control::Bus(BusId(18)))],
        );
        engine.set_control(synth, "active", 0.0);
        assert_eq!(engine.control(synth, "active"), Some(0.0));
        assert_eq!(engine.control(synth, "out"), Some(18.0));
        assert_eq!(engine.program(synth).as_deref(), Some("mixer/track-output/2"));

        let traffic = engine.traffic();
        assert_eq!(traffic.len(), 2);
        assert!(matches!(traffic[1], EngineCall::SetControl { .. }));
        engine.clear_traffic();
        assert!(engine.traffic().is_empty());
    }

    #[test]
    fn test_dump() {
        let engine = LocalEngine::new(16);
        let group = engine.allocate_group(Placement::tail(engine.root()), "Session");
        engine.allocate_synth(Placement::tail(group), "mixer/patch/2x2", &[]);
        let dump = engine.dump();
        assert!(dump.contains("group (Session)"));
        assert!(dump.contains("        "));
        assert!(dump.contains("mixer/patch/2x2"));
    }
}
