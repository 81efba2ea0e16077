//! Engine collaborator contracts
//!
//! The session layer never processes audio. It drives a remote synthesis
//! engine through these traits:
//! - `Engine`: groups, synths, controls, buses and meters
//! - `Transport`: clock registration for event-consuming nodes
//! - `ProgramLibrary`: prebuilt program ids for mixer stages
//!
//! All engine calls are fire-and-forget. Handles are assigned synchronously
//! by the engine client and never fail from the caller's perspective.

use std::fmt;

use rf_core::{BusId, CallbackId, EngineId, HandleId, NodeId};

// ═══════════════════════════════════════════════════════════════════════════
// PLACEMENT
// ═══════════════════════════════════════════════════════════════════════════

/// Where a new or moved remote node lands relative to `target`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddAction {
    /// First child of the target group
    AddToHead,
    /// Last child of the target group
    AddToTail,
    /// Sibling immediately before the target
    AddBefore,
    /// Sibling immediately after the target
    AddAfter,
}

/// Target handle plus add action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Placement {
    pub target: HandleId,
    pub action: AddAction,
}

impl Placement {
    pub fn head(target: HandleId) -> Self {
        Self {
            target,
            action: AddAction::AddToHead,
        }
    }

    pub fn tail(target: HandleId) -> Self {
        Self {
            target,
            action: AddAction::AddToTail,
        }
    }

    pub fn after(target: HandleId) -> Self {
        Self {
            target,
            action: AddAction::AddAfter,
        }
    }

    pub fn before(target: HandleId) -> Self {
        Self {
            target,
            action: AddAction::AddBefore,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CONTROLS
// ═══════════════════════════════════════════════════════════════════════════

/// Initial synth control value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Control {
    /// Bus-mapped control (first channel of a range)
    Bus(BusId),
    /// Plain scalar
    Value(f32),
}

impl Control {
    /// Scalar form as the engine receives it
    pub fn as_f32(&self) -> f32 {
        match self {
            Control::Bus(bus) => bus.0 as f32,
            Control::Value(value) => *value,
        }
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Control::Bus(bus) => write!(f, "a{}", bus.0),
            Control::Value(value) => write!(f, "{value}"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// ENGINE
// ═══════════════════════════════════════════════════════════════════════════

/// Remote synthesis engine
pub trait Engine: Send + Sync {
    /// Instance identity, used to detect rebinding to another engine
    fn id(&self) -> EngineId;

    /// Top-level group every session hangs below
    fn root(&self) -> HandleId;

    /// Create a group
    fn allocate_group(&self, placement: Placement, name: &str) -> HandleId;

    /// Create a synth running `program`
    fn allocate_synth(
        &self,
        placement: Placement,
        program: &str,
        controls: &[(&str, Control)],
    ) -> HandleId;

    /// Set a scalar control on a running synth
    fn set_control(&self, handle: HandleId, key: &str, value: f32);

    /// Reposition an existing node
    fn move_node(&self, handle: HandleId, placement: Placement);

    /// Release a node (and, for groups, everything inside it)
    fn free(&self, handle: HandleId);

    /// Reserve `count` contiguous private buses
    fn allocate_bus_range(&self, count: usize) -> BusId;

    /// Return a range previously obtained from `allocate_bus_range`
    fn free_bus_range(&self, bus: BusId);

    /// Ask for level reports from a stage synth
    fn register_meter(&self, handle: HandleId, tag: &str) -> CallbackId;

    fn unregister_meter(&self, callback: CallbackId);
}

// ═══════════════════════════════════════════════════════════════════════════
// TRANSPORT
// ═══════════════════════════════════════════════════════════════════════════

/// Clock/transport that schedules event delivery into registered nodes.
///
/// Calls arrive after the mutation that raised them has released the
/// arena, on the mutating thread and under its session locks. An
/// implementation may call back into the `Registry` from there.
/// `Engine` methods, by contrast, run with the arena locked and must not
/// re-enter the registry.
pub trait Transport: Send + Sync {
    fn register(&self, node: NodeId);
    fn unregister(&self, node: NodeId);
}

// ═══════════════════════════════════════════════════════════════════════════
// PROGRAM LIBRARY
// ═══════════════════════════════════════════════════════════════════════════

/// Prebuilt program identifiers for mixer stages.
///
/// Programs are parameterized only by channel counts.
pub trait ProgramLibrary: Send + Sync {
    /// Track input stage: `in_` → `out`
    fn track_input(&self, channels: usize) -> String;

    /// Track output stage: gated by `active`, scaled by `gain`
    fn track_output(&self, channels: usize) -> String;

    /// Send between two channel counts: `in_` → `out`, mixing
    fn send(&self, source: usize, target: usize) -> String;

    /// Plain patch cable, used by rack in/out stages and direct ins/outs
    fn patch(&self, source: usize, target: usize) -> String;

    /// Receive patch: `in_` → `out`, gated by `active`, scaled by `gain`.
    /// The feedback variant reads `in_` one block late.
    fn receive(&self, source: usize, target: usize, feedback: bool) -> String;
}

/// Default program naming
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardPrograms;

impl ProgramLibrary for StandardPrograms {
    fn track_input(&self, channels: usize) -> String {
        format!("mixer/track-input/{channels}")
    }

    fn track_output(&self, channels: usize) -> String {
        format!("mixer/track-output/{channels}")
    }

    fn send(&self, source: usize, target: usize) -> String {
        format!("mixer/send/{source}x{target}")
    }

    fn patch(&self, source: usize, target: usize) -> String {
        format!("mixer/patch/{source}x{target}")
    }

    fn receive(&self, source: usize, target: usize, feedback: bool) -> String {
        if feedback {
            format!("mixer/receive-feedback/{source}x{target}")
        } else {
            format!("mixer/receive/{source}x{target}")
        }
    }
}
