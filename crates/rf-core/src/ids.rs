//! Identifier types shared by the session layer and engine collaborators
//!
//! - `NodeId`: a node in the session arena (tracks, devices, sends, ...)
//! - `HandleId`: a remote group or synth owned by an engine
//! - `BusId`: first channel of an allocated bus range
//! - `CallbackId`: a registered metering callback
//! - `EngineId`: distinguishes engine instances for rebinding

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// ═══════════════════════════════════════════════════════════════════════════
// NODE ID
// ═══════════════════════════════════════════════════════════════════════════

/// Unique, stable identifier of a node in the session arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// ENGINE-SIDE IDS
// ═══════════════════════════════════════════════════════════════════════════

/// Remote node (group or synth) identifier, assigned by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HandleId(pub u64);

/// Bus index. A bus range starts at a `BusId` and spans `count` channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BusId(pub u32);

/// Metering callback registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallbackId(pub u64);

/// Engine instance identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineId(pub u64);

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

impl EngineId {
    /// Allocate a process-unique engine id
    pub fn next() -> Self {
        Self(NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_ids_unique() {
        let a = EngineId::next();
        let b = EngineId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_node_id_display() {
        assert_eq!(NodeId(42).to_string(), "#42");
    }
}
