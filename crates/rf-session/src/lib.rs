//! rf-session: Mixer session graph
//!
//! Keeps a tree of mixer entities (tracks, devices, racks, sends) in sync
//! with a remote synthesis engine:
//! - Four-phase allocation protocol (pre, post, reallocate, free)
//! - Validated, lock-scoped container mutation
//! - Device chain ordering with a single instrument per chain
//! - Sends resolved against topology, feedback-aware bus choice
//! - Receive patches and hardware direct ins
//! - Device bypass
//! - Hierarchical mute/solo propagation
//! - Note event dispatch through device chains

mod alloc;
mod application;
mod container;
mod device;
mod patch;
mod perform;
mod receive;
mod send;
mod snapshot;
mod solo;
mod track;
mod tree;

pub mod engine;
pub mod local_engine;
pub mod lock;
pub mod registry;

pub use device::{DeviceBody, DeviceSpec, RackBody};
pub use engine::{AddAction, Control, Engine, Placement, ProgramLibrary, StandardPrograms, Transport};
pub use local_engine::{EngineCall, LocalEngine};
pub use patch::{DirectInBody, PatchBody};
pub use lock::{LockSet, LockSetGuard, SessionLock};
pub use perform::{note_to_frequency, NoteEvent, PerformReport};
pub use receive::{RackReceive, Receive, TrackReceive};
pub use registry::{Registry, TrackInfo};
pub use send::{DirectOutBody, SendBody, Target, Wiring};
pub use snapshot::NodeSnapshot;
pub use solo::ActivationDiff;
pub use track::{TrackBody, TrackKind};
pub use tree::{
    AllocationState, ApplicationBody, Binding, ContainerBody, ContainerRole, Node, NodeBody,
    Resources, StageKind, SynthSignature, Tree, DEFAULT_CHANNEL_COUNT,
};

pub use rf_core::{MixerError, MixerResult, NodeId};
