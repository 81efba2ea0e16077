//! rf-core: Shared types for the ReelForge mixer session layer
//!
//! This crate provides the vocabulary used by the session graph and its
//! engine collaborators: identifiers, bus ranges, device kinds, graph order,
//! errors and session configuration.

mod ids;
mod bus;
mod device;
mod graph_order;
mod error;
mod config;

pub use ids::*;
pub use bus::*;
pub use device::*;
pub use graph_order::*;
pub use error::*;
pub use config::*;
