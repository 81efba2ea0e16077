//! Error types for the mixer session layer

use thiserror::Error;

use crate::NodeId;

/// Session layer error type.
///
/// Every variant except `Io` is raised during validation, before any
/// mutation of the tree is applied.
#[derive(Error, Debug)]
pub enum MixerError {
    /// Container type/order rules broken by a prospective mutation
    #[error("Structural violation: {0}")]
    StructuralViolation(String),

    /// A send target that cannot receive
    #[error("Invalid send target: {0} has no receive")]
    InvalidTarget(NodeId),

    /// Nodes that must share an application or parent do not
    #[error("Scope mismatch: {0}")]
    ScopeMismatch(String),

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Invalid channel count: {0}")]
    InvalidChannelCount(usize),

    #[error("Application {0} is not booted")]
    NotBooted(NodeId),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type MixerResult<T> = Result<T, MixerError>;

impl MixerError {
    pub fn structural(reason: impl Into<String>) -> Self {
        Self::StructuralViolation(reason.into())
    }

    pub fn scope(reason: impl Into<String>) -> Self {
        Self::ScopeMismatch(reason.into())
    }
}
