//! Error types for the layer engine

use thiserror::Error;

use crate::types::NodeId;

/// Result type alias using LayerError
pub type Result<T> = std::result::Result<T, LayerError>;

/// Errors that can occur in a layer
///
/// Structural errors (`UnknownDependency`, `CyclicDependency`, `DuplicateNode`,
/// `MissingComputation`, `InvalidConfig`) are raised while the layer is being
/// assembled and prevent it from serving. Everything else is a runtime error
/// scoped to a single node or action.
#[derive(Debug, Error)]
pub enum LayerError {
    /// A declared input names neither a local node nor an import
    #[error("Node '{node}' depends on unknown input '{input}'")]
    UnknownDependency { node: NodeId, input: NodeId },

    /// The declared inputs form a cycle
    #[error("Cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<NodeId> },

    /// Two nodes were registered under the same name
    #[error("Node '{0}' is registered more than once")]
    DuplicateNode(NodeId),

    /// A configured node has no computation bound to it
    #[error("No computation bound for node '{0}'")]
    MissingComputation(NodeId),

    /// Configuration is structurally invalid
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A node's computation returned an error
    #[error("Computation of '{node}' failed: {message}")]
    NodeComputationFailed { node: NodeId, message: String },

    /// The remote layer behind an import could not be reached
    #[error("Upstream for '{node}' unreachable: {message}")]
    UpstreamUnreachable { node: NodeId, message: String },

    /// The action's target advanced since the action was proposed
    #[error("Action '{action}' is stale: target '{target}' was v{proposed_at}, now v{current}")]
    StaleAction {
        action: String,
        target: NodeId,
        proposed_at: u64,
        current: u64,
    },

    /// Apply was attempted without an approval for this action
    #[error("Action '{0}' has not been approved")]
    NotApproved(String),

    /// The action was discarded and can no longer be applied
    #[error("Action '{0}' was discarded")]
    ActionDiscarded(String),

    /// No action with this id exists in the ledger
    #[error("Action not found: {0}")]
    ActionNotFound(String),

    /// The applier reported an error
    #[error("Applying action '{action}' failed: {message}")]
    ApplyFailed { action: String, message: String },

    /// Node is unknown or not marked publishable
    #[error("Node '{0}' is not published by this layer")]
    NotPublished(NodeId),

    /// Node name is not part of this layer's graph
    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    /// The scheduler loop has stopped
    #[error("Scheduler is not running")]
    SchedulerClosed,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LayerError {
    /// Create a computation failure for a node
    pub fn failed(node: impl Into<NodeId>, message: impl Into<String>) -> Self {
        Self::NodeComputationFailed {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Whether this error prevents a layer from starting
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::UnknownDependency { .. }
                | Self::CyclicDependency { .. }
                | Self::DuplicateNode(_)
                | Self::MissingComputation(_)
                | Self::InvalidConfig(_)
        )
    }
}

/// Error returned by a node's computation
///
/// Computations are user code; they report failure with a message and the
/// executor turns it into a `Failed` record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ComputeError {
    pub message: String,
}

impl ComputeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for ComputeError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(e.to_string())
    }
}

impl From<String> for ComputeError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for ComputeError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Error fetching a value from a remote layer
///
/// Every variant counts as a liveness failure of the remote.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// No response (connection refused, timeout, ...)
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// The remote answered but does not publish the node
    #[error("remote does not publish '{0}'")]
    NotPublished(NodeId),

    /// The remote answered with something that is not a published value
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_path() {
        let err = LayerError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency: a -> b -> a");
        assert!(err.is_structural());
    }

    #[test]
    fn test_runtime_errors_are_not_structural() {
        assert!(!LayerError::failed("b", "boom").is_structural());
        assert!(!LayerError::NotApproved("x".into()).is_structural());
    }
}
