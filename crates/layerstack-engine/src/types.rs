//! Core types shared across the layer
//!
//! These types describe node identity, the per-node value record held by
//! the value store, and the reasons a node can be in the `Failed` state.

use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;

/// Unique identifier for a node (process-scoped)
pub type NodeId = String;

/// Status of a node's value record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Never computed (or waiting on an input that was never computed)
    #[default]
    Pending,
    /// Last computation succeeded
    Fresh,
    /// Last computation failed, or an input failed
    Failed,
}

/// Why a node is `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The node's own computation returned an error
    ComputationFailed { message: String },
    /// A declared input is failed; the node was not executed
    UpstreamFailed { input: NodeId },
    /// The remote layer reported the imported node as failed
    RemoteFailed { message: String },
    /// The remote layer stayed unreachable past the staleness threshold
    UpstreamUnreachable { message: String },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ComputationFailed { message } => write!(f, "NodeComputationFailed: {}", message),
            Self::UpstreamFailed { input } => write!(f, "UpstreamFailed: input '{}' failed", input),
            Self::RemoteFailed { message } => write!(f, "RemoteFailed: {}", message),
            Self::UpstreamUnreachable { message } => write!(f, "UpstreamUnreachable: {}", message),
        }
    }
}

/// Current value of a node together with its change-tracking metadata
///
/// Records are immutable once built; the store replaces whole records so a
/// reader never sees a value paired with another value's fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueRecord {
    /// Opaque payload
    pub value: serde_json::Value,
    /// Incremented by exactly one whenever the fingerprint changes
    pub version: u64,
    /// Content hash of `value` (`None` until first computed)
    pub fingerprint: Option<Fingerprint>,
    /// Pending / Fresh / Failed
    pub status: NodeStatus,
    /// Logical clock tick of the last write
    pub computed_at: u64,
    /// Present iff `status` is `Failed`
    pub error: Option<FailureReason>,
}

impl ValueRecord {
    /// An empty record for a node that has never been computed
    pub fn pending() -> Self {
        Self {
            value: serde_json::Value::Null,
            version: 0,
            fingerprint: None,
            status: NodeStatus::Pending,
            computed_at: 0,
            error: None,
        }
    }

    /// Build the successor record after a successful computation
    ///
    /// The version only advances when the fingerprint differs.
    pub fn succeeded(
        &self,
        value: serde_json::Value,
        fingerprint: Fingerprint,
        computed_at: u64,
    ) -> Self {
        let changed = self.fingerprint.as_ref() != Some(&fingerprint);
        Self {
            value,
            version: if changed { self.version + 1 } else { self.version },
            fingerprint: Some(fingerprint),
            status: NodeStatus::Fresh,
            computed_at,
            error: None,
        }
    }

    /// Build the successor record for a failure, keeping the last good value
    pub fn failed(&self, reason: FailureReason, computed_at: u64) -> Self {
        Self {
            value: self.value.clone(),
            version: self.version,
            fingerprint: self.fingerprint.clone(),
            status: NodeStatus::Failed,
            computed_at,
            error: Some(reason),
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.status == NodeStatus::Fresh
    }

    pub fn is_failed(&self) -> bool {
        self.status == NodeStatus::Failed
    }
}

impl Default for ValueRecord {
    fn default() -> Self {
        Self::pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_version_advances_only_on_new_fingerprint() {
        let pending = ValueRecord::pending();
        let first = pending.succeeded(json!(1), Fingerprint::of(&json!(1)), 1);
        assert_eq!(first.version, 1);
        assert_eq!(first.status, NodeStatus::Fresh);

        let same = first.succeeded(json!(1), Fingerprint::of(&json!(1)), 2);
        assert_eq!(same.version, 1);
        assert_eq!(same.computed_at, 2);

        let next = same.succeeded(json!(2), Fingerprint::of(&json!(2)), 3);
        assert_eq!(next.version, 2);
    }

    #[test]
    fn test_failure_keeps_last_value() {
        let fresh = ValueRecord::pending().succeeded(json!("ok"), Fingerprint::of(&json!("ok")), 1);
        let failed = fresh.failed(
            FailureReason::ComputationFailed {
                message: "boom".into(),
            },
            2,
        );
        assert!(failed.is_failed());
        assert_eq!(failed.value, json!("ok"));
        assert_eq!(failed.version, 1);
        assert_eq!(failed.fingerprint, fresh.fingerprint);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&NodeStatus::Fresh).unwrap(), "\"fresh\"");
        let reason = FailureReason::UpstreamFailed { input: "a".into() };
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["kind"], "upstream_failed");
    }
}
