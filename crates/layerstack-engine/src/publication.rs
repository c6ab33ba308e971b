//! Publication endpoint (read side)
//!
//! Serves the current record of publishable nodes to other layers. Reads go
//! straight to the value store, so a consumer always sees the latest
//! complete record and never a cached one.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{LayerError, Result};
use crate::fingerprint::Fingerprint;
use crate::graph::Graph;
use crate::store::ValueStore;
use crate::types::{NodeId, NodeStatus};

/// A node's record as seen by another layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedValue {
    pub node: NodeId,
    pub value: serde_json::Value,
    pub version: u64,
    pub fingerprint: Option<Fingerprint>,
    pub status: NodeStatus,
    /// Present only when `status` is `failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Read access to a layer's publishable nodes
#[derive(Clone)]
pub struct Publication {
    graph: Arc<Graph>,
    store: Arc<ValueStore>,
}

impl Publication {
    pub fn new(graph: Arc<Graph>, store: Arc<ValueStore>) -> Self {
        Self { graph, store }
    }

    /// Current record of a publishable node
    pub fn get(&self, name: &str) -> Result<PublishedValue> {
        if !self.graph.registry().is_publishable(name) {
            return Err(LayerError::NotPublished(name.to_string()));
        }
        let record = self
            .store
            .get(name)
            .ok_or_else(|| LayerError::NotPublished(name.to_string()))?;

        let error = if record.is_failed() {
            record.error.as_ref().map(|e| e.to_string())
        } else {
            None
        };
        Ok(PublishedValue {
            node: name.to_string(),
            value: record.value.clone(),
            version: record.version,
            fingerprint: record.fingerprint.clone(),
            status: record.status,
            error,
        })
    }

    /// Names of all publishable nodes, in execution order
    pub fn list(&self) -> Vec<NodeId> {
        let registry = self.graph.registry();
        self.graph
            .plan()
            .order()
            .iter()
            .filter(|name| registry.is_publishable(name))
            .cloned()
            .collect()
    }

    /// Current record of every publishable node
    pub fn all(&self) -> Vec<PublishedValue> {
        self.list().iter().filter_map(|name| self.get(name).ok()).collect()
    }
}
