//! Node registry
//!
//! The registry is the descriptive half of a layer: it records every node,
//! the ordered names of the inputs it consumes, and how its value is
//! produced. Nothing here executes; the graph builder consumes the registry
//! and the executor runs the computations.
//!
//! # Usage
//!
//! ```ignore
//! use layerstack_engine::NodeRegistry;
//!
//! let mut registry = NodeRegistry::new();
//! registry.register_fn("a", &[], |_| Ok(serde_json::json!(1)))?;
//! registry.register_fn("b", &["a"], |inputs| {
//!     let a: i64 = inputs.parse("a")?;
//!     Ok(serde_json::json!(a + 1))
//! })?;
//! registry.publish("b")?;
//! ```

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::actions::ProposedAction;
use crate::error::{ComputeError, LayerError, Result};
use crate::types::NodeId;

/// Input values handed to a computation, in declaration order
#[derive(Debug, Clone, Default)]
pub struct NodeInputs {
    entries: Vec<(NodeId, serde_json::Value)>,
}

impl NodeInputs {
    pub fn new(entries: Vec<(NodeId, serde_json::Value)>) -> Self {
        Self { entries }
    }

    /// Value of a named input
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Deserialize a named input into a concrete type
    pub fn parse<T: DeserializeOwned>(&self, name: &str) -> std::result::Result<T, ComputeError> {
        let value = self
            .get(name)
            .ok_or_else(|| ComputeError::new(format!("missing input '{}'", name)))?;
        serde_json::from_value(value.clone())
            .map_err(|e| ComputeError::new(format!("input '{}': {}", name, e)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &serde_json::Value)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// User logic that produces a node's value from its inputs
#[async_trait]
pub trait NodeComputation: Send + Sync {
    async fn compute(
        &self,
        inputs: &NodeInputs,
    ) -> std::result::Result<serde_json::Value, ComputeError>;
}

type SyncCallback =
    dyn Fn(&NodeInputs) -> std::result::Result<serde_json::Value, ComputeError> + Send + Sync;

/// Synchronous closure computation
pub struct FnComputation {
    callback: Box<SyncCallback>,
}

impl FnComputation {
    pub fn new(
        callback: impl Fn(&NodeInputs) -> std::result::Result<serde_json::Value, ComputeError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

#[async_trait]
impl NodeComputation for FnComputation {
    async fn compute(
        &self,
        inputs: &NodeInputs,
    ) -> std::result::Result<serde_json::Value, ComputeError> {
        (self.callback)(inputs)
    }
}

type ComputeFuture =
    Pin<Box<dyn Future<Output = std::result::Result<serde_json::Value, ComputeError>> + Send>>;

/// Async closure computation
///
/// The closure receives an owned copy of the inputs so the returned future
/// can be `'static`.
pub struct AsyncFnComputation {
    callback: Box<dyn Fn(NodeInputs) -> ComputeFuture + Send + Sync>,
}

impl AsyncFnComputation {
    pub fn new<F, Fut>(callback: F) -> Self
    where
        F: Fn(NodeInputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<serde_json::Value, ComputeError>> + Send + 'static,
    {
        Self {
            callback: Box::new(move |inputs| Box::pin(callback(inputs))),
        }
    }
}

#[async_trait]
impl NodeComputation for AsyncFnComputation {
    async fn compute(
        &self,
        inputs: &NodeInputs,
    ) -> std::result::Result<serde_json::Value, ComputeError> {
        (self.callback)(inputs.clone()).await
    }
}

/// Where an import node's value comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportBinding {
    /// Address of the remote layer's publication endpoint
    pub remote: String,
    /// Node name on the remote layer
    pub remote_node: NodeId,
    /// Interval between polls
    pub poll_interval: Duration,
    /// Consecutive failed polls tolerated before the import is marked failed
    pub staleness_threshold: Option<u32>,
    /// Timeout for a single fetch
    pub request_timeout: Duration,
}

impl ImportBinding {
    pub fn new(remote: impl Into<String>, remote_node: impl Into<NodeId>) -> Self {
        Self {
            remote: remote.into(),
            remote_node: remote_node.into(),
            poll_interval: Duration::from_secs(5),
            staleness_threshold: None,
            request_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_staleness_threshold(mut self, polls: u32) -> Self {
        self.staleness_threshold = Some(polls);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// How a node's value is produced
#[derive(Clone)]
pub enum NodeKind {
    /// Ordinary local computation
    Compute(Arc<dyn NodeComputation>),
    /// Computation whose value is a list of proposed actions
    Plan(Arc<dyn NodeComputation>),
    /// Value mirrored from another layer's publication endpoint
    Import(ImportBinding),
}

impl std::fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Compute(_) => f.write_str("Compute"),
            Self::Plan(_) => f.write_str("Plan"),
            Self::Import(binding) => f.debug_tuple("Import").field(binding).finish(),
        }
    }
}

/// A registered node
#[derive(Debug, Clone)]
pub struct NodeDefinition {
    pub name: NodeId,
    pub inputs: Vec<NodeId>,
    pub kind: NodeKind,
}

impl NodeDefinition {
    pub fn is_import(&self) -> bool {
        matches!(self.kind, NodeKind::Import(_))
    }

    pub fn is_plan(&self) -> bool {
        matches!(self.kind, NodeKind::Plan(_))
    }

    pub fn import_binding(&self) -> Option<&ImportBinding> {
        match &self.kind {
            NodeKind::Import(binding) => Some(binding),
            _ => None,
        }
    }
}

/// Registry of the nodes of one layer, in registration order
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: Vec<NodeDefinition>,
    index: HashMap<NodeId, usize>,
    publishable: HashSet<NodeId>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a computation node
    pub fn register(
        &mut self,
        name: impl Into<NodeId>,
        inputs: &[&str],
        computation: Arc<dyn NodeComputation>,
    ) -> Result<()> {
        self.insert(name.into(), owned(inputs), NodeKind::Compute(computation))
    }

    /// Register a computation node backed by a synchronous closure
    pub fn register_fn(
        &mut self,
        name: impl Into<NodeId>,
        inputs: &[&str],
        callback: impl Fn(&NodeInputs) -> std::result::Result<serde_json::Value, ComputeError>
            + Send
            + Sync
            + 'static,
    ) -> Result<()> {
        self.register(name, inputs, Arc::new(FnComputation::new(callback)))
    }

    /// Register a plan node from a computation that returns a JSON list of actions
    pub fn register_plan(
        &mut self,
        name: impl Into<NodeId>,
        inputs: &[&str],
        computation: Arc<dyn NodeComputation>,
    ) -> Result<()> {
        self.insert(name.into(), owned(inputs), NodeKind::Plan(computation))
    }

    /// Register a plan node backed by a closure returning typed proposals
    pub fn register_plan_fn(
        &mut self,
        name: impl Into<NodeId>,
        inputs: &[&str],
        planner: impl Fn(&NodeInputs) -> std::result::Result<Vec<ProposedAction>, ComputeError>
            + Send
            + Sync
            + 'static,
    ) -> Result<()> {
        let computation = FnComputation::new(move |inputs| {
            let proposals = planner(inputs)?;
            Ok(serde_json::to_value(proposals)?)
        });
        self.register_plan(name, inputs, Arc::new(computation))
    }

    /// Register an import node; imports have no local inputs
    pub fn register_import(
        &mut self,
        name: impl Into<NodeId>,
        binding: ImportBinding,
    ) -> Result<()> {
        self.insert(name.into(), Vec::new(), NodeKind::Import(binding))
    }

    /// Mark a registered node as visible on the publication endpoint
    pub fn publish(&mut self, name: &str) -> Result<()> {
        if !self.index.contains_key(name) {
            return Err(LayerError::UnknownNode(name.to_string()));
        }
        self.publishable.insert(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&NodeDefinition> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Registration index of a node
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// All nodes in registration order
    pub fn nodes(&self) -> &[NodeDefinition] {
        &self.nodes
    }

    pub fn imports(&self) -> impl Iterator<Item = &NodeDefinition> {
        self.nodes.iter().filter(|n| n.is_import())
    }

    pub fn publishable(&self) -> &HashSet<NodeId> {
        &self.publishable
    }

    pub fn is_publishable(&self, name: &str) -> bool {
        self.publishable.contains(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn insert(&mut self, name: NodeId, inputs: Vec<NodeId>, kind: NodeKind) -> Result<()> {
        if self.index.contains_key(&name) {
            return Err(LayerError::DuplicateNode(name));
        }
        log::debug!("Registered node '{}' ({:?}) with inputs {:?}", name, kind, inputs);
        self.index.insert(name.clone(), self.nodes.len());
        self.nodes.push(NodeDefinition { name, inputs, kind });
        Ok(())
    }
}

fn owned(inputs: &[&str]) -> Vec<NodeId> {
    inputs.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_preserves_order() {
        let mut registry = NodeRegistry::new();
        registry.register_fn("a", &[], |_| Ok(json!(1))).unwrap();
        registry.register_fn("b", &["a"], |_| Ok(json!(2))).unwrap();
        registry
            .register_import("x", ImportBinding::new("http://upstream", "ctx"))
            .unwrap();

        let names: Vec<&str> = registry.nodes().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "x"]);
        assert_eq!(registry.position("b"), Some(1));
        assert!(registry.get("x").unwrap().is_import());
        assert_eq!(registry.imports().count(), 1);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = NodeRegistry::new();
        registry.register_fn("a", &[], |_| Ok(json!(1))).unwrap();
        let err = registry.register_fn("a", &[], |_| Ok(json!(2))).unwrap_err();
        assert!(matches!(err, LayerError::DuplicateNode(name) if name == "a"));
    }

    #[test]
    fn test_publish_requires_registered_node() {
        let mut registry = NodeRegistry::new();
        registry.register_fn("a", &[], |_| Ok(json!(1))).unwrap();
        registry.publish("a").unwrap();
        assert!(registry.is_publishable("a"));
        assert!(matches!(registry.publish("nope"), Err(LayerError::UnknownNode(_))));
    }

    #[test]
    fn test_inputs_parse() {
        let inputs = NodeInputs::new(vec![("a".into(), json!(41)), ("s".into(), json!("x"))]);
        let a: i64 = inputs.parse("a").unwrap();
        assert_eq!(a, 41);
        assert!(inputs.parse::<i64>("s").is_err());
        assert!(inputs.parse::<i64>("missing").is_err());
    }

    #[tokio::test]
    async fn test_async_fn_computation() {
        let computation = AsyncFnComputation::new(|inputs: NodeInputs| async move {
            let a: i64 = inputs.parse("a")?;
            Ok(json!(a * 2))
        });
        let inputs = NodeInputs::new(vec![("a".into(), json!(21))]);
        assert_eq!(computation.compute(&inputs).await.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn test_plan_fn_serializes_proposals() {
        let mut registry = NodeRegistry::new();
        registry.register_fn("ctx", &[], |_| Ok(json!({}))).unwrap();
        registry
            .register_plan_fn("plan", &["ctx"], |_| {
                Ok(vec![ProposedAction::new("add_clues", "ctx", json!({"clues": ["x"]}))])
            })
            .unwrap();

        let node = registry.get("plan").unwrap();
        assert!(node.is_plan());
        let NodeKind::Plan(computation) = &node.kind else {
            panic!("expected plan node");
        };
        let value = computation.compute(&NodeInputs::default()).await.unwrap();
        assert_eq!(value[0]["key"], "add_clues");
        assert_eq!(value[0]["target"], "ctx");
    }
}
