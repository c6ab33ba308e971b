//! Layer assembly
//!
//! A [`Layer`] is one running engine instance: its own registry, graph, value
//! store, scheduler task, import pollers, action ledger and publication
//! endpoint. Several layers can run in one process; nothing is global.
//!
//! # Example
//!
//! ```ignore
//! use layerstack_engine::{LayerBuilder, LocalConnector};
//!
//! let layer1 = LayerBuilder::new("context")
//!     .node_fn("context", &[], |_| Ok(load_context()?))
//!     .node_fn("metrics", &["context"], compute_metrics)
//!     .publish("metrics")
//!     .start()
//!     .await?;
//!
//! let layer2 = LayerBuilder::new("analysis")
//!     .connector(LocalConnector::new().with_layer("context", layer1.publication()))
//!     .import("metrics", ImportBinding::new("context", "metrics"))
//!     .node_fn("sessions", &["metrics"], analyze_sessions)
//!     .start()
//!     .await?;
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::actions::{
    Action, ActionApplier, ActionLedger, ApplyOutcome, ApprovalGate, GatedActionExecutor,
    InMemoryApprovals, LogApplier, ProposedAction,
};
use crate::config::LayerConfig;
use crate::error::{ComputeError, LayerError, Result};
use crate::events::{EventSink, NullEventSink};
use crate::executor::{ReactiveExecutor, RunReport};
use crate::graph::Graph;
use crate::import::{self, ImportAdapter, PollOutcome, RemoteSource, SourceConnector};
use crate::publication::{Publication, PublishedValue};
use crate::registry::{FnComputation, ImportBinding, NodeComputation, NodeInputs, NodeRegistry};
use crate::scheduler::{ApplyResults, Scheduler, SchedulerHandle};
use crate::store::ValueStore;
use crate::types::{FailureReason, NodeId, NodeStatus, ValueRecord};

/// Computations bound by node name, for config-driven layers
pub type Computations = HashMap<String, Arc<dyn NodeComputation>>;

/// Fluent builder for a layer
///
/// Registration errors are held until [`LayerBuilder::start`], which reports
/// the first one.
pub struct LayerBuilder {
    name: String,
    registry: NodeRegistry,
    error: Option<LayerError>,
    sources: HashMap<NodeId, Arc<dyn RemoteSource>>,
    connector: Option<Arc<dyn SourceConnector>>,
    events: Arc<dyn EventSink>,
    gate: Arc<dyn ApprovalGate>,
    applier: Arc<dyn ActionApplier>,
    ledger_path: Option<PathBuf>,
    poll_imports: bool,
}

impl LayerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            registry: NodeRegistry::new(),
            error: None,
            sources: HashMap::new(),
            connector: None,
            events: Arc::new(NullEventSink),
            gate: Arc::new(InMemoryApprovals::new()),
            applier: Arc::new(LogApplier),
            ledger_path: None,
            poll_imports: true,
        }
    }

    /// Build a layer from its configuration and computations bound by name
    pub fn from_config(config: &LayerConfig, mut computations: Computations) -> Result<Self> {
        config.validate()?;
        let mut builder = Self::new(config.name.clone());

        for node in &config.imports {
            builder = builder.import(node.name.clone(), node.binding());
            if node.publish {
                builder = builder.publish(node.name.clone());
            }
        }
        for node in &config.nodes {
            let computation = computations
                .remove(&node.name)
                .ok_or_else(|| LayerError::MissingComputation(node.name.clone()))?;
            let inputs: Vec<&str> = node.inputs.iter().map(String::as_str).collect();
            builder = if node.plan {
                builder.plan(node.name.clone(), &inputs, computation)
            } else {
                builder.node(node.name.clone(), &inputs, computation)
            };
            if node.publish {
                builder = builder.publish(node.name.clone());
            }
        }
        for unused in computations.keys() {
            log::warn!("Computation '{}' is not used by layer '{}'", unused, config.name);
        }
        if let Some(path) = &config.action_ledger {
            builder = builder.action_ledger(path.clone());
        }
        Ok(builder)
    }

    fn record(mut self, result: Result<()>) -> Self {
        if let Err(e) = result {
            self.error.get_or_insert(e);
        }
        self
    }

    /// Add a computation node
    pub fn node(
        mut self,
        name: impl Into<NodeId>,
        inputs: &[&str],
        computation: Arc<dyn NodeComputation>,
    ) -> Self {
        let result = self.registry.register(name, inputs, computation);
        self.record(result)
    }

    /// Add a computation node backed by a closure
    pub fn node_fn(
        self,
        name: impl Into<NodeId>,
        inputs: &[&str],
        callback: impl Fn(&NodeInputs) -> std::result::Result<serde_json::Value, ComputeError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.node(name, inputs, Arc::new(FnComputation::new(callback)))
    }

    /// Add a plan node
    pub fn plan(
        mut self,
        name: impl Into<NodeId>,
        inputs: &[&str],
        computation: Arc<dyn NodeComputation>,
    ) -> Self {
        let result = self.registry.register_plan(name, inputs, computation);
        self.record(result)
    }

    /// Add a plan node backed by a closure returning proposals
    pub fn plan_fn(
        mut self,
        name: impl Into<NodeId>,
        inputs: &[&str],
        planner: impl Fn(&NodeInputs) -> std::result::Result<Vec<ProposedAction>, ComputeError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        let result = self.registry.register_plan_fn(name, inputs, planner);
        self.record(result)
    }

    /// Add an import node; its source comes from the connector
    pub fn import(mut self, name: impl Into<NodeId>, binding: ImportBinding) -> Self {
        let result = self.registry.register_import(name, binding);
        self.record(result)
    }

    /// Add an import node with an explicit source
    pub fn import_from(
        mut self,
        name: impl Into<NodeId>,
        binding: ImportBinding,
        source: Arc<dyn RemoteSource>,
    ) -> Self {
        let name = name.into();
        self.sources.insert(name.clone(), source);
        let result = self.registry.register_import(name, binding);
        self.record(result)
    }

    pub fn connector(mut self, connector: impl SourceConnector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Make a node readable by other layers
    pub fn publish(mut self, name: impl AsRef<str>) -> Self {
        let result = self.registry.publish(name.as_ref());
        self.record(result)
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn approvals(mut self, gate: Arc<dyn ApprovalGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn applier(mut self, applier: Arc<dyn ActionApplier>) -> Self {
        self.applier = applier;
        self
    }

    /// Persist the action ledger to this file
    pub fn action_ledger(mut self, path: impl Into<PathBuf>) -> Self {
        self.ledger_path = Some(path.into());
        self
    }

    /// Whether imports are polled in the background (default: true)
    ///
    /// With polling off, imports only update through [`Layer::refresh_import`].
    pub fn poll_imports(mut self, enabled: bool) -> Self {
        self.poll_imports = enabled;
        self
    }

    /// Build the graph, start the scheduler, run every source once and start
    /// the import pollers
    pub async fn start(self) -> Result<Layer> {
        if let Some(e) = self.error {
            log::error!("Layer '{}' rejected: {}", self.name, e);
            return Err(e);
        }

        let graph = Arc::new(Graph::build(self.registry)?);
        let store = Arc::new(ValueStore::with_nodes(graph.plan().order()));

        let mut sources = self.sources;
        let mut adapters = HashMap::new();
        for def in graph.registry().imports() {
            let Some(binding) = def.import_binding() else {
                continue;
            };
            let source = match sources.remove(&def.name) {
                Some(source) => source,
                None => self
                    .connector
                    .as_ref()
                    .ok_or_else(|| {
                        LayerError::InvalidConfig(format!("no source for import '{}'", def.name))
                    })?
                    .connect(binding)?,
            };
            let adapter = ImportAdapter::new(
                def.name.clone(),
                binding.clone(),
                source,
                Arc::clone(&self.events),
            );
            adapters.insert(def.name.clone(), Arc::new(Mutex::new(adapter)));
        }

        let mut ledger = match &self.ledger_path {
            Some(path) => ActionLedger::with_persistence(path),
            None => ActionLedger::new(),
        };
        ledger.load_from_disk()?;
        let actions = GatedActionExecutor::new(
            ledger,
            Arc::clone(&self.gate),
            self.applier,
            Arc::clone(&self.events),
        );
        let ledger = actions.ledger();

        let executor = ReactiveExecutor::new(Arc::clone(&graph), Arc::clone(&store), self.events);
        let (scheduler, handle) = Scheduler::new(executor, actions);
        let mut tasks = vec![scheduler.spawn()];

        log::info!(
            "Layer '{}' starting with {} nodes ({} imports)",
            self.name,
            graph.plan().len(),
            adapters.len()
        );
        handle.run(graph.plan().sources()).await?;

        if self.poll_imports {
            for adapter in adapters.values() {
                tasks.push(import::spawn(Arc::clone(adapter), handle.clone()));
            }
        }

        Ok(Layer {
            name: self.name,
            publication: Publication::new(Arc::clone(&graph), Arc::clone(&store)),
            graph,
            store,
            scheduler: handle,
            ledger,
            gate: self.gate,
            adapters,
            tasks,
        })
    }
}

/// A running layer
pub struct Layer {
    name: String,
    graph: Arc<Graph>,
    store: Arc<ValueStore>,
    publication: Publication,
    scheduler: SchedulerHandle,
    ledger: Arc<RwLock<ActionLedger>>,
    gate: Arc<dyn ApprovalGate>,
    adapters: HashMap<NodeId, Arc<Mutex<ImportAdapter>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Layer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Handle to this layer's publication endpoint
    pub fn publication(&self) -> Publication {
        self.publication.clone()
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    /// Published record of a node
    pub fn get(&self, name: &str) -> Result<PublishedValue> {
        self.publication.get(name)
    }

    /// Record of any node, published or not
    pub fn record(&self, name: &str) -> Option<Arc<ValueRecord>> {
        self.store.get(name)
    }

    /// Current value of any node, or the failure behind it
    ///
    /// `None` while the node is still pending. A node that failed because of
    /// an input reports the failure where it started.
    pub fn value(&self, name: &str) -> Result<Option<serde_json::Value>> {
        let mut node = name.to_string();
        loop {
            let record = self
                .store
                .get(&node)
                .ok_or_else(|| LayerError::UnknownNode(node.clone()))?;
            match (record.status, &record.error) {
                (NodeStatus::Pending, _) => return Ok(None),
                (_, None) if node == name => return Ok(Some(record.value.clone())),
                // The input recovered after this node was marked
                (_, None) => return Err(LayerError::failed(name, "input failed")),
                (_, Some(FailureReason::UpstreamFailed { input })) => node = input.clone(),
                (_, Some(FailureReason::ComputationFailed { message }))
                | (_, Some(FailureReason::RemoteFailed { message })) => {
                    return Err(LayerError::failed(node, message.clone()))
                }
                (_, Some(FailureReason::UpstreamUnreachable { message })) => {
                    return Err(LayerError::UpstreamUnreachable {
                        node,
                        message: message.clone(),
                    })
                }
            }
        }
    }

    /// Run the given nodes (for example a source whose data changed)
    pub async fn trigger(&self, nodes: &[&str]) -> Result<RunReport> {
        for node in nodes {
            if self.graph.plan().position(node).is_none() {
                return Err(LayerError::UnknownNode(node.to_string()));
            }
        }
        self.scheduler
            .run(nodes.iter().map(|n| n.to_string()).collect())
            .await
    }

    /// Poll an import now and wait until any change has been processed
    pub async fn refresh_import(&self, name: &str) -> Result<PollOutcome> {
        let adapter = self
            .adapters
            .get(name)
            .ok_or_else(|| LayerError::UnknownNode(name.to_string()))?;
        let outcome = adapter.lock().await.poll().await;
        if let PollOutcome::Update(update) = &outcome {
            self.scheduler
                .import_and_wait(name.to_string(), update.clone())
                .await?;
        }
        Ok(outcome)
    }

    /// Every action in the ledger, in proposal order
    pub fn actions(&self) -> Vec<Action> {
        self.ledger.read().actions().to_vec()
    }

    pub fn pending_actions(&self) -> Vec<Action> {
        self.ledger.read().pending()
    }

    pub fn archived_actions(&self) -> Vec<Action> {
        self.ledger.read().archived()
    }

    pub fn is_approved(&self, action_id: &str) -> bool {
        self.gate.is_approved(action_id)
    }

    /// Approve an action and apply it
    pub async fn approve(&self, action_id: &str) -> Result<ApplyOutcome> {
        self.scheduler.approve(action_id).await
    }

    pub async fn discard(&self, action_id: &str) -> Result<bool> {
        self.scheduler.discard(action_id).await
    }

    /// Apply everything the approval gate currently reports approved
    pub async fn apply_approved(&self) -> Result<ApplyResults> {
        self.scheduler.apply_approved().await
    }

    /// Stop pollers and the scheduler
    pub async fn shutdown(mut self) {
        log::info!("Layer '{}' shutting down", self.name);
        self.scheduler.shutdown();
        let mut tasks = std::mem::take(&mut self.tasks);
        // The scheduler task is first; pollers never finish on their own
        let scheduler = if tasks.is_empty() { None } else { Some(tasks.remove(0)) };
        for task in tasks {
            task.abort();
        }
        if let Some(scheduler) = scheduler {
            if let Err(e) = scheduler.await {
                log::warn!("Scheduler of '{}' ended abnormally: {}", self.name, e);
            }
        }
    }
}

impl Drop for Layer {
    fn drop(&mut self) {
        self.scheduler.shutdown();
        for task in &self.tasks {
            task.abort();
        }
    }
}
