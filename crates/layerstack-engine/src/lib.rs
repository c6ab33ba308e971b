//! Layerstack engine - reactive dependency execution for stacked layers
//!
//! A layer computes named values from declared inputs, publishes some of
//! them, and may import values published by other layers as if they were
//! local. When something changes, only the affected part of the graph runs:
//!
//! - Topological execution with ties broken by registration order
//! - Fingerprint-gated propagation: an unchanged value stops the run
//! - Failure containment to the failed node's downstream set
//! - Import nodes fed by polling another layer's publication endpoint
//! - Gated actions: proposed by plan nodes, applied at most once after approval
//!
//! # Architecture
//!
//! - `NodeRegistry` / `Graph`: declared nodes and the cached execution plan
//! - `ValueStore`: per-node value records, swapped whole
//! - `ReactiveExecutor`: one run cycle over the affected subgraph
//! - `Scheduler`: the single loop per layer that coalesces requests
//! - `ImportAdapter`: remote change detection and staleness
//! - `GatedActionExecutor`: approval-gated side effects with a durable ledger
//! - `Layer` / `LayerBuilder`: assembles and runs all of the above
//!
//! Transports live outside this crate; `RemoteSource` and `Publication`
//! are the seams they plug into.

pub mod actions;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod fingerprint;
pub mod graph;
pub mod import;
pub mod layer;
pub mod publication;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod types;

// Re-export key types
pub use actions::{
    Action, ActionApplier, ActionLedger, ActionState, ApplyOutcome, ApprovalGate, DiscardReason,
    FnApplier, GatedActionExecutor, InMemoryApprovals, LogApplier, ProposedAction,
};
pub use config::{ImportConfig, LayerConfig, NodeConfig};
pub use error::{ComputeError, FetchError, LayerError, Result};
pub use events::{ChannelEventSink, EventSink, LayerEvent, NullEventSink, VecEventSink};
pub use executor::{ReactiveExecutor, RunReport};
pub use fingerprint::Fingerprint;
pub use graph::{ExecutionPlan, Graph};
pub use import::{
    ImportAdapter, ImportUpdate, LocalConnector, PollOutcome, PublicationSource, RemoteSource,
    SourceConnector,
};
pub use layer::{Computations, Layer, LayerBuilder};
pub use publication::{Publication, PublishedValue};
pub use registry::{
    AsyncFnComputation, FnComputation, ImportBinding, NodeComputation, NodeDefinition, NodeInputs,
    NodeKind, NodeRegistry,
};
pub use scheduler::{ApplyResults, Scheduler, SchedulerHandle};
pub use store::ValueStore;
pub use types::{FailureReason, NodeId, NodeStatus, ValueRecord};
