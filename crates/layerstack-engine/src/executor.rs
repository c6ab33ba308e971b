//! Reactive executor
//!
//! Push-based re-evaluation with fingerprint-gated propagation. A run starts
//! from a set of trigger nodes and walks forward through the execution
//! plan, always in topological order:
//!
//! - **Triggers always run**: they are the nodes believed to have new inputs
//!   (a source re-reading its data, an import that just received a value).
//! - **Consumers run only when an input changed**: a node is scheduled when one
//!   of its inputs got a new fingerprint or changed status.
//! - **Unchanged fingerprint stops propagation**: a recomputed node whose value
//!   hashes the same as before leaves its consumers untouched.
//! - **Failures are contained**: a failed node fails its downstream set without
//!   running it, and nothing outside that set is touched.
//!
//! Because every input sits earlier in the plan than its consumer, a node is
//! visited only after all of its inputs are settled for this run.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::actions::ProposedAction;
use crate::error::{LayerError, Result};
use crate::events::{emit, EventSink, LayerEvent};
use crate::fingerprint::Fingerprint;
use crate::graph::Graph;
use crate::registry::{NodeInputs, NodeKind};
use crate::store::ValueStore;
use crate::types::{FailureReason, NodeId, NodeStatus, ValueRecord};

/// What happened during one run cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub cycle: u64,
    /// Nodes whose computation was invoked, in execution order
    pub invoked: Vec<NodeId>,
    /// Nodes whose version advanced
    pub changed: Vec<NodeId>,
    /// Nodes that recomputed to the same fingerprint
    pub unchanged: Vec<NodeId>,
    /// Nodes that ended the run failed
    pub failed: Vec<NodeId>,
    /// Nodes that could not run because an input is still pending
    pub blocked: Vec<NodeId>,
}

impl RunReport {
    pub fn was_invoked(&self, node: &str) -> bool {
        self.invoked.iter().any(|n| n == node)
    }

    pub fn was_changed(&self, node: &str) -> bool {
        self.changed.iter().any(|n| n == node)
    }
}

/// Outcome of visiting a single node
struct Visit {
    propagate: bool,
}

/// Runs a layer's graph against its value store
pub struct ReactiveExecutor {
    graph: Arc<Graph>,
    store: Arc<ValueStore>,
    events: Arc<dyn EventSink>,
    cycle: u64,
}

impl ReactiveExecutor {
    pub fn new(graph: Arc<Graph>, store: Arc<ValueStore>, events: Arc<dyn EventSink>) -> Self {
        Self {
            graph,
            store,
            events,
            cycle: 0,
        }
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn store(&self) -> &Arc<ValueStore> {
        &self.store
    }

    /// Run every source node (the initial run of a layer)
    pub async fn run_sources(&mut self) -> Result<RunReport> {
        let sources = self.graph.plan().sources();
        self.run(&sources).await
    }

    /// Run the triggers and whatever their changes reach
    pub async fn run(&mut self, triggers: &[NodeId]) -> Result<RunReport> {
        let graph = Arc::clone(&self.graph);
        let plan = graph.plan();

        let mut queue = BTreeSet::new();
        for name in triggers {
            let pos = plan
                .position(name)
                .ok_or_else(|| LayerError::UnknownNode(name.clone()))?;
            queue.insert(pos);
        }
        let triggered: HashSet<usize> = queue.iter().copied().collect();

        self.cycle += 1;
        let mut report = RunReport {
            run_id: uuid::Uuid::new_v4().to_string(),
            cycle: self.cycle,
            ..Default::default()
        };
        let started = Instant::now();

        log::debug!("Run {} started with triggers {:?}", report.cycle, triggers);
        emit(
            self.events.as_ref(),
            LayerEvent::RunStarted {
                run_id: report.run_id.clone(),
                triggers: triggers.to_vec(),
            },
        );

        while let Some(pos) = queue.pop_first() {
            let visit = self.visit(&graph, pos, triggered.contains(&pos), &mut report).await;
            if visit.propagate {
                queue.extend(plan.dependents_at(pos).iter().copied());
            }
        }

        log::info!(
            "Run {} finished: {} invoked, {} changed, {} failed",
            report.cycle,
            report.invoked.len(),
            report.changed.len(),
            report.failed.len()
        );
        emit(
            self.events.as_ref(),
            LayerEvent::RunCompleted {
                run_id: report.run_id.clone(),
                invoked: report.invoked.len(),
                changed: report.changed.len(),
                failed: report.failed.len(),
                duration_ms: started.elapsed().as_millis() as u64,
            },
        );

        Ok(report)
    }

    /// Mark a node and its whole downstream set failed without running anything
    ///
    /// Returns the nodes whose status changed to failed.
    pub fn mark_failed(&mut self, name: &str, reason: FailureReason) -> Result<Vec<NodeId>> {
        let graph = Arc::clone(&self.graph);
        let plan = graph.plan();
        let pos = plan
            .position(name)
            .ok_or_else(|| LayerError::UnknownNode(name.to_string()))?;

        let mut newly_failed = Vec::new();
        let current = self.record(name);
        if !current.is_failed() || current.error.as_ref() != Some(&reason) {
            log::warn!("Node '{}' failed: {}", name, reason);
            emit(self.events.as_ref(), LayerEvent::node_failed(name, &reason));
            self.store
                .replace(name, current.failed(reason, self.store.tick()));
            if !current.is_failed() {
                newly_failed.push(name.to_string());
            }
        }

        for &down in plan.downstream_at(pos) {
            let down_name = plan.node_at(down);
            let Some(cause) = self.first_failed_input(&graph, down) else {
                continue;
            };
            let current = self.record(down_name);
            if current.is_failed() {
                continue;
            }
            let reason = FailureReason::UpstreamFailed { input: cause };
            emit(self.events.as_ref(), LayerEvent::node_failed(down_name, &reason));
            self.store
                .replace(down_name, current.failed(reason, self.store.tick()));
            newly_failed.push(down_name.clone());
        }

        Ok(newly_failed)
    }

    async fn visit(
        &mut self,
        graph: &Graph,
        pos: usize,
        triggered: bool,
        report: &mut RunReport,
    ) -> Visit {
        let plan = graph.plan();
        let def = graph.definition_at(pos);
        let name = def.name.as_str();
        let current = self.record(name);

        let computation = match &def.kind {
            // Import records are written before the run; a triggered import
            // only needs to wake its consumers.
            NodeKind::Import(_) => {
                if current.is_failed() {
                    report.failed.push(name.to_string());
                }
                return Visit {
                    propagate: triggered && current.status != NodeStatus::Pending,
                };
            }
            NodeKind::Compute(c) | NodeKind::Plan(c) => Arc::clone(c),
        };

        let mut failed_input = None;
        let mut pending_input = false;
        let mut values = Vec::with_capacity(plan.inputs_at(pos).len());
        for &input in plan.inputs_at(pos) {
            let input_name = plan.node_at(input);
            let record = self.record(input_name);
            match record.status {
                NodeStatus::Failed => {
                    if failed_input.is_none() {
                        failed_input = Some(input_name.clone());
                    }
                }
                NodeStatus::Pending => pending_input = true,
                NodeStatus::Fresh => values.push((input_name.clone(), record.value.clone())),
            }
        }

        if let Some(input) = failed_input {
            let reason = FailureReason::UpstreamFailed { input };
            report.failed.push(name.to_string());
            if current.error.as_ref() != Some(&reason) {
                emit(self.events.as_ref(), LayerEvent::node_failed(name, &reason));
                self.store
                    .replace(name, current.failed(reason, self.store.tick()));
            }
            return Visit {
                propagate: !current.is_failed(),
            };
        }

        if pending_input {
            log::debug!("Node '{}' blocked on a pending input", name);
            report.blocked.push(name.to_string());
            return Visit { propagate: false };
        }

        report.invoked.push(name.to_string());
        let inputs = NodeInputs::new(values);
        let result = computation
            .compute(&inputs)
            .await
            .map_err(|e| e.message)
            .and_then(|value| {
                if def.is_plan() {
                    validate_plan_output(&value)?;
                }
                Ok(value)
            });

        match result {
            Ok(value) => {
                let fingerprint = Fingerprint::of(&value);
                let next = current.succeeded(value, fingerprint, self.store.tick());
                let changed = next.version != current.version;
                let recovered = current.status != NodeStatus::Fresh;
                let version = next.version;
                self.store.replace(name, next);

                if changed {
                    report.changed.push(name.to_string());
                } else {
                    report.unchanged.push(name.to_string());
                }
                log::debug!(
                    "Node '{}' computed v{} ({})",
                    name,
                    version,
                    if changed { "changed" } else { "unchanged" }
                );
                emit(
                    self.events.as_ref(),
                    LayerEvent::NodeComputed {
                        node: name.to_string(),
                        version,
                        changed,
                    },
                );
                Visit {
                    propagate: changed || recovered,
                }
            }
            Err(message) => {
                let reason = FailureReason::ComputationFailed { message };
                log::warn!("Node '{}' failed: {}", name, reason);
                report.failed.push(name.to_string());
                emit(self.events.as_ref(), LayerEvent::node_failed(name, &reason));
                self.store
                    .replace(name, current.failed(reason, self.store.tick()));
                Visit {
                    propagate: !current.is_failed(),
                }
            }
        }
    }

    fn first_failed_input(&self, graph: &Graph, pos: usize) -> Option<NodeId> {
        let plan = graph.plan();
        plan.inputs_at(pos)
            .iter()
            .map(|&i| plan.node_at(i))
            .find(|input| self.record(input).is_failed())
            .cloned()
    }

    fn record(&self, name: &str) -> Arc<ValueRecord> {
        self.store
            .get(name)
            .unwrap_or_else(|| Arc::new(ValueRecord::pending()))
    }
}

fn validate_plan_output(value: &serde_json::Value) -> std::result::Result<(), String> {
    serde_json::from_value::<Vec<ProposedAction>>(value.clone())
        .map(|_| ())
        .map_err(|e| format!("plan output is not a list of actions: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{NullEventSink, VecEventSink};
    use crate::registry::NodeRegistry;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

    /// Counts invocations per node
    #[derive(Default, Clone)]
    struct Calls(Arc<parking_lot::Mutex<HashMap<String, usize>>>);

    impl Calls {
        fn hit(&self, node: &str) {
            *self.0.lock().entry(node.to_string()).or_default() += 1;
        }

        fn get(&self, node: &str) -> usize {
            self.0.lock().get(node).copied().unwrap_or(0)
        }
    }

    fn executor_for(registry: NodeRegistry) -> ReactiveExecutor {
        let graph = Arc::new(Graph::build(registry).unwrap());
        let store = Arc::new(ValueStore::with_nodes(graph.plan().order()));
        ReactiveExecutor::new(graph, store, Arc::new(NullEventSink))
    }

    fn value_version(exec: &ReactiveExecutor, node: &str) -> (serde_json::Value, u64) {
        let record = exec.store().get(node).unwrap();
        (record.value.clone(), record.version)
    }

    /// A = source, B = A + 1, C = B * 2
    fn abc(source: Arc<AtomicI64>, calls: Calls) -> NodeRegistry {
        let mut registry = NodeRegistry::new();
        let c = calls.clone();
        registry
            .register_fn("A", &[], move |_| {
                c.hit("A");
                Ok(json!(source.load(Ordering::SeqCst)))
            })
            .unwrap();
        let c = calls.clone();
        registry
            .register_fn("B", &["A"], move |inputs| {
                c.hit("B");
                Ok(json!(inputs.parse::<i64>("A")? + 1))
            })
            .unwrap();
        let c = calls;
        registry
            .register_fn("C", &["B"], move |inputs| {
                c.hit("C");
                Ok(json!(inputs.parse::<i64>("B")? * 2))
            })
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_abc_scenario() {
        let source = Arc::new(AtomicI64::new(1));
        let calls = Calls::default();
        let mut exec = executor_for(abc(source.clone(), calls.clone()));

        let report = exec.run_sources().await.unwrap();
        assert_eq!(report.invoked, vec!["A", "B", "C"]);
        assert_eq!(value_version(&exec, "A"), (json!(1), 1));
        assert_eq!(value_version(&exec, "B"), (json!(2), 1));
        assert_eq!(value_version(&exec, "C"), (json!(4), 1));

        // Same value again: nothing changes, nothing downstream runs
        let report = exec.run(&["A".to_string()]).await.unwrap();
        assert_eq!(report.invoked, vec!["A"]);
        assert!(report.changed.is_empty());
        assert_eq!(value_version(&exec, "A"), (json!(1), 1));
        assert_eq!(value_version(&exec, "C"), (json!(4), 1));
        assert_eq!(calls.get("B"), 1);

        source.store(2, Ordering::SeqCst);
        let report = exec.run(&["A".to_string()]).await.unwrap();
        assert_eq!(report.changed, vec!["A", "B", "C"]);
        assert_eq!(value_version(&exec, "A"), (json!(2), 2));
        assert_eq!(value_version(&exec, "B"), (json!(3), 2));
        assert_eq!(value_version(&exec, "C"), (json!(6), 2));
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let source = Arc::new(AtomicI64::new(5));
        let calls = Calls::default();
        let mut exec = executor_for(abc(source, calls.clone()));

        exec.run_sources().await.unwrap();
        let before = exec.store().snapshot();
        let report = exec.run_sources().await.unwrap();

        assert!(report.changed.is_empty());
        assert_eq!(calls.get("B"), 1);
        assert_eq!(calls.get("C"), 1);
        for (name, record) in exec.store().snapshot() {
            assert_eq!(record.version, before[&name].version, "{} version moved", name);
        }
    }

    #[tokio::test]
    async fn test_unchanged_fingerprint_stops_propagation() {
        let source = Arc::new(AtomicI64::new(3));
        let calls = Calls::default();
        let mut registry = NodeRegistry::new();
        let s = source.clone();
        registry
            .register_fn("raw", &[], move |_| Ok(json!(s.load(Ordering::SeqCst))))
            .unwrap();
        // Parity only changes every other step of `raw`
        let c = calls.clone();
        registry
            .register_fn("parity", &["raw"], move |inputs| {
                c.hit("parity");
                Ok(json!(inputs.parse::<i64>("raw")? % 2))
            })
            .unwrap();
        let c = calls.clone();
        registry
            .register_fn("label", &["parity"], move |inputs| {
                c.hit("label");
                Ok(json!(format!("p{}", inputs.parse::<i64>("parity")?)))
            })
            .unwrap();
        let mut exec = executor_for(registry);

        exec.run_sources().await.unwrap();
        source.store(5, Ordering::SeqCst);
        let report = exec.run(&["raw".to_string()]).await.unwrap();

        assert!(report.was_invoked("parity"));
        assert!(!report.was_invoked("label"));
        assert_eq!(calls.get("parity"), 2);
        assert_eq!(calls.get("label"), 1);
        assert_eq!(value_version(&exec, "raw").1, 2);
        assert_eq!(value_version(&exec, "parity").1, 1);
    }

    #[tokio::test]
    async fn test_diamond_runs_join_once() {
        let source = Arc::new(AtomicI64::new(1));
        let calls = Calls::default();
        let mut registry = NodeRegistry::new();
        let s = source.clone();
        registry
            .register_fn("a", &[], move |_| Ok(json!(s.load(Ordering::SeqCst))))
            .unwrap();
        registry
            .register_fn("b", &["a"], |i| Ok(json!(i.parse::<i64>("a")? + 1)))
            .unwrap();
        registry
            .register_fn("c", &["a"], |i| Ok(json!(i.parse::<i64>("a")? + 2)))
            .unwrap();
        let c = calls.clone();
        registry
            .register_fn("d", &["b", "c"], move |i| {
                c.hit("d");
                // Never sees b and c from different versions of a
                let (b, c) = (i.parse::<i64>("b")?, i.parse::<i64>("c")?);
                assert_eq!(c - b, 1);
                Ok(json!(b + c))
            })
            .unwrap();
        let mut exec = executor_for(registry);

        exec.run_sources().await.unwrap();
        source.store(10, Ordering::SeqCst);
        exec.run(&["a".to_string()]).await.unwrap();

        assert_eq!(calls.get("d"), 2);
        assert_eq!(value_version(&exec, "d"), (json!(23), 2));
    }

    #[tokio::test]
    async fn test_failure_contained_to_downstream() {
        let broken = Arc::new(AtomicBool::new(false));
        let mut registry = NodeRegistry::new();
        let b = broken.clone();
        registry
            .register_fn("left", &[], move |_| {
                if b.load(Ordering::SeqCst) {
                    Err("disk on fire".into())
                } else {
                    Ok(json!(1))
                }
            })
            .unwrap();
        registry.register_fn("left2", &["left"], |_| Ok(json!("l2"))).unwrap();
        registry.register_fn("left3", &["left2"], |_| Ok(json!("l3"))).unwrap();
        registry.register_fn("right", &[], |_| Ok(json!(2))).unwrap();
        registry.register_fn("right2", &["right"], |_| Ok(json!("r2"))).unwrap();
        let mut exec = executor_for(registry);

        exec.run_sources().await.unwrap();
        let right_before = exec.store().get("right2").unwrap();

        broken.store(true, Ordering::SeqCst);
        let report = exec.run(&["left".to_string()]).await.unwrap();

        assert_eq!(report.failed, vec!["left", "left2", "left3"]);
        assert_eq!(report.invoked, vec!["left"]);
        let left = exec.store().get("left").unwrap();
        assert!(matches!(left.error, Some(FailureReason::ComputationFailed { .. })));
        assert_eq!(left.value, json!(1));
        let left3 = exec.store().get("left3").unwrap();
        assert_eq!(
            left3.error,
            Some(FailureReason::UpstreamFailed {
                input: "left2".into()
            })
        );
        assert_eq!(exec.store().get("right2").unwrap(), right_before);

        // Recovery with the same value still clears the failed consumers
        broken.store(false, Ordering::SeqCst);
        let report = exec.run(&["left".to_string()]).await.unwrap();
        assert_eq!(report.invoked, vec!["left", "left2", "left3"]);
        assert!(report.failed.is_empty());
        assert!(exec.store().get("left3").unwrap().is_fresh());
        assert_eq!(exec.store().get("left3").unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_mark_failed_hits_exactly_downstream() {
        let mut registry = NodeRegistry::new();
        registry.register_fn("s1", &[], |_| Ok(json!(1))).unwrap();
        registry.register_fn("s2", &[], |_| Ok(json!(2))).unwrap();
        registry.register_fn("a", &["s1"], |_| Ok(json!("a"))).unwrap();
        registry.register_fn("b", &["a", "s2"], |_| Ok(json!("b"))).unwrap();
        registry.register_fn("c", &["s2"], |_| Ok(json!("c"))).unwrap();
        let mut exec = executor_for(registry);
        exec.run_sources().await.unwrap();

        let failed = exec
            .mark_failed(
                "s1",
                FailureReason::UpstreamUnreachable {
                    message: "timeout".into(),
                },
            )
            .unwrap();

        assert_eq!(failed, vec!["s1", "a", "b"]);
        let statuses: HashMap<String, NodeStatus> = exec
            .store()
            .snapshot()
            .into_iter()
            .map(|(k, v)| (k, v.status))
            .collect();
        assert_eq!(statuses["s2"], NodeStatus::Fresh);
        assert_eq!(statuses["c"], NodeStatus::Fresh);
        assert_eq!(statuses["b"], NodeStatus::Failed);

        // Marking again reports nothing new
        let again = exec
            .mark_failed(
                "s1",
                FailureReason::UpstreamUnreachable {
                    message: "timeout".into(),
                },
            )
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_pending_input_blocks() {
        let mut registry = NodeRegistry::new();
        registry
            .register_import("up", crate::registry::ImportBinding::new("mem://l1", "ctx"))
            .unwrap();
        registry.register_fn("local", &[], |_| Ok(json!(1))).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        registry
            .register_fn("mix", &["up", "local"], move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(json!(null))
            })
            .unwrap();
        let mut exec = executor_for(registry);

        let report = exec.run_sources().await.unwrap();
        assert_eq!(report.blocked, vec!["mix"]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(exec.store().get("mix").unwrap().status, NodeStatus::Pending);
    }

    #[tokio::test]
    async fn test_invalid_plan_output_fails_node() {
        let mut registry = NodeRegistry::new();
        registry.register_fn("ctx", &[], |_| Ok(json!({}))).unwrap();
        registry
            .register_plan(
                "plan",
                &["ctx"],
                Arc::new(crate::registry::FnComputation::new(|_| Ok(json!("not a list")))),
            )
            .unwrap();
        let mut exec = executor_for(registry);

        let report = exec.run_sources().await.unwrap();
        assert_eq!(report.failed, vec!["plan"]);
    }

    #[tokio::test]
    async fn test_unknown_trigger_is_rejected() {
        let mut exec = executor_for(abc(Arc::new(AtomicI64::new(0)), Calls::default()));
        let err = exec.run(&["nope".to_string()]).await.unwrap_err();
        assert!(matches!(err, LayerError::UnknownNode(_)));
    }

    #[tokio::test]
    async fn test_run_emits_events() {
        let registry = abc(Arc::new(AtomicI64::new(1)), Calls::default());
        let graph = Arc::new(Graph::build(registry).unwrap());
        let store = Arc::new(ValueStore::with_nodes(graph.plan().order()));
        let sink = Arc::new(VecEventSink::new());
        let mut exec = ReactiveExecutor::new(graph, store, sink.clone());

        exec.run_sources().await.unwrap();
        let events = sink.events();
        assert!(matches!(events.first(), Some(LayerEvent::RunStarted { .. })));
        assert!(matches!(
            events.last(),
            Some(LayerEvent::RunCompleted { invoked: 3, changed: 3, .. })
        ));
    }
}
