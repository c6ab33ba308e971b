//! Dependency graph builder
//!
//! Turns a [`NodeRegistry`] into an immutable [`Graph`]: every declared input
//! is resolved to a registered node (local or import), cycles are rejected,
//! and an [`ExecutionPlan`] is produced once and cached on the graph.
//!
//! The plan orders nodes topologically, breaking ties by registration order,
//! so two processes built from the same registry always run nodes in the same
//! order. It also precomputes each node's transitive downstream set, which the
//! executor uses for failure propagation without walking the graph again.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use crate::error::{LayerError, Result};
use crate::registry::{NodeDefinition, NodeRegistry};
use crate::types::NodeId;

/// Topologically ordered execution plan
///
/// Internally nodes are addressed by their position in `order`; positions
/// compare the same way the nodes execute.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    order: Vec<NodeId>,
    position: HashMap<NodeId, usize>,
    /// Registration index of the node at each position
    registration: Vec<usize>,
    inputs: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    /// Transitive downstream set, ascending by position
    downstream: Vec<Vec<usize>>,
}

impl ExecutionPlan {
    /// Node names in execution order
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Position of a node in the execution order
    pub fn position(&self, name: &str) -> Option<usize> {
        self.position.get(name).copied()
    }

    /// Name of the node at a position
    pub fn node_at(&self, position: usize) -> &NodeId {
        &self.order[position]
    }

    /// Nodes with no declared inputs, in execution order
    pub fn sources(&self) -> Vec<NodeId> {
        self.inputs
            .iter()
            .enumerate()
            .filter(|(_, inputs)| inputs.is_empty())
            .map(|(p, _)| self.order[p].clone())
            .collect()
    }

    /// Direct consumers of a node
    pub fn dependents(&self, name: &str) -> Vec<NodeId> {
        self.names(self.position(name).map(|p| self.dependents[p].as_slice()))
    }

    /// Everything transitively downstream of a node, in execution order
    pub fn downstream(&self, name: &str) -> Vec<NodeId> {
        self.names(self.position(name).map(|p| self.downstream[p].as_slice()))
    }

    pub(crate) fn inputs_at(&self, position: usize) -> &[usize] {
        &self.inputs[position]
    }

    pub(crate) fn dependents_at(&self, position: usize) -> &[usize] {
        &self.dependents[position]
    }

    pub(crate) fn downstream_at(&self, position: usize) -> &[usize] {
        &self.downstream[position]
    }

    pub(crate) fn registration_at(&self, position: usize) -> usize {
        self.registration[position]
    }

    fn names(&self, positions: Option<&[usize]>) -> Vec<NodeId> {
        positions
            .unwrap_or(&[])
            .iter()
            .map(|&p| self.order[p].clone())
            .collect()
    }
}

/// A validated, immutable dependency graph with its cached execution plan
#[derive(Debug)]
pub struct Graph {
    registry: NodeRegistry,
    plan: ExecutionPlan,
}

impl Graph {
    /// Resolve inputs, reject cycles and compute the execution plan
    pub fn build(registry: NodeRegistry) -> Result<Self> {
        let n = registry.len();
        let nodes = registry.nodes();

        // Resolve every declared input to a registration index
        let mut inputs_by_reg: Vec<Vec<usize>> = Vec::with_capacity(n);
        for node in nodes {
            let mut resolved = Vec::with_capacity(node.inputs.len());
            for input in &node.inputs {
                let idx = registry.position(input).ok_or_else(|| LayerError::UnknownDependency {
                    node: node.name.clone(),
                    input: input.clone(),
                })?;
                if !resolved.contains(&idx) {
                    resolved.push(idx);
                }
            }
            inputs_by_reg.push(resolved);
        }

        let mut dependents_by_reg: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (node, inputs) in inputs_by_reg.iter().enumerate() {
            for &input in inputs {
                dependents_by_reg[input].push(node);
            }
        }

        if let Some(cycle) = find_cycle(&dependents_by_reg) {
            let cycle: Vec<NodeId> = cycle.into_iter().map(|i| nodes[i].name.clone()).collect();
            log::error!("Cyclic dependency detected: {}", cycle.join(" -> "));
            return Err(LayerError::CyclicDependency { cycle });
        }

        let order_by_reg = topological_order(&inputs_by_reg, &dependents_by_reg);
        let plan = build_plan(nodes, &order_by_reg, &inputs_by_reg, &dependents_by_reg);

        log::info!(
            "Built execution plan with {} nodes ({} sources)",
            plan.len(),
            plan.sources().len()
        );

        Ok(Self { registry, plan })
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Definition of a node by name
    pub fn node(&self, name: &str) -> Option<&NodeDefinition> {
        self.registry.get(name)
    }

    pub(crate) fn definition_at(&self, position: usize) -> &NodeDefinition {
        &self.registry.nodes()[self.plan.registration_at(position)]
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Depth-first search for a cycle, returned in edge order with the first node repeated
fn find_cycle(dependents: &[Vec<usize>]) -> Option<Vec<usize>> {
    let mut marks = vec![Mark::Unvisited; dependents.len()];
    let mut stack = Vec::new();

    for start in 0..dependents.len() {
        if marks[start] == Mark::Unvisited {
            if let Some(cycle) = visit(start, dependents, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

fn visit(
    node: usize,
    dependents: &[Vec<usize>],
    marks: &mut [Mark],
    stack: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    marks[node] = Mark::InProgress;
    stack.push(node);

    for &next in &dependents[node] {
        match marks[next] {
            Mark::InProgress => {
                let start = stack.iter().position(|&n| n == next)?;
                let mut cycle = stack[start..].to_vec();
                cycle.push(next);
                return Some(cycle);
            }
            Mark::Unvisited => {
                if let Some(cycle) = visit(next, dependents, marks, stack) {
                    return Some(cycle);
                }
            }
            Mark::Done => {}
        }
    }

    stack.pop();
    marks[node] = Mark::Done;
    None
}

/// Kahn's algorithm; among ready nodes the earliest registered goes first
fn topological_order(inputs: &[Vec<usize>], dependents: &[Vec<usize>]) -> Vec<usize> {
    let mut in_degree: Vec<usize> = inputs.iter().map(|i| i.len()).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(inputs.len());
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for &next in &dependents[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }
    order
}

fn build_plan(
    nodes: &[NodeDefinition],
    order_by_reg: &[usize],
    inputs_by_reg: &[Vec<usize>],
    dependents_by_reg: &[Vec<usize>],
) -> ExecutionPlan {
    let mut pos_of_reg = vec![0; order_by_reg.len()];
    for (pos, &reg) in order_by_reg.iter().enumerate() {
        pos_of_reg[reg] = pos;
    }

    let to_positions = |list: &[usize]| -> Vec<usize> {
        let mut out: Vec<usize> = list.iter().map(|&r| pos_of_reg[r]).collect();
        out.sort_unstable();
        out
    };

    let order: Vec<NodeId> = order_by_reg.iter().map(|&r| nodes[r].name.clone()).collect();
    let position = order
        .iter()
        .enumerate()
        .map(|(p, name)| (name.clone(), p))
        .collect();
    let inputs: Vec<Vec<usize>> = order_by_reg
        .iter()
        .map(|&r| {
            // Keep declaration order for inputs; only dependents are sorted
            inputs_by_reg[r].iter().map(|&i| pos_of_reg[i]).collect()
        })
        .collect();
    let dependents: Vec<Vec<usize>> = order_by_reg
        .iter()
        .map(|&r| to_positions(&dependents_by_reg[r]))
        .collect();

    // Reverse topological sweep: a node's downstream set is its dependents
    // plus their downstream sets.
    let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); order.len()];
    for pos in (0..order.len()).rev() {
        let mut set = BTreeSet::new();
        for &dep in &dependents[pos] {
            set.insert(dep);
            set.extend(downstream[dep].iter().copied());
        }
        downstream[pos] = set.into_iter().collect();
    }

    ExecutionPlan {
        order,
        position,
        registration: order_by_reg.to_vec(),
        inputs,
        dependents,
        downstream,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ImportBinding;
    use serde_json::json;

    fn registry_of(edges: &[(&str, &[&str])]) -> NodeRegistry {
        let mut registry = NodeRegistry::new();
        for (name, inputs) in edges {
            registry.register_fn(*name, inputs, |_| Ok(json!(null))).unwrap();
        }
        registry
    }

    fn assert_consistent(graph: &Graph) {
        let plan = graph.plan();
        for node in graph.registry().nodes() {
            let pos = plan.position(&node.name).unwrap();
            for input in &node.inputs {
                assert!(
                    plan.position(input).unwrap() < pos,
                    "{} must run after {}",
                    node.name,
                    input
                );
            }
        }
    }

    #[test]
    fn test_linear_order() {
        let graph = Graph::build(registry_of(&[("c", &["b"]), ("b", &["a"]), ("a", &[])])).unwrap();
        assert_eq!(graph.plan().order(), &["a", "b", "c"]);
        assert_eq!(graph.plan().sources(), vec!["a".to_string()]);
        assert_consistent(&graph);
    }

    #[test]
    fn test_ties_broken_by_registration_order() {
        let graph = Graph::build(registry_of(&[
            ("z", &[]),
            ("y", &[]),
            ("m", &["y", "z"]),
            ("x", &[]),
        ]))
        .unwrap();
        assert_eq!(graph.plan().order(), &["z", "y", "m", "x"]);
    }

    #[test]
    fn test_order_consistent_for_generated_dags() {
        // Deterministic pseudo-random DAGs: node i may only depend on j < i,
        // registered in a shuffled order.
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        for _ in 0..25 {
            let size = (next() % 12 + 2) as usize;
            let names: Vec<String> = (0..size).map(|i| format!("n{}", i)).collect();
            let mut deps: Vec<Vec<&str>> = Vec::new();
            for i in 0..size {
                let mut d = Vec::new();
                for j in 0..i {
                    if next() % 3 == 0 {
                        d.push(names[j].as_str());
                    }
                }
                deps.push(d);
            }
            let mut reg_order: Vec<usize> = (0..size).collect();
            for i in (1..size).rev() {
                let j = (next() % (i as u64 + 1)) as usize;
                reg_order.swap(i, j);
            }

            let mut registry = NodeRegistry::new();
            for &i in &reg_order {
                registry.register_fn(names[i].clone(), &deps[i], |_| Ok(json!(null))).unwrap();
            }
            let graph = Graph::build(registry).unwrap();
            assert_eq!(graph.plan().len(), size);
            assert_consistent(&graph);
        }
    }

    #[test]
    fn test_unknown_dependency() {
        let err = Graph::build(registry_of(&[("a", &[]), ("b", &["a", "ghost"])])).unwrap_err();
        match err {
            LayerError::UnknownDependency { node, input } => {
                assert_eq!(node, "b");
                assert_eq!(input, "ghost");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_cycle_is_named() {
        let err = Graph::build(registry_of(&[
            ("src", &[]),
            ("a", &["src", "c"]),
            ("b", &["a"]),
            ("c", &["b"]),
        ]))
        .unwrap_err();
        match err {
            LayerError::CyclicDependency { cycle } => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
                for name in ["a", "b", "c"] {
                    assert!(cycle.contains(&name.to_string()));
                }
                assert!(!cycle.contains(&"src".to_string()));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = Graph::build(registry_of(&[("a", &["a"])])).unwrap_err();
        assert!(matches!(err, LayerError::CyclicDependency { cycle } if cycle == vec!["a", "a"]));
    }

    #[test]
    fn test_downstream_sets() {
        // a -> b -> d, a -> c -> d, e independent
        let graph = Graph::build(registry_of(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b", "c"]),
            ("e", &[]),
        ]))
        .unwrap();
        let plan = graph.plan();
        assert_eq!(plan.downstream("a"), vec!["b", "c", "d"]);
        assert_eq!(plan.downstream("b"), vec!["d"]);
        assert!(plan.downstream("d").is_empty());
        assert!(plan.downstream("e").is_empty());
        assert_eq!(plan.dependents("a"), vec!["b", "c"]);
    }

    #[test]
    fn test_import_resolves_as_input() {
        let mut registry = NodeRegistry::new();
        registry
            .register_import("layer1", ImportBinding::new("http://localhost:2718", "context"))
            .unwrap();
        registry.register_fn("insights", &["layer1"], |_| Ok(json!(null))).unwrap();
        let graph = Graph::build(registry).unwrap();
        assert_eq!(graph.plan().order(), &["layer1", "insights"]);
        assert!(graph.node("layer1").unwrap().is_import());
    }
}
