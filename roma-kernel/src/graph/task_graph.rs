//! The task DAG: id-indexed nodes, dependency bookkeeping, and the
//! checkpoint round-trip.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::node::{NodeError, NodeKind, NodeState, ReasonKind, TaskNode, TaskType, Timing};
use crate::error::{GraphInvariantViolation, KernelResult};

/// One child a Planner wants to add under the planning node it was
/// dispatched for. `depends_on_local` indexes into the *same batch* of
/// specs (spec §4.3: "depends_on_by_local_index"); it is resolved to a
/// concrete sibling id when the batch is inserted.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    pub goal: String,
    pub task_type: TaskType,
    pub depends_on_local: Vec<usize>,
}

impl ChildSpec {
    pub fn new(goal: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            goal: goal.into(),
            task_type,
            depends_on_local: Vec::new(),
        }
    }

    pub fn depends_on(mut self, local_indices: Vec<usize>) -> Self {
        self.depends_on_local = local_indices;
        self
    }
}

/// Status of the children of a `WaitingForChildren` node, used to decide
/// whether it may be promoted to `Aggregating`.
#[derive(Debug, Clone)]
pub struct ChildrenStatus {
    pub all_terminal: bool,
    pub any_failed: bool,
    pub succeeded_ids: Vec<String>,
    pub failed_ids: Vec<String>,
}

/// The set of all [`TaskNode`]s in one solver run.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    run_id: String,
    root_id: Option<String>,
    nodes: HashMap<String, TaskNode>,
    /// Ordered child ids per planning node; order is the Planner's declared
    /// sequence (spec §3.1), used for tie-breaking selection, not gating.
    children: HashMap<String, Vec<String>>,
    /// Reverse index: id -> ids of nodes whose `depends_on` names it.
    dependents: HashMap<String, Vec<String>>,
    next_seq: u64,
}

impl TaskGraph {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            root_id: None,
            nodes: HashMap::new(),
            children: HashMap::new(),
            dependents: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn fresh_id(&mut self) -> String {
        let id = format!("n{}", self.next_seq);
        self.next_seq += 1;
        id
    }

    pub fn create_root(&mut self, goal: impl Into<String>, task_type: TaskType, now: DateTime<Utc>) -> String {
        let id = self.fresh_id();
        let node = TaskNode::new(id.clone(), goal, task_type, None, Vec::new(), 0, now);
        self.nodes.insert(id.clone(), node);
        self.root_id = Some(id.clone());
        id
    }

    pub fn root_id(&self) -> Option<&str> {
        self.root_id.as_deref()
    }

    pub fn get(&self, id: &str) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut TaskNode> {
        self.nodes.get_mut(id)
    }

    pub fn children_of(&self, parent_id: &str) -> &[String] {
        self.children.get(parent_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Atomically add a batch of children under `parent_id` (spec §4.4.3:
    /// dynamic expansion). Either every child and its dependency edges are
    /// added, or none are — on any validation failure nothing is mutated
    /// and the caller receives the violation to translate into
    /// `InvalidPlan`.
    pub fn add_children(
        &mut self,
        parent_id: &str,
        specs: Vec<ChildSpec>,
        max_depth: u32,
        now: DateTime<Utc>,
    ) -> KernelResult<Vec<String>> {
        let parent = self
            .nodes
            .get(parent_id)
            .ok_or_else(|| GraphInvariantViolation::UnknownNode {
                node_id: parent_id.to_string(),
            })?;
        let child_depth = parent.depth + 1;
        if child_depth > max_depth {
            return Err(GraphInvariantViolation::DepthExceeded {
                node_id: parent_id.to_string(),
                depth: child_depth,
                max_depth,
            }
            .into());
        }

        // Validate local depends_on indices and detect cycles among the
        // new siblings before mutating anything.
        for (i, spec) in specs.iter().enumerate() {
            for &dep in &spec.depends_on_local {
                if dep >= specs.len() {
                    return Err(GraphInvariantViolation::UnknownSibling {
                        node_id: format!("{parent_id}[{i}]"),
                        dependency_id: format!("local#{dep}"),
                    }
                    .into());
                }
            }
        }
        if Self::has_local_cycle(&specs) {
            return Err(GraphInvariantViolation::CycleDetected {
                parent_id: parent_id.to_string(),
                child_id: format!("{parent_id}[batch]"),
            }
            .into());
        }

        // Assign ids up front so local indices resolve to real ids.
        let mut ids = Vec::with_capacity(specs.len());
        let mut reserved = self.next_seq;
        for _ in &specs {
            ids.push(format!("n{reserved}"));
            reserved += 1;
        }

        let mut new_nodes = Vec::with_capacity(specs.len());
        for (i, spec) in specs.into_iter().enumerate() {
            let depends_on: Vec<String> = spec
                .depends_on_local
                .iter()
                .map(|&local| ids[local].clone())
                .collect();
            let node = TaskNode::new(
                ids[i].clone(),
                spec.goal,
                spec.task_type,
                Some(parent_id.to_string()),
                depends_on,
                child_depth,
                now,
            );
            new_nodes.push(node);
        }

        self.next_seq = reserved;
        let entry = self.children.entry(parent_id.to_string()).or_default();
        for mut node in new_nodes {
            node.unmet_dependency_count = node.depends_on.len();
            for dep in &node.depends_on {
                self.dependents.entry(dep.clone()).or_default().push(node.id.clone());
            }
            entry.push(node.id.clone());
            self.nodes.insert(node.id.clone(), node);
        }

        Ok(ids)
    }

    fn has_local_cycle(specs: &[ChildSpec]) -> bool {
        let n = specs.len();
        let mut state = vec![0u8; n]; // 0=unvisited, 1=visiting, 2=done
        fn visit(i: usize, specs: &[ChildSpec], state: &mut [u8]) -> bool {
            state[i] = 1;
            for &dep in &specs[i].depends_on_local {
                match state[dep] {
                    1 => return true,
                    0 => {
                        if visit(dep, specs, state) {
                            return true;
                        }
                    }
                    _ => {}
                }
            }
            state[i] = 2;
            false
        }
        for i in 0..n {
            if state[i] == 0 && visit(i, specs, &mut state) {
                return true;
            }
        }
        false
    }

    /// Transition a node's state, rejecting anything outside the legal
    /// transition table.
    pub fn set_state(&mut self, id: &str, new_state: NodeState, now: DateTime<Utc>) -> KernelResult<()> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| GraphInvariantViolation::UnknownNode { node_id: id.to_string() })?;
        if !node.state.can_transition(new_state) {
            return Err(crate::error::IllegalTransition {
                node_id: id.to_string(),
                from: node.state,
                to: new_state,
            }
            .into());
        }
        node.state = new_state;
        if node.timing.started_at.is_none() && new_state != NodeState::Pending {
            node.timing.started_at = Some(now);
        }
        if new_state.is_terminal() {
            node.timing.finished_at = Some(now);
        }
        if new_state == NodeState::TerminalSuccess {
            self.propagate_success(id);
        }
        Ok(())
    }

    fn propagate_success(&mut self, id: &str) {
        if let Some(dependents) = self.dependents.get(id).cloned() {
            for dep_id in dependents {
                if let Some(node) = self.nodes.get_mut(&dep_id) {
                    node.unmet_dependency_count = node.unmet_dependency_count.saturating_sub(1);
                }
            }
        }
    }

    /// Write the node's result. Only legal while the node is in a state
    /// that is expected to produce one (`Executing`, `Aggregating`); the
    /// result may be overwritten only because the node re-entered a
    /// non-terminal state via retry (spec invariant 5).
    pub fn set_result(&mut self, id: &str, artifact: serde_json::Value) -> KernelResult<()> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| GraphInvariantViolation::UnknownNode { node_id: id.to_string() })?;
        node.result = Some(artifact);
        Ok(())
    }

    pub fn set_error(&mut self, id: &str, error: NodeError) -> KernelResult<()> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| GraphInvariantViolation::UnknownNode { node_id: id.to_string() })?;
        node.error = Some(error);
        Ok(())
    }

    pub fn set_node_kind(&mut self, id: &str, kind: NodeKind) -> KernelResult<()> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| GraphInvariantViolation::UnknownNode { node_id: id.to_string() })?;
        node.node_kind = Some(kind);
        Ok(())
    }

    pub fn increment_attempts(&mut self, id: &str) -> KernelResult<u32> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| GraphInvariantViolation::UnknownNode { node_id: id.to_string() })?;
        node.attempts += 1;
        Ok(node.attempts)
    }

    /// Nodes ready for their next forward dispatch: `Pending` nodes whose
    /// `depends_on` are all terminal-success, plus nodes already sitting in
    /// an intermediate dispatch state (`Planning`/`Executing`/`Verifying`/
    /// `Aggregating`) that have not yet been picked up this tick. Splits
    /// spec §4.1's single `ready_nodes()` from the `WaitingForChildren`
    /// promotion case, which the scheduler resolves via
    /// [`Self::aggregation_ready`].
    pub fn ready_nodes(&self) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| match n.state {
                NodeState::Pending => n.is_ready_by_dependencies(),
                // `Classifying` also matches here: a retryable Atomizer
                // failure leaves the node in `Classifying` without
                // transitioning it, so it is re-selected on the next tick
                // exactly like a fresh `Pending` node (see
                // `roma_engine::scheduler`).
                NodeState::Classifying
                | NodeState::Planning
                | NodeState::Executing
                | NodeState::Verifying
                | NodeState::Aggregating => true,
                _ => false,
            })
            .map(|n| n.id.clone())
            .collect()
    }

    /// `WaitingForChildren` nodes whose children are all terminal, i.e.
    /// ready to be promoted to `Aggregating` and dispatched to the
    /// Aggregator.
    pub fn aggregation_ready(&self, aggregate_partial: bool) -> Vec<(String, ChildrenStatus)> {
        let mut out = Vec::new();
        for node in self.nodes.values() {
            if node.state != NodeState::WaitingForChildren {
                continue;
            }
            let status = self.children_status(&node.id);
            if status.all_terminal && (aggregate_partial || !status.any_failed) {
                out.push((node.id.clone(), status));
            }
        }
        out
    }

    /// `WaitingForChildren` nodes that must fail now: at least one child
    /// already `TerminalFailure` and `aggregate_partial` is off, so there
    /// is no point waiting for the remaining siblings (spec §4.4.1
    /// `WAITING_FOR_CHILDREN -> TERMINAL_FAILURE`).
    pub fn failing_waiting_parents(&self, aggregate_partial: bool) -> Vec<(String, ChildrenStatus)> {
        if aggregate_partial {
            return Vec::new();
        }
        let mut out = Vec::new();
        for node in self.nodes.values() {
            if node.state != NodeState::WaitingForChildren {
                continue;
            }
            let status = self.children_status(&node.id);
            if status.any_failed {
                out.push((node.id.clone(), status));
            }
        }
        out
    }

    pub fn children_status(&self, parent_id: &str) -> ChildrenStatus {
        let mut succeeded_ids = Vec::new();
        let mut failed_ids = Vec::new();
        for child_id in self.children_of(parent_id) {
            if let Some(child) = self.nodes.get(child_id) {
                match child.state {
                    NodeState::TerminalSuccess => succeeded_ids.push(child.id.clone()),
                    NodeState::TerminalFailure => failed_ids.push(child.id.clone()),
                    _ => {}
                }
            }
        }
        let total = self.children_of(parent_id).len();
        ChildrenStatus {
            all_terminal: succeeded_ids.len() + failed_ids.len() == total,
            any_failed: !failed_ids.is_empty(),
            succeeded_ids,
            failed_ids,
        }
    }

    /// Topologically-ordered results of every `TerminalSuccess` descendant
    /// of `id` (spec §4.1).
    pub fn subtree_results(&self, id: &str) -> Vec<(String, serde_json::Value)> {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        // BFS by layer gives parent-before-child order, which is also a
        // valid topological order for a tree.
        let mut frontier: std::collections::VecDeque<String> = self.children_of(id).iter().cloned().collect();
        while let Some(next_id) = frontier.pop_front() {
            if !seen.insert(next_id.clone()) {
                continue;
            }
            order.push(next_id.clone());
            frontier.extend(self.children_of(&next_id).iter().cloned());
        }
        order
            .into_iter()
            .filter_map(|cid| {
                let node = self.nodes.get(&cid)?;
                if node.state == NodeState::TerminalSuccess {
                    node.result.clone().map(|r| (cid, r))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Build the per-node execution context inputs: `depends_on` sibling
    /// results and the ancestor chain's results in root-first order.
    pub fn ancestor_chain(&self, id: &str) -> KernelResult<Vec<String>> {
        let mut chain = Vec::new();
        let mut cursor = self
            .nodes
            .get(id)
            .ok_or_else(|| GraphInvariantViolation::UnknownNode { node_id: id.to_string() })?
            .parent_id
            .clone();
        while let Some(pid) = cursor {
            chain.push(pid.clone());
            cursor = self.nodes.get(&pid).and_then(|n| n.parent_id.clone());
        }
        chain.reverse();
        Ok(chain)
    }

    pub fn snapshot(&self, in_flight: Vec<String>) -> RunRecord {
        RunRecord {
            run_id: self.run_id.clone(),
            root_id: self.root_id.clone(),
            nodes: self.nodes.values().cloned().collect(),
            children: self.children.clone(),
            in_flight,
            next_seq: self.next_seq,
        }
    }

    pub fn restore(record: RunRecord) -> Self {
        let mut graph = TaskGraph {
            run_id: record.run_id,
            root_id: record.root_id,
            nodes: HashMap::new(),
            children: record.children,
            dependents: HashMap::new(),
            next_seq: record.next_seq,
        };
        for node in record.nodes {
            graph.nodes.insert(node.id.clone(), node);
        }
        // Recompute dependents + unmet_dependency_count from depends_on.
        let ids: Vec<String> = graph.nodes.keys().cloned().collect();
        for id in &ids {
            let depends_on = graph.nodes.get(id).unwrap().depends_on.clone();
            let mut unmet = 0usize;
            for dep in &depends_on {
                graph.dependents.entry(dep.clone()).or_default().push(id.clone());
                let dep_terminal_success = graph
                    .nodes
                    .get(dep)
                    .map(|n| n.state == NodeState::TerminalSuccess)
                    .unwrap_or(false);
                if !dep_terminal_success {
                    unmet += 1;
                }
            }
            graph.nodes.get_mut(id).unwrap().unmet_dependency_count = unmet;
        }
        graph
    }

    /// Checks the structural invariants of spec §3.2 hold for the whole
    /// graph; used by tests and by `restore` callers that want to assert
    /// a resumed graph is well-formed.
    pub fn validate_invariants(&self) -> KernelResult<()> {
        for (parent, kids) in &self.children {
            for kid in kids {
                let child = self
                    .nodes
                    .get(kid)
                    .ok_or_else(|| GraphInvariantViolation::UnknownNode { node_id: kid.clone() })?;
                if child.parent_id.as_deref() != Some(parent.as_str()) {
                    return Err(GraphInvariantViolation::UnknownNode { node_id: kid.clone() }.into());
                }
                for dep in &child.depends_on {
                    if !kids.contains(dep) {
                        return Err(GraphInvariantViolation::CrossSubtreeDependency {
                            node_id: kid.clone(),
                            dependency_id: dep.clone(),
                        }
                        .into());
                    }
                }
            }
        }
        Ok(())
    }
}

/// Structurally-typed snapshot of a [`TaskGraph`] sufficient to resume a
/// run (spec §3.1, §6). Must round-trip losslessly through
/// [`TaskGraph::snapshot`] / [`TaskGraph::restore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub root_id: Option<String>,
    pub nodes: Vec<TaskNode>,
    pub children: HashMap<String, Vec<String>>,
    pub in_flight: Vec<String>,
    pub next_seq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        "2026-01-01T00:00:00Z".parse().unwrap()
    }

    #[test]
    fn create_root_then_add_children() {
        let mut g = TaskGraph::new("run-1");
        let root = g.create_root("goal", TaskType::Think, now());
        let ids = g
            .add_children(
                &root,
                vec![
                    ChildSpec::new("c1", TaskType::Retrieve),
                    ChildSpec::new("c2", TaskType::Retrieve),
                    ChildSpec::new("c3", TaskType::Think).depends_on(vec![0, 1]),
                ],
                5,
                now(),
            )
            .unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(g.children_of(&root), ids.as_slice());
        let c3 = g.get(&ids[2]).unwrap();
        assert_eq!(c3.depends_on, vec![ids[0].clone(), ids[1].clone()]);
        assert_eq!(c3.unmet_dependency_count, 2);
    }

    #[test]
    fn local_cycle_rejected() {
        let mut g = TaskGraph::new("run-1");
        let root = g.create_root("goal", TaskType::Think, now());
        let err = g
            .add_children(
                &root,
                vec![
                    ChildSpec::new("c1", TaskType::Think).depends_on(vec![1]),
                    ChildSpec::new("c2", TaskType::Think).depends_on(vec![0]),
                ],
                5,
                now(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::KernelError::Invariant(GraphInvariantViolation::CycleDetected { .. })
        ));
    }

    #[test]
    fn depth_exceeded_rejected() {
        let mut g = TaskGraph::new("run-1");
        let root = g.create_root("goal", TaskType::Think, now());
        let err = g
            .add_children(&root, vec![ChildSpec::new("c1", TaskType::Think)], 0, now())
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::KernelError::Invariant(GraphInvariantViolation::DepthExceeded { .. })
        ));
    }

    #[test]
    fn unknown_local_sibling_rejected() {
        let mut g = TaskGraph::new("run-1");
        let root = g.create_root("goal", TaskType::Think, now());
        let err = g
            .add_children(
                &root,
                vec![ChildSpec::new("c1", TaskType::Think).depends_on(vec![5])],
                5,
                now(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::KernelError::Invariant(GraphInvariantViolation::UnknownSibling { .. })
        ));
    }

    #[test]
    fn propagate_success_decrements_unmet_dependency_count() {
        let mut g = TaskGraph::new("run-1");
        let root = g.create_root("goal", TaskType::Think, now());
        let ids = g
            .add_children(
                &root,
                vec![
                    ChildSpec::new("c1", TaskType::Retrieve),
                    ChildSpec::new("c2", TaskType::Think).depends_on(vec![0]),
                ],
                5,
                now(),
            )
            .unwrap();
        g.set_state(&ids[0], NodeState::Classifying, now()).unwrap();
        g.set_state(&ids[0], NodeState::Executing, now()).unwrap();
        g.set_state(&ids[0], NodeState::TerminalSuccess, now()).unwrap();
        assert_eq!(g.get(&ids[1]).unwrap().unmet_dependency_count, 0);
        assert!(g.ready_nodes().contains(&ids[1]));
    }

    #[test]
    fn illegal_transition_rejected() {
        let mut g = TaskGraph::new("run-1");
        let root = g.create_root("goal", TaskType::Think, now());
        let err = g.set_state(&root, NodeState::Executing, now()).unwrap_err();
        assert!(matches!(
            err,
            crate::error::KernelError::Transition(_)
        ));
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let mut g = TaskGraph::new("run-1");
        let root = g.create_root("goal", TaskType::Think, now());
        g.add_children(&root, vec![ChildSpec::new("c1", TaskType::Retrieve)], 5, now())
            .unwrap();
        let record = g.snapshot(vec![]);
        let restored = TaskGraph::restore(record.clone());
        let record2 = restored.snapshot(vec![]);
        assert_eq!(record.run_id, record2.run_id);
        assert_eq!(record.root_id, record2.root_id);
        assert_eq!(record.nodes.len(), record2.nodes.len());
        assert_eq!(record.children, record2.children);
    }

    #[test]
    fn validate_invariants_rejects_cross_subtree_dependency_if_forced() {
        let mut g = TaskGraph::new("run-1");
        let root = g.create_root("goal", TaskType::Think, now());
        let ids = g
            .add_children(&root, vec![ChildSpec::new("c1", TaskType::Think)], 5, now())
            .unwrap();
        // Hand-corrupt to simulate a bug producing a cross-subtree edge.
        g.get_mut(&ids[0]).unwrap().depends_on.push("not-a-sibling".into());
        assert!(g.validate_invariants().is_err());
    }
}
