//! Per-node execution context assembly (spec §4.2).

use serde::{Deserialize, Serialize};

use crate::error::{ContextPreconditionViolation, KernelResult};
use crate::graph::{NodeState, TaskGraph, TaskType};

/// A read-only snapshot of everything a dispatched reasoner may observe
/// about a node besides its own goal and request payload.
///
/// Contexts are snapshots: built once per dispatch from the graph state at
/// that moment, never updated in place if a sibling's result changes later
/// (spec §4.2 "Guarantees").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub node_id: String,
    pub goal: String,
    pub task_type: TaskType,
    pub depth: u32,
    pub parent_goal: Option<String>,
    /// Results of this node's `depends_on` siblings, in `depends_on` order.
    pub sibling_results: Vec<(String, serde_json::Value)>,
    /// Results already present on ancestors, root-first. Normally empty for
    /// most dispatches: a planning ancestor only gets a `result` once its
    /// own subtree finishes aggregating, which is after all its
    /// descendants — included opportunistically, never required.
    pub transitive_results: Vec<(String, serde_json::Value)>,
    /// Feedback from the most recent verification reject or replan,
    /// carried into the next dispatch's context (spec §4.4.5).
    pub retry_feedback: Option<String>,
}

impl ExecutionContext {
    /// Assemble the context for `node_id`: walk `depends_on` siblings (must
    /// all be `TerminalSuccess`, or this fails — indicating a scheduler
    /// bug per spec §4.2), then walk the ancestor chain root-first.
    pub fn build(graph: &TaskGraph, node_id: &str, retry_feedback: Option<String>) -> KernelResult<Self> {
        let node = graph.get(node_id).ok_or_else(|| ContextPreconditionViolation {
            node_id: node_id.to_string(),
            reason: "node does not exist".to_string(),
        })?;

        let mut sibling_results = Vec::with_capacity(node.depends_on.len());
        for dep_id in &node.depends_on {
            let dep = graph.get(dep_id).ok_or_else(|| ContextPreconditionViolation {
                node_id: node_id.to_string(),
                reason: format!("dependency {dep_id} does not exist"),
            })?;
            if dep.state != NodeState::TerminalSuccess {
                return Err(ContextPreconditionViolation {
                    node_id: node_id.to_string(),
                    reason: format!("dependency {dep_id} is not TerminalSuccess (scheduler bug)"),
                }
                .into());
            }
            let artifact = dep.result.clone().ok_or_else(|| ContextPreconditionViolation {
                node_id: node_id.to_string(),
                reason: format!("dependency {dep_id} is TerminalSuccess without a result"),
            })?;
            sibling_results.push((dep_id.clone(), artifact));
        }

        let parent_goal = node.parent_id.as_ref().and_then(|pid| graph.get(pid)).map(|p| p.goal.clone());

        let ancestor_chain = graph.ancestor_chain(node_id)?;
        let mut transitive_results = Vec::new();
        for ancestor_id in ancestor_chain {
            if let Some(ancestor) = graph.get(&ancestor_id) {
                if let Some(result) = &ancestor.result {
                    transitive_results.push((ancestor_id, result.clone()));
                }
            }
        }

        Ok(ExecutionContext {
            node_id: node_id.to_string(),
            goal: node.goal.clone(),
            task_type: node.task_type,
            depth: node.depth,
            parent_goal,
            sibling_results,
            transitive_results,
            retry_feedback,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ChildSpec;
    use chrono::Utc;

    fn now() -> chrono::DateTime<Utc> {
        "2026-01-01T00:00:00Z".parse().unwrap()
    }

    #[test]
    fn sibling_results_populate_in_depends_on_order() {
        let mut g = TaskGraph::new("run");
        let root = g.create_root("g", TaskType::Think, now());
        let ids = g
            .add_children(
                &root,
                vec![
                    ChildSpec::new("a", TaskType::Retrieve),
                    ChildSpec::new("b", TaskType::Retrieve),
                    ChildSpec::new("c", TaskType::Think).depends_on(vec![0, 1]),
                ],
                5,
                now(),
            )
            .unwrap();
        for id in &ids[..2] {
            g.set_state(id, NodeState::Classifying, now()).unwrap();
            g.set_state(id, NodeState::Executing, now()).unwrap();
            g.set_result(id, serde_json::json!("done")).unwrap();
            g.set_state(id, NodeState::TerminalSuccess, now()).unwrap();
        }
        let ctx = ExecutionContext::build(&g, &ids[2], None).unwrap();
        assert_eq!(ctx.sibling_results.len(), 2);
        assert_eq!(ctx.sibling_results[0].0, ids[0]);
    }

    #[test]
    fn non_terminal_sibling_fails_context_construction() {
        let mut g = TaskGraph::new("run");
        let root = g.create_root("g", TaskType::Think, now());
        let ids = g
            .add_children(
                &root,
                vec![
                    ChildSpec::new("a", TaskType::Retrieve),
                    ChildSpec::new("b", TaskType::Think).depends_on(vec![0]),
                ],
                5,
                now(),
            )
            .unwrap();
        let err = ExecutionContext::build(&g, &ids[1], None).unwrap_err();
        assert!(matches!(err, crate::error::KernelError::Context(_)));
    }
}
