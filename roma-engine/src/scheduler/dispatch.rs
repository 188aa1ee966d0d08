//! Per-role request construction and response application.
//!
//! Grounded on `mofa-foundation/src/llm/planning_executor.rs`'s
//! `execute_single_step` (request assembly, reflect-driven retry/replan)
//! and `mofa-kernel/src/workflow/planning.rs`'s `Planner` trait, generalized
//! from one role to five and from a flat plan to a recursive DAG.

use chrono::{DateTime, Utc};
use roma_kernel::context::ExecutionContext;
use roma_kernel::error::{KernelResult, PlanningError};
use roma_kernel::graph::{NodeError, NodeKind, NodeState, ReasonKind, TaskGraph};
use roma_kernel::reasoner::{
    AggregatorChildSummary, AggregatorRequest, AggregatorResponse, AtomizerRequest, AtomizerResponse,
    ExecutorRequest, ExecutorResponse, PlannerRequest, PlannerResponse, Role, Verdict, VerifierRequest,
    VerifierResponse,
};

/// Which role a node currently awaits dispatch for, derived purely from
/// its state (spec §4.3).
pub fn role_for_state(state: NodeState) -> Option<Role> {
    match state {
        NodeState::Pending | NodeState::Classifying => Some(Role::Atomizer),
        NodeState::Planning => Some(Role::Planner),
        NodeState::Executing => Some(Role::Executor),
        NodeState::Aggregating => Some(Role::Aggregator),
        NodeState::Verifying => Some(Role::Verifier),
        _ => None,
    }
}

pub fn build_atomizer_request(graph: &TaskGraph, node_id: &str, feedback: Option<String>) -> KernelResult<AtomizerRequest> {
    let node = graph.get(node_id).expect("node exists");
    let context = ExecutionContext::build(graph, node_id, feedback)?;
    Ok(AtomizerRequest {
        goal: node.goal.clone(),
        context,
    })
}

pub fn build_planner_request(graph: &TaskGraph, node_id: &str, feedback: Option<String>) -> KernelResult<PlannerRequest> {
    let node = graph.get(node_id).expect("node exists");
    let context = ExecutionContext::build(graph, node_id, feedback)?;
    Ok(PlannerRequest {
        goal: node.goal.clone(),
        context,
    })
}

pub fn build_executor_request(
    graph: &TaskGraph,
    node_id: &str,
    feedback: Option<String>,
    tools: serde_json::Value,
) -> KernelResult<ExecutorRequest> {
    let node = graph.get(node_id).expect("node exists");
    let context = ExecutionContext::build(graph, node_id, feedback)?;
    Ok(ExecutorRequest {
        goal: node.goal.clone(),
        context,
        task_type: node.task_type,
        tools,
    })
}

pub fn build_aggregator_request(graph: &TaskGraph, node_id: &str, aggregate_partial: bool) -> AggregatorRequest {
    let node = graph.get(node_id).expect("node exists");
    let status = graph.children_status(node_id);
    let children: Vec<AggregatorChildSummary> = graph
        .children_of(node_id)
        .iter()
        .filter(|cid| status.succeeded_ids.contains(cid))
        .filter_map(|cid| {
            let child = graph.get(cid)?;
            Some(AggregatorChildSummary {
                child_id: child.id.clone(),
                child_goal: child.goal.clone(),
                child_task_type: child.task_type,
                child_result: child.result.clone().unwrap_or(serde_json::Value::Null),
            })
        })
        .collect();
    let failed_children = if aggregate_partial {
        status
            .failed_ids
            .iter()
            .filter_map(|cid| {
                let child = graph.get(cid)?;
                let msg = child.error.as_ref().map(|e| e.message.clone()).unwrap_or_default();
                Some((child.goal.clone(), msg))
            })
            .collect()
    } else {
        Vec::new()
    };
    AggregatorRequest {
        parent_goal: node.goal.clone(),
        children,
        failed_children,
    }
}

pub fn build_verifier_request(graph: &TaskGraph, node_id: &str) -> VerifierRequest {
    let node = graph.get(node_id).expect("node exists");
    VerifierRequest {
        original_goal: node.goal.clone(),
        candidate_artifact: node.result.clone().unwrap_or(serde_json::Value::Null),
    }
}

pub fn apply_atomizer_response(
    graph: &mut TaskGraph,
    node_id: &str,
    response: AtomizerResponse,
    max_depth: u32,
    now: DateTime<Utc>,
) -> KernelResult<()> {
    let depth = graph.get(node_id).expect("node exists").depth;
    let kind = if depth >= max_depth {
        NodeKind::Execute
    } else {
        response.node_kind
    };
    graph.set_node_kind(node_id, kind)?;
    let next = match kind {
        NodeKind::Plan => NodeState::Planning,
        NodeKind::Execute => NodeState::Executing,
    };
    graph.set_state(node_id, next, now)
}

/// Returns `Err(PlanningError)` on an empty or invalid plan; the caller
/// translates that into the planning node's `TerminalFailure`.
pub fn apply_planner_response(
    graph: &mut TaskGraph,
    node_id: &str,
    response: PlannerResponse,
    max_depth: u32,
    now: DateTime<Utc>,
) -> Result<(), PlanningError> {
    if response.children.is_empty() {
        return Err(PlanningError::EmptyPlan {
            node_id: node_id.to_string(),
        });
    }
    let specs = response.children.into_iter().map(Into::into).collect();
    graph
        .add_children(node_id, specs, max_depth, now)
        .map_err(|e| PlanningError::InvalidPlan {
            node_id: node_id.to_string(),
            reason: e.to_string(),
            cause: match e {
                roma_kernel::error::KernelError::Invariant(v) => Some(v),
                _ => None,
            },
        })?;
    graph
        .set_state(node_id, NodeState::WaitingForChildren, now)
        .map_err(|e| PlanningError::InvalidPlan {
            node_id: node_id.to_string(),
            reason: e.to_string(),
            cause: None,
        })
}

pub fn apply_executor_response(
    graph: &mut TaskGraph,
    node_id: &str,
    response: ExecutorResponse,
    verification_enabled: bool,
    now: DateTime<Utc>,
) -> KernelResult<()> {
    graph.set_result(node_id, response.artifact)?;
    let next = if verification_enabled {
        NodeState::Verifying
    } else {
        NodeState::TerminalSuccess
    };
    graph.set_state(node_id, next, now)
}

pub fn apply_aggregator_response(
    graph: &mut TaskGraph,
    node_id: &str,
    response: AggregatorResponse,
    verification_enabled: bool,
    now: DateTime<Utc>,
) -> KernelResult<()> {
    graph.set_result(node_id, response.synthesized_artifact)?;
    let next = if verification_enabled {
        NodeState::Verifying
    } else {
        NodeState::TerminalSuccess
    };
    graph.set_state(node_id, next, now)
}

/// Outcome of applying a verifier verdict, telling the scheduler whether
/// the node's attempts budget was consumed.
pub enum VerifierOutcome {
    Accepted,
    RetryScheduled { feedback: String },
    BudgetExhausted { feedback: String },
}

pub fn apply_verifier_response(
    graph: &mut TaskGraph,
    node_id: &str,
    response: VerifierResponse,
    attempts_budget: u32,
    now: DateTime<Utc>,
) -> KernelResult<VerifierOutcome> {
    match response.verdict {
        Verdict::Ok => {
            graph.set_state(node_id, NodeState::TerminalSuccess, now)?;
            Ok(VerifierOutcome::Accepted)
        }
        Verdict::Reject(feedback) => {
            let node = graph.get(node_id).expect("node exists");
            let node_kind = node.node_kind;
            let attempts = node.attempts;
            if attempts + 1 < attempts_budget {
                graph.increment_attempts(node_id)?;
                let target = match node_kind {
                    Some(NodeKind::Execute) | None => NodeState::Executing,
                    Some(NodeKind::Plan) => NodeState::Aggregating,
                };
                graph.set_state(node_id, target, now)?;
                Ok(VerifierOutcome::RetryScheduled { feedback })
            } else {
                graph.set_error(
                    node_id,
                    NodeError::new(ReasonKind::VerificationRejected, feedback.clone()),
                )?;
                graph.set_state(node_id, NodeState::TerminalFailure, now)?;
                Ok(VerifierOutcome::BudgetExhausted { feedback })
            }
        }
    }
}
