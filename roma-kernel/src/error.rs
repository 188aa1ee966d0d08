//! Crate-level error taxonomy for `roma-kernel`.
//!
//! Mirrors the invariant/planning/reasoner/timeout taxonomy of the core
//! specification: one `thiserror` enum per concern, composed into
//! [`KernelError`] via `#[from]` so `?` converts automatically.

use thiserror::Error;

use crate::graph::NodeState;
use crate::reasoner::Role;

/// Programming-error-class violations of the task graph's structural
/// invariants. Always fatal to the node (and usually the run); never
/// retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GraphInvariantViolation {
    #[error("adding child {child_id} under parent {parent_id} would introduce a cycle")]
    CycleDetected { parent_id: String, child_id: String },

    #[error("depends_on id {dependency_id} referenced by {node_id} is not a sibling under the same parent")]
    CrossSubtreeDependency { node_id: String, dependency_id: String },

    #[error("depends_on id {dependency_id} referenced by {node_id} does not exist")]
    UnknownSibling { node_id: String, dependency_id: String },

    #[error("node {node_id} at depth {depth} exceeds max_depth {max_depth}")]
    DepthExceeded {
        node_id: String,
        depth: u32,
        max_depth: u32,
    },

    #[error("node {node_id} already has a result written for this attempt")]
    DuplicateResultWrite { node_id: String },

    #[error("node {node_id} does not exist in this graph")]
    UnknownNode { node_id: String },
}

/// An attempted state transition that is not in the legal-transition table.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("illegal transition for node {node_id}: {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub node_id: String,
    pub from: NodeState,
    pub to: NodeState,
}

/// Execution-context assembly found an ancestor/sibling not in the state
/// the scheduler's own invariants promise, which indicates a scheduler bug.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("context precondition violated for node {node_id}: {reason}")]
pub struct ContextPreconditionViolation {
    pub node_id: String,
    pub reason: String,
}

/// Errors produced by applying a Planner's response to the graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PlanningError {
    #[error("planner for node {node_id} returned an empty plan")]
    EmptyPlan { node_id: String },

    #[error("planner for node {node_id} produced an invalid plan: {reason}")]
    InvalidPlan {
        node_id: String,
        reason: String,
        #[source]
        cause: Option<GraphInvariantViolation>,
    },
}

/// A failure reported by (or caught from) a reasoner invocation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{role:?} reasoner failed for node {node_id}: {cause}")]
pub struct ReasonerFailure {
    pub node_id: String,
    pub role: Role,
    pub cause: String,
    pub retryable: bool,
}

impl ReasonerFailure {
    pub fn retryable(node_id: impl Into<String>, role: Role, cause: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            role,
            cause: cause.into(),
            retryable: true,
        }
    }

    pub fn fatal(node_id: impl Into<String>, role: Role, cause: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            role,
            cause: cause.into(),
            retryable: false,
        }
    }
}

/// Cancellation-adjacent timeout errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TimeoutError {
    #[error("node {node_id} exceeded its per-node timeout of {timeout_ms}ms")]
    NodeTimeout { node_id: String, timeout_ms: u64 },

    #[error("run {run_id} exceeded its deadline")]
    DeadlineExceeded { run_id: String },
}

/// Composed crate-level error type. Every sub-error converts via `?`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum KernelError {
    #[error("graph invariant violation: {0}")]
    Invariant(#[from] GraphInvariantViolation),

    #[error("illegal transition: {0}")]
    Transition(#[from] IllegalTransition),

    #[error("context precondition violation: {0}")]
    Context(#[from] ContextPreconditionViolation),

    #[error("planning error: {0}")]
    Planning(#[from] PlanningError),

    #[error("reasoner failure: {0}")]
    Reasoner(#[from] ReasonerFailure),

    #[error("timeout: {0}")]
    Timeout(#[from] TimeoutError),

    #[error("{0}")]
    Internal(String),
}

pub type KernelResult<T> = Result<T, KernelError>;
