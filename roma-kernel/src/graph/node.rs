//! A single unit of work in the task DAG.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of work a node represents; informs reasoner routing and tool
/// selection. Chosen by the Planner that emitted the node (the root
/// defaults to `Think`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TaskType {
    Retrieve,
    Write,
    Think,
    CodeInterpret,
    ImageGeneration,
}

/// Set once the Atomizer classifies a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Plan,
    Execute,
}

/// Lifecycle state of a node. See the crate-level docs for the legal
/// transition table; [`NodeState::can_transition`] is the single source of
/// truth enforced by [`crate::graph::TaskGraph::set_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Classifying,
    Planning,
    WaitingForChildren,
    Aggregating,
    Verifying,
    Executing,
    TerminalSuccess,
    TerminalFailure,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::TerminalSuccess | NodeState::TerminalFailure)
    }

    /// Whether `self -> next` appears in the legal transition table
    /// (spec §4.4.1). `TerminalFailure` is reachable from every
    /// non-terminal state; no other transition out of a terminal state is
    /// ever legal.
    pub fn can_transition(self, next: NodeState) -> bool {
        use NodeState::*;
        if self.is_terminal() {
            return false;
        }
        if next == TerminalFailure {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Classifying)
                | (Classifying, Planning)
                | (Classifying, Executing)
                | (Planning, WaitingForChildren)
                | (WaitingForChildren, Aggregating)
                | (Executing, TerminalSuccess)
                | (Executing, Verifying)
                | (Aggregating, Verifying)
                | (Aggregating, TerminalSuccess)
                | (Verifying, TerminalSuccess)
                | (Verifying, Executing)
                | (Verifying, Aggregating)
        )
    }
}

/// Why a node (or the run) ended in `TerminalFailure`. Also used as the
/// `reason_kind` on a failed [`crate::outcome::Outcome`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ReasonKind {
    DeadlineExceeded,
    DepthExceeded,
    InvalidPlan,
    ReasonerFailure,
    VerificationRejected,
    InvariantViolation,
    Cancelled,
}

/// A terminal failure record attached to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeError {
    pub reason: ReasonKind,
    pub message: String,
}

impl NodeError {
    pub fn new(reason: ReasonKind, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// Created-at/started-at/finished-at timestamps for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Timing {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            started_at: None,
            finished_at: None,
        }
    }
}

/// One unit of work in the DAG.
///
/// `result` is opaque to the core (spec §3.1): it is carried as a
/// `serde_json::Value` so hosts may store either an inline string artifact
/// or a structured handle to an out-of-band blob, and the core treats both
/// identically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: String,
    pub goal: String,
    pub task_type: TaskType,
    pub node_kind: Option<NodeKind>,
    pub state: NodeState,
    pub parent_id: Option<String>,
    pub depends_on: Vec<String>,
    pub depth: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<NodeError>,
    pub attempts: u32,
    pub timing: Timing,

    /// Count of entries in `depends_on` not yet in `TerminalSuccess`.
    /// Recomputed on [`crate::graph::TaskGraph::restore`]; not part of the
    /// structurally-typed `RunRecord` snapshot fields named in spec §6
    /// (it is derivable from `depends_on` and sibling states).
    #[serde(skip)]
    pub(crate) unmet_dependency_count: usize,
}

impl TaskNode {
    pub fn new(
        id: impl Into<String>,
        goal: impl Into<String>,
        task_type: TaskType,
        parent_id: Option<String>,
        depends_on: Vec<String>,
        depth: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            goal: goal.into(),
            task_type,
            node_kind: None,
            state: NodeState::Pending,
            parent_id,
            depends_on,
            depth,
            result: None,
            error: None,
            attempts: 0,
            timing: Timing::new(now),
            unmet_dependency_count: 0,
        }
    }

    pub fn is_ready_by_dependencies(&self) -> bool {
        self.unmet_dependency_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions_from_pending() {
        assert!(NodeState::Pending.can_transition(NodeState::Classifying));
        assert!(!NodeState::Pending.can_transition(NodeState::Executing));
    }

    #[test]
    fn terminal_failure_reachable_from_any_non_terminal_state() {
        for state in [
            NodeState::Pending,
            NodeState::Classifying,
            NodeState::Planning,
            NodeState::WaitingForChildren,
            NodeState::Aggregating,
            NodeState::Verifying,
            NodeState::Executing,
        ] {
            assert!(state.can_transition(NodeState::TerminalFailure));
        }
    }

    #[test]
    fn terminal_states_accept_no_further_transitions() {
        assert!(!NodeState::TerminalSuccess.can_transition(NodeState::Pending));
        assert!(!NodeState::TerminalFailure.can_transition(NodeState::TerminalSuccess));
    }

    #[test]
    fn executing_may_route_through_verifying_when_verification_is_enabled() {
        assert!(NodeState::Executing.can_transition(NodeState::Verifying));
        assert!(NodeState::Executing.can_transition(NodeState::TerminalSuccess));
    }

    #[test]
    fn verifying_reject_returns_to_executing_or_aggregating_never_classifying() {
        assert!(NodeState::Verifying.can_transition(NodeState::Executing));
        assert!(NodeState::Verifying.can_transition(NodeState::Aggregating));
        assert!(!NodeState::Verifying.can_transition(NodeState::Classifying));
    }
}
