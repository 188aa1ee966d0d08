//! Reasoner roles and their typed request/response contracts (spec §4.3).
//!
//! Five roles, one polymorphic dispatch surface: the core never
//! runtime-type-dispatches on a reasoner's concrete type (spec §9), it
//! calls the matching [`ReasonerProvider`] method for the role the node's
//! state demands and receives a typed response.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::context::ExecutionContext;
use crate::error::ReasonerFailure;
use crate::graph::{ChildSpec, NodeKind, TaskType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Atomizer,
    Planner,
    Executor,
    Aggregator,
    Verifier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtomizerRequest {
    pub goal: String,
    pub context: ExecutionContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtomizerResponse {
    pub is_atomic: bool,
    pub node_kind: NodeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerRequest {
    pub goal: String,
    pub context: ExecutionContext,
}

/// Wire-shaped child spec as the Planner returns it; converted to
/// [`crate::graph::ChildSpec`] (identical shape, kept distinct so the
/// reasoner contract doesn't leak graph-internal types) before being
/// applied to the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedChild {
    pub goal: String,
    pub task_type: TaskType,
    pub depends_on_by_local_index: Vec<usize>,
}

impl From<PlannedChild> for ChildSpec {
    fn from(c: PlannedChild) -> Self {
        ChildSpec::new(c.goal, c.task_type).depends_on(c.depends_on_by_local_index)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerResponse {
    pub children: Vec<PlannedChild>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorRequest {
    pub goal: String,
    pub context: ExecutionContext,
    pub task_type: TaskType,
    /// Opaque tool bundle for this task_type, host-supplied (spec §6).
    pub tools: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorResponse {
    pub artifact: serde_json::Value,
    pub sources: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorChildSummary {
    pub child_id: String,
    pub child_goal: String,
    pub child_task_type: TaskType,
    pub child_result: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorRequest {
    pub parent_goal: String,
    /// Ordered by the Planner's declared child sequence. When
    /// `aggregate_partial` is in effect this carries only the successful
    /// children; `failed_children` carries the rest.
    pub children: Vec<AggregatorChildSummary>,
    pub failed_children: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorResponse {
    pub synthesized_artifact: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierRequest {
    pub original_goal: String,
    pub candidate_artifact: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "verdict", content = "feedback")]
pub enum Verdict {
    Ok,
    Reject(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierResponse {
    pub verdict: Verdict,
}

/// Host-supplied capability table, one method per role (spec §4.3, §6).
/// Implementations are stateless with respect to the graph: they observe
/// only the request and context they are handed.
#[async_trait]
pub trait ReasonerProvider: Send + Sync {
    async fn atomize(
        &self,
        request: AtomizerRequest,
        cancel: CancellationToken,
    ) -> Result<AtomizerResponse, ReasonerFailure>;

    async fn plan(
        &self,
        request: PlannerRequest,
        cancel: CancellationToken,
    ) -> Result<PlannerResponse, ReasonerFailure>;

    async fn execute(
        &self,
        request: ExecutorRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutorResponse, ReasonerFailure>;

    async fn aggregate(
        &self,
        request: AggregatorRequest,
        cancel: CancellationToken,
    ) -> Result<AggregatorResponse, ReasonerFailure>;

    async fn verify(
        &self,
        request: VerifierRequest,
        cancel: CancellationToken,
    ) -> Result<VerifierResponse, ReasonerFailure>;
}

/// Host-supplied map from `task_type` to an opaque tool bundle, passed
/// through to the Executor's request untouched (spec §4.3 Routing policy,
/// §6).
pub trait ToolBindingTable: Send + Sync {
    fn tools_for(&self, task_type: TaskType) -> serde_json::Value;
}
