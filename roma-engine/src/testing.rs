//! Test-only [`ReasonerProvider`] mocks. Grounded on the teacher's
//! `planning_executor.rs` test module (`MockPlanner`, `FailingStepExecutor`,
//! `ReplanAcceptingPlanner`): a scripted implementation, keyed by node id so
//! concurrent dispatch in a test stays deterministic, rather than one
//! monolithic stub per test case.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use roma_kernel::error::ReasonerFailure;
use roma_kernel::reasoner::{
    AggregatorRequest, AggregatorResponse, AtomizerRequest, AtomizerResponse, ExecutorRequest, ExecutorResponse,
    PlannerRequest, PlannerResponse, ReasonerProvider, Role, VerifierRequest, VerifierResponse,
};

type Scripted<T> = Mutex<HashMap<String, VecDeque<Result<T, ReasonerFailure>>>>;

/// Queues one scripted response per node id per role; each call to the
/// matching `ReasonerProvider` method pops the front of that node's queue.
/// A node with no queued response for the role it's called for gets a
/// fatal [`ReasonerFailure`] naming the gap, which surfaces loudly in test
/// output instead of hanging.
#[derive(Default)]
pub struct ScriptedReasonerProvider {
    atomizer: Scripted<AtomizerResponse>,
    planner: Scripted<PlannerResponse>,
    executor: Scripted<ExecutorResponse>,
    aggregator: Scripted<AggregatorResponse>,
    verifier: Scripted<VerifierResponse>,
}

impl ScriptedReasonerProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_atomizer(&self, node_id: impl Into<String>, response: Result<AtomizerResponse, ReasonerFailure>) {
        self.atomizer.lock().entry(node_id.into()).or_default().push_back(response);
    }

    pub fn push_planner(&self, node_id: impl Into<String>, response: Result<PlannerResponse, ReasonerFailure>) {
        self.planner.lock().entry(node_id.into()).or_default().push_back(response);
    }

    pub fn push_executor(&self, node_id: impl Into<String>, response: Result<ExecutorResponse, ReasonerFailure>) {
        self.executor.lock().entry(node_id.into()).or_default().push_back(response);
    }

    pub fn push_aggregator(&self, node_id: impl Into<String>, response: Result<AggregatorResponse, ReasonerFailure>) {
        self.aggregator.lock().entry(node_id.into()).or_default().push_back(response);
    }

    pub fn push_verifier(&self, node_id: impl Into<String>, response: Result<VerifierResponse, ReasonerFailure>) {
        self.verifier.lock().entry(node_id.into()).or_default().push_back(response);
    }

    fn pop<T>(queue: &Scripted<T>, node_id: &str, role: Role) -> Result<T, ReasonerFailure> {
        let mut guard = queue.lock();
        match guard.get_mut(node_id).and_then(VecDeque::pop_front) {
            Some(result) => result,
            None => Err(ReasonerFailure::fatal(
                node_id,
                role,
                format!("no scripted {role:?} response queued for node {node_id}"),
            )),
        }
    }
}

#[async_trait]
impl ReasonerProvider for ScriptedReasonerProvider {
    async fn atomize(&self, request: AtomizerRequest, _cancel: CancellationToken) -> Result<AtomizerResponse, ReasonerFailure> {
        Self::pop(&self.atomizer, &request.context.node_id, Role::Atomizer)
    }

    async fn plan(&self, request: PlannerRequest, _cancel: CancellationToken) -> Result<PlannerResponse, ReasonerFailure> {
        Self::pop(&self.planner, &request.context.node_id, Role::Planner)
    }

    async fn execute(&self, request: ExecutorRequest, _cancel: CancellationToken) -> Result<ExecutorResponse, ReasonerFailure> {
        Self::pop(&self.executor, &request.context.node_id, Role::Executor)
    }

    async fn aggregate(&self, request: AggregatorRequest, _cancel: CancellationToken) -> Result<AggregatorResponse, ReasonerFailure> {
        // AggregatorRequest carries no node id (spec §4.3): the parent
        // node is identified by its goal, which is unique enough for
        // scripted tests but not in general; callers needing per-node
        // aggregator scripting key on `parent_goal` instead.
        Self::pop(&self.aggregator, &request.parent_goal, Role::Aggregator)
    }

    async fn verify(&self, request: VerifierRequest, _cancel: CancellationToken) -> Result<VerifierResponse, ReasonerFailure> {
        Self::pop(&self.verifier, &request.original_goal, Role::Verifier)
    }
}
