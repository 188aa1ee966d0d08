//! The event-driven scheduler (spec §4.4): the hardest and largest part
//! of the system. Grounded on the teacher's two patterns:
//! `mofa-foundation/src/scheduler/mod.rs`'s `CronScheduler` (bounded
//! concurrency via semaphores, `tokio::select!` spawn loop, cooperative
//! cancellation) and `mofa-foundation/src/llm/planning_executor.rs`'s
//! `PlanningExecutor` (retry/reflect/replan loop) — generalized from a
//! flat, sequential plan to a recursive DAG executed with genuine
//! concurrency via `tokio::task::JoinSet`.

mod dispatch;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use roma_kernel::checkpoint::CheckpointSink;
use roma_kernel::config::{SolveOptions, Usage};
use roma_kernel::error::ReasonerFailure;
use roma_kernel::graph::{NodeError, NodeKind, NodeState, ReasonKind, TaskGraph, TaskType};
use roma_kernel::outcome::Outcome;
use roma_kernel::reasoner::{ReasonerProvider, Role, ToolBindingTable};

use dispatch::{role_for_state, VerifierOutcome};

enum RoleOutcome {
    Atomizer(Result<roma_kernel::reasoner::AtomizerResponse, ReasonerFailure>),
    Planner(Result<roma_kernel::reasoner::PlannerResponse, ReasonerFailure>),
    Executor(Result<roma_kernel::reasoner::ExecutorResponse, ReasonerFailure>),
    Aggregator(Result<roma_kernel::reasoner::AggregatorResponse, ReasonerFailure>),
    Verifier(Result<roma_kernel::reasoner::VerifierResponse, ReasonerFailure>),
}

/// Drives one [`TaskGraph`] to a fixpoint. Owns all graph mutations, which
/// keeps them serialized as spec §5 requires without needing a lock held
/// across every mutation: only this loop ever calls a `TaskGraph` mutator.
pub struct Scheduler {
    graph: TaskGraph,
    provider: Arc<dyn ReasonerProvider>,
    tools: Arc<dyn ToolBindingTable>,
    checkpoint_sink: Option<Arc<dyn CheckpointSink>>,
    options: SolveOptions,
    usage: Usage,
    retry_feedback: HashMap<String, String>,
    retry_not_before: HashMap<String, Instant>,
    timed_out_once: HashSet<String>,
    node_cancel: HashMap<String, CancellationToken>,
    /// Nodes cancelled because an ancestor's failure made their result
    /// irrelevant (spec §5): their eventual response, if any, is
    /// discarded rather than applied. Per-node-timeout cancellations are
    /// not recorded here, since a timeout's own synthetic failure *is*
    /// the outcome to apply (it drives the retry/fail decision).
    cancelled_irrelevant: HashSet<String>,
    run_cancel: CancellationToken,
    /// The `(node_id, reason_kind, message)` of the first node to ever
    /// enter `TerminalFailure` this run, captured once in `fail_node`.
    /// Cascading parent failures overwrite `root.error` many times over
    /// the life of a run, so `build_outcome` reports this instead of
    /// re-deriving from whichever node failed last (spec §7).
    first_failure: Option<(String, ReasonKind, String)>,
}

struct DefaultTools;

impl ToolBindingTable for DefaultTools {
    fn tools_for(&self, _task_type: TaskType) -> serde_json::Value {
        serde_json::Value::Null
    }
}

impl Scheduler {
    pub fn new(
        graph: TaskGraph,
        provider: Arc<dyn ReasonerProvider>,
        tools: Option<Arc<dyn ToolBindingTable>>,
        checkpoint_sink: Option<Arc<dyn CheckpointSink>>,
        options: SolveOptions,
    ) -> Self {
        Self {
            graph,
            provider,
            tools: tools.unwrap_or_else(|| Arc::new(DefaultTools)),
            checkpoint_sink,
            options,
            usage: Usage::default(),
            retry_feedback: HashMap::new(),
            retry_not_before: HashMap::new(),
            timed_out_once: HashSet::new(),
            node_cancel: HashMap::new(),
            cancelled_irrelevant: HashSet::new(),
            run_cancel: CancellationToken::new(),
            first_failure: None,
        }
    }

    fn selection_order(&self, mut ids: Vec<String>) -> Vec<String> {
        ids.sort_by(|a, b| {
            let na = self.graph.get(a).unwrap();
            let nb = self.graph.get(b).unwrap();
            // Depth descending, then child-order within the parent
            // (spec §4.4.2).
            nb.depth.cmp(&na.depth).then_with(|| {
                let order = |id: &str, node: &roma_kernel::graph::TaskNode| -> usize {
                    node.parent_id
                        .as_deref()
                        .map(|p| self.graph.children_of(p).iter().position(|c| c == id).unwrap_or(0))
                        .unwrap_or(0)
                };
                order(a, na).cmp(&order(b, nb))
            })
        });
        ids
    }

    /// Exponential backoff with jitter before a retried node becomes
    /// re-dispatchable, uniformly distributed in [75%, 100%] of the capped
    /// delay so concurrently-retried siblings don't all re-fire on the
    /// same tick (mirrors the teacher's `RetryPolicy::ExponentialBackoff`
    /// with jitter enabled).
    fn retry_backoff(attempt: u32) -> Duration {
        const BASE_MS: u64 = 50;
        const MAX_MS: u64 = 2_000;
        let exp = 1u64.checked_shl(attempt).and_then(|s| BASE_MS.checked_mul(s)).unwrap_or(MAX_MS);
        let capped = exp.min(MAX_MS);
        let min_delay = capped.saturating_mul(3) / 4;
        let ms = if min_delay >= capped {
            capped
        } else {
            rand::thread_rng().gen_range(min_delay..=capped)
        };
        Duration::from_millis(ms.min(MAX_MS))
    }

    fn schedule_retry(&mut self, node_id: &str, attempts: u32) {
        let delay = Self::retry_backoff(attempts);
        self.retry_not_before.insert(node_id.to_string(), Instant::now() + delay);
    }

    async fn maybe_checkpoint(&mut self, transitions: &mut u32, last: &mut Instant, in_flight: &[String]) {
        let due = match self.options.checkpoint_cadence {
            roma_kernel::checkpoint::CheckpointCadence::EveryNTransitions(n) => *transitions >= n,
            roma_kernel::checkpoint::CheckpointCadence::EveryDuration(d) => last.elapsed() >= d,
            roma_kernel::checkpoint::CheckpointCadence::Both { transitions: t, duration } => {
                *transitions >= t || last.elapsed() >= duration
            }
            roma_kernel::checkpoint::CheckpointCadence::OnStopOnly => false,
        };
        if due {
            self.checkpoint(in_flight).await;
            *transitions = 0;
            *last = Instant::now();
        }
    }

    async fn checkpoint(&self, in_flight: &[String]) {
        if let Some(sink) = &self.checkpoint_sink {
            let record = self.graph.snapshot(in_flight.to_vec());
            if let Err(e) = sink.write(&record).await {
                warn!("checkpoint write failed for run {}: {}", self.graph.run_id(), e);
            } else {
                debug!("checkpoint written for run {}", self.graph.run_id());
            }
        }
    }

    /// Cancels the cooperative-cancellation token of every currently
    /// in-flight node whose result `node_id`'s failure has just made
    /// irrelevant: every in-flight descendant of `node_id` (spec §5 —
    /// an ancestor's failure is a cancellation trigger). `node_id` itself
    /// is included, since a node can fail while its own reasoner call is
    /// still in flight (e.g. a context-assembly failure raised just before
    /// dispatch, or a race between a sibling's failure and this node's
    /// own in-progress call).
    fn cancel_irrelevant_subtree(&mut self, node_id: &str, in_flight: &HashSet<String>) {
        for id in in_flight {
            let is_self_or_descendant = id == node_id
                || self
                    .graph
                    .ancestor_chain(id)
                    .map(|chain| chain.iter().any(|a| a == node_id))
                    .unwrap_or(false);
            if is_self_or_descendant {
                if let Some(token) = self.node_cancel.get(id) {
                    token.cancel();
                }
                self.cancelled_irrelevant.insert(id.clone());
            }
        }
    }

    /// Propagate a non-recoverable child failure up the tree: a planning
    /// node whose children can never all succeed fails too (spec §4.4.5).
    fn fail_node(&mut self, node_id: &str, reason: ReasonKind, message: String, in_flight: &HashSet<String>) {
        let now = Utc::now();
        let _ = self.graph.set_error(node_id, NodeError::new(reason, message.clone()));
        if self.graph.set_state(node_id, NodeState::TerminalFailure, now).is_ok() {
            self.usage.nodes_failed += 1;
            if self.first_failure.is_none() {
                self.first_failure = Some((node_id.to_string(), reason, message));
            }
            self.cancel_irrelevant_subtree(node_id, in_flight);
        }
    }

    fn propagate_waiting_failures(&mut self, in_flight: &HashSet<String>) {
        let failing = self.graph.failing_waiting_parents(self.options.aggregate_partial);
        for (parent_id, status) in failing {
            let failed_goal = status
                .failed_ids
                .first()
                .and_then(|id| self.graph.get(id))
                .map(|n| n.goal.clone())
                .unwrap_or_default();
            self.fail_node(
                &parent_id,
                ReasonKind::InvalidPlan,
                format!("child subtree failed: {failed_goal}"),
                in_flight,
            );
        }
    }

    fn promote_ready_aggregations(&mut self) {
        let ready = self.graph.aggregation_ready(self.options.aggregate_partial);
        let now = Utc::now();
        for (id, _status) in ready {
            let _ = self.graph.set_state(&id, NodeState::Aggregating, now);
        }
    }

    #[instrument(skip(self), fields(run_id = %self.graph.run_id()))]
    pub async fn run(mut self) -> Outcome {
        let root_id = self.graph.root_id().map(str::to_string);
        let Some(root_id) = root_id else {
            return Outcome::Failed {
                reason_kind: ReasonKind::InvariantViolation,
                message: "graph has no root".to_string(),
                failing_node_id: None,
                graph_snapshot: self.graph.snapshot(vec![]),
            };
        };

        let start = Instant::now();
        let deadline = self.options.deadline_ms.map(Duration::from_millis);
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut joinset: JoinSet<(String, RoleOutcome)> = JoinSet::new();
        let mut transitions_since_checkpoint = 0u32;
        let mut last_checkpoint = Instant::now();
        let mut deadline_hit = false;

        loop {
            if let Some(d) = deadline {
                if start.elapsed() >= d {
                    deadline_hit = true;
                    break;
                }
            }
            if self.graph.get(&root_id).map(|n| n.state.is_terminal()).unwrap_or(true) {
                break;
            }

            self.propagate_waiting_failures(&in_flight);
            self.promote_ready_aggregations();

            if self.graph.get(&root_id).map(|n| n.state.is_terminal()).unwrap_or(true) {
                break;
            }

            let ready_ids = self.graph.ready_nodes();
            let candidates = self.selection_order(ready_ids.clone());
            let now_instant = Instant::now();
            let available = self.options.max_inflight.saturating_sub(in_flight.len());
            for node_id in candidates
                .into_iter()
                .filter(|id| !in_flight.contains(id))
                .filter(|id| self.retry_not_before.get(id).is_none_or(|t| now_instant >= *t))
                .take(available)
            {
                self.dispatch_one(&node_id, &mut in_flight, &mut joinset);
            }

            if joinset.is_empty() && in_flight.is_empty() {
                // Nothing in flight and nothing ready: either the run is
                // done (checked above), the graph is stuck (an invariant
                // bug rather than legitimate work), or every ready node is
                // still backing off from a retry — in the latter case keep
                // looping so the tick sleep below can wait it out.
                let still_backing_off = ready_ids.iter().any(|id| self.retry_not_before.contains_key(id));
                if !still_backing_off {
                    break;
                }
            }

            let remaining = deadline.map(|d| d.saturating_sub(start.elapsed()));
            let tick = tokio::time::sleep(remaining.unwrap_or(Duration::from_millis(50)).min(Duration::from_millis(50)));
            tokio::select! {
                _ = tick => {}
                joined = joinset.join_next(), if !joinset.is_empty() => {
                    if let Some(Ok((node_id, outcome))) = joined {
                        in_flight.remove(&node_id);
                        self.node_cancel.remove(&node_id);
                        let was_cancelled = self.cancelled_irrelevant.remove(&node_id);
                        if was_cancelled {
                            // Cancelled by a per-node timeout or by an
                            // ancestor's failure making this node moot; its
                            // response (if the reasoner produced one anyway)
                            // is discarded rather than applied (spec §5).
                            debug!("discarding response from cancelled node {}", node_id);
                        } else {
                            self.apply_outcome(&node_id, outcome, &mut transitions_since_checkpoint, &in_flight);
                        }
                    }
                }
            }

            self.maybe_checkpoint(&mut transitions_since_checkpoint, &mut last_checkpoint, &in_flight.iter().cloned().collect::<Vec<_>>())
                .await;
        }

        if deadline_hit {
            self.run_cancel.cancel();
            // Drain in-flight tasks cooperatively; their responses (if any
            // arrive) are discarded per spec §5.
            while let Some(_joined) = joinset.join_next().await {}
            self.fail_node(&root_id, ReasonKind::DeadlineExceeded, "run deadline exceeded".to_string(), &HashSet::new());
        }

        self.checkpoint(&[]).await;
        self.build_outcome(&root_id)
    }

    fn dispatch_one(&mut self, node_id: &str, in_flight: &mut HashSet<String>, joinset: &mut JoinSet<(String, RoleOutcome)>) {
        let now = Utc::now();
        self.retry_not_before.remove(node_id);
        let (node_state, node_task_type) = {
            let node = self.graph.get(node_id).expect("candidate exists");
            (node.state, node.task_type)
        };
        let role = match role_for_state(node_state) {
            Some(r) => r,
            None => return,
        };
        if node_state == NodeState::Pending && self.graph.set_state(node_id, NodeState::Classifying, now).is_err() {
            return;
        }

        let feedback = self.retry_feedback.remove(node_id);

        // Atomizer/Planner/Executor requests walk the execution context
        // (sibling + ancestor results), which can fail if the scheduler's
        // own readiness invariants are somehow violated; treat that as a
        // scheduler bug rather than panicking.
        let context_built = match role {
            Role::Atomizer => dispatch::build_atomizer_request(&self.graph, node_id, feedback.clone()).map(|_| ()),
            Role::Planner => dispatch::build_planner_request(&self.graph, node_id, feedback.clone()).map(|_| ()),
            Role::Executor => {
                let tools = self.tools.tools_for(node_task_type);
                dispatch::build_executor_request(&self.graph, node_id, feedback.clone(), tools).map(|_| ())
            }
            Role::Aggregator | Role::Verifier => Ok(()),
        };
        if context_built.is_err() {
            self.fail_node(node_id, ReasonKind::InvariantViolation, "context assembly failed".to_string(), in_flight);
            return;
        }

        in_flight.insert(node_id.to_string());
        self.count_dispatch(role);

        let cancel = self.run_cancel.child_token();
        self.node_cancel.insert(node_id.to_string(), cancel.clone());
        let timeout = self.options.node_timeout_ms.map(Duration::from_millis);
        let provider = Arc::clone(&self.provider);
        let tools_table = Arc::clone(&self.tools);
        let node_id_owned = node_id.to_string();

        match role {
            Role::Atomizer => {
                let req = dispatch::build_atomizer_request(&self.graph, node_id, feedback).expect("validated above");
                joinset.spawn(async move {
                    let fut = provider.atomize(req, cancel.clone());
                    let res = match timeout {
                        Some(t) => match tokio::time::timeout(t, fut).await {
                            Ok(r) => r,
                            Err(_) => {
                                cancel.cancel();
                                Err(ReasonerFailure::retryable(node_id_owned.clone(), Role::Atomizer, "node timeout"))
                            }
                        },
                        None => fut.await,
                    };
                    (node_id_owned, RoleOutcome::Atomizer(res))
                });
            }
            Role::Planner => {
                let req = dispatch::build_planner_request(&self.graph, node_id, feedback).expect("validated above");
                joinset.spawn(async move {
                    let fut = provider.plan(req, cancel.clone());
                    let res = match timeout {
                        Some(t) => match tokio::time::timeout(t, fut).await {
                            Ok(r) => r,
                            Err(_) => {
                                cancel.cancel();
                                Err(ReasonerFailure::retryable(node_id_owned.clone(), Role::Planner, "node timeout"))
                            }
                        },
                        None => fut.await,
                    };
                    (node_id_owned, RoleOutcome::Planner(res))
                });
            }
            Role::Executor => {
                let tools = tools_table.tools_for(node_task_type);
                let req = dispatch::build_executor_request(&self.graph, node_id, feedback, tools).expect("validated above");
                joinset.spawn(async move {
                    let fut = provider.execute(req, cancel.clone());
                    let res = match timeout {
                        Some(t) => match tokio::time::timeout(t, fut).await {
                            Ok(r) => r,
                            Err(_) => {
                                cancel.cancel();
                                Err(ReasonerFailure::retryable(node_id_owned.clone(), Role::Executor, "node timeout"))
                            }
                        },
                        None => fut.await,
                    };
                    (node_id_owned, RoleOutcome::Executor(res))
                });
            }
            Role::Aggregator => {
                let req = dispatch::build_aggregator_request(&self.graph, node_id, self.options.aggregate_partial);
                joinset.spawn(async move {
                    let fut = provider.aggregate(req, cancel.clone());
                    let res = match timeout {
                        Some(t) => match tokio::time::timeout(t, fut).await {
                            Ok(r) => r,
                            Err(_) => {
                                cancel.cancel();
                                Err(ReasonerFailure::retryable(node_id_owned.clone(), Role::Aggregator, "node timeout"))
                            }
                        },
                        None => fut.await,
                    };
                    (node_id_owned, RoleOutcome::Aggregator(res))
                });
            }
            Role::Verifier => {
                let req = dispatch::build_verifier_request(&self.graph, node_id);
                joinset.spawn(async move {
                    let fut = provider.verify(req, cancel.clone());
                    let res = match timeout {
                        Some(t) => match tokio::time::timeout(t, fut).await {
                            Ok(r) => r,
                            Err(_) => {
                                cancel.cancel();
                                Err(ReasonerFailure::retryable(node_id_owned.clone(), Role::Verifier, "node timeout"))
                            }
                        },
                        None => fut.await,
                    };
                    (node_id_owned, RoleOutcome::Verifier(res))
                });
            }
        }
    }

    fn count_dispatch(&mut self, role: Role) {
        self.usage.nodes_dispatched += 1;
        match role {
            Role::Atomizer => self.usage.atomizer_calls += 1,
            Role::Planner => self.usage.planner_calls += 1,
            Role::Executor => self.usage.executor_calls += 1,
            Role::Aggregator => self.usage.aggregator_calls += 1,
            Role::Verifier => self.usage.verifier_calls += 1,
        }
    }

    /// A retryable reasoner failure, independent of role: consumes a unit
    /// of the node's attempts budget and leaves it in its current dispatch
    /// state so it is re-selected once its backoff elapses, with the
    /// failure's message as feedback (spec §4.4.5, §7).
    fn handle_retryable(&mut self, node_id: &str, role: Role, failure: ReasonerFailure, in_flight: &HashSet<String>) {
        let attempts = self.graph.get(node_id).map(|n| n.attempts).unwrap_or(0);
        let is_timeout = failure.cause.contains("node timeout");
        let already_timed_out = is_timeout && !self.timed_out_once.insert(node_id.to_string());
        if !failure.retryable || already_timed_out || attempts + 1 >= self.options.attempts_budget {
            self.fail_node(node_id, ReasonKind::ReasonerFailure, failure.cause, in_flight);
            return;
        }
        let _ = self.graph.increment_attempts(node_id);
        self.usage.retries += 1;
        self.retry_feedback.insert(node_id.to_string(), failure.cause);
        self.schedule_retry(node_id, attempts);
        info!("retrying node {} after a {:?} failure", node_id, role);
    }

    fn apply_outcome(&mut self, node_id: &str, outcome: RoleOutcome, transitions: &mut u32, in_flight: &HashSet<String>) {
        let now = Utc::now();
        match outcome {
            RoleOutcome::Atomizer(Ok(resp)) => {
                if dispatch::apply_atomizer_response(&mut self.graph, node_id, resp, self.options.max_depth, now).is_ok() {
                    *transitions += 1;
                    self.usage.nodes_succeeded += 1;
                }
            }
            RoleOutcome::Atomizer(Err(e)) => self.handle_retryable(node_id, Role::Atomizer, e, in_flight),

            RoleOutcome::Planner(Ok(resp)) => {
                match dispatch::apply_planner_response(&mut self.graph, node_id, resp, self.options.max_depth, now) {
                    Ok(()) => *transitions += 1,
                    Err(e) => self.fail_node(node_id, ReasonKind::InvalidPlan, e.to_string(), in_flight),
                }
            }
            RoleOutcome::Planner(Err(e)) => self.handle_retryable(node_id, Role::Planner, e, in_flight),

            RoleOutcome::Executor(Ok(resp)) => {
                if dispatch::apply_executor_response(&mut self.graph, node_id, resp, self.options.verification_enabled, now).is_ok() {
                    *transitions += 1;
                    if !self.options.verification_enabled {
                        self.usage.nodes_succeeded += 1;
                    }
                }
            }
            RoleOutcome::Executor(Err(e)) => self.handle_retryable(node_id, Role::Executor, e, in_flight),

            RoleOutcome::Aggregator(Ok(resp)) => {
                if dispatch::apply_aggregator_response(&mut self.graph, node_id, resp, self.options.verification_enabled, now).is_ok() {
                    *transitions += 1;
                    if !self.options.verification_enabled {
                        self.usage.nodes_succeeded += 1;
                    }
                }
            }
            RoleOutcome::Aggregator(Err(e)) => self.handle_retryable(node_id, Role::Aggregator, e, in_flight),

            RoleOutcome::Verifier(Ok(resp)) => {
                match dispatch::apply_verifier_response(&mut self.graph, node_id, resp, self.options.attempts_budget, now) {
                    Ok(VerifierOutcome::Accepted) => {
                        *transitions += 1;
                        self.usage.nodes_succeeded += 1;
                    }
                    Ok(VerifierOutcome::RetryScheduled { feedback }) => {
                        *transitions += 1;
                        self.usage.retries += 1;
                        self.retry_feedback.insert(node_id.to_string(), feedback);
                        let attempts = self.graph.get(node_id).map(|n| n.attempts).unwrap_or(0);
                        self.schedule_retry(node_id, attempts);
                    }
                    Ok(VerifierOutcome::BudgetExhausted { feedback }) => {
                        *transitions += 1;
                        self.usage.nodes_failed += 1;
                        if self.first_failure.is_none() {
                            self.first_failure = Some((node_id.to_string(), ReasonKind::VerificationRejected, feedback));
                        }
                        self.cancel_irrelevant_subtree(node_id, in_flight);
                    }
                    Err(_) => {}
                }
            }
            RoleOutcome::Verifier(Err(e)) => self.handle_retryable(node_id, Role::Verifier, e, in_flight),
        }
    }

    fn build_outcome(&self, root_id: &str) -> Outcome {
        let root = self.graph.get(root_id).expect("root exists");
        match root.state {
            NodeState::TerminalSuccess => Outcome::Ok {
                artifact: root.result.clone().unwrap_or(serde_json::Value::Null),
                usage: self.usage.clone(),
                graph_snapshot: self.graph.snapshot(vec![]),
            },
            NodeState::TerminalFailure => {
                let (failing_node_id, reason_kind, message) = match &self.first_failure {
                    Some((id, reason, message)) => (Some(id.clone()), reason.clone(), message.clone()),
                    None => (
                        Some(root_id.to_string()),
                        root.error.as_ref().map(|e| e.reason.clone()).unwrap_or(ReasonKind::InvariantViolation),
                        root.error.as_ref().map(|e| e.message.clone()).unwrap_or_default(),
                    ),
                };
                Outcome::Failed {
                    reason_kind,
                    message,
                    failing_node_id,
                    graph_snapshot: self.graph.snapshot(vec![]),
                }
            }
            _ => Outcome::Failed {
                reason_kind: ReasonKind::InvariantViolation,
                message: "scheduler halted with a non-terminal root".to_string(),
                failing_node_id: Some(root_id.to_string()),
                graph_snapshot: self.graph.snapshot(vec![]),
            },
        }
    }
}
