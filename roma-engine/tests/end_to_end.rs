//! End-to-end scheduler behavior, covering the worked scenarios and
//! boundary conditions. Uses [`ScriptedReasonerProvider`] rather than a
//! live model, scripted per node id / goal exactly as the teacher's
//! `planning_executor.rs` tests script a `MockPlanner`/`StepExecutor` pair.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use roma_engine::{InMemoryCheckpointSink, ScriptedReasonerProvider, Solver};
use roma_kernel::checkpoint::CheckpointCadence;
use roma_kernel::config::SolveOptions;
use roma_kernel::error::ReasonerFailure;
use roma_kernel::graph::{NodeKind, TaskType};
use roma_kernel::outcome::Outcome;
use roma_kernel::reasoner::{
    AggregatorRequest, AggregatorResponse, AtomizerRequest, AtomizerResponse, ExecutorRequest, ExecutorResponse,
    PlannedChild, PlannerRequest, PlannerResponse, ReasonerProvider, Role, Verdict, VerifierRequest, VerifierResponse,
};

fn artifact(s: &str) -> serde_json::Value {
    serde_json::json!(s)
}

#[tokio::test]
async fn trivial_atomic_goal_succeeds() {
    let provider = Arc::new(ScriptedReasonerProvider::new());
    provider.push_atomizer(
        "n0",
        Ok(AtomizerResponse {
            is_atomic: true,
            node_kind: NodeKind::Execute,
        }),
    );
    provider.push_executor(
        "n0",
        Ok(ExecutorResponse {
            artifact: artifact("the answer is 42"),
            sources: None,
        }),
    );
    provider.push_verifier("write a one-line answer", Ok(VerifierResponse { verdict: Verdict::Ok }));

    let solver = Solver::new(provider);
    let outcome = solver
        .solve("write a one-line answer", TaskType::Think, SolveOptions::default())
        .await;

    match outcome {
        Outcome::Ok { artifact: got, .. } => assert_eq!(got, artifact("the answer is 42")),
        other => panic!("expected Ok, got {other:?}"),
    }
}

#[tokio::test]
async fn two_child_plan_aggregates_concurrently() {
    let provider = Arc::new(ScriptedReasonerProvider::new());
    provider.push_atomizer(
        "n0",
        Ok(AtomizerResponse {
            is_atomic: false,
            node_kind: NodeKind::Plan,
        }),
    );
    provider.push_planner(
        "n0",
        Ok(PlannerResponse {
            children: vec![
                PlannedChild {
                    goal: "gather fact A".into(),
                    task_type: TaskType::Retrieve,
                    depends_on_by_local_index: vec![],
                },
                PlannedChild {
                    goal: "gather fact B".into(),
                    task_type: TaskType::Retrieve,
                    depends_on_by_local_index: vec![],
                },
            ],
        }),
    );
    for (child_id, fact) in [("n1", "fact A"), ("n2", "fact B")] {
        provider.push_atomizer(
            child_id,
            Ok(AtomizerResponse {
                is_atomic: true,
                node_kind: NodeKind::Execute,
            }),
        );
        provider.push_executor(
            child_id,
            Ok(ExecutorResponse {
                artifact: artifact(fact),
                sources: None,
            }),
        );
    }
    provider.push_aggregator(
        "combine the facts",
        Ok(AggregatorResponse {
            synthesized_artifact: artifact("fact A + fact B"),
        }),
    );

    let solver = Solver::new(provider);
    let options = SolveOptions::default().with_verification_enabled(false).with_max_inflight(2);
    let outcome = solver.solve("combine the facts", TaskType::Think, options).await;

    match outcome {
        Outcome::Ok { artifact: got, .. } => assert_eq!(got, artifact("fact A + fact B")),
        other => panic!("expected Ok, got {other:?}"),
    }
}

#[tokio::test]
async fn verification_reject_then_accept_retries_the_executor() {
    let provider = Arc::new(ScriptedReasonerProvider::new());
    provider.push_atomizer(
        "n0",
        Ok(AtomizerResponse {
            is_atomic: true,
            node_kind: NodeKind::Execute,
        }),
    );
    provider.push_executor(
        "n0",
        Ok(ExecutorResponse {
            artifact: artifact("a boring tagline"),
            sources: None,
        }),
    );
    provider.push_executor(
        "n0",
        Ok(ExecutorResponse {
            artifact: artifact("a punchy tagline"),
            sources: None,
        }),
    );
    provider.push_verifier(
        "draft a tagline",
        Ok(VerifierResponse {
            verdict: Verdict::Reject("too boring".into()),
        }),
    );
    provider.push_verifier("draft a tagline", Ok(VerifierResponse { verdict: Verdict::Ok }));

    let solver = Solver::new(provider);
    let options = SolveOptions::default().with_attempts_budget(2);
    let outcome = solver.solve("draft a tagline", TaskType::Write, options).await;

    match outcome {
        Outcome::Ok { artifact: got, usage, .. } => {
            assert_eq!(got, artifact("a punchy tagline"));
            assert_eq!(usage.retries, 1);
        }
        other => panic!("expected Ok, got {other:?}"),
    }
}

#[tokio::test]
async fn depth_cap_forces_execute_even_when_atomizer_requests_plan() {
    let provider = Arc::new(ScriptedReasonerProvider::new());
    // Atomizer asks to plan, but max_depth=0 means the root must execute
    // directly; the planner is never invoked (no planner response is
    // scripted, so invoking it would surface as a Failed outcome).
    provider.push_atomizer(
        "n0",
        Ok(AtomizerResponse {
            is_atomic: false,
            node_kind: NodeKind::Plan,
        }),
    );
    provider.push_executor(
        "n0",
        Ok(ExecutorResponse {
            artifact: artifact("answered directly"),
            sources: None,
        }),
    );

    let solver = Solver::new(provider);
    let options = SolveOptions::default().with_max_depth(0).with_verification_enabled(false);
    let outcome = solver.solve("a deep question", TaskType::Think, options).await;

    match outcome {
        Outcome::Ok { artifact: got, .. } => assert_eq!(got, artifact("answered directly")),
        other => panic!("expected Ok, got {other:?}"),
    }
}

#[tokio::test]
async fn failing_leaf_surfaces_its_own_reason_and_id_not_the_root() {
    let provider = Arc::new(ScriptedReasonerProvider::new());
    provider.push_atomizer(
        "n0",
        Ok(AtomizerResponse {
            is_atomic: false,
            node_kind: NodeKind::Plan,
        }),
    );
    provider.push_planner(
        "n0",
        Ok(PlannerResponse {
            children: vec![PlannedChild {
                goal: "a doomed leaf".into(),
                task_type: TaskType::Retrieve,
                depends_on_by_local_index: vec![],
            }],
        }),
    );
    provider.push_atomizer(
        "n1",
        Ok(AtomizerResponse {
            is_atomic: true,
            node_kind: NodeKind::Execute,
        }),
    );
    provider.push_executor(
        "n1",
        Err(roma_kernel::error::ReasonerFailure::fatal("n1", Role::Executor, "tool call exhausted its retries")),
    );

    let solver = Solver::new(provider);
    let options = SolveOptions::default().with_verification_enabled(false);
    let outcome = solver.solve("a plan with a doomed leaf", TaskType::Think, options).await;

    match outcome {
        Outcome::Failed {
            reason_kind,
            failing_node_id,
            message,
            ..
        } => {
            assert_eq!(reason_kind, roma_kernel::graph::ReasonKind::ReasonerFailure);
            assert_eq!(failing_node_id.as_deref(), Some("n1"));
            assert_eq!(message, "tool call exhausted its retries");
        }
        other => panic!("expected Failed, got {other:?}"),
    }
}

struct HangingReasonerProvider;

#[async_trait]
impl ReasonerProvider for HangingReasonerProvider {
    async fn atomize(&self, _request: AtomizerRequest, cancel: CancellationToken) -> Result<AtomizerResponse, ReasonerFailure> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ReasonerFailure::fatal("n0", Role::Atomizer, "cancelled")),
            _ = tokio::time::sleep(Duration::from_secs(10)) => unreachable!("deadline should cancel first"),
        }
    }
    async fn plan(&self, _request: PlannerRequest, _cancel: CancellationToken) -> Result<PlannerResponse, ReasonerFailure> {
        unreachable!("not exercised by the deadline test")
    }
    async fn execute(&self, _request: ExecutorRequest, _cancel: CancellationToken) -> Result<ExecutorResponse, ReasonerFailure> {
        unreachable!("not exercised by the deadline test")
    }
    async fn aggregate(&self, _request: AggregatorRequest, _cancel: CancellationToken) -> Result<AggregatorResponse, ReasonerFailure> {
        unreachable!("not exercised by the deadline test")
    }
    async fn verify(&self, _request: VerifierRequest, _cancel: CancellationToken) -> Result<VerifierResponse, ReasonerFailure> {
        unreachable!("not exercised by the deadline test")
    }
}

#[tokio::test]
async fn global_deadline_fails_the_run() {
    let solver = Solver::new(Arc::new(HangingReasonerProvider));
    let options = SolveOptions::default().with_deadline_ms(100);
    let outcome = solver.solve("a goal that never finishes", TaskType::Think, options).await;

    match outcome {
        Outcome::Failed { reason_kind, .. } => {
            assert_eq!(reason_kind, roma_kernel::graph::ReasonKind::DeadlineExceeded);
        }
        other => panic!("expected Failed(DeadlineExceeded), got {other:?}"),
    }
}

#[tokio::test]
async fn checkpoint_then_resume_of_a_finished_run_returns_the_same_outcome() {
    let provider = Arc::new(ScriptedReasonerProvider::new());
    provider.push_atomizer(
        "n0",
        Ok(AtomizerResponse {
            is_atomic: true,
            node_kind: NodeKind::Execute,
        }),
    );
    provider.push_executor(
        "n0",
        Ok(ExecutorResponse {
            artifact: artifact("checkpointed answer"),
            sources: None,
        }),
    );
    provider.push_verifier("a checkpointed goal", Ok(VerifierResponse { verdict: Verdict::Ok }));

    let sink = Arc::new(InMemoryCheckpointSink::new());
    let solver = Solver::new(provider).with_checkpoint_sink(sink.clone());
    let options = SolveOptions::default().with_checkpoint_cadence(CheckpointCadence::EveryNTransitions(1));
    let first = solver.solve("a checkpointed goal", TaskType::Think, options.clone()).await;
    assert!(first.is_ok());

    // Run ids are uuid-derived; recover the real one from the outcome's
    // snapshot rather than guessing it.
    let run_id = match &first {
        Outcome::Ok { graph_snapshot, .. } => graph_snapshot.run_id.clone(),
        _ => unreachable!(),
    };
    let stored = sink.get(&run_id).expect("checkpoint was written");

    let resumed_provider = Arc::new(ScriptedReasonerProvider::new());
    let resumed_solver = Solver::new(resumed_provider);
    let second = resumed_solver.resume(stored, options).await;

    match (first, second) {
        (Outcome::Ok { artifact: a, .. }, Outcome::Ok { artifact: b, .. }) => assert_eq!(a, b),
        _ => panic!("expected both runs to succeed with the same artifact"),
    }
}
