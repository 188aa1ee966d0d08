//! The host-facing entry point. Grounded on
//! `mofa-foundation/src/llm/planning_executor.rs`'s `PlanningExecutor::new`
//! / `run`: construct once with the reasoner/tool/checkpoint dependencies,
//! then drive a goal (or a resumed run) to completion.

use std::sync::Arc;

use chrono::Utc;

use roma_kernel::checkpoint::CheckpointSink;
use roma_kernel::config::SolveOptions;
use roma_kernel::graph::{RunRecord, TaskGraph, TaskType};
use roma_kernel::outcome::Outcome;
use roma_kernel::reasoner::{ReasonerProvider, ToolBindingTable};

use crate::scheduler::Scheduler;

/// Constructs and drives a [`Scheduler`] for one run. Stateless itself; all
/// run state lives in the `TaskGraph` the scheduler owns for the duration
/// of `solve`/`resume`.
pub struct Solver {
    provider: Arc<dyn ReasonerProvider>,
    tools: Option<Arc<dyn ToolBindingTable>>,
    checkpoint_sink: Option<Arc<dyn CheckpointSink>>,
}

impl Solver {
    pub fn new(provider: Arc<dyn ReasonerProvider>) -> Self {
        Self {
            provider,
            tools: None,
            checkpoint_sink: None,
        }
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolBindingTable>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_checkpoint_sink(mut self, sink: Arc<dyn CheckpointSink>) -> Self {
        self.checkpoint_sink = Some(sink);
        self
    }

    /// Solve a fresh goal (spec §1, §4, §6): builds a single-node root
    /// graph and runs the scheduler to a fixpoint.
    pub async fn solve(&self, goal: impl Into<String>, task_type: TaskType, options: SolveOptions) -> Outcome {
        let run_id = format!("run-{}", uuid::Uuid::new_v4());
        let mut graph = TaskGraph::new(run_id);
        graph.create_root(goal, task_type, Utc::now());
        self.run_graph(graph, options).await
    }

    /// Resume a previously checkpointed run (spec §4.4.6): rebuilds the
    /// graph from a snapshot and continues the scheduler loop, including
    /// any node that was mid-flight at checkpoint time (its dispatch just
    /// restarts from the beginning, since `in_flight` is recorded but not
    /// itself resumable mid-reasoner-call).
    pub async fn resume(&self, record: RunRecord, options: SolveOptions) -> Outcome {
        let graph = TaskGraph::restore(record);
        self.run_graph(graph, options).await
    }

    async fn run_graph(&self, graph: TaskGraph, options: SolveOptions) -> Outcome {
        let scheduler = Scheduler::new(
            graph,
            Arc::clone(&self.provider),
            self.tools.clone(),
            self.checkpoint_sink.clone(),
            options,
        );
        scheduler.run().await
    }
}
