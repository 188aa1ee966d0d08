//! Scheduler, solver facade and checkpoint sinks for the ROMA recursive
//! hierarchical task-planning engine.
//!
//! `roma-kernel` defines the graph, the reasoner contracts and the
//! checkpoint boundary; this crate supplies the only thing it deliberately
//! left abstract: an event-driven loop that drives a `TaskGraph` to a
//! fixpoint by dispatching reasoner calls through a bounded worker pool.

pub mod checkpoint;
pub mod facade;
pub mod scheduler;
pub mod testing;

pub use checkpoint::InMemoryCheckpointSink;
pub use facade::Solver;
pub use scheduler::Scheduler;
pub use testing::ScriptedReasonerProvider;
