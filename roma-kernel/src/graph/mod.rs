//! The task DAG (spec §3, §4.1): [`TaskNode`], [`NodeState`]'s legal
//! transition table, and [`TaskGraph`]'s dependency bookkeeping.

mod node;
mod task_graph;

pub use node::{NodeError, NodeKind, NodeState, ReasonKind, TaskNode, TaskType, Timing};
pub use task_graph::{ChildSpec, ChildrenStatus, RunRecord, TaskGraph};
