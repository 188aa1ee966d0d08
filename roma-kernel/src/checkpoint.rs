//! Checkpoint sink contract (spec §3.1, §4.4.6, §6).

use async_trait::async_trait;

pub use crate::graph::RunRecord;

/// When the scheduler should emit a checkpoint. Mirrors the teacher's
/// small documented-enum style for scheduling policy knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CheckpointCadence {
    /// Emit a checkpoint every `n` state transitions.
    EveryNTransitions(u32),
    /// Emit a checkpoint every `duration` of wall-clock time, checked
    /// between dispatch rounds.
    EveryDuration(std::time::Duration),
    /// Emit on whichever of the two thresholds is reached first.
    Both {
        transitions: u32,
        duration: std::time::Duration,
    },
    /// Only on pause/stop and at run completion.
    OnStopOnly,
}

impl Default for CheckpointCadence {
    fn default() -> Self {
        CheckpointCadence::EveryNTransitions(25)
    }
}

/// A purely byte-bag persistence boundary (spec §6): the core owns the
/// serialization shape (`RunRecord`), the sink only stores and retrieves
/// it by `run_id`.
#[async_trait]
pub trait CheckpointSink: Send + Sync {
    async fn write(&self, record: &RunRecord) -> Result<(), String>;
    async fn read(&self, run_id: &str) -> Result<Option<RunRecord>, String>;
}
