//! A trivial in-process [`CheckpointSink`], useful for tests and for hosts
//! that only need resume-within-process (e.g. after a panic caught by a
//! supervisor, not a process restart). Grounded on the teacher's
//! `MessageStore`-style persistence traits, swapping the SQL-backed store
//! for a `parking_lot`-guarded map.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use roma_kernel::checkpoint::{CheckpointSink, RunRecord};

#[derive(Default)]
pub struct InMemoryCheckpointSink {
    records: Mutex<HashMap<String, RunRecord>>,
}

impl InMemoryCheckpointSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous peek, handy in tests that don't want to spin up a
    /// runtime just to inspect what was written.
    pub fn get(&self, run_id: &str) -> Option<RunRecord> {
        self.records.lock().get(run_id).cloned()
    }
}

#[async_trait]
impl CheckpointSink for InMemoryCheckpointSink {
    async fn write(&self, record: &RunRecord) -> Result<(), String> {
        self.records.lock().insert(record.run_id.clone(), record.clone());
        Ok(())
    }

    async fn read(&self, run_id: &str) -> Result<Option<RunRecord>, String> {
        Ok(self.records.lock().get(run_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roma_kernel::graph::{TaskGraph, TaskType};

    fn now() -> chrono::DateTime<chrono::Utc> {
        "2026-01-01T00:00:00Z".parse().unwrap()
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let sink = InMemoryCheckpointSink::new();
        let mut graph = TaskGraph::new("run-1");
        graph.create_root("goal", TaskType::Think, now());
        let record = graph.snapshot(vec![]);

        sink.write(&record).await.unwrap();
        let read_back = sink.read("run-1").await.unwrap().expect("record present");
        assert_eq!(read_back.run_id, "run-1");
    }

    #[tokio::test]
    async fn read_of_unknown_run_is_none() {
        let sink = InMemoryCheckpointSink::new();
        assert!(sink.read("missing").await.unwrap().is_none());
    }
}
