//! Run-level configuration and usage accounting.

use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointCadence;

/// Knobs recognized at the core boundary (spec §9). `checkpoint_sink` is
/// not part of this struct since it is a trait object supplied directly to
/// the facade, not a serializable setting; see `roma-engine::facade`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolveOptions {
    pub max_depth: u32,
    pub max_inflight: usize,
    pub attempts_budget: u32,
    pub verification_enabled: bool,
    pub aggregate_partial: bool,
    pub deadline_ms: Option<u64>,
    pub node_timeout_ms: Option<u64>,
    pub checkpoint_cadence: CheckpointCadence,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            max_depth: 5,
            max_inflight: 4,
            attempts_budget: 2,
            verification_enabled: true,
            aggregate_partial: false,
            deadline_ms: None,
            node_timeout_ms: None,
            checkpoint_cadence: CheckpointCadence::default(),
        }
    }
}

impl SolveOptions {
    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_max_inflight(mut self, max_inflight: usize) -> Self {
        self.max_inflight = max_inflight.max(1);
        self
    }

    pub fn with_attempts_budget(mut self, attempts_budget: u32) -> Self {
        self.attempts_budget = attempts_budget;
        self
    }

    pub fn with_verification_enabled(mut self, enabled: bool) -> Self {
        self.verification_enabled = enabled;
        self
    }

    pub fn with_aggregate_partial(mut self, aggregate_partial: bool) -> Self {
        self.aggregate_partial = aggregate_partial;
        self
    }

    pub fn with_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.deadline_ms = Some(deadline_ms);
        self
    }

    pub fn with_node_timeout_ms(mut self, node_timeout_ms: u64) -> Self {
        self.node_timeout_ms = Some(node_timeout_ms);
        self
    }

    pub fn with_checkpoint_cadence(mut self, cadence: CheckpointCadence) -> Self {
        self.checkpoint_cadence = cadence;
        self
    }
}

/// Per-run usage accounting, accumulated by the scheduler and returned on
/// the outcome (spec §9 "Global mutable state": no process-level
/// singletons, usage lives on the run).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub nodes_dispatched: u32,
    pub nodes_succeeded: u32,
    pub nodes_failed: u32,
    pub retries: u32,
    pub atomizer_calls: u32,
    pub planner_calls: u32,
    pub executor_calls: u32,
    pub aggregator_calls: u32,
    pub verifier_calls: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let opts = SolveOptions::default();
        assert_eq!(opts.attempts_budget, 2);
        assert!(opts.verification_enabled);
        assert!(!opts.aggregate_partial);
    }

    #[test]
    fn builder_chain() {
        let opts = SolveOptions::default()
            .with_max_depth(2)
            .with_max_inflight(1)
            .with_aggregate_partial(true);
        assert_eq!(opts.max_depth, 2);
        assert_eq!(opts.max_inflight, 1);
        assert!(opts.aggregate_partial);
    }
}
