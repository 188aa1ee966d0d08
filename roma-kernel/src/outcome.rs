//! The record returned to the host at the end of a run (spec §6).

use serde::{Deserialize, Serialize};

pub use crate::graph::ReasonKind;
use crate::config::Usage;
use crate::graph::RunRecord;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Ok {
        artifact: serde_json::Value,
        usage: Usage,
        graph_snapshot: RunRecord,
    },
    Failed {
        reason_kind: ReasonKind,
        message: String,
        failing_node_id: Option<String>,
        graph_snapshot: RunRecord,
    },
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok { .. })
    }
}
