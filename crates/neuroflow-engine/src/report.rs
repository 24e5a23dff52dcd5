use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use neuroflow_core::types::Value;

/// Final state of one node in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Succeeded,
    /// The node failed under the best-effort policy.
    Failed,
    /// A transitive upstream failed, so the node never ran.
    Starved,
}

/// Result of executing a single node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub node_id: String,
    pub status: NodeStatus,
    /// Execution time in milliseconds. Zero for starved nodes.
    pub elapsed_ms: u64,
    /// Iteration tags of the node, e.g. `subject_id=01`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One output handed to the sink.
#[derive(Debug, Clone, Serialize)]
pub struct PublishRecord {
    pub node_id: String,
    pub container: String,
    /// Destination path after substitution, relative to the container.
    pub path: String,
    pub value: Value,
}

/// Outcome of a workflow run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub run_id: Uuid,
    pub workflow: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Per-node results in completion order.
    pub nodes: Vec<NodeReport>,
    pub publications: Vec<PublishRecord>,
    /// Whether every node succeeded.
    pub succeeded: bool,
}

impl ExecutionReport {
    pub fn node(&self, node_id: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.iter().filter(|n| n.status == status).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &NodeReport> {
        self.nodes.iter().filter(|n| n.status == NodeStatus::Failed)
    }

    pub fn elapsed_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}
