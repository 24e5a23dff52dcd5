use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Value carried by a resolved port.
///
/// File outputs are carried as path strings; lists carry fan-out results.
pub type Value = serde_json::Value;

/// Resolved values keyed by port name.
pub type PortValues = BTreeMap<String, Value>;

/// Direction of a port on a node.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => write!(f, "input"),
            Direction::Output => write!(f, "output"),
        }
    }
}

/// Reference to a named port on a node: `node.port`.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PortRef {
    pub node: String,
    pub port: String,
}

impl PortRef {
    pub fn new(node: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            port: port.into(),
        }
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.port)
    }
}

/// Provenance of a replicated node: which iterable value produced it.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct IterationTag {
    /// Name of the bound input port (e.g. `subject_id`).
    pub field: String,
    /// The candidate value this replica was created for.
    pub value: Value,
    /// Position of the value in the binding's candidate list.
    pub index: usize,
}

impl IterationTag {
    /// Directory-style name of the replica, e.g. `_subject_id_01`.
    pub fn dir_name(&self) -> String {
        format!("_{}_{}", self.field, render_value(&self.value))
    }
}

impl fmt::Display for IterationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.field, render_value(&self.value))
    }
}

/// Render a value for use in identifiers and paths.
///
/// Strings are used verbatim; everything else uses its JSON text.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Join a set of tags into the compact form used in errors and reports.
pub fn describe_tags(tags: &[IterationTag]) -> Option<String> {
    if tags.is_empty() {
        return None;
    }
    Some(
        tags.iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(","),
    )
}

/// Everything a unit may know about the node invocation it serves.
#[derive(Debug, Clone)]
pub struct UnitContext {
    /// Id of the node in the expanded graph.
    pub node_id: String,
    /// Iteration tags of the node, outermost first.
    pub tags: Vec<IterationTag>,
    /// Private scratch directory for this invocation.
    pub work_dir: PathBuf,
    /// Element index when the node maps over list inputs.
    pub map_index: Option<usize>,
}

impl UnitContext {
    pub fn new(node_id: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id: node_id.into(),
            tags: vec![],
            work_dir: work_dir.into(),
            map_index: None,
        }
    }

    pub fn iteration(&self) -> Option<String> {
        describe_tags(&self.tags)
    }
}
