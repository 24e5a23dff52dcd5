use serde::{Deserialize, Serialize};

use neuroflow_core::error::{FlowError, Result};
use neuroflow_core::types::Value;

use super::node::PortSpec;

/// Per-node execution options.
///
/// The recognised option names are fixed; anything else is rejected when
/// the options are parsed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeOptions {
    /// A failure is recorded and downstream consumers are starved instead of
    /// aborting the run.
    #[serde(default)]
    pub best_effort: bool,
    /// Inputs iterated element-wise; the unit runs once per element and its
    /// outputs are collected into lists.
    #[serde(default)]
    pub map_over: Vec<String>,
    /// Id of an iterable source node whose replicas this node collects
    /// instead of being replicated itself.
    #[serde(default)]
    pub join_over: Option<String>,
    /// Upper bound for a single unit execution.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl NodeOptions {
    /// Parse options from a loosely typed map such as a config table.
    pub fn from_value(node: &str, value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| FlowError::InvalidOptions {
            node: node.to_string(),
            message: e.to_string(),
        })
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    pub fn map_over(mut self, ports: &[&str]) -> Self {
        self.map_over = ports.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn join_over(mut self, source: impl Into<String>) -> Self {
        self.join_over = Some(source.into());
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Check the options against the node's declared ports.
    pub fn validate(&self, node: &str, ports: &PortSpec) -> Result<()> {
        for port in &self.map_over {
            if !ports.has_input(port) {
                return Err(FlowError::InvalidOptions {
                    node: node.to_string(),
                    message: format!("map_over names undeclared input '{}'", port),
                });
            }
        }
        if self.timeout_secs == Some(0) {
            return Err(FlowError::InvalidOptions {
                node: node.to_string(),
                message: "timeout_secs must be positive".into(),
            });
        }
        Ok(())
    }
}
