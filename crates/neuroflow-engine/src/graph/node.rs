use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use neuroflow_core::traits::Unit;
use neuroflow_core::types::{IterationTag, PortValues};

use super::composite::Composite;
use super::options::NodeOptions;

/// A declared input slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputPort {
    pub name: String,
    /// Accepts several ordered connections, delivered as a list.
    pub fan_in: bool,
}

/// The declared input and output ports of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PortSpec {
    pub inputs: Vec<InputPort>,
    pub outputs: Vec<String>,
}

impl PortSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a single-source input.
    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(InputPort {
            name: name.into(),
            fan_in: false,
        });
        self
    }

    /// Declare an aggregating input that collects every incoming connection.
    pub fn fan_in(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(InputPort {
            name: name.into(),
            fan_in: true,
        });
        self
    }

    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    pub fn inputs(self, names: &[&str]) -> Self {
        names.iter().fold(self, |spec, name| spec.input(*name))
    }

    pub fn outputs(self, names: &[&str]) -> Self {
        names.iter().fold(self, |spec, name| spec.output(*name))
    }

    pub fn input_port(&self, name: &str) -> Option<&InputPort> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn has_input(&self, name: &str) -> bool {
        self.input_port(name).is_some()
    }

    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|p| p == name)
    }
}

/// What a node does when it runs.
#[derive(Clone)]
pub enum NodeKind {
    /// Wraps an external unit.
    Atomic(Arc<dyn Unit>),
    /// Runs an owned sub-graph behind a port boundary.
    Composite(Arc<Composite>),
    /// Publishes its inputs through the executor's sink.
    Sink,
}

impl NodeKind {
    pub fn label(&self) -> &str {
        match self {
            NodeKind::Atomic(unit) => unit.name(),
            NodeKind::Composite(_) => "composite",
            NodeKind::Sink => "sink",
        }
    }
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Atomic(unit) => write!(f, "Atomic({})", unit.name()),
            NodeKind::Composite(c) => write!(f, "Composite({})", c.graph().name()),
            NodeKind::Sink => write!(f, "Sink"),
        }
    }
}

/// A node in a workflow graph.
#[derive(Debug, Clone)]
pub struct Node {
    /// Unique identifier within the enclosing graph.
    pub id: String,
    /// Identifier of the template node this one was derived from.
    pub base: String,
    pub ports: PortSpec,
    /// Static input values, set before execution.
    pub statics: PortValues,
    pub options: NodeOptions,
    pub kind: NodeKind,
    /// Iteration provenance, outermost binding first.
    pub tags: Vec<IterationTag>,
}

impl Node {
    pub fn new(id: impl Into<String>, ports: PortSpec, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            base: id.clone(),
            id,
            ports,
            statics: PortValues::new(),
            options: NodeOptions::default(),
            kind,
            tags: vec![],
        }
    }

    /// Identifier of a replica carrying `tags`, e.g. `_subject_id_01/datasource`.
    pub fn replica_id(base: &str, tags: &[IterationTag]) -> String {
        if tags.is_empty() {
            return base.to_string();
        }
        let dirs: Vec<String> = tags.iter().map(|t| t.dir_name()).collect();
        format!("{}/{}", dirs.join("/"), base)
    }

    pub fn is_composite(&self) -> bool {
        matches!(self.kind, NodeKind::Composite(_))
    }

    pub fn is_sink(&self) -> bool {
        matches!(self.kind, NodeKind::Sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_port_spec_builder() {
        let spec = PortSpec::new()
            .inputs(&["copes", "varcopes"])
            .fan_in("dof_files")
            .outputs(&["res4d", "zstats"]);

        assert!(spec.has_input("copes"));
        assert!(!spec.input_port("copes").unwrap().fan_in);
        assert!(spec.input_port("dof_files").unwrap().fan_in);
        assert!(spec.has_output("zstats"));
        assert!(!spec.has_output("copes"));
    }

    #[test]
    fn test_replica_id() {
        assert_eq!(Node::replica_id("datasource", &[]), "datasource");
        let tags = vec![
            IterationTag {
                field: "subject_id".into(),
                value: json!("01"),
                index: 0,
            },
            IterationTag {
                field: "run".into(),
                value: json!(2),
                index: 1,
            },
        ];
        assert_eq!(
            Node::replica_id("datasource", &tags),
            "_subject_id_01/_run_2/datasource"
        );
    }
}
