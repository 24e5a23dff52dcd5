use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use neuroflow_core::error::{FlowError, Result};
use neuroflow_core::traits::Unit;
use neuroflow_core::types::{PortRef, Value};

use super::composite::Composite;
use super::dag::Graph;
use super::edge::Connection;
use super::node::{Node, NodeKind, PortSpec};
use super::options::NodeOptions;

/// Names of the sink node's control inputs.
pub const SINK_CONTAINER: &str = "container";
pub const SINK_SUBSTITUTIONS: &str = "substitutions";

/// Handle returned when a node is added, used to name its ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHandle {
    id: String,
}

impl NodeHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn input(&self, port: impl Into<String>) -> PortRef {
        PortRef::new(self.id.clone(), port)
    }

    pub fn output(&self, port: impl Into<String>) -> PortRef {
        PortRef::new(self.id.clone(), port)
    }
}

/// An input port replicated over a list of candidate values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterableBinding {
    pub port: PortRef,
    pub values: Vec<Value>,
}

/// A declarative workflow: the template graph plus its iterable bindings.
///
/// Built once, then expanded into an [`ExpandedGraph`] for execution. The
/// template itself is never run.
#[derive(Debug, Clone)]
pub struct Workflow {
    name: String,
    pub(crate) graph: Graph,
    pub(crate) bindings: Vec<IterableBinding>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            graph: Graph::default(),
            bindings: vec![],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a node with explicit ports and kind.
    pub fn add_node(
        &mut self,
        id: impl Into<String>,
        ports: PortSpec,
        kind: NodeKind,
    ) -> Result<NodeHandle> {
        let id = id.into();
        if id.is_empty() || id.contains('/') {
            return Err(FlowError::InvalidNodeId(id));
        }
        self.graph.insert(Node::new(id.clone(), ports, kind))?;
        Ok(NodeHandle { id })
    }

    /// Add an atomic node wrapping `unit`.
    pub fn add_unit(
        &mut self,
        id: impl Into<String>,
        ports: PortSpec,
        unit: Arc<dyn Unit>,
    ) -> Result<NodeHandle> {
        self.add_node(id, ports, NodeKind::Atomic(unit))
    }

    /// Add a composite node; its ports are the composite's exposed ports.
    pub fn add_composite(
        &mut self,
        id: impl Into<String>,
        composite: Composite,
    ) -> Result<NodeHandle> {
        let ports = composite.port_spec();
        self.add_node(id, ports, NodeKind::Composite(Arc::new(composite)))
    }

    /// Add a sink node publishing each of `destinations`.
    ///
    /// Destinations use dotted folder names; components starting with `@`
    /// share the parent folder (`qa.model.@matrix` publishes into
    /// `qa/model`).
    pub fn add_sink(&mut self, id: impl Into<String>, destinations: &[&str]) -> Result<NodeHandle> {
        let mut ports = PortSpec::new()
            .input(SINK_CONTAINER)
            .input(SINK_SUBSTITUTIONS);
        for dest in destinations {
            if *dest == SINK_CONTAINER || *dest == SINK_SUBSTITUTIONS {
                return Err(FlowError::InvalidOptions {
                    node: dest.to_string(),
                    message: "sink destination shadows a control input".into(),
                });
            }
            ports = ports.input(*dest);
        }
        self.add_node(id, ports, NodeKind::Sink)
    }

    /// Connect a producer output to a consumer input.
    pub fn connect(&mut self, from: &PortRef, to: &PortRef) -> Result<()> {
        if self.binding_for(to).is_some() {
            return Err(FlowError::AmbiguousBinding {
                port: to.to_string(),
                message: "input carries an iterable binding and cannot also be connected".into(),
            });
        }
        self.graph.connect(from, to)?;
        debug!(from = %from, to = %to, "Connected ports");
        Ok(())
    }

    /// Connect several port pairs between the same two nodes.
    pub fn connect_ports(
        &mut self,
        from: &NodeHandle,
        to: &NodeHandle,
        pairs: &[(&str, &str)],
    ) -> Result<()> {
        for (out, inp) in pairs {
            self.connect(&from.output(*out), &to.input(*inp))?;
        }
        Ok(())
    }

    /// Set a static value on a declared input.
    pub fn set_input(&mut self, port: &PortRef, value: Value) -> Result<()> {
        self.graph.require_input(port)?;
        let node = self
            .graph
            .node_mut(&port.node)
            .ok_or_else(|| FlowError::UnknownNode(port.node.clone()))?;
        node.statics.insert(port.port.clone(), value);
        Ok(())
    }

    /// Replace a node's options after validating them against its ports.
    pub fn set_options(&mut self, node: &str, options: NodeOptions) -> Result<()> {
        let ports = &self.graph.require_node(node)?.ports;
        options.validate(node, ports)?;
        if let Some(n) = self.graph.node_mut(node) {
            n.options = options;
        }
        Ok(())
    }

    /// Parse and apply options from a loosely typed map.
    pub fn configure(&mut self, node: &str, options: Value) -> Result<()> {
        let options = NodeOptions::from_value(node, options)?;
        self.set_options(node, options)
    }

    /// Bind an unconnected input to a list of candidate values.
    pub fn iterate(&mut self, port: &PortRef, values: Vec<Value>) -> Result<()> {
        self.graph.require_input(port)?;
        if self.graph.has_incoming(port) {
            return Err(FlowError::AmbiguousBinding {
                port: port.to_string(),
                message: "input already has an incoming connection".into(),
            });
        }
        if self.binding_for(port).is_some() {
            return Err(FlowError::AmbiguousBinding {
                port: port.to_string(),
                message: "input already carries an iterable binding".into(),
            });
        }
        self.bindings.push(IterableBinding {
            port: port.clone(),
            values,
        });
        Ok(())
    }

    pub fn bindings(&self) -> &[IterableBinding] {
        &self.bindings
    }

    pub fn binding_for(&self, port: &PortRef) -> Option<&IterableBinding> {
        self.bindings.iter().find(|b| &b.port == port)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.graph.node(id)
    }

    pub fn nodes(&self) -> &[Node] {
        self.graph.nodes()
    }

    pub fn connections(&self) -> &[Connection] {
        self.graph.connections()
    }

    pub fn has_incoming(&self, port: &PortRef) -> bool {
        self.graph.has_incoming(port)
    }

    pub(crate) fn require_input(&self, port: &PortRef) -> Result<()> {
        self.graph.require_input(port).map(|_| ())
    }

    pub(crate) fn require_output(&self, port: &PortRef) -> Result<()> {
        self.graph.require_output(port).map(|_| ())
    }
}

/// The concrete graph produced by expanding every iterable binding.
///
/// This is the only graph the executor runs.
#[derive(Debug, Clone)]
pub struct ExpandedGraph {
    name: String,
    pub(crate) graph: Graph,
}

impl ExpandedGraph {
    pub(crate) fn new(name: String, graph: Graph) -> Self {
        Self { name, graph }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.graph.node(id)
    }

    pub fn nodes(&self) -> &[Node] {
        self.graph.nodes()
    }

    pub fn connections(&self) -> &[Connection] {
        self.graph.connections()
    }

    pub fn incoming(&self, port: &PortRef) -> Vec<&Connection> {
        self.graph.incoming(port)
    }

    pub fn len(&self) -> usize {
        self.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    pub fn topological_order(&self) -> Result<Vec<String>> {
        self.graph.topological_order()
    }

    /// Ids of every node derived from template node `base`.
    pub fn replicas_of(&self, base: &str) -> Vec<&Node> {
        self.graph.nodes.iter().filter(|n| n.base == base).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::IdentityUnit;
    use serde_json::json;

    fn identity() -> Arc<dyn Unit> {
        Arc::new(IdentityUnit)
    }

    #[test]
    fn test_duplicate_node() {
        let mut wf = Workflow::new("wf");
        wf.add_unit("a", PortSpec::new().output("x"), identity())
            .unwrap();
        let err = wf
            .add_unit("a", PortSpec::new(), identity())
            .unwrap_err();
        assert!(matches!(err, FlowError::DuplicateNode(id) if id == "a"));
    }

    #[test]
    fn test_slash_in_id_rejected() {
        let mut wf = Workflow::new("wf");
        let err = wf.add_unit("a/b", PortSpec::new(), identity()).unwrap_err();
        assert!(matches!(err, FlowError::InvalidNodeId(ref id) if id == "a/b"));
        assert!(err.to_string().contains("must not contain '/'"));
        let err = wf.add_unit("", PortSpec::new(), identity()).unwrap_err();
        assert!(matches!(err, FlowError::InvalidNodeId(_)));
    }

    #[test]
    fn test_set_input_unknown_port() {
        let mut wf = Workflow::new("wf");
        let a = wf
            .add_unit("a", PortSpec::new().input("x"), identity())
            .unwrap();
        wf.set_input(&a.input("x"), json!(1)).unwrap();
        let err = wf.set_input(&a.input("y"), json!(1)).unwrap_err();
        assert!(matches!(err, FlowError::UnknownPort { .. }));
        assert_eq!(wf.node("a").unwrap().statics["x"], json!(1));
    }

    #[test]
    fn test_iterate_rejects_connected_input() {
        let mut wf = Workflow::new("wf");
        let a = wf
            .add_unit("a", PortSpec::new().output("x"), identity())
            .unwrap();
        let b = wf
            .add_unit("b", PortSpec::new().input("x"), identity())
            .unwrap();
        wf.connect(&a.output("x"), &b.input("x")).unwrap();
        let err = wf.iterate(&b.input("x"), vec![json!(1)]).unwrap_err();
        assert!(matches!(err, FlowError::AmbiguousBinding { .. }));
    }

    #[test]
    fn test_connect_rejects_bound_input() {
        let mut wf = Workflow::new("wf");
        let a = wf
            .add_unit("a", PortSpec::new().output("x"), identity())
            .unwrap();
        let b = wf
            .add_unit("b", PortSpec::new().input("x"), identity())
            .unwrap();
        wf.iterate(&b.input("x"), vec![json!(1), json!(2)]).unwrap();
        let err = wf.connect(&a.output("x"), &b.input("x")).unwrap_err();
        assert!(matches!(err, FlowError::AmbiguousBinding { .. }));
    }

    #[test]
    fn test_configure_rejects_unknown_option() {
        let mut wf = Workflow::new("wf");
        wf.add_unit("a", PortSpec::new().input("x"), identity())
            .unwrap();
        wf.configure("a", json!({"best_effort": true})).unwrap();
        assert!(wf.node("a").unwrap().options.best_effort);
        let err = wf.configure("a", json!({"retry": 2})).unwrap_err();
        assert!(matches!(err, FlowError::InvalidOptions { .. }));
    }

    #[test]
    fn test_sink_ports() {
        let mut wf = Workflow::new("wf");
        let sink = wf.add_sink("datasink", &["copes", "qa.model"]).unwrap();
        let node = wf.node(sink.id()).unwrap();
        assert!(node.is_sink());
        assert!(node.ports.has_input(SINK_CONTAINER));
        assert!(node.ports.has_input(SINK_SUBSTITUTIONS));
        assert!(node.ports.has_input("qa.model"));
        assert!(wf.add_sink("other", &["container"]).is_err());
    }
}
