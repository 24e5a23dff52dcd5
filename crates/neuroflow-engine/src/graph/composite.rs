use std::collections::BTreeMap;

use neuroflow_core::error::{FlowError, Result};
use neuroflow_core::types::PortRef;

use super::node::PortSpec;
use super::workflow::Workflow;

/// Internal identity node whose ports become the composite's inputs.
pub const INPUTSPEC: &str = "inputspec";
/// Internal identity node whose ports become the composite's outputs.
pub const OUTPUTSPEC: &str = "outputspec";

/// A sub-workflow wrapped as a single node.
///
/// The internal graph is private: outside connections can only reach it
/// through the exposed boundary ports. When an exposed input resolves, its
/// value is forwarded to every mapped internal input before the internal
/// graph runs; an exposed output resolves from its mapped internal output.
#[derive(Debug, Clone)]
pub struct Composite {
    graph: Workflow,
    inputs: BTreeMap<String, Vec<PortRef>>,
    outputs: BTreeMap<String, PortRef>,
}

impl Composite {
    /// Wrap `graph` with an empty boundary.
    pub fn new(graph: Workflow) -> Self {
        Self {
            graph,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    /// Wrap `graph`, exposing every port of its `inputspec` and
    /// `outputspec` nodes as `inputspec.<port>` / `outputspec.<port>`.
    pub fn with_specs(graph: Workflow) -> Result<Self> {
        let input_ports: Vec<String> = graph
            .node(INPUTSPEC)
            .map(|n| n.ports.inputs.iter().map(|p| p.name.clone()).collect())
            .unwrap_or_default();
        let output_ports: Vec<String> = graph
            .node(OUTPUTSPEC)
            .map(|n| n.ports.outputs.clone())
            .unwrap_or_default();

        let mut composite = Self::new(graph);
        for port in input_ports {
            composite = composite.expose_input(
                format!("{}.{}", INPUTSPEC, port),
                PortRef::new(INPUTSPEC, port),
            )?;
        }
        for port in output_ports {
            composite = composite.expose_output(
                format!("{}.{}", OUTPUTSPEC, port),
                PortRef::new(OUTPUTSPEC, port),
            )?;
        }
        Ok(composite)
    }

    /// Expose an internal input port. Calling this again with the same
    /// name forwards the value to several internal ports.
    pub fn expose_input(mut self, name: impl Into<String>, internal: PortRef) -> Result<Self> {
        let name = name.into();
        self.graph.require_input(&internal)?;
        if self.graph.has_incoming(&internal) {
            return Err(self.boundary_error(format!(
                "exposed input '{}' maps to {} which already has an internal connection",
                name, internal
            )));
        }
        if self.graph.binding_for(&internal).is_some() {
            return Err(self.boundary_error(format!(
                "exposed input '{}' maps to {} which carries an iterable binding",
                name, internal
            )));
        }
        if self.outputs.contains_key(&name) {
            return Err(self.boundary_error(format!("'{}' is already an exposed output", name)));
        }
        let targets = self.inputs.entry(name).or_default();
        if !targets.contains(&internal) {
            targets.push(internal);
        }
        Ok(self)
    }

    /// Expose an internal output port.
    pub fn expose_output(mut self, name: impl Into<String>, internal: PortRef) -> Result<Self> {
        let name = name.into();
        self.graph.require_output(&internal)?;
        if self.inputs.contains_key(&name) || self.outputs.contains_key(&name) {
            return Err(self.boundary_error(format!("'{}' is already exposed", name)));
        }
        self.outputs.insert(name, internal);
        Ok(self)
    }

    /// Ports the composite presents to the enclosing graph.
    ///
    /// An exposed input is fan-in when every internal port it maps to is.
    pub fn port_spec(&self) -> PortSpec {
        let mut spec = PortSpec::new();
        for (name, targets) in &self.inputs {
            let fan_in = !targets.is_empty()
                && targets.iter().all(|t| {
                    self.graph
                        .node(&t.node)
                        .and_then(|n| n.ports.input_port(&t.port))
                        .is_some_and(|p| p.fan_in)
                });
            spec = if fan_in {
                spec.fan_in(name.clone())
            } else {
                spec.input(name.clone())
            };
        }
        for name in self.outputs.keys() {
            spec = spec.output(name.clone());
        }
        spec
    }

    pub fn graph(&self) -> &Workflow {
        &self.graph
    }

    pub fn input_targets(&self, name: &str) -> &[PortRef] {
        self.inputs.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn output_source(&self, name: &str) -> Option<&PortRef> {
        self.outputs.get(name)
    }

    pub fn exposed_outputs(&self) -> impl Iterator<Item = (&String, &PortRef)> {
        self.outputs.iter()
    }

    fn boundary_error(&self, message: String) -> FlowError {
        FlowError::Boundary {
            node: self.graph.name().to_string(),
            message,
        }
    }
}
