use std::collections::{BTreeSet, HashMap, VecDeque};

use neuroflow_core::error::{FlowError, Result};
use neuroflow_core::types::{Direction, PortRef};

use super::edge::Connection;
use super::node::{InputPort, Node};

/// Nodes and connections, with the structural checks shared by template
/// and expanded graphs.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    pub(crate) nodes: Vec<Node>,
    pub(crate) index: HashMap<String, usize>,
    pub(crate) connections: Vec<Connection>,
}

impl Graph {
    pub(crate) fn insert(&mut self, node: Node) -> Result<()> {
        if self.index.contains_key(&node.id) {
            return Err(FlowError::DuplicateNode(node.id));
        }
        self.index.insert(node.id.clone(), self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub(crate) fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        match self.index.get(id) {
            Some(&i) => Some(&mut self.nodes[i]),
            None => None,
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Connections into `port`, in fan-in order.
    pub fn incoming(&self, port: &PortRef) -> Vec<&Connection> {
        let mut conns: Vec<&Connection> =
            self.connections.iter().filter(|c| &c.to == port).collect();
        conns.sort_by_key(|c| c.index);
        conns
    }

    pub fn has_incoming(&self, port: &PortRef) -> bool {
        self.connections.iter().any(|c| &c.to == port)
    }

    /// Distinct producer nodes feeding `node`.
    pub fn upstream(&self, node: &str) -> BTreeSet<&str> {
        self.connections
            .iter()
            .filter(|c| c.to.node == node)
            .map(|c| c.from.node.as_str())
            .collect()
    }

    /// Distinct consumer nodes fed by `node`.
    pub fn downstream(&self, node: &str) -> BTreeSet<&str> {
        self.connections
            .iter()
            .filter(|c| c.from.node == node)
            .map(|c| c.to.node.as_str())
            .collect()
    }

    /// Whether `to` is reachable from `from` along directed edges.
    pub fn reaches(&self, from: &str, to: &str) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            stack.extend(self.downstream(current));
        }
        false
    }

    pub(crate) fn require_node(&self, id: &str) -> Result<&Node> {
        self.node(id)
            .ok_or_else(|| FlowError::UnknownNode(id.to_string()))
    }

    pub(crate) fn require_output(&self, port: &PortRef) -> Result<&Node> {
        let node = self.require_node(&port.node)?;
        if !node.ports.has_output(&port.port) {
            return Err(unknown_port(port, Direction::Output));
        }
        Ok(node)
    }

    pub(crate) fn require_input(&self, port: &PortRef) -> Result<&InputPort> {
        let node = self.require_node(&port.node)?;
        node.ports
            .input_port(&port.port)
            .ok_or_else(|| unknown_port(port, Direction::Input))
    }

    /// Add a connection after checking ports, arity and acyclicity.
    pub(crate) fn connect(&mut self, from: &PortRef, to: &PortRef) -> Result<()> {
        self.require_output(from)?;
        let fan_in = self.require_input(to)?.fan_in;

        if from.node == to.node || self.reaches(&to.node, &from.node) {
            return Err(FlowError::Cycle {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let existing = self.connections.iter().filter(|c| &c.to == to).count();
        if existing > 0 && !fan_in {
            return Err(FlowError::PortArity {
                port: to.to_string(),
            });
        }

        self.connections
            .push(Connection::new(from.clone(), to.clone(), existing));
        Ok(())
    }

    /// Every non-fan-in input must have at most one source.
    pub(crate) fn check_arity(&self) -> Result<()> {
        let mut counts: HashMap<&PortRef, usize> = HashMap::new();
        for conn in &self.connections {
            *counts.entry(&conn.to).or_default() += 1;
        }
        for (port, count) in counts {
            if count > 1 && !self.require_input(port)?.fan_in {
                return Err(FlowError::PortArity {
                    port: port.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Kahn's algorithm; ties resolve in node insertion order.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut indegree: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), self.upstream(&n.id).len()))
            .collect();

        let mut ready: VecDeque<&str> = self
            .nodes
            .iter()
            .map(|n| n.id.as_str())
            .filter(|id| indegree[id] == 0)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_front() {
            order.push(id.to_string());
            for next in self.nodes_after(id) {
                if let Some(d) = indegree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push_back(next);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck = self
                .nodes
                .iter()
                .find(|n| !order.contains(&n.id))
                .map(|n| n.id.clone())
                .unwrap_or_default();
            return Err(FlowError::Cycle {
                from: stuck.clone(),
                to: stuck,
            });
        }
        Ok(order)
    }

    /// Downstream nodes in insertion order, for deterministic scheduling.
    pub(crate) fn nodes_after<'a>(&'a self, id: &str) -> Vec<&'a str> {
        let down = self.downstream(id);
        self.nodes
            .iter()
            .map(|n| n.id.as_str())
            .filter(|n| down.contains(n))
            .collect()
    }

    pub(crate) fn rebuild_index(&mut self) {
        self.index = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
    }
}

fn unknown_port(port: &PortRef, direction: Direction) -> FlowError {
    FlowError::UnknownPort {
        node: port.node.clone(),
        port: port.port.clone(),
        direction: direction.to_string(),
    }
}
