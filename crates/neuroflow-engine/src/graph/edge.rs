use serde::Serialize;

use neuroflow_core::types::PortRef;

/// A connection from a producer's output port to a consumer's input port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Connection {
    pub from: PortRef,
    pub to: PortRef,
    /// Position of this connection among all connections into `to`.
    /// Fan-in values are delivered in ascending index order.
    pub index: usize,
}

impl Connection {
    pub fn new(from: PortRef, to: PortRef, index: usize) -> Self {
        Self { from, to, index }
    }
}
