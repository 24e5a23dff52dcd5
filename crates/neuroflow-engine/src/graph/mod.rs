//! Workflow graphs: the declarative template and its expanded form.
//!
//! A [`Workflow`] holds nodes with named ports, the connections between
//! them and any iterable bindings. Expanding it resolves every binding into
//! concrete replicas and yields the [`ExpandedGraph`] the executor runs.
//! Composite nodes own a private sub-workflow behind a port boundary.

pub mod composite;
pub mod dag;
pub mod edge;
pub mod expand;
pub mod node;
pub mod options;
pub mod workflow;

pub use composite::{Composite, INPUTSPEC, OUTPUTSPEC};
pub use dag::Graph;
pub use edge::Connection;
pub use node::{InputPort, Node, NodeKind, PortSpec};
pub use options::NodeOptions;
pub use workflow::{
    ExpandedGraph, IterableBinding, NodeHandle, Workflow, SINK_CONTAINER, SINK_SUBSTITUTIONS,
};
