pub mod executor;
pub mod graph;
pub mod report;
pub mod sink;
pub mod units;

pub use executor::{Executor, ExecutorConfig};
pub use graph::{
    Composite, Connection, ExpandedGraph, IterableBinding, Node, NodeHandle, NodeKind,
    NodeOptions, PortSpec, Workflow, INPUTSPEC, OUTPUTSPEC, SINK_CONTAINER, SINK_SUBSTITUTIONS,
};
pub use report::{ExecutionReport, NodeReport, NodeStatus, PublishRecord};
pub use sink::{apply_substitutions, FsSink, MemorySink, StoredOutput};
pub use units::{FnUnit, IdentityUnit};
