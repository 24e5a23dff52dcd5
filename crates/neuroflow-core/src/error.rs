use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    // Graph build errors
    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Unknown {direction} port '{port}' on node '{node}'")]
    UnknownPort {
        node: String,
        port: String,
        direction: String,
    },

    #[error("Invalid node id '{0}': ids must be non-empty and must not contain '/'")]
    InvalidNodeId(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Connection {from} -> {to} would create a cycle")]
    Cycle { from: String, to: String },

    #[error("Input {port} already has an incoming connection and is not a fan-in port")]
    PortArity { port: String },

    #[error("Invalid options for node '{node}': {message}")]
    InvalidOptions { node: String, message: String },

    #[error("Composite boundary error on '{node}': {message}")]
    Boundary { node: String, message: String },

    // Expansion errors
    #[error("Iterable binding on {port} is ambiguous: {message}")]
    AmbiguousBinding { port: String, message: String },

    // Aggregation errors
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    // Scheduler errors
    #[error("Deadlock: no runnable node while {} remain unresolved: {}", .pending.len(), .pending.join(", "))]
    Deadlock { pending: Vec<String> },

    #[error("Node '{node}'{} failed{}: {source}", iteration_suffix(.iteration), port_suffix(.port))]
    NodeFailed {
        node: String,
        port: Option<String>,
        iteration: Option<String>,
        #[source]
        source: Box<FlowError>,
    },

    #[error("Node '{node}' timed out after {timeout_ms}ms")]
    NodeTimeout { node: String, timeout_ms: u64 },

    // Unit errors
    #[error("Unit execution failed: {unit}: {message}")]
    Unit { unit: String, message: String },

    #[error("Missing input '{port}' for unit {unit}")]
    MissingInput { unit: String, port: String },

    // Ingestion errors
    #[error("Event data error: {0}")]
    Ingestion(String),

    // Sink errors
    #[error("Sink error: {0}")]
    Sink(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn iteration_suffix(iteration: &Option<String>) -> String {
    iteration
        .as_deref()
        .map(|tag| format!(" [{}]", tag))
        .unwrap_or_default()
}

fn port_suffix(port: &Option<String>) -> String {
    port.as_deref()
        .map(|p| format!(" at port '{}'", p))
        .unwrap_or_default()
}

/// Coarse error classes, used for reporting and exit handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed graph, surfaced before execution.
    GraphBuild,
    /// Iterable binding could not be expanded.
    Expansion,
    /// Reshape element counts did not line up.
    Shape,
    /// Scheduler found no runnable node; an engine or graph defect.
    Deadlock,
    /// A unit, sink or timeout failure at a specific node.
    NodeExecution,
    /// Configuration, ingestion and I/O problems outside the graph.
    Environment,
}

impl FlowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowError::DuplicateNode(_)
            | FlowError::InvalidNodeId(_)
            | FlowError::UnknownPort { .. }
            | FlowError::UnknownNode(_)
            | FlowError::Cycle { .. }
            | FlowError::PortArity { .. }
            | FlowError::InvalidOptions { .. }
            | FlowError::Boundary { .. } => ErrorKind::GraphBuild,
            FlowError::AmbiguousBinding { .. } => ErrorKind::Expansion,
            FlowError::ShapeMismatch(_) => ErrorKind::Shape,
            FlowError::Deadlock { .. } => ErrorKind::Deadlock,
            FlowError::NodeFailed { .. }
            | FlowError::NodeTimeout { .. }
            | FlowError::Unit { .. }
            | FlowError::MissingInput { .. }
            | FlowError::Sink(_) => ErrorKind::NodeExecution,
            FlowError::Ingestion(_)
            | FlowError::Config(_)
            | FlowError::ConfigNotFound(_)
            | FlowError::Io(_)
            | FlowError::Json(_) => ErrorKind::Environment,
        }
    }

    /// Build a unit failure from any displayable error.
    pub fn unit(unit: impl Into<String>, message: impl std::fmt::Display) -> Self {
        FlowError::Unit {
            unit: unit.into(),
            message: message.to_string(),
        }
    }

    /// The innermost error, looking through `NodeFailed` wrappers.
    pub fn root_cause(&self) -> &FlowError {
        match self {
            FlowError::NodeFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
