use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{PortValues, UnitContext, Value};

/// An external processing routine wrapped as an atomic node.
///
/// The engine treats units as black boxes: it hands over the resolved input
/// values and expects a value for each declared output it needs downstream.
pub trait Unit: Send + Sync + 'static {
    /// Unit name (used in logs and error messages).
    fn name(&self) -> &str;

    /// Execute the unit once with resolved inputs.
    fn run(&self, ctx: UnitContext, inputs: PortValues) -> BoxFuture<'_, Result<PortValues>>;
}

/// One publication handed to a sink.
#[derive(Debug, Clone)]
pub struct Publication<'a> {
    /// Grouping key for all outputs of one iteration (e.g. subject id).
    pub container: &'a str,
    /// Ephemeral relative path, before substitutions.
    pub relative_path: &'a str,
    /// Ordered (pattern, replacement) pairs to apply to `relative_path`.
    pub substitutions: &'a [(String, String)],
    pub value: &'a Value,
}

/// Persistence backend for final outputs.
pub trait Sink: Send + Sync + 'static {
    /// Store one value; returns the published path after substitution.
    fn publish<'a>(&'a self, publication: Publication<'a>) -> BoxFuture<'a, Result<String>>;
}
