use futures::future::BoxFuture;

use neuroflow_core::error::Result;
use neuroflow_core::traits::Unit;
use neuroflow_core::types::{PortValues, UnitContext};

// ── IdentityUnit ────────────────────────────────────────────────

/// Passes every input through to the output of the same name.
///
/// Used for `inputspec`/`outputspec` boundary nodes and for iterable
/// sources such as `infosource`.
pub struct IdentityUnit;

impl Unit for IdentityUnit {
    fn name(&self) -> &str {
        "identity"
    }

    fn run(&self, _ctx: UnitContext, inputs: PortValues) -> BoxFuture<'_, Result<PortValues>> {
        Box::pin(async move { Ok(inputs) })
    }
}

// ── FnUnit ──────────────────────────────────────────────────────

type UnitFn = dyn Fn(&UnitContext, PortValues) -> Result<PortValues> + Send + Sync;

/// Wraps a synchronous closure as a unit.
pub struct FnUnit {
    name: String,
    func: Box<UnitFn>,
}

impl FnUnit {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&UnitContext, PortValues) -> Result<PortValues> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }
}

impl Unit for FnUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: UnitContext, inputs: PortValues) -> BoxFuture<'_, Result<PortValues>> {
        Box::pin(async move { (self.func)(&ctx, inputs) })
    }
}
