#[cfg(feature = "memory")]
pub mod memory;

mod materializer;
mod record;

pub use materializer::ShapeMaterializer;
pub use record::*;

use async_trait::async_trait;

use crate::error::Error;

/// How the pipeline is expected to drive its round trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// The caller blocks the current thread until the flush completes.
    Blocking,
    /// The caller may be suspended at each round trip.
    Suspendable,
}

/// -----------------------------
/// Plan compiler contract
/// -----------------------------

/// Turns a logical fetch request into an executable, cacheable plan. The
/// engine never sees query text.
pub trait PlanCompiler: Send + Sync {
    fn compile(&self, request: &PlanRequest) -> Result<FetchPlan, Error>;
}

/// -----------------------------
/// Row materializer contract
/// -----------------------------

pub trait RowMaterializer: Send + Sync {
    /// Parse one raw row laid out as `shape` into identity, values and type
    /// certainty.
    fn materialize(&self, shape: &ResultShape, row: &RawRow) -> Result<MaterializedRow, Error>;
}

/// -----------------------------
/// Command pipeline contract
/// -----------------------------

#[async_trait]
pub trait CommandPipeline: Send + Sync {
    /// Execute all statements, grouped into as few round trips as the
    /// pipeline sees fit. `PipelineResult::rows` must hold one entry per
    /// statement, in statement order.
    async fn execute(
        &self,
        statements: &[Statement],
        mode: ExecutionMode,
    ) -> Result<PipelineResult, Error>;
}
