//! Engine-level error taxonomy.

use cytos_core::CoreError;
use thiserror::Error;

/// Fatal conditions surfaced to the controller.
///
/// Once a tick fails the engine latches unhealthy and refuses further
/// ticks; the access port may still dump the last-known-good snapshot.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A configuration value cannot be used.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// A shard step aborted with an invariant violation.
    #[error("shard step failed: {0}")]
    Core(#[from] CoreError),

    /// The engine refused a tick because an earlier tick failed.
    #[error("engine is unhealthy: {reason}")]
    Unhealthy { reason: String },

    /// The worker pool could not be built.
    #[error("worker pool construction failed: {0}")]
    WorkerPool(String),
}
