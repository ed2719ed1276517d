//! Fatal error conditions detected inside a shard timestep.

use thiserror::Error;

/// Invariant violations and resource exhaustion that abort a timestep.
///
/// Recoverable construction failures are reported in-band through token
/// memory and never surface here.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The 48-bit per-shard id counter wrapped around.
    #[error("shard {shard} exhausted its 48-bit id space")]
    IdSpaceExhausted { shard: u16 },

    /// An entity ended a step with negative energy.
    #[error("entity {id} reached negative energy {energy}")]
    NegativeEnergy { id: u64, energy: f64 },

    /// A cell lists a connection to a cell that no longer exists.
    #[error("cell {cell} holds an orphan connection")]
    OrphanConnection { cell: u64 },

    /// A cluster's center ended a full step outside every reachable compartment.
    #[error("cluster {cluster} left the reachable compartments at ({x}, {y})")]
    StrayCluster { cluster: u64, x: f64, y: f64 },

    /// A spatial map refused an insert.
    #[error(transparent)]
    Index(#[from] cytos_index::IndexError),
}
