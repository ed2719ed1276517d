//! Core types shared across the Cytos workspace: the entity model, toroidal
//! geometry, rigid-body physics, the deterministic per-shard number stream,
//! cell functions, and the eight-phase shard timestep.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod descriptions;
pub mod entities;
mod error;
pub mod functions;
pub mod physics;
pub mod random;
pub mod space;
pub mod token;
pub mod unit;
pub mod vector;

pub use descriptions::{
    CellDescription, CellFunctionDescription, CellFunctionKind, ClusterDescription,
    DataDescription, ParticleDescription,
};
pub use entities::{Cell, CellKey, Cluster, ClusterKey, Particle, ParticleKey};
pub use error::CoreError;
pub use functions::CellFunction;
pub use random::{GLOBAL_SHARD, IdAllocator, RANDOM_RING_SIZE, RandomRing};
pub use space::{Compartment, IntRect, IntVector2, RelativeLocation, SpaceMetric};
pub use token::Token;
pub use unit::{NeighborRef, Neighborhood, Unit};
pub use vector::Vector2;

/// Static parameter set shared by every shard, read-only during a tick.
///
/// Field names follow the authoritative parameter names of the engine
/// surface; callers recognize them when splicing parameter updates in
/// through the access port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationParameters {
    /// Distance below which two cells of different clusters collide, and the
    /// radius of the constructor's obstacle scan.
    pub cell_min_distance: f64,
    /// Longest allowed placement distance for a constructed cell.
    pub cell_max_distance: f64,
    /// Hard upper bound on connections per cell.
    pub cell_max_bonds: usize,
    /// Energy below which a cell is removed and its cluster decomposes.
    pub cell_min_energy: f64,
    /// Minimum energy a token must retain to keep existing.
    pub token_min_energy: f64,
    /// Fixed byte length of every token memory.
    pub token_memory_size: usize,
    /// Energy granted to a constructed cell, taken from the token.
    pub cell_function_constructor_offspring_cell_energy: f64,
    /// Default placement distance for a constructed cell.
    pub cell_function_constructor_offspring_cell_distance: f64,
    /// Energy granted to a token spawned on a constructed cell.
    pub cell_function_constructor_offspring_token_energy: f64,
    /// Instruction budget of the cell-computer interpreter.
    pub cell_function_computer_max_instructions: usize,
    /// Byte length of a computer cell's private memory.
    pub cell_function_computer_cell_memory_size: usize,
    /// Per-cell, per-tick probability of emitting a radiation particle.
    pub radiation_prob: f64,
    /// Energy carried away by one radiation particle.
    pub radiation_energy: f64,
}

impl Default for SimulationParameters {
    fn default() -> Self {
        Self {
            cell_min_distance: 0.3,
            cell_max_distance: 1.3,
            cell_max_bonds: 6,
            cell_min_energy: 50.0,
            token_min_energy: 3.0,
            token_memory_size: 256,
            cell_function_constructor_offspring_cell_energy: 100.0,
            cell_function_constructor_offspring_cell_distance: 1.6,
            cell_function_constructor_offspring_token_energy: 60.0,
            cell_function_computer_max_instructions: 15,
            cell_function_computer_cell_memory_size: 8,
            radiation_prob: 0.03,
            radiation_energy: 1.0,
        }
    }
}

/// Named symbols available to cell programs (addresses, constants).
///
/// The compiler that consumes these lives outside the engine; the table
/// itself travels with the simulation so snapshots stay self-describing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SymbolTable {
    entries: BTreeMap<String, String>,
}

impl SymbolTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a symbol.
    pub fn define(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(name.into(), value.into());
    }

    /// Look up a symbol by name.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    /// Merge `other` into this table; entries of `other` win.
    pub fn merge(&mut self, other: &SymbolTable) {
        for (name, value) in &other.entries {
            self.entries.insert(name.clone(), value.clone());
        }
    }

    /// Iterate over all symbols in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_table_merge_prefers_incoming() {
        let mut base = SymbolTable::new();
        base.define("energy", "[1]");
        base.define("branch", "[0]");

        let mut patch = SymbolTable::new();
        patch.define("energy", "[2]");
        patch.define("angle", "[3]");

        base.merge(&patch);
        assert_eq!(base.resolve("energy"), Some("[2]"));
        assert_eq!(base.resolve("branch"), Some("[0]"));
        assert_eq!(base.resolve("angle"), Some("[3]"));
        assert_eq!(base.len(), 3);
    }

    #[test]
    fn default_parameters_are_consistent() {
        let params = SimulationParameters::default();
        assert!(params.cell_min_distance < params.cell_max_distance);
        assert!(params.token_min_energy < params.cell_min_energy);
        assert!(params.token_memory_size >= token::constr::DATA);
    }
}
