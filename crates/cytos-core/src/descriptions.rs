//! Plain-data snapshot types exchanged through the access port.
//!
//! Descriptions are detached copies: ids plus scalar state, with cell
//! connections expressed as entity-id lists. The engine converts between
//! descriptions and its live arena entities at the tick barrier.

use crate::token::Token;
use crate::vector::Vector2;
use serde::{Deserialize, Serialize};

/// Discriminant of a cell's programmable function.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CellFunctionKind {
    #[default]
    Computer,
    Constructor,
    Scanner,
    Weapon,
    Sensor,
    Communicator,
}

impl CellFunctionKind {
    #[must_use]
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            1 => Self::Constructor,
            2 => Self::Scanner,
            3 => Self::Weapon,
            4 => Self::Sensor,
            5 => Self::Communicator,
            _ => Self::Computer,
        }
    }

    #[must_use]
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Computer => 0,
            Self::Constructor => 1,
            Self::Scanner => 2,
            Self::Weapon => 3,
            Self::Sensor => 4,
            Self::Communicator => 5,
        }
    }
}

/// Snapshot of a cell function: discriminant plus its payloads.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CellFunctionDescription {
    pub kind: CellFunctionKind,
    pub static_data: Vec<u8>,
    pub mutable_data: Vec<u8>,
}

impl CellFunctionDescription {
    #[must_use]
    pub fn with_kind(kind: CellFunctionKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }
}

/// Snapshot of one cell, positioned absolutely.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CellDescription {
    pub id: u64,
    pub pos: Vector2,
    pub energy: f64,
    pub max_connections: usize,
    /// Entity ids of connected cells within the same cluster.
    pub connections: Vec<u64>,
    pub branch_number: u8,
    pub token_blocked: bool,
    pub function: CellFunctionDescription,
    pub tokens: Vec<Token>,
}

impl CellDescription {
    /// Minimal cell snapshot; remaining fields start at their defaults.
    #[must_use]
    pub fn new(id: u64, pos: Vector2, energy: f64) -> Self {
        Self {
            id,
            pos,
            energy,
            max_connections: 0,
            connections: Vec::new(),
            branch_number: 0,
            token_blocked: false,
            function: CellFunctionDescription::default(),
            tokens: Vec::new(),
        }
    }
}

/// Snapshot of one cluster with its member cells.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClusterDescription {
    pub id: u64,
    pub pos: Vector2,
    pub vel: Vector2,
    pub angle: f64,
    pub angular_vel: f64,
    pub cells: Vec<CellDescription>,
}

impl ClusterDescription {
    /// Plain mean of the member cell positions.
    ///
    /// Callers near the seam keep un-normalized coordinates while building
    /// fixtures; the engine normalizes on splice-in.
    #[must_use]
    pub fn center_from_cells(&self) -> Vector2 {
        if self.cells.is_empty() {
            return self.pos;
        }
        let mut sum = Vector2::ZERO;
        for cell in &self.cells {
            sum += cell.pos;
        }
        sum / self.cells.len() as f64
    }
}

/// Snapshot of one energy particle.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ParticleDescription {
    pub id: u64,
    pub pos: Vector2,
    pub vel: Vector2,
    pub energy: f64,
}

/// A consistent copy of a universe region: clusters plus particles.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DataDescription {
    pub clusters: Vec<ClusterDescription>,
    pub particles: Vec<ParticleDescription>,
}

impl DataDescription {
    pub fn add_cluster(&mut self, cluster: ClusterDescription) {
        self.clusters.push(cluster);
    }

    pub fn add_particle(&mut self, particle: ParticleDescription) {
        self.particles.push(particle);
    }

    /// Look up a cell snapshot anywhere in the description.
    #[must_use]
    pub fn cell(&self, cell_id: u64) -> Option<&CellDescription> {
        self.clusters
            .iter()
            .flat_map(|cluster| cluster.cells.iter())
            .find(|cell| cell.id == cell_id)
    }

    /// Look up the cluster containing a given cell.
    #[must_use]
    pub fn cluster_of_cell(&self, cell_id: u64) -> Option<&ClusterDescription> {
        self.clusters
            .iter()
            .find(|cluster| cluster.cells.iter().any(|cell| cell.id == cell_id))
    }

    #[must_use]
    pub fn cluster(&self, cluster_id: u64) -> Option<&ClusterDescription> {
        self.clusters.iter().find(|cluster| cluster.id == cluster_id)
    }

    /// Stored (non-kinetic) energy: cells, their tokens, and particles.
    #[must_use]
    pub fn stored_energy(&self) -> f64 {
        let cluster_energy: f64 = self
            .clusters
            .iter()
            .flat_map(|cluster| cluster.cells.iter())
            .map(|cell| cell.energy + cell.tokens.iter().map(|t| t.energy).sum::<f64>())
            .sum();
        let particle_energy: f64 = self.particles.iter().map(|p| p.energy).sum();
        cluster_energy + particle_energy
    }
}
