//! Live entities owned by a shard: clusters of cells, and particles.
//!
//! Clusters and particles live in per-shard slotmap arenas; cells live in a
//! per-cluster slotmap so a cluster moves between shards wholesale without
//! invalidating its internal connection keys. All cross-shard references
//! use entity ids, never keys.

use crate::descriptions::{CellDescription, ClusterDescription, ParticleDescription};
use crate::error::CoreError;
use crate::functions::CellFunction;
use crate::physics::{self, Velocities};
use crate::space::SpaceMetric;
use crate::token::Token;
use crate::vector::Vector2;
use crate::SimulationParameters;
use slotmap::{SlotMap, new_key_type};
use std::collections::{HashMap, VecDeque};

new_key_type! {
    /// Stable handle of a cluster within its owning shard's arena.
    pub struct ClusterKey;

    /// Stable handle of a cell within its cluster's arena.
    pub struct CellKey;

    /// Stable handle of a particle within its owning shard's arena.
    pub struct ParticleKey;
}

/// A node of a cluster: energy, a function, tokens, and connections.
#[derive(Debug, Clone)]
pub struct Cell {
    pub id: u64,
    /// Offset from the cluster center in the cluster's un-rotated frame.
    pub rel_pos: Vector2,
    pub energy: f64,
    pub max_connections: usize,
    pub connections: Vec<CellKey>,
    pub branch_number: u8,
    pub token_blocked: bool,
    pub function: CellFunction,
    pub tokens: Vec<Token>,
}

impl Cell {
    /// Energy stored on the cell plus its resident tokens.
    #[must_use]
    pub fn stored_energy(&self) -> f64 {
        self.energy + self.tokens.iter().map(|token| token.energy).sum::<f64>()
    }
}

/// A free energy particle.
#[derive(Debug, Clone)]
pub struct Particle {
    pub id: u64,
    pub pos: Vector2,
    pub vel: Vector2,
    pub energy: f64,
}

impl Particle {
    #[must_use]
    pub fn to_description(&self) -> ParticleDescription {
        ParticleDescription {
            id: self.id,
            pos: self.pos,
            vel: self.vel,
            energy: self.energy,
        }
    }

    #[must_use]
    pub fn from_description(desc: &ParticleDescription, metric: &SpaceMetric) -> Self {
        Self {
            id: desc.id,
            pos: metric.normalize(desc.pos),
            vel: desc.vel,
            energy: desc.energy,
        }
    }
}

/// A rigid body of connected cells sharing one pose and velocity.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub id: u64,
    /// Center of mass; kept equal to the mean of member cell positions.
    pub pos: Vector2,
    pub vel: Vector2,
    /// Orientation in degrees.
    pub angle: f64,
    /// Spin in degrees per timestep.
    pub angular_vel: f64,
    /// Set once the cluster has constructed at least one cell.
    pub construction_started: bool,
    /// Connectivity may have changed; decomposition re-checks components.
    pub dirty_connectivity: bool,
    pub cells: SlotMap<CellKey, Cell>,
}

impl Cluster {
    /// Empty cluster at a pose.
    #[must_use]
    pub fn new(id: u64, pos: Vector2) -> Self {
        Self {
            id,
            pos,
            vel: Vector2::ZERO,
            angle: 0.0,
            angular_vel: 0.0,
            construction_started: false,
            dirty_connectivity: false,
            cells: SlotMap::with_key(),
        }
    }

    /// Unit mass per cell.
    #[must_use]
    pub fn mass(&self) -> f64 {
        self.cells.len() as f64
    }

    #[must_use]
    pub fn angular_mass(&self) -> f64 {
        physics::angular_mass(self.cells.values().map(|cell| cell.rel_pos))
    }

    #[must_use]
    pub fn velocities(&self) -> Velocities {
        Velocities {
            linear: self.vel,
            angular: self.angular_vel,
        }
    }

    #[must_use]
    pub fn kinetic_energy(&self) -> f64 {
        physics::kinetic_energy(self.mass(), self.vel, self.angular_mass(), self.angular_vel)
    }

    /// Energy stored in cells and their tokens (kinetic energy excluded).
    #[must_use]
    pub fn stored_energy(&self) -> f64 {
        self.cells.values().map(Cell::stored_energy).sum()
    }

    /// Absolute, normalized position of a member cell.
    #[must_use]
    pub fn cell_position(&self, cell: &Cell, metric: &SpaceMetric) -> Vector2 {
        metric.normalize(self.pos + cell.rel_pos.rotated(self.angle))
    }

    /// Rotated offset of a member cell from the cluster center.
    #[must_use]
    pub fn cell_offset(&self, cell: &Cell) -> Vector2 {
        cell.rel_pos.rotated(self.angle)
    }

    /// Symmetrically connect two member cells.
    pub fn connect(&mut self, a: CellKey, b: CellKey) {
        if a == b {
            return;
        }
        if let Some(cell) = self.cells.get_mut(a)
            && !cell.connections.contains(&b)
        {
            cell.connections.push(b);
        }
        if let Some(cell) = self.cells.get_mut(b)
            && !cell.connections.contains(&a)
        {
            cell.connections.push(a);
        }
    }

    /// Symmetrically disconnect two member cells.
    pub fn disconnect(&mut self, a: CellKey, b: CellKey) {
        if let Some(cell) = self.cells.get_mut(a) {
            cell.connections.retain(|key| *key != b);
        }
        if let Some(cell) = self.cells.get_mut(b) {
            cell.connections.retain(|key| *key != a);
        }
    }

    /// Remove a cell, dropping every connection pointing at it.
    pub fn remove_cell(&mut self, key: CellKey) -> Option<Cell> {
        let removed = self.cells.remove(key)?;
        for cell in self.cells.values_mut() {
            cell.connections.retain(|candidate| *candidate != key);
        }
        self.dirty_connectivity = true;
        Some(removed)
    }

    /// Move the center back onto the mean of member positions, keeping every
    /// cell's absolute position fixed.
    pub fn recenter(&mut self, metric: &SpaceMetric) {
        if self.cells.is_empty() {
            return;
        }
        let mut mean_offset = Vector2::ZERO;
        for cell in self.cells.values() {
            mean_offset += cell.rel_pos.rotated(self.angle);
        }
        mean_offset = mean_offset / self.cells.len() as f64;
        self.pos = metric.normalize(self.pos + mean_offset);
        for cell in self.cells.values_mut() {
            cell.rel_pos = (cell.rel_pos.rotated(self.angle) - mean_offset).rotated(-self.angle);
        }
    }

    /// Connected components of the connection graph, as key sets.
    #[must_use]
    pub fn components(&self) -> Vec<Vec<CellKey>> {
        let mut seen: HashMap<CellKey, bool> = self.cells.keys().map(|key| (key, false)).collect();
        let mut components = Vec::new();
        for start in self.cells.keys() {
            if seen[&start] {
                continue;
            }
            let mut component = Vec::new();
            let mut queue = VecDeque::from([start]);
            seen.insert(start, true);
            while let Some(key) = queue.pop_front() {
                component.push(key);
                if let Some(cell) = self.cells.get(key) {
                    for next in &cell.connections {
                        if let Some(visited) = seen.get_mut(next)
                            && !*visited
                        {
                            *visited = true;
                            queue.push_back(*next);
                        }
                    }
                }
            }
            components.push(component);
        }
        components
    }

    /// Detached snapshot with absolute cell positions and id connections.
    #[must_use]
    pub fn to_description(&self, metric: &SpaceMetric) -> ClusterDescription {
        let cells = self
            .cells
            .values()
            .map(|cell| CellDescription {
                id: cell.id,
                pos: self.cell_position(cell, metric),
                energy: cell.energy,
                max_connections: cell.max_connections,
                connections: cell
                    .connections
                    .iter()
                    .filter_map(|key| self.cells.get(*key).map(|peer| peer.id))
                    .collect(),
                branch_number: cell.branch_number,
                token_blocked: cell.token_blocked,
                function: cell.function.to_description(),
                tokens: cell.tokens.clone(),
            })
            .collect();
        ClusterDescription {
            id: self.id,
            pos: metric.normalize(self.pos),
            vel: self.vel,
            angle: self.angle,
            angular_vel: self.angular_vel,
            cells,
        }
    }

    /// Rebuild a live cluster from a snapshot.
    ///
    /// Connections must reference cells of the same description; anything
    /// else is an orphan connection, which is fatal.
    pub fn from_description(
        desc: &ClusterDescription,
        params: &SimulationParameters,
        metric: &SpaceMetric,
    ) -> Result<Self, CoreError> {
        let mut cluster = Self::new(desc.id, metric.normalize(desc.pos));
        cluster.vel = desc.vel;
        cluster.angle = desc.angle;
        cluster.angular_vel = desc.angular_vel;

        let mut keys_by_id: HashMap<u64, CellKey> = HashMap::with_capacity(desc.cells.len());
        for cell_desc in &desc.cells {
            let rel_pos = metric
                .displacement(cluster.pos, metric.normalize(cell_desc.pos))
                .rotated(-cluster.angle);
            let mut tokens = cell_desc.tokens.clone();
            for token in &mut tokens {
                token.memory.resize(params.token_memory_size, 0);
            }
            let key = cluster.cells.insert(Cell {
                id: cell_desc.id,
                rel_pos,
                energy: cell_desc.energy,
                max_connections: cell_desc.max_connections,
                connections: Vec::with_capacity(cell_desc.connections.len()),
                branch_number: cell_desc.branch_number,
                token_blocked: cell_desc.token_blocked,
                function: CellFunction::from_description(&cell_desc.function, params),
                tokens,
            });
            keys_by_id.insert(cell_desc.id, key);
        }

        for cell_desc in &desc.cells {
            let key = keys_by_id[&cell_desc.id];
            for peer_id in &cell_desc.connections {
                let peer = *keys_by_id
                    .get(peer_id)
                    .ok_or(CoreError::OrphanConnection { cell: cell_desc.id })?;
                cluster.connect(key, peer);
            }
        }
        Ok(cluster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::IntVector2;

    fn metric() -> SpaceMetric {
        SpaceMetric::new(IntVector2::new(1000, 1000))
    }

    fn bare_cell(id: u64, rel: Vector2) -> Cell {
        Cell {
            id,
            rel_pos: rel,
            energy: 100.0,
            max_connections: 4,
            connections: Vec::new(),
            branch_number: 0,
            token_blocked: false,
            function: CellFunction::Constructor,
            tokens: Vec::new(),
        }
    }

    #[test]
    fn connect_is_symmetric_and_idempotent() {
        let mut cluster = Cluster::new(1, Vector2::new(10.0, 10.0));
        let a = cluster.cells.insert(bare_cell(1, Vector2::new(-0.5, 0.0)));
        let b = cluster.cells.insert(bare_cell(2, Vector2::new(0.5, 0.0)));
        cluster.connect(a, b);
        cluster.connect(a, b);
        assert_eq!(cluster.cells[a].connections, vec![b]);
        assert_eq!(cluster.cells[b].connections, vec![a]);
        cluster.disconnect(b, a);
        assert!(cluster.cells[a].connections.is_empty());
        assert!(cluster.cells[b].connections.is_empty());
    }

    #[test]
    fn remove_cell_scrubs_incoming_connections() {
        let mut cluster = Cluster::new(1, Vector2::ZERO);
        let a = cluster.cells.insert(bare_cell(1, Vector2::ZERO));
        let b = cluster.cells.insert(bare_cell(2, Vector2::new(1.0, 0.0)));
        cluster.connect(a, b);
        cluster.remove_cell(b);
        assert!(cluster.cells[a].connections.is_empty());
        assert!(cluster.dirty_connectivity);
    }

    #[test]
    fn components_split_on_missing_link() {
        let mut cluster = Cluster::new(1, Vector2::ZERO);
        let keys: Vec<CellKey> = (0..5)
            .map(|i| cluster.cells.insert(bare_cell(i, Vector2::new(i as f64, 0.0))))
            .collect();
        cluster.connect(keys[0], keys[1]);
        cluster.connect(keys[3], keys[4]);
        let mut sizes: Vec<usize> = cluster.components().iter().map(Vec::len).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![1, 2, 2]);
    }

    #[test]
    fn recenter_keeps_absolute_positions() {
        let m = metric();
        let mut cluster = Cluster::new(1, Vector2::new(100.0, 100.0));
        cluster.angle = 30.0;
        let a = cluster.cells.insert(bare_cell(1, Vector2::new(0.0, 0.0)));
        let b = cluster.cells.insert(bare_cell(2, Vector2::new(3.0, 0.0)));
        let before_a = cluster.cell_position(&cluster.cells[a], &m);
        let before_b = cluster.cell_position(&cluster.cells[b], &m);

        cluster.recenter(&m);

        let after_a = cluster.cell_position(&cluster.cells[a], &m);
        let after_b = cluster.cell_position(&cluster.cells[b], &m);
        assert!(m.distance(before_a, after_a) < 1e-9);
        assert!(m.distance(before_b, after_b) < 1e-9);
        // Center now sits midway between the two cells.
        let mid = m.midpoint(after_a, after_b);
        assert!(m.distance(cluster.pos, mid) < 1e-9);
    }

    #[test]
    fn description_round_trip_preserves_geometry() {
        let m = metric();
        let params = SimulationParameters::default();
        let mut cluster = Cluster::new(9, Vector2::new(50.0, 60.0));
        cluster.angle = 45.0;
        cluster.angular_vel = 1.5;
        cluster.vel = Vector2::new(0.25, -0.5);
        let a = cluster.cells.insert(bare_cell(1, Vector2::new(-1.0, 0.0)));
        let b = cluster.cells.insert(bare_cell(2, Vector2::new(1.0, 0.0)));
        cluster.connect(a, b);

        let desc = cluster.to_description(&m);
        let rebuilt = Cluster::from_description(&desc, &params, &m).expect("rebuild");
        let desc_again = rebuilt.to_description(&m);

        assert_eq!(desc.id, desc_again.id);
        for (first, second) in desc.cells.iter().zip(desc_again.cells.iter()) {
            assert_eq!(first.id, second.id);
            assert!(m.distance(first.pos, second.pos) < 1e-9);
            assert_eq!(first.connections, second.connections);
        }
    }

    #[test]
    fn orphan_connection_is_fatal() {
        let m = metric();
        let params = SimulationParameters::default();
        let mut desc = ClusterDescription::default();
        desc.id = 3;
        let mut cell = CellDescription::new(1, Vector2::new(5.0, 5.0), 50.0);
        cell.connections.push(999);
        desc.cells.push(cell);
        assert!(Cluster::from_description(&desc, &params, &m).is_err());
    }
}
