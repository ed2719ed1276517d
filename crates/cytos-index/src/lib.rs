//! Spatial occupancy maps backing collision and obstacle queries per shard.
//!
//! Each simulation shard owns one [`CellMap`] and one [`ParticleMap`]. Both
//! hash an integer grid position (the floor of a world position) to the
//! occupants registered there during the current timestep. Entries are plain
//! value records carrying entity ids and the owning shard index, so a
//! neighboring shard can answer queries without handing out references into
//! its own arenas.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::HashMap;
use thiserror::Error;

/// Upper bound on occupants registered at a single grid location.
///
/// Exceeding it indicates a runaway simulation (or a corrupted insert loop)
/// and is treated as fatal by the caller.
pub const MAX_OCCUPANTS_PER_LOCATION: usize = 256;

/// Errors emitted by the occupancy maps.
#[derive(Debug, Error)]
pub enum IndexError {
    /// A single grid location accumulated more occupants than the map allows.
    #[error("occupancy overflow at grid location ({0}, {1})")]
    LocationOverflow(i32, i32),
}

/// Value record for one cell registered in a [`CellMap`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellEntry {
    /// Absolute (normalized) world position of the cell.
    pub pos: (f64, f64),
    /// Globally unique id of the cell.
    pub cell_id: u64,
    /// Globally unique id of the cluster owning the cell.
    pub cluster_id: u64,
    /// Linear index of the shard that owns the cluster.
    pub owner: usize,
    /// Discriminant byte of the cell's function.
    pub function: u8,
}

/// Value record for one particle registered in a [`ParticleMap`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParticleEntry {
    /// Absolute (normalized) world position of the particle.
    pub pos: (f64, f64),
    /// Globally unique id of the particle.
    pub particle_id: u64,
    /// Linear index of the shard that owns the particle.
    pub owner: usize,
}

type Bucket<T> = SmallVec<[T; 2]>;

/// Hash from integer grid location to the cells occupying it.
///
/// Rebuilt at the start of every shard timestep and patched incrementally
/// when a step creates or destroys cells mid-tick.
#[derive(Debug, Clone, Default)]
pub struct CellMap {
    buckets: HashMap<(i32, i32), Bucket<CellEntry>>,
}

impl CellMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every registered occupant, keeping allocated capacity.
    pub fn clear(&mut self) {
        self.buckets.clear();
    }

    /// Register a cell at `grid`.
    pub fn insert(&mut self, grid: (i32, i32), entry: CellEntry) -> Result<(), IndexError> {
        let bucket = self.buckets.entry(grid).or_default();
        if bucket.len() >= MAX_OCCUPANTS_PER_LOCATION {
            return Err(IndexError::LocationOverflow(grid.0, grid.1));
        }
        bucket.push(entry);
        Ok(())
    }

    /// Occupants registered at `grid`, in insertion order.
    #[must_use]
    pub fn at(&self, grid: (i32, i32)) -> &[CellEntry] {
        self.buckets.get(&grid).map_or(&[], |bucket| bucket.as_slice())
    }

    /// Remove the registration of `cell_id` at `grid`, if present.
    pub fn remove(&mut self, grid: (i32, i32), cell_id: u64) {
        if let Some(bucket) = self.buckets.get_mut(&grid) {
            bucket.retain(|entry| entry.cell_id != cell_id);
            if bucket.is_empty() {
                self.buckets.remove(&grid);
            }
        }
    }

    /// Total number of registered occupants.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.values().map(SmallVec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Hash from integer grid location to the particles occupying it.
#[derive(Debug, Clone, Default)]
pub struct ParticleMap {
    buckets: HashMap<(i32, i32), Bucket<ParticleEntry>>,
}

impl ParticleMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }

    /// Register a particle at `grid`.
    pub fn insert(&mut self, grid: (i32, i32), entry: ParticleEntry) -> Result<(), IndexError> {
        let bucket = self.buckets.entry(grid).or_default();
        if bucket.len() >= MAX_OCCUPANTS_PER_LOCATION {
            return Err(IndexError::LocationOverflow(grid.0, grid.1));
        }
        bucket.push(entry);
        Ok(())
    }

    /// Occupants registered at `grid`, in insertion order.
    #[must_use]
    pub fn at(&self, grid: (i32, i32)) -> &[ParticleEntry] {
        self.buckets.get(&grid).map_or(&[], |bucket| bucket.as_slice())
    }

    /// Remove the registration of `particle_id` at `grid`, if present.
    pub fn remove(&mut self, grid: (i32, i32), particle_id: u64) {
        if let Some(bucket) = self.buckets.get_mut(&grid) {
            bucket.retain(|entry| entry.particle_id != particle_id);
            if bucket.is_empty() {
                self.buckets.remove(&grid);
            }
        }
    }

    /// Number of grid locations holding more than one particle.
    #[must_use]
    pub fn crowded_locations(&self) -> usize {
        self.buckets.values().filter(|bucket| bucket.len() > 1).count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.values().map(SmallVec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(id: u64, cluster: u64, pos: (f64, f64)) -> CellEntry {
        CellEntry {
            pos,
            cell_id: id,
            cluster_id: cluster,
            owner: 0,
            function: 0,
        }
    }

    #[test]
    fn insert_and_query_preserves_order() {
        let mut map = CellMap::new();
        map.insert((3, 4), cell(1, 10, (3.2, 4.8))).expect("insert");
        map.insert((3, 4), cell(2, 11, (3.7, 4.1))).expect("insert");
        let hits = map.at((3, 4));
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].cell_id, 1);
        assert_eq!(hits[1].cell_id, 2);
        assert!(map.at((0, 0)).is_empty());
    }

    #[test]
    fn remove_drops_only_the_named_occupant() {
        let mut map = CellMap::new();
        map.insert((0, 0), cell(1, 10, (0.5, 0.5))).expect("insert");
        map.insert((0, 0), cell(2, 10, (0.6, 0.5))).expect("insert");
        map.remove((0, 0), 1);
        let hits = map.at((0, 0));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].cell_id, 2);
        map.remove((0, 0), 2);
        assert!(map.is_empty());
    }

    #[test]
    fn overflow_is_reported() {
        let mut map = ParticleMap::new();
        for id in 0..MAX_OCCUPANTS_PER_LOCATION as u64 {
            map.insert(
                (1, 1),
                ParticleEntry {
                    pos: (1.5, 1.5),
                    particle_id: id,
                    owner: 0,
                },
            )
            .expect("insert below limit");
        }
        let overflow = map.insert(
            (1, 1),
            ParticleEntry {
                pos: (1.5, 1.5),
                particle_id: 999,
                owner: 0,
            },
        );
        assert!(overflow.is_err());
    }

    #[test]
    fn crowded_locations_counts_multi_occupancy() {
        let mut map = ParticleMap::new();
        let entry = |id| ParticleEntry {
            pos: (2.5, 2.5),
            particle_id: id,
            owner: 0,
        };
        map.insert((2, 2), entry(1)).expect("insert");
        assert_eq!(map.crowded_locations(), 0);
        map.insert((2, 2), entry(2)).expect("insert");
        map.insert((5, 5), entry(3)).expect("insert");
        assert_eq!(map.crowded_locations(), 1);
        assert_eq!(map.len(), 3);
    }
}
