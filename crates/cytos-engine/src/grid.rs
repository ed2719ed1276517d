//! The fixed 2D lattice of simulation units.
//!
//! Units are stored row-major; neighbor lookup wraps at the grid edges so
//! the lattice tiles the torus. Each unit gets a compartment covering an
//! equal slice of the universe, a private random ring filled from the
//! master generator, and an id allocator tagged with its 1-based shard
//! number (0 is reserved for the controller).

use crate::error::EngineError;
use cytos_core::{
    Compartment, IdAllocator, IntRect, IntVector2, NeighborRef, Neighborhood, RandomRing,
    RelativeLocation, SimulationParameters, SpaceMetric, SymbolTable, Unit, Vector2,
};
use rand::rngs::SmallRng;
use std::sync::{Arc, PoisonError, RwLock};

/// Row-major lattice of shards plus their precomputed neighborhoods.
pub struct UnitGrid {
    dims: IntVector2,
    compartment_size: IntVector2,
    units: Vec<Arc<RwLock<Unit>>>,
    neighborhoods: Vec<Neighborhood>,
}

impl UnitGrid {
    /// Build the lattice: one unit per grid position, neighbor wiring
    /// included.
    pub fn new(
        universe_size: IntVector2,
        grid_size: IntVector2,
        params: &SimulationParameters,
        symbols: &SymbolTable,
        master: &mut SmallRng,
    ) -> Result<Self, EngineError> {
        let metric = SpaceMetric::new(universe_size);
        let compartment_size = IntVector2::new(
            universe_size.x / grid_size.x,
            universe_size.y / grid_size.y,
        );
        let count = (grid_size.x * grid_size.y) as usize;

        let mut units = Vec::with_capacity(count);
        for y in 0..grid_size.y {
            for x in 0..grid_size.x {
                let index = (y * grid_size.x + x) as usize;
                let rect = IntRect::new(
                    IntVector2::new(x * compartment_size.x, y * compartment_size.y),
                    IntVector2::new(
                        (x + 1) * compartment_size.x,
                        (y + 1) * compartment_size.y,
                    ),
                );
                let neighbors = std::array::from_fn(|slot| {
                    let delta = RelativeLocation::ALL[slot].delta();
                    let nx = (x + delta.x).rem_euclid(grid_size.x);
                    let ny = (y + delta.y).rem_euclid(grid_size.y);
                    (ny * grid_size.x + nx) as usize
                });
                let shard = (index + 1) as u16;
                let unit = Unit::new(
                    index,
                    shard,
                    Compartment::new(rect, neighbors),
                    metric,
                    params.clone(),
                    symbols.clone(),
                    RandomRing::from_master(master),
                    IdAllocator::new(shard),
                );
                units.push(Arc::new(RwLock::new(unit)));
            }
        }

        let mut neighborhoods = Vec::with_capacity(count);
        for (index, unit) in units.iter().enumerate() {
            let compartment = unit
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .compartment()
                .clone();
            let mut refs: Vec<NeighborRef> = Vec::with_capacity(8);
            for neighbor_index in compartment.neighbors {
                if neighbor_index == index
                    || refs.iter().any(|r| r.index == neighbor_index)
                {
                    continue;
                }
                let rect = units[neighbor_index]
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .compartment()
                    .rect;
                refs.push(NeighborRef {
                    index: neighbor_index,
                    rect,
                    unit: Arc::clone(&units[neighbor_index]),
                });
            }
            neighborhoods.push(Neighborhood { neighbors: refs });
        }

        Ok(Self {
            dims: grid_size,
            compartment_size,
            units,
            neighborhoods,
        })
    }

    #[must_use]
    pub const fn dims(&self) -> IntVector2 {
        self.dims
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    #[must_use]
    pub fn unit(&self, index: usize) -> &Arc<RwLock<Unit>> {
        &self.units[index]
    }

    #[must_use]
    pub fn units(&self) -> &[Arc<RwLock<Unit>>] {
        &self.units
    }

    #[must_use]
    pub fn neighborhood(&self, index: usize) -> &Neighborhood {
        &self.neighborhoods[index]
    }

    /// Indices of the distinct units adjacent to `index` (self excluded).
    #[must_use]
    pub fn conflict_set(&self, index: usize) -> Vec<usize> {
        self.neighborhoods[index]
            .neighbors
            .iter()
            .map(|n| n.index)
            .collect()
    }

    /// The unit whose compartment owns a (normalized) position.
    #[must_use]
    pub fn owner_of(&self, pos: Vector2) -> usize {
        let x = ((pos.x as i32) / self.compartment_size.x).clamp(0, self.dims.x - 1);
        let y = ((pos.y as i32) / self.compartment_size.y).clamp(0, self.dims.y - 1);
        (y * self.dims.x + x) as usize
    }

    /// Run `f` with exclusive access to one unit.
    pub fn with_unit_mut<R>(&self, index: usize, f: impl FnOnce(&mut Unit) -> R) -> R {
        let mut guard = self.units[index]
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Run `f` with shared access to one unit.
    pub fn with_unit<R>(&self, index: usize, f: impl FnOnce(&Unit) -> R) -> R {
        let guard = self.units[index]
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }
}
