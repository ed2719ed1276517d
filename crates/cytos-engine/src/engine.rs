//! The assembled universe: grid, scheduler, context, and the tick driver.

use crate::context::SimulationContext;
use crate::error::EngineError;
use crate::grid::UnitGrid;
use crate::scheduler::UnitThreadController;
use cytos_core::token::constr;
use cytos_core::{
    Cluster, DataDescription, IntRect, IntVector2, Particle, SimulationParameters, SymbolTable,
};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};

/// Static configuration of one simulation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Universe extent in world units.
    pub universe_size: IntVector2,
    /// Number of units along each axis; must divide the universe size.
    pub grid_size: IntVector2,
    /// Upper bound on concurrently stepping units.
    pub max_running_threads: usize,
    /// Master seed; `None` draws one from entropy.
    pub rng_seed: Option<u64>,
    pub parameters: SimulationParameters,
    pub symbols: SymbolTable,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            universe_size: IntVector2::new(600, 300),
            grid_size: IntVector2::new(6, 3),
            max_running_threads: 4,
            rng_seed: None,
            parameters: SimulationParameters::default(),
            symbols: SymbolTable::new(),
        }
    }
}

impl EngineConfig {
    fn validate(&self) -> Result<(), EngineError> {
        if self.universe_size.x <= 0 || self.universe_size.y <= 0 {
            return Err(EngineError::InvalidConfig("universe size must be positive"));
        }
        if self.grid_size.x <= 0 || self.grid_size.y <= 0 {
            return Err(EngineError::InvalidConfig("grid size must be positive"));
        }
        if self.universe_size.x % self.grid_size.x != 0
            || self.universe_size.y % self.grid_size.y != 0
        {
            return Err(EngineError::InvalidConfig(
                "universe size must be divisible by grid size",
            ));
        }
        let shard_count = i64::from(self.grid_size.x) * i64::from(self.grid_size.y);
        if shard_count >= i64::from(u16::MAX) {
            return Err(EngineError::InvalidConfig("too many shards for 16-bit ids"));
        }
        if self.max_running_threads == 0 {
            return Err(EngineError::InvalidConfig(
                "max_running_threads must be at least 1",
            ));
        }
        let params = &self.parameters;
        if params.cell_min_distance <= 0.0 || params.cell_min_distance >= params.cell_max_distance {
            return Err(EngineError::InvalidConfig(
                "cell_min_distance must be positive and below cell_max_distance",
            ));
        }
        if params.cell_max_bonds == 0 {
            return Err(EngineError::InvalidConfig("cell_max_bonds must be positive"));
        }
        if params.cell_min_energy <= 0.0 || params.token_min_energy <= 0.0 {
            return Err(EngineError::InvalidConfig("energy thresholds must be positive"));
        }
        if params.token_memory_size < constr::DATA + 2 {
            return Err(EngineError::InvalidConfig(
                "token_memory_size too small for the constructor contract",
            ));
        }
        Ok(())
    }
}

/// Events reported after a successful tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
}

/// The simulation core behind the controller and the access port.
pub struct SimulationEngine {
    context: SimulationContext,
    grid: UnitGrid,
    scheduler: UnitThreadController,
    tick: u64,
    failure: Option<String>,
}

impl SimulationEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let seed = config.rng_seed.unwrap_or_else(rand::random);
        let mut master = SmallRng::seed_from_u64(seed);
        let grid = UnitGrid::new(
            config.universe_size,
            config.grid_size,
            &config.parameters,
            &config.symbols,
            &mut master,
        )?;
        let scheduler = UnitThreadController::new(config.max_running_threads, &grid)?;
        let context = SimulationContext::new(
            config.universe_size,
            config.grid_size,
            config.parameters,
            config.symbols,
        );
        info!(
            universe = ?config.universe_size,
            grid = ?config.grid_size,
            threads = config.max_running_threads,
            seed,
            "engine built"
        );
        Ok(Self {
            context,
            grid,
            scheduler,
            tick: 0,
            failure: None,
        })
    }

    #[must_use]
    pub const fn tick(&self) -> u64 {
        self.tick
    }

    #[must_use]
    pub const fn context(&self) -> &SimulationContext {
        &self.context
    }

    #[must_use]
    pub fn context_mut(&mut self) -> &mut SimulationContext {
        &mut self.context
    }

    #[must_use]
    pub const fn grid(&self) -> &UnitGrid {
        &self.grid
    }

    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.failure.is_none()
    }

    /// Advance the universe by one tick.
    pub fn calculate_tick(&mut self) -> Result<TickReport, EngineError> {
        if let Some(reason) = &self.failure {
            return Err(EngineError::Unhealthy {
                reason: reason.clone(),
            });
        }
        match self.scheduler.calculate_timestep(&self.grid) {
            Ok(()) => {
                self.tick += 1;
                Ok(TickReport { tick: self.tick })
            }
            Err(error) => {
                warn!(%error, tick = self.tick, "tick aborted; engine latched unhealthy");
                self.failure = Some(error.to_string());
                Err(error)
            }
        }
    }

    /// Replace the shared parameters, pushing copies into every shard.
    pub fn set_parameters(&mut self, parameters: SimulationParameters) {
        self.context.set_parameters(parameters.clone());
        for index in 0..self.grid.len() {
            self.grid
                .with_unit_mut(index, |unit| unit.set_parameters(parameters.clone()));
        }
    }

    /// Replace the shared symbol table, pushing copies into every shard.
    pub fn set_symbol_table(&mut self, symbols: SymbolTable) {
        self.context.set_symbol_table(symbols.clone());
        for index in 0..self.grid.len() {
            self.grid
                .with_unit_mut(index, |unit| unit.set_symbol_table(symbols.clone()));
        }
    }

    /// Copy every cluster touching `rect` and every particle inside it.
    #[must_use]
    pub fn require_data(&self, rect: IntRect) -> DataDescription {
        let mut data = DataDescription::default();
        for index in 0..self.grid.len() {
            let (clusters, particles) =
                self.grid.with_unit(index, |unit| unit.extract_region(rect));
            data.clusters.extend(clusters);
            data.particles.extend(particles);
        }
        data
    }

    /// Splice a description into the universe.
    ///
    /// Entities whose ids already live in the engine are replaced; zero ids
    /// are minted fresh from the controller's allocator. Each entity lands
    /// in the unit owning its center.
    pub fn update_data(&mut self, data: &DataDescription) -> Result<(), EngineError> {
        let metric = *self.context.metric();
        let mut incoming = data.clone();
        for cluster in &mut incoming.clusters {
            if cluster.id == 0 {
                cluster.id = self.context.next_id()?;
            }
            for cell in &mut cluster.cells {
                if cell.id == 0 {
                    cell.id = self.context.next_id()?;
                }
            }
        }
        for particle in &mut incoming.particles {
            if particle.id == 0 {
                particle.id = self.context.next_id()?;
            }
        }

        for cluster in &incoming.clusters {
            for index in 0..self.grid.len() {
                self.grid
                    .with_unit_mut(index, |unit| unit.remove_entity_by_id(cluster.id));
            }
            let mut live = Cluster::from_description(cluster, self.context.parameters(), &metric)?;
            live.recenter(&metric);
            let owner = self.grid.owner_of(live.pos);
            self.grid.with_unit_mut(owner, |unit| {
                unit.insert_cluster(live);
            });
        }
        for particle in &incoming.particles {
            for index in 0..self.grid.len() {
                self.grid
                    .with_unit_mut(index, |unit| unit.remove_entity_by_id(particle.id));
            }
            let live = Particle::from_description(particle, &metric);
            let owner = self.grid.owner_of(live.pos);
            self.grid.with_unit_mut(owner, |unit| {
                unit.insert_particle(live);
            });
        }
        Ok(())
    }

    /// Stored plus kinetic energy of the whole universe.
    #[must_use]
    pub fn total_energy(&self) -> f64 {
        (0..self.grid.len())
            .map(|index| self.grid.with_unit(index, cytos_core::Unit::total_energy))
            .sum()
    }

    /// Full invariant sweep: id uniqueness, connection symmetry, toroidal
    /// closure, energy positivity. Intended for tests and debugging.
    pub fn validate(&self) -> Result<(), EngineError> {
        let metric = self.context.metric();
        let size = metric.size();
        let mut seen: HashSet<u64> = HashSet::new();
        for index in 0..self.grid.len() {
            let result = self.grid.with_unit(index, |unit| {
                for cluster in unit.clusters().values() {
                    if !seen.insert(cluster.id) {
                        return Err(EngineError::InvalidConfig("duplicate cluster id"));
                    }
                    let ids: HashSet<u64> = cluster.cells.values().map(|cell| cell.id).collect();
                    if ids.len() != cluster.cells.len() {
                        return Err(EngineError::InvalidConfig("duplicate cell id"));
                    }
                    for cell in cluster.cells.values() {
                        if !seen.insert(cell.id) {
                            return Err(EngineError::InvalidConfig("duplicate cell id"));
                        }
                        if cell.energy < 0.0 {
                            return Err(EngineError::InvalidConfig("negative cell energy"));
                        }
                        if cell.connections.len() > cell.max_connections {
                            return Err(EngineError::InvalidConfig(
                                "cell exceeds its max connections",
                            ));
                        }
                        let pos = cluster.cell_position(cell, metric);
                        if pos.x < 0.0
                            || pos.x >= f64::from(size.x)
                            || pos.y < 0.0
                            || pos.y >= f64::from(size.y)
                        {
                            return Err(EngineError::InvalidConfig("cell outside the torus"));
                        }
                    }
                    for (key, cell) in &cluster.cells {
                        for peer in &cell.connections {
                            let Some(peer_cell) = cluster.cells.get(*peer) else {
                                return Err(EngineError::InvalidConfig("orphan connection"));
                            };
                            if !peer_cell.connections.contains(&key) {
                                return Err(EngineError::InvalidConfig(
                                    "asymmetric connection",
                                ));
                            }
                        }
                    }
                }
                for particle in unit.particles().values() {
                    if !seen.insert(particle.id) {
                        return Err(EngineError::InvalidConfig("duplicate particle id"));
                    }
                    if particle.energy < 0.0 {
                        return Err(EngineError::InvalidConfig("negative particle energy"));
                    }
                }
                Ok(())
            });
            result?;
        }
        Ok(())
    }
}
