//! The dependency bundle shared by the engine's subsystems.

use cytos_core::{
    CoreError, GLOBAL_SHARD, IdAllocator, IntVector2, SimulationParameters, SpaceMetric,
    SymbolTable,
};

/// Typed handles to everything a subsystem needs: the space metric, the
/// lattice dimensions, the shared parameter set and symbol table, and the
/// controller-side id allocator (shard number 0).
///
/// Built once at startup and handed down explicitly; there is no global
/// registry to consult.
#[derive(Debug, Clone)]
pub struct SimulationContext {
    metric: SpaceMetric,
    universe_size: IntVector2,
    grid_size: IntVector2,
    parameters: SimulationParameters,
    symbols: SymbolTable,
    ids: IdAllocator,
}

impl SimulationContext {
    #[must_use]
    pub fn new(
        universe_size: IntVector2,
        grid_size: IntVector2,
        parameters: SimulationParameters,
        symbols: SymbolTable,
    ) -> Self {
        Self {
            metric: SpaceMetric::new(universe_size),
            universe_size,
            grid_size,
            parameters,
            symbols,
            ids: IdAllocator::new(GLOBAL_SHARD),
        }
    }

    #[must_use]
    pub const fn metric(&self) -> &SpaceMetric {
        &self.metric
    }

    #[must_use]
    pub const fn universe_size(&self) -> IntVector2 {
        self.universe_size
    }

    #[must_use]
    pub const fn grid_size(&self) -> IntVector2 {
        self.grid_size
    }

    #[must_use]
    pub const fn parameters(&self) -> &SimulationParameters {
        &self.parameters
    }

    pub(crate) fn set_parameters(&mut self, parameters: SimulationParameters) {
        self.parameters = parameters;
    }

    #[must_use]
    pub const fn symbol_table(&self) -> &SymbolTable {
        &self.symbols
    }

    pub(crate) fn set_symbol_table(&mut self, symbols: SymbolTable) {
        self.symbols = symbols;
    }

    /// Allocate an id from the controller's (global) id range.
    pub fn next_id(&mut self) -> Result<u64, CoreError> {
        self.ids.next_id()
    }
}
