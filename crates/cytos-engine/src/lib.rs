//! The Cytos execution engine: the unit grid, the dependency-constrained
//! thread scheduler, the timestep controller, and the access port through
//! which external code reads and writes simulation state at tick barriers.

mod access;
mod context;
mod controller;
mod engine;
mod error;
mod grid;
mod scheduler;

pub use access::SimulationAccess;
pub use context::SimulationContext;
pub use controller::{EngineGuard, SimulationController};
pub use engine::{EngineConfig, SimulationEngine, TickReport};
pub use error::EngineError;
pub use grid::UnitGrid;
pub use scheduler::UnitThreadController;
