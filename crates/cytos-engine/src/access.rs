//! The access port: the only legal surface for external reads and writes
//! of simulation state.
//!
//! Both operations share the engine mutex with the tick driver, so a call
//! issued mid-tick blocks until the tick completes and is served at the
//! barrier. A description read back with no tick in between splices in as
//! an identity operation.

use crate::engine::SimulationEngine;
use crate::error::EngineError;
use cytos_core::{DataDescription, IntRect};
use std::sync::{Arc, Mutex, PoisonError};

/// External read/write handle onto a running simulation.
#[derive(Clone)]
pub struct SimulationAccess {
    engine: Arc<Mutex<SimulationEngine>>,
}

impl SimulationAccess {
    pub(crate) fn new(engine: Arc<Mutex<SimulationEngine>>) -> Self {
        Self { engine }
    }

    /// Consistent copy of every cluster touching `rect` and every particle
    /// inside it.
    #[must_use]
    pub fn require_data(&self, rect: IntRect) -> DataDescription {
        let engine = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
        engine.require_data(rect)
    }

    /// Splice a description into the engine, replacing entities whose ids
    /// are resubmitted.
    pub fn update_data(&self, data: &DataDescription) -> Result<(), EngineError> {
        let mut engine = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
        engine.update_data(data)
    }

    /// Total stored plus kinetic energy, for conservation checks.
    #[must_use]
    pub fn total_energy(&self) -> f64 {
        let engine = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
        engine.total_energy()
    }
}
