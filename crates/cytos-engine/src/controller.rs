//! The timestep driver: run/pause, step-N, and the barrier lock.
//!
//! The engine lives behind one mutex. A background driver thread ticks it
//! while running; any external reader or writer (the access port, the
//! barrier lock, parameter updates) waits on the same mutex and is served
//! between ticks. Pausing takes effect at the next tick boundary.

use crate::access::SimulationAccess;
use crate::context::SimulationContext;
use crate::engine::{EngineConfig, SimulationEngine};
use crate::error::EngineError;
use crossbeam_channel::{Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use tracing::info;

/// RAII barrier guard; the engine cannot tick while it is held.
pub type EngineGuard<'a> = MutexGuard<'a, SimulationEngine>;

enum DriverCommand {
    Stop,
}

struct Driver {
    commands: Sender<DriverCommand>,
    thread: JoinHandle<()>,
}

/// Owns the engine and drives its timesteps.
pub struct SimulationController {
    engine: Arc<Mutex<SimulationEngine>>,
    driver: Option<Driver>,
}

impl SimulationController {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let engine = SimulationEngine::new(config)?;
        Ok(Self {
            engine: Arc::new(Mutex::new(engine)),
            driver: None,
        })
    }

    /// Whether the background driver is ticking.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.driver.is_some()
    }

    /// Start or stop continuous ticking.
    ///
    /// Stopping joins the driver thread; it returns after the in-flight
    /// tick (if any) completes.
    pub fn set_running(&mut self, running: bool) {
        if running {
            if self.driver.is_some() {
                return;
            }
            let engine = Arc::clone(&self.engine);
            let (commands, inbox) = crossbeam_channel::unbounded();
            let thread = std::thread::spawn(move || {
                info!("simulation driver started");
                loop {
                    match inbox.try_recv() {
                        Ok(DriverCommand::Stop) | Err(TryRecvError::Disconnected) => break,
                        Err(TryRecvError::Empty) => {}
                    }
                    let failed = {
                        let mut engine =
                            engine.lock().unwrap_or_else(PoisonError::into_inner);
                        engine.calculate_tick().is_err()
                    };
                    if failed {
                        break;
                    }
                    // Release the barrier briefly so queued access-port
                    // requests are served between ticks.
                    std::thread::yield_now();
                }
                info!("simulation driver stopped");
            });
            self.driver = Some(Driver { commands, thread });
        } else if let Some(driver) = self.driver.take() {
            let _ = driver.commands.send(DriverCommand::Stop);
            let _ = driver.thread.join();
        }
    }

    /// Advance exactly `count` ticks synchronously; requires a paused
    /// engine. Returns the tick counter afterwards.
    pub fn step_n(&mut self, count: u64) -> Result<u64, EngineError> {
        if self.driver.is_some() {
            return Err(EngineError::InvalidConfig(
                "pause the simulation before stepping manually",
            ));
        }
        let mut engine = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
        for _ in 0..count {
            engine.calculate_tick()?;
        }
        Ok(engine.tick())
    }

    /// Barrier lock: blocks until the current tick finishes and holds the
    /// engine still while the guard lives.
    #[must_use]
    pub fn lock(&self) -> EngineGuard<'_> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A handle for external readers/writers of simulation state.
    #[must_use]
    pub fn access(&self) -> SimulationAccess {
        SimulationAccess::new(Arc::clone(&self.engine))
    }

    /// Current tick counter.
    #[must_use]
    pub fn tick(&self) -> u64 {
        self.lock().tick()
    }

    /// Replace the shared parameter set at the next tick boundary.
    pub fn set_parameters(&self, parameters: cytos_core::SimulationParameters) {
        self.lock().set_parameters(parameters);
    }

    /// Replace the shared symbol table at the next tick boundary.
    pub fn set_symbol_table(&self, symbols: cytos_core::SymbolTable) {
        self.lock().set_symbol_table(symbols);
    }

    /// Read the context under the barrier.
    pub fn with_context<R>(&self, f: impl FnOnce(&SimulationContext) -> R) -> R {
        f(self.lock().context())
    }
}

impl Drop for SimulationController {
    fn drop(&mut self) {
        self.set_running(false);
    }
}
