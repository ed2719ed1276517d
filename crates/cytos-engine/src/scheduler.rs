//! The unit thread controller: dispatches shard timesteps across a bounded
//! worker pool under the neighbor-exclusion constraint.
//!
//! A unit is ready when it has not stepped this tick and none of its eight
//! neighbors is currently stepping. The ready scan walks units in row-major
//! order, so scheduling is deterministic for a given worker count. Workers
//! report completion over a channel; the scheduler loop owns every dispatch
//! decision.

use crate::error::EngineError;
use crate::grid::UnitGrid;
use cytos_core::CoreError;
use std::sync::{Arc, PoisonError};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitState {
    Ready,
    Running,
    Finished,
}

/// Row-major scan for a dispatchable unit.
fn next_ready(states: &[UnitState], conflicts: &[Vec<usize>]) -> Option<usize> {
    (0..states.len()).find(|&index| {
        states[index] == UnitState::Ready
            && conflicts[index]
                .iter()
                .all(|&neighbor| states[neighbor] != UnitState::Running)
    })
}

/// Schedules unit timesteps over at most `max_running_threads` workers.
pub struct UnitThreadController {
    pool: rayon::ThreadPool,
    max_running_threads: usize,
    conflicts: Vec<Vec<usize>>,
}

impl UnitThreadController {
    pub fn new(max_running_threads: usize, grid: &UnitGrid) -> Result<Self, EngineError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(max_running_threads)
            .thread_name(|worker| format!("cytos-unit-{worker}"))
            .build()
            .map_err(|error| EngineError::WorkerPool(error.to_string()))?;
        let conflicts = (0..grid.len()).map(|index| grid.conflict_set(index)).collect();
        Ok(Self {
            pool,
            max_running_threads,
            conflicts,
        })
    }

    #[must_use]
    pub const fn max_running_threads(&self) -> usize {
        self.max_running_threads
    }

    /// Step every unit exactly once; a tick completes when all units finish.
    ///
    /// On the first shard failure no further units are dispatched; already
    /// running workers drain before the error is returned.
    pub fn calculate_timestep(&self, grid: &UnitGrid) -> Result<(), EngineError> {
        let count = grid.len();
        if count == 0 {
            return Ok(());
        }
        let mut states = vec![UnitState::Ready; count];
        let mut finished = 0usize;
        let mut running = 0usize;
        let mut first_error: Option<CoreError> = None;
        let (sender, receiver) = crossbeam_channel::unbounded::<(usize, Result<(), CoreError>)>();

        while finished < count {
            if first_error.is_none() {
                while running < self.max_running_threads {
                    let Some(index) = next_ready(&states, &self.conflicts) else {
                        break;
                    };
                    states[index] = UnitState::Running;
                    running += 1;
                    debug!(unit = index, "dispatch");
                    let unit = Arc::clone(grid.unit(index));
                    let hood = grid.neighborhood(index).clone();
                    let done = sender.clone();
                    self.pool.spawn(move || {
                        let result = {
                            let mut guard =
                                unit.write().unwrap_or_else(PoisonError::into_inner);
                            guard.step(&hood)
                        };
                        let _ = done.send((index, result));
                    });
                }
            }
            if running == 0 {
                // Only reachable after an error stopped dispatching.
                break;
            }
            match receiver.recv() {
                Ok((index, result)) => {
                    states[index] = UnitState::Finished;
                    finished += 1;
                    running -= 1;
                    if let Err(error) = result {
                        warn!(unit = index, %error, "shard step failed");
                        first_error.get_or_insert(error);
                    }
                }
                Err(_) => break,
            }
        }

        match first_error {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }
}
