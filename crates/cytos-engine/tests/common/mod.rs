//! Shared fixtures for the engine integration suites.
#![allow(dead_code)]

use cytos_core::physics::{self, Velocities};
use cytos_core::{
    CellDescription, ClusterDescription, DataDescription, IntRect, IntVector2,
    SimulationParameters, SpaceMetric, SymbolTable, Vector2,
};
use cytos_engine::{EngineConfig, SimulationAccess, SimulationController};

/// Tolerance for geometric expectations.
pub const MEDIUM_PRECISION: f64 = 0.05;
/// Tolerance for conserved quantities.
pub const FINE_PRECISION: f64 = 1e-6;

pub const UNIVERSE: IntVector2 = IntVector2::new(600, 300);

pub struct Bed {
    pub controller: SimulationController,
    pub access: SimulationAccess,
    pub params: SimulationParameters,
}

/// Parameters used by the scenario suites: radiation off, unit offspring
/// distance.
pub fn scenario_params() -> SimulationParameters {
    SimulationParameters {
        radiation_prob: 0.0,
        cell_function_constructor_offspring_cell_distance: 1.0,
        ..SimulationParameters::default()
    }
}

pub fn bed_with(grid: IntVector2, threads: usize, params: SimulationParameters) -> Bed {
    let config = EngineConfig {
        universe_size: UNIVERSE,
        grid_size: grid,
        max_running_threads: threads,
        rng_seed: Some(0x00C0FFEE),
        parameters: params.clone(),
        symbols: SymbolTable::new(),
    };
    let controller = SimulationController::new(config).expect("controller");
    let access = controller.access();
    Bed {
        controller,
        access,
        params,
    }
}

/// Single-shard test bed; every scenario entity lives in one unit.
pub fn bed(params: SimulationParameters) -> Bed {
    bed_with(IntVector2::new(1, 1), 1, params)
}

pub fn universe_rect() -> IntRect {
    IntRect::new(IntVector2::new(0, 0), UNIVERSE)
}

pub fn metric() -> SpaceMetric {
    SpaceMetric::new(UNIVERSE)
}

pub fn next_id(bed: &Bed) -> u64 {
    bed.controller
        .lock()
        .context_mut()
        .next_id()
        .expect("id space")
}

/// A chain cluster of `len` cells along the direction `tilt` degrees off
/// horizontal, centered at `center`.
pub fn line_cluster(
    bed: &Bed,
    len: usize,
    center: Vector2,
    vel: Vector2,
    tilt: f64,
    angular_vel: f64,
) -> ClusterDescription {
    let axis = Vector2::new(1.0, 0.0).rotated(tilt);
    let ids: Vec<u64> = (0..len).map(|_| next_id(bed)).collect();
    let cells = (0..len)
        .map(|i| {
            let offset = i as f64 - (len as f64 - 1.0) / 2.0;
            let mut cell = CellDescription::new(ids[i], center + axis * offset, 100.0);
            cell.max_connections = 2;
            if i > 0 {
                cell.connections.push(ids[i - 1]);
            }
            if i + 1 < len {
                cell.connections.push(ids[i + 1]);
            }
            cell
        })
        .collect();
    ClusterDescription {
        id: next_id(bed),
        pos: center,
        vel,
        angle: 0.0,
        angular_vel,
        cells,
    }
}

pub fn horizontal_cluster(
    bed: &Bed,
    len: usize,
    center: Vector2,
    vel: Vector2,
    angular_vel: f64,
) -> ClusterDescription {
    line_cluster(bed, len, center, vel, 0.0, angular_vel)
}

/// Kinetic energy of a cluster snapshot.
pub fn cluster_kinetic(cluster: &ClusterDescription, metric: &SpaceMetric) -> f64 {
    let offsets: Vec<Vector2> = cluster
        .cells
        .iter()
        .map(|cell| metric.displacement(cluster.pos, cell.pos))
        .collect();
    physics::kinetic_energy(
        cluster.cells.len() as f64,
        cluster.vel,
        physics::angular_mass(offsets),
        cluster.angular_vel,
    )
}

pub fn total_kinetic(data: &DataDescription, metric: &SpaceMetric) -> f64 {
    data.clusters
        .iter()
        .map(|cluster| cluster_kinetic(cluster, metric))
        .sum()
}

pub fn total_energy(data: &DataDescription, metric: &SpaceMetric) -> f64 {
    data.stored_energy() + total_kinetic(data, metric)
}

/// Velocities a fragment made of `cell_ids` inherits from `cluster`.
pub fn fragment_velocities(
    cluster: &ClusterDescription,
    cell_ids: &[u64],
    metric: &SpaceMetric,
) -> Velocities {
    let offsets: Vec<Vector2> = cluster
        .cells
        .iter()
        .filter(|cell| cell_ids.contains(&cell.id))
        .map(|cell| metric.displacement(cluster.pos, cell.pos))
        .collect();
    physics::velocities_of_center(
        Velocities {
            linear: cluster.vel,
            angular: cluster.angular_vel,
        },
        &offsets,
    )
}

/// Sort a snapshot by entity id so state comparisons ignore shard order.
pub fn normalized(mut data: DataDescription) -> DataDescription {
    data.clusters.sort_by_key(|cluster| cluster.id);
    for cluster in &mut data.clusters {
        cluster.cells.sort_by_key(|cell| cell.id);
        for cell in &mut cluster.cells {
            cell.connections.sort_unstable();
        }
    }
    data.particles.sort_by_key(|particle| particle.id);
    data
}

pub fn assert_close(actual: f64, expected: f64, tolerance: f64, what: &str) {
    assert!(
        (actual - expected).abs() < tolerance,
        "{what}: expected {expected}, got {actual}"
    );
}

pub fn assert_vec_close(actual: Vector2, expected: Vector2, tolerance: f64, what: &str) {
    assert!(
        (actual - expected).length() < tolerance,
        "{what}: expected ({}, {}), got ({}, {})",
        expected.x,
        expected.y,
        actual.x,
        actual.y
    );
}
