use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use cytos_core::{
    CellDescription, ClusterDescription, DataDescription, IntVector2, ParticleDescription,
    SimulationParameters, SymbolTable, Vector2,
};
use cytos_engine::{EngineConfig, SimulationEngine};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

fn populated_engine(clusters: usize, particles: usize) -> SimulationEngine {
    let params = SimulationParameters {
        radiation_prob: 0.01,
        ..SimulationParameters::default()
    };
    let config = EngineConfig {
        universe_size: IntVector2::new(1200, 600),
        grid_size: IntVector2::new(6, 3),
        max_running_threads: 4,
        rng_seed: Some(0xBEEF),
        parameters: params,
        symbols: SymbolTable::new(),
    };
    let mut engine = SimulationEngine::new(config).expect("engine");

    let mut rng = SmallRng::seed_from_u64(0xBEEF);
    let mut data = DataDescription::default();
    let mut next_id = || {
        let id: u64 = rng.random_range(1..u64::from(u32::MAX));
        id
    };
    let mut rng_pos = SmallRng::seed_from_u64(0xF00D);
    for _ in 0..clusters {
        let center = Vector2::new(
            rng_pos.random_range(20.0..1180.0),
            rng_pos.random_range(20.0..580.0),
        );
        let len = rng_pos.random_range(2..8);
        let ids: Vec<u64> = (0..len).map(|_| next_id()).collect();
        let cells = (0..len)
            .map(|i| {
                let offset = i as f64 - (len as f64 - 1.0) / 2.0;
                let mut cell = CellDescription::new(
                    ids[i],
                    center + Vector2::new(offset, 0.0),
                    100.0,
                );
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
        data.add_cluster(ClusterDescription {
            id: next_id(),
            pos: center,
            vel: Vector2::new(
                rng_pos.random_range(-0.2..0.2),
                rng_pos.random_range(-0.2..0.2),
            ),
            angle: 0.0,
            angular_vel: rng_pos.random_range(-0.5..0.5),
            cells,
        });
    }
    for _ in 0..particles {
        data.add_particle(ParticleDescription {
            id: next_id(),
            pos: Vector2::new(
                rng_pos.random_range(0.0..1200.0),
                rng_pos.random_range(0.0..600.0),
            ),
            vel: Vector2::new(
                rng_pos.random_range(-0.4..0.4),
                rng_pos.random_range(-0.4..0.4),
            ),
            energy: 20.0,
        });
    }
    engine.update_data(&data).expect("populate");
    engine
}

fn bench_engine_ticks(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_tick");
    group.sample_size(20);
    group.warm_up_time(Duration::from_secs(2));
    group.measurement_time(Duration::from_secs(10));

    for &(clusters, particles) in &[(200usize, 400usize), (1000, 2000)] {
        group.bench_function(
            format!("clusters{clusters}_particles{particles}"),
            |bencher| {
                bencher.iter_batched(
                    || populated_engine(clusters, particles),
                    |mut engine| {
                        for _ in 0..8 {
                            engine.calculate_tick().expect("tick");
                        }
                        engine
                    },
                    BatchSize::LargeInput,
                );
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_engine_ticks);
criterion_main!(benches);
