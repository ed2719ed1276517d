//! The constructor cell function: token-driven creation of new cells.
//!
//! A token arriving at a constructor is a construction command. The
//! offspring is placed along the bisector of the widest angular gap between
//! the constructor's existing connections (for a chain cell this is the
//! straight continuation away from the sender), turned by the token's angle
//! field. Obstacle handling, energy transfer, and the post-construction
//! options are all driven by the fixed token-memory contract.

use crate::entities::{Cell, CellKey, Cluster, Particle};
use crate::physics;
use crate::random::IdAllocator;
use crate::space::SpaceMetric;
use crate::token::{
    self, ConstructionAction, ConstructionOption, ConstructionResult, Token, constr,
};
use crate::vector::Vector2;
use crate::{CellFunction, CoreError, SimulationParameters};
use cytos_index::CellEntry;

/// Shared handles a construction needs from its shard.
pub struct ConstructionContext<'a> {
    pub params: &'a SimulationParameters,
    pub metric: &'a SpaceMetric,
    pub ids: &'a mut IdAllocator,
}

/// Side effects of a construction for the shard to apply.
#[derive(Debug, Default)]
pub struct ConstructionEffects {
    /// Obstacle cells of foreign clusters to destroy (routed by owner).
    pub foreign_destroys: Vec<CellEntry>,
    /// Particles minted from destroyed own cells.
    pub new_particles: Vec<Particle>,
    /// Map registrations to drop for destroyed own cells.
    pub own_destroyed: Vec<(Vector2, u64)>,
    /// Freshly constructed cell, for map registration.
    pub offspring: Option<(CellKey, Vector2)>,
}

/// Collects every registered cell within `radius` of a position, across the
/// shard's own map and its neighbors' maps.
pub type ObstacleLookup<'a> = dyn FnMut(Vector2, f64) -> Vec<CellEntry> + 'a;

/// Reference direction in degrees: bisector of the widest angular gap
/// between the constructor's connections.
///
/// With a single connection this is the direction pointing straight away
/// from it. Ties keep the gap that starts first in sorted order.
fn reference_direction(cluster: &Cluster, constructor: CellKey) -> f64 {
    let Some(cell) = cluster.cells.get(constructor) else {
        return 0.0;
    };
    let origin = cluster.cell_offset(cell);
    let mut angles: Vec<f64> = cell
        .connections
        .iter()
        .filter_map(|key| cluster.cells.get(*key))
        .map(|peer| (cluster.cell_offset(peer) - origin).angle())
        .collect();
    if angles.is_empty() {
        return 0.0;
    }
    angles.sort_by(|a, b| a.total_cmp(b));

    let mut best_start = angles[0];
    let mut best_span = f64::MIN;
    for (index, start) in angles.iter().enumerate() {
        let end = if index + 1 < angles.len() {
            angles[index + 1]
        } else {
            angles[0] + 360.0
        };
        let span = end - start;
        if span > best_span + 1e-9 {
            best_span = span;
            best_start = *start;
        }
    }
    best_start + best_span / 2.0
}

fn finish(token: &mut Token, result: ConstructionResult) {
    token.write(constr::OUT, result.as_byte());
}

/// Run one construction command against its cluster.
pub fn process_construction(
    cluster: &mut Cluster,
    constructor: CellKey,
    token: &mut Token,
    ctx: &mut ConstructionContext<'_>,
    obstacles: &mut ObstacleLookup<'_>,
) -> Result<ConstructionEffects, CoreError> {
    let mut effects = ConstructionEffects::default();

    // Captured before the result code lands in byte [1].
    let command_memory = token.memory.clone();

    let action = ConstructionAction::from_byte(token.read(constr::IN));
    if action == ConstructionAction::DoNothing {
        finish(token, ConstructionResult::Success);
        return Ok(effects);
    }
    let option = ConstructionOption::from_byte(token.read(constr::IN_OPTION));
    let params = ctx.params;

    // Placement distance; the first construction of a cluster ignores the
    // requested distance entirely.
    let distance = if cluster.construction_started {
        let requested = token::decode_distance(token.read(constr::IN_DIST));
        if requested == 0.0 {
            params.cell_function_constructor_offspring_cell_distance
        } else if requested > params.cell_max_distance {
            finish(token, ConstructionResult::Distance);
            return Ok(effects);
        } else {
            requested
        }
    } else {
        params.cell_function_constructor_offspring_cell_distance
    };

    // Energy budget: the token must stay viable, fund the offspring, and
    // fund a spawned token when the option asks for one.
    let offspring_energy = params.cell_function_constructor_offspring_cell_energy;
    let spawned_token_energy = if option.spawns_token() {
        params.cell_function_constructor_offspring_token_energy
    } else {
        0.0
    };
    let required = 2.0 * params.token_min_energy + offspring_energy + spawned_token_energy;
    if token.energy <= required {
        finish(token, ConstructionResult::NoEnergy);
        return Ok(effects);
    }

    // Connection budget on both ends.
    let Some(constructor_cell) = cluster.cells.get(constructor) else {
        return Ok(effects);
    };
    if constructor_cell.connections.len() + 1 > params.cell_max_bonds {
        finish(token, ConstructionResult::Connection);
        return Ok(effects);
    }
    // Offspring side: a nonzero request bounds the offspring's own
    // connection count. At birth that count is at most one, so any nonzero
    // request passes; the request itself is not capped by the global bond
    // limit.
    let requested_max = usize::from(token.read(constr::IN_CELL_MAX_CONNECTIONS));
    let connections_after = if option.separates() { 0 } else { 1 };
    if requested_max != 0 && connections_after > requested_max {
        finish(token, ConstructionResult::Connection);
        return Ok(effects);
    }

    let constructor_pos = cluster.cell_position(constructor_cell, ctx.metric);
    let direction = reference_direction(cluster, constructor)
        + token::decode_angle(token.read(constr::INOUT_ANGLE));
    let placement = if option.separates() {
        distance * 2.0
    } else {
        distance
    };
    let offspring_pos = ctx
        .metric
        .normalize(constructor_pos + Vector2::unit_for_angle(direction) * placement);

    // Obstacle resolution around the offspring position.
    let hits = obstacles(offspring_pos, params.cell_min_distance);
    let mut own_hits: Vec<u64> = Vec::new();
    let mut foreign_hits: Vec<CellEntry> = Vec::new();
    for hit in hits {
        if hit.cluster_id == cluster.id {
            own_hits.push(hit.cell_id);
        } else {
            foreign_hits.push(hit);
        }
    }
    match action {
        ConstructionAction::Safe => {
            if !own_hits.is_empty() || !foreign_hits.is_empty() {
                finish(token, ConstructionResult::Obstacle);
                return Ok(effects);
            }
        }
        ConstructionAction::Unsafe => {
            if !foreign_hits.is_empty() {
                finish(token, ConstructionResult::Obstacle);
                return Ok(effects);
            }
        }
        ConstructionAction::Bruteforce => {
            effects.foreign_destroys = foreign_hits;
        }
        ConstructionAction::DoNothing => unreachable!("handled above"),
    }
    for victim_id in own_hits {
        let victim = cluster
            .cells
            .iter()
            .find(|(key, cell)| cell.id == victim_id && *key != constructor)
            .map(|(key, _)| key);
        if let Some(key) = victim {
            let pos = cluster.cell_position(&cluster.cells[key], ctx.metric);
            effects.own_destroyed.push((pos, victim_id));
            let vel = physics::tangential_velocity(
                cluster.cell_offset(&cluster.cells[key]),
                cluster.velocities(),
            );
            if let Some(cell) = cluster.remove_cell(key) {
                effects.new_particles.push(Particle {
                    id: ctx.ids.next_id()?,
                    pos,
                    vel,
                    energy: cell.stored_energy(),
                });
            }
        }
    }

    // Commit: energy moves from the token onto the offspring (and its
    // spawned token), then the new cell joins the cluster.
    token.energy -= offspring_energy + spawned_token_energy;

    let mut max_connections = if requested_max == 0 {
        connections_after.max(2)
    } else {
        requested_max
    };
    if option.reduces_connections() {
        max_connections = max_connections.saturating_sub(1);
    }

    let (static_data, mutable_data) = token::read_function_payloads(token);
    let function_desc = crate::descriptions::CellFunctionDescription {
        kind: crate::descriptions::CellFunctionKind::from_byte(token.read(constr::IN_CELL_FUNCTION)),
        static_data,
        mutable_data,
    };
    let branch_number = token.read(constr::IN_CELL_BRANCH_NO);

    let mut tokens = Vec::new();
    if option.spawns_token() {
        let mut spawned = if option.duplicates_memory() {
            Token {
                energy: spawned_token_energy,
                memory: command_memory,
            }
        } else {
            Token::new(spawned_token_energy, params.token_memory_size)
        };
        spawned.set_branch_number(branch_number);
        tokens.push(spawned);
    }

    let rel_pos = ctx
        .metric
        .displacement(cluster.pos, offspring_pos)
        .rotated(-cluster.angle);
    let offspring_key = cluster.cells.insert(Cell {
        id: ctx.ids.next_id()?,
        rel_pos,
        energy: offspring_energy,
        max_connections,
        connections: Vec::new(),
        branch_number,
        token_blocked: !option.finishes(),
        function: CellFunction::from_description(&function_desc, params),
        tokens,
    });
    if option.separates() {
        cluster.dirty_connectivity = true;
    } else {
        cluster.connect(constructor, offspring_key);
        // Constructing through a token may widen the constructor's own limit
        // up to the global bond cap.
        let count = cluster.cells[constructor].connections.len();
        let constructor_cell = &mut cluster.cells[constructor];
        constructor_cell.max_connections = constructor_cell.max_connections.max(count);
    }
    cluster.construction_started = true;
    cluster.recenter(ctx.metric);

    effects.offspring = Some((offspring_key, offspring_pos));
    finish(token, ConstructionResult::Success);
    Ok(effects)
}
