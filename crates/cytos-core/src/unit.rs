//! One shard of the universe: its entities, maps, and the eight-phase
//! timestep.
//!
//! A unit owns the clusters and particles whose centers lie in its
//! compartment, plus the per-shard random ring and id allocator. During a
//! step it reads its neighbors' occupancy maps through the
//! [`Neighborhood`] handle and, where the semantics demand it (collision
//! impulses, bruteforce destruction, ownership hand-off), writes into a
//! neighbor unit — safe because the scheduler never runs two units with
//! overlapping neighborhoods at the same time. Entities handed off to a
//! neighbor land in an inbox and join that unit's arenas at the start of
//! its next step, keeping tick results independent of worker timing.

use crate::descriptions::{CellFunctionKind, ClusterDescription, ParticleDescription};
use crate::entities::{Cell, CellKey, Cluster, ClusterKey, Particle, ParticleKey};
use crate::error::CoreError;
use crate::functions::constructor::{ConstructionContext, process_construction};
use crate::functions::{self, CellFunction};
use crate::physics::{self, BodyState};
use crate::random::{IdAllocator, RandomRing};
use crate::space::{Compartment, IntRect, IntVector2, SpaceMetric};
use crate::token::{self, Token};
use crate::vector::Vector2;
use crate::{SimulationParameters, SymbolTable};
use cytos_index::{CellEntry, CellMap, ParticleEntry, ParticleMap};
use slotmap::SlotMap;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Reach of the weapon function, in world units.
const WEAPON_RANGE: f64 = 2.0;
/// Fraction of a victim's energy taken per weapon strike.
const WEAPON_DRAIN_FRACTION: f64 = 0.1;
/// Reach of the sensor function.
const SENSOR_RANGE: f64 = 8.0;
/// Reach of the communicator function.
const COMM_RANGE: f64 = 8.0;
/// Particles faster than this never condense into a cell.
const PARTICLE_TO_CELL_MAX_SPEED: f64 = 0.5;
/// Speed of emitted radiation particles.
const RADIATION_SPEED: f64 = 0.5;

/// Read/write handle to one neighbor shard.
#[derive(Clone)]
pub struct NeighborRef {
    pub index: usize,
    pub rect: IntRect,
    pub unit: Arc<RwLock<Unit>>,
}

/// The deduplicated set of distinct neighbor shards of one unit.
///
/// Small grids wrap neighbors onto the unit itself; such entries are
/// dropped, so lookups fall through to the unit's own maps only.
#[derive(Clone, Default)]
pub struct Neighborhood {
    pub neighbors: Vec<NeighborRef>,
}

impl Neighborhood {
    #[must_use]
    pub fn by_index(&self, index: usize) -> Option<&NeighborRef> {
        self.neighbors.iter().find(|n| n.index == index)
    }

    /// Run `f` against the neighbor unit `index`, if it is one of ours.
    pub fn with_unit<R>(&self, index: usize, f: impl FnOnce(&mut Unit) -> R) -> Option<R> {
        let neighbor = self.by_index(index)?;
        let mut guard = neighbor
            .unit
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Some(f(&mut guard))
    }

    /// Cell registrations at one grid location across all neighbor maps.
    fn cells_at(&self, grid: (i32, i32), out: &mut Vec<CellEntry>) {
        for neighbor in &self.neighbors {
            let guard = neighbor
                .unit
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            out.extend_from_slice(guard.cell_map.at(grid));
        }
    }
}

/// All registered cells within `radius` of `center`, across the unit's own
/// map and every neighbor map.
fn cells_within(
    cell_map: &CellMap,
    hood: &Neighborhood,
    metric: &SpaceMetric,
    center: Vector2,
    radius: f64,
) -> Vec<CellEntry> {
    let mut hits = Vec::new();
    let reach = radius.ceil() as i32;
    let center_grid = metric.grid_position(center);
    let mut bucket = Vec::new();
    for dx in -reach..=reach {
        for dy in -reach..=reach {
            let grid = metric.wrap_grid(IntVector2::new(center_grid.x + dx, center_grid.y + dy));
            let key = (grid.x, grid.y);
            bucket.clear();
            bucket.extend_from_slice(cell_map.at(key));
            hood.cells_at(key, &mut bucket);
            for entry in &bucket {
                let pos = Vector2::new(entry.pos.0, entry.pos.1);
                if metric.distance(pos, center) < radius {
                    hits.push(*entry);
                }
            }
        }
    }
    hits
}

/// Aggregated contact between one own cluster and one peer cluster.
///
/// All touching cell pairs of the two clusters are folded into a single
/// contact point (their toroidal mean), so a flush collision along a long
/// edge produces one symmetric impulse instead of a torque at the first
/// touching cell.
struct Contact {
    own_key: ClusterKey,
    own_id: u64,
    other_id: u64,
    other_owner: usize,
    anchor: Vector2,
    own_sum: Vector2,
    other_sum: Vector2,
    pairs: f64,
}

impl Contact {
    fn mean_positions(&self, metric: &SpaceMetric) -> (Vector2, Vector2) {
        let own = metric.normalize(self.anchor + self.own_sum / self.pairs);
        let other = metric.normalize(self.anchor + self.other_sum / self.pairs);
        (own, other)
    }
}

enum DeferredOp {
    /// Destroy a cell of a cluster owned by this unit.
    DestroyOwn { cluster_id: u64, cell_id: u64 },
    /// Weapon strike: move a fraction of the victim's energy to the attacker.
    Drain {
        victim_owner: usize,
        victim_cluster: u64,
        victim_cell: u64,
        attacker: (ClusterKey, CellKey),
    },
    /// Communicator broadcast delivery.
    Message {
        target_owner: usize,
        target_cluster: u64,
        target_cell: u64,
        byte: u8,
    },
}

/// One tile of the universe grid: the scheduling and ownership atom.
pub struct Unit {
    index: usize,
    shard: u16,
    compartment: Compartment,
    metric: SpaceMetric,
    params: SimulationParameters,
    symbols: SymbolTable,
    rng: RandomRing,
    ids: IdAllocator,
    clusters: SlotMap<ClusterKey, Cluster>,
    particles: SlotMap<ParticleKey, Particle>,
    cell_map: CellMap,
    particle_map: ParticleMap,
    inbox_clusters: Vec<Cluster>,
    inbox_particles: Vec<Particle>,
}

impl Unit {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        index: usize,
        shard: u16,
        compartment: Compartment,
        metric: SpaceMetric,
        params: SimulationParameters,
        symbols: SymbolTable,
        rng: RandomRing,
        ids: IdAllocator,
    ) -> Self {
        Self {
            index,
            shard,
            compartment,
            metric,
            params,
            symbols,
            rng,
            ids,
            clusters: SlotMap::with_key(),
            particles: SlotMap::with_key(),
            cell_map: CellMap::new(),
            particle_map: ParticleMap::new(),
            inbox_clusters: Vec::new(),
            inbox_particles: Vec::new(),
        }
    }

    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub const fn shard(&self) -> u16 {
        self.shard
    }

    #[must_use]
    pub const fn compartment(&self) -> &Compartment {
        &self.compartment
    }

    #[must_use]
    pub const fn params(&self) -> &SimulationParameters {
        &self.params
    }

    pub fn set_parameters(&mut self, params: SimulationParameters) {
        self.params = params;
    }

    pub fn set_symbol_table(&mut self, symbols: SymbolTable) {
        self.symbols = symbols;
    }

    #[must_use]
    pub const fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    #[must_use]
    pub const fn clusters(&self) -> &SlotMap<ClusterKey, Cluster> {
        &self.clusters
    }

    #[must_use]
    pub const fn particles(&self) -> &SlotMap<ParticleKey, Particle> {
        &self.particles
    }

    /// Allocate an id from this shard's allocator.
    pub fn allocate_id(&mut self) -> Result<u64, CoreError> {
        self.ids.next_id()
    }

    #[must_use]
    pub fn cluster_key_by_id(&self, cluster_id: u64) -> Option<ClusterKey> {
        self.clusters
            .iter()
            .find(|(_, cluster)| cluster.id == cluster_id)
            .map(|(key, _)| key)
    }

    /// Adopt a cluster into this unit's arena (splice-in or hand-off).
    pub fn insert_cluster(&mut self, cluster: Cluster) -> ClusterKey {
        self.clusters.insert(cluster)
    }

    /// Adopt a particle into this unit's arena.
    pub fn insert_particle(&mut self, particle: Particle) -> ParticleKey {
        self.particles.insert(particle)
    }

    /// Queue a cluster handed off by a neighbor mid-tick.
    pub fn push_incoming_cluster(&mut self, cluster: Cluster) {
        self.inbox_clusters.push(cluster);
    }

    /// Queue a particle handed off by a neighbor mid-tick.
    pub fn push_incoming_particle(&mut self, particle: Particle) {
        self.inbox_particles.push(particle);
    }

    /// Remove the entity carrying `id` (cluster or particle), if owned here.
    pub fn remove_entity_by_id(&mut self, id: u64) -> bool {
        if let Some(key) = self.cluster_key_by_id(id) {
            self.clusters.remove(key);
            return true;
        }
        let particle = self
            .particles
            .iter()
            .find(|(_, particle)| particle.id == id)
            .map(|(key, _)| key);
        if let Some(key) = particle {
            self.particles.remove(key);
            return true;
        }
        false
    }

    /// Energy stored in this unit's entities, kinetic energy included.
    #[must_use]
    pub fn total_energy(&self) -> f64 {
        let cluster_energy: f64 = self
            .clusters
            .values()
            .map(|cluster| cluster.stored_energy() + cluster.kinetic_energy())
            .sum();
        let particle_energy: f64 = self.particles.values().map(|p| p.energy).sum();
        cluster_energy + particle_energy
    }

    /// Copy every cluster touching `rect` and every particle inside it.
    #[must_use]
    pub fn extract_region(&self, rect: IntRect) -> (Vec<ClusterDescription>, Vec<ParticleDescription>) {
        let clusters = self
            .clusters
            .values()
            .filter(|cluster| {
                cluster
                    .cells
                    .values()
                    .any(|cell| rect.contains(cluster.cell_position(cell, &self.metric)))
            })
            .map(|cluster| cluster.to_description(&self.metric))
            .collect();
        let particles = self
            .particles
            .values()
            .filter(|particle| rect.contains(self.metric.normalize(particle.pos)))
            .map(Particle::to_description)
            .collect();
        (clusters, particles)
    }

    /// Destroy one cell by id, minting a particle from its stored energy.
    ///
    /// Invoked locally and by stepping neighbors (bruteforce construction).
    pub fn destroy_cell_by_id(&mut self, cluster_id: u64, cell_id: u64) -> Result<bool, CoreError> {
        let Some(cluster_key) = self.cluster_key_by_id(cluster_id) else {
            return Ok(false);
        };
        let cell_key = self.clusters[cluster_key]
            .cells
            .iter()
            .find(|(_, cell)| cell.id == cell_id)
            .map(|(key, _)| key);
        let Some(cell_key) = cell_key else {
            return Ok(false);
        };

        let (pos, vel, energy) = {
            let cluster = &self.clusters[cluster_key];
            let cell = &cluster.cells[cell_key];
            (
                cluster.cell_position(cell, &self.metric),
                physics::tangential_velocity(cluster.cell_offset(cell), cluster.velocities()),
                cell.stored_energy(),
            )
        };
        self.clusters[cluster_key].remove_cell(cell_key);
        let grid = self.metric.grid_position(pos);
        self.cell_map.remove((grid.x, grid.y), cell_id);
        if self.clusters[cluster_key].cells.is_empty() {
            self.clusters.remove(cluster_key);
        } else {
            self.clusters[cluster_key].recenter(&self.metric);
        }

        let particle = Particle {
            id: self.ids.next_id()?,
            pos,
            vel,
            energy,
        };
        self.register_particle(&particle)?;
        self.particles.insert(particle);
        Ok(true)
    }

    /// Weapon strike delivery: remove a fraction of a cell's energy.
    pub fn drain_cell_energy(&mut self, cluster_id: u64, cell_id: u64, fraction: f64) -> f64 {
        let Some(cluster_key) = self.cluster_key_by_id(cluster_id) else {
            return 0.0;
        };
        let cluster = &mut self.clusters[cluster_key];
        for cell in cluster.cells.values_mut() {
            if cell.id == cell_id {
                let drained = cell.energy * fraction;
                cell.energy -= drained;
                return drained;
            }
        }
        0.0
    }

    /// Communicator broadcast delivery.
    pub fn deliver_message(&mut self, cluster_id: u64, cell_id: u64, byte: u8) {
        let Some(cluster_key) = self.cluster_key_by_id(cluster_id) else {
            return;
        };
        for cell in self.clusters[cluster_key].cells.values_mut() {
            if cell.id == cell_id
                && let CellFunction::Communicator(state) = &mut cell.function
            {
                state.received = byte;
            }
        }
    }

    fn register_particle(&mut self, particle: &Particle) -> Result<(), CoreError> {
        let grid = self.metric.grid_position(particle.pos);
        self.particle_map.insert(
            (grid.x, grid.y),
            ParticleEntry {
                pos: (particle.pos.x, particle.pos.y),
                particle_id: particle.id,
                owner: self.index,
            },
        )?;
        Ok(())
    }

    fn refresh_maps(&mut self) -> Result<(), CoreError> {
        self.cell_map.clear();
        self.particle_map.clear();
        for cluster in self.clusters.values() {
            for cell in cluster.cells.values() {
                let pos = cluster.cell_position(cell, &self.metric);
                let grid = self.metric.grid_position(pos);
                self.cell_map.insert(
                    (grid.x, grid.y),
                    CellEntry {
                        pos: (pos.x, pos.y),
                        cell_id: cell.id,
                        cluster_id: cluster.id,
                        owner: self.index,
                        function: cell.function.kind().as_byte(),
                    },
                )?;
            }
        }
        let particles: Vec<(Vector2, u64)> = self
            .particles
            .values()
            .map(|particle| (particle.pos, particle.id))
            .collect();
        for (pos, id) in particles {
            let grid = self.metric.grid_position(pos);
            self.particle_map.insert(
                (grid.x, grid.y),
                ParticleEntry {
                    pos: (pos.x, pos.y),
                    particle_id: id,
                    owner: self.index,
                },
            )?;
        }
        Ok(())
    }

    /// Phase 1: adopt handed-off entities, then rebuild the occupancy maps
    /// at pre-step positions.
    fn stage_refresh(&mut self) -> Result<(), CoreError> {
        if !self.inbox_clusters.is_empty() {
            self.inbox_clusters.sort_by_key(|cluster| cluster.id);
            for cluster in std::mem::take(&mut self.inbox_clusters) {
                self.clusters.insert(cluster);
            }
        }
        if !self.inbox_particles.is_empty() {
            self.inbox_particles.sort_by_key(|particle| particle.id);
            for particle in std::mem::take(&mut self.inbox_particles) {
                self.particles.insert(particle);
            }
        }
        self.refresh_maps()
    }

    /// Phase 2: detect and resolve collisions between cells of different
    /// clusters, conserving momentum, angular momentum, and kinetic energy.
    fn stage_collisions(&mut self, hood: &Neighborhood) {
        let mut contacts: Vec<Contact> = Vec::new();
        let mut slots: HashMap<(ClusterKey, u64), usize> = HashMap::new();
        for (own_key, cluster) in &self.clusters {
            for cell in cluster.cells.values() {
                let pos = cluster.cell_position(cell, &self.metric);
                let own_grid = self.metric.grid_position(pos);
                let hits = cells_within(
                    &self.cell_map,
                    hood,
                    &self.metric,
                    pos,
                    self.params.cell_min_distance.max(1.0) + 1.0,
                );
                for entry in hits {
                    if entry.cluster_id == cluster.id {
                        continue;
                    }
                    let other_pos = Vector2::new(entry.pos.0, entry.pos.1);
                    let touching = self.metric.distance(pos, other_pos)
                        < self.params.cell_min_distance
                        || self.metric.grid_position(other_pos) == own_grid;
                    if !touching {
                        continue;
                    }
                    let slot = *slots
                        .entry((own_key, entry.cluster_id))
                        .or_insert_with(|| {
                            contacts.push(Contact {
                                own_key,
                                own_id: cluster.id,
                                other_id: entry.cluster_id,
                                other_owner: entry.owner,
                                anchor: pos,
                                own_sum: Vector2::ZERO,
                                other_sum: Vector2::ZERO,
                                pairs: 0.0,
                            });
                            contacts.len() - 1
                        });
                    let contact = &mut contacts[slot];
                    contact.own_sum += self.metric.displacement(contact.anchor, pos);
                    contact.other_sum += self.metric.displacement(contact.anchor, other_pos);
                    contact.pairs += 1.0;
                }
            }
        }

        for contact in contacts {
            // Each pair is resolved once, by the unit owning the smaller id.
            if contact.own_id >= contact.other_id {
                continue;
            }
            self.resolve_contact(hood, &contact);
        }
    }

    fn resolve_contact(&mut self, hood: &Neighborhood, contact: &Contact) {
        let Some(own) = self.clusters.get(contact.own_key) else {
            return;
        };
        let (own_cell_pos, other_cell_pos) = contact.mean_positions(&self.metric);
        let mut normal = self
            .metric
            .displacement(other_cell_pos, own_cell_pos)
            .normalized();
        let contact_point = self.metric.midpoint(own_cell_pos, other_cell_pos);
        let r_a = self.metric.displacement(own.pos, contact_point);
        let a_state = BodyState {
            velocities: own.velocities(),
            mass: own.mass(),
            angular_mass: own.angular_mass(),
        };

        if contact.other_owner == self.index {
            let Some(other_key) = self.cluster_key_by_id(contact.other_id) else {
                return;
            };
            let other = &self.clusters[other_key];
            if normal == Vector2::ZERO {
                normal = self.metric.displacement(other.pos, own.pos).normalized();
            }
            if normal == Vector2::ZERO {
                return;
            }
            let r_b = self.metric.displacement(other.pos, contact_point);
            let b_state = BodyState {
                velocities: other.velocities(),
                mass: other.mass(),
                angular_mass: other.angular_mass(),
            };
            if let Some(response) = physics::resolve_collision(&a_state, r_a, &b_state, r_b, normal)
            {
                let own = &mut self.clusters[contact.own_key];
                own.vel += response.delta_a.linear;
                own.angular_vel += response.delta_a.angular;
                let other = &mut self.clusters[other_key];
                other.vel += response.delta_b.linear;
                other.angular_vel += response.delta_b.angular;
            }
        } else {
            let own_pos = own.pos;
            let response = hood.with_unit(contact.other_owner, |neighbor| {
                let other_key = neighbor.cluster_key_by_id(contact.other_id)?;
                let other = &neighbor.clusters[other_key];
                let mut normal = normal;
                if normal == Vector2::ZERO {
                    normal = neighbor.metric.displacement(other.pos, own_pos).normalized();
                }
                if normal == Vector2::ZERO {
                    return None;
                }
                let r_b = neighbor.metric.displacement(other.pos, contact_point);
                let b_state = BodyState {
                    velocities: other.velocities(),
                    mass: other.mass(),
                    angular_mass: other.angular_mass(),
                };
                let response =
                    physics::resolve_collision(&a_state, r_a, &b_state, r_b, normal)?;
                let other = &mut neighbor.clusters[other_key];
                other.vel += response.delta_b.linear;
                other.angular_vel += response.delta_b.angular;
                Some(response)
            });
            if let Some(Some(response)) = response
                && let Some(own) = self.clusters.get_mut(contact.own_key)
            {
                own.vel += response.delta_a.linear;
                own.angular_vel += response.delta_a.angular;
            }
        }
    }

    /// Phase 3: integrate motion and wrap into the universe.
    fn stage_motion(&mut self) {
        for cluster in self.clusters.values_mut() {
            cluster.pos = self.metric.normalize(cluster.pos + cluster.vel);
            cluster.angle = (cluster.angle + cluster.angular_vel).rem_euclid(360.0);
        }
        for particle in self.particles.values_mut() {
            particle.pos = self.metric.normalize(particle.pos + particle.vel);
        }
    }

    /// Phase 4: hand entities whose center left the compartment to the
    /// neighbor that now owns them.
    fn stage_transfer(&mut self, hood: &Neighborhood) -> Result<(), CoreError> {
        let rect = self.compartment.rect;
        let stray_clusters: Vec<ClusterKey> = self
            .clusters
            .iter()
            .filter(|(_, cluster)| !rect.contains(cluster.pos))
            .map(|(key, _)| key)
            .collect();
        for key in stray_clusters {
            let (id, pos) = match self.clusters.get(key) {
                Some(cluster) => (cluster.id, cluster.pos),
                None => continue,
            };
            let Some(neighbor) = hood
                .neighbors
                .iter()
                .find(|neighbor| neighbor.rect.contains(pos))
            else {
                // Left unrouted in place so a post-mortem snapshot still
                // shows the runaway.
                return Err(CoreError::StrayCluster {
                    cluster: id,
                    x: pos.x,
                    y: pos.y,
                });
            };
            let Some(cluster) = self.clusters.remove(key) else {
                continue;
            };
            debug!(
                cluster = cluster.id,
                from = self.index,
                to = neighbor.index,
                "cluster hand-off"
            );
            let mut guard = neighbor
                .unit
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            guard.push_incoming_cluster(cluster);
        }

        let stray_particles: Vec<ParticleKey> = self
            .particles
            .iter()
            .filter(|(_, particle)| !rect.contains(particle.pos))
            .map(|(key, _)| key)
            .collect();
        for key in stray_particles {
            let (id, pos) = match self.particles.get(key) {
                Some(particle) => (particle.id, particle.pos),
                None => continue,
            };
            let Some(neighbor) = hood
                .neighbors
                .iter()
                .find(|neighbor| neighbor.rect.contains(pos))
            else {
                return Err(CoreError::StrayCluster {
                    cluster: id,
                    x: pos.x,
                    y: pos.y,
                });
            };
            let Some(particle) = self.particles.remove(key) else {
                continue;
            };
            let mut guard = neighbor
                .unit
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            guard.push_incoming_particle(particle);
        }
        Ok(())
    }

    /// Phase 5: move tokens along the branch chain, then run the functions
    /// of the cells they arrived at.
    fn stage_cell_functions(&mut self, hood: &Neighborhood) -> Result<(), CoreError> {
        // Movement: a token on a cell spreads to every connected, unblocked
        // cell whose branch number is the successor of the token's. The
        // energy splits evenly; shares too small to stay viable (and tokens
        // with nowhere to go) are absorbed by the hosting cell.
        let mut arrivals: Vec<(ClusterKey, CellKey, Token)> = Vec::new();
        let cluster_keys: Vec<ClusterKey> = self.clusters.keys().collect();
        for cluster_key in &cluster_keys {
            let cluster = &mut self.clusters[*cluster_key];
            let cell_keys: Vec<CellKey> = cluster.cells.keys().collect();
            for cell_key in cell_keys {
                let tokens = std::mem::take(&mut cluster.cells[cell_key].tokens);
                for tok in tokens {
                    let next_branch = tok.branch_number().wrapping_add(1);
                    let targets: Vec<CellKey> = cluster.cells[cell_key]
                        .connections
                        .iter()
                        .copied()
                        .filter(|peer| {
                            cluster.cells.get(*peer).is_some_and(|cell| {
                                cell.branch_number == next_branch && !cell.token_blocked
                            })
                        })
                        .collect();
                    let share = tok.energy / targets.len().max(1) as f64;
                    if targets.is_empty() || share < self.params.token_min_energy {
                        cluster.cells[cell_key].energy += tok.energy;
                        continue;
                    }
                    for target in targets {
                        let mut moved = tok.clone();
                        moved.energy = share;
                        moved.set_branch_number(next_branch);
                        arrivals.push((*cluster_key, target, moved));
                    }
                }
            }
        }

        // Execution, in arrival order.
        let mut deferred: Vec<DeferredOp> = Vec::new();
        for (cluster_key, cell_key, mut tok) in arrivals {
            let kind = match self.clusters.get(cluster_key) {
                Some(cluster) => match cluster.cells.get(cell_key) {
                    Some(cell) => cell.function.kind(),
                    None => continue,
                },
                None => continue,
            };
            match kind {
                CellFunctionKind::Computer => {
                    let cluster = &mut self.clusters[cluster_key];
                    if let CellFunction::Computer(state) =
                        &mut cluster.cells[cell_key].function
                    {
                        functions::computer::execute(state, &mut tok, &self.params);
                    }
                }
                CellFunctionKind::Constructor => {
                    self.run_constructor(hood, cluster_key, cell_key, &mut tok)?;
                }
                CellFunctionKind::Scanner => {
                    functions::scan(&self.clusters[cluster_key], cell_key, &mut tok);
                }
                CellFunctionKind::Weapon => {
                    self.run_weapon(hood, cluster_key, cell_key, &mut deferred);
                }
                CellFunctionKind::Sensor => {
                    self.run_sensor(hood, cluster_key, cell_key, &mut tok);
                }
                CellFunctionKind::Communicator => {
                    self.run_communicator(hood, cluster_key, cell_key, &mut tok, &mut deferred);
                }
            }
            if let Some(cluster) = self.clusters.get_mut(cluster_key)
                && let Some(cell) = cluster.cells.get_mut(cell_key)
            {
                cell.tokens.push(tok);
            }
        }

        // Apply cross-cluster side effects after all executions.
        for op in deferred {
            match op {
                DeferredOp::DestroyOwn { cluster_id, cell_id } => {
                    self.destroy_cell_by_id(cluster_id, cell_id)?;
                }
                DeferredOp::Drain {
                    victim_owner,
                    victim_cluster,
                    victim_cell,
                    attacker,
                } => {
                    let drained = if victim_owner == self.index {
                        self.drain_cell_energy(victim_cluster, victim_cell, WEAPON_DRAIN_FRACTION)
                    } else {
                        hood.with_unit(victim_owner, |unit| {
                            unit.drain_cell_energy(
                                victim_cluster,
                                victim_cell,
                                WEAPON_DRAIN_FRACTION,
                            )
                        })
                        .unwrap_or(0.0)
                    };
                    if let Some(cluster) = self.clusters.get_mut(attacker.0)
                        && let Some(cell) = cluster.cells.get_mut(attacker.1)
                    {
                        cell.energy += drained;
                    }
                }
                DeferredOp::Message {
                    target_owner,
                    target_cluster,
                    target_cell,
                    byte,
                } => {
                    if target_owner == self.index {
                        self.deliver_message(target_cluster, target_cell, byte);
                    } else {
                        hood.with_unit(target_owner, |unit| {
                            unit.deliver_message(target_cluster, target_cell, byte);
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn run_constructor(
        &mut self,
        hood: &Neighborhood,
        cluster_key: ClusterKey,
        cell_key: CellKey,
        tok: &mut Token,
    ) -> Result<(), CoreError> {
        let Some(cluster) = self.clusters.get_mut(cluster_key) else {
            return Ok(());
        };
        let mut ctx = ConstructionContext {
            params: &self.params,
            metric: &self.metric,
            ids: &mut self.ids,
        };
        let cell_map = &self.cell_map;
        let mut lookup = |center: Vector2, radius: f64| {
            cells_within(cell_map, hood, &self.metric, center, radius)
        };
        let effects = process_construction(cluster, cell_key, tok, &mut ctx, &mut lookup)?;

        for (pos, cell_id) in effects.own_destroyed {
            let grid = self.metric.grid_position(pos);
            self.cell_map.remove((grid.x, grid.y), cell_id);
        }
        if let Some((offspring_key, pos)) = effects.offspring {
            let cluster = &self.clusters[cluster_key];
            let cell = &cluster.cells[offspring_key];
            let grid = self.metric.grid_position(pos);
            self.cell_map.insert(
                (grid.x, grid.y),
                CellEntry {
                    pos: (pos.x, pos.y),
                    cell_id: cell.id,
                    cluster_id: cluster.id,
                    owner: self.index,
                    function: cell.function.kind().as_byte(),
                },
            )?;
        }
        for particle in effects.new_particles {
            self.register_particle(&particle)?;
            self.particles.insert(particle);
        }
        for entry in effects.foreign_destroys {
            if entry.owner == self.index {
                self.destroy_cell_by_id(entry.cluster_id, entry.cell_id)?;
            } else {
                hood.with_unit(entry.owner, |unit| {
                    unit.destroy_cell_by_id(entry.cluster_id, entry.cell_id)
                })
                .transpose()?;
            }
        }
        Ok(())
    }

    fn run_weapon(
        &mut self,
        hood: &Neighborhood,
        cluster_key: ClusterKey,
        cell_key: CellKey,
        deferred: &mut Vec<DeferredOp>,
    ) {
        let cluster = &self.clusters[cluster_key];
        let cell = &cluster.cells[cell_key];
        let pos = cluster.cell_position(cell, &self.metric);
        for entry in cells_within(&self.cell_map, hood, &self.metric, pos, WEAPON_RANGE) {
            if entry.cluster_id == cluster.id {
                continue;
            }
            deferred.push(DeferredOp::Drain {
                victim_owner: entry.owner,
                victim_cluster: entry.cluster_id,
                victim_cell: entry.cell_id,
                attacker: (cluster_key, cell_key),
            });
        }
    }

    fn run_sensor(
        &mut self,
        hood: &Neighborhood,
        cluster_key: ClusterKey,
        cell_key: CellKey,
        tok: &mut Token,
    ) {
        let cluster = &self.clusters[cluster_key];
        let cell = &cluster.cells[cell_key];
        let pos = cluster.cell_position(cell, &self.metric);
        let nearest = cells_within(&self.cell_map, hood, &self.metric, pos, SENSOR_RANGE)
            .into_iter()
            .filter(|entry| entry.cluster_id != cluster.id)
            .map(|entry| {
                let target = Vector2::new(entry.pos.0, entry.pos.1);
                (self.metric.distance(pos, target), target)
            })
            .min_by(|a, b| a.0.total_cmp(&b.0));
        match nearest {
            Some((distance, target)) => {
                let mut angle = self.metric.displacement(pos, target).angle();
                if angle > 180.0 {
                    angle -= 360.0;
                }
                tok.write(token::sensor::OUT_DETECTED, 1);
                tok.write(token::sensor::OUT_ANGLE, token::encode_angle(angle));
                tok.write(token::sensor::OUT_DISTANCE, token::encode_distance(distance));
            }
            None => {
                tok.write(token::sensor::OUT_DETECTED, 0);
                tok.write(token::sensor::OUT_ANGLE, 0);
                tok.write(token::sensor::OUT_DISTANCE, 0);
            }
        }
    }

    fn run_communicator(
        &mut self,
        hood: &Neighborhood,
        cluster_key: ClusterKey,
        cell_key: CellKey,
        tok: &mut Token,
        deferred: &mut Vec<DeferredOp>,
    ) {
        let cluster = &self.clusters[cluster_key];
        let cell = &cluster.cells[cell_key];
        let pos = cluster.cell_position(cell, &self.metric);
        let own_cell_id = cell.id;
        if let CellFunction::Communicator(state) = &cell.function {
            tok.write(token::communicator::OUT_RECEIVED, state.received);
        }
        let byte = tok.read(token::communicator::IN_MESSAGE);
        for entry in cells_within(&self.cell_map, hood, &self.metric, pos, COMM_RANGE) {
            if entry.cell_id == own_cell_id
                || entry.function != CellFunctionKind::Communicator.as_byte()
            {
                continue;
            }
            deferred.push(DeferredOp::Message {
                target_owner: entry.owner,
                target_cluster: entry.cluster_id,
                target_cell: entry.cell_id,
                byte,
            });
        }
    }

    /// Phase 6: remove energy-starved cells, then split clusters whose
    /// connection graph fell apart.
    fn stage_decomposition(&mut self) -> Result<(), CoreError> {
        let cluster_keys: Vec<ClusterKey> = self.clusters.keys().collect();
        for cluster_key in cluster_keys {
            let weak: Vec<(CellKey, u64)> = self.clusters[cluster_key]
                .cells
                .iter()
                .filter(|(_, cell)| cell.energy < self.params.cell_min_energy)
                .map(|(key, cell)| (key, cell.id))
                .collect();
            for (cell_key, cell_id) in weak {
                let (pos, vel, energy) = {
                    let cluster = &self.clusters[cluster_key];
                    let cell = &cluster.cells[cell_key];
                    (
                        cluster.cell_position(cell, &self.metric),
                        physics::tangential_velocity(
                            cluster.cell_offset(cell),
                            cluster.velocities(),
                        ),
                        cell.stored_energy(),
                    )
                };
                self.clusters[cluster_key].remove_cell(cell_key);
                let grid = self.metric.grid_position(pos);
                self.cell_map.remove((grid.x, grid.y), cell_id);
                let particle = Particle {
                    id: self.ids.next_id()?,
                    pos,
                    vel,
                    energy,
                };
                self.register_particle(&particle)?;
                self.particles.insert(particle);
            }

            if self.clusters[cluster_key].cells.is_empty() {
                self.clusters.remove(cluster_key);
                continue;
            }
            if !self.clusters[cluster_key].dirty_connectivity {
                continue;
            }
            let components = self.clusters[cluster_key].components();
            if components.len() == 1 {
                let cluster = &mut self.clusters[cluster_key];
                cluster.dirty_connectivity = false;
                cluster.recenter(&self.metric);
                continue;
            }
            let Some(parent) = self.clusters.remove(cluster_key) else {
                continue;
            };
            debug!(
                cluster = parent.id,
                fragments = components.len(),
                "cluster decomposition"
            );
            // The largest component (first on ties) carries the parent's
            // identity and construction history forward; only the pieces
            // that split off become fresh clusters. A separating
            // construction therefore resets history on the detached
            // offspring alone, never on the surviving cluster.
            let mut carried = 0;
            for (index, component) in components.iter().enumerate() {
                if component.len() > components[carried].len() {
                    carried = index;
                }
            }
            for (index, component) in components.iter().enumerate() {
                let fragment = self.build_fragment(&parent, component, index == carried)?;
                self.clusters.insert(fragment);
            }
        }
        Ok(())
    }

    /// Carve one connected component out of `parent`, inheriting momentum
    /// through the fragment's center velocity.
    ///
    /// The component designated by `carries_identity` keeps the parent's id
    /// and construction history; every other fragment is a fresh cluster.
    fn build_fragment(
        &mut self,
        parent: &Cluster,
        component: &[CellKey],
        carries_identity: bool,
    ) -> Result<Cluster, CoreError> {
        let offsets: Vec<Vector2> = component
            .iter()
            .map(|key| parent.cell_offset(&parent.cells[*key]))
            .collect();
        let velocities = physics::velocities_of_center(parent.velocities(), &offsets);
        let mut mean_offset = Vector2::ZERO;
        for offset in &offsets {
            mean_offset += *offset;
        }
        mean_offset = mean_offset / offsets.len().max(1) as f64;

        let id = if carries_identity {
            parent.id
        } else {
            self.ids.next_id()?
        };
        let mut fragment = Cluster::new(id, self.metric.normalize(parent.pos + mean_offset));
        fragment.construction_started = carries_identity && parent.construction_started;
        fragment.vel = velocities.linear;
        fragment.angle = parent.angle;
        fragment.angular_vel = velocities.angular;

        let mut mapping: HashMap<CellKey, CellKey> = HashMap::with_capacity(component.len());
        for (key, offset) in component.iter().zip(offsets.iter()) {
            let mut cell = parent.cells[*key].clone();
            cell.rel_pos = (*offset - mean_offset).rotated(-parent.angle);
            let new_key = fragment.cells.insert(cell);
            mapping.insert(*key, new_key);
        }
        for new_key in mapping.values() {
            let connections = fragment.cells[*new_key]
                .connections
                .iter()
                .filter_map(|old| mapping.get(old).copied())
                .collect();
            fragment.cells[*new_key].connections = connections;
        }
        Ok(fragment)
    }

    /// Phase 7: merge particles sharing a grid location; condense slow,
    /// energy-rich particles into fresh one-cell clusters.
    fn stage_fusion(&mut self) -> Result<(), CoreError> {
        let mut groups: HashMap<(i32, i32), Vec<ParticleKey>> = HashMap::new();
        let keys: Vec<ParticleKey> = self.particles.keys().collect();
        for key in &keys {
            let grid = self.metric.grid_position(self.particles[*key].pos);
            groups.entry((grid.x, grid.y)).or_default().push(*key);
        }

        for key in &keys {
            if !self.particles.contains_key(*key) {
                continue;
            }
            let grid = self.metric.grid_position(self.particles[*key].pos);
            let Some(group) = groups.remove(&(grid.x, grid.y)) else {
                continue;
            };
            if group.len() < 2 {
                continue;
            }
            let Some(survivor_id) = group.iter().map(|member| self.particles[*member].id).min()
            else {
                continue;
            };
            let anchor = self.particles[group[0]].pos;
            let mut total_energy = 0.0;
            let mut weighted_vel = Vector2::ZERO;
            let mut weighted_offset = Vector2::ZERO;
            for member in &group {
                let particle = &self.particles[*member];
                total_energy += particle.energy;
                weighted_vel += particle.vel * particle.energy;
                weighted_offset +=
                    self.metric.displacement(anchor, particle.pos) * particle.energy;
            }
            let merged = Particle {
                id: survivor_id,
                pos: self
                    .metric
                    .normalize(anchor + weighted_offset / total_energy.max(f64::MIN_POSITIVE)),
                vel: weighted_vel / total_energy.max(f64::MIN_POSITIVE),
                energy: total_energy,
            };
            for member in group {
                self.particles.remove(member);
            }
            self.particles.insert(merged);
        }

        // Condensation: a particle that outgrew the cell threshold becomes a
        // fresh one-cell cluster, provided it is slow enough to settle.
        let keys: Vec<ParticleKey> = self.particles.keys().collect();
        for key in keys {
            let (energy, speed) = {
                let particle = &self.particles[key];
                (particle.energy, particle.vel.length())
            };
            if energy > self.params.cell_min_energy && speed < PARTICLE_TO_CELL_MAX_SPEED {
                let Some(particle) = self.particles.remove(key) else {
                    continue;
                };
                let max_connections = self
                    .rng
                    .between(2, self.params.cell_max_bonds.max(2) as u32)
                    as usize;
                let mut cluster = Cluster::new(self.ids.next_id()?, particle.pos);
                cluster.vel = particle.vel;
                cluster.cells.insert(Cell {
                    id: self.ids.next_id()?,
                    rel_pos: Vector2::ZERO,
                    energy: particle.energy,
                    max_connections,
                    connections: Vec::new(),
                    branch_number: 0,
                    token_blocked: false,
                    function: CellFunction::Computer(Default::default()),
                    tokens: Vec::new(),
                });
                self.clusters.insert(cluster);
            }
        }
        Ok(())
    }

    /// Phase 8: probabilistic energy radiation from cells into particles.
    fn stage_radiation(&mut self) -> Result<(), CoreError> {
        if self.params.radiation_prob <= 0.0 {
            return Ok(());
        }
        let cluster_keys: Vec<ClusterKey> = self.clusters.keys().collect();
        for cluster_key in cluster_keys {
            let cell_keys: Vec<CellKey> = self.clusters[cluster_key].cells.keys().collect();
            for cell_key in cell_keys {
                if !self.rng.chance(self.params.radiation_prob) {
                    continue;
                }
                let energy = self.params.radiation_energy;
                if self.clusters[cluster_key].cells[cell_key].energy <= energy {
                    continue;
                }
                let angle = self.rng.real() * 360.0;
                let direction = Vector2::unit_for_angle(angle);
                let (pos, base_vel) = {
                    let cluster = &self.clusters[cluster_key];
                    let cell = &cluster.cells[cell_key];
                    (
                        cluster.cell_position(cell, &self.metric),
                        physics::tangential_velocity(
                            cluster.cell_offset(cell),
                            cluster.velocities(),
                        ),
                    )
                };
                self.clusters[cluster_key].cells[cell_key].energy -= energy;
                let particle = Particle {
                    id: self.ids.next_id()?,
                    pos: self.metric.normalize(pos + direction * 0.5),
                    vel: base_vel + direction * RADIATION_SPEED,
                    energy,
                };
                self.register_particle(&particle)?;
                self.particles.insert(particle);
            }
        }
        Ok(())
    }

    fn check_energy(&self) -> Result<(), CoreError> {
        for cluster in self.clusters.values() {
            for cell in cluster.cells.values() {
                if cell.energy < 0.0 {
                    return Err(CoreError::NegativeEnergy {
                        id: cell.id,
                        energy: cell.energy,
                    });
                }
                for tok in &cell.tokens {
                    if tok.energy < 0.0 {
                        return Err(CoreError::NegativeEnergy {
                            id: cell.id,
                            energy: tok.energy,
                        });
                    }
                }
            }
        }
        for particle in self.particles.values() {
            if particle.energy < 0.0 {
                return Err(CoreError::NegativeEnergy {
                    id: particle.id,
                    energy: particle.energy,
                });
            }
        }
        Ok(())
    }

    /// Run one full timestep of this shard.
    pub fn step(&mut self, hood: &Neighborhood) -> Result<(), CoreError> {
        self.stage_refresh()?;
        self.stage_collisions(hood);
        self.stage_motion();
        self.stage_transfer(hood)?;
        self.refresh_maps()?;
        self.stage_cell_functions(hood)?;
        self.stage_decomposition()?;
        self.stage_fusion()?;
        self.stage_radiation()?;
        self.check_energy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptions::{CellDescription, CellFunctionDescription, ClusterDescription};
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    fn test_unit(universe: i32) -> Unit {
        let metric = SpaceMetric::new(IntVector2::new(universe, universe));
        let compartment = Compartment::new(
            IntRect::new(IntVector2::new(0, 0), IntVector2::new(universe, universe)),
            [0; 8],
        );
        let mut master = SmallRng::seed_from_u64(99);
        Unit::new(
            0,
            1,
            compartment,
            metric,
            SimulationParameters::default(),
            SymbolTable::new(),
            RandomRing::with_len(&mut master, 1024),
            IdAllocator::new(1),
        )
    }

    fn chain_description(params: &SimulationParameters) -> ClusterDescription {
        let token_energy = 2.0 * params.token_min_energy
            + 2.0 * params.cell_function_constructor_offspring_cell_energy;
        let mut token = Token::new(token_energy, params.token_memory_size);
        token.write(token::constr::IN, 1); // SAFE

        let mut sender = CellDescription::new(0, Vector2::new(10.5, 10.5), 100.0);
        sender.max_connections = 2;
        sender.branch_number = 0;
        sender.connections = vec![2];
        sender.tokens.push(token);

        let mut builder = CellDescription::new(0, Vector2::new(11.5, 10.5), 100.0);
        builder.max_connections = 2;
        builder.branch_number = 1;
        builder.connections = vec![1];
        builder.function = CellFunctionDescription::with_kind(CellFunctionKind::Constructor);

        sender.id = 1;
        builder.id = 2;
        ClusterDescription {
            id: 10,
            pos: Vector2::new(11.0, 10.5),
            vel: Vector2::ZERO,
            angle: 0.0,
            angular_vel: 0.0,
            cells: vec![sender, builder],
        }
    }

    #[test]
    fn token_moves_one_branch_step_and_builds() {
        let mut unit = test_unit(100);
        let mut params = SimulationParameters::default();
        params.cell_function_constructor_offspring_cell_distance = 1.0;
        params.radiation_prob = 0.0;
        unit.set_parameters(params.clone());

        let desc = chain_description(&params);
        let cluster =
            Cluster::from_description(&desc, &params, &SpaceMetric::new(IntVector2::new(100, 100)))
                .expect("cluster");
        unit.insert_cluster(cluster);

        let hood = Neighborhood::default();
        let energy_before = unit.total_energy();
        unit.step(&hood).expect("step");

        let cluster = unit.clusters().values().next().expect("cluster survives");
        assert_eq!(cluster.cells.len(), 3);
        let offspring = cluster
            .cells
            .values()
            .find(|cell| cell.id != 1 && cell.id != 2)
            .expect("offspring");
        assert!(offspring.token_blocked);
        let pos = cluster.cell_position(offspring, &SpaceMetric::new(IntVector2::new(100, 100)));
        assert!((pos.x - 12.5).abs() < 1e-9);
        assert!((pos.y - 10.5).abs() < 1e-9);

        // The command token sits on the constructor with the success code.
        let builder = cluster.cells.values().find(|cell| cell.id == 2).expect("builder");
        assert_eq!(builder.tokens.len(), 1);
        assert_eq!(builder.tokens[0].read(token::constr::OUT), 0);

        let energy_after = unit.total_energy();
        assert!((energy_before - energy_after).abs() < 1e-6);
    }

    #[test]
    fn token_without_successor_is_absorbed() {
        let mut unit = test_unit(100);
        let mut params = SimulationParameters::default();
        params.radiation_prob = 0.0;
        unit.set_parameters(params.clone());

        let metric = SpaceMetric::new(IntVector2::new(100, 100));
        let mut desc = chain_description(&params);
        // Lone cell: no branch successor anywhere.
        desc.cells.truncate(1);
        desc.cells[0].connections.clear();
        let cluster = Cluster::from_description(&desc, &params, &metric).expect("cluster");
        unit.insert_cluster(cluster);

        let hood = Neighborhood::default();
        let before = unit.total_energy();
        unit.step(&hood).expect("step");
        let cluster = unit.clusters().values().next().expect("cluster");
        let cell = cluster.cells.values().next().expect("cell");
        assert!(cell.tokens.is_empty());
        assert!((unit.total_energy() - before).abs() < 1e-9);
    }

    #[test]
    fn weak_cell_decomposes_line_into_two_clusters() {
        let mut unit = test_unit(300);
        let mut params = SimulationParameters::default();
        params.radiation_prob = 0.0;
        unit.set_parameters(params.clone());
        let metric = SpaceMetric::new(IntVector2::new(300, 300));

        let mut cells = Vec::new();
        for i in 0..5 {
            let mut cell = CellDescription::new(
                100 + i as u64,
                Vector2::new(98.0 + i as f64, 100.0),
                if i == 2 {
                    params.cell_min_energy / 2.0
                } else {
                    params.cell_min_energy * 2.0
                },
            );
            cell.max_connections = 2;
            if i > 0 {
                cell.connections.push(100 + i as u64 - 1);
            }
            if i < 4 {
                cell.connections.push(100 + i as u64 + 1);
            }
            cells.push(cell);
        }
        let desc = ClusterDescription {
            id: 50,
            pos: Vector2::new(100.0, 100.0),
            vel: Vector2::ZERO,
            angle: 0.0,
            angular_vel: 0.0,
            cells,
        };
        let cluster = Cluster::from_description(&desc, &params, &metric).expect("cluster");
        unit.insert_cluster(cluster);

        unit.step(&Neighborhood::default()).expect("step");

        assert_eq!(unit.clusters().len(), 2);
        let mut sizes: Vec<usize> = unit
            .clusters()
            .values()
            .map(|cluster| cluster.cells.len())
            .collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![2, 2]);
        // The starved cell's energy survives as a particle.
        assert_eq!(unit.particles().len(), 1);
        let particle = unit.particles().values().next().expect("particle");
        assert!((particle.energy - params.cell_min_energy / 2.0).abs() < 1e-9);
    }

    #[test]
    fn coinciding_particles_fuse_with_energy_weighted_velocity() {
        let mut unit = test_unit(300);
        let mut params = SimulationParameters::default();
        params.radiation_prob = 0.0;
        unit.set_parameters(params);

        unit.insert_particle(Particle {
            id: 1,
            pos: Vector2::new(100.2, 100.2),
            vel: Vector2::new(0.5, 0.0),
            energy: 10.0,
        });
        unit.insert_particle(Particle {
            id: 2,
            pos: Vector2::new(100.7, 100.2),
            vel: Vector2::new(-0.5, 0.0),
            energy: 30.0,
        });

        unit.step(&Neighborhood::default()).expect("step");

        assert_eq!(unit.particles().len(), 1);
        let merged = unit.particles().values().next().expect("merged");
        assert_eq!(merged.id, 1);
        assert!((merged.energy - 40.0).abs() < 1e-9);
        // (10 * 0.5 + 30 * -0.5) / 40 = -0.25
        assert!((merged.vel.x + 0.25).abs() < 1e-9);
    }

    /// Chain of two cells at `y = 50`: a token sender at `x` and a cell of
    /// the given function at `x + 1`, branch 1, primed with `token`.
    fn armed_pair(
        unit: &mut Unit,
        cluster_id: u64,
        x: f64,
        function: CellFunctionDescription,
        token: Token,
    ) {
        let mut sender = CellDescription::new(cluster_id * 10 + 1, Vector2::new(x, 50.0), 100.0);
        sender.max_connections = 2;
        sender.connections = vec![cluster_id * 10 + 2];
        sender.tokens.push(token);
        let mut active = CellDescription::new(cluster_id * 10 + 2, Vector2::new(x + 1.0, 50.0), 100.0);
        active.max_connections = 2;
        active.branch_number = 1;
        active.connections = vec![cluster_id * 10 + 1];
        active.function = function;
        let desc = ClusterDescription {
            id: cluster_id,
            pos: Vector2::new(x + 0.5, 50.0),
            vel: Vector2::ZERO,
            angle: 0.0,
            angular_vel: 0.0,
            cells: vec![sender, active],
        };
        let params = unit.params().clone();
        let metric = SpaceMetric::new(IntVector2::new(300, 300));
        let cluster = Cluster::from_description(&desc, &params, &metric).expect("cluster");
        unit.insert_cluster(cluster);
    }

    fn lone_foreign_cell(unit: &mut Unit, cluster_id: u64, pos: Vector2) {
        let mut cell = CellDescription::new(cluster_id * 10 + 1, pos, 100.0);
        cell.max_connections = 2;
        let desc = ClusterDescription {
            id: cluster_id,
            pos,
            vel: Vector2::ZERO,
            angle: 0.0,
            angular_vel: 0.0,
            cells: vec![cell],
        };
        let params = unit.params().clone();
        let metric = SpaceMetric::new(IntVector2::new(300, 300));
        let cluster = Cluster::from_description(&desc, &params, &metric).expect("cluster");
        unit.insert_cluster(cluster);
    }

    #[test]
    fn weapon_drains_foreign_cells_into_the_attacker() {
        let mut unit = test_unit(300);
        let mut params = SimulationParameters::default();
        params.radiation_prob = 0.0;
        unit.set_parameters(params.clone());

        armed_pair(
            &mut unit,
            2,
            50.0,
            CellFunctionDescription::with_kind(CellFunctionKind::Weapon),
            Token::new(10.0, params.token_memory_size),
        );
        // Victim one unit to the right of the weapon cell.
        lone_foreign_cell(&mut unit, 4, Vector2::new(52.0, 50.0));

        let before = unit.total_energy();
        unit.step(&Neighborhood::default()).expect("step");

        let victim = unit
            .clusters()
            .values()
            .find(|cluster| cluster.id != 2)
            .and_then(|cluster| cluster.cells.values().next())
            .expect("victim");
        assert!((victim.energy - 90.0).abs() < 1e-9);
        let attacker = unit
            .clusters()
            .values()
            .find(|cluster| cluster.id == 2)
            .and_then(|cluster| cluster.cells.values().find(|cell| cell.id == 22))
            .expect("attacker");
        assert!((attacker.energy - 110.0).abs() < 1e-9);
        assert!((unit.total_energy() - before).abs() < 1e-9);
    }

    #[test]
    fn sensor_reports_the_nearest_foreign_cell() {
        let mut unit = test_unit(300);
        let mut params = SimulationParameters::default();
        params.radiation_prob = 0.0;
        unit.set_parameters(params.clone());

        armed_pair(
            &mut unit,
            2,
            50.0,
            CellFunctionDescription::with_kind(CellFunctionKind::Sensor),
            Token::new(10.0, params.token_memory_size),
        );
        // Two foreign markers; the sensor must pick the closer one at +x.
        lone_foreign_cell(&mut unit, 4, Vector2::new(54.0, 50.0));
        lone_foreign_cell(&mut unit, 6, Vector2::new(51.0, 56.0));

        unit.step(&Neighborhood::default()).expect("step");

        let sensor = unit
            .clusters()
            .values()
            .find(|cluster| cluster.id == 2)
            .and_then(|cluster| cluster.cells.values().find(|cell| cell.id == 22))
            .expect("sensor cell");
        let tok = sensor.tokens.first().expect("token on sensor");
        assert_eq!(tok.read(token::sensor::OUT_DETECTED), 1);
        assert_eq!(tok.read(token::sensor::OUT_ANGLE), token::encode_angle(90.0));
        assert_eq!(
            tok.read(token::sensor::OUT_DISTANCE),
            token::encode_distance(3.0)
        );
    }

    #[test]
    fn communicators_broadcast_within_range() {
        let mut unit = test_unit(300);
        let mut params = SimulationParameters::default();
        params.radiation_prob = 0.0;
        unit.set_parameters(params.clone());

        let mut command = Token::new(10.0, params.token_memory_size);
        command.write(token::communicator::IN_MESSAGE, 0xA5);
        armed_pair(
            &mut unit,
            2,
            50.0,
            CellFunctionDescription::with_kind(CellFunctionKind::Communicator),
            command,
        );
        // A listening communicator in a foreign cluster, in range.
        let mut listener = CellDescription::new(41, Vector2::new(55.0, 50.0), 100.0);
        listener.max_connections = 2;
        listener.function =
            CellFunctionDescription::with_kind(CellFunctionKind::Communicator);
        let desc = ClusterDescription {
            id: 4,
            pos: Vector2::new(55.0, 50.0),
            vel: Vector2::ZERO,
            angle: 0.0,
            angular_vel: 0.0,
            cells: vec![listener],
        };
        let metric = SpaceMetric::new(IntVector2::new(300, 300));
        let cluster = Cluster::from_description(&desc, &params, &metric).expect("cluster");
        unit.insert_cluster(cluster);

        unit.step(&Neighborhood::default()).expect("step");

        let listener = unit
            .clusters()
            .values()
            .find(|cluster| cluster.id == 4)
            .and_then(|cluster| cluster.cells.values().next())
            .expect("listener");
        let CellFunction::Communicator(state) = &listener.function else {
            panic!("listener kept its function");
        };
        assert_eq!(state.received, 0xA5);
    }

    #[test]
    fn radiation_deducts_what_the_particle_carries() {
        let mut unit = test_unit(100);
        let mut params = SimulationParameters::default();
        params.radiation_prob = 1.0;
        params.radiation_energy = 2.0;
        unit.set_parameters(params.clone());
        let metric = SpaceMetric::new(IntVector2::new(100, 100));

        let mut desc = chain_description(&params);
        desc.cells[0].tokens.clear();
        let cluster = Cluster::from_description(&desc, &params, &metric).expect("cluster");
        unit.insert_cluster(cluster);

        let before = unit.total_energy();
        unit.step(&Neighborhood::default()).expect("step");
        assert_eq!(unit.particles().len(), 2);
        // Kinetic energy of the emitted particles is not booked as stored
        // energy; stored totals must still balance.
        let stored_after: f64 = unit
            .clusters()
            .values()
            .map(Cluster::stored_energy)
            .sum::<f64>()
            + unit.particles().values().map(|p| p.energy).sum::<f64>();
        assert!((stored_after - before).abs() < 1e-9);
    }
}
