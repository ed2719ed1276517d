//! Rigid-body helpers for cell clusters.
//!
//! A cluster is a rigid body with unit mass per cell; its angular mass is
//! the sum of squared cell offsets from the center. Angular velocity is
//! stored in degrees per timestep and converted to radians only inside
//! these helpers.

use crate::vector::Vector2;

const DEG_TO_RAD: f64 = std::f64::consts::PI / 180.0;
const RAD_TO_DEG: f64 = 180.0 / std::f64::consts::PI;

/// Linear plus angular velocity of a rigid body (angular in deg/step).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Velocities {
    pub linear: Vector2,
    pub angular: f64,
}

/// Kinematic state of one colliding body.
#[derive(Debug, Clone, Copy)]
pub struct BodyState {
    pub velocities: Velocities,
    pub mass: f64,
    pub angular_mass: f64,
}

/// Velocity changes produced by one resolved collision.
#[derive(Debug, Clone, Copy)]
pub struct CollisionResponse {
    pub delta_a: Velocities,
    pub delta_b: Velocities,
}

/// Angular mass of unit-mass points at the given offsets from the center.
pub fn angular_mass(rel_positions: impl IntoIterator<Item = Vector2>) -> f64 {
    rel_positions
        .into_iter()
        .map(Vector2::length_squared)
        .sum()
}

/// Kinetic energy of a rigid body.
#[must_use]
pub fn kinetic_energy(mass: f64, vel: Vector2, angular_mass: f64, angular_vel: f64) -> f64 {
    let omega = angular_vel * DEG_TO_RAD;
    0.5 * mass * vel.length_squared() + 0.5 * angular_mass * omega * omega
}

/// Velocity of the material point at offset `rel` from the body center.
#[must_use]
pub fn tangential_velocity(rel: Vector2, velocities: Velocities) -> Vector2 {
    velocities.linear + rel.perpendicular() * (velocities.angular * DEG_TO_RAD)
}

/// Velocities inherited by a fragment of a rigid body.
///
/// The fragment's center is the mean of `rel_positions` (offsets from the
/// parent center); it keeps the parent's spin and picks up the parent's
/// tangential velocity at that center, which preserves total linear and
/// angular momentum across a decomposition.
#[must_use]
pub fn velocities_of_center(parent: Velocities, rel_positions: &[Vector2]) -> Velocities {
    if rel_positions.is_empty() {
        return parent;
    }
    let mut center = Vector2::ZERO;
    for rel in rel_positions {
        center += *rel;
    }
    center = center / rel_positions.len() as f64;
    Velocities {
        linear: tangential_velocity(center, parent),
        angular: parent.angular,
    }
}

/// Elastic impulse between two rigid bodies.
///
/// `normal` must be the unit contact normal pointing toward body `a`;
/// `r_a`/`r_b` are the offsets from each body's center to the contact
/// point. Returns `None` when the bodies are already separating. With
/// restitution 1 the normal component of the relative contact velocity
/// reverses and kinetic energy is conserved.
#[must_use]
pub fn resolve_collision(
    a: &BodyState,
    r_a: Vector2,
    b: &BodyState,
    r_b: Vector2,
    normal: Vector2,
) -> Option<CollisionResponse> {
    let contact_vel_a = tangential_velocity(r_a, a.velocities);
    let contact_vel_b = tangential_velocity(r_b, b.velocities);
    let approach = (contact_vel_a - contact_vel_b).dot(normal);
    if approach >= 0.0 {
        return None;
    }

    let cross_a = r_a.cross(normal);
    let cross_b = r_b.cross(normal);
    let mut denominator = 1.0 / a.mass + 1.0 / b.mass;
    if a.angular_mass > 0.0 {
        denominator += cross_a * cross_a / a.angular_mass;
    }
    if b.angular_mass > 0.0 {
        denominator += cross_b * cross_b / b.angular_mass;
    }
    let impulse = -2.0 * approach / denominator;

    let delta_a = Velocities {
        linear: normal * (impulse / a.mass),
        angular: if a.angular_mass > 0.0 {
            cross_a * impulse / a.angular_mass * RAD_TO_DEG
        } else {
            0.0
        },
    };
    let delta_b = Velocities {
        linear: -normal * (impulse / b.mass),
        angular: if b.angular_mass > 0.0 {
            -cross_b * impulse / b.angular_mass * RAD_TO_DEG
        } else {
            0.0
        },
    };
    Some(CollisionResponse { delta_a, delta_b })
}
