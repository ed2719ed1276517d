//! 2D vector arithmetic with the simulation's degree-based angle convention.
//!
//! Angle zero points along `(0, -1)`; angles grow toward `(1, 0)` at 90
//! degrees. [`Vector2::unit_for_angle`] and [`Vector2::angle`] are inverses
//! under that convention, and [`Vector2::rotated`] composes with it:
//! `unit_for_angle(a).rotated(b) == unit_for_angle(a + b)`.

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

const DEG_TO_RAD: f64 = std::f64::consts::PI / 180.0;
const RAD_TO_DEG: f64 = 180.0 / std::f64::consts::PI;

/// A 2D world-space vector.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Vector2 {
    pub x: f64,
    pub y: f64,
}

impl Vector2 {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };

    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[must_use]
    pub fn length(self) -> f64 {
        self.length_squared().sqrt()
    }

    #[must_use]
    pub fn length_squared(self) -> f64 {
        self.x * self.x + self.y * self.y
    }

    #[must_use]
    pub fn dot(self, other: Self) -> f64 {
        self.x * other.x + self.y * other.y
    }

    /// Scalar 2D cross product (`z` component of the 3D cross product).
    #[must_use]
    pub fn cross(self, other: Self) -> f64 {
        self.x * other.y - self.y * other.x
    }

    /// Quarter turn in the direction of growing angles.
    #[must_use]
    pub fn perpendicular(self) -> Self {
        Self::new(-self.y, self.x)
    }

    /// Unit vector in the same direction, or zero for a (near-)zero vector.
    #[must_use]
    pub fn normalized(self) -> Self {
        let len = self.length();
        if len < 1e-12 {
            Self::ZERO
        } else {
            self / len
        }
    }

    /// Rotate by `angle` degrees.
    #[must_use]
    pub fn rotated(self, angle: f64) -> Self {
        let (sin, cos) = (angle * DEG_TO_RAD).sin_cos();
        Self::new(self.x * cos - self.y * sin, self.x * sin + self.y * cos)
    }

    /// Unit vector for an angle in degrees.
    #[must_use]
    pub fn unit_for_angle(angle: f64) -> Self {
        let (sin, cos) = (angle * DEG_TO_RAD).sin_cos();
        Self::new(sin, -cos)
    }

    /// Angle of this vector in degrees, normalized to `[0, 360)`.
    ///
    /// Inverse of [`Vector2::unit_for_angle`]; the zero vector maps to 0.
    #[must_use]
    pub fn angle(self) -> f64 {
        if self.length_squared() < 1e-24 {
            return 0.0;
        }
        let deg = self.x.atan2(-self.y) * RAD_TO_DEG;
        deg.rem_euclid(360.0)
    }
}

impl Add for Vector2 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl AddAssign for Vector2 {
    fn add_assign(&mut self, rhs: Self) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl Sub for Vector2 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl SubAssign for Vector2 {
    fn sub_assign(&mut self, rhs: Self) {
        self.x -= rhs.x;
        self.y -= rhs.y;
    }
}

impl Mul<f64> for Vector2 {
    type Output = Self;
    fn mul(self, rhs: f64) -> Self {
        Self::new(self.x * rhs, self.y * rhs)
    }
}

impl Div<f64> for Vector2 {
    type Output = Self;
    fn div(self, rhs: f64) -> Self {
        Self::new(self.x / rhs, self.y / rhs)
    }
}

impl Neg for Vector2 {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.x, -self.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Vector2, b: Vector2) -> bool {
        (a - b).length() < 1e-9
    }

    #[test]
    fn angle_convention_round_trips() {
        assert!(close(Vector2::unit_for_angle(0.0), Vector2::new(0.0, -1.0)));
        assert!(close(Vector2::unit_for_angle(90.0), Vector2::new(1.0, 0.0)));
        assert!(close(Vector2::unit_for_angle(180.0), Vector2::new(0.0, 1.0)));
        assert!(close(Vector2::unit_for_angle(270.0), Vector2::new(-1.0, 0.0)));

        for deg in [0.0, 33.5, 90.0, 180.0, 250.25, 359.0] {
            let v = Vector2::unit_for_angle(deg);
            assert!((v.angle() - deg).abs() < 1e-9, "angle {deg}");
        }
    }

    #[test]
    fn rotation_composes_with_angles() {
        let v = Vector2::unit_for_angle(40.0).rotated(75.0);
        assert!(close(v, Vector2::unit_for_angle(115.0)));
        let w = Vector2::new(3.0, -4.0);
        assert!((w.rotated(360.0).x - w.x).abs() < 1e-9);
        assert!((w.rotated(90.0).dot(w)).abs() < 1e-9);
    }

    #[test]
    fn perpendicular_matches_rotation_derivative() {
        let r = Vector2::new(2.0, 1.0);
        assert!(close(r.perpendicular(), r.rotated(90.0)));
        assert_eq!(r.cross(r.perpendicular()), r.length_squared());
    }

    #[test]
    fn normalized_handles_zero() {
        assert_eq!(Vector2::ZERO.normalized(), Vector2::ZERO);
        let n = Vector2::new(0.0, 5.0).normalized();
        assert!(close(n, Vector2::new(0.0, 1.0)));
    }
}
