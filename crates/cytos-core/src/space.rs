//! Toroidal coordinate arithmetic and compartment geometry.
//!
//! All downstream geometry (collision, construction, neighbor selection)
//! goes through [`SpaceMetric`] rather than raw subtraction, so wrap-around
//! at the universe edges is handled in exactly one place.

use crate::vector::Vector2;
use serde::{Deserialize, Serialize};

/// Integer 2D vector (grid positions, universe and grid sizes).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct IntVector2 {
    pub x: i32,
    pub y: i32,
}

impl IntVector2 {
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned integer rectangle: `min` inclusive, `max` exclusive.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntRect {
    pub min: IntVector2,
    pub max: IntVector2,
}

impl IntRect {
    #[must_use]
    pub const fn new(min: IntVector2, max: IntVector2) -> Self {
        Self { min, max }
    }

    /// Whether a (normalized) world position lies inside the rectangle.
    ///
    /// Inclusive on the `-x`/`-y` edges, exclusive on `+x`/`+y`.
    #[must_use]
    pub fn contains(&self, pos: Vector2) -> bool {
        pos.x >= f64::from(self.min.x)
            && pos.x < f64::from(self.max.x)
            && pos.y >= f64::from(self.min.y)
            && pos.y < f64::from(self.max.y)
    }

    /// Whether an integer grid location lies inside the rectangle.
    #[must_use]
    pub fn contains_grid(&self, grid: IntVector2) -> bool {
        grid.x >= self.min.x && grid.x < self.max.x && grid.y >= self.min.y && grid.y < self.max.y
    }
}

/// Relative location of one of the eight neighbor shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelativeLocation {
    UpperLeft,
    Upper,
    UpperRight,
    Left,
    Right,
    LowerLeft,
    Lower,
    LowerRight,
}

impl RelativeLocation {
    pub const ALL: [Self; 8] = [
        Self::UpperLeft,
        Self::Upper,
        Self::UpperRight,
        Self::Left,
        Self::Right,
        Self::LowerLeft,
        Self::Lower,
        Self::LowerRight,
    ];

    /// Grid-coordinate delta of this location.
    #[must_use]
    pub const fn delta(self) -> IntVector2 {
        match self {
            Self::UpperLeft => IntVector2::new(-1, -1),
            Self::Upper => IntVector2::new(0, -1),
            Self::UpperRight => IntVector2::new(1, -1),
            Self::Left => IntVector2::new(-1, 0),
            Self::Right => IntVector2::new(1, 0),
            Self::LowerLeft => IntVector2::new(-1, 1),
            Self::Lower => IntVector2::new(0, 1),
            Self::LowerRight => IntVector2::new(1, 1),
        }
    }
}

/// Ownership region of one shard: its rectangle plus the linear indices of
/// the eight neighbor shards, keyed by [`RelativeLocation`] order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Compartment {
    pub rect: IntRect,
    pub neighbors: [usize; 8],
}

impl Compartment {
    #[must_use]
    pub const fn new(rect: IntRect, neighbors: [usize; 8]) -> Self {
        Self { rect, neighbors }
    }

    /// Neighbor shard index at `location`.
    #[must_use]
    pub fn neighbor(&self, location: RelativeLocation) -> usize {
        let slot = RelativeLocation::ALL
            .iter()
            .position(|candidate| *candidate == location)
            .unwrap_or(0);
        self.neighbors[slot]
    }
}

/// Toroidal metric of the universe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SpaceMetric {
    width: f64,
    height: f64,
}

impl SpaceMetric {
    #[must_use]
    pub fn new(size: IntVector2) -> Self {
        Self {
            width: f64::from(size.x),
            height: f64::from(size.y),
        }
    }

    #[must_use]
    pub fn size(&self) -> IntVector2 {
        IntVector2::new(self.width as i32, self.height as i32)
    }

    /// Reduce a position into `[0, width) x [0, height)`.
    #[must_use]
    pub fn normalize(&self, pos: Vector2) -> Vector2 {
        Vector2::new(pos.x.rem_euclid(self.width), pos.y.rem_euclid(self.height))
    }

    /// Shortest vector from `a` to `b` on the torus.
    ///
    /// Each axis independently picks the signed wrap with minimal magnitude;
    /// exact ties break toward the positive direction.
    #[must_use]
    pub fn displacement(&self, a: Vector2, b: Vector2) -> Vector2 {
        Vector2::new(
            Self::axis_displacement(a.x, b.x, self.width),
            Self::axis_displacement(a.y, b.y, self.height),
        )
    }

    /// Toroidal distance between two positions.
    #[must_use]
    pub fn distance(&self, a: Vector2, b: Vector2) -> f64 {
        self.displacement(a, b).length()
    }

    /// Toroidal midpoint between `a` and `b` (halfway along the shortest path).
    #[must_use]
    pub fn midpoint(&self, a: Vector2, b: Vector2) -> Vector2 {
        self.normalize(a + self.displacement(a, b) * 0.5)
    }

    /// Integer grid location of a world position.
    #[must_use]
    pub fn grid_position(&self, pos: Vector2) -> IntVector2 {
        let normalized = self.normalize(pos);
        IntVector2::new(normalized.x.floor() as i32, normalized.y.floor() as i32)
    }

    /// Wrap an integer grid location into the universe.
    #[must_use]
    pub fn wrap_grid(&self, grid: IntVector2) -> IntVector2 {
        let w = self.width as i32;
        let h = self.height as i32;
        IntVector2::new(grid.x.rem_euclid(w), grid.y.rem_euclid(h))
    }

    fn axis_displacement(a: f64, b: f64, extent: f64) -> f64 {
        let mut delta = (b - a).rem_euclid(extent);
        if delta > extent / 2.0 {
            delta -= extent;
        }
        // A remaining value of exactly +extent/2 is the positive tie choice.
        delta
    }
}
