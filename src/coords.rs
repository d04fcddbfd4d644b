//! Tile identities and the coordinate algebra the renderer relies on.
//!
//! Three identity types cover the three distinct concerns of a tiled map:
//!
//! * [`CanonicalTileId`] names a tile of the main tile pyramid and is used for
//!   requesting data. All tiles derive from `0/0/0`; there are no tiles
//!   outside the pyramid.
//! * [`OverscaledTileId`] names the data of a canonical tile rendered as if it
//!   belonged to a (possibly deeper) zoom level. This is the data-fetch and
//!   bucket identity.
//! * [`UnwrappedTileId`] names a placement in world space, where `wrap` counts
//!   full-world repetitions when panning across the antimeridian. Several
//!   unwrapped ids (differing in `wrap`) can share one overscaled id's data.

use std::{
    fmt,
    fmt::{Display, Formatter},
};

use cgmath::{Matrix4, Vector3};
use serde::{Deserialize, Serialize};

/// Tiles use a local coordinate system within `[0, EXTENT)`.
pub const EXTENT_UINT: u32 = 4096;
pub const EXTENT: f64 = EXTENT_UINT as f64;
/// Logical size of a rendered tile in pixels.
pub const TILE_SIZE: f64 = 512.0;
pub const MAX_ZOOM: u8 = 32;

/// Names one tile of the main tile pyramid.
///
/// Total order and hashing are lexicographic on `(z, x, y)`, so these can be
/// used directly as ordered map keys.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CanonicalTileId {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl CanonicalTileId {
    /// Precondition: `z <= 32` and `x, y < 2^z`. Violations are programming
    /// errors and only checked in debug builds.
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        debug_assert!(z <= MAX_ZOOM);
        debug_assert!((x as u64) < 1u64 << z);
        debug_assert!((y as u64) < 1u64 << z);
        Self { z, x, y }
    }

    /// Whether `self` lies underneath `parent` in the tile pyramid.
    pub fn is_child_of(&self, parent: &CanonicalTileId) -> bool {
        // Test z == 0 first to avoid a 32-bit shift, which would overflow.
        parent.z == 0
            || (parent.z < self.z
                && parent.x == self.x >> (self.z - parent.z)
                && parent.y == self.y >> (self.z - parent.z))
    }

    /// The ancestor at `target_z` when zooming out, or the `(0, 0)` descendant
    /// when zooming in. Note that this picks one descendant, not all of them.
    pub fn scaled_to(&self, target_z: u8) -> CanonicalTileId {
        if target_z <= self.z {
            CanonicalTileId::new(target_z, self.x >> (self.z - target_z), self.y >> (self.z - target_z))
        } else {
            CanonicalTileId::new(target_z, self.x << (target_z - self.z), self.y << (target_z - self.z))
        }
    }

    /// The four direct children, always in the fixed order
    /// `(0,0), (0,1), (1,0), (1,1)` offset from `(2x, 2y)`.
    pub fn children(&self) -> [CanonicalTileId; 4] {
        let z = self.z + 1;
        let x = self.x * 2;
        let y = self.y * 2;
        [
            CanonicalTileId::new(z, x, y),
            CanonicalTileId::new(z, x, y + 1),
            CanonicalTileId::new(z, x + 1, y),
            CanonicalTileId::new(z, x + 1, y + 1),
        ]
    }
}

impl Display for CanonicalTileId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Names the data of a canonical tile rendered as if it belonged to zoom
/// level `overscaled_z`.
///
/// Overscaling stands a lower-zoom tile's data in for a not-yet-loaded
/// higher-zoom tile. Field order gives the `(overscaled_z, wrap, canonical)`
/// lexicographic total order.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OverscaledTileId {
    pub overscaled_z: u8,
    pub wrap: i16,
    pub canonical: CanonicalTileId,
}

impl OverscaledTileId {
    /// Precondition: `overscaled_z >= canonical.z`.
    pub fn new(overscaled_z: u8, wrap: i16, canonical: CanonicalTileId) -> Self {
        debug_assert!(overscaled_z >= canonical.z);
        Self {
            overscaled_z,
            wrap,
            canonical,
        }
    }

    /// An id that is not overscaled and not wrapped.
    pub fn from_canonical(canonical: CanonicalTileId) -> Self {
        Self::new(canonical.z, 0, canonical)
    }

    /// How many times the canonical tile's data is magnified: `2^(overscaled_z - canonical.z)`.
    pub fn overscale_factor(&self) -> u32 {
        1u32 << (self.overscaled_z - self.canonical.z)
    }

    pub fn is_child_of(&self, parent: &OverscaledTileId) -> bool {
        self.wrap == parent.wrap
            && self.overscaled_z > parent.overscaled_z
            && (self.canonical == parent.canonical || self.canonical.is_child_of(&parent.canonical))
    }

    /// Rescales to `target_z`. Canonical coordinates only shrink; overscaling
    /// absorbs any zoom beyond the canonical level.
    pub fn scaled_to(&self, target_z: u8) -> OverscaledTileId {
        OverscaledTileId::new(
            target_z,
            self.wrap,
            if target_z >= self.canonical.z {
                self.canonical
            } else {
                self.canonical.scaled_to(target_z)
            },
        )
    }

    pub fn to_unwrapped(&self) -> UnwrappedTileId {
        UnwrappedTileId::new(self.wrap, self.canonical)
    }

    pub fn unwrap_to(&self, wrap: i16) -> OverscaledTileId {
        OverscaledTileId::new(self.overscaled_z, wrap, self.canonical)
    }
}

impl Display for OverscaledTileId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{} => {}", self.canonical.z, self.canonical.x, self.canonical.y, self.overscaled_z)
    }
}

/// Names a placement in world space. `wrap` counts full-world repetitions to
/// the east (positive) or west (negative) of the main pyramid.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct UnwrappedTileId {
    pub wrap: i16,
    pub canonical: CanonicalTileId,
}

impl UnwrappedTileId {
    pub fn new(wrap: i16, canonical: CanonicalTileId) -> Self {
        Self { wrap, canonical }
    }

    /// Construct from signed world tile coordinates. Negative or overflowing
    /// `x` wraps around the antimeridian; `y` is clamped into `[0, 2^z - 1]`
    /// because a Mercator map never wraps vertically.
    pub fn from_world(z: u8, x: i64, y: i64) -> Self {
        let world_size = 1i64 << z;
        // Floor division for x so that -1 maps to wrap -1, not 0.
        let wrap = ((if x < 0 { x - world_size + 1 } else { x }) / world_size) as i16;
        let canonical_x = (x - wrap as i64 * world_size) as u32;
        let canonical_y = y.clamp(0, world_size - 1) as u32;
        Self::new(wrap, CanonicalTileId::new(z, canonical_x, canonical_y))
    }

    pub fn is_child_of(&self, parent: &UnwrappedTileId) -> bool {
        self.wrap == parent.wrap && self.canonical.is_child_of(&parent.canonical)
    }

    /// The four direct children, in the same fixed order as
    /// [`CanonicalTileId::children`], all sharing this id's `wrap`.
    pub fn children(&self) -> [UnwrappedTileId; 4] {
        self.canonical
            .children()
            .map(|child| UnwrappedTileId::new(self.wrap, child))
    }

    /// Precondition: `overscaled_z >= canonical.z`.
    pub fn overscale_to(&self, overscaled_z: u8) -> OverscaledTileId {
        OverscaledTileId::new(overscaled_z, self.wrap, self.canonical)
    }

    pub fn unwrap_to(&self, wrap: i16) -> UnwrappedTileId {
        UnwrappedTileId::new(wrap, self.canonical)
    }

    /// Converts a screen-pixel length into tile units at the given zoom.
    pub fn pixels_to_tile_units(&self, pixel_value: f64, zoom: f64) -> f64 {
        pixel_value * (EXTENT / (TILE_SIZE * 2.0_f64.powf(zoom - self.canonical.z as f64)))
    }

    /// The transform placing this tile in the world for the given zoom,
    /// normalizing tile-local coordinates from `[0, EXTENT)`.
    pub fn transform_for_zoom(&self, zoom: f64) -> Matrix4<f64> {
        let z = self.canonical.z;
        let tile_scale = TILE_SIZE * 2.0_f64.powf(z as f64 - zoom);
        let world_x = self.canonical.x as f64 + self.wrap as f64 * (1u64 << z) as f64;

        let translate = Matrix4::from_translation(Vector3::new(
            world_x * tile_scale,
            self.canonical.y as f64 * tile_scale,
            0.0,
        ));
        let normalize_and_scale =
            Matrix4::from_nonuniform_scale(tile_scale / EXTENT, tile_scale / EXTENT, 1.0);
        translate * normalize_and_scale
    }
}

impl Display for UnwrappedTileId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.canonical.z, self.canonical.x, self.canonical.y)?;
        if self.wrap != 0 {
            write!(f, " (wrap {})", self.wrap)?;
        }
        Ok(())
    }
}
