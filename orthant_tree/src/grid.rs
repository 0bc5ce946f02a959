// Copyright 2025 the Orthant Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! World-space to grid-space rasterization.
//!
//! The world box is divided into `2^max_depth` cells per dimension. All
//! Morton arithmetic runs on the resulting integer grid coordinates; this
//! module is the only place world coordinates are touched.

use num_traits::{Float, One, ToPrimitive, Zero};
use orthant_geometry::internal::{self, FloatBox, FloatVector};
use orthant_geometry::{Adaptor, Real, RealOf, Scalar};

use crate::morton::GridId;

/// Grid-space indexing of one tree: resolution, rasterization factors, and
/// the world box.
pub struct GridSpace<const D: usize, A: Adaptor<D>> {
    max_resolution: GridId,
    max_raster_id: GridId,
    world: FloatBox<D, RealOf<D, A>>,
    volume: RealOf<D, A>,
    raster_factors: FloatVector<D, RealOf<D, A>>,
    sizes: FloatVector<D, RealOf<D, A>>,
}

impl<const D: usize, A: Adaptor<D>> Clone for GridSpace<D, A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<const D: usize, A: Adaptor<D>> Copy for GridSpace<D, A> {}

impl<const D: usize, A: Adaptor<D>> core::fmt::Debug for GridSpace<D, A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GridSpace")
            .field("max_resolution", &self.max_resolution)
            .field("world", &self.world)
            .field("volume", &self.volume)
            .finish_non_exhaustive()
    }
}

impl<const D: usize, A: Adaptor<D>> GridSpace<D, A> {
    /// Grid over `world` with `2^max_depth` cells per dimension.
    pub fn new(max_depth: u8, world: FloatBox<D, RealOf<D, A>>) -> Self {
        let max_resolution: GridId = 1 << max_depth;
        let resolution_factor = RealOf::<D, A>::from_u32(max_resolution);
        let mut sizes = [RealOf::<D, A>::zero(); D];
        let mut raster_factors = [RealOf::<D, A>::one(); D];
        for dim in 0..D {
            sizes[dim] = world.max[dim] - world.min[dim];
            // Flat dimensions keep a factor of one so every point rasters to
            // cell zero.
            if sizes[dim] != RealOf::<D, A>::zero() {
                raster_factors[dim] = resolution_factor / sizes[dim];
            }
        }
        let volume = internal::volume(&world);
        Self {
            max_resolution,
            max_raster_id: max_resolution - 1,
            world,
            volume,
            raster_factors,
            sizes,
        }
    }

    /// Per-dimension world extents.
    #[inline]
    pub fn sizes(&self) -> &FloatVector<D, RealOf<D, A>> {
        &self.sizes
    }

    /// Volume of the world box.
    #[inline]
    pub fn volume(&self) -> RealOf<D, A> {
        self.volume
    }

    /// The world box.
    #[inline]
    pub fn world(&self) -> &FloatBox<D, RealOf<D, A>> {
        &self.world
    }

    /// Cells per dimension.
    #[inline]
    pub fn resolution(&self) -> GridId {
        self.max_resolution
    }

    /// Translate the world box.
    pub fn move_by(&mut self, by: &A::Vector) {
        internal::move_box::<D, A>(&mut self.world, by);
    }

    /// Center of the cell of size `2^center_level` anchored at `grid`.
    pub fn cell_center(
        &self,
        grid: [GridId; D],
        center_level: u8,
    ) -> FloatVector<D, RealOf<D, A>> {
        let half_grid =
            RealOf::<D, A>::from_u32(1u32 << u32::from(center_level)) * RealOf::<D, A>::from_f64(0.5);
        let mut center = [RealOf::<D, A>::zero(); D];
        for dim in 0..D {
            center[dim] = (RealOf::<D, A>::from_u32(grid[dim]) + half_grid)
                / self.raster_factors[dim]
                + self.world.min[dim];
        }
        center
    }

    /// Grid coordinates of the cell containing `point`.
    ///
    /// With `clamp_outside`, coordinates outside the world snap to the
    /// nearest border cell; otherwise out-of-world input is a caller error
    /// (checked in debug builds only).
    pub fn point_grid(&self, point: &A::Vector, clamp_outside: bool) -> [GridId; D] {
        let zero = RealOf::<D, A>::zero();
        let mut grid = [0 as GridId; D];
        for dim in 0..D {
            let mut component = A::point_coord(point, dim).to_real() - self.world.min[dim];
            if clamp_outside {
                if component < zero {
                    component = zero;
                }
            } else {
                debug_assert!(component >= zero, "point outside the world box");
            }
            let raster = component * self.raster_factors[dim];
            grid[dim] = self.max_raster_id.min(to_grid_id(raster));
        }
        grid
    }

    /// The one or two grid cells a point may belong to: a point exactly on a
    /// cell boundary also selects the cell below the boundary.
    pub fn edge_point_grid(&self, point: &A::Vector) -> [[GridId; D]; 2] {
        let zero = RealOf::<D, A>::zero();
        let max_raster = RealOf::<D, A>::from_u32(self.max_raster_id);
        let mut range = [[0 as GridId; D]; 2];
        for dim in 0..D {
            let raster = ((A::point_coord(point, dim).to_real() - self.world.min[dim])
                * self.raster_factors[dim])
                .max(zero)
                .min(max_raster);
            let cell = to_grid_id(raster);
            range[0][dim] = cell;
            range[1][dim] = cell;
            if 0 < cell && cell < self.max_resolution && raster.floor() == raster {
                range[0][dim] -= 1;
            }
        }
        range
    }

    /// Grid cell range of a box.
    ///
    /// In the default mode the upper corner steps back one cell when it lands
    /// exactly on a boundary, so adjacent boxes raster to distinct cells. In
    /// `point_like` mode both corners clamp into the valid cell range, which
    /// also tolerates out-of-world boxes (used when rasterizing query
    /// ranges).
    pub fn box_grid(&self, b: &A::Box, point_like: bool) -> [[GridId; D]; 2] {
        let zero = RealOf::<D, A>::zero();
        let mut range = [[0 as GridId; D]; 2];
        for dim in 0..D {
            let box_min = A::box_min_coord(b, dim).to_real();
            let box_max = A::box_max_coord(b, dim).to_real();
            debug_assert!(box_min <= box_max, "inverted box");
            let min_raster = (box_min - self.world.min[dim]) * self.raster_factors[dim];
            let max_raster = (box_max - self.world.min[dim]) * self.raster_factors[dim];

            if point_like {
                range[0][dim] = self.max_raster_id.min(to_grid_id(min_raster.max(zero)));
                range[1][dim] = self.max_raster_id.min(to_grid_id(max_raster.max(zero)));
            } else {
                let resolution = RealOf::<D, A>::from_u32(self.max_resolution);
                range[0][dim] = to_grid_id(min_raster.max(zero).min(resolution));
                range[1][dim] = to_grid_id(max_raster.max(zero).min(resolution));
                if (range[0][dim] != range[1][dim] && max_raster.floor() == max_raster)
                    || range[1][dim] >= self.max_resolution
                {
                    range[1][dim] -= 1;
                }
                // A box fully past the world's upper bound snaps to the
                // border cell, matching the lower-bound clamp.
                if range[0][dim] >= self.max_resolution {
                    range[0][dim] = self.max_raster_id;
                }
            }
            debug_assert!(range[0][dim] < self.max_resolution);
            debug_assert!(range[1][dim] < self.max_resolution);
        }
        range
    }
}

/// Truncate a non-negative raster coordinate to its cell index. Values past
/// the representable range saturate; callers clamp before or after.
#[inline]
fn to_grid_id<F: Real>(raster: F) -> GridId {
    raster.to_u32().unwrap_or(GridId::MAX)
}
