// Copyright 2025 the Orthant Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Plain array-backed default geometry types and their adaptor.

use core::marker::PhantomData;

use crate::adaptor::Adaptor;
use crate::scalar::Scalar;

/// Point or direction: one coordinate per dimension.
pub type VectorND<const D: usize, G> = [G; D];

/// Axis-aligned bounding box given by its two corners.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BoxND<const D: usize, G> {
    /// Minimum corner.
    pub min: VectorND<D, G>,
    /// Maximum corner.
    pub max: VectorND<D, G>,
}

impl<const D: usize, G: Copy> BoxND<D, G> {
    /// Box from its two corners.
    pub const fn new(min: VectorND<D, G>, max: VectorND<D, G>) -> Self {
        Self { min, max }
    }
}

/// Ray given by an origin and a (not necessarily normalized) direction.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RayND<const D: usize, G> {
    /// Origin point.
    pub origin: VectorND<D, G>,
    /// Heading. A zero vector degenerates to an origin-only containment test.
    pub direction: VectorND<D, G>,
}

/// Hyperplane `dot(normal, x) == origin_distance` with a normalized normal.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PlaneND<const D: usize, G> {
    /// Signed distance from the origin along the normal.
    pub origin_distance: G,
    /// Unit normal of the plane.
    pub normal: VectorND<D, G>,
}

/// Adaptor for the array-backed types above.
///
/// This is the implementation callers get for free; custom geometry types
/// implement [`Adaptor`] themselves and never pay a conversion.
pub struct Cartesian<const D: usize, G>(PhantomData<G>);

impl<const D: usize, G: Scalar> Adaptor<D> for Cartesian<D, G> {
    type Scalar = G;
    type Vector = VectorND<D, G>;
    type Box = BoxND<D, G>;
    type Ray = RayND<D, G>;
    type Plane = PlaneND<D, G>;

    #[inline]
    fn point_coord(point: &Self::Vector, dim: usize) -> G {
        point[dim]
    }

    #[inline]
    fn set_point_coord(point: &mut Self::Vector, dim: usize, value: G) {
        point[dim] = value;
    }

    #[inline]
    fn box_min_coord(b: &Self::Box, dim: usize) -> G {
        b.min[dim]
    }

    #[inline]
    fn box_max_coord(b: &Self::Box, dim: usize) -> G {
        b.max[dim]
    }

    #[inline]
    fn set_box_min_coord(b: &mut Self::Box, dim: usize, value: G) {
        b.min[dim] = value;
    }

    #[inline]
    fn set_box_max_coord(b: &mut Self::Box, dim: usize, value: G) {
        b.max[dim] = value;
    }

    #[inline]
    fn ray_origin(ray: &Self::Ray) -> &Self::Vector {
        &ray.origin
    }

    #[inline]
    fn ray_direction(ray: &Self::Ray) -> &Self::Vector {
        &ray.direction
    }

    #[inline]
    fn plane_normal(plane: &Self::Plane) -> &Self::Vector {
        &plane.normal
    }

    #[inline]
    fn plane_origin_distance(plane: &Self::Plane) -> G {
        plane.origin_distance
    }
}
