// Copyright 2025 the Orthant Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The geometry adaptor trait: per-dimension access to caller types plus the
//! derived predicates the spatial trees are built on.

use core::fmt::Debug;

use num_traits::{Float, One, Zero};

use crate::scalar::{Real, Scalar};

/// Relation of a geometry to an oriented hyperplane.
///
/// The plane equation is `dot(normal, point) == origin_distance`; `Positive`
/// is the half-space the normal points into.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PlaneRelation {
    /// Entirely in the negative half-space.
    Negative,
    /// Intersects the plane (within tolerance).
    Hit,
    /// Entirely in the positive half-space.
    Positive,
}

/// Relation of two boxes per [`Adaptor::box_relation`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BoxRelation {
    /// Positive-measure intersection in every dimension.
    Overlapped,
    /// Touching on at least one face or corner, no separation.
    Adjacent,
    /// Disjoint in at least one dimension.
    Separated,
}

/// Compile-time indirection for reading and writing caller geometry.
///
/// Implement the eight accessor methods once per geometry representation; the
/// predicates are provided and work purely through the accessors. The
/// arithmetic runs in the caller's scalar where comparisons suffice and in
/// [`Scalar::Real`] where division or square roots are involved, preserving
/// the precision of float geometries and promoting integer ones.
pub trait Adaptor<const D: usize>: Sized + 'static {
    /// Coordinate scalar of the caller geometry.
    type Scalar: Scalar;
    /// Caller point/vector type.
    type Vector;
    /// Caller axis-aligned box type.
    type Box;
    /// Caller ray type (origin plus direction).
    type Ray;
    /// Caller hyperplane type (normal plus signed origin distance).
    type Plane;

    /// Read coordinate `dim` of a point.
    fn point_coord(point: &Self::Vector, dim: usize) -> Self::Scalar;
    /// Write coordinate `dim` of a point.
    fn set_point_coord(point: &mut Self::Vector, dim: usize, value: Self::Scalar);
    /// Read the minimum corner coordinate `dim` of a box.
    fn box_min_coord(b: &Self::Box, dim: usize) -> Self::Scalar;
    /// Read the maximum corner coordinate `dim` of a box.
    fn box_max_coord(b: &Self::Box, dim: usize) -> Self::Scalar;
    /// Write the minimum corner coordinate `dim` of a box.
    fn set_box_min_coord(b: &mut Self::Box, dim: usize, value: Self::Scalar);
    /// Write the maximum corner coordinate `dim` of a box.
    fn set_box_max_coord(b: &mut Self::Box, dim: usize, value: Self::Scalar);
    /// Ray origin point.
    fn ray_origin(ray: &Self::Ray) -> &Self::Vector;
    /// Ray direction vector. Need not be normalized.
    fn ray_direction(ray: &Self::Ray) -> &Self::Vector;
    /// Plane normal. Must be normalized; only debug builds check.
    fn plane_normal(plane: &Self::Plane) -> &Self::Vector;
    /// Signed distance of the plane from the origin along the normal.
    fn plane_origin_distance(plane: &Self::Plane) -> Self::Scalar;

    /// Squared Euclidean length.
    fn size2(v: &Self::Vector) -> <Self::Scalar as Scalar>::Real {
        let mut acc = <Self::Scalar as Scalar>::Real::zero();
        for dim in 0..D {
            let c = Self::point_coord(v, dim).to_real();
            acc = acc + c * c;
        }
        acc
    }

    /// Dot product of two points.
    fn dot(a: &Self::Vector, b: &Self::Vector) -> <Self::Scalar as Scalar>::Real {
        let mut acc = <Self::Scalar as Scalar>::Real::zero();
        for dim in 0..D {
            acc = acc + Self::point_coord(a, dim).to_real() * Self::point_coord(b, dim).to_real();
        }
        acc
    }

    /// Squared distance of two points.
    fn distance2(a: &Self::Vector, b: &Self::Vector) -> <Self::Scalar as Scalar>::Real {
        let mut acc = <Self::Scalar as Scalar>::Real::zero();
        for dim in 0..D {
            let d = Self::point_coord(a, dim).to_real() - Self::point_coord(b, dim).to_real();
            acc = acc + d * d;
        }
        acc
    }

    /// Euclidean distance of two points.
    fn distance(a: &Self::Vector, b: &Self::Vector) -> <Self::Scalar as Scalar>::Real {
        Self::distance2(a, b).sqrt()
    }

    /// Whether two points coincide within `accuracy`.
    fn points_equal(
        a: &Self::Vector,
        b: &Self::Vector,
        accuracy: <Self::Scalar as Scalar>::Real,
    ) -> bool {
        Self::distance2(a, b) <= accuracy * accuracy
    }

    /// Whether a vector has unit length within a fixed epsilon.
    fn is_normalized(v: &Self::Vector) -> bool {
        let one = <Self::Scalar as Scalar>::Real::one();
        (Self::size2(v) - one).abs() < <Self::Scalar as Scalar>::Real::from_f64(1e-6)
    }

    /// Translate a point by a vector, in place.
    fn move_point(point: &mut Self::Vector, by: &Self::Vector) {
        for dim in 0..D {
            let moved = Self::point_coord(point, dim).to_real() + Self::point_coord(by, dim).to_real();
            Self::set_point_coord(point, dim, Self::Scalar::from_real(moved));
        }
    }

    /// Translate a box by a vector, in place.
    fn move_box(b: &mut Self::Box, by: &Self::Vector) {
        for dim in 0..D {
            let delta = Self::point_coord(by, dim).to_real();
            let lo = Self::box_min_coord(b, dim).to_real() + delta;
            let hi = Self::box_max_coord(b, dim).to_real() + delta;
            Self::set_box_min_coord(b, dim, Self::Scalar::from_real(lo));
            Self::set_box_max_coord(b, dim, Self::Scalar::from_real(hi));
        }
    }

    /// Whether the box contains the point. With a zero tolerance the test is
    /// inclusive of the faces; with a nonzero tolerance the inflated test is
    /// strict.
    fn does_box_contain_point(
        b: &Self::Box,
        point: &Self::Vector,
        tolerance: <Self::Scalar as Scalar>::Real,
    ) -> bool {
        let zero = <Self::Scalar as Scalar>::Real::zero();
        if tolerance != zero {
            debug_assert!(tolerance > zero);
            for dim in 0..D {
                let p = Self::point_coord(point, dim).to_real();
                if !(Self::box_min_coord(b, dim).to_real() - tolerance < p
                    && p < Self::box_max_coord(b, dim).to_real() + tolerance)
                {
                    return false;
                }
            }
        } else {
            for dim in 0..D {
                let p = Self::point_coord(point, dim);
                if !(le(Self::box_min_coord(b, dim), p) && le(p, Self::box_max_coord(b, dim))) {
                    return false;
                }
            }
        }
        true
    }

    /// Classify two boxes as overlapped, merely touching, or separated.
    fn box_relation(a: &Self::Box, b: &Self::Box) -> BoxRelation {
        let mut any_adjacent = false;
        for dim in 0..D {
            let a_min = Self::box_min_coord(a, dim);
            let a_max = Self::box_max_coord(a, dim);
            let b_min = Self::box_min_coord(b, dim);
            let b_max = Self::box_max_coord(b, dim);
            if lt(a_min, b_max) && lt(b_min, a_max) {
                continue;
            }
            if a_min == b_max || a_max == b_min {
                any_adjacent = true;
                continue;
            }
            return BoxRelation::Separated;
        }
        if any_adjacent {
            BoxRelation::Adjacent
        } else {
            BoxRelation::Overlapped
        }
    }

    /// Strict overlap: positive-measure intersection, face touches excluded.
    fn are_boxes_overlapped_strict(a: &Self::Box, b: &Self::Box) -> bool {
        Self::box_relation(a, b) == BoxRelation::Overlapped
    }

    /// Overlap test. With `a_must_contain_b` the test is full containment,
    /// inclusive of faces; otherwise strict overlap.
    fn are_boxes_overlapped(a: &Self::Box, b: &Self::Box, a_must_contain_b: bool) -> bool {
        if a_must_contain_b {
            for dim in 0..D {
                let a_min = Self::box_min_coord(a, dim);
                let a_max = Self::box_max_coord(a, dim);
                let b_min = Self::box_min_coord(b, dim);
                let b_max = Self::box_max_coord(b, dim);
                if !(le(a_min, b_min) && le(b_min, a_max) && le(a_min, b_max) && le(b_max, a_max)) {
                    return false;
                }
            }
            true
        } else {
            Self::are_boxes_overlapped_strict(a, b)
        }
    }

    /// Entry distance of a ray into a box by the slab method, `None` on miss.
    ///
    /// Inside-origin rays return zero. Dimensions with a zero direction
    /// component require the origin inside that slab; the comparison is strict
    /// when a tolerance is present and inclusive at zero tolerance.
    fn ray_box_distance(
        b: &Self::Box,
        origin: &Self::Vector,
        direction: &Self::Vector,
        tolerance: <Self::Scalar as Scalar>::Real,
    ) -> Option<<Self::Scalar as Scalar>::Real> {
        let zero = <Self::Scalar as Scalar>::Real::zero();
        debug_assert!(tolerance >= zero, "tolerance cannot be negative");

        if Self::does_box_contain_point(b, origin, tolerance) {
            return Some(zero);
        }

        let inf = <Self::Scalar as Scalar>::Real::max_value();
        let mut t_min = -inf;
        let mut t_max = inf;
        for dim in 0..D {
            let o = Self::point_coord(origin, dim).to_real();
            let dir = Self::point_coord(direction, dim).to_real();
            let box_min = Self::box_min_coord(b, dim).to_real() - tolerance;
            let box_max = Self::box_max_coord(b, dim).to_real() + tolerance;
            if dir == zero {
                if tolerance != zero {
                    if o <= box_min || box_max <= o {
                        return None;
                    }
                } else if o < box_min || box_max < o {
                    return None;
                }
            } else {
                let reciprocal = <Self::Scalar as Scalar>::Real::one() / dir;
                let mut t1 = (box_min - o) * reciprocal;
                let mut t2 = (box_max - o) * reciprocal;
                if t1 > t2 {
                    core::mem::swap(&mut t1, &mut t2);
                }
                t_min = t_min.max(t1);
                t_max = t_max.min(t2);
            }
        }

        if t_min > t_max || t_max < zero {
            None
        } else if t_min < zero {
            Some(t_max)
        } else {
            Some(t_min)
        }
    }

    /// Entry distance of a caller ray into a box, `None` on miss.
    fn ray_box_distance_of(
        b: &Self::Box,
        ray: &Self::Ray,
        tolerance: <Self::Scalar as Scalar>::Real,
    ) -> Option<<Self::Scalar as Scalar>::Real> {
        Self::ray_box_distance(b, Self::ray_origin(ray), Self::ray_direction(ray), tolerance)
    }

    /// Classify a point against a hyperplane given by its normal and signed
    /// origin distance.
    fn point_plane_relation(
        point: &Self::Vector,
        origin_distance: <Self::Scalar as Scalar>::Real,
        normal: &Self::Vector,
        tolerance: <Self::Scalar as Scalar>::Real,
    ) -> PlaneRelation {
        debug_assert!(Self::is_normalized(normal));
        let projected = Self::dot(normal, point);
        if projected < origin_distance - tolerance {
            PlaneRelation::Negative
        } else if projected > origin_distance + tolerance {
            PlaneRelation::Positive
        } else {
            PlaneRelation::Hit
        }
    }
}

#[inline]
fn le<T: PartialOrd>(a: T, b: T) -> bool {
    a.partial_cmp(&b)
        .map(|o| o != core::cmp::Ordering::Greater)
        .unwrap_or(false)
}

#[inline]
fn lt<T: PartialOrd>(a: T, b: T) -> bool {
    a.partial_cmp(&b)
        .map(|o| o == core::cmp::Ordering::Less)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartesian::{BoxND, Cartesian};

    type AD = Cartesian<3, f64>;

    #[test]
    fn contain_is_inclusive_at_zero_tolerance() {
        let b = BoxND {
            min: [0.0, 0.0, 0.0],
            max: [1.0, 1.0, 1.0],
        };
        assert!(AD::does_box_contain_point(&b, &[1.0, 0.0, 0.5], 0.0));
        assert!(!AD::does_box_contain_point(&b, &[1.0 + 1e-12, 0.0, 0.5], 0.0));
    }

    #[test]
    fn strict_overlap_excludes_touching() {
        let a = BoxND {
            min: [0.0, 0.0, 0.0],
            max: [1.0, 1.0, 1.0],
        };
        let touching = BoxND {
            min: [1.0, 0.0, 0.0],
            max: [2.0, 1.0, 1.0],
        };
        let inside = BoxND {
            min: [0.5, 0.5, 0.5],
            max: [1.5, 1.5, 1.5],
        };
        assert!(!AD::are_boxes_overlapped_strict(&a, &touching));
        assert_eq!(AD::box_relation(&a, &touching), BoxRelation::Adjacent);
        assert!(AD::are_boxes_overlapped_strict(&a, &inside));
        assert!(!AD::are_boxes_overlapped(&a, &inside, true));
        assert!(AD::are_boxes_overlapped(
            &a,
            &BoxND {
                min: [0.25, 0.25, 0.25],
                max: [0.75, 0.75, 1.0],
            },
            true
        ));
    }

    #[test]
    fn ray_hits_box_at_expected_distance() {
        let b = BoxND {
            min: [-1.0, -1.0, -1.0],
            max: [0.0, 0.0, 0.0],
        };
        let t = AD::ray_box_distance(&b, &[0.5, 0.5, 0.5], &[-1.0, -1.0, -1.0], 0.0)
            .expect("ray should hit");
        assert!((t - 0.5).abs() < 1e-12);
    }

    #[test]
    fn zero_direction_dimension_requires_origin_in_slab() {
        let b = BoxND {
            min: [0.0, 0.0, 0.0],
            max: [1.0, 1.0, 1.0],
        };
        // x stays at 2.0, outside the x slab, so the ray can never enter.
        assert_eq!(AD::ray_box_distance(&b, &[2.0, 0.5, -1.0], &[0.0, 0.0, 1.0], 0.0), None);
        // Grazing the x = 1 face: hit at zero tolerance, miss when tolerant
        // comparisons are strict against the inflated face.
        assert!(AD::ray_box_distance(&b, &[1.0, 0.5, -1.0], &[0.0, 0.0, 1.0], 0.0).is_some());
    }

    #[test]
    fn point_plane_classification() {
        let normal = [0.0, 0.0, 1.0];
        assert_eq!(
            AD::point_plane_relation(&[0.0, 0.0, 2.0], 1.0, &normal, 0.0),
            PlaneRelation::Positive
        );
        assert_eq!(
            AD::point_plane_relation(&[0.0, 0.0, 0.0], 1.0, &normal, 0.0),
            PlaneRelation::Negative
        );
        assert_eq!(
            AD::point_plane_relation(&[0.0, 0.0, 1.05], 1.0, &normal, 0.1),
            PlaneRelation::Hit
        );
    }
}
