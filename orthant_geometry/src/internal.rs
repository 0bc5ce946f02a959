// Copyright 2025 the Orthant Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Float-typed internal vector/box math.
//!
//! The tree internals keep per-node centers, half-sizes, and the world box in
//! a uniform float layout regardless of the caller's scalar, so per-dimension
//! inner loops stay branch-free and integer geometries never hit integer
//! division. Everything here is a free function over `[F; D]` and
//! [`FloatBox`]; functions suffixed `_of` read caller geometry through an
//! [`Adaptor`].

use num_traits::{Float, One, Zero};

use crate::adaptor::{Adaptor, PlaneRelation};
use crate::scalar::{Real, Scalar};

/// Internal float vector.
pub type FloatVector<const D: usize, F> = [F; D];

/// Internal float box.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FloatBox<const D: usize, F> {
    /// Minimum corner.
    pub min: FloatVector<D, F>,
    /// Maximum corner.
    pub max: FloatVector<D, F>,
}

impl<const D: usize, F: Real> FloatBox<D, F> {
    /// Box collapsed to the origin.
    pub fn zero() -> Self {
        Self {
            min: [F::zero(); D],
            max: [F::zero(); D],
        }
    }
}

/// Shorthand used below for the adaptor's internal float type.
type Fl<const D: usize, A> = <<A as Adaptor<D>>::Scalar as Scalar>::Real;

/// Sum of squares of the components.
#[inline]
pub fn size2<const D: usize, F: Real>(v: &FloatVector<D, F>) -> F {
    let mut acc = F::zero();
    for dim in 0..D {
        acc = acc + v[dim] * v[dim];
    }
    acc
}

/// Euclidean length.
#[inline]
pub fn size<const D: usize, F: Real>(v: &FloatVector<D, F>) -> F {
    size2(v).sqrt()
}

/// Center of a float box.
#[inline]
pub fn box_center<const D: usize, F: Real>(b: &FloatBox<D, F>) -> FloatVector<D, F> {
    let half = F::from_f64(0.5);
    let mut center = [F::zero(); D];
    for dim in 0..D {
        center[dim] = (b.min[dim] + b.max[dim]) * half;
    }
    center
}

/// Center of a caller box.
#[inline]
pub fn box_center_of<const D: usize, A: Adaptor<D>>(b: &A::Box) -> FloatVector<D, Fl<D, A>> {
    let half = Fl::<D, A>::from_f64(0.5);
    let mut center = [Fl::<D, A>::zero(); D];
    for dim in 0..D {
        center[dim] =
            (A::box_min_coord(b, dim).to_real() + A::box_max_coord(b, dim).to_real()) * half;
    }
    center
}

/// Per-dimension extent of a caller box.
#[inline]
pub fn box_size_of<const D: usize, A: Adaptor<D>>(b: &A::Box) -> FloatVector<D, Fl<D, A>> {
    let mut sizes = [Fl::<D, A>::zero(); D];
    for dim in 0..D {
        sizes[dim] = A::box_max_coord(b, dim).to_real() - A::box_min_coord(b, dim).to_real();
    }
    sizes
}

/// Per-dimension half extent of a caller box.
#[inline]
pub fn box_half_size_of<const D: usize, A: Adaptor<D>>(b: &A::Box) -> FloatVector<D, Fl<D, A>> {
    let half = Fl::<D, A>::from_f64(0.5);
    let mut sizes = [Fl::<D, A>::zero(); D];
    for dim in 0..D {
        sizes[dim] =
            (A::box_max_coord(b, dim).to_real() - A::box_min_coord(b, dim).to_real()) * half;
    }
    sizes
}

/// AABB separating-axis test on centers and full sizes. Touching faces do not
/// count as overlap.
pub fn boxes_overlap_by_center<const D: usize, F: Real>(
    center_a: &FloatVector<D, F>,
    center_b: &FloatVector<D, F>,
    size_a: &FloatVector<D, F>,
    size_b: &FloatVector<D, F>,
) -> bool {
    let half = F::from_f64(0.5);
    for dim in 0..D {
        let limit = (size_a[dim] + size_b[dim]) * half;
        if limit <= (center_a[dim] - center_b[dim]).abs() {
            return false;
        }
    }
    true
}

/// Translate a float vector by a caller vector, in place.
#[inline]
pub fn move_vector<const D: usize, A: Adaptor<D>>(
    v: &mut FloatVector<D, Fl<D, A>>,
    by: &A::Vector,
) {
    for dim in 0..D {
        v[dim] = v[dim] + A::point_coord(by, dim).to_real();
    }
}

/// Translate a float box by a caller vector, in place.
#[inline]
pub fn move_box<const D: usize, A: Adaptor<D>>(b: &mut FloatBox<D, Fl<D, A>>, by: &A::Vector) {
    for dim in 0..D {
        let delta = A::point_coord(by, dim).to_real();
        b.min[dim] = b.min[dim] + delta;
        b.max[dim] = b.max[dim] + delta;
    }
}

/// Dot product of a caller vector with a float vector.
#[inline]
pub fn dot_of<const D: usize, A: Adaptor<D>>(
    a: &A::Vector,
    b: &FloatVector<D, Fl<D, A>>,
) -> Fl<D, A> {
    let mut acc = Fl::<D, A>::zero();
    for dim in 0..D {
        acc = acc + A::point_coord(a, dim).to_real() * b[dim];
    }
    acc
}

#[inline]
fn range_contains_1d<F: PartialOrd>(range_min: F, range_max: F, lo: F, hi: F) -> bool {
    !(range_min > lo || lo > range_max || range_min > hi || hi > range_max)
}

/// Whether a caller box fully contains a float box (faces inclusive).
pub fn range_contains_float_box<const D: usize, A: Adaptor<D>>(
    range: &A::Box,
    b: &FloatBox<D, Fl<D, A>>,
) -> bool {
    for dim in 0..D {
        if !range_contains_1d(
            A::box_min_coord(range, dim).to_real(),
            A::box_max_coord(range, dim).to_real(),
            b.min[dim],
            b.max[dim],
        ) {
            return false;
        }
    }
    true
}

/// Whether a float box fully contains a caller box (faces inclusive).
pub fn float_box_contains_box<const D: usize, A: Adaptor<D>>(
    range: &FloatBox<D, Fl<D, A>>,
    b: &A::Box,
) -> bool {
    for dim in 0..D {
        if !range_contains_1d(
            range.min[dim],
            range.max[dim],
            A::box_min_coord(b, dim).to_real(),
            A::box_max_coord(b, dim).to_real(),
        ) {
            return false;
        }
    }
    true
}

/// Classify a box (center plus half size) against a hyperplane: the center is
/// projected onto the normal and compared against the projected radius.
pub fn box_plane_relation<const D: usize, A: Adaptor<D>>(
    center: &FloatVector<D, Fl<D, A>>,
    half_size: &FloatVector<D, Fl<D, A>>,
    origin_distance: Fl<D, A>,
    normal: &A::Vector,
    tolerance: Fl<D, A>,
) -> PlaneRelation {
    debug_assert!(A::is_normalized(normal));

    let mut radius_projected = tolerance;
    for dim in 0..D {
        radius_projected = radius_projected + half_size[dim] * A::point_coord(normal, dim).to_real().abs();
    }
    let center_projected = dot_of::<D, A>(normal, center) - origin_distance;

    if center_projected + radius_projected < Fl::<D, A>::zero() {
        PlaneRelation::Negative
    } else if center_projected - radius_projected > Fl::<D, A>::zero() {
        PlaneRelation::Positive
    } else {
        PlaneRelation::Hit
    }
}

/// Box with inverted corners, the identity for corner-wise union.
pub fn inverted_box<const D: usize, F: Real>() -> FloatBox<D, F> {
    FloatBox {
        min: [F::max_value(); D],
        max: [-F::max_value(); D],
    }
}

/// Convert a caller box to the internal layout.
pub fn box_of<const D: usize, A: Adaptor<D>>(b: &A::Box) -> FloatBox<D, Fl<D, A>> {
    let mut out = FloatBox::zero();
    for dim in 0..D {
        out.min[dim] = A::box_min_coord(b, dim).to_real();
        out.max[dim] = A::box_max_coord(b, dim).to_real();
    }
    out
}

/// Tight bounds of a set of caller points.
pub fn box_of_points<'a, const D: usize, A: Adaptor<D>>(
    points: impl Iterator<Item = &'a A::Vector>,
) -> FloatBox<D, Fl<D, A>>
where
    A::Vector: 'a,
{
    let mut ext = inverted_box();
    for point in points {
        for dim in 0..D {
            let c = A::point_coord(point, dim).to_real();
            if ext.min[dim] > c {
                ext.min[dim] = c;
            }
            if ext.max[dim] < c {
                ext.max[dim] = c;
            }
        }
    }
    ext
}

/// Tight bounds of a set of caller boxes.
pub fn box_of_boxes<'a, const D: usize, A: Adaptor<D>>(
    boxes: impl Iterator<Item = &'a A::Box>,
) -> FloatBox<D, Fl<D, A>>
where
    A::Box: 'a,
{
    let mut ext = inverted_box();
    for b in boxes {
        for dim in 0..D {
            let lo = A::box_min_coord(b, dim).to_real();
            let hi = A::box_max_coord(b, dim).to_real();
            if ext.min[dim] > lo {
                ext.min[dim] = lo;
            }
            if ext.max[dim] < hi {
                ext.max[dim] = hi;
            }
        }
    }
    ext
}

/// Whether a float box contains a caller point. Zero tolerance is inclusive,
/// nonzero is strict on the inflated box.
pub fn box_contains_point<const D: usize, A: Adaptor<D>>(
    b: &FloatBox<D, Fl<D, A>>,
    point: &A::Vector,
    tolerance: Fl<D, A>,
) -> bool {
    let zero = Fl::<D, A>::zero();
    if tolerance != zero {
        debug_assert!(tolerance > zero);
        for dim in 0..D {
            let p = A::point_coord(point, dim).to_real();
            if !(b.min[dim] - tolerance < p && p < b.max[dim] + tolerance) {
                return false;
            }
        }
    } else {
        for dim in 0..D {
            let p = A::point_coord(point, dim).to_real();
            if !(b.min[dim] <= p && p <= b.max[dim]) {
                return false;
            }
        }
    }
    true
}

/// Whether a box given by center and half sizes contains a caller point.
pub fn box_contains_point_by_center<const D: usize, A: Adaptor<D>>(
    center: &FloatVector<D, Fl<D, A>>,
    half_sizes: &FloatVector<D, Fl<D, A>>,
    point: &A::Vector,
    tolerance: Fl<D, A>,
) -> bool {
    let zero = Fl::<D, A>::zero();
    if tolerance != zero {
        debug_assert!(tolerance > zero);
        for dim in 0..D {
            let distance = (A::point_coord(point, dim).to_real() - center[dim]).abs();
            if distance >= half_sizes[dim] + tolerance {
                return false;
            }
        }
    } else {
        for dim in 0..D {
            let distance = (A::point_coord(point, dim).to_real() - center[dim]).abs();
            if distance > half_sizes[dim] {
                return false;
            }
        }
    }
    true
}

/// Distance of a point to the nearest wall of a box.
///
/// Outside points get the Euclidean distance to the box surface. Inside
/// points get zero when `inside_is_zero`, otherwise the distance to the
/// closest wall from within (the escape radius used for k-NN pruning).
pub fn wall_distance<const D: usize, A: Adaptor<D>>(
    search_point: &A::Vector,
    center: &FloatVector<D, Fl<D, A>>,
    half_size: &FloatVector<D, Fl<D, A>>,
    inside_is_zero: bool,
) -> Fl<D, A> {
    let mut center_distance = [Fl::<D, A>::zero(); D];
    let mut is_inside = true;
    for dim in 0..D {
        center_distance[dim] = (center[dim] - A::point_coord(search_point, dim).to_real()).abs();
        is_inside &= center_distance[dim] <= half_size[dim];
    }

    if is_inside {
        if inside_is_zero {
            return Fl::<D, A>::zero();
        }
        let mut min_wall = half_size[0];
        for dim in 0..D {
            let wall = half_size[dim] - center_distance[dim];
            if min_wall > wall {
                min_wall = wall;
            }
        }
        min_wall
    } else {
        let mut distance = [Fl::<D, A>::zero(); D];
        for dim in 0..D {
            distance[dim] = (center_distance[dim] - half_size[dim]).max(Fl::<D, A>::zero());
        }
        size(&distance)
    }
}

/// Slab-method ray-box entry distance against a box given by center and half
/// sizes; `None` on miss. Same tolerance semantics as
/// [`Adaptor::ray_box_distance`].
pub fn ray_box_distance<const D: usize, A: Adaptor<D>>(
    center: &FloatVector<D, Fl<D, A>>,
    half_sizes: &FloatVector<D, Fl<D, A>>,
    origin: &A::Vector,
    direction: &A::Vector,
    tolerance: Fl<D, A>,
) -> Option<Fl<D, A>> {
    let zero = Fl::<D, A>::zero();
    debug_assert!(tolerance >= zero, "tolerance cannot be negative");
    if box_contains_point_by_center::<D, A>(center, half_sizes, origin, tolerance) {
        return Some(zero);
    }

    let inf = Fl::<D, A>::max_value();
    let mut t_min = -inf;
    let mut t_max = inf;
    for dim in 0..D {
        let o = A::point_coord(origin, dim).to_real();
        let dir = A::point_coord(direction, dim).to_real();
        let box_min = center[dim] - half_sizes[dim] - tolerance;
        let box_max = center[dim] + half_sizes[dim] + tolerance;
        if dir == zero {
            if tolerance != zero {
                if o <= box_min || box_max <= o {
                    return None;
                }
            } else if o < box_min || box_max < o {
                return None;
            }
        } else {
            let reciprocal = Fl::<D, A>::one() / dir;
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

/// Signed volume of a float box.
pub fn volume<const D: usize, F: Real>(b: &FloatBox<D, F>) -> F {
    let mut v = F::one();
    for dim in 0..D {
        v = v * (b.max[dim] - b.min[dim]);
    }
    v
}

/// Signed volume of a caller box.
pub fn volume_of<const D: usize, A: Adaptor<D>>(b: &A::Box) -> Fl<D, A> {
    let mut v = Fl::<D, A>::one();
    for dim in 0..D {
        v = v * (A::box_max_coord(b, dim).to_real() - A::box_min_coord(b, dim).to_real());
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartesian::{BoxND, Cartesian};

    type AD = Cartesian<2, f64>;

    #[test]
    fn center_and_half_size() {
        let b = BoxND::new([0.0, 0.0], [4.0, 2.0]);
        assert_eq!(box_center_of::<2, AD>(&b), [2.0, 1.0]);
        assert_eq!(box_half_size_of::<2, AD>(&b), [2.0, 1.0]);
        assert_eq!(volume_of::<2, AD>(&b), 8.0);
    }

    #[test]
    fn overlap_by_center_excludes_touching() {
        let a_center = [1.0, 1.0];
        let b_center = [3.0, 1.0];
        let size = [2.0, 2.0];
        assert!(!boxes_overlap_by_center(&a_center, &b_center, &size, &size));
        assert!(boxes_overlap_by_center(
            &a_center,
            &[2.9, 1.0],
            &size,
            &size
        ));
    }

    #[test]
    fn wall_distance_inside_and_outside() {
        let center = [2.0, 2.0];
        let half = [2.0, 2.0];
        // Inside: nearest wall is 0.5 away.
        let inside = wall_distance::<2, AD>(&[3.5, 2.0], &center, &half, false);
        assert!((inside - 0.5).abs() < 1e-12);
        assert_eq!(wall_distance::<2, AD>(&[3.5, 2.0], &center, &half, true), 0.0);
        // Outside by (1, 2): Euclidean distance to the corner region.
        let outside = wall_distance::<2, AD>(&[5.0, 6.0], &center, &half, true);
        assert!((outside - 5.0_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn bounds_of_points() {
        let points = [[0.0, 5.0], [-1.0, 2.0], [3.0, 3.0]];
        let ext = box_of_points::<2, AD>(points.iter());
        assert_eq!(ext.min, [-1.0, 2.0]);
        assert_eq!(ext.max, [3.0, 5.0]);
    }

    #[test]
    fn plane_relation_of_node_box() {
        let center = [1.0, 1.0];
        let half = [1.0, 1.0];
        let normal = [1.0, 0.0];
        assert_eq!(
            box_plane_relation::<2, AD>(&center, &half, 3.0, &normal, 0.0),
            PlaneRelation::Negative
        );
        assert_eq!(
            box_plane_relation::<2, AD>(&center, &half, 1.5, &normal, 0.0),
            PlaneRelation::Hit
        );
        assert_eq!(
            box_plane_relation::<2, AD>(&center, &half, -1.0, &normal, 0.0),
            PlaneRelation::Positive
        );
    }
}
