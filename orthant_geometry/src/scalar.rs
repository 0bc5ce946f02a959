// Copyright 2025 the Orthant Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Coordinate scalar abstraction with a promoted float type for internal math.

use core::fmt::Debug;

use num_traits::Float;

/// Float type used by the internal geometry math.
///
/// Extends [`num_traits::Float`] with infallible conversions from the literal
/// and index types the tree code needs, so no fallible `from` calls leak into
/// hot loops.
pub trait Real: Float + Debug + Default + Send + Sync + 'static {
    /// Convert an `f64` literal. Lossy for `f32`, which is fine for the
    /// constants involved (halves and small factors).
    fn from_f64(value: f64) -> Self;

    /// Convert a grid coordinate.
    fn from_u32(value: u32) -> Self;

    /// Convert a count.
    fn from_usize(value: usize) -> Self;
}

impl Real for f32 {
    #[inline]
    fn from_f64(value: f64) -> Self {
        value as f32
    }

    #[inline]
    fn from_u32(value: u32) -> Self {
        value as f32
    }

    #[inline]
    fn from_usize(value: usize) -> Self {
        value as f32
    }
}

impl Real for f64 {
    #[inline]
    fn from_f64(value: f64) -> Self {
        value
    }

    #[inline]
    fn from_u32(value: u32) -> Self {
        value as f64
    }

    #[inline]
    fn from_usize(value: usize) -> Self {
        value as f64
    }
}

/// Scalar type of caller geometry coordinates.
///
/// Integer scalars are permitted; every internal computation promotes to the
/// associated [`Real`] type first, which avoids integer division and overflow
/// pitfalls when rasterizing integer geometries.
pub trait Scalar: Copy + PartialOrd + Debug + Send + Sync + 'static {
    /// The float type internal math runs in (`i32` promotes to `f32`, `i64`
    /// to `f64`, floats to themselves).
    type Real: Real;

    /// Promote to the internal float type.
    fn to_real(self) -> Self::Real;

    /// Demote from the internal float type (used when writing coordinates
    /// back through an adaptor).
    fn from_real(value: Self::Real) -> Self;
}

impl Scalar for f32 {
    type Real = f32;

    #[inline]
    fn to_real(self) -> f32 {
        self
    }

    #[inline]
    fn from_real(value: f32) -> Self {
        value
    }
}

impl Scalar for f64 {
    type Real = f64;

    #[inline]
    fn to_real(self) -> f64 {
        self
    }

    #[inline]
    fn from_real(value: f64) -> Self {
        value
    }
}

impl Scalar for i32 {
    type Real = f32;

    #[inline]
    fn to_real(self) -> f32 {
        self as f32
    }

    #[inline]
    fn from_real(value: f32) -> Self {
        value as i32
    }
}

impl Scalar for i64 {
    type Real = f64;

    #[inline]
    fn to_real(self) -> f64 {
        self as f64
    }

    #[inline]
    fn from_real(value: f64) -> Self {
        value as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_scalars_promote_to_floats() {
        assert_eq!(<i32 as Scalar>::to_real(7), 7.0_f32);
        assert_eq!(<i64 as Scalar>::to_real(-3), -3.0_f64);
        assert_eq!(<i64 as Scalar>::from_real(2.0), 2);
    }

    #[test]
    fn real_literal_conversions() {
        assert_eq!(<f32 as Real>::from_f64(0.5), 0.5_f32);
        assert_eq!(<f64 as Real>::from_u32(8), 8.0);
        assert_eq!(<f64 as Real>::from_usize(3), 3.0);
    }
}
