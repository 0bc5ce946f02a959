// Copyright 2025 the Orthant Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Orthant Geometry: the adaptor layer of the Orthant spatial trees.
//!
//! The trees in `orthant_tree` never own geometry. They read coordinates of
//! caller-owned points, boxes, rays, and planes through the [`Adaptor`] trait
//! defined here, so any vector/box representation can be indexed without
//! copying it into library types.
//!
//! - [`Adaptor`]: per-dimension access to caller geometry plus the derived
//!   predicates the trees need (containment, overlap, ray-box entry distance,
//!   point-plane classification).
//! - [`Scalar`]: the coordinate scalar abstraction. Integer scalars are
//!   allowed; internal math promotes them to a float type ([`Scalar::Real`]).
//! - [`cartesian`]: plain `[G; D]`-based default geometry types
//!   ([`VectorND`], [`BoxND`], [`RayND`], [`PlaneND`]) and the [`Cartesian`]
//!   adaptor for them.
//! - [`internal`]: float-typed vector/box helpers used by the tree internals
//!   (centers, half-sizes, SAT overlap, plane relation, slab ray test, wall
//!   distance).
//!
//! # Example
//!
//! ```rust
//! use orthant_geometry::{Adaptor, Cartesian, BoxND};
//!
//! type AD = Cartesian<3, f64>;
//!
//! let b = BoxND { min: [0.0, 0.0, 0.0], max: [1.0, 2.0, 3.0] };
//! assert!(AD::does_box_contain_point(&b, &[0.5, 1.0, 2.9], 0.0));
//! assert_eq!(AD::box_max_coord(&b, 2), 3.0);
//! ```
//!
//! This crate is `no_std`.

#![no_std]

pub mod adaptor;
pub mod cartesian;
pub mod internal;
pub mod scalar;

pub use adaptor::{Adaptor, PlaneRelation};
pub use cartesian::{BoxND, Cartesian, PlaneND, RayND, VectorND};
pub use scalar::{Real, Scalar};

/// Shorthand for the internal float type of an adaptor.
pub type RealOf<const D: usize, A> = <<A as Adaptor<D>>::Scalar as Scalar>::Real;
