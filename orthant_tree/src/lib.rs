// Copyright 2025 the Orthant Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Orthant Tree: an N-dimensional linear orthotree.
//!
//! Orthant Tree spatially indexes caller-owned points or axis-aligned boxes
//! in D ∈ [1, 63] dimensions. It is the generalization of the binary tree,
//! quadtree, and octree: every node has up to `2^D` equal children. The tree
//! is *linear*: there are no child pointers. Each node's key is its Morton
//! (Z-order) prefix with a sentinel bit on top, nodes live in a hash map
//! keyed by it, and traversal is bit arithmetic on keys.
//!
//! - Non-owning: the index stores entity ids; geometry stays in the caller's
//!   container and is borrowed per operation (see
//!   [`GeometryCollection`]).
//! - Bulk depth-first builders with a sequential partitioning mode and a
//!   rayon-parallel sort-based mode that produce identical trees.
//! - Incremental edits: insert with or without rebalancing, erase, update,
//!   wholesale id remapping.
//! - Queries: range, pick, k-nearest-neighbor, plane intersection and
//!   segmentation, frustum culling, ray casting, and pairwise collision
//!   detection (within one tree, serial or parallel, and across two trees)
//!   built on sweep-and-prune.
//!
//! # Picking a tree type
//!
//! [`PointTree`] indexes one point per entity, [`BoxTree`] one box per
//! entity. The box tree's `SPLIT` parameter selects the
//! split-parent-entities policy: boxes straddling child midplanes are
//! replicated into each touched child instead of accumulating in large
//! parent nodes. Queries dedup the replicas before returning.
//!
//! The key type sets the depth limit: `u32` keys address D < 4, `u64` keys
//! D < 15, and the multi-word [`WideKey`] addresses D ≥ 15 at up to four
//! levels in an ordered node store. The aliases below pick what fits.
//!
//! # Example
//!
//! ```rust
//! use orthant_tree::{OctreeBox, TreeOptions};
//! use orthant_geometry::BoxND;
//!
//! let boxes = vec![
//!     BoxND::new([0.0, 0.0, 0.0], [2.0, 2.0, 2.0]),
//!     BoxND::new([1.0, 1.0, 1.0], [3.0, 3.0, 3.0]),
//!     BoxND::new([5.0, 5.0, 5.0], [6.0, 6.0, 6.0]),
//! ];
//! let tree = OctreeBox::build(&boxes, TreeOptions::default());
//!
//! let overlapping = tree.collision_detection(&boxes);
//! assert_eq!(overlapping, vec![(0, 1)]);
//!
//! let hit = tree.ray_intersected_first(&[4.0, 5.5, 5.5], &[1.0, 0.0, 0.0], &boxes, 0.0);
//! assert_eq!(hit, Some(2));
//! ```
//!
//! # Concurrency
//!
//! A tree is single-writer. Bulk build, `move_by`, and self-collision accept
//! [`Execution::Parallel`] to run their data-parallel stages on the rayon
//! pool; queries take `&self` and may run concurrently with each other.
//!
//! # Errors
//!
//! Queries never fail; they return empty results. Mutations return `false`
//! for out-of-world geometry and unknown ids, without state change.
//! Structural misconfiguration (zero depth, depth beyond the key width, zero
//! node capacity, double init) panics.

pub mod arena;
pub mod collection;
pub mod grid;
pub mod key;
pub mod morton;

mod boxes;
mod core;
mod node;
mod point;

pub use self::core::{
    Execution, TreeOptions, DEFAULT_ESTIMATED_ENTITY_COUNT, DEFAULT_MAX_ENTITIES_PER_NODE,
};
pub use boxes::BoxTree;
pub use collection::{EntityId, GeometryCollection};
pub use key::{MortonKey, NodeStore, WideKey, MAX_WIDE_DEPTH};
pub use morton::{ChildId, GridId, RangeLocation};
pub use point::PointTree;

pub use orthant_geometry::{Adaptor, BoxND, Cartesian, PlaneND, PlaneRelation, RayND, VectorND};

/// Point tree over `[f64; 1]` geometry (binary tree).
pub type DualtreePoint = PointTree<1, Cartesian<1, f64>, u32>;
/// Box tree over `[f64; 1]` geometry (binary tree).
pub type DualtreeBox = BoxTree<1, true, Cartesian<1, f64>, u32>;

/// Point quadtree over `[f64; 2]` geometry.
pub type QuadtreePoint = PointTree<2, Cartesian<2, f64>, u32>;
/// Box quadtree over `[f64; 2]` geometry.
pub type QuadtreeBox = BoxTree<2, true, Cartesian<2, f64>, u32>;
/// Box quadtree with a selectable split policy.
pub type QuadtreeBoxSplit<const SPLIT: bool> = BoxTree<2, SPLIT, Cartesian<2, f64>, u32>;

/// Point octree over `[f64; 3]` geometry.
pub type OctreePoint = PointTree<3, Cartesian<3, f64>, u32>;
/// Box octree over `[f64; 3]` geometry.
pub type OctreeBox = BoxTree<3, true, Cartesian<3, f64>, u32>;
/// Box octree with a selectable split policy.
pub type OctreeBoxSplit<const SPLIT: bool> = BoxTree<3, SPLIT, Cartesian<3, f64>, u32>;

/// Point hexatree over `[f64; 4]` geometry.
pub type HexatreePoint = PointTree<4, Cartesian<4, f64>, u64>;
/// Box hexatree over `[f64; 4]` geometry.
pub type HexatreeBox = BoxTree<4, true, Cartesian<4, f64>, u64>;

/// Point tree for any dimension the 64-bit key can address (D < 15).
pub type TreePointND<const D: usize> = PointTree<D, Cartesian<D, f64>, u64>;
/// Box tree for any dimension the 64-bit key can address (D < 15).
pub type TreeBoxND<const D: usize, const SPLIT: bool> = BoxTree<D, SPLIT, Cartesian<D, f64>, u64>;

/// Point tree in 16 dimensions on a two-word wide key.
pub type TreePoint16D = PointTree<16, Cartesian<16, f64>, WideKey<2>>;
/// Box tree in 16 dimensions on a two-word wide key.
pub type TreeBox16D = BoxTree<16, true, Cartesian<16, f64>, WideKey<2>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_dimensional_tree_works() {
        let points = vec![[1.0], [2.0], [5.0], [9.0]];
        let tree = DualtreePoint::build(
            &points,
            TreeOptions {
                max_depth: Some(4),
                max_entities_per_node: 1,
                ..Default::default()
            },
        );
        let mut found = tree.range_search(&BoxND::new([1.5], [6.0]), &points);
        found.sort_unstable();
        assert_eq!(found, vec![1, 2]);
        assert_eq!(tree.nearest_neighbors(&[4.0], 1, &points), vec![2]);
    }

    #[test]
    fn sixteen_dimensional_tree_on_wide_keys() {
        let mut points: Vec<[f64; 16]> = Vec::new();
        for value in 0..12 {
            let mut point = [0.0; 16];
            for (dim, coordinate) in point.iter_mut().enumerate() {
                *coordinate = (value * (dim + 1) % 7) as f64;
            }
            points.push(point);
        }
        let tree = TreePoint16D::build(
            &points,
            TreeOptions {
                max_depth: Some(3),
                max_entities_per_node: 2,
                ..Default::default()
            },
        );
        let mut all = tree.collect_all_entities_in_bfs(false);
        all.sort_unstable();
        assert_eq!(all, (0..12).collect::<Vec<_>>());

        let query = points[5];
        let neighbors = tree.nearest_neighbors(&query, 1, &points);
        assert_eq!(neighbors, vec![5]);
    }

    #[test]
    fn map_collections_use_their_keys() {
        use std::collections::BTreeMap;
        let mut points: BTreeMap<u32, [f64; 2]> = BTreeMap::new();
        points.insert(10, [0.5, 0.5]);
        points.insert(20, [3.5, 3.5]);
        points.insert(30, [0.6, 3.5]);
        let tree: PointTree<2, Cartesian<2, f64>, u32, u32> = PointTree::build(
            &points,
            TreeOptions {
                max_depth: Some(3),
                ..Default::default()
            },
        );
        let found = tree.range_search(&BoxND::new([0.0, 0.0], [1.0, 1.0]), &points);
        assert_eq!(found, vec![10]);
        let mut all = tree.collect_all_entities_in_bfs(true);
        all.sort_unstable();
        assert_eq!(all, vec![10, 20, 30]);
    }
}
