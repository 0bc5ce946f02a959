// Copyright 2025 the Orthant Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The point tree: spatial index of one point per entity.

use std::collections::BinaryHeap;
use std::collections::HashMap;

use num_traits::{Float, Zero};
use orthant_geometry::internal::{self, FloatBox};
use orthant_geometry::{Adaptor, RealOf, Scalar};
use rayon::prelude::*;
use smallvec::SmallVec;

use crate::collection::{EntityId, GeometryCollection};
use crate::core::{partition_in_place, EntityDistance, Execution, TreeCore, TreeOptions};
use crate::key::{MortonKey, NodeStore};
use crate::morton::{
    depth_of_key, encode, hash_key, is_valid_key, parent_key, root_key, ChildChecker,
    ChildKeyGenerator, RangeLocation,
};
use crate::node::Node;

/// Frame of the explicit depth-first build stack.
struct BuildFrame<const D: usize, K, R> {
    key: K,
    node: Node<D, K, R>,
    end: usize,
}

/// Morton-keyed spatial index of points.
///
/// The tree holds entity ids only; the caller keeps the points and passes the
/// collection into every operation that needs coordinates.
///
/// ```rust
/// use orthant_tree::{QuadtreePoint, TreeOptions};
///
/// let points = vec![[0.0, 0.0], [1.0, 1.0], [2.0, 2.0]];
/// let tree = QuadtreePoint::build(
///     &points,
///     TreeOptions {
///         max_depth: Some(3),
///         ..Default::default()
///     },
/// );
///
/// let in_range = tree.range_search(
///     &orthant_geometry::BoxND::new([0.5, 0.5], [2.5, 2.5]),
///     &points,
/// );
/// assert_eq!(in_range.len(), 2);
/// ```
pub struct PointTree<const D: usize, A: Adaptor<D>, K: MortonKey = u64, E: EntityId = usize> {
    pub(crate) core: TreeCore<D, A, K, E>,
}

impl<const D: usize, A: Adaptor<D>, K: MortonKey, E: EntityId> core::fmt::Debug
    for PointTree<D, A, K, E>
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PointTree").field("core", &self.core).finish()
    }
}

impl<const D: usize, A: Adaptor<D>, K: MortonKey, E: EntityId> Default for PointTree<D, A, K, E> {
    fn default() -> Self {
        Self {
            core: TreeCore::empty(),
        }
    }
}

impl<const D: usize, A: Adaptor<D>, K: MortonKey, E: EntityId> PointTree<D, A, K, E> {
    const DIMS: u32 = D as u32;

    /// Empty, uninitialized tree; call [`init`](Self::init) before use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an empty tree over `world_box` for one-by-one insertion.
    pub fn init(&mut self, world_box: &A::Box, max_depth: u8, options: &TreeOptions<D, A>) {
        self.core.init(
            internal::box_of::<D, A>(world_box),
            max_depth,
            options.max_entities_per_node,
            options.estimated_entity_count,
        );
    }

    /// Bulk-build the tree over a point collection.
    pub fn build<C>(points: &C, options: TreeOptions<D, A>) -> Self
    where
        C: GeometryCollection<A::Vector, Id = E> + Sync + ?Sized,
    {
        let mut tree = Self::new();
        let world = match &options.world_box {
            Some(world_box) => internal::box_of::<D, A>(world_box),
            None => internal::box_of_points::<D, A>(points.iter_entities().map(|(_, p)| p)),
        };
        let entity_count = points.len();
        let max_depth = match options.max_depth {
            Some(depth) if depth > 0 => depth,
            _ => Self::estimate_max_depth(entity_count, options.max_entities_per_node),
        };
        tree.core.init(
            world,
            max_depth,
            options.max_entities_per_node,
            entity_count.max(1),
        );
        if entity_count == 0 {
            return tree;
        }
        tree.core.nodes.reserve(TreeCore::<D, A, K, E>::estimate_node_number(
            entity_count,
            max_depth,
            options.max_entities_per_node,
        ));

        let grid = tree.core.grid;
        let mut locations: Vec<(K, E)> = points
            .iter_entities()
            .map(|(id, _)| (K::zero(), id))
            .collect();
        match options.execution {
            Execution::Sequential => {
                for (location, id) in locations.iter_mut() {
                    *location = encode::<D, K>(&grid.point_grid(points.geometry(*id), false));
                }
            }
            Execution::Parallel => {
                locations.par_iter_mut().for_each(|(location, id)| {
                    *location = encode::<D, K>(&grid.point_grid(points.geometry(*id), false));
                });
                locations.par_sort_unstable_by(|left, right| left.0.cmp(&right.0));
            }
        }

        let sorted = options.execution == Execution::Parallel;
        tree.build_dfs(&mut locations, sorted);
        log::debug!(
            "built point tree: {} entities, {} nodes, depth {}",
            entity_count,
            tree.core.nodes.len(),
            max_depth
        );
        tree
    }

    /// Depth-first construction over the location/id pairs. With `sorted`
    /// the child spans come from partition points, otherwise each node
    /// partitions its span in place.
    fn build_dfs(&mut self, locations: &mut [(K, E)], sorted: bool) {
        let d = Self::DIMS;
        let max_depth = self.core.max_depth;
        let root = root_key::<K>();
        let root_node = self.core.nodes.remove(&root).expect("missing root node");

        let mut stack: Vec<BuildFrame<D, K, RealOf<D, A>>> =
            Vec::with_capacity(max_depth as usize + 1);
        stack.push(BuildFrame {
            key: root,
            node: root_node,
            end: locations.len(),
        });
        let mut cursor = 0usize;

        while let Some(top) = stack.len().checked_sub(1) {
            let depth = top as u8;
            let end = stack[top].end;
            let count = end - cursor;
            let is_leaf = (count > 0
                && count <= self.core.max_entities
                && !stack[top].node.children.any())
                || depth == max_depth;
            if is_leaf && count > 0 {
                let segment = self.core.arena.allocate(count);
                let slice = self.core.arena.slice_mut(&segment);
                for (slot, (_, id)) in slice.iter_mut().zip(locations[cursor..end].iter()) {
                    *slot = *id;
                }
                stack[top].node.entities = segment;
                cursor = end;
            }

            if cursor == end {
                if let Some(frame) = stack.pop() {
                    self.core.nodes.insert(frame.key, frame.node);
                }
                continue;
            }

            // Open the child the next pending location belongs to.
            let child_depth = depth + 1;
            let level = max_depth - child_depth;
            let checker = ChildChecker::new(level, locations[cursor].0, d);
            let child_id = checker.child_id(level, d);
            let child_key = ChildKeyGenerator::new(stack[top].key, d).child_key(child_id);
            stack[top].node.children.add(child_id);
            let span = cursor
                + if sorted {
                    locations[cursor..end].partition_point(|(location, _)| checker.test(*location))
                } else {
                    partition_in_place(&mut locations[cursor..end], |(location, _)| {
                        checker.test(*location)
                    })
                };
            let child_node = self
                .core
                .make_child_node(stack[top].node.center_hint(), child_key);
            stack.push(BuildFrame {
                key: child_key,
                node: child_node,
                end: span,
            });
        }
    }

    // --- location helpers ---

    #[inline]
    fn location_id(&self, point: &A::Vector, clamp_outside: bool) -> K {
        encode::<D, K>(&self.core.grid.point_grid(point, clamp_outside))
    }

    #[inline]
    fn point_in_world(&self, point: &A::Vector) -> bool {
        internal::box_contains_point::<D, A>(self.core.grid.world(), point, RealOf::<D, A>::zero())
    }

    /// Key of the node a point belongs to at maximum depth.
    pub fn node_key_of(&self, point: &A::Vector) -> K {
        hash_key(self.core.max_depth, self.location_id(point, false), Self::DIMS)
    }

    /// Smallest existing node containing the point; the zero key when the
    /// point is outside the world.
    pub fn find_smallest_node(&self, point: &A::Vector) -> K {
        if !self.point_in_world(point) {
            return K::zero();
        }
        self.core.find_smallest_key(self.node_key_of(point))
    }

    // --- edit ---

    /// Insert into the smallest existing node of the branch, or down to the
    /// entity's own node when `to_leaf`. Returns `false` when the point is
    /// outside the world.
    pub fn insert(&mut self, id: E, point: &A::Vector, to_leaf: bool) -> bool {
        if !self.point_in_world(point) {
            return false;
        }
        let entity_key = self.node_key_of(point);
        let smallest = self.core.find_smallest_key(entity_key);
        if !is_valid_key(smallest) {
            return false;
        }
        self.core
            .insert_without_rebalancing_base(smallest, entity_key, id, to_leaf)
    }

    /// Insert, splitting any node the insertion overfills.
    pub fn insert_with_rebalancing<C>(&mut self, id: E, point: &A::Vector, points: &C) -> bool
    where
        C: GeometryCollection<A::Vector, Id = E> + ?Sized,
    {
        if !self.point_in_world(point) {
            return false;
        }
        let location = RangeLocation::of_point(self.core.max_depth, self.location_id(point, false));
        let (parent, parent_depth) = self
            .core
            .find_smallest_key_with_depth(self.core.location_key(&location));
        if !is_valid_key(parent) {
            return false;
        }
        let grid = self.core.grid;
        let max_depth = self.core.max_depth;
        let location_of = move |entity: E| {
            RangeLocation::of_point(
                max_depth,
                encode::<D, K>(&grid.point_grid(points.geometry(entity), false)),
            )
        };
        self.core
            .insert_with_rebalancing_base(parent, parent_depth, false, &location, id, &location_of)
    }

    /// Insert unless another point already lies within `tolerance`.
    pub fn insert_unique<C>(
        &mut self,
        id: E,
        point: &A::Vector,
        tolerance: RealOf<D, A>,
        points: &C,
        to_leaf: bool,
    ) -> bool
    where
        C: GeometryCollection<A::Vector, Id = E> + ?Sized,
    {
        if !self.point_in_world(point) {
            return false;
        }
        if !self
            .nearest_neighbors_within(point, 1, tolerance, points)
            .is_empty()
        {
            return false;
        }
        if to_leaf {
            let entity_key = self.node_key_of(point);
            let smallest = self.core.find_smallest_key(entity_key);
            self.core
                .insert_without_rebalancing_base(smallest, entity_key, id, true)
        } else {
            self.insert_with_rebalancing(id, point, points)
        }
    }

    /// Erase an id wherever it is, scanning nodes. With `update_ids` every id
    /// greater than the erased one is decremented afterwards (contiguous
    /// collections only; run multiple erases in descending id order).
    pub fn erase_entity(&mut self, id: E, update_ids: bool) -> bool {
        self.core.erase_base(id, false, update_ids)
    }

    /// Erase an id, finding its node through the point geometry.
    pub fn erase(&mut self, id: E, point: &A::Vector, update_ids: bool) -> bool {
        let node_key = self.find_smallest_node(point);
        if !is_valid_key(node_key) {
            return false;
        }
        if !self.core.remove_entity_from_node(&node_key, id) {
            return false;
        }
        if update_ids {
            self.core.shift_ids_down(id);
        }
        self.core.remove_node_if_possible(node_key);
        true
    }

    /// Re-home an id at a new point.
    pub fn update(&mut self, id: E, new_point: &A::Vector, to_leaf: bool) -> bool {
        if !self.point_in_world(new_point) {
            return false;
        }
        if !self.erase_entity(id, false) {
            return false;
        }
        self.insert(id, new_point, to_leaf)
    }

    /// Re-home an id, using the old point to locate the erase.
    pub fn update_with_old(
        &mut self,
        id: E,
        old_point: &A::Vector,
        new_point: &A::Vector,
        to_leaf: bool,
    ) -> bool {
        if !self.point_in_world(new_point) {
            return false;
        }
        if !self.erase(id, old_point, false) {
            return false;
        }
        self.insert(id, new_point, to_leaf)
    }

    /// Re-home an id with node rebalancing.
    pub fn update_with_rebalancing<C>(&mut self, id: E, new_point: &A::Vector, points: &C) -> bool
    where
        C: GeometryCollection<A::Vector, Id = E> + ?Sized,
    {
        if !self.point_in_world(new_point) {
            return false;
        }
        if !self.erase_entity(id, false) {
            return false;
        }
        self.insert_with_rebalancing(id, new_point, points)
    }

    // --- queries ---

    /// Whether any indexed point coincides with `point` within `tolerance`.
    pub fn contains<C>(&self, point: &A::Vector, points: &C, tolerance: RealOf<D, A>) -> bool
    where
        C: GeometryCollection<A::Vector, Id = E> + ?Sized,
    {
        let smallest = self.find_smallest_node(point);
        if !is_valid_key(smallest) {
            return false;
        }
        self.core
            .entities_of(self.core.node(&smallest))
            .iter()
            .any(|&id| A::points_equal(point, points.geometry(id), tolerance))
    }

    /// All ids whose point lies inside `range` (inclusive of faces).
    pub fn range_search<C>(&self, range: &A::Box, points: &C) -> Vec<E>
    where
        C: GeometryCollection<A::Vector, Id = E> + ?Sized,
    {
        let mut out = Vec::new();
        let filter = |id: E| {
            A::does_box_contain_point(range, points.geometry(id), RealOf::<D, A>::zero())
        };
        self.core.range_search_root(
            range,
            points.len(),
            true,
            |out| out.extend(points.iter_entities().map(|(id, _)| id)),
            &filter,
            &mut out,
        );
        out
    }

    /// Ids whose point lies on the hyperplane within `tolerance`.
    pub fn plane_search<C>(
        &self,
        origin_distance: RealOf<D, A>,
        normal: &A::Vector,
        tolerance: RealOf<D, A>,
        points: &C,
    ) -> Vec<E>
    where
        C: GeometryCollection<A::Vector, Id = E> + ?Sized,
    {
        self.core
            .plane_intersection_base(origin_distance, normal, tolerance, &|id| {
                A::point_plane_relation(points.geometry(id), origin_distance, normal, tolerance)
            })
    }

    /// Ids whose point lies on the caller plane within `tolerance`.
    pub fn plane_search_of<C>(&self, plane: &A::Plane, tolerance: RealOf<D, A>, points: &C) -> Vec<E>
    where
        C: GeometryCollection<A::Vector, Id = E> + ?Sized,
    {
        self.plane_search(
            A::plane_origin_distance(plane).to_real(),
            A::plane_normal(plane),
            tolerance,
            points,
        )
    }

    /// Ids on the positive side of the hyperplane (or on it).
    pub fn plane_positive_segmentation<C>(
        &self,
        origin_distance: RealOf<D, A>,
        normal: &A::Vector,
        tolerance: RealOf<D, A>,
        points: &C,
    ) -> Vec<E>
    where
        C: GeometryCollection<A::Vector, Id = E> + ?Sized,
    {
        self.core
            .plane_positive_segmentation_base(origin_distance, normal, tolerance, &|id| {
                A::point_plane_relation(points.geometry(id), origin_distance, normal, tolerance)
            })
    }

    /// Ids inside or on the boundary of the volume the planes enclose.
    pub fn frustum_culling<C>(
        &self,
        boundary_planes: &[A::Plane],
        tolerance: RealOf<D, A>,
        points: &C,
    ) -> Vec<E>
    where
        C: GeometryCollection<A::Vector, Id = E> + ?Sized,
    {
        self.core
            .frustum_culling_base(boundary_planes, tolerance, &|id, plane| {
                A::point_plane_relation(
                    points.geometry(id),
                    A::plane_origin_distance(plane).to_real(),
                    A::plane_normal(plane),
                    tolerance,
                )
            })
    }

    /// The `k` ids nearest to `search`, ascending by distance; ids break
    /// distance ties.
    pub fn nearest_neighbors<C>(&self, search: &A::Vector, k: usize, points: &C) -> Vec<E>
    where
        C: GeometryCollection<A::Vector, Id = E> + ?Sized,
    {
        self.nearest_neighbors_within(search, k, RealOf::<D, A>::max_value(), points)
    }

    /// k-NN bounded to strictly-closer-than `max_distance`.
    pub fn nearest_neighbors_within<C>(
        &self,
        search: &A::Vector,
        k: usize,
        max_distance: RealOf<D, A>,
        points: &C,
    ) -> Vec<E>
    where
        C: GeometryCollection<A::Vector, Id = E> + ?Sized,
    {
        let d = Self::DIMS;
        if k == 0 || self.core.nodes.is_empty() {
            return Vec::new();
        }

        let mut heap: BinaryHeap<EntityDistance<E, RealOf<D, A>>> = BinaryHeap::with_capacity(k);
        let mut farthest = max_distance;

        let entity_key = hash_key(self.core.max_depth, self.location_id(search, true), d);
        let mut smallest = self.core.find_smallest_key(entity_key);
        if !is_valid_key(smallest) {
            smallest = root_key();
        }

        // Entities of the start node and every ancestor are candidates
        // before the wall-distance expansion starts.
        let mut ancestor = smallest;
        while is_valid_key(ancestor) {
            self.add_entity_distances(
                self.core.node(&ancestor),
                search,
                points,
                k,
                &mut heap,
                &mut farthest,
            );
            ancestor = parent_key(ancestor, d);
        }

        let mut previous = K::zero();
        let mut current = smallest;
        while is_valid_key(current) {
            let node = self.core.node(&current);
            let wall = self.node_wall_distance(search, &current, node, false);
            self.knn_expand(current, current, previous, search, points, k, &mut heap, &mut farthest);
            if farthest < wall {
                break;
            }
            previous = current;
            current = parent_key(current, d);
        }

        heap.into_sorted_vec()
            .into_iter()
            .map(|entry| entry.id)
            .collect()
    }

    fn node_wall_distance(
        &self,
        search: &A::Vector,
        key: &K,
        node: &Node<D, K, RealOf<D, A>>,
        inside_is_zero: bool,
    ) -> RealOf<D, A> {
        let depth = depth_of_key(*key, Self::DIMS);
        let half = self.core.node_size(depth + 1);
        let center = self.core.node_center(key, node);
        internal::wall_distance::<D, A>(search, &center, half, inside_is_zero)
    }

    fn add_entity_distances<C>(
        &self,
        node: &Node<D, K, RealOf<D, A>>,
        search: &A::Vector,
        points: &C,
        k: usize,
        heap: &mut BinaryHeap<EntityDistance<E, RealOf<D, A>>>,
        farthest: &mut RealOf<D, A>,
    ) where
        C: GeometryCollection<A::Vector, Id = E> + ?Sized,
    {
        for &id in self.core.entities_of(node) {
            let distance = A::distance(search, points.geometry(id));
            let candidate = EntityDistance { distance, id };
            if heap.len() < k {
                if distance >= *farthest {
                    continue;
                }
                heap.push(candidate);
            } else {
                // Full heap: admission follows the full (distance, id)
                // order, so equal-distance candidates at the k-th boundary
                // still displace larger ids.
                let replaces = heap
                    .peek()
                    .map(|worst| candidate < *worst)
                    .unwrap_or(false);
                if !replaces {
                    continue;
                }
                heap.pop();
                heap.push(candidate);
            }
            if heap.len() == k {
                if let Some(worst) = heap.peek() {
                    *farthest = worst.distance;
                }
            }
        }
    }

    /// Expand a subtree in order of increasing wall distance, pruning by the
    /// current k-th distance. The start node's own entities were counted by
    /// the ancestor pre-pass; the `previous` subtree was fully handled in an
    /// earlier round.
    #[allow(clippy::too_many_arguments)]
    fn knn_expand<C>(
        &self,
        key: K,
        start: K,
        previous: K,
        search: &A::Vector,
        points: &C,
        k: usize,
        heap: &mut BinaryHeap<EntityDistance<E, RealOf<D, A>>>,
        farthest: &mut RealOf<D, A>,
    ) where
        C: GeometryCollection<A::Vector, Id = E> + ?Sized,
    {
        if key != start && key == previous {
            return;
        }
        let node = self.core.node(&key);
        if key != start {
            self.add_entity_distances(node, search, points, k, heap, farthest);
        }

        let mut children: SmallVec<[(K, RealOf<D, A>); 8]> = SmallVec::new();
        for child_key in node.child_keys() {
            let child = self.core.node(&child_key);
            let wall = self.node_wall_distance(search, &child_key, child, true);
            if wall > *farthest {
                continue;
            }
            children.push((child_key, wall));
        }
        children.sort_unstable_by(|left, right| {
            left.1
                .partial_cmp(&right.1)
                .unwrap_or(core::cmp::Ordering::Equal)
        });
        for (child_key, wall) in children {
            if wall > *farthest {
                continue;
            }
            self.knn_expand(child_key, start, previous, search, points, k, heap, farthest);
        }
    }

    // --- shared surface ---

    /// Number of live nodes, the permanent root included.
    pub fn node_count(&self) -> usize {
        self.core.nodes.len()
    }

    /// Maximum subdivision depth.
    pub fn max_depth(&self) -> u8 {
        self.core.max_depth
    }

    /// The world box.
    pub fn world_box(&self) -> &FloatBox<D, RealOf<D, A>> {
        self.core.grid.world()
    }

    /// Ids stored directly on a node.
    pub fn node_entities(&self, key: K) -> &[E] {
        self.core.entities_of(self.core.node(&key))
    }

    /// Box of a node's cell.
    pub fn node_box(&self, key: K) -> FloatBox<D, RealOf<D, A>> {
        let node = self.core.node(&key);
        let center = self.core.node_center(&key, node);
        self.core.node_box(depth_of_key(key, Self::DIMS), &center)
    }

    /// Breadth-first traversal from `root`; subtrees whose node fails
    /// `selector` are pruned.
    pub fn visit_nodes(
        &self,
        root: K,
        mut selector: impl FnMut(K, &[E]) -> bool,
        mut procedure: impl FnMut(K, &[E]),
    ) {
        self.core.visit_nodes(
            root,
            &mut |key, node| selector(*key, self.core.entities_of(node)),
            &mut |key, node| procedure(*key, self.core.entities_of(node)),
        );
    }

    /// All ids in breadth-first node order.
    pub fn collect_all_entities_in_bfs(&self, sort_inside_nodes: bool) -> Vec<E> {
        self.core.collect_bfs(root_key(), sort_inside_nodes)
    }

    /// All ids in depth-first pre-order.
    pub fn collect_all_entities_in_dfs(&self, sort_inside_nodes: bool) -> Vec<E> {
        let mut out = Vec::new();
        self.core
            .collect_dfs_into(&root_key(), &mut out, sort_inside_nodes);
        out
    }

    /// Node currently holding `id`, found by linear scan; zero key if absent.
    pub fn find(&self, id: E) -> K {
        self.core.find_entity_node(id)
    }

    /// Replace or drop ids wholesale.
    pub fn update_indexes<S: core::hash::BuildHasher>(&mut self, updates: &HashMap<E, Option<E>, S>) {
        self.core.update_indexes(updates);
    }

    /// Translate the tree and its world box.
    pub fn move_by(&mut self, by: &A::Vector, execution: Execution)
    where
        A::Vector: Sync,
    {
        self.core.move_by(by, execution);
    }

    /// Tear everything down; `init` is required before reuse.
    pub fn reset(&mut self) {
        self.core.reset();
    }

    /// Drop all entities and nodes except the root.
    pub fn clear(&mut self) {
        self.core.clear();
    }

    /// Depth heuristic for `entity_count` entities at `max_entities` a node.
    pub fn estimate_max_depth(entity_count: usize, max_entities: usize) -> u8 {
        TreeCore::<D, A, K, E>::estimate_max_depth(entity_count, max_entities)
    }

    #[cfg(test)]
    pub(crate) fn is_every_entity_unique(&self) -> bool {
        self.core.is_every_entity_unique()
    }

    #[cfg(test)]
    pub(crate) fn assert_parent_child_keys_consistent(&self) {
        for (key, node) in self.core.nodes.iter() {
            for child_key in node.child_keys() {
                assert!(self.core.nodes.contains_key(&child_key));
                assert_eq!(parent_key(child_key, Self::DIMS), *key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orthant_geometry::{BoxND, Cartesian};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    type Quad = PointTree<2, Cartesian<2, f64>, u32, usize>;
    type Oct = PointTree<3, Cartesian<3, f64>, u32, usize>;

    fn brute_force_range(points: &[[f64; 2]], range: &BoxND<2, f64>) -> Vec<usize> {
        points
            .iter()
            .enumerate()
            .filter(|(_, p)| {
                (0..2).all(|dim| range.min[dim] <= p[dim] && p[dim] <= range.max[dim])
            })
            .map(|(id, _)| id)
            .collect()
    }

    fn brute_force_knn(points: &[[f64; 3]], search: [f64; 3], k: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..points.len()).collect();
        order.sort_by(|&a, &b| {
            let da: f64 = (0..3).map(|i| (points[a][i] - search[i]).powi(2)).sum();
            let db: f64 = (0..3).map(|i| (points[b][i] - search[i]).powi(2)).sum();
            da.partial_cmp(&db)
                .unwrap_or(core::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });
        order.truncate(k);
        order
    }

    #[test]
    fn scenario_three_diagonal_points() {
        let points = vec![[0.0, 0.0], [1.0, 1.0], [2.0, 2.0]];
        let tree = Quad::build(
            &points,
            TreeOptions {
                max_depth: Some(3),
                ..Default::default()
            },
        );

        let mut found = tree.range_search(&BoxND::new([0.5, 0.5], [2.5, 2.5]), &points);
        found.sort_unstable();
        assert_eq!(found, vec![1, 2]);

        let neighbors = tree.nearest_neighbors(&[1.1, 1.1], 2, &points);
        assert_eq!(neighbors, vec![1, 2]);
    }

    #[test]
    fn build_covers_every_entity_exactly_once() {
        let mut rng = StdRng::seed_from_u64(42);
        let points: Vec<[f64; 2]> = (0..300)
            .map(|_| [rng.gen_range(0.0..100.0), rng.gen_range(0.0..100.0)])
            .collect();
        let tree = Quad::build(
            &points,
            TreeOptions {
                max_depth: Some(4),
                max_entities_per_node: 4,
                ..Default::default()
            },
        );
        let mut ids = tree.collect_all_entities_in_bfs(false);
        ids.sort_unstable();
        assert_eq!(ids, (0..300).collect::<Vec<_>>());
        assert!(tree.is_every_entity_unique());
        tree.assert_parent_child_keys_consistent();
    }

    #[test]
    fn parallel_build_matches_serial() {
        let mut rng = StdRng::seed_from_u64(7);
        let points: Vec<[f64; 2]> = (0..500)
            .map(|_| [rng.gen_range(0.0..64.0), rng.gen_range(0.0..64.0)])
            .collect();
        let serial = Quad::build(
            &points,
            TreeOptions {
                max_depth: Some(5),
                max_entities_per_node: 8,
                ..Default::default()
            },
        );
        let parallel = Quad::build(
            &points,
            TreeOptions {
                max_depth: Some(5),
                max_entities_per_node: 8,
                execution: Execution::Parallel,
                ..Default::default()
            },
        );
        assert_eq!(serial.node_count(), parallel.node_count());
        for (key, node) in serial.core.nodes.iter() {
            let mut left = serial.core.entities_of(node).to_vec();
            let mut right = parallel.node_entities(*key).to_vec();
            left.sort_unstable();
            right.sort_unstable();
            assert_eq!(left, right, "node {key:?} differs between builds");
        }
    }

    #[test]
    fn range_search_matches_brute_force() {
        let mut rng = StdRng::seed_from_u64(11);
        let points: Vec<[f64; 2]> = (0..400)
            .map(|_| [rng.gen_range(0.0..32.0), rng.gen_range(0.0..32.0)])
            .collect();
        let tree = Quad::build(
            &points,
            TreeOptions {
                max_depth: Some(5),
                max_entities_per_node: 6,
                ..Default::default()
            },
        );
        for _ in 0..50 {
            let low = [rng.gen_range(0.0..28.0), rng.gen_range(0.0..28.0)];
            let range = BoxND::new(
                low,
                [low[0] + rng.gen_range(0.5..8.0), low[1] + rng.gen_range(0.5..8.0)],
            );
            let mut found = tree.range_search(&range, &points);
            found.sort_unstable();
            assert_eq!(found, brute_force_range(&points, &range));
        }
    }

    #[test]
    fn knn_matches_brute_force() {
        let mut rng = StdRng::seed_from_u64(3);
        let points: Vec<[f64; 3]> = (0..200)
            .map(|_| {
                [
                    rng.gen_range(0.0..16.0),
                    rng.gen_range(0.0..16.0),
                    rng.gen_range(0.0..16.0),
                ]
            })
            .collect();
        let tree = Oct::build(
            &points,
            TreeOptions {
                max_depth: Some(4),
                max_entities_per_node: 5,
                ..Default::default()
            },
        );
        for _ in 0..25 {
            let search = [
                rng.gen_range(-2.0..18.0),
                rng.gen_range(-2.0..18.0),
                rng.gen_range(-2.0..18.0),
            ];
            for k in [1usize, 3, 10] {
                let got = tree.nearest_neighbors(&search, k, &points);
                assert_eq!(got, brute_force_knn(&points, search, k));
            }
        }
    }

    #[test]
    fn knn_tie_breaks_by_ascending_id() {
        // Two points exactly equidistant from the query.
        let points = vec![[2.0, 0.0, 0.0], [0.0, 0.0, 0.0], [2.0, 2.0, 2.0]];
        let tree = Oct::build(
            &points,
            TreeOptions {
                max_depth: Some(3),
                ..Default::default()
            },
        );
        let neighbors = tree.nearest_neighbors(&[1.0, 0.0, 0.0], 2, &points);
        assert_eq!(neighbors.len(), 2);
        assert_eq!(neighbors, vec![0, 1]);

        // More equidistant points than k: the smallest ids must win no
        // matter which node the walk reaches first.
        let ring = vec![[1.0, 0.0, 0.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let tree = Oct::build(
            &ring,
            TreeOptions {
                max_depth: Some(3),
                ..Default::default()
            },
        );
        assert_eq!(tree.nearest_neighbors(&[0.0, 0.0, 0.0], 1, &ring), vec![0]);
        assert_eq!(tree.nearest_neighbors(&[0.0, 0.0, 0.0], 2, &ring), vec![0, 1]);
    }

    #[test]
    fn insert_and_erase_round_trip() {
        let mut points = vec![[1.0, 1.0], [6.0, 6.0], [3.0, 4.0]];
        let mut tree = Quad::build(
            &points,
            TreeOptions {
                world_box: Some(BoxND::new([0.0, 0.0], [8.0, 8.0])),
                max_depth: Some(3),
                max_entities_per_node: 2,
                ..Default::default()
            },
        );

        points.push([5.0, 5.0]);
        assert!(tree.insert_with_rebalancing(3, &points[3], &points));
        let mut ids = tree.collect_all_entities_in_dfs(false);
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3]);

        assert!(tree.erase(3, &[5.0, 5.0], false));
        let mut ids = tree.collect_all_entities_in_dfs(false);
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2]);

        // Inserting again restores the previous entity set.
        assert!(tree.insert_with_rebalancing(3, &points[3], &points));
        let mut ids = tree.collect_all_entities_in_dfs(false);
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3]);

        // Out-of-world input is rejected without a state change.
        assert!(!tree.insert(4, &[9.5, 0.0], false));
        assert!(!tree.erase(0, &[-1.0, 0.0], false));
    }

    #[test]
    fn erase_with_id_compaction() {
        let points = vec![[1.0, 1.0], [2.0, 2.0], [3.0, 3.0], [6.0, 7.0]];
        let mut tree = Quad::build(
            &points,
            TreeOptions {
                max_depth: Some(3),
                max_entities_per_node: 1,
                ..Default::default()
            },
        );
        assert!(tree.erase(1, &[2.0, 2.0], true));
        let mut ids = tree.collect_all_entities_in_bfs(false);
        ids.sort_unstable();
        // Former ids 2 and 3 slid down by one.
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn insert_unique_respects_tolerance() {
        let mut points = vec![[1.0, 1.0], [4.0, 4.0]];
        let mut tree = Quad::build(
            &points,
            TreeOptions {
                world_box: Some(BoxND::new([0.0, 0.0], [8.0, 8.0])),
                max_depth: Some(3),
                ..Default::default()
            },
        );
        points.push([1.05, 1.0]);
        assert!(!tree.insert_unique(2, &[1.05, 1.0], 0.1, &points, false));
        points[2] = [2.5, 2.5];
        assert!(tree.insert_unique(2, &[2.5, 2.5], 0.1, &points, false));
        assert_eq!(tree.collect_all_entities_in_bfs(true).len(), 3);
    }

    #[test]
    fn contains_finds_coincident_points() {
        let points = vec![[1.0, 2.0], [5.0, 5.0]];
        let tree = Quad::build(
            &points,
            TreeOptions {
                max_depth: Some(3),
                ..Default::default()
            },
        );
        assert!(tree.contains(&[1.0, 2.0], &points, 1e-9));
        assert!(!tree.contains(&[1.5, 2.0], &points, 1e-9));
    }

    #[test]
    fn move_commutes_with_queries() {
        let points = vec![[0.0, 0.0], [1.0, 1.0], [2.0, 2.0]];
        let mut moved_points = points.clone();
        let mut tree = Quad::build(
            &points,
            TreeOptions {
                max_depth: Some(3),
                ..Default::default()
            },
        );
        let before = tree.range_search(&BoxND::new([0.5, 0.5], [2.5, 2.5]), &points);

        tree.move_by(&[10.0, 0.0], Execution::Sequential);
        for p in moved_points.iter_mut() {
            p[0] += 10.0;
        }
        let mut after = tree.range_search(&BoxND::new([10.5, 0.5], [12.5, 2.5]), &moved_points);
        after.sort_unstable();
        let mut before = before;
        before.sort_unstable();
        assert_eq!(before, after);
    }

    #[test]
    fn plane_search_splits_point_sets() {
        let points = vec![[0.0, 0.0], [2.0, 0.0], [4.0, 0.0], [2.0, 3.0]];
        let tree = Quad::build(
            &points,
            TreeOptions {
                max_depth: Some(3),
                ..Default::default()
            },
        );
        // Vertical plane x = 2.
        let on_plane = tree.plane_search(2.0, &[1.0, 0.0], 0.25, &points);
        let mut on_plane = on_plane;
        on_plane.sort_unstable();
        assert_eq!(on_plane, vec![1, 3]);

        let mut positive = tree.plane_positive_segmentation(2.0, &[1.0, 0.0], 0.25, &points);
        positive.sort_unstable();
        assert_eq!(positive, vec![1, 2, 3]);
    }

    #[test]
    fn frustum_culling_intersects_plane_half_spaces() {
        use orthant_geometry::PlaneND;
        let points = vec![[1.0, 1.0], [3.0, 1.0], [5.0, 1.0]];
        let tree = Quad::build(
            &points,
            TreeOptions {
                max_depth: Some(3),
                ..Default::default()
            },
        );
        // Band 2 <= x <= 4.
        let planes = [
            PlaneND {
                origin_distance: 2.0,
                normal: [1.0, 0.0],
            },
            PlaneND {
                origin_distance: -4.0,
                normal: [-1.0, 0.0],
            },
        ];
        let culled = tree.frustum_culling(&planes, 0.0, &points);
        assert_eq!(culled, vec![1]);
    }

    #[test]
    fn update_moves_an_entity() {
        let mut points = vec![[1.0, 1.0], [6.0, 6.0]];
        let mut tree = Quad::build(
            &points,
            TreeOptions {
                world_box: Some(BoxND::new([0.0, 0.0], [8.0, 8.0])),
                max_depth: Some(3),
                ..Default::default()
            },
        );
        points[0] = [7.0, 7.0];
        assert!(tree.update_with_rebalancing(0, &[7.0, 7.0], &points));
        let found = tree.range_search(&BoxND::new([6.5, 6.5], [7.5, 7.5]), &points);
        assert_eq!(found, vec![0]);
    }

    #[test]
    #[should_panic(expected = "max_depth")]
    fn zero_depth_init_panics() {
        let mut tree = Quad::new();
        tree.init(
            &BoxND::new([0.0, 0.0], [1.0, 1.0]),
            0,
            &TreeOptions::default(),
        );
    }

    #[test]
    fn empty_build_has_only_the_root() {
        let points: Vec<[f64; 2]> = Vec::new();
        let tree = Quad::build(
            &points,
            TreeOptions {
                world_box: Some(BoxND::new([0.0, 0.0], [1.0, 1.0])),
                max_depth: Some(3),
                ..Default::default()
            },
        );
        assert_eq!(tree.node_count(), 1);
        assert!(tree.range_search(&BoxND::new([0.0, 0.0], [1.0, 1.0]), &points).is_empty());
    }
}
