// Copyright 2025 the Orthant Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! State and algorithms shared by the point and box trees.
//!
//! The core owns the node store, the entity id arena, the grid, and the
//! per-depth node size cache. The tree front ends supply the per-entity
//! geometry knowledge (how to rasterize one entity, how to filter one entity
//! against a query) as closures, so the balance of the edit and query logic
//! lives here exactly once.

use std::collections::{HashMap, VecDeque};

use num_traits::{ToPrimitive, Zero};
use orthant_geometry::internal::{self, FloatBox, FloatVector};
use orthant_geometry::{Adaptor, PlaneRelation, Real, RealOf, Scalar};
use smallvec::SmallVec;

use crate::arena::SegmentArena;
use crate::collection::EntityId;
use crate::key::{MortonKey, NodeStore};
use crate::morton::{
    child_id_at_level, child_id_by_depth, child_id_of_key, child_mask, depth_of_key, encode,
    hash_at_depth, is_all_child_touched, is_child_in_greater_segment, is_valid_key,
    max_theoretical_depth, parent_key, range_location, root_key, ChildId, ChildKeyGenerator,
    RangeLocation,
};
use crate::node::Node;

/// Default cap on entities per node before a split is attempted.
pub const DEFAULT_MAX_ENTITIES_PER_NODE: usize = 20;

/// Default arena sizing when no entity count estimate is available.
pub const DEFAULT_ESTIMATED_ENTITY_COUNT: usize = 4096;

/// Execution mode of bulk operations.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Execution {
    /// Single-threaded; partitions the working set in place.
    #[default]
    Sequential,
    /// Data-parallel location computation and sorting on the rayon pool.
    Parallel,
}

/// Construction options of a tree.
///
/// ```rust
/// use orthant_tree::{Execution, TreeOptions};
/// use orthant_geometry::Cartesian;
///
/// let options = TreeOptions::<2, Cartesian<2, f64>> {
///     max_depth: Some(3),
///     max_entities_per_node: 2,
///     ..Default::default()
/// };
/// assert_eq!(options.execution, Execution::Sequential);
/// ```
pub struct TreeOptions<const D: usize, A: Adaptor<D>> {
    /// World box of the tree; computed from the data when absent.
    pub world_box: Option<A::Box>,
    /// Subdivision depth; estimated from the entity count when absent.
    pub max_depth: Option<u8>,
    /// Entities a node may hold before entities are pushed down.
    pub max_entities_per_node: usize,
    /// Arena sizing hint for [`init`](crate::PointTree::init)-style usage;
    /// bulk builds size from the collection instead.
    pub estimated_entity_count: usize,
    /// Bulk build execution mode.
    pub execution: Execution,
}

impl<const D: usize, A: Adaptor<D>> Default for TreeOptions<D, A> {
    fn default() -> Self {
        Self {
            world_box: None,
            max_depth: None,
            max_entities_per_node: DEFAULT_MAX_ENTITIES_PER_NODE,
            estimated_entity_count: DEFAULT_ESTIMATED_ENTITY_COUNT,
            execution: Execution::Sequential,
        }
    }
}

/// Entity id tagged with a distance, ordered by distance then id so ties
/// break deterministically by ascending id.
#[derive(Copy, Clone, Debug)]
pub(crate) struct EntityDistance<E, R> {
    pub(crate) distance: R,
    pub(crate) id: E,
}

impl<E: Eq, R: PartialEq> PartialEq for EntityDistance<E, R> {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance && self.id == other.id
    }
}

impl<E: Eq, R: PartialEq> Eq for EntityDistance<E, R> {}

impl<E: Ord + Eq, R: PartialOrd> PartialOrd for EntityDistance<E, R> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<E: Ord + Eq, R: PartialOrd> Ord for EntityDistance<E, R> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(core::cmp::Ordering::Equal)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Sort and unique a result id list; the one dedup point for queries that
/// can observe split-mode duplicates.
pub(crate) fn dedup_ids<E: Ord>(ids: &mut Vec<E>) {
    ids.sort_unstable();
    ids.dedup();
}

/// Sort and unique a result pair list.
pub(crate) fn dedup_pairs<E: Ord>(pairs: &mut Vec<(E, E)>) {
    pairs.sort_unstable();
    pairs.dedup();
}

pub(crate) struct TreeCore<const D: usize, A: Adaptor<D>, K: MortonKey, E: EntityId> {
    pub(crate) nodes: K::Store<Node<D, K, RealOf<D, A>>>,
    pub(crate) arena: SegmentArena<E>,
    pub(crate) grid: GridSpaceOf<D, A>,
    pub(crate) max_depth: u8,
    pub(crate) max_entities: usize,
    node_sizes: Vec<FloatVector<D, RealOf<D, A>>>,
}

pub(crate) type GridSpaceOf<const D: usize, A> = crate::grid::GridSpace<D, A>;

impl<const D: usize, A: Adaptor<D>, K: MortonKey, E: EntityId> core::fmt::Debug
    for TreeCore<D, A, K, E>
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TreeCore")
            .field("nodes", &self.nodes.len())
            .field("max_depth", &self.max_depth)
            .field("max_entities", &self.max_entities)
            .field("grid", &self.grid)
            .finish_non_exhaustive()
    }
}

impl<const D: usize, A: Adaptor<D>, K: MortonKey, E: EntityId> TreeCore<D, A, K, E> {
    pub(crate) const DIMS: u32 = D as u32;

    pub(crate) fn empty() -> Self {
        Self {
            nodes: Default::default(),
            arena: SegmentArena::default(),
            grid: GridSpaceOf::new(0, internal::FloatBox::zero()),
            max_depth: 0,
            max_entities: DEFAULT_MAX_ENTITIES_PER_NODE,
            node_sizes: Vec::new(),
        }
    }

    /// Seed the tree: world box, depth caches, root node, arena.
    pub(crate) fn init(
        &mut self,
        world: FloatBox<D, RealOf<D, A>>,
        max_depth: u8,
        max_entities: usize,
        estimated_entity_count: usize,
    ) {
        assert!(
            self.nodes.is_empty(),
            "init on a non-empty tree; call reset first"
        );
        assert!(max_depth >= 1, "max_depth must be at least 1");
        assert!(
            max_depth <= max_theoretical_depth::<K>(Self::DIMS),
            "max_depth exceeds what the key representation can address at this dimension"
        );
        assert!(max_depth <= 31, "max_depth exceeds the grid resolution width");
        assert!(max_entities >= 1, "max_entities_per_node must be at least 1");

        self.grid = GridSpaceOf::new(max_depth, world);
        self.max_depth = max_depth;
        self.max_entities = max_entities;

        // One half-size vector per depth, with slack because child and
        // grandchild half-sizes of bottom nodes are asked for.
        let depth_slots = max_depth as usize + 3;
        self.node_sizes = Vec::with_capacity(depth_slots);
        self.node_sizes.push(*self.grid.sizes());
        let half = RealOf::<D, A>::from_f64(0.5);
        for depth in 1..depth_slots {
            let mut size = self.node_sizes[depth - 1];
            for dim in 0..D {
                size[dim] = size[dim] * half;
            }
            self.node_sizes.push(size);
        }

        let root = Node::new(root_key::<K>(), internal::box_center(self.grid.world()));
        self.nodes.insert(root_key(), root);
        self.arena.init(estimated_entity_count);
        log::trace!(
            "initialized tree: D={D}, max_depth={max_depth}, max_entities={max_entities}"
        );
    }

    // --- node access ---

    #[inline]
    pub(crate) fn node(&self, key: &K) -> &Node<D, K, RealOf<D, A>> {
        self.nodes.get(key).expect("missing node key")
    }

    #[inline]
    pub(crate) fn node_mut(&mut self, key: &K) -> &mut Node<D, K, RealOf<D, A>> {
        self.nodes.get_mut(key).expect("missing node key")
    }

    #[inline]
    pub(crate) fn entities_of(&self, node: &Node<D, K, RealOf<D, A>>) -> &[E] {
        self.arena.slice(&node.entities)
    }

    /// Center of a node, cached or recomputed per the build configuration.
    #[cfg(feature = "cached-node-centers")]
    #[inline]
    pub(crate) fn node_center(
        &self,
        _key: &K,
        node: &Node<D, K, RealOf<D, A>>,
    ) -> FloatVector<D, RealOf<D, A>> {
        node.center
    }

    /// Center of a node, cached or recomputed per the build configuration.
    #[cfg(not(feature = "cached-node-centers"))]
    #[inline]
    pub(crate) fn node_center(
        &self,
        key: &K,
        _node: &Node<D, K, RealOf<D, A>>,
    ) -> FloatVector<D, RealOf<D, A>> {
        self.calculate_node_center(*key)
    }

    /// Center of a node's cell computed from its key alone.
    pub(crate) fn calculate_node_center(&self, key: K) -> FloatVector<D, RealOf<D, A>> {
        let grid = crate::morton::decode::<D, K>(key, self.max_depth);
        self.grid
            .cell_center(grid, self.max_depth - depth_of_key(key, Self::DIMS))
    }

    /// Full extents of nodes at `depth`.
    #[inline]
    pub(crate) fn node_size(&self, depth: u8) -> &FloatVector<D, RealOf<D, A>> {
        &self.node_sizes[depth as usize]
    }

    /// Box of a node from its depth and center.
    pub(crate) fn node_box(
        &self,
        depth: u8,
        center: &FloatVector<D, RealOf<D, A>>,
    ) -> FloatBox<D, RealOf<D, A>> {
        let half = self.node_size(depth + 1);
        let mut b = FloatBox {
            min: *center,
            max: *center,
        };
        for dim in 0..D {
            b.min[dim] = b.min[dim] - half[dim];
            b.max[dim] = b.max[dim] + half[dim];
        }
        b
    }

    /// Create the child node record, deriving its center from the parent's.
    pub(crate) fn make_child_node(
        &self,
        parent_center: FloatVector<D, RealOf<D, A>>,
        child_key: K,
    ) -> Node<D, K, RealOf<D, A>> {
        let depth = depth_of_key(child_key, Self::DIMS);
        let half = self.node_size(depth + 1);
        let child_id = child_id_of_key(child_key, Self::DIMS);
        let mut center = parent_center;
        for dim in 0..D {
            if is_child_in_greater_segment(child_id, dim) {
                center[dim] = center[dim] + half[dim];
            } else {
                center[dim] = center[dim] - half[dim];
            }
        }
        Node::new(child_key, center)
    }

    /// Register `child_id` under `parent_key` and insert the new child node.
    pub(crate) fn add_child_node(&mut self, parent_key: K, child_id: ChildId, child_key: K) {
        let parent_center = {
            let parent = self.node(&parent_key);
            self.node_center(&parent_key, parent)
        };
        let child = self.make_child_node(parent_center, child_key);
        self.node_mut(&parent_key).children.add(child_id);
        self.nodes.insert(child_key, child);
    }

    // --- entity segments ---

    pub(crate) fn add_entity(&mut self, key: &K, entity: E) {
        let mut segment = self.node(key).entities;
        self.arena.increase(&mut segment, 1);
        let slice = self.arena.slice_mut(&segment);
        slice[segment.len as usize - 1] = entity;
        self.node_mut(key).entities = segment;
    }

    /// Remove one occurrence of `entity`, compacting the segment tail.
    pub(crate) fn remove_entity_from_node(&mut self, key: &K, entity: E) -> bool {
        let mut segment = self.node(key).entities;
        let slice = self.arena.slice_mut(&segment);
        let Some(found) = slice.iter().position(|&id| id == entity) else {
            return false;
        };
        slice.copy_within(found + 1.., found);
        self.arena.decrease(&mut segment, 1);
        self.node_mut(key).entities = segment;
        true
    }

    pub(crate) fn resize_node_entities(&mut self, key: &K, new_len: usize) {
        let mut segment = self.node(key).entities;
        let shrink = segment.len as usize - new_len;
        self.arena.decrease(&mut segment, shrink);
        self.node_mut(key).entities = segment;
    }

    pub(crate) fn node_contains_entity(&self, node: &Node<D, K, RealOf<D, A>>, entity: E) -> bool {
        self.entities_of(node).contains(&entity)
    }

    // --- key lookups ---

    pub(crate) fn find_smallest_key(&self, mut search: K) -> K {
        while is_valid_key(search) {
            if self.nodes.contains_key(&search) {
                return search;
            }
            search = parent_key(search, Self::DIMS);
        }
        K::zero()
    }

    pub(crate) fn find_smallest_key_with_depth(&self, mut search: K) -> (K, u8) {
        let mut depth = depth_of_key(search, Self::DIMS);
        loop {
            if self.nodes.contains_key(&search) {
                return (search, depth);
            }
            if depth == 0 {
                return (K::zero(), 0);
            }
            search = parent_key(search, Self::DIMS);
            depth -= 1;
        }
    }

    /// Node id a member of the store or not that would hold this location.
    #[inline]
    pub(crate) fn location_key(&self, location: &RangeLocation<K>) -> K {
        hash_at_depth(location, self.max_depth, Self::DIMS)
    }

    /// Linear scan for the node holding `entity`.
    pub(crate) fn find_entity_node(&self, entity: E) -> K {
        for (key, node) in self.nodes.iter() {
            if self.node_contains_entity(node, entity) {
                return *key;
            }
        }
        K::zero()
    }

    // --- traversal ---

    /// Visit nodes in breadth-first order; children of nodes rejected by
    /// `selector` are not visited.
    pub(crate) fn visit_nodes(
        &self,
        root: K,
        selector: &mut impl FnMut(&K, &Node<D, K, RealOf<D, A>>) -> bool,
        procedure: &mut impl FnMut(&K, &Node<D, K, RealOf<D, A>>),
    ) {
        let mut pending = VecDeque::new();
        pending.push_back(root);
        while let Some(key) = pending.pop_front() {
            let node = self.node(&key);
            if !selector(&key, node) {
                continue;
            }
            procedure(&key, node);
            for child in node.child_keys() {
                pending.push_back(child);
            }
        }
    }

    /// Visit nodes depth-first pre-order with subtree pruning.
    pub(crate) fn visit_nodes_dfs(
        &self,
        key: K,
        selector: &mut impl FnMut(&K, &Node<D, K, RealOf<D, A>>) -> bool,
        procedure: &mut impl FnMut(&K, &Node<D, K, RealOf<D, A>>),
    ) {
        let node = self.node(&key);
        if !selector(&key, node) {
            return;
        }
        procedure(&key, node);
        for child in node.child_keys() {
            self.visit_nodes_dfs(child, selector, procedure);
        }
    }

    pub(crate) fn collect_bfs(&self, root: K, sort_inside_nodes: bool) -> Vec<E> {
        let mut out = Vec::with_capacity(self.nodes.len() * 2.max(self.max_entities / 2));
        self.visit_nodes(root, &mut |_, _| true, &mut |_, node| {
            let start = out.len();
            out.extend_from_slice(self.entities_of(node));
            if sort_inside_nodes {
                out[start..].sort_unstable();
            }
        });
        out
    }

    pub(crate) fn collect_dfs_into(&self, key: &K, out: &mut Vec<E>, sort_inside_nodes: bool) {
        let node = self.node(key);
        let start = out.len();
        out.extend_from_slice(self.entities_of(node));
        if sort_inside_nodes {
            out[start..].sort_unstable();
        }
        for child in node.child_keys() {
            self.collect_dfs_into(&child, out, sort_inside_nodes);
        }
    }

    // --- edit engine ---

    /// Drop a node that holds nothing and points nowhere. The root stays.
    pub(crate) fn remove_node_if_possible(&mut self, key: K) {
        if key == root_key() {
            return;
        }
        {
            let node = self.node(&key);
            if node.children.any() || !node.entities.is_empty() {
                return;
            }
        }
        let segment = self.node(&key).entities;
        self.arena.deallocate(&segment);
        let parent = parent_key(key, Self::DIMS);
        let child_id = child_id_of_key(key, Self::DIMS);
        self.node_mut(&parent).children.remove(child_id);
        self.nodes.remove(&key);
    }

    /// Insert by walking to the smallest fitting node, growing and splitting
    /// nodes as they overflow.
    pub(crate) fn insert_with_rebalancing_base(
        &mut self,
        parent_key_in: K,
        parent_depth: u8,
        do_split: bool,
        location: &RangeLocation<K>,
        entity: E,
        location_of: &impl Fn(E) -> RangeLocation<K>,
    ) -> bool {
        enum Flow {
            InsertInParent,
            SplitToChildren,
            CreateOneChild,
            FullRebalance,
        }

        let d = Self::DIMS;
        let is_entity_split = do_split && !is_all_child_touched(location.touched_dimensions, d);
        let entity_key = self.location_key(location);
        let should_insert_in_parent =
            entity_key == parent_key_in || (is_entity_split && location.depth < parent_depth);

        let flow = {
            let parent = self.node(&parent_key_in);
            if parent_depth == self.max_depth {
                Flow::InsertInParent
            } else if parent.children.any() && is_entity_split && location.depth == parent_depth {
                Flow::SplitToChildren
            } else if parent.children.any() && !should_insert_in_parent {
                // The entity belongs to a deeper, not yet existing node.
                Flow::CreateOneChild
            } else if parent.entities.len as usize + 1 >= self.max_entities {
                Flow::FullRebalance
            } else {
                Flow::InsertInParent
            }
        };

        match flow {
            Flow::InsertInParent => {
                self.add_entity(&parent_key_in, entity);
            }
            Flow::CreateOneChild => {
                let child_id =
                    child_id_at_level(location.location, self.max_depth - parent_depth, d);
                let child_key = ChildKeyGenerator::new(parent_key_in, d).child_key(child_id);
                self.add_child_node(parent_key_in, child_id, child_key);
                self.add_entity(&child_key, entity);
            }
            Flow::SplitToChildren => {
                self.insert_split_to_children(
                    parent_key_in,
                    parent_depth,
                    location,
                    entity,
                    location_of,
                );
            }
            Flow::FullRebalance => {
                self.add_entity(&parent_key_in, entity);
                let ids: Vec<E> = self.entities_of(self.node(&parent_key_in)).to_vec();
                let mut stuck: Vec<E> = Vec::with_capacity(ids.len());
                for id in ids {
                    let id_location = location_of(id);
                    let is_id_split =
                        do_split && !is_all_child_touched(id_location.touched_dimensions, d);
                    if id_location.depth + is_id_split as u8 <= parent_depth {
                        stuck.push(id);
                    } else if is_id_split && id_location.depth == parent_depth {
                        self.insert_split_to_children(
                            parent_key_in,
                            parent_depth,
                            &id_location,
                            id,
                            location_of,
                        );
                    } else {
                        let child_id =
                            child_id_at_level(id_location.location, self.max_depth - parent_depth, d);
                        if self.node(&parent_key_in).children.contains(child_id) {
                            // Descend to the smallest existing node on the
                            // entity's branch and insert from there.
                            let id_key = self.location_key(&id_location);
                            let (smallest, smallest_depth) =
                                self.find_smallest_key_with_depth(id_key);
                            self.insert_with_rebalancing_base(
                                smallest,
                                smallest_depth,
                                do_split,
                                &id_location,
                                id,
                                location_of,
                            );
                        } else {
                            let child_key =
                                ChildKeyGenerator::new(parent_key_in, d).child_key(child_id);
                            self.add_child_node(parent_key_in, child_id, child_key);
                            self.add_entity(&child_key, id);
                        }
                    }
                }
                let segment = self.node(&parent_key_in).entities;
                self.arena.slice_mut(&segment)[..stuck.len()].copy_from_slice(&stuck);
                self.resize_node_entities(&parent_key_in, stuck.len());
            }
        }
        true
    }

    /// Duplicate a splitter entity into every child segment its box touches.
    pub(crate) fn insert_split_to_children(
        &mut self,
        parent_key_in: K,
        parent_depth: u8,
        location: &RangeLocation<K>,
        entity: E,
        location_of: &impl Fn(E) -> RangeLocation<K>,
    ) {
        debug_assert!(parent_key_in == self.location_key(location));
        let generator = ChildKeyGenerator::new(parent_key_in, Self::DIMS);
        for child_id in split_child_segments(location) {
            let child_key = generator.child_key(child_id);
            if self.node(&parent_key_in).children.contains(child_id) {
                self.insert_with_rebalancing_base(
                    child_key,
                    parent_depth + 1,
                    true,
                    location,
                    entity,
                    location_of,
                );
            } else {
                self.add_child_node(parent_key_in, child_id, child_key);
                self.add_entity(&child_key, entity);
            }
        }
    }

    /// Insert under the smallest existing ancestor, optionally creating the
    /// whole branch down to the entity's own node.
    pub(crate) fn insert_without_rebalancing_base(
        &mut self,
        existing_parent: K,
        entity_key: K,
        entity: E,
        to_leaf: bool,
    ) -> bool {
        let d = Self::DIMS;
        if entity_key == existing_parent {
            self.add_entity(&entity_key, entity);
            return true;
        }

        if to_leaf {
            let mut missing: SmallVec<[K; 16]> = SmallVec::new();
            let mut walk = entity_key;
            while walk != existing_parent && !self.nodes.contains_key(&walk) {
                missing.push(walk);
                walk = parent_key(walk, d);
            }
            let mut current = walk;
            for &new_key in missing.iter().rev() {
                let child_id = child_id_of_key(new_key, d);
                self.add_child_node(current, child_id, new_key);
                current = new_key;
            }
            self.add_entity(&current, entity);
        } else if self.node(&existing_parent).children.any() {
            // Entities go below a branching node; create exactly the child
            // on the entity's path.
            let parent_depth = depth_of_key(existing_parent, d);
            let entity_depth = depth_of_key(entity_key, d);
            let child_id = child_id_by_depth(parent_depth, entity_depth, entity_key, d);
            let child_key = ChildKeyGenerator::new(existing_parent, d).child_key(child_id);
            self.add_child_node(existing_parent, child_id, child_key);
            self.add_entity(&child_key, entity);
        } else {
            self.add_entity(&existing_parent, entity);
        }
        true
    }

    /// Remove an id from the whole tree by scanning nodes. With
    /// `in_multiple_nodes` every node is checked (split mode); otherwise the
    /// scan stops at the first hit.
    pub(crate) fn erase_base(&mut self, entity: E, in_multiple_nodes: bool, update_ids: bool) -> bool {
        let keys: Vec<K> = self.nodes.iter().map(|(key, _)| *key).collect();
        let mut erased_in: Vec<K> = Vec::new();
        for key in keys {
            if !self.remove_entity_from_node(&key, entity) {
                continue;
            }
            erased_in.push(key);
            if !in_multiple_nodes {
                break;
            }
        }
        if erased_in.is_empty() {
            return false;
        }
        for key in erased_in {
            self.remove_node_if_possible(key);
        }
        if update_ids {
            self.shift_ids_down(entity);
        }
        true
    }

    /// Compact the id space after an erase of `removed`.
    pub(crate) fn shift_ids_down(&mut self, removed: E) {
        let Self { nodes, arena, .. } = self;
        for (_, node) in nodes.iter_mut() {
            for id in arena.slice_mut(&node.entities) {
                *id = id.shift_down(removed);
            }
        }
    }

    /// Replace or drop ids per `updates`; absent ids stay.
    pub(crate) fn update_indexes<S: core::hash::BuildHasher>(
        &mut self,
        updates: &HashMap<E, Option<E>, S>,
    ) {
        let Self { nodes, arena, .. } = self;
        for (_, node) in nodes.iter_mut() {
            let slice = arena.slice_mut(&node.entities);
            let mut keep = slice.len();
            let mut index = 0;
            while index < keep {
                match updates.get(&slice[index]) {
                    None => index += 1,
                    Some(Some(new_id)) => {
                        slice[index] = *new_id;
                        index += 1;
                    }
                    Some(None) => {
                        keep -= 1;
                        slice[index] = slice[keep];
                    }
                }
            }
            let shrink = slice.len() - keep;
            if shrink > 0 {
                arena.decrease(&mut node.entities, shrink);
            }
        }
    }

    /// Tear down every node and the arena; the tree must be `init`ed again.
    pub(crate) fn reset(&mut self) {
        self.nodes.clear();
        self.arena.reset();
        self.node_sizes.clear();
        self.grid = GridSpaceOf::new(0, internal::FloatBox::zero());
        self.max_depth = 0;
    }

    /// Drop all entities and all nodes but the root.
    pub(crate) fn clear(&mut self) {
        let root = root_key::<K>();
        let segments: Vec<crate::arena::Segment> = self
            .nodes
            .iter()
            .map(|(_, node)| node.entities)
            .collect();
        for segment in segments {
            self.arena.deallocate(&segment);
        }
        self.nodes.retain(|key, _| *key == root);
        self.node_mut(&root).clear();
    }

    /// Translate the whole tree: the world box and every cached center.
    pub(crate) fn move_by(&mut self, by: &A::Vector, execution: Execution)
    where
        A::Vector: Sync,
    {
        #[cfg(feature = "cached-node-centers")]
        {
            use rayon::iter::ParallelIterator;
            match execution {
                Execution::Sequential => {
                    for (_, node) in self.nodes.iter_mut() {
                        internal::move_vector::<D, A>(&mut node.center, by);
                    }
                }
                Execution::Parallel => {
                    self.nodes.par_iter_mut().for_each(|(_, node)| {
                        internal::move_vector::<D, A>(&mut node.center, by);
                    });
                }
            }
        }
        #[cfg(not(feature = "cached-node-centers"))]
        let _ = execution;
        self.grid.move_by(by);
    }

    /// Every entity id appears exactly once (diagnostic).
    pub(crate) fn is_every_entity_unique(&self) -> bool {
        let mut ids: Vec<E> = Vec::new();
        for (_, node) in self.nodes.iter() {
            ids.extend_from_slice(self.entities_of(node));
        }
        let before = ids.len();
        dedup_ids(&mut ids);
        before == ids.len()
    }

    // --- range search ---

    /// Which child halves the query corners fall into, relative to a center.
    pub(crate) fn relative_min_max(
        &self,
        center: &FloatVector<D, RealOf<D, A>>,
        range: &A::Box,
    ) -> (u64, u64) {
        let mut min_flag = 0u64;
        let mut max_flag = 0u64;
        let mut bit = 1u64;
        for dim in 0..D {
            if center[dim] <= A::box_min_coord(range, dim).to_real() {
                min_flag |= bit;
            }
            if center[dim] <= A::box_max_coord(range, dim).to_real() {
                max_flag |= bit;
            }
            bit = bit.wrapping_shl(1);
        }
        (min_flag, max_flag)
    }

    pub(crate) fn copy_matching(
        &self,
        node: &Node<D, K, RealOf<D, A>>,
        filter: &impl Fn(E) -> bool,
        out: &mut Vec<E>,
    ) {
        for &id in self.entities_of(node) {
            if filter(id) {
                out.push(id);
            }
        }
    }

    pub(crate) fn range_search_rec(
        &self,
        range: &A::Box,
        depth: u8,
        key: K,
        filter: &impl Fn(E) -> bool,
        out: &mut Vec<E>,
    ) {
        let node = self.node(&key);
        if !node.children.any() {
            self.copy_matching(node, filter, out);
            return;
        }

        let center = self.node_center(&key, node);
        let (min_flag, max_flag) = self.relative_min_max(&center, range);

        // Dimensions where both corners fall in the same half need only one
        // child side walked; differing dimensions must be walked fully.
        let mask = child_mask(Self::DIMS);
        let limited_dimensions = !(min_flag ^ max_flag) & mask;

        if limited_dimensions == 0
            && internal::range_contains_float_box::<D, A>(range, &self.node_box(depth, &center))
        {
            self.collect_dfs_into(&key, out, false);
            return;
        }

        self.copy_matching(node, filter, out);

        let boundaries = min_flag & max_flag & limited_dimensions;
        for child_key in node.child_keys() {
            if child_key.low() & limited_dimensions != boundaries {
                continue;
            }
            self.range_search_rec(range, depth + 1, child_key, filter, out);
        }
    }

    /// Entry point of range search: whole-world shortcut, degenerate-range
    /// rejection, descent from the smallest node containing the range, and
    /// the ancestor sweep for entities stuck above it.
    pub(crate) fn range_search_root(
        &self,
        range: &A::Box,
        entity_count: usize,
        point_like_raster: bool,
        all_ids: impl FnOnce(&mut Vec<E>),
        filter: &impl Fn(E) -> bool,
        out: &mut Vec<E>,
    ) -> bool {
        let d = Self::DIMS;
        if internal::range_contains_float_box::<D, A>(range, self.grid.world()) {
            all_ids(out);
            return entity_count > 0;
        }

        // A zero-volume range would stick to node walls; reject it here so
        // the per-node tests stay simple.
        let range_volume = internal::volume_of::<D, A>(range);
        if range_volume <= RealOf::<D, A>::zero() {
            return false;
        }

        let grid_range = self.grid.box_grid(range, point_like_raster);
        let location = range_location(
            self.max_depth,
            encode::<D, K>(&grid_range[0]),
            encode::<D, K>(&grid_range[1]),
            d,
        );
        let smallest = self.find_smallest_key(self.location_key(&location));
        if !is_valid_key(smallest) {
            return false;
        }

        let estimate = if self.grid.volume() < RealOf::<D, A>::from_f64(0.01) {
            10
        } else {
            (range_volume * RealOf::<D, A>::from_usize(entity_count) / self.grid.volume())
                .to_usize()
                .unwrap_or(10)
        };
        out.reserve(estimate);

        self.range_search_rec(range, depth_of_key(smallest, d), smallest, filter, out);

        let mut ancestor = parent_key(smallest, d);
        while is_valid_key(ancestor) {
            self.copy_matching(self.node(&ancestor), filter, out);
            ancestor = parent_key(ancestor, d);
        }
        true
    }

    // --- plane and frustum ---

    /// Node-box selector for plane queries.
    fn node_plane_relation(
        &self,
        key: &K,
        node: &Node<D, K, RealOf<D, A>>,
        origin_distance: RealOf<D, A>,
        normal: &A::Vector,
        tolerance: RealOf<D, A>,
    ) -> PlaneRelation {
        let depth = depth_of_key(*key, Self::DIMS);
        let half = self.node_size(depth + 1);
        let center = self.node_center(key, node);
        internal::box_plane_relation::<D, A>(&center, half, origin_distance, normal, tolerance)
    }

    pub(crate) fn plane_intersection_base(
        &self,
        origin_distance: RealOf<D, A>,
        normal: &A::Vector,
        tolerance: RealOf<D, A>,
        classify: &impl Fn(E) -> PlaneRelation,
    ) -> Vec<E> {
        debug_assert!(A::is_normalized(normal));
        let mut results: Vec<E> = Vec::new();
        self.visit_nodes_dfs(
            root_key(),
            &mut |key, node| {
                self.node_plane_relation(key, node, origin_distance, normal, tolerance)
                    == PlaneRelation::Hit
            },
            &mut |_, node| {
                for &id in self.entities_of(node) {
                    if classify(id) == PlaneRelation::Hit && !results.contains(&id) {
                        results.push(id);
                    }
                }
            },
        );
        results
    }

    pub(crate) fn plane_positive_segmentation_base(
        &self,
        origin_distance: RealOf<D, A>,
        normal: &A::Vector,
        tolerance: RealOf<D, A>,
        classify: &impl Fn(E) -> PlaneRelation,
    ) -> Vec<E> {
        debug_assert!(A::is_normalized(normal));
        let mut results: Vec<E> = Vec::new();
        self.visit_nodes_dfs(
            root_key(),
            &mut |key, node| {
                self.node_plane_relation(key, node, origin_distance, normal, tolerance)
                    != PlaneRelation::Negative
            },
            &mut |_, node| {
                for &id in self.entities_of(node) {
                    if classify(id) != PlaneRelation::Negative && !results.contains(&id) {
                        results.push(id);
                    }
                }
            },
        );
        results
    }

    pub(crate) fn frustum_culling_base(
        &self,
        boundary_planes: &[A::Plane],
        tolerance: RealOf<D, A>,
        classify: &impl Fn(E, &A::Plane) -> PlaneRelation,
    ) -> Vec<E> {
        let mut results: Vec<E> = Vec::new();
        if boundary_planes.is_empty() {
            return results;
        }
        debug_assert!(boundary_planes
            .iter()
            .all(|plane| A::is_normalized(A::plane_normal(plane))));

        self.visit_nodes_dfs(
            root_key(),
            &mut |key, node| {
                for plane in boundary_planes {
                    let relation = self.node_plane_relation(
                        key,
                        node,
                        A::plane_origin_distance(plane).to_real(),
                        A::plane_normal(plane),
                        tolerance,
                    );
                    match relation {
                        PlaneRelation::Hit => return true,
                        PlaneRelation::Negative => return false,
                        PlaneRelation::Positive => {}
                    }
                }
                true
            },
            &mut |_, node| {
                for &id in self.entities_of(node) {
                    let mut relation = PlaneRelation::Negative;
                    for plane in boundary_planes {
                        relation = classify(id, plane);
                        if relation != PlaneRelation::Positive {
                            break;
                        }
                    }
                    if relation == PlaneRelation::Negative {
                        continue;
                    }
                    if !results.contains(&id) {
                        results.push(id);
                    }
                }
            },
        );
        results
    }

    // --- estimates ---

    /// Node count estimate used to reserve the store ahead of a bulk build.
    pub(crate) fn estimate_node_number(
        entity_count: usize,
        max_depth: u8,
        max_entities: usize,
    ) -> usize {
        debug_assert!(max_entities > 0);
        debug_assert!(max_depth > 0);
        if entity_count < 10 {
            return 10;
        }

        let d = Self::DIMS;
        if (u32::from(max_depth) + 1) * d < 64 {
            let max_child_count = 1usize << (u32::from(max_depth) * d);
            let per_node = entity_count / max_child_count;
            if per_node > max_entities / 2 {
                return max_child_count;
            }
        }

        let average = entity_count as f64 / max_entities as f64;
        let estimated_depth =
            (((average.log2() + 1.0) / f64::from(d)).ceil().max(0.0) as u8).min(max_depth);
        if u32::from(estimated_depth) * d < 64 {
            let nodes = 1u64 << (u32::from(estimated_depth) * d.min(6));
            return (1.05 * nodes as f64) as usize;
        }
        (1.5 * average) as usize
    }

    /// Depth heuristic: enough levels that leaves average `max_entities`.
    pub(crate) fn estimate_max_depth(entity_count: usize, max_entities: usize) -> u8 {
        if entity_count <= max_entities {
            return 2;
        }
        let leaves = (entity_count / max_entities) as f64;
        let depth = (leaves.log2() / f64::from(Self::DIMS)) as u8;
        depth.clamp(2, max_theoretical_depth::<K>(Self::DIMS))
    }
}

/// All child segments a splitter entity fans out to: one per combination of
/// its touched dimensions, anchored at the lower segment.
pub(crate) fn split_child_segments<K: MortonKey>(
    location: &RangeLocation<K>,
) -> SmallVec<[ChildId; 8]> {
    let touched = location.touched_dimensions;
    let combinations = 1usize << touched.count_ones();
    let mut segments = SmallVec::with_capacity(combinations);
    for combination in 0..combinations {
        let mut segment: ChildId = 0;
        let mut combination_bit = 1usize;
        let mut dimension_bit: ChildId = 1;
        while dimension_bit <= touched && dimension_bit != 0 {
            if touched & dimension_bit != 0 {
                if combination & combination_bit != 0 {
                    segment |= dimension_bit;
                }
                combination_bit <<= 1;
            }
            dimension_bit <<= 1;
        }
        segments.push(segment + location.lower_segment);
    }
    segments
}

/// Partition `slice` so elements satisfying `predicate` come first; returns
/// the count of them. Order within the halves is not preserved.
pub(crate) fn partition_in_place<T>(slice: &mut [T], predicate: impl Fn(&T) -> bool) -> usize {
    let mut first_false = 0;
    for index in 0..slice.len() {
        if predicate(&slice[index]) {
            slice.swap(first_false, index);
            first_false += 1;
        }
    }
    first_false
}
