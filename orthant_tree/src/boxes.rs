// Copyright 2025 the Orthant Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The box tree: spatial index of one axis-aligned box per entity.
//!
//! A box is anchored at the deepest node that fully contains it. With the
//! `SPLIT` parameter on, a box straddling midplanes is instead replicated
//! into every child segment it touches, which keeps entities out of large
//! parent nodes at the price of duplicate ids; queries that can observe the
//! duplicates dedup their results before returning.

use std::collections::VecDeque;

use num_traits::Zero;
use orthant_geometry::internal::{self, FloatBox, FloatVector};
use orthant_geometry::{Adaptor, PlaneRelation, RealOf, Scalar};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::collection::{EntityId, GeometryCollection};
use crate::core::{
    dedup_ids, dedup_pairs, partition_in_place, split_child_segments, EntityDistance, Execution,
    TreeCore, TreeOptions,
};
use crate::key::{MortonKey, NodeStore};
use crate::morton::{
    child_id_of_key, depth_of_key, encode, hash_key, is_all_child_touched, is_valid_key,
    parent_key, range_location, root_key, ChildChecker, ChildId, ChildKeyGenerator, RangeLocation,
};
use crate::node::Node;

/// Frame of the explicit depth-first build stack.
struct BuildFrame<const D: usize, K, R> {
    key: K,
    node: Node<D, K, R>,
    end: usize,
}

/// A queued replica of a splitter entity, waiting for the child node of its
/// segment to be opened.
#[derive(Copy, Clone, Debug)]
struct SplitItem {
    segment: ChildId,
    index: usize,
}

/// Per-depth queue of split replicas during the build.
#[derive(Default)]
struct SplitFrame {
    items: Vec<SplitItem>,
    begin: usize,
}

impl SplitFrame {
    fn consumed(&self) -> bool {
        self.items.is_empty() || self.begin == self.items.len()
    }
}

/// Per-node working set of the collision walk: the node's geometry and the
/// ids resident at it, sorted by minimum x.
struct CollisionContext<const D: usize, E, R> {
    center: FloatVector<D, R>,
    bounds: FloatBox<D, R>,
    ids: Vec<E>,
}

impl<const D: usize, E, R: orthant_geometry::Real> CollisionContext<D, E, R> {
    fn empty() -> Self {
        Self {
            center: [R::zero(); D],
            bounds: FloatBox::zero(),
            ids: Vec::new(),
        }
    }
}

impl<const D: usize, E: Clone, R: orthant_geometry::Real> Clone for CollisionContext<D, E, R> {
    fn clone(&self) -> Self {
        Self {
            center: self.center,
            bounds: self.bounds,
            ids: self.ids.clone(),
        }
    }
}

/// Morton-keyed spatial index of axis-aligned boxes.
///
/// `SPLIT` selects the split-parent-entities policy at compile time.
///
/// ```rust
/// use orthant_tree::{OctreeBox, TreeOptions};
/// use orthant_geometry::BoxND;
///
/// let boxes = vec![
///     BoxND::new([0.0, 0.0, 0.0], [1.0, 1.0, 1.0]),
///     BoxND::new([2.0, 2.0, 2.0], [3.0, 3.0, 3.0]),
/// ];
/// let tree = OctreeBox::build(&boxes, TreeOptions::default());
/// let hits = tree.range_search(&BoxND::new([0.5, 0.5, 0.5], [2.5, 2.5, 2.5]), &boxes, false);
/// assert_eq!(hits.len(), 2);
/// ```
pub struct BoxTree<
    const D: usize,
    const SPLIT: bool,
    A: Adaptor<D>,
    K: MortonKey = u64,
    E: EntityId = usize,
> {
    pub(crate) core: TreeCore<D, A, K, E>,
}

impl<const D: usize, const SPLIT: bool, A: Adaptor<D>, K: MortonKey, E: EntityId> core::fmt::Debug
    for BoxTree<D, SPLIT, A, K, E>
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BoxTree")
            .field("split_parent_entities", &SPLIT)
            .field("core", &self.core)
            .finish()
    }
}

impl<const D: usize, const SPLIT: bool, A: Adaptor<D>, K: MortonKey, E: EntityId> Default
    for BoxTree<D, SPLIT, A, K, E>
{
    fn default() -> Self {
        Self {
            core: TreeCore::empty(),
        }
    }
}

impl<const D: usize, const SPLIT: bool, A: Adaptor<D>, K: MortonKey, E: EntityId>
    BoxTree<D, SPLIT, A, K, E>
{
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

    /// Bulk-build the tree over a box collection.
    pub fn build<C>(boxes: &C, options: TreeOptions<D, A>) -> Self
    where
        C: GeometryCollection<A::Box, Id = E> + Sync + ?Sized,
    {
        let mut tree = Self::new();
        let world = match &options.world_box {
            Some(world_box) => internal::box_of::<D, A>(world_box),
            None => internal::box_of_boxes::<D, A>(boxes.iter_entities().map(|(_, b)| b)),
        };
        let entity_count = boxes.len();
        let max_depth = match options.max_depth {
            Some(depth) if depth > 0 => depth,
            _ => TreeCore::<D, A, K, E>::estimate_max_depth(entity_count, options.max_entities_per_node),
        };
        // Split replicas inflate the id count; size the arena for them.
        let estimated = if SPLIT {
            entity_count + entity_count * 3 / 10
        } else {
            entity_count
        };
        tree.core.init(
            world,
            max_depth,
            options.max_entities_per_node,
            estimated.max(1),
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
        let max_depth_copy = max_depth;
        let locate = move |b: &A::Box| {
            let range = grid.box_grid(b, false);
            range_location(
                max_depth_copy,
                encode::<D, K>(&range[0]),
                encode::<D, K>(&range[1]),
                Self::DIMS,
            )
        };
        let mut locations: Vec<(RangeLocation<K>, E)> = boxes
            .iter_entities()
            .map(|(id, _)| {
                (
                    RangeLocation {
                        depth: 0,
                        location: K::zero(),
                        touched_dimensions: 0,
                        lower_segment: 0,
                    },
                    id,
                )
            })
            .collect();
        match options.execution {
            Execution::Sequential => {
                for (location, id) in locations.iter_mut() {
                    *location = locate(boxes.geometry(*id));
                }
            }
            Execution::Parallel => {
                locations.par_iter_mut().for_each(|(location, id)| {
                    *location = locate(boxes.geometry(*id));
                });
                locations.par_sort_unstable_by(|left, right| left.0.ordering(&right.0));
            }
        }

        let sorted = options.execution == Execution::Parallel;
        tree.build_dfs(&mut locations, sorted);
        log::debug!(
            "built box tree: {} entities, {} nodes, depth {}, split={}",
            entity_count,
            tree.core.nodes.len(),
            max_depth,
            SPLIT
        );
        tree
    }

    fn build_dfs(&mut self, locations: &mut [(RangeLocation<K>, E)], sorted: bool) {
        let d = Self::DIMS;
        let max_depth = self.core.max_depth;
        let root = root_key::<K>();
        let root_node = self.core.nodes.remove(&root).expect("missing root node");

        let depth_slots = max_depth as usize + 1;
        let mut node_stack: Vec<BuildFrame<D, K, RealOf<D, A>>> = Vec::with_capacity(depth_slots);
        node_stack.push(BuildFrame {
            key: root,
            node: root_node,
            end: locations.len(),
        });
        let mut split_stack: Vec<SplitFrame> = (0..depth_slots).map(|_| SplitFrame::default()).collect();
        let mut cursor = 0usize;

        while let Some(top) = node_stack.len().checked_sub(1) {
            let depth = top as u8;
            if !node_stack[top].node.children.any() {
                if SPLIT {
                    let (below, at) = split_stack.split_at_mut(top);
                    self.process_node_split(
                        depth,
                        &mut cursor,
                        &mut node_stack[top],
                        &mut at[0],
                        below.last_mut(),
                        locations,
                        sorted,
                    );
                } else {
                    self.process_node_plain(depth, &mut cursor, &mut node_stack[top], locations, sorted);
                }
            }

            let end = node_stack[top].end;
            let split_consumed = !SPLIT || split_stack[top].consumed();
            if (cursor == end && split_consumed) || depth == max_depth {
                debug_assert!(cursor == end && split_consumed);
                if let Some(frame) = node_stack.pop() {
                    self.core.nodes.insert(frame.key, frame.node);
                }
                split_stack[top].items.clear();
                split_stack[top].begin = 0;
                continue;
            }

            // Open the next child: from the pending location span, or from
            // the queued split replicas once the span is exhausted.
            let child_depth = depth + 1;
            let level = max_depth - child_depth;
            if SPLIT && cursor == end {
                let segment = split_stack[top].items[split_stack[top].begin].segment;
                let child_key = ChildKeyGenerator::new(node_stack[top].key, d).child_key(segment);
                node_stack[top].node.children.add(segment);
                let child_node = self
                    .core
                    .make_child_node(node_stack[top].node.center_hint(), child_key);
                node_stack.push(BuildFrame {
                    key: child_key,
                    node: child_node,
                    end,
                });
            } else {
                let checker = ChildChecker::new(level, locations[cursor].0.location, d);
                let child_id = checker.child_id(level, d);
                let child_key = ChildKeyGenerator::new(node_stack[top].key, d).child_key(child_id);
                node_stack[top].node.children.add(child_id);
                let span_end = cursor
                    + if sorted {
                        locations[cursor..end]
                            .partition_point(|(location, _)| checker.test(location.location))
                    } else {
                        partition_in_place(&mut locations[cursor..end], |(location, _)| {
                            checker.test(location.location)
                        })
                    };
                let child_node = self
                    .core
                    .make_child_node(node_stack[top].node.center_hint(), child_key);
                node_stack.push(BuildFrame {
                    key: child_key,
                    node: child_node,
                    end: span_end,
                });
            }
        }
    }

    /// First visit of a node in split mode: store stuck-and-unsplittable
    /// entities plus replicas inherited from the parent, queue splittable
    /// stuck entities for the children.
    #[allow(clippy::too_many_arguments)]
    fn process_node_split(
        &mut self,
        depth: u8,
        cursor: &mut usize,
        frame: &mut BuildFrame<D, K, RealOf<D, A>>,
        split: &mut SplitFrame,
        parent_split: Option<&mut SplitFrame>,
        locations: &mut [(RangeLocation<K>, E)],
        sorted: bool,
    ) {
        let d = Self::DIMS;
        let subtree_count = frame.end - *cursor;
        let mut node_count = subtree_count;
        let mut from_parent = 0usize;
        let mut parent_split = parent_split;

        if let Some(parent) = parent_split.as_mut() {
            if !parent.items.is_empty() {
                let segment_id = child_id_of_key(frame.key, d);
                from_parent = partition_in_place(&mut parent.items[parent.begin..], |item| {
                    item.segment == segment_id
                });
                node_count += from_parent;
            }
        }

        let is_leaf = depth == self.core.max_depth || node_count <= self.core.max_entities;

        let mut stuck_end = frame.end;
        let mut unsplittable_end = frame.end;
        if !is_leaf {
            stuck_end = *cursor
                + if sorted {
                    locations[*cursor..frame.end].partition_point(|(location, _)| location.depth == depth)
                } else {
                    partition_in_place(&mut locations[*cursor..frame.end], |(location, _)| {
                        location.depth == depth
                    })
                };
            // Stuck entities touching every child stay here; the rest fan
            // out into their touched children.
            unsplittable_end = *cursor
                + partition_in_place(&mut locations[*cursor..stuck_end], |(location, _)| {
                    is_all_child_touched(location.touched_dimensions, d)
                });
        }

        let keep_count = unsplittable_end - *cursor;
        let segment = self.core.arena.allocate(from_parent + keep_count);
        {
            let slice = self.core.arena.slice_mut(&segment);
            let mut write = 0usize;
            if let Some(parent) = parent_split.as_mut() {
                for _ in 0..from_parent {
                    let item = parent.items[parent.begin];
                    slice[write] = locations[item.index].1;
                    write += 1;
                    parent.begin += 1;
                }
            }
            for offset in 0..keep_count {
                slice[write] = locations[*cursor + offset].1;
                write += 1;
            }
        }
        *cursor += keep_count;
        frame.node.entities = segment;

        let splittable_count = stuck_end - unsplittable_end;
        for _ in 0..splittable_count {
            let location = locations[*cursor].0;
            for segment_id in split_child_segments(&location) {
                split.items.push(SplitItem {
                    segment: segment_id,
                    index: *cursor,
                });
            }
            *cursor += 1;
        }
        split.begin = 0;
    }

    /// First visit of a node in non-split mode: keep entities stuck at this
    /// depth, pass everything deeper on to the children.
    fn process_node_plain(
        &mut self,
        depth: u8,
        cursor: &mut usize,
        frame: &mut BuildFrame<D, K, RealOf<D, A>>,
        locations: &mut [(RangeLocation<K>, E)],
        sorted: bool,
    ) {
        let subtree_count = frame.end - *cursor;
        if subtree_count == 0 {
            return;
        }
        let mut node_count = subtree_count;
        if subtree_count > self.core.max_entities && depth < self.core.max_depth {
            let stuck_end = *cursor
                + if sorted {
                    locations[*cursor..frame.end].partition_point(|(location, _)| location.depth == depth)
                } else {
                    partition_in_place(&mut locations[*cursor..frame.end], |(location, _)| {
                        location.depth == depth
                    })
                };
            node_count = stuck_end - *cursor;
        }
        if node_count == 0 {
            return;
        }
        let segment = self.core.arena.allocate(node_count);
        let slice = self.core.arena.slice_mut(&segment);
        for (slot, (_, id)) in slice.iter_mut().zip(locations[*cursor..*cursor + node_count].iter()) {
            *slot = *id;
        }
        *cursor += node_count;
        frame.node.entities = segment;
    }

    // --- location helpers ---

    fn box_location(&self, b: &A::Box) -> RangeLocation<K> {
        let range = self.core.grid.box_grid(b, false);
        range_location(
            self.core.max_depth,
            encode::<D, K>(&range[0]),
            encode::<D, K>(&range[1]),
            Self::DIMS,
        )
    }

    #[inline]
    fn box_in_world(&self, b: &A::Box) -> bool {
        internal::float_box_contains_box::<D, A>(self.core.grid.world(), b)
    }

    /// Smallest existing node containing the box; the zero key when the box
    /// is not fully inside the world.
    pub fn find_smallest_node(&self, b: &A::Box) -> K {
        if !self.box_in_world(b) {
            return K::zero();
        }
        let location = self.box_location(b);
        self.core.find_smallest_key(self.core.location_key(&location))
    }

    // --- edit ---

    /// Insert under the smallest existing ancestor; with `to_leaf` the whole
    /// branch down to the box's own node is created, fanning out split
    /// replicas where applicable.
    pub fn insert(&mut self, id: E, b: &A::Box, to_leaf: bool) -> bool {
        if !self.box_in_world(b) {
            return false;
        }
        let location = self.box_location(b);
        let entity_key = self.core.location_key(&location);
        let smallest = self.core.find_smallest_key(entity_key);
        if !is_valid_key(smallest) {
            return false;
        }

        let create_children_only = location.depth != self.core.max_depth && to_leaf && SPLIT;
        if create_children_only {
            let generator = ChildKeyGenerator::new(entity_key, Self::DIMS);
            for child_id in split_child_segments(&location) {
                if !self.core.insert_without_rebalancing_base(
                    smallest,
                    generator.child_key(child_id),
                    id,
                    to_leaf,
                ) {
                    return false;
                }
            }
            true
        } else {
            self.core
                .insert_without_rebalancing_base(smallest, entity_key, id, to_leaf)
        }
    }

    /// Insert, splitting any node the insertion overfills.
    pub fn insert_with_rebalancing<C>(&mut self, id: E, b: &A::Box, boxes: &C) -> bool
    where
        C: GeometryCollection<A::Box, Id = E> + ?Sized,
    {
        if !self.box_in_world(b) {
            return false;
        }
        let location = self.box_location(b);
        let parent = self.core.find_smallest_key(self.core.location_key(&location));
        if !is_valid_key(parent) {
            return false;
        }
        let grid = self.core.grid;
        let max_depth = self.core.max_depth;
        let location_of = move |entity: E| {
            let range = grid.box_grid(boxes.geometry(entity), false);
            range_location(
                max_depth,
                encode::<D, K>(&range[0]),
                encode::<D, K>(&range[1]),
                Self::DIMS,
            )
        };
        self.core.insert_with_rebalancing_base(
            parent,
            depth_of_key(parent, Self::DIMS),
            SPLIT,
            &location,
            id,
            &location_of,
        )
    }

    fn erase_recursive(&mut self, key: K, id: E, remaining_depth: u8) -> bool {
        let mut erased = self.core.remove_entity_from_node(&key, id);
        if remaining_depth > 0 {
            let children: SmallVec<[K; 8]> = self.core.node(&key).child_keys().collect();
            for child in children {
                erased |= self.erase_recursive(child, id, remaining_depth - 1);
            }
        }
        self.core.remove_node_if_possible(key);
        erased
    }

    /// Erase an id, finding its nodes through the box geometry. In split
    /// mode the replicas one level below the box's node are removed too.
    pub fn erase(&mut self, id: E, b: &A::Box, update_ids: bool) -> bool {
        let smallest = self.find_smallest_node(b);
        if !is_valid_key(smallest) {
            return false;
        }
        if !self.erase_recursive(smallest, id, SPLIT as u8) {
            return false;
        }
        if update_ids {
            self.core.shift_ids_down(id);
        }
        true
    }

    /// Erase an id wherever it is, scanning nodes.
    pub fn erase_entity(&mut self, id: E, update_ids: bool) -> bool {
        self.core.erase_base(id, SPLIT, update_ids)
    }

    /// Re-home an id at a new box.
    pub fn update(&mut self, id: E, new_box: &A::Box, to_leaf: bool) -> bool {
        if !self.box_in_world(new_box) {
            return false;
        }
        if !self.erase_entity(id, false) {
            return false;
        }
        self.insert(id, new_box, to_leaf)
    }

    /// Re-home an id, using the old box to locate the erase.
    pub fn update_with_old(&mut self, id: E, old_box: &A::Box, new_box: &A::Box, to_leaf: bool) -> bool {
        if !self.box_in_world(new_box) {
            return false;
        }
        if !SPLIT && self.find_smallest_node(old_box) == self.find_smallest_node(new_box) {
            return true;
        }
        if !self.erase(id, old_box, false) {
            return false;
        }
        self.insert(id, new_box, to_leaf)
    }

    /// Re-home an id with node rebalancing.
    pub fn update_with_rebalancing<C>(&mut self, id: E, new_box: &A::Box, boxes: &C) -> bool
    where
        C: GeometryCollection<A::Box, Id = E> + ?Sized,
    {
        if !self.box_in_world(new_box) {
            return false;
        }
        if !self.erase_entity(id, false) {
            return false;
        }
        self.insert_with_rebalancing(id, new_box, boxes)
    }

    // --- queries ---

    /// Ids whose box overlaps `range`: strict overlap by default, full
    /// containment with `must_fully_contain`.
    pub fn range_search<C>(&self, range: &A::Box, boxes: &C, must_fully_contain: bool) -> Vec<E>
    where
        C: GeometryCollection<A::Box, Id = E> + ?Sized,
    {
        let mut out = Vec::new();
        let filter = |id: E| {
            if must_fully_contain {
                A::are_boxes_overlapped(range, boxes.geometry(id), true)
            } else {
                A::are_boxes_overlapped_strict(range, boxes.geometry(id))
            }
        };
        self.core.range_search_root(
            range,
            boxes.len(),
            false,
            |out| out.extend(boxes.iter_entities().map(|(id, _)| id)),
            &filter,
            &mut out,
        );
        if SPLIT {
            dedup_ids(&mut out);
        }
        out
    }

    fn pick_search_recursive<C>(&self, point: &A::Vector, boxes: &C, key: K, out: &mut Vec<E>)
    where
        C: GeometryCollection<A::Box, Id = E> + ?Sized,
    {
        let node = self.core.node(&key);
        for &id in self.core.entities_of(node) {
            if A::does_box_contain_point(boxes.geometry(id), point, RealOf::<D, A>::zero()) {
                out.push(id);
            }
        }
        let center = self.core.node_center(&key, node);
        for child_key in node.child_keys() {
            let child_id = child_id_of_key(child_key, Self::DIMS);
            let mut agrees = true;
            for dim in 0..D {
                let coordinate = A::point_coord(point, dim).to_real();
                let side_is_greater = (child_id >> dim) & 1 == 1;
                if coordinate < center[dim] && side_is_greater {
                    agrees = false;
                    break;
                }
                if coordinate > center[dim] && !side_is_greater {
                    agrees = false;
                    break;
                }
            }
            if agrees {
                self.pick_search_recursive(point, boxes, child_key, out);
            }
        }
    }

    /// Ids whose box contains the point, including boxes stuck in ancestor
    /// nodes. Points on cell boundaries check both adjoining subtrees.
    pub fn pick_search<C>(&self, point: &A::Vector, boxes: &C) -> Vec<E>
    where
        C: GeometryCollection<A::Box, Id = E> + ?Sized,
    {
        let d = Self::DIMS;
        let mut out = Vec::new();
        if !internal::box_contains_point::<D, A>(self.core.grid.world(), point, RealOf::<D, A>::zero()) {
            return out;
        }

        let grid_range = self.core.grid.edge_point_grid(point);
        let location_min = encode::<D, K>(&grid_range[0]);
        let location_max = encode::<D, K>(&grid_range[1]);

        let mut node_key = hash_key(self.core.max_depth, location_min, d);
        if location_min != location_max {
            // The point sits on a cell boundary; enter at the smallest node
            // covering both candidate cells and descend along agreeing sides.
            let location = range_location(self.core.max_depth, location_min, location_max, d);
            node_key = self.core.find_smallest_key(self.core.location_key(&location));
            if self.core.nodes.contains_key(&node_key) {
                self.pick_search_recursive(point, boxes, node_key, &mut out);
            }
            node_key = parent_key(node_key, d);
        }

        while is_valid_key(node_key) {
            if let Some(node) = self.core.nodes.get(&node_key) {
                for &id in self.core.entities_of(node) {
                    if A::does_box_contain_point(boxes.geometry(id), point, RealOf::<D, A>::zero()) {
                        out.push(id);
                    }
                }
            }
            node_key = parent_key(node_key, d);
        }
        if SPLIT {
            dedup_ids(&mut out);
        }
        out
    }

    /// Ids whose box crosses the hyperplane within `tolerance`.
    pub fn plane_intersection<C>(
        &self,
        origin_distance: RealOf<D, A>,
        normal: &A::Vector,
        tolerance: RealOf<D, A>,
        boxes: &C,
    ) -> Vec<E>
    where
        C: GeometryCollection<A::Box, Id = E> + ?Sized,
    {
        self.core
            .plane_intersection_base(origin_distance, normal, tolerance, &|id| {
                self.classify_box_against_plane(boxes.geometry(id), origin_distance, normal, tolerance)
            })
    }

    /// Ids whose box crosses the caller plane within `tolerance`.
    pub fn plane_intersection_of<C>(&self, plane: &A::Plane, tolerance: RealOf<D, A>, boxes: &C) -> Vec<E>
    where
        C: GeometryCollection<A::Box, Id = E> + ?Sized,
    {
        self.plane_intersection(
            A::plane_origin_distance(plane).to_real(),
            A::plane_normal(plane),
            tolerance,
            boxes,
        )
    }

    /// Ids whose box lies on the positive side of the plane or crosses it.
    pub fn plane_positive_segmentation<C>(
        &self,
        origin_distance: RealOf<D, A>,
        normal: &A::Vector,
        tolerance: RealOf<D, A>,
        boxes: &C,
    ) -> Vec<E>
    where
        C: GeometryCollection<A::Box, Id = E> + ?Sized,
    {
        self.core
            .plane_positive_segmentation_base(origin_distance, normal, tolerance, &|id| {
                self.classify_box_against_plane(boxes.geometry(id), origin_distance, normal, tolerance)
            })
    }

    /// Ids whose box is inside or on the boundary of the plane-enclosed
    /// volume; a box is culled only when some plane sees it fully negative.
    pub fn frustum_culling<C>(
        &self,
        boundary_planes: &[A::Plane],
        tolerance: RealOf<D, A>,
        boxes: &C,
    ) -> Vec<E>
    where
        C: GeometryCollection<A::Box, Id = E> + ?Sized,
    {
        self.core
            .frustum_culling_base(boundary_planes, tolerance, &|id, plane| {
                self.classify_box_against_plane(
                    boxes.geometry(id),
                    A::plane_origin_distance(plane).to_real(),
                    A::plane_normal(plane),
                    tolerance,
                )
            })
    }

    fn classify_box_against_plane(
        &self,
        b: &A::Box,
        origin_distance: RealOf<D, A>,
        normal: &A::Vector,
        tolerance: RealOf<D, A>,
    ) -> PlaneRelation {
        let center = internal::box_center_of::<D, A>(b);
        let half_size = internal::box_half_size_of::<D, A>(b);
        internal::box_plane_relation::<D, A>(&center, &half_size, origin_distance, normal, tolerance)
    }

    // --- rays ---

    #[allow(clippy::too_many_arguments)]
    fn ray_all_recursive<C>(
        &self,
        depth: u8,
        key: K,
        boxes: &C,
        origin: &A::Vector,
        direction: &A::Vector,
        tolerance: RealOf<D, A>,
        max_distance: RealOf<D, A>,
        out: &mut Vec<EntityDistance<E, RealOf<D, A>>>,
    ) where
        C: GeometryCollection<A::Box, Id = E> + ?Sized,
    {
        let node = self.core.node(&key);
        let center = self.core.node_center(&key, node);
        if internal::ray_box_distance::<D, A>(
            &center,
            self.core.node_size(depth + 1),
            origin,
            direction,
            tolerance,
        )
        .is_none()
        {
            return;
        }

        for &id in self.core.entities_of(node) {
            if let Some(distance) = A::ray_box_distance(boxes.geometry(id), origin, direction, tolerance)
            {
                if max_distance == RealOf::<D, A>::zero() || distance <= max_distance {
                    out.push(EntityDistance { distance, id });
                }
            }
        }
        for child_key in node.child_keys() {
            self.ray_all_recursive(
                depth + 1,
                child_key,
                boxes,
                origin,
                direction,
                tolerance,
                max_distance,
                out,
            );
        }
    }

    /// All ids hit by the ray, ascending by entry distance. A zero
    /// `max_distance` means unbounded.
    pub fn ray_intersected_all<C>(
        &self,
        origin: &A::Vector,
        direction: &A::Vector,
        boxes: &C,
        tolerance: RealOf<D, A>,
        max_distance: RealOf<D, A>,
    ) -> Vec<E>
    where
        C: GeometryCollection<A::Box, Id = E> + ?Sized,
    {
        let mut found: Vec<EntityDistance<E, RealOf<D, A>>> = Vec::new();
        self.ray_all_recursive(
            0,
            root_key(),
            boxes,
            origin,
            direction,
            tolerance,
            max_distance,
            &mut found,
        );
        found.sort_unstable();
        if SPLIT {
            found.dedup_by(|a, b| a.id == b.id);
        }
        found.into_iter().map(|entry| entry.id).collect()
    }

    /// All ids hit by a caller ray, ascending by entry distance.
    pub fn ray_intersected_all_of<C>(
        &self,
        ray: &A::Ray,
        boxes: &C,
        tolerance: RealOf<D, A>,
        max_distance: RealOf<D, A>,
    ) -> Vec<E>
    where
        C: GeometryCollection<A::Box, Id = E> + ?Sized,
    {
        self.ray_intersected_all(
            A::ray_origin(ray),
            A::ray_direction(ray),
            boxes,
            tolerance,
            max_distance,
        )
    }

    fn ray_first_recursive<C>(
        &self,
        depth: u8,
        key: K,
        boxes: &C,
        origin: &A::Vector,
        direction: &A::Vector,
        tolerance: RealOf<D, A>,
        best: &mut Option<EntityDistance<E, RealOf<D, A>>>,
    ) where
        C: GeometryCollection<A::Box, Id = E> + ?Sized,
    {
        let node = self.core.node(&key);
        for &id in self.core.entities_of(node) {
            let Some(distance) = A::ray_box_distance(boxes.geometry(id), origin, direction, tolerance)
            else {
                continue;
            };
            let closer = best
                .as_ref()
                .map(|found| found.distance > distance)
                .unwrap_or(true);
            if closer {
                *best = Some(EntityDistance { distance, id });
            }
        }

        let child_depth = depth + 1;
        let half = self.core.node_size(child_depth + 1);
        let mut child_distances: SmallVec<[(RealOf<D, A>, K); 8]> = SmallVec::new();
        for child_key in node.child_keys() {
            let child = self.core.node(&child_key);
            let center = self.core.node_center(&child_key, child);
            let Some(distance) =
                internal::ray_box_distance::<D, A>(&center, half, origin, direction, tolerance)
            else {
                continue;
            };
            if let Some(found) = best.as_ref() {
                if distance > found.distance {
                    continue;
                }
            }
            child_distances.push((distance, child_key));
        }
        child_distances.sort_unstable_by(|left, right| {
            left.0
                .partial_cmp(&right.0)
                .unwrap_or(core::cmp::Ordering::Equal)
        });
        for (distance, child_key) in child_distances {
            if let Some(found) = best.as_ref() {
                if distance - tolerance >= found.distance {
                    break;
                }
            }
            self.ray_first_recursive(child_depth, child_key, boxes, origin, direction, tolerance, best);
        }
    }

    /// The first id hit by the ray, if any.
    pub fn ray_intersected_first<C>(
        &self,
        origin: &A::Vector,
        direction: &A::Vector,
        boxes: &C,
        tolerance: RealOf<D, A>,
    ) -> Option<E>
    where
        C: GeometryCollection<A::Box, Id = E> + ?Sized,
    {
        let root = root_key::<K>();
        let root_node = self.core.node(&root);
        let center = self.core.node_center(&root, root_node);
        internal::ray_box_distance::<D, A>(
            &center,
            self.core.node_size(1),
            origin,
            direction,
            tolerance,
        )?;

        let mut best: Option<EntityDistance<E, RealOf<D, A>>> = None;
        self.ray_first_recursive(0, root, boxes, origin, direction, tolerance, &mut best);
        best.map(|found| found.id)
    }

    /// The first id hit by a caller ray, if any.
    pub fn ray_intersected_first_of<C>(
        &self,
        ray: &A::Ray,
        boxes: &C,
        tolerance: RealOf<D, A>,
    ) -> Option<E>
    where
        C: GeometryCollection<A::Box, Id = E> + ?Sized,
    {
        self.ray_intersected_first(A::ray_origin(ray), A::ray_direction(ray), boxes, tolerance)
    }

    // --- collision ---

    fn min_x<C>(&self, boxes: &C, id: E) -> RealOf<D, A>
    where
        C: GeometryCollection<A::Box, Id = E> + ?Sized,
    {
        A::box_min_coord(boxes.geometry(id), 0).to_real()
    }

    fn max_x<C>(&self, boxes: &C, id: E) -> RealOf<D, A>
    where
        C: GeometryCollection<A::Box, Id = E> + ?Sized,
    {
        A::box_max_coord(boxes.geometry(id), 0).to_real()
    }

    fn sort_by_min_x<C>(&self, boxes: &C, ids: &mut [E])
    where
        C: GeometryCollection<A::Box, Id = E> + ?Sized,
    {
        ids.sort_unstable_by(|&left, &right| {
            self.min_x(boxes, left)
                .partial_cmp(&self.min_x(boxes, right))
                .unwrap_or(core::cmp::Ordering::Equal)
                .then_with(|| left.cmp(&right))
        });
    }

    fn fill_collision_context<C>(
        &self,
        key: &K,
        depth: u8,
        context: &mut CollisionContext<D, E, RealOf<D, A>>,
        _boxes: &C,
    ) where
        C: GeometryCollection<A::Box, Id = E> + ?Sized,
    {
        let node = self.core.node(key);
        context.ids.clear();
        context.ids.extend_from_slice(self.core.entities_of(node));
        context.center = self.core.node_center(key, node);
        context.bounds = self.core.node_box(depth, &context.center);
    }

    /// Lift split replicas that belong to an ancestor into the parent
    /// context, then order the remaining residents for the sweep.
    fn prepare_collision_context<C>(
        &self,
        boxes: &C,
        depth: u8,
        context: &mut CollisionContext<D, E, RealOf<D, A>>,
        parent: Option<&mut CollisionContext<D, E, RealOf<D, A>>>,
        mut lifted: Option<&mut Vec<E>>,
    ) where
        C: GeometryCollection<A::Box, Id = E> + ?Sized,
    {
        if SPLIT {
            if let Some(parent) = parent {
                let mut keep = context.ids.len();
                let mut index = 0;
                while index < keep {
                    let id = context.ids[index];
                    let location = self.box_location(boxes.geometry(id));
                    if location.depth >= depth {
                        index += 1;
                        continue;
                    }
                    parent.ids.push(id);
                    if let Some(lifted) = lifted.as_mut() {
                        lifted.push(id);
                    }
                    keep -= 1;
                    context.ids.swap(index, keep);
                }
                context.ids.truncate(keep);
                self.sort_by_min_x(boxes, &mut parent.ids);
                parent.ids.dedup();
            }
        }
        self.sort_by_min_x(boxes, &mut context.ids);
    }

    /// Sweep-and-prune pass over the residents of one node.
    fn collide_inside_node<C>(
        &self,
        boxes: &C,
        context: &CollisionContext<D, E, RealOf<D, A>>,
        out: &mut Vec<(E, E)>,
        detector: Option<&(dyn Fn(E, E) -> bool + Sync)>,
    ) where
        C: GeometryCollection<A::Box, Id = E> + ?Sized,
    {
        let ids = &context.ids;
        for i in 0..ids.len() {
            let first = ids[i];
            let first_box = boxes.geometry(first);
            for &second in &ids[i + 1..] {
                let second_box = boxes.geometry(second);
                if A::box_max_coord(first_box, 0).to_real() < self.min_x(boxes, second) {
                    break;
                }
                if A::are_boxes_overlapped_strict(first_box, second_box)
                    && detector.map(|accept| accept(first, second)).unwrap_or(true)
                {
                    out.push((first, second));
                }
            }
        }
    }

    /// Test the residents of one node against the residents of every
    /// ancestor, bounded on the +x side by the node box.
    fn collide_with_parents<C>(
        &self,
        boxes: &C,
        depth: u8,
        stack: &[CollisionContext<D, E, RealOf<D, A>>],
        out: &mut Vec<(E, E)>,
        detector: Option<&(dyn Fn(E, E) -> bool + Sync)>,
    ) where
        C: GeometryCollection<A::Box, Id = E> + ?Sized,
    {
        let context = &stack[depth as usize];
        let node_sizes = self.core.node_size(depth);
        let ids = &context.ids;

        for parent_context in stack[..depth as usize].iter() {
            let mut begin = 0usize;
            for &parent_id in &parent_context.ids {
                let parent_box = boxes.geometry(parent_id);
                if A::box_min_coord(parent_box, 0).to_real() > context.bounds.max[0] {
                    break;
                }
                let parent_center = internal::box_center_of::<D, A>(parent_box);
                let parent_sizes = internal::box_size_of::<D, A>(parent_box);
                if !internal::boxes_overlap_by_center(
                    &context.center,
                    &parent_center,
                    node_sizes,
                    &parent_sizes,
                ) {
                    continue;
                }

                while begin < ids.len()
                    && self.max_x(boxes, ids[begin]) < A::box_min_coord(parent_box, 0).to_real()
                {
                    begin += 1;
                }
                for &id in &ids[begin..] {
                    if A::box_max_coord(parent_box, 0).to_real() < self.min_x(boxes, id) {
                        break;
                    }
                    if A::are_boxes_overlapped_strict(boxes.geometry(id), parent_box)
                        && detector.map(|accept| accept(id, parent_id)).unwrap_or(true)
                    {
                        out.push((id, parent_id));
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn collide_subtree<C>(
        &self,
        boxes: &C,
        depth: u8,
        key: K,
        stack: &mut Vec<CollisionContext<D, E, RealOf<D, A>>>,
        out: &mut Vec<(E, E)>,
        detector: Option<&(dyn Fn(E, E) -> bool + Sync)>,
        lifted: Option<&mut Vec<E>>,
    ) where
        C: GeometryCollection<A::Box, Id = E> + ?Sized,
    {
        let slot = depth as usize;
        {
            let (below, at) = stack.split_at_mut(slot);
            self.fill_collision_context(&key, depth, &mut at[0], boxes);
            self.prepare_collision_context(boxes, depth, &mut at[0], below.last_mut(), lifted);
        }

        let children: SmallVec<[K; 8]> = self.core.node(&key).child_keys().collect();
        for child in children {
            self.collide_subtree(boxes, depth + 1, child, stack, out, detector, None);
        }

        self.collide_inside_node(boxes, &stack[slot], out, detector);
        self.collide_with_parents(boxes, depth, stack, out, detector);
    }

    /// All strictly overlapping pairs among the indexed boxes.
    pub fn collision_detection<C>(&self, boxes: &C) -> Vec<(E, E)>
    where
        C: GeometryCollection<A::Box, Id = E> + ?Sized,
    {
        self.collect_collisions_serial(boxes, None)
    }

    /// Overlapping pairs accepted by a caller predicate; the AABB test runs
    /// first, the predicate decides the rest.
    pub fn collision_detection_with<C>(
        &self,
        boxes: &C,
        detector: &(dyn Fn(E, E) -> bool + Sync),
    ) -> Vec<(E, E)>
    where
        C: GeometryCollection<A::Box, Id = E> + ?Sized,
    {
        self.collect_collisions_serial(boxes, Some(detector))
    }

    fn collect_collisions_serial<C>(
        &self,
        boxes: &C,
        detector: Option<&(dyn Fn(E, E) -> bool + Sync)>,
    ) -> Vec<(E, E)>
    where
        C: GeometryCollection<A::Box, Id = E> + ?Sized,
    {
        let mut out = Vec::with_capacity(100.max(boxes.len() / 10));
        if self.core.nodes.is_empty() {
            return out;
        }
        let depth_slots = self.core.max_depth as usize + 1;
        let mut stack: Vec<CollisionContext<D, E, RealOf<D, A>>> =
            (0..depth_slots).map(|_| CollisionContext::empty()).collect();
        self.collide_subtree(boxes, 0, root_key(), &mut stack, &mut out, detector, None);
        out
    }

    /// Parallel self-collision: the tree is cut near the root into subtrees
    /// walked on the rayon pool; ancestor scans above the cut run serially
    /// against the union of the subtree split lifts.
    pub fn collision_detection_parallel<C>(&self, boxes: &C) -> Vec<(E, E)>
    where
        C: GeometryCollection<A::Box, Id = E> + Sync + ?Sized,
        K::Store<Node<D, K, RealOf<D, A>>>: Sync,
    {
        let d = Self::DIMS;
        if self.core.nodes.is_empty() {
            return Vec::new();
        }
        let threads = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        if self.core.nodes.len() < threads * 3 {
            return self.collect_collisions_serial(boxes, None);
        }

        // Cut the tree: expand a BFS frontier until it is wide enough to
        // feed the pool, preparing contexts of everything above the cut.
        let mut queue: Vec<K> = vec![root_key()];
        let mut context_map: FxHashMap<K, CollisionContext<D, E, RealOf<D, A>>> =
            FxHashMap::default();
        let mut frontier = 1usize;
        let mut processed = 0usize;
        while frontier > 0 && frontier < threads.saturating_sub(2) {
            let key = queue[processed];
            for child in self.core.node(&key).child_keys() {
                queue.push(child);
                frontier += 1;
            }
            frontier -= 1;

            let depth = depth_of_key(key, d);
            let mut context = CollisionContext::empty();
            self.fill_collision_context(&key, depth, &mut context, boxes);
            let parent = if processed == 0 {
                None
            } else {
                context_map.get_mut(&parent_key(key, d))
            };
            self.prepare_collision_context(boxes, depth, &mut context, parent, None);
            context_map.insert(key, context);
            processed += 1;
        }
        if frontier == 0 {
            return self.collect_collisions_serial(boxes, None);
        }
        log::trace!("parallel collision cut: {frontier} subtrees over {threads} threads");

        let depth_slots = self.core.max_depth as usize + 1;
        let frontier_keys = &queue[queue.len() - frontier..];
        let task_results: Vec<(K, Vec<(E, E)>, Vec<E>)> = frontier_keys
            .par_iter()
            .map(|&key| {
                let depth = depth_of_key(key, d);
                let mut stack: Vec<CollisionContext<D, E, RealOf<D, A>>> =
                    (0..depth_slots).map(|_| CollisionContext::empty()).collect();
                let mut ancestor = parent_key(key, d);
                let mut ancestor_depth = depth;
                while is_valid_key(ancestor) {
                    ancestor_depth -= 1;
                    stack[ancestor_depth as usize] = context_map[&ancestor].clone();
                    ancestor = parent_key(ancestor, d);
                }
                let mut pairs = Vec::new();
                let mut lifted = Vec::new();
                self.collide_subtree(boxes, depth, key, &mut stack, &mut pairs, None, Some(&mut lifted));
                (key, pairs, lifted)
            })
            .collect();

        // Fold the lifts escaping each subtree back into the shared parent
        // contexts before scanning the nodes above the cut.
        if SPLIT {
            let mut lifts_by_parent: FxHashMap<K, Vec<E>> = FxHashMap::default();
            for (key, _, lifted) in &task_results {
                if lifted.is_empty() {
                    continue;
                }
                lifts_by_parent
                    .entry(parent_key(*key, d))
                    .or_default()
                    .extend_from_slice(lifted);
            }
            for (parent, mut lifted) in lifts_by_parent {
                dedup_ids(&mut lifted);
                if let Some(context) = context_map.get_mut(&parent) {
                    context.ids.extend_from_slice(&lifted);
                    self.sort_by_min_x(boxes, &mut context.ids);
                    context.ids.dedup();
                }
            }
        }

        let mut out: Vec<(E, E)> = Vec::new();
        for &key in &queue[..queue.len() - frontier] {
            let depth = depth_of_key(key, d);
            let mut stack: Vec<CollisionContext<D, E, RealOf<D, A>>> =
                (0..depth_slots).map(|_| CollisionContext::empty()).collect();
            stack[depth as usize] = context_map[&key].clone();
            let mut ancestor = parent_key(key, d);
            let mut ancestor_depth = depth;
            while is_valid_key(ancestor) {
                ancestor_depth -= 1;
                stack[ancestor_depth as usize] = context_map[&ancestor].clone();
                ancestor = parent_key(ancestor, d);
            }
            self.collide_inside_node(boxes, &stack[depth as usize], &mut out, None);
            self.collide_with_parents(boxes, depth, &stack, &mut out, None);
        }

        for (_, pairs, _) in task_results {
            out.extend(pairs);
        }
        if SPLIT {
            dedup_pairs(&mut out);
        }
        out
    }

    /// All strictly overlapping pairs between this tree's boxes and another
    /// tree's boxes; pairs are `(this_id, other_id)`.
    pub fn collision_detection_with_other_tree<C>(
        &self,
        boxes: &C,
        other: &Self,
        other_boxes: &C,
    ) -> Vec<(E, E)>
    where
        C: GeometryCollection<A::Box, Id = E> + ?Sized,
    {
        let d = Self::DIMS;
        let mut out: Vec<(E, E)> = Vec::with_capacity(boxes.len() / 10 + 1);
        if self.core.nodes.is_empty() || other.core.nodes.is_empty() {
            return out;
        }

        let mut left_cache: FxHashMap<K, Vec<E>> = FxHashMap::default();
        let mut right_cache: FxHashMap<K, Vec<E>> = FxHashMap::default();

        let mut pending: VecDeque<[(K, bool); 2]> = VecDeque::new();
        pending.push_back([(root_key(), false), (root_key(), false)]);
        while let Some([(left_key, left_traversed), (right_key, right_traversed)]) =
            pending.pop_front()
        {
            if !left_cache.contains_key(&left_key) {
                let mut ids = self.core.entities_of(self.core.node(&left_key)).to_vec();
                self.sort_by_min_x(boxes, &mut ids);
                left_cache.insert(left_key, ids);
            }
            if !right_cache.contains_key(&right_key) {
                let mut ids = other.core.entities_of(other.core.node(&right_key)).to_vec();
                other.sort_by_min_x(other_boxes, &mut ids);
                right_cache.insert(right_key, ids);
            }
            let left_ids = &left_cache[&left_key];
            let right_ids = &right_cache[&right_key];

            // Cross sweep over the two residents lists.
            let mut begin = 0usize;
            for &left_id in left_ids {
                let left_box = boxes.geometry(left_id);
                let left_min = A::box_min_coord(left_box, 0).to_real();
                while begin < right_ids.len()
                    && other.max_x(other_boxes, right_ids[begin]) < left_min
                {
                    begin += 1;
                }
                for &right_id in &right_ids[begin..] {
                    let right_box = other_boxes.geometry(right_id);
                    if A::box_max_coord(left_box, 0).to_real()
                        < A::box_min_coord(right_box, 0).to_real()
                    {
                        break;
                    }
                    if A::are_boxes_overlapped_strict(left_box, right_box) {
                        out.push((left_id, right_id));
                    }
                }
            }

            // Child pairs, plus each parent against the other side's
            // children while the parent still has residents.
            let mut left_children: Vec<(K, bool)> = Vec::new();
            if !left_traversed {
                left_children.extend(self.core.node(&left_key).child_keys().map(|key| (key, false)));
            }
            let mut right_children: Vec<(K, bool)> = Vec::new();
            if !right_traversed {
                right_children
                    .extend(other.core.node(&right_key).child_keys().map(|key| (key, false)));
            }
            if left_children.is_empty() && right_children.is_empty() {
                continue;
            }
            if !self.core.entities_of(self.core.node(&left_key)).is_empty() {
                left_children.push((left_key, true));
            }
            if !other.core.entities_of(other.core.node(&right_key)).is_empty() {
                right_children.push((right_key, true));
            }

            for &(left_child, left_done) in &left_children {
                for &(right_child, right_done) in &right_children {
                    if left_child == left_key && right_child == right_key {
                        continue;
                    }
                    let left_node = self.core.node(&left_child);
                    let right_node = other.core.node(&right_child);
                    let left_center = self.core.node_center(&left_child, left_node);
                    let right_center = other.core.node_center(&right_child, right_node);
                    if internal::boxes_overlap_by_center(
                        &left_center,
                        &right_center,
                        self.core.node_size(depth_of_key(left_child, d)),
                        other.core.node_size(depth_of_key(right_child, d)),
                    ) {
                        pending.push_back([(left_child, left_done), (right_child, right_done)]);
                    }
                }
            }
        }

        if SPLIT {
            dedup_pairs(&mut out);
        }
        out
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

    /// All ids in breadth-first node order; split replicas appear once per
    /// holding node.
    pub fn collect_all_entities_in_bfs(&self, sort_inside_nodes: bool) -> Vec<E> {
        self.core.collect_bfs(root_key(), sort_inside_nodes)
    }

    /// All ids in depth-first pre-order; split replicas appear once per
    /// holding node.
    pub fn collect_all_entities_in_dfs(&self, sort_inside_nodes: bool) -> Vec<E> {
        let mut out = Vec::new();
        self.core
            .collect_dfs_into(&root_key(), &mut out, sort_inside_nodes);
        out
    }

    /// A node currently holding `id`, found by linear scan; zero key if
    /// absent.
    pub fn find(&self, id: E) -> K {
        self.core.find_entity_node(id)
    }

    /// Replace or drop ids wholesale.
    pub fn update_indexes<S: core::hash::BuildHasher>(
        &mut self,
        updates: &std::collections::HashMap<E, Option<E>, S>,
    ) {
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use orthant_geometry::{BoxND, Cartesian, RayND};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    type Quad<const SPLIT: bool> = BoxTree<2, SPLIT, Cartesian<2, f64>, u32, usize>;
    type Oct = BoxTree<3, true, Cartesian<3, f64>, u32, usize>;

    fn scenario_boxes() -> Vec<BoxND<2, f64>> {
        vec![
            BoxND::new([0.0, 0.0], [1.0, 1.0]),
            BoxND::new([1.0, 1.0], [2.0, 2.0]),
            BoxND::new([2.0, 2.0], [3.0, 3.0]),
            BoxND::new([3.0, 3.0], [4.0, 4.0]),
            BoxND::new([1.2, 1.2], [2.8, 2.8]),
        ]
    }

    fn scenario_tree<const SPLIT: bool>() -> (Vec<BoxND<2, f64>>, Quad<SPLIT>) {
        let boxes = scenario_boxes();
        let tree = Quad::<SPLIT>::build(
            &boxes,
            TreeOptions {
                max_depth: Some(3),
                max_entities_per_node: 2,
                ..Default::default()
            },
        );
        (boxes, tree)
    }

    fn random_boxes(count: usize, seed: u64) -> Vec<BoxND<2, f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|_| {
                let min = [rng.gen_range(0.0..30.0), rng.gen_range(0.0..30.0)];
                BoxND::new(
                    min,
                    [min[0] + rng.gen_range(0.1..2.0), min[1] + rng.gen_range(0.1..2.0)],
                )
            })
            .collect()
    }

    fn brute_force_pairs(boxes: &[BoxND<2, f64>]) -> Vec<(usize, usize)> {
        type AD = Cartesian<2, f64>;
        let mut pairs = Vec::new();
        for i in 0..boxes.len() {
            for j in (i + 1)..boxes.len() {
                if AD::are_boxes_overlapped_strict(&boxes[i], &boxes[j]) {
                    pairs.push((i, j));
                }
            }
        }
        pairs
    }

    fn normalize_pairs(mut pairs: Vec<(usize, usize)>) -> Vec<(usize, usize)> {
        for pair in pairs.iter_mut() {
            if pair.0 > pair.1 {
                *pair = (pair.1, pair.0);
            }
        }
        pairs.sort_unstable();
        pairs.dedup();
        pairs
    }

    #[test]
    fn scenario_range_search_contain_and_overlap() {
        let (boxes, tree) = scenario_tree::<true>();
        let range = BoxND::new([1.0, 1.0], [3.1, 3.1]);

        let contained = tree.range_search(&range, &boxes, true);
        assert_eq!(contained, vec![1, 2, 4]);

        let overlapped = tree.range_search(&range, &boxes, false);
        assert_eq!(overlapped, vec![1, 2, 3, 4]);

        // A range entirely outside the world finds nothing.
        let outside = BoxND::new([5.0, 5.0], [6.0, 6.0]);
        assert!(tree.range_search(&outside, &boxes, false).is_empty());
    }

    #[test]
    fn scenario_pick_search() {
        let (boxes, tree) = scenario_tree::<true>();
        let picked = tree.pick_search(&[2.5, 2.5], &boxes);
        assert_eq!(picked, vec![2, 4]);

        // A pick on the corner shared by four boxes.
        let mut corner = tree.pick_search(&[2.0, 2.0], &boxes);
        corner.sort_unstable();
        assert_eq!(corner, vec![1, 2, 4]);
    }

    #[test]
    fn split_mode_replicates_across_touched_children() {
        type AD3 = Cartesian<3, f64>;
        type OctOf<const SPLIT: bool> = BoxTree<3, SPLIT, AD3, u32, usize>;
        // Box 0 straddles the x and y midplanes of the root but stays in the
        // lower z half: two touched dimensions, four receiving children.
        let boxes = vec![
            BoxND::new([0.9, 0.9, 0.2], [1.1, 1.1, 0.4]),
            BoxND::new([0.1, 0.1, 0.1], [0.3, 0.3, 0.3]),
            BoxND::new([1.6, 1.6, 1.6], [1.9, 1.9, 1.9]),
            BoxND::new([0.1, 1.6, 0.2], [0.3, 1.9, 0.4]),
            BoxND::new([1.0, 1.0, 0.1], [1.2, 1.2, 0.5]),
        ];
        let options = || TreeOptions {
            world_box: Some(BoxND::new([0.0, 0.0, 0.0], [2.0, 2.0, 2.0])),
            max_depth: Some(2),
            max_entities_per_node: 1,
            ..Default::default()
        };

        let split_tree = OctOf::<true>::build(&boxes, options());
        let replicas = split_tree
            .collect_all_entities_in_bfs(false)
            .into_iter()
            .filter(|id| *id == 0)
            .count();
        assert_eq!(replicas, 4, "straddling box fans out into its touched children");

        let plain_tree = OctOf::<false>::build(&boxes, options());
        let anchored = plain_tree
            .collect_all_entities_in_bfs(false)
            .into_iter()
            .filter(|id| *id == 0)
            .count();
        assert_eq!(anchored, 1, "without splitting the box stays at its node");

        // Identical pair sets either way, each pair exactly once.
        let mut expected = Vec::new();
        for i in 0..boxes.len() {
            for j in (i + 1)..boxes.len() {
                if AD3::are_boxes_overlapped_strict(&boxes[i], &boxes[j]) {
                    expected.push((i, j));
                }
            }
        }
        expected.sort_unstable();
        assert!(!expected.is_empty(), "scenario should contain a collision");

        let split_pairs = split_tree.collision_detection(&boxes);
        assert_eq!(normalize_pairs(split_pairs.clone()), expected);
        assert_eq!(split_pairs.len(), expected.len(), "no duplicate pairs");
        let plain_pairs = plain_tree.collision_detection(&boxes);
        assert_eq!(normalize_pairs(plain_pairs.clone()), expected);
        assert_eq!(plain_pairs.len(), expected.len());
    }

    #[test]
    fn range_search_matches_brute_force() {
        type AD = Cartesian<2, f64>;
        let boxes = random_boxes(250, 17);
        for split in [false, true] {
            let run = |tree_pairs: Vec<usize>, range: &BoxND<2, f64>, contain: bool| {
                let mut expected: Vec<usize> = boxes
                    .iter()
                    .enumerate()
                    .filter(|(_, b)| {
                        if contain {
                            AD::are_boxes_overlapped(range, b, true)
                        } else {
                            AD::are_boxes_overlapped_strict(range, b)
                        }
                    })
                    .map(|(id, _)| id)
                    .collect();
                expected.sort_unstable();
                let mut got = tree_pairs;
                got.sort_unstable();
                assert_eq!(got, expected);
            };
            let mut rng = StdRng::seed_from_u64(23);
            if split {
                let tree = Quad::<true>::build(
                    &boxes,
                    TreeOptions {
                        max_depth: Some(4),
                        max_entities_per_node: 4,
                        ..Default::default()
                    },
                );
                for _ in 0..40 {
                    let low = [rng.gen_range(0.0..25.0), rng.gen_range(0.0..25.0)];
                    let range =
                        BoxND::new(low, [low[0] + rng.gen_range(1.0..6.0), low[1] + rng.gen_range(1.0..6.0)]);
                    run(tree.range_search(&range, &boxes, false), &range, false);
                    run(tree.range_search(&range, &boxes, true), &range, true);
                }
            } else {
                let tree = Quad::<false>::build(
                    &boxes,
                    TreeOptions {
                        max_depth: Some(4),
                        max_entities_per_node: 4,
                        ..Default::default()
                    },
                );
                for _ in 0..40 {
                    let low = [rng.gen_range(0.0..25.0), rng.gen_range(0.0..25.0)];
                    let range =
                        BoxND::new(low, [low[0] + rng.gen_range(1.0..6.0), low[1] + rng.gen_range(1.0..6.0)]);
                    run(tree.range_search(&range, &boxes, false), &range, false);
                    run(tree.range_search(&range, &boxes, true), &range, true);
                }
            }
        }
    }

    #[test]
    fn pick_matches_brute_force() {
        type AD = Cartesian<2, f64>;
        let boxes = random_boxes(200, 5);
        let tree = Quad::<true>::build(
            &boxes,
            TreeOptions {
                max_depth: Some(4),
                max_entities_per_node: 3,
                ..Default::default()
            },
        );
        let mut rng = StdRng::seed_from_u64(31);
        for _ in 0..60 {
            let point = [rng.gen_range(0.0..31.0), rng.gen_range(0.0..31.0)];
            let mut got = tree.pick_search(&point, &boxes);
            got.sort_unstable();
            let mut expected: Vec<usize> = boxes
                .iter()
                .enumerate()
                .filter(|(_, b)| AD::does_box_contain_point(b, &point, 0.0))
                .map(|(id, _)| id)
                .collect();
            expected.sort_unstable();
            assert_eq!(got, expected, "pick at {point:?}");
        }
    }

    #[test]
    fn collision_matches_brute_force_and_is_idempotent() {
        let boxes = random_boxes(220, 99);
        let expected = normalize_pairs(brute_force_pairs(&boxes));
        let tree = Quad::<true>::build(
            &boxes,
            TreeOptions {
                max_depth: Some(4),
                max_entities_per_node: 4,
                ..Default::default()
            },
        );
        let first = tree.collision_detection(&boxes);
        assert_eq!(normalize_pairs(first.clone()), expected);
        // Exactly once per pair even with split replicas.
        assert_eq!(first.len(), expected.len());

        let second = tree.collision_detection(&boxes);
        assert_eq!(normalize_pairs(second), expected);

        let parallel = tree.collision_detection_parallel(&boxes);
        assert_eq!(normalize_pairs(parallel), expected);
    }

    #[test]
    fn collision_against_another_tree() {
        let left_boxes = random_boxes(120, 1);
        let right_boxes = random_boxes(140, 2);
        type AD = Cartesian<2, f64>;
        let left = Quad::<true>::build(
            &left_boxes,
            TreeOptions {
                max_depth: Some(4),
                max_entities_per_node: 4,
                ..Default::default()
            },
        );
        let right = Quad::<true>::build(
            &right_boxes,
            TreeOptions {
                max_depth: Some(4),
                max_entities_per_node: 4,
                ..Default::default()
            },
        );
        let mut got = left.collision_detection_with_other_tree(&left_boxes, &right, &right_boxes);
        got.sort_unstable();
        got.dedup();
        let mut expected = Vec::new();
        for (i, a) in left_boxes.iter().enumerate() {
            for (j, b) in right_boxes.iter().enumerate() {
                if AD::are_boxes_overlapped_strict(a, b) {
                    expected.push((i, j));
                }
            }
        }
        expected.sort_unstable();
        assert_eq!(got, expected);
    }

    #[test]
    fn ray_hits_box_front_to_back() {
        let boxes = vec![BoxND::new([-1.0, -1.0, -1.0], [0.0, 0.0, 0.0])];
        let tree = Oct::build(
            &boxes,
            TreeOptions {
                max_depth: Some(2),
                ..Default::default()
            },
        );
        let hit = tree.ray_intersected_first(&[0.5, 0.5, 0.5], &[-1.0, -1.0, -1.0], &boxes, 0.0);
        assert_eq!(hit, Some(0));

        let ray = RayND {
            origin: [0.5, 0.5, 0.5],
            direction: [-1.0, -1.0, -1.0],
        };
        let all = tree.ray_intersected_all_of(&ray, &boxes, 0.0, 0.0);
        assert_eq!(all, vec![0]);

        let miss = tree.ray_intersected_first(&[0.5, 0.5, 0.5], &[1.0, 0.0, 0.0], &boxes, 0.0);
        assert_eq!(miss, None);
    }

    #[test]
    fn ray_orders_hits_by_distance() {
        let boxes = vec![
            BoxND::new([4.0, 0.0, 0.0], [5.0, 1.0, 1.0]),
            BoxND::new([1.0, 0.0, 0.0], [2.0, 1.0, 1.0]),
            BoxND::new([7.0, 0.0, 0.0], [8.0, 1.0, 1.0]),
            BoxND::new([0.0, 3.0, 0.0], [1.0, 4.0, 1.0]),
        ];
        let tree = Oct::build(
            &boxes,
            TreeOptions {
                max_depth: Some(3),
                max_entities_per_node: 1,
                ..Default::default()
            },
        );
        let origin = [0.0, 0.5, 0.5];
        let direction = [1.0, 0.0, 0.0];
        assert_eq!(
            tree.ray_intersected_all(&origin, &direction, &boxes, 0.0, 0.0),
            vec![1, 0, 2]
        );
        assert_eq!(
            tree.ray_intersected_first(&origin, &direction, &boxes, 0.0),
            Some(1)
        );
        // Bounded examination distance cuts the far hits.
        assert_eq!(
            tree.ray_intersected_all(&origin, &direction, &boxes, 0.0, 5.0),
            vec![1, 0]
        );
    }

    #[test]
    fn erase_and_update_maintain_membership() {
        let (mut boxes, mut tree) = scenario_tree::<true>();
        let erased_box = boxes[4];
        assert!(tree.erase(4, &erased_box, false));
        // A sub-world range, so the whole-collection shortcut does not apply.
        let survivors = tree.range_search(&BoxND::new([0.1, 0.1], [3.9, 3.9]), &boxes, false);
        assert_eq!(survivors, vec![0, 1, 2, 3]);

        // Unknown id: nothing changes.
        assert!(!tree.erase(9, &boxes[1], false));

        boxes[0] = BoxND::new([3.1, 3.1], [3.9, 3.9]);
        assert!(tree.update_with_rebalancing(0, &boxes[0], &boxes));
        let moved = tree.pick_search(&[3.5, 3.5], &boxes);
        assert_eq!(moved, vec![0, 3]);
    }

    #[test]
    fn insert_grows_the_tree() {
        let mut boxes = scenario_boxes();
        let mut tree = Quad::<true>::build(
            &boxes,
            TreeOptions {
                world_box: Some(BoxND::new([0.0, 0.0], [4.0, 4.0])),
                max_depth: Some(3),
                max_entities_per_node: 2,
                ..Default::default()
            },
        );
        boxes.push(BoxND::new([0.2, 0.2], [0.4, 0.4]));
        assert!(tree.insert_with_rebalancing(5, &boxes[5], &boxes));
        let found = tree.pick_search(&[0.3, 0.3], &boxes);
        assert_eq!(found, vec![0, 5]);

        // Out-of-world boxes are rejected.
        assert!(!tree.insert(6, &BoxND::new([3.5, 3.5], [4.5, 4.5]), false));
    }

    #[test]
    fn plane_queries_classify_boxes() {
        let boxes = vec![
            BoxND::new([0.0, 0.0], [1.0, 1.0]),
            BoxND::new([1.5, 0.0], [2.5, 1.0]),
            BoxND::new([3.0, 0.0], [4.0, 1.0]),
        ];
        let tree = Quad::<true>::build(
            &boxes,
            TreeOptions {
                max_depth: Some(3),
                ..Default::default()
            },
        );
        // Vertical plane x = 2 crosses only the middle box.
        let mut crossed = tree.plane_intersection(2.0, &[1.0, 0.0], 0.0, &boxes);
        crossed.sort_unstable();
        assert_eq!(crossed, vec![1]);

        let mut positive = tree.plane_positive_segmentation(2.0, &[1.0, 0.0], 0.0, &boxes);
        positive.sort_unstable();
        assert_eq!(positive, vec![1, 2]);
    }

    #[test]
    fn parallel_build_matches_serial() {
        let boxes = random_boxes(300, 77);
        let serial = Quad::<true>::build(
            &boxes,
            TreeOptions {
                max_depth: Some(4),
                max_entities_per_node: 4,
                ..Default::default()
            },
        );
        let parallel = Quad::<true>::build(
            &boxes,
            TreeOptions {
                max_depth: Some(4),
                max_entities_per_node: 4,
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
    fn move_commutes_with_queries() {
        let (mut boxes, mut tree) = scenario_tree::<true>();
        let before = tree.range_search(&BoxND::new([1.0, 1.0], [3.1, 3.1]), &boxes, false);
        tree.move_by(&[10.0, 0.0], Execution::Sequential);
        for b in boxes.iter_mut() {
            b.min[0] += 10.0;
            b.max[0] += 10.0;
        }
        let after = tree.range_search(&BoxND::new([11.0, 1.0], [13.1, 3.1]), &boxes, false);
        assert_eq!(before, after);
    }

    #[test]
    fn update_indexes_remaps_and_drops() {
        let (boxes, mut tree) = scenario_tree::<false>();
        let mut remap = std::collections::HashMap::new();
        remap.insert(0usize, Some(10usize));
        remap.insert(3usize, None);
        tree.update_indexes(&remap);
        let mut ids = tree.collect_all_entities_in_bfs(false);
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 4, 10]);
        let _ = boxes;
    }
}
