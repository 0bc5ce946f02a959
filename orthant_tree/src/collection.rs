// Copyright 2025 the Orthant Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The non-owning container protocol.
//!
//! Trees index caller-owned collections and store only the ids. Contiguous
//! sequences use the element index as the id; maps use their key. Every tree
//! operation that needs geometry borrows the collection for the duration of
//! the call; the tree never writes into it.

use core::fmt::Debug;
use core::hash::Hash;
use std::collections::{BTreeMap, HashMap};

/// Identifier of an entity in a caller collection.
pub trait EntityId: Copy + Eq + Ord + Hash + Debug + Default + Send + Sync + 'static {
    /// Compact the id space after an erase: ids above the removed one shift
    /// down by one. Identity for id types without a dense index semantic.
    #[inline]
    fn shift_down(self, _removed: Self) -> Self {
        self
    }
}

macro_rules! index_entity_id {
    ($ty:ty) => {
        impl EntityId for $ty {
            #[inline]
            fn shift_down(self, removed: Self) -> Self {
                self - (removed < self) as $ty
            }
        }
    };
}

index_entity_id!(usize);
index_entity_id!(u32);
index_entity_id!(u64);

/// A collection of geometric entities with stable ids.
pub trait GeometryCollection<G> {
    /// Id type handed out to the tree.
    type Id: EntityId;

    /// Whether ids form the dense range `0..len` (sequence containers).
    const IS_CONTIGUOUS: bool;

    /// Number of entities.
    fn len(&self) -> usize;

    /// Whether the collection is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Geometry of an entity. Panics on a stale id; ids are the caller's
    /// contract.
    fn geometry(&self, id: Self::Id) -> &G;

    /// Iterate all entities with their ids.
    fn iter_entities<'a>(&'a self) -> impl Iterator<Item = (Self::Id, &'a G)>
    where
        G: 'a;
}

impl<G> GeometryCollection<G> for [G] {
    type Id = usize;
    const IS_CONTIGUOUS: bool = true;

    fn len(&self) -> usize {
        <[G]>::len(self)
    }

    fn geometry(&self, id: usize) -> &G {
        &self[id]
    }

    fn iter_entities<'a>(&'a self) -> impl Iterator<Item = (usize, &'a G)>
    where
        G: 'a,
    {
        self.iter().enumerate()
    }
}

impl<G> GeometryCollection<G> for Vec<G> {
    type Id = usize;
    const IS_CONTIGUOUS: bool = true;

    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn geometry(&self, id: usize) -> &G {
        &self[id]
    }

    fn iter_entities<'a>(&'a self) -> impl Iterator<Item = (usize, &'a G)>
    where
        G: 'a,
    {
        self.as_slice().iter().enumerate()
    }
}

impl<G, const N: usize> GeometryCollection<G> for [G; N] {
    type Id = usize;
    const IS_CONTIGUOUS: bool = true;

    fn len(&self) -> usize {
        N
    }

    fn geometry(&self, id: usize) -> &G {
        &self[id]
    }

    fn iter_entities<'a>(&'a self) -> impl Iterator<Item = (usize, &'a G)>
    where
        G: 'a,
    {
        self.as_slice().iter().enumerate()
    }
}

impl<Id: EntityId, G, S: core::hash::BuildHasher> GeometryCollection<G> for HashMap<Id, G, S> {
    type Id = Id;
    const IS_CONTIGUOUS: bool = false;

    fn len(&self) -> usize {
        HashMap::len(self)
    }

    fn geometry(&self, id: Id) -> &G {
        &self[&id]
    }

    fn iter_entities<'a>(&'a self) -> impl Iterator<Item = (Id, &'a G)>
    where
        G: 'a,
    {
        self.iter().map(|(id, geometry)| (*id, geometry))
    }
}

impl<Id: EntityId, G> GeometryCollection<G> for BTreeMap<Id, G> {
    type Id = Id;
    const IS_CONTIGUOUS: bool = false;

    fn len(&self) -> usize {
        BTreeMap::len(self)
    }

    fn geometry(&self, id: Id) -> &G {
        &self[&id]
    }

    fn iter_entities<'a>(&'a self) -> impl Iterator<Item = (Id, &'a G)>
    where
        G: 'a,
    {
        self.iter().map(|(id, geometry)| (*id, geometry))
    }
}
