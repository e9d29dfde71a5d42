// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Abstract ownership/access state over physical addresses
//! OWNERS: @kernel-mm-team
//! PUBLIC API: RangeMap, OwnershipState (owned_by/accessible_by/reassign/forget)
//! DEPENDS_ON: types::{EntitySet, AddrRange}, mm::pte::LeafAttrs
//! INVARIANTS: RangeMap is canonical: disjoint intervals, no default values,
//!             no two touching intervals with equal values

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::mm::pte::LeafAttrs;
use crate::types::{AddrRange, Entity, EntitySet, PAddr};

/// Total map from `u64` to `V`, stored as intervals of non-default values.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeMap<V> {
    map: BTreeMap<u64, (u64, V)>,
}

impl<V: Copy + Default + Eq> RangeMap<V> {
    pub fn new() -> Self {
        Self { map: BTreeMap::new() }
    }

    pub fn get(&self, at: u64) -> V {
        match self.map.range(..=at).next_back() {
            Some((_, &(end, value))) if end > at => value,
            _ => V::default(),
        }
    }

    /// Replaces every value `v` in `[begin, end)` by `f(v)`.
    pub fn update(&mut self, begin: u64, end: u64, f: impl Fn(V) -> V) {
        if begin >= end {
            return;
        }
        self.split_at(begin);
        self.split_at(end);
        let existing: Vec<(u64, u64, V)> = self.map.range(begin..end).map(|(&b, &(e, v))| (b, e, v)).collect();
        let mut pieces = Vec::with_capacity(existing.len() * 2 + 1);
        let mut cursor = begin;
        for (b, e, v) in existing {
            self.map.remove(&b);
            if cursor < b {
                pieces.push((cursor, b, f(V::default())));
            }
            pieces.push((b, e, f(v)));
            cursor = e;
        }
        if cursor < end {
            pieces.push((cursor, end, f(V::default())));
        }
        for (b, e, v) in pieces {
            if v != V::default() {
                self.map.insert(b, (e, v));
            }
        }
        self.coalesce(begin, end);
    }

    fn split_at(&mut self, at: u64) {
        if let Some((&b, &(e, v))) = self.map.range(..at).next_back() {
            if e > at {
                self.map.insert(b, (at, v));
                self.map.insert(at, (e, v));
            }
        }
    }

    fn coalesce(&mut self, begin: u64, end: u64) {
        let start = self.map.range(..begin).next_back().map_or(begin, |(&b, _)| b);
        let keys: Vec<u64> = self.map.range(start..=end).map(|(&b, _)| b).collect();
        let mut prev: Option<u64> = None;
        for key in keys {
            let Some(&(e, v)) = self.map.get(&key) else { continue };
            if let Some(p) = prev {
                if let Some(&(pe, pv)) = self.map.get(&p) {
                    if pe == key && pv == v {
                        self.map.remove(&key);
                        self.map.insert(p, (e, v));
                        continue;
                    }
                }
            }
            prev = Some(key);
        }
    }

    /// Non-default intervals in address order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64, V)> + '_ {
        self.map.iter().map(|(&b, &(e, v))| (b, e, v))
    }

    /// Lowest address at which the two maps disagree.
    pub fn first_difference(&self, other: &Self) -> Option<u64> {
        let mut points: Vec<u64> = self.iter().chain(other.iter()).flat_map(|(b, e, _)| [b, e]).collect();
        points.sort_unstable();
        points.dedup();
        points.into_iter().find(|&at| self.get(at) != other.get(at))
    }
}

/// Abstract attribution of every physical address.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OwnershipState {
    owned_by: RangeMap<EntitySet>,
    accessible_by: RangeMap<EntitySet>,
}

impl OwnershipState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owned_by(&self, addr: PAddr) -> EntitySet {
        self.owned_by.get(addr.raw())
    }

    pub fn accessible_by(&self, addr: PAddr) -> EntitySet {
        self.accessible_by.get(addr.raw())
    }

    /// Sets `entity`'s membership over `range` to what `attrs` encodes.
    /// Nothing outside `range` changes.
    pub fn reassign(&mut self, entity: Entity, range: AddrRange, attrs: LeafAttrs) {
        let (begin, end) = (range.begin.raw(), range.end.raw());
        self.owned_by.update(begin, end, |set| set.set(entity, attrs.owned));
        self.accessible_by.update(begin, end, |set| set.set(entity, attrs.valid));
    }

    /// Drops `entity` from every set.
    pub fn forget(&mut self, entity: Entity) {
        self.owned_by.update(0, u64::MAX, |set| set.without(entity));
        self.accessible_by.update(0, u64::MAX, |set| set.without(entity));
    }

    /// First address and entity on which the two states disagree.
    pub fn first_difference(&self, other: &Self) -> Option<(Entity, PAddr)> {
        let owned = self.owned_by.first_difference(&other.owned_by).map(|at| (at, &self.owned_by, &other.owned_by));
        let accessible = self
            .accessible_by
            .first_difference(&other.accessible_by)
            .map(|at| (at, &self.accessible_by, &other.accessible_by));
        let (at, ours, theirs) = match (owned, accessible) {
            (Some(o), Some(a)) => {
                if a.0 < o.0 {
                    a
                } else {
                    o
                }
            }
            (Some(o), None) => o,
            (None, Some(a)) => a,
            (None, None) => return None,
        };
        let (ours, theirs) = (ours.get(at), theirs.get(at));
        let entity = ours.iter().chain(theirs.iter()).find(|&e| ours.contains(e) != theirs.contains(e))?;
        Some((entity, PAddr::new(at)))
    }
}
