// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Root handle of one translation table and its read-side walks.

extern crate alloc;

use alloc::vec::Vec;

use crate::error::{IsolationError, Violation};
use crate::mm::node::{NodeArena, TablePtr};
use crate::mm::pte::{Mode, Pte, PteKind};
use crate::mm::stage::{NodeLocation, Stage};
use crate::pool::{FrameAllocator, FramePool};
use crate::types::{AddrRange, Entity, PAddr, VAddr, ENTRIES_PER_NODE};

/// Result of walking a table for one input address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Translation {
    /// Leaf descriptor that terminated the walk.
    pub pte: Pte,
    /// Level of that descriptor.
    pub level: u8,
    /// Output address of the looked-up input address.
    pub pa: PAddr,
    pub mode: Mode,
}

/// Root pointer, stage and owning entity of a table. Fixed for its lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageTable {
    root: TablePtr,
    stage: Stage,
    entity: Entity,
}

impl PageTable {
    /// Allocates the (possibly concatenated) root frames of an empty table.
    pub fn new(stage: Stage, entity: Entity, pool: &mut FramePool) -> Result<Self, IsolationError> {
        let root = if stage.root_frames() == 1 {
            pool.allocate()
        } else {
            pool.allocate_contiguous(stage.root_frames())
        };
        let root = root.ok_or(IsolationError::PoolExhausted)?;
        Ok(Self { root, stage, entity })
    }

    #[inline]
    pub fn root(&self) -> TablePtr {
        self.root
    }

    #[inline]
    pub fn stage(&self) -> &Stage {
        &self.stage
    }

    #[inline]
    pub fn entity(&self) -> Entity {
        self.entity
    }

    /// Locations of the root frames.
    pub fn root_locations(&self) -> impl Iterator<Item = NodeLocation> + '_ {
        let level = self.stage.max_level();
        (0..self.stage.root_frames()).map(move |frame| NodeLocation {
            ptr: self.root.offset(frame),
            base: VAddr::new(frame as u64 * Stage::node_span(level)),
            level,
        })
    }

    /// Walks the table for `addr` and stops at the first leaf.
    ///
    /// Returns `None` for absent translations and addresses beyond the stage.
    pub fn lookup(&self, arena: &NodeArena, addr: VAddr) -> Result<Option<Translation>, Violation> {
        if addr.raw() >= self.stage.limit() {
            return Ok(None);
        }
        let mut level = self.stage.max_level();
        let mut index = self.stage.index(addr, level);
        let mut node = self.root.offset(index / ENTRIES_PER_NODE);
        index %= ENTRIES_PER_NODE;
        loop {
            let pte = arena.deref(node)?.load(index);
            match self.stage.classify(pte, level) {
                PteKind::Table(child) => {
                    node = child;
                    level -= 1;
                    index = self.stage.index(addr, level);
                }
                PteKind::Absent => return Ok(None),
                kind @ PteKind::Block { pa, .. } => {
                    let offset = addr.raw() & (Stage::entry_size(level) - 1);
                    let mode = self.stage.leaf_mode(kind).unwrap_or(Mode::ABSENT);
                    return Ok(Some(Translation { pte, level, pa: PAddr::new(pa.raw() + offset), mode }));
                }
            }
        }
    }

    /// Visits every leaf entry overlapping `range` in address order, clipped
    /// to `range`. Absent entries are visited too.
    pub fn walk_leaves<F>(&self, arena: &NodeArena, range: AddrRange, f: &mut F) -> Result<(), Violation>
    where
        F: FnMut(AddrRange, PteKind),
    {
        for location in self.root_locations() {
            self.walk_node(arena, location, range, f)?;
        }
        Ok(())
    }

    /// Like [`PageTable::walk_leaves`], starting from the node at `location`.
    pub(crate) fn walk_node<F>(&self, arena: &NodeArena, location: NodeLocation, range: AddrRange, f: &mut F) -> Result<(), Violation>
    where
        F: FnMut(AddrRange, PteKind),
    {
        let node = arena.deref(location.ptr)?;
        for (index, entry) in entries_overlapping(location, range) {
            let kind = self.stage.classify(node.load(index), location.level);
            match kind {
                PteKind::Table(child) if location.level > 0 => {
                    let child = NodeLocation { ptr: child, base: entry.begin, level: location.level - 1 };
                    self.walk_node(arena, child, range, f)?;
                }
                _ => {
                    if let Some(clipped) = entry.intersect(&range) {
                        f(clipped, kind);
                    }
                }
            }
        }
        Ok(())
    }

    /// Mode of `range` if every address in it shares one. Empty ranges have none.
    pub fn get_mode(&self, arena: &NodeArena, range: AddrRange) -> Result<Option<Mode>, Violation> {
        let mut uniform: Option<Option<Mode>> = None;
        self.walk_leaves(arena, range, &mut |_, kind| {
            let mode = self.stage.leaf_mode(kind);
            uniform = match uniform {
                None => Some(mode),
                Some(prev) if prev == mode => Some(prev),
                Some(_) => Some(None),
            };
        })?;
        Ok(uniform.flatten())
    }

    /// Every node of the table, root frames first, each paired with its level.
    pub fn collect_nodes(&self, arena: &NodeArena) -> Result<Vec<(TablePtr, u8)>, Violation> {
        let mut out = Vec::new();
        for location in self.root_locations() {
            out.push((location.ptr, location.level));
        }
        for location in self.root_locations() {
            collect_subtree_children(arena, &self.stage, location.ptr, location.level, &mut out)?;
        }
        Ok(out)
    }

    /// Returns every node, roots included, to `pool`.
    pub fn free(self, arena: &NodeArena, pool: &mut impl FrameAllocator) -> Result<(), Violation> {
        for (ptr, _) in self.collect_nodes(arena)? {
            pool.free(ptr);
        }
        Ok(())
    }
}

/// `ptr` and every node below it.
pub(crate) fn collect_subtree(
    arena: &NodeArena,
    stage: &Stage,
    ptr: TablePtr,
    level: u8,
    out: &mut Vec<(TablePtr, u8)>,
) -> Result<(), Violation> {
    out.push((ptr, level));
    collect_subtree_children(arena, stage, ptr, level, out)
}

fn collect_subtree_children(
    arena: &NodeArena,
    stage: &Stage,
    ptr: TablePtr,
    level: u8,
    out: &mut Vec<(TablePtr, u8)>,
) -> Result<(), Violation> {
    if level == 0 {
        return Ok(());
    }
    let node = arena.deref(ptr)?;
    for index in 0..ENTRIES_PER_NODE {
        if let PteKind::Table(child) = stage.classify(node.load(index), level) {
            collect_subtree(arena, stage, child, level - 1, out)?;
        }
    }
    Ok(())
}

/// Entries of the node at `location` whose span overlaps `range`, with their
/// input-address span.
pub(crate) fn entries_overlapping(location: NodeLocation, range: AddrRange) -> impl Iterator<Item = (usize, AddrRange)> {
    let size = Stage::entry_size(location.level);
    let base = location.base.raw();
    let end = base + Stage::node_span(location.level);
    let (first, last) = if range.is_empty() || range.end.raw() <= base || range.begin.raw() >= end {
        (0, 0)
    } else {
        let lo = range.begin.raw().max(base) - base;
        let hi = range.end.raw().min(end) - base;
        ((lo / size) as usize, hi.div_ceil(size) as usize)
    };
    (first..last).map(move |index| {
        let begin = base + index as u64 * size;
        (index, AddrRange::new(begin, begin + size))
    })
}
