// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Reassignment engine: every table write goes through replace_node
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Reassigner::{replace_node, prepare, prepare_change, coalesce},
//!             PreparedUpdate::{commit, commit_unmerged, rollback}, ModeChange, LedgerDelta
//! DEPENDS_ON: mm::{node, page_table, stage}, model::OwnershipState, pool::FrameAllocator
//! INVARIANTS: Ledger changes cover only the table's entity and only the given
//!             range; they are buffered in a LedgerDelta and published by the
//!             caller in one step; commit never allocates; a failed prepare
//!             leaves the table exactly as it found it
//!
//! Range updates run in two phases. `prepare` splits every block and adds every
//! subtree the update needs; splits do not change any translation and are
//! journaled so they can be undone. `commit` then writes the leaves, folds
//! uniform subtrees back into blocks and frees what it unlinked.
//!
//! Several updates prepared before any of them commits must use
//! `commit_unmerged` followed by `coalesce`: folding one update's subtree can
//! otherwise remove a node another prepared update still expects.

extern crate alloc;

use alloc::vec::Vec;

use crate::error::{invariant_violation, IsolationError, Violation};
use crate::mm::node::{index_sequences_to_pointer, NodeArena, TablePtr};
use crate::mm::page_table::{collect_subtree, entries_overlapping, PageTable};
use crate::mm::pte::{LeafAttrs, Mode, Pte, PteKind};
use crate::mm::stage::{NodeLocation, Stage};
use crate::model::OwnershipState;
use crate::pool::FrameAllocator;
use crate::types::{AddrRange, Entity, PAddr, VAddr, ENTRIES_PER_NODE};

/// Node contents as handed to [`Reassigner::replace_node`].
pub type NodeContents = [Pte; ENTRIES_PER_NODE];

/// How an update rewrites the leaves of its range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModeChange {
    /// Every leaf takes this mode.
    Set(Mode),
    /// Present leaves gain these flags; absent leaves stay absent.
    Insert(Mode),
    /// Leaves stay as they are; only uniform subtrees are folded.
    Keep,
}

impl From<Mode> for ModeChange {
    fn from(mode: Mode) -> Self {
        ModeChange::Set(mode)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LedgerChange {
    Reassign(Entity, AddrRange, LeafAttrs),
    Forget(Entity),
}

/// Ownership changes produced by table writes, not yet visible to readers.
///
/// Changes are absolute, so applying them in recording order after the
/// writes gives the same state as applying each one as it was made.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LedgerDelta {
    changes: Vec<LedgerChange>,
}

impl LedgerDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    fn reassign(&mut self, entity: Entity, range: AddrRange, attrs: LeafAttrs) {
        self.changes.push(LedgerChange::Reassign(entity, range, attrs));
    }

    /// Records that `entity` drops out of the ledger entirely.
    pub fn forget(&mut self, entity: Entity) {
        self.changes.push(LedgerChange::Forget(entity));
    }

    /// Moves every change of `other` behind the changes already recorded.
    pub fn append(&mut self, mut other: LedgerDelta) {
        self.changes.append(&mut other.changes);
    }

    /// Applies every change in recording order.
    pub fn apply(self, state: &mut OwnershipState) {
        for change in self.changes {
            match change {
                LedgerChange::Reassign(entity, range, attrs) => state.reassign(entity, range, attrs),
                LedgerChange::Forget(entity) => state.forget(entity),
            }
        }
    }
}

/// Writes table nodes and records the matching ledger changes.
#[derive(Clone, Copy)]
pub struct Reassigner<'a> {
    arena: &'a NodeArena,
    track_ownership: bool,
    verify_paths: bool,
}

impl<'a> Reassigner<'a> {
    pub fn new(arena: &'a NodeArena, track_ownership: bool, verify_paths: bool) -> Self {
        Self { arena, track_ownership, verify_paths }
    }

    /// Replaces the entries of the node at `location` with `contents`.
    ///
    /// For each entry that changes, the table entity's membership in
    /// `owned_by`/`accessible_by` is set over the entry's span clipped to
    /// `range`, following the new leaf (or the leaves below a new table
    /// pointer), and recorded in `delta`. A node with no path from the root
    /// is detached; only the table's own entity is ever touched either way.
    pub fn replace_node(
        &self,
        table: &PageTable,
        location: NodeLocation,
        contents: &NodeContents,
        range: AddrRange,
        delta: &mut LedgerDelta,
    ) -> Result<(), IsolationError> {
        if self.verify_paths {
            self.check_location(table, location)?;
        }
        let node = self.arena.deref(location.ptr).map_err(invariant_violation)?;
        let stage = table.stage();
        let size = Stage::entry_size(location.level);
        let changed: Vec<usize> = (0..ENTRIES_PER_NODE).filter(|&index| node.load(index) != contents[index]).collect();

        if self.track_ownership {
            for &index in &changed {
                let begin = location.base.raw() + index as u64 * size;
                let Some(span) = AddrRange::new(begin, begin + size).intersect(&range) else {
                    continue;
                };
                match stage.classify(contents[index], location.level) {
                    PteKind::Table(child) => {
                        let child = NodeLocation { ptr: child, base: VAddr::new(begin), level: location.level - 1 };
                        table
                            .walk_node(self.arena, child, span, &mut |leaf, kind| {
                                delta.reassign(table.entity(), leaf, stage.leaf_attrs(kind));
                            })
                            .map_err(invariant_violation)?;
                    }
                    kind => delta.reassign(table.entity(), span, stage.leaf_attrs(kind)),
                }
            }
        }

        for index in changed {
            node.store(index, contents[index]);
        }
        Ok(())
    }

    fn check_location(&self, table: &PageTable, location: NodeLocation) -> Result<(), IsolationError> {
        let paths = index_sequences_to_pointer(self.arena, location.ptr, table.root(), table.stage())
            .map_err(invariant_violation)?;
        match paths.as_slice() {
            [] => Ok(()),
            [path] if table.stage().node_location(location.ptr, path) == location => Ok(()),
            [_] => Err(invariant_violation(Violation::Misplaced(location.ptr))),
            _ => Err(invariant_violation(Violation::AliasedNode {
                ptr: location.ptr,
                entity: table.entity(),
                paths: paths.len(),
            })),
        }
    }

    /// Splits whatever `table` needs so that `range` can take `mode`.
    pub fn prepare<P: FrameAllocator>(
        self,
        table: &PageTable,
        range: AddrRange,
        mode: Mode,
        pool: &mut P,
    ) -> Result<PreparedUpdate<'a>, IsolationError> {
        self.prepare_change(table, range, ModeChange::Set(mode), pool)
    }

    /// Splits whatever `table` needs so that `change` can be applied to `range`.
    ///
    /// On failure every split made so far is undone before returning.
    pub fn prepare_change<P: FrameAllocator>(
        self,
        table: &PageTable,
        range: AddrRange,
        change: ModeChange,
        pool: &mut P,
    ) -> Result<PreparedUpdate<'a>, IsolationError> {
        let change = match change {
            ModeChange::Set(mode) => ModeChange::Set(table.stage().canonical(mode)),
            other => other,
        };
        let mut update =
            PreparedUpdate { reassigner: self, table: *table, range, change, journal: Vec::new(), delta: LedgerDelta::new() };
        let roots: Vec<NodeLocation> = table.root_locations().collect();
        for location in roots {
            if let Err(err) = update.prepare_node(location, pool) {
                log::debug!(target: "pt", "prepare {} for {} failed: {}", range, table.entity(), err);
                update.undo(pool);
                return Err(err);
            }
        }
        Ok(update)
    }

    /// Folds every uniform subtree below `range` back into blocks.
    ///
    /// Never allocates: leaving every leaf as it is needs no split.
    pub fn coalesce<P: FrameAllocator>(
        self,
        table: &PageTable,
        range: AddrRange,
        pool: &mut P,
        delta: &mut LedgerDelta,
    ) -> Result<(), IsolationError> {
        self.prepare_change(table, range, ModeChange::Keep, pool)?.commit(pool, delta)
    }
}

/// A split performed by `prepare`: `parent[index]` used to be `old`.
#[derive(Clone, Copy, Debug)]
struct Split {
    parent: NodeLocation,
    index: usize,
    old: Pte,
    child: TablePtr,
}

/// Range update whose splits are in place but whose leaves are not yet written.
#[must_use = "a prepared update must be committed or rolled back"]
pub struct PreparedUpdate<'a> {
    reassigner: Reassigner<'a>,
    table: PageTable,
    range: AddrRange,
    change: ModeChange,
    journal: Vec<Split>,
    delta: LedgerDelta,
}

impl<'a> PreparedUpdate<'a> {
    /// Nodes allocated by the prepare phase.
    pub fn allocated(&self) -> usize {
        self.journal.len()
    }

    /// Final value of the entry spanning `entry` at `level`, or `None` when
    /// it can only be reached by descending into the current table.
    fn desired(&self, level: u8, entry: AddrRange, current: Pte) -> Option<Pte> {
        let stage = self.table.stage();
        match self.change {
            ModeChange::Set(mode) => Some(stage.leaf_pte(level, PAddr::new(entry.begin.raw()), mode)),
            ModeChange::Insert(flags) => match stage.classify(current, level) {
                PteKind::Table(_) => None,
                PteKind::Absent => Some(Pte::ABSENT),
                kind @ PteKind::Block { pa, .. } => {
                    let mode = stage.leaf_mode(kind).unwrap_or(Mode::ABSENT);
                    Some(stage.leaf_pte(level, pa, mode | flags))
                }
            },
            ModeChange::Keep => match stage.classify(current, level) {
                PteKind::Table(_) => None,
                PteKind::Absent => Some(Pte::ABSENT),
                PteKind::Block { .. } => Some(current),
            },
        }
    }

    /// Whether `entry` takes its final value without descending into it.
    fn settles(&self, level: u8, entry: AddrRange, current: Pte, desired: Pte) -> bool {
        let representable = Stage::is_block_allowed(level) || desired == Pte::ABSENT;
        representable && (self.range.covers(&entry) || current == desired)
    }

    fn settled(&self, level: u8, entry: AddrRange, current: Pte) -> Option<Pte> {
        self.desired(level, entry, current).filter(|desired| self.settles(level, entry, current, *desired))
    }

    fn prepare_node<P: FrameAllocator>(&mut self, location: NodeLocation, pool: &mut P) -> Result<(), IsolationError> {
        let arena = self.reassigner.arena;
        let stage = *self.table.stage();
        let node = arena.deref(location.ptr).map_err(invariant_violation)?;
        for (index, entry) in entries_overlapping(location, self.range) {
            let current = node.load(index);
            if self.settled(location.level, entry, current).is_some() {
                continue;
            }
            let child = match stage.classify(current, location.level) {
                PteKind::Table(child) => child,
                kind => self.split(location, index, entry, kind, current, pool)?,
            };
            let child = NodeLocation { ptr: child, base: entry.begin, level: location.level - 1 };
            self.prepare_node(child, pool)?;
        }
        Ok(())
    }

    /// Replaces the leaf at `parent[index]` by a table translating exactly
    /// the same way.
    fn split<P: FrameAllocator>(
        &mut self,
        parent: NodeLocation,
        index: usize,
        entry: AddrRange,
        kind: PteKind,
        old: Pte,
        pool: &mut P,
    ) -> Result<TablePtr, IsolationError> {
        let level = parent.level - 1;
        let child = pool.allocate().ok_or(IsolationError::PoolExhausted)?;
        let mut fill = [Pte::ABSENT; ENTRIES_PER_NODE];
        if let PteKind::Block { pa, attrs } = kind {
            let size = Stage::entry_size(level);
            for (j, slot) in fill.iter_mut().enumerate() {
                *slot = Stage::block_pte(level, PAddr::new(pa.raw() + j as u64 * size), attrs);
            }
        }
        let child_location = NodeLocation { ptr: child, base: entry.begin, level };
        let reassigner = self.reassigner;
        let (table, range) = (self.table, self.range);
        let delta = &mut self.delta;
        let linked = reassigner.replace_node(&table, child_location, &fill, range, delta).and_then(|()| {
            let mut contents = reassigner.arena.deref(parent.ptr).map_err(invariant_violation)?.snapshot();
            contents[index] = Stage::table_pte(child);
            reassigner.replace_node(&table, parent, &contents, range, delta)
        });
        if let Err(err) = linked {
            pool.free(child);
            return Err(err);
        }
        self.journal.push(Split { parent, index, old, child });
        Ok(child)
    }

    fn undo<P: FrameAllocator>(&mut self, pool: &mut P) {
        while let Some(split) = self.journal.pop() {
            let restored = self.reassigner.arena.deref(split.parent.ptr).map(|node| {
                let mut contents = node.snapshot();
                contents[split.index] = split.old;
                contents
            });
            match restored {
                Ok(contents) => {
                    let replaced =
                        self.reassigner.replace_node(&self.table, split.parent, &contents, self.range, &mut self.delta);
                    if let Err(err) = replaced {
                        log::error!(target: "pt", "rollback of split at {:?} failed: {}", split.parent.ptr, err);
                    }
                }
                Err(violation) => {
                    log::error!(target: "pt", "rollback of split at {:?} failed: {}", split.parent.ptr, violation);
                }
            }
            pool.free(split.child);
        }
    }

    /// Undoes every split made by `prepare`. The ledger changes recorded so
    /// far cancel out and are dropped.
    pub fn rollback<P: FrameAllocator>(mut self, pool: &mut P) {
        self.undo(pool);
    }

    /// Writes the leaves, coalesces and frees the nodes that were unlinked.
    pub fn commit<P: FrameAllocator>(self, pool: &mut P, delta: &mut LedgerDelta) -> Result<(), IsolationError> {
        self.finish(pool, delta, true)
    }

    /// Writes the leaves and frees replaced subtrees, leaving every split in
    /// place. Follow with [`Reassigner::coalesce`] once all prepared updates
    /// of the same operation are committed.
    pub fn commit_unmerged<P: FrameAllocator>(self, pool: &mut P, delta: &mut LedgerDelta) -> Result<(), IsolationError> {
        self.finish(pool, delta, false)
    }

    fn finish<P: FrameAllocator>(
        mut self,
        pool: &mut P,
        delta: &mut LedgerDelta,
        merge: bool,
    ) -> Result<(), IsolationError> {
        delta.append(core::mem::take(&mut self.delta));
        let mut retired = Vec::new();
        let roots: Vec<NodeLocation> = self.table.root_locations().collect();
        for location in roots {
            self.commit_node(location, merge, &mut retired, delta)?;
        }
        let arena = self.reassigner.arena;
        let mut nodes = Vec::new();
        for (ptr, level) in retired {
            collect_subtree(arena, self.table.stage(), ptr, level, &mut nodes).map_err(invariant_violation)?;
        }
        if !nodes.is_empty() {
            log::trace!(target: "pt", "{} retires {} nodes", self.table.entity(), nodes.len());
        }
        for (ptr, _) in nodes {
            pool.free(ptr);
        }
        Ok(())
    }

    fn commit_node(
        &self,
        location: NodeLocation,
        merge: bool,
        retired: &mut Vec<(TablePtr, u8)>,
        delta: &mut LedgerDelta,
    ) -> Result<(), IsolationError> {
        let arena = self.reassigner.arena;
        let stage = self.table.stage();
        let node = arena.deref(location.ptr).map_err(invariant_violation)?;
        let mut contents = node.snapshot();
        let mut changed = false;
        for (index, entry) in entries_overlapping(location, self.range) {
            let current = contents[index];
            let kind = stage.classify(current, location.level);
            if let Some(desired) = self.settled(location.level, entry, current) {
                if current != desired {
                    if let PteKind::Table(child) = kind {
                        retired.push((child, location.level - 1));
                    }
                    contents[index] = desired;
                    changed = true;
                }
                continue;
            }
            let PteKind::Table(child) = kind else {
                return Err(invariant_violation(Violation::UnsplitEntry(entry)));
            };
            let child_location = NodeLocation { ptr: child, base: entry.begin, level: location.level - 1 };
            self.commit_node(child_location, merge, retired, delta)?;
            if !merge {
                continue;
            }
            if let Some(merged) = self.try_merge(child_location)? {
                retired.push((child, child_location.level));
                contents[index] = merged;
                changed = true;
            }
        }
        if changed {
            self.reassigner.replace_node(&self.table, location, &contents, self.range, delta)?;
        }
        Ok(())
    }

    /// Single entry equivalent to the node at `location`, if there is one.
    fn try_merge(&self, location: NodeLocation) -> Result<Option<Pte>, IsolationError> {
        let stage = self.table.stage();
        let entries = self.reassigner.arena.deref(location.ptr).map_err(invariant_violation)?.snapshot();
        let kinds = entries.map(|pte| stage.classify(pte, location.level));
        if kinds.iter().all(|kind| *kind == PteKind::Absent) {
            return Ok(Some(Pte::ABSENT));
        }
        let parent_level = location.level + 1;
        if !Stage::is_block_allowed(parent_level) {
            return Ok(None);
        }
        let PteKind::Block { pa, attrs } = kinds[0] else {
            return Ok(None);
        };
        if pa.raw() % Stage::entry_size(parent_level) != 0 {
            return Ok(None);
        }
        let size = Stage::entry_size(location.level);
        let contiguous = kinds.iter().enumerate().all(|(j, kind)| {
            *kind == PteKind::Block { pa: PAddr::new(pa.raw() + j as u64 * size), attrs }
        });
        Ok(contiguous.then(|| Stage::block_pte(parent_level, pa, attrs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MmConfig;
    use crate::pool::FramePool;
    use crate::types::{Entity, EntitySet};
    use crate::verify;
    use alloc::sync::Arc;

    struct Fixture {
        arena: Arc<NodeArena>,
        pool: FramePool,
        ledger: OwnershipState,
        table: PageTable,
    }

    impl Fixture {
        fn new() -> Self {
            let config = MmConfig::default();
            let arena = Arc::new(NodeArena::new(config.table_base, 64));
            let mut pool = FramePool::new(arena.clone());
            let table = PageTable::new(Stage::stage2(&config), Entity::vm(0), &mut pool).expect("root");
            Self { arena, pool, ledger: OwnershipState::new(), table }
        }

        fn reassigner(&self) -> Reassigner<'_> {
            Reassigner::new(&self.arena, true, true)
        }

        fn change(&mut self, range: AddrRange, change: ModeChange) -> Result<(), IsolationError> {
            let reassigner = Reassigner::new(&self.arena, true, true);
            let mut delta = LedgerDelta::new();
            let update = reassigner.prepare_change(&self.table, range, change, &mut self.pool)?;
            update.commit(&mut self.pool, &mut delta)?;
            delta.apply(&mut self.ledger);
            Ok(())
        }

        fn apply(&mut self, range: AddrRange, mode: Mode) -> Result<(), IsolationError> {
            self.change(range, ModeChange::Set(mode))
        }

        fn level_at(&self, addr: u64) -> Option<u8> {
            self.table.lookup(&self.arena, VAddr::new(addr)).expect("walk").map(|hit| hit.level)
        }

        fn mode_at(&self, addr: u64) -> Option<Mode> {
            self.table.lookup(&self.arena, VAddr::new(addr)).expect("walk").map(|hit| hit.mode)
        }

        fn assert_ledger_matches_table(&self) {
            let rebuilt = verify::recompute(&self.arena, &[self.table]).expect("recompute");
            assert_eq!(rebuilt.first_difference(&self.ledger), None);
        }
    }

    const RW: Mode = Mode::R.union(Mode::W);

    #[test]
    fn aligned_range_becomes_one_block() {
        let mut fx = Fixture::new();
        fx.apply(AddrRange::new(0x20_0000, 0x40_0000), RW).expect("map");
        assert_eq!(fx.level_at(0x20_0000), Some(1));
        assert_eq!(fx.level_at(0x3f_f000), Some(1));
        assert_eq!(fx.level_at(0x40_0000), None);
        assert_eq!(fx.ledger.owned_by(PAddr::new(0x30_0000)), EntitySet::of(Entity::vm(0)));
    }

    #[test]
    fn split_and_coalesce_keep_translations() {
        let mut fx = Fixture::new();
        let free_initially = fx.pool.free_count();
        fx.apply(AddrRange::new(0x20_0000, 0x40_0000), RW).expect("map");
        let free_with_block = fx.pool.free_count();

        fx.apply(AddrRange::new(0x20_1000, 0x20_2000), Mode::R).expect("split");
        assert_eq!(fx.level_at(0x20_0000), Some(0));
        let hit = fx.table.lookup(&fx.arena, VAddr::new(0x30_0000)).expect("walk").expect("mapped");
        assert_eq!((hit.pa, hit.mode), (PAddr::new(0x30_0000), RW));
        assert_eq!(fx.mode_at(0x20_1800), Some(Mode::R));
        assert_eq!(fx.pool.free_count(), free_with_block - 1);

        fx.apply(AddrRange::new(0x20_1000, 0x20_2000), RW).expect("coalesce");
        assert_eq!(fx.level_at(0x20_1000), Some(1));
        assert_eq!(fx.pool.free_count(), free_with_block);

        fx.apply(AddrRange::new(0x20_0000, 0x40_0000), Mode::ABSENT).expect("unmap");
        assert_eq!(fx.level_at(0x20_0000), None);
        assert_eq!(fx.pool.free_count(), free_initially);
        assert!(fx.ledger.owned_by(PAddr::new(0x20_0000)).is_empty());
    }

    #[test]
    fn empty_range_changes_nothing() {
        let mut fx = Fixture::new();
        fx.apply(AddrRange::new(0x1000, 0x3000), RW).expect("map");
        let before = fx.ledger.clone();
        let free = fx.pool.free_count();
        fx.apply(AddrRange::new(0x2000, 0x2000), Mode::ABSENT).expect("noop");
        assert_eq!(fx.ledger, before);
        assert_eq!(fx.pool.free_count(), free);
    }

    #[test]
    fn insert_marks_present_leaves_only() {
        let mut fx = Fixture::new();
        fx.apply(AddrRange::new(0x20_0000, 0x40_0000), RW).expect("map");
        let free = fx.pool.free_count();

        fx.change(AddrRange::new(0x3f_f000, 0x40_2000), ModeChange::Insert(Mode::SHARED)).expect("insert");
        assert_eq!(fx.mode_at(0x3f_f000), Some(RW | Mode::SHARED));
        assert_eq!(fx.mode_at(0x3f_e000), Some(RW));
        assert_eq!(fx.mode_at(0x40_0000), None);
        assert_eq!(fx.mode_at(0x40_1000), None);
        // The block was split once; the empty neighbour never got a node.
        assert_eq!(fx.pool.free_count(), free - 1);
        assert_eq!(fx.ledger.owned_by(PAddr::new(0x3f_f000)), EntitySet::of(Entity::vm(0)));
        fx.assert_ledger_matches_table();
    }

    #[cfg(feature = "failpoints")]
    #[test]
    fn keep_folds_without_allocating() {
        let mut fx = Fixture::new();
        fx.apply(AddrRange::new(0x20_0000, 0x40_0000), RW).expect("map");
        let free_with_block = fx.pool.free_count();
        let reassigner = Reassigner::new(&fx.arena, true, true);
        let range = AddrRange::new(0x20_1000, 0x20_2000);
        let mut delta = LedgerDelta::new();
        let update = reassigner.prepare(&fx.table, range, Mode::R, &mut fx.pool).expect("prepare");
        update.commit_unmerged(&mut fx.pool, &mut delta).expect("commit");
        delta.apply(&mut fx.ledger);
        assert_eq!(fx.pool.free_count(), free_with_block - 1);

        let mut delta = LedgerDelta::new();
        let update = reassigner.prepare(&fx.table, range, RW, &mut fx.pool).expect("prepare");
        assert_eq!(update.allocated(), 0);
        update.commit_unmerged(&mut fx.pool, &mut delta).expect("restore");
        assert_eq!(fx.level_at(0x20_1000), Some(0));

        fx.pool.set_alloc_budget(Some(0));
        reassigner.coalesce(&fx.table, range, &mut fx.pool, &mut delta).expect("coalesce");
        fx.pool.set_alloc_budget(None);
        delta.apply(&mut fx.ledger);
        assert_eq!(fx.level_at(0x20_1000), Some(1));
        assert_eq!(fx.pool.free_count(), free_with_block);
        fx.assert_ledger_matches_table();
    }

    #[test]
    fn prepared_updates_on_one_node_commit_together() {
        let mut fx = Fixture::new();
        fx.apply(AddrRange::new(0x20_0000, 0x40_0000), RW).expect("map");
        let free_with_block = fx.pool.free_count();
        let (low, high) = (AddrRange::new(0x20_1000, 0x20_2000), AddrRange::new(0x20_3000, 0x20_4000));
        fx.apply(low, Mode::R).expect("split");
        let reassigner = Reassigner::new(&fx.arena, true, true);

        // Restoring `low` alone would fold the node back into a block that
        // the second update, prepared against the node, no longer finds.
        let first = reassigner.prepare(&fx.table, low, RW, &mut fx.pool).expect("first");
        let second = reassigner.prepare(&fx.table, high, Mode::R, &mut fx.pool).expect("second");
        assert_eq!((first.allocated(), second.allocated()), (0, 0));

        let mut delta = LedgerDelta::new();
        first.commit_unmerged(&mut fx.pool, &mut delta).expect("first");
        second.commit_unmerged(&mut fx.pool, &mut delta).expect("second");
        for range in [low, high] {
            reassigner.coalesce(&fx.table, range, &mut fx.pool, &mut delta).expect("coalesce");
        }
        delta.apply(&mut fx.ledger);

        assert_eq!(fx.mode_at(0x20_1000), Some(RW));
        assert_eq!(fx.mode_at(0x20_3000), Some(Mode::R));
        assert_eq!(fx.level_at(0x20_3000), Some(0));
        assert_eq!(fx.pool.free_count(), free_with_block - 1);
        fx.assert_ledger_matches_table();

        fx.apply(high, RW).expect("restore");
        assert_eq!(fx.level_at(0x20_3000), Some(1));
        assert_eq!(fx.pool.free_count(), free_with_block);
    }

    #[test]
    fn replace_node_clips_ledger_to_range() {
        let fx = Fixture::new();
        let stage = *fx.table.stage();
        let root = fx.table.root_locations().next().expect("root");
        let mut contents = [Pte::ABSENT; ENTRIES_PER_NODE];
        contents[0] = stage.leaf_pte(root.level, PAddr::new(0), RW);
        let mut delta = LedgerDelta::new();
        fx.reassigner()
            .replace_node(&fx.table, root, &contents, AddrRange::new(0x1000, 0x2000), &mut delta)
            .expect("replace");
        assert_eq!(delta.len(), 1);
        let mut ledger = OwnershipState::new();
        delta.apply(&mut ledger);
        assert!(ledger.owned_by(PAddr::new(0)).is_empty());
        assert_eq!(ledger.owned_by(PAddr::new(0x1000)), EntitySet::of(Entity::vm(0)));
        assert!(ledger.owned_by(PAddr::new(0x2000)).is_empty());
    }

    #[test]
    fn untracked_reassigner_records_nothing() {
        let fx = Fixture::new();
        let stage = *fx.table.stage();
        let root = fx.table.root_locations().next().expect("root");
        let mut contents = [Pte::ABSENT; ENTRIES_PER_NODE];
        contents[0] = stage.leaf_pte(root.level, PAddr::new(0), RW);
        let mut delta = LedgerDelta::new();
        Reassigner::new(&fx.arena, false, true)
            .replace_node(&fx.table, root, &contents, AddrRange::new(0, 0x1000), &mut delta)
            .expect("replace");
        assert!(delta.is_empty());
        assert_eq!(fx.mode_at(0), Some(RW));
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "invariant violation"))]
    fn replace_node_rejects_wrong_location() {
        let fx = Fixture::new();
        let mut root = fx.table.root_locations().next().expect("root");
        root.base = VAddr::new(Stage::node_span(root.level));
        let mut delta = LedgerDelta::new();
        let result =
            fx.reassigner().replace_node(&fx.table, root, &[Pte::ABSENT; ENTRIES_PER_NODE], AddrRange::new(0, 0), &mut delta);
        assert_eq!(result, Err(IsolationError::InvariantViolation(Violation::Misplaced(root.ptr))));
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "invariant violation"))]
    fn replace_node_rejects_node_linked_twice() {
        let mut fx = Fixture::new();
        let child = fx.pool.allocate().expect("frame");
        let root = fx.table.root_locations().next().expect("root");
        let node = fx.arena.deref(root.ptr).expect("root");
        node.store(0, Stage::table_pte(child));
        node.store(1, Stage::table_pte(child));
        let location = NodeLocation { ptr: child, base: VAddr::new(0), level: root.level - 1 };
        let mut delta = LedgerDelta::new();
        let result = fx.reassigner().replace_node(
            &fx.table,
            location,
            &[Pte::ABSENT; ENTRIES_PER_NODE],
            AddrRange::new(0, 0x1000),
            &mut delta,
        );
        let aliased = Violation::AliasedNode { ptr: child, entity: Entity::vm(0), paths: 2 };
        assert_eq!(result, Err(IsolationError::InvariantViolation(aliased)));
        assert!(delta.is_empty());
    }

    #[cfg(feature = "failpoints")]
    #[test]
    fn failed_prepare_restores_table_and_pool() {
        let mut fx = Fixture::new();
        fx.apply(AddrRange::new(0x20_0000, 0x40_0000), RW).expect("map");
        let free = fx.pool.free_count();
        let ledger = fx.ledger.clone();
        let root_entries = fx.arena.deref(fx.table.root()).expect("root").snapshot();

        // Needs a level-1 and a level-0 node; only one is granted.
        fx.pool.set_alloc_budget(Some(1));
        let err = fx.apply(AddrRange::new(0x4000_1000, 0x4000_2000), RW);
        fx.pool.set_alloc_budget(None);

        assert_eq!(err, Err(IsolationError::PoolExhausted));
        assert_eq!(fx.pool.free_count(), free);
        assert_eq!(fx.ledger, ledger);
        assert!(fx.arena.deref(fx.table.root()).expect("root").snapshot() == root_entries);
        assert_eq!(fx.level_at(0x20_0000), Some(1));
    }

    #[test]
    fn rollback_undoes_prepared_splits() {
        let mut fx = Fixture::new();
        fx.apply(AddrRange::new(0x20_0000, 0x40_0000), RW).expect("map");
        let free = fx.pool.free_count();
        let reassigner = Reassigner::new(&fx.arena, true, true);
        let update = reassigner
            .prepare(&fx.table, AddrRange::new(0x20_1000, 0x20_2000), Mode::R, &mut fx.pool)
            .expect("prepare");
        assert_eq!(update.allocated(), 1);
        assert_eq!(fx.level_at(0x20_1000), Some(0));
        update.rollback(&mut fx.pool);
        assert_eq!(fx.level_at(0x20_1000), Some(1));
        assert_eq!(fx.pool.free_count(), free);
        assert_eq!(fx.ledger.accessible_by(PAddr::new(0x20_1000)), EntitySet::of(Entity::vm(0)));
        fx.assert_ledger_matches_table();
    }
}
