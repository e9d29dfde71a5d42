// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: External interface of the isolation core
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MemoryManager (create_vm/destroy_vm, identity_map/unmap, share/reclaim,
//!             validate_and_map, lookup/snapshot_lookup/get_mode, owned_by/accessible_by,
//!             free_frames, verify), ShareMode
//! DEPENDS_ON: reassign, verify, pool, model, mm::*
//! INVARIANTS: Locks are taken registry -> hypervisor -> VMs by id -> pool -> ledger;
//!             every precondition is checked before the first table edit;
//!             a failed operation leaves tables, ledger and pool as they were;
//!             the ledger changes of one operation are published in one step
//!             while its table locks are still held

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, MutexGuard, RwLock, RwLockReadGuard};

use crate::config::MmConfig;
use crate::error::{invariant_violation, IsolationError, Violation};
use crate::mm::node::NodeArena;
use crate::mm::page_table::{PageTable, Translation};
use crate::mm::pte::{Mode, PteKind};
use crate::mm::stage::Stage;
use crate::model::OwnershipState;
use crate::pool::{FrameAllocator, FramePool, LocalPool};
use crate::reassign::{LedgerDelta, ModeChange, Reassigner};
use crate::types::{AddrRange, Entity, EntitySet, PAddr, VAddr, VmId};
use crate::verify;

/// How `share` moves memory from sender to recipient.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShareMode {
    /// Ownership and access move to the recipient.
    Give,
    /// The recipient gains exclusive access; the sender keeps ownership.
    Lend,
    /// Both keep access; the sender keeps ownership.
    Share,
}

impl ShareMode {
    /// Modes the sender and the recipient end up with, given the sender's
    /// current (owned, valid, unshared) mode.
    fn split(self, orig: Mode) -> (Mode, Mode) {
        let access = orig & Mode::RWX;
        match self {
            ShareMode::Give => (Mode::ABSENT, orig),
            ShareMode::Lend => (orig | Mode::INVALID, access | Mode::UNOWNED),
            ShareMode::Share => (orig | Mode::SHARED, access | Mode::UNOWNED | Mode::SHARED),
        }
    }
}

/// One root table and the lock serialising writes to the nodes below it.
///
/// The table handle itself never changes, so lock-free readers can copy it.
struct RootTable {
    table: PageTable,
    lock: Mutex<()>,
}

impl RootTable {
    fn new(table: PageTable) -> Self {
        Self { table, lock: Mutex::new(()) }
    }

    fn lock(&self) -> LockedTable<'_> {
        LockedTable { table: self.table, _guard: self.lock.lock() }
    }
}

/// A table whose lock is held.
struct LockedTable<'a> {
    table: PageTable,
    _guard: MutexGuard<'a, ()>,
}

type Registry = BTreeMap<VmId, RootTable>;

/// Owner of every page table, the frame pool and the ownership ledger.
pub struct MemoryManager {
    config: MmConfig,
    stage2: Stage,
    arena: Arc<NodeArena>,
    pool: Mutex<FramePool>,
    ledger: Option<Mutex<OwnershipState>>,
    hypervisor: RootTable,
    vms: RwLock<Registry>,
}

impl MemoryManager {
    /// Builds the node arena and pool and allocates the hypervisor's stage-1 root.
    pub fn new(config: MmConfig) -> Result<Self, IsolationError> {
        config.validate()?;
        let arena = Arc::new(NodeArena::new(config.table_base, config.node_frames));
        let mut pool = FramePool::new(arena.clone());
        let hypervisor = PageTable::new(Stage::stage1(&config), Entity::Hypervisor, &mut pool)?;
        log::info!(
            target: "mm",
            "isolation core up: {} PA bits, {} node frames at {:#x}",
            config.pa_bits,
            config.node_frames,
            config.table_base.raw()
        );
        Ok(Self {
            stage2: Stage::stage2(&config),
            ledger: config.track_ownership.then(|| Mutex::new(OwnershipState::new())),
            config,
            arena,
            pool: Mutex::new(pool),
            hypervisor: RootTable::new(hypervisor),
            vms: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn config(&self) -> &MmConfig {
        &self.config
    }

    // --- registry -------------------------------------------------------

    /// Registers a VM with an empty stage-2 table.
    pub fn create_vm(&self, id: VmId) -> Result<(), IsolationError> {
        if !id.is_valid() {
            return Err(IsolationError::InvalidVmId(id));
        }
        let mut vms = self.vms.write();
        if vms.contains_key(&id) {
            return Err(IsolationError::VmExists(id));
        }
        let table = PageTable::new(self.stage2, Entity::Vm(id), &mut self.pool.lock())?;
        vms.insert(id, RootTable::new(table));
        log::debug!(target: "mm", "created vm{}", id.as_raw());
        Ok(())
    }

    /// Unregisters a VM, returns all of its nodes to the pool and drops it
    /// from the ledger.
    ///
    /// Hypervisor mappings of memory the VM still owns are removed first; if
    /// that fails the VM stays registered and nothing changes.
    pub fn destroy_vm(&self, id: VmId) -> Result<(), IsolationError> {
        let mut vms = self.vms.write();
        let root = vms.get(&id).ok_or(IsolationError::UnknownVm(id))?;
        let (nodes, revoked) = {
            let hyp = self.hypervisor.lock();
            let locked = root.lock();
            let nodes = locked.table.collect_nodes(&self.arena).map_err(invariant_violation)?;
            let revoked = self.borrowed_runs(&hyp.table, &locked.table)?;
            let updates: Vec<_> =
                revoked.iter().map(|run| (&hyp.table, *run, ModeChange::Set(Mode::ABSENT))).collect();
            let mut forget = LedgerDelta::new();
            forget.forget(Entity::Vm(id));
            self.apply_updates(&updates, forget)?;
            (nodes, revoked.len())
        };
        vms.remove(&id);
        {
            let mut pool = self.pool.lock();
            for (ptr, _) in &nodes {
                pool.free(*ptr);
            }
        }
        drop(vms);
        log::debug!(
            target: "mm",
            "destroyed vm{}, {} nodes returned, {} hypervisor mappings revoked",
            id.as_raw(),
            nodes.len(),
            revoked
        );
        self.after_update();
        Ok(())
    }

    /// Runs the hypervisor maps without owning them inside memory `guest` owns.
    fn borrowed_runs(&self, hyp: &PageTable, guest: &PageTable) -> Result<Vec<AddrRange>, IsolationError> {
        let mut borrowed = Vec::new();
        for owned in self.runs_where(guest, guest.stage().span(), Mode::is_owned)? {
            borrowed.extend(self.runs_where(hyp, owned, |mode| mode.is_valid() && !mode.is_owned())?);
        }
        Ok(borrowed)
    }

    /// Maximal runs of `range` whose leaves in `table` satisfy `keep`.
    fn runs_where(
        &self,
        table: &PageTable,
        range: AddrRange,
        keep: impl Fn(Mode) -> bool,
    ) -> Result<Vec<AddrRange>, IsolationError> {
        let stage = *table.stage();
        let mut runs: Vec<AddrRange> = Vec::new();
        table
            .walk_leaves(&self.arena, range, &mut |leaf, kind| {
                if !keep(stage.leaf_mode(kind).unwrap_or(Mode::ABSENT)) {
                    return;
                }
                match runs.last_mut() {
                    Some(last) if last.end == leaf.begin => last.end = leaf.end,
                    _ => runs.push(leaf),
                }
            })
            .map_err(invariant_violation)?;
        Ok(runs)
    }

    /// Registered VMs in id order.
    pub fn vms(&self) -> Vec<VmId> {
        self.vms.read().keys().copied().collect()
    }

    fn root<'r>(&'r self, vms: &'r Registry, entity: Entity) -> Result<&'r RootTable, IsolationError> {
        match entity {
            Entity::Hypervisor => Ok(&self.hypervisor),
            Entity::Vm(id) if !id.is_valid() => Err(IsolationError::InvalidVmId(id)),
            Entity::Vm(id) => vms.get(&id).ok_or(IsolationError::UnknownVm(id)),
        }
    }

    /// Locks the tables of two distinct entities in global order and returns
    /// them in argument order.
    fn lock_two<'r>(
        &'r self,
        vms: &'r Registry,
        a: Entity,
        b: Entity,
    ) -> Result<(LockedTable<'r>, LockedTable<'r>), IsolationError> {
        let (first, second) = (self.root(vms, a)?, self.root(vms, b)?);
        if a < b {
            let first = first.lock();
            Ok((first, second.lock()))
        } else {
            let second = second.lock();
            Ok((first.lock(), second))
        }
    }

    fn reassigner(&self) -> Reassigner<'_> {
        Reassigner::new(&self.arena, self.ledger.is_some(), self.config.verify_updates)
    }

    /// Validates `range`; `Ok(false)` means there is nothing to do.
    fn check_range(&self, range: AddrRange) -> Result<bool, IsolationError> {
        if range.is_empty() {
            return Ok(false);
        }
        if !range.is_page_aligned() {
            return Err(IsolationError::RangeMisaligned(range));
        }
        if range.end.raw() > self.config.address_limit() {
            return Err(IsolationError::OutOfRange(range));
        }
        Ok(true)
    }

    fn after_update(&self) {
        if !self.config.verify_updates {
            return;
        }
        if let Err(err) = self.verify() {
            log::error!(target: "pt", "representation check failed after update: {}", err);
            debug_assert!(false, "representation check failed: {err}");
        }
    }

    fn mode_of(&self, table: &PageTable, range: AddrRange) -> Result<Option<Mode>, IsolationError> {
        table.get_mode(&self.arena, range).map_err(invariant_violation)
    }

    fn leaves_of(&self, table: &PageTable, range: AddrRange) -> Result<Vec<Mode>, IsolationError> {
        let stage = *table.stage();
        let mut modes = Vec::new();
        table
            .walk_leaves(&self.arena, range, &mut |_, kind| modes.push(stage.leaf_mode(kind).unwrap_or(Mode::ABSENT)))
            .map_err(invariant_violation)?;
        Ok(modes)
    }

    // --- mapping --------------------------------------------------------

    /// Sets `entity`'s identity mappings over `range` to `mode`.
    pub fn identity_map(&self, entity: Entity, range: AddrRange, mode: Mode) -> Result<(), IsolationError> {
        if !self.check_range(range)? {
            return Ok(());
        }
        {
            let vms = self.vms.read();
            let locked = self.root(&vms, entity)?.lock();
            self.apply_updates(&[(&locked.table, range, ModeChange::Set(mode))], LedgerDelta::new())?;
        }
        log::debug!(target: "mm", "{} maps {} as {:?}", entity, range, mode);
        self.after_update();
        Ok(())
    }

    /// Removes `entity`'s mappings over `range`.
    pub fn unmap(&self, entity: Entity, range: AddrRange) -> Result<(), IsolationError> {
        self.identity_map(entity, range, Mode::ABSENT)
    }

    /// Makes the ledger changes in `delta` visible in one step.
    fn publish(&self, delta: LedgerDelta) {
        if let Some(ledger) = &self.ledger {
            if !delta.is_empty() {
                delta.apply(&mut ledger.lock());
            }
        }
    }

    /// Applies every update as one operation. The caller holds the locks of
    /// every table involved.
    ///
    /// All updates are prepared before any is committed, so running out of
    /// frames changes nothing. `extra` is published together with the
    /// updates' own ledger changes, and only on success.
    fn apply_updates(
        &self,
        updates: &[(&PageTable, AddrRange, ModeChange)],
        extra: LedgerDelta,
    ) -> Result<(), IsolationError> {
        let reassigner = self.reassigner();
        let mut pool = LocalPool::new(&self.pool, &self.arena);
        let mut prepared = Vec::with_capacity(updates.len());
        for &(table, range, change) in updates {
            match reassigner.prepare_change(table, range, change, &mut pool) {
                Ok(update) => prepared.push(update),
                Err(err) => {
                    while let Some(update) = prepared.pop() {
                        update.rollback(&mut pool);
                    }
                    return Err(err);
                }
            }
        }
        let mut delta = LedgerDelta::new();
        let written = || -> Result<(), IsolationError> {
            for update in prepared {
                update.commit_unmerged(&mut pool, &mut delta)?;
            }
            for &(table, range, _) in updates {
                reassigner.coalesce(table, range, &mut pool, &mut delta)?;
            }
            Ok(())
        };
        let result = written();
        if result.is_ok() {
            delta.append(extra);
        }
        self.publish(delta);
        result
    }

    /// Moves memory owned by `from` to `to` according to `how`.
    pub fn share(&self, from: Entity, to: Entity, range: AddrRange, how: ShareMode) -> Result<(), IsolationError> {
        if from == to {
            return Err(IsolationError::SameEntity(from));
        }
        if !self.check_range(range)? {
            return Ok(());
        }
        {
            let vms = self.vms.read();
            let (sender, recipient) = self.lock_two(&vms, from, to)?;
            let orig = self.mode_of(&sender.table, range)?.ok_or(IsolationError::NotUniform(from))?;
            if !orig.is_owned() {
                return Err(IsolationError::NotOwned(from));
            }
            if !orig.is_valid() {
                return Err(IsolationError::NotAccessible(from));
            }
            if orig.contains(Mode::SHARED) {
                return Err(IsolationError::AlreadyShared(from));
            }
            if orig.contains(Mode::D) {
                return Err(IsolationError::DeviceMemory);
            }
            if self.mode_of(&recipient.table, range)? != Some(Mode::ABSENT) {
                return Err(IsolationError::AlreadyMapped(to));
            }
            let (sender_mode, recipient_mode) = how.split(orig);
            let updates = [
                (&sender.table, range, ModeChange::Set(sender_mode)),
                (&recipient.table, range, ModeChange::Set(recipient_mode)),
            ];
            self.apply_updates(&updates, LedgerDelta::new())?;
        }
        log::debug!(target: "mm", "{:?} {} from {} to {}", how, range, from, to);
        self.after_update();
        Ok(())
    }

    /// Ends a lend or share: `borrower` loses access and `owner` regains
    /// exclusive access.
    pub fn reclaim(&self, owner: Entity, borrower: Entity, range: AddrRange) -> Result<(), IsolationError> {
        if owner == borrower {
            return Err(IsolationError::SameEntity(owner));
        }
        if !self.check_range(range)? {
            return Ok(());
        }
        {
            let vms = self.vms.read();
            let (owned, borrowed) = self.lock_two(&vms, owner, borrower)?;
            let orig = self.mode_of(&owned.table, range)?.ok_or(IsolationError::NotUniform(owner))?;
            if !orig.is_owned() {
                return Err(IsolationError::NotOwned(owner));
            }
            let lent = self.mode_of(&borrowed.table, range)?.ok_or(IsolationError::NotUniform(borrower))?;
            if lent.is_owned() || !lent.is_valid() {
                return Err(IsolationError::NotAccessible(borrower));
            }
            let restored = orig - (Mode::INVALID | Mode::SHARED);
            let updates = [
                (&owned.table, range, ModeChange::Set(restored)),
                (&borrowed.table, range, ModeChange::Set(Mode::ABSENT)),
            ];
            self.apply_updates(&updates, LedgerDelta::new())?;
        }
        log::debug!(target: "mm", "{} reclaims {} from {}", owner, range, borrower);
        self.after_update();
        Ok(())
    }

    /// Maps memory owned by `vm` into the hypervisor's stage-1 so the
    /// hypervisor can access it with `permissions` on the VM's behalf.
    ///
    /// The VM's leaves over `range` are marked shared in the same step, so
    /// the VM cannot give or lend the memory away until it reclaims it from
    /// the hypervisor.
    pub fn validate_and_map(&self, vm: VmId, range: AddrRange, permissions: Mode) -> Result<(), IsolationError> {
        let guest = Entity::Vm(vm);
        if !self.check_range(range)? {
            return Ok(());
        }
        let wanted = permissions & Mode::RWX;
        {
            let vms = self.vms.read();
            let (hyp, locked) = self.lock_two(&vms, Entity::Hypervisor, guest)?;
            let modes = self.leaves_of(&locked.table, range)?;
            if modes.iter().any(|mode| !mode.is_owned()) {
                return Err(IsolationError::NotOwned(guest));
            }
            if modes.iter().any(|mode| !mode.is_valid() || !mode.contains(wanted)) {
                return Err(IsolationError::NotAccessible(guest));
            }
            if self.leaves_of(&hyp.table, range)?.iter().any(|mode| mode.is_owned()) {
                return Err(IsolationError::AlreadyMapped(Entity::Hypervisor));
            }
            let updates = [
                (&hyp.table, range, ModeChange::Set(wanted | Mode::UNOWNED | Mode::SHARED)),
                (&locked.table, range, ModeChange::Insert(Mode::SHARED)),
            ];
            self.apply_updates(&updates, LedgerDelta::new())?;
        }
        log::debug!(target: "mm", "hypervisor maps {} of vm{} as {:?}", range, vm.as_raw(), wanted);
        self.after_update();
        Ok(())
    }

    // --- queries --------------------------------------------------------

    /// Translation of `addr` in `entity`'s table.
    pub fn lookup(&self, entity: Entity, addr: VAddr) -> Result<Option<Translation>, IsolationError> {
        let vms = self.vms.read();
        let locked = self.root(&vms, entity)?.lock();
        locked.table.lookup(&self.arena, addr).map_err(invariant_violation)
    }

    /// Like [`MemoryManager::lookup`] but without the table lock; the answer
    /// may be stale by the time it is returned.
    pub fn snapshot_lookup(&self, entity: Entity, addr: VAddr) -> Option<Translation> {
        let vms = self.vms.read();
        let table = self.root(&vms, entity).ok()?.table;
        table.lookup(&self.arena, addr).ok().flatten()
    }

    /// Mode of `range` in `entity`'s table if it is uniform.
    pub fn get_mode(&self, entity: Entity, range: AddrRange) -> Result<Option<Mode>, IsolationError> {
        let vms = self.vms.read();
        let locked = self.root(&vms, entity)?.lock();
        self.mode_of(&locked.table, range)
    }

    /// Entities owning `addr`.
    pub fn owned_by(&self, addr: PAddr) -> Result<EntitySet, IsolationError> {
        match &self.ledger {
            Some(ledger) => Ok(ledger.lock().owned_by(addr)),
            None => Ok(self.recompute()?.owned_by(addr)),
        }
    }

    /// Entities able to access `addr`.
    pub fn accessible_by(&self, addr: PAddr) -> Result<EntitySet, IsolationError> {
        match &self.ledger {
            Some(ledger) => Ok(ledger.lock().accessible_by(addr)),
            None => Ok(self.recompute()?.accessible_by(addr)),
        }
    }

    /// Frames left in the global pool.
    pub fn free_frames(&self) -> usize {
        self.pool.lock().free_count()
    }

    /// Lets at most `budget` further frame allocations succeed.
    #[cfg(feature = "failpoints")]
    pub fn set_alloc_budget(&self, budget: Option<usize>) {
        self.pool.lock().set_alloc_budget(budget);
    }

    /// Runs `f` over every table with all table locks held.
    fn with_all_tables<T>(&self, f: impl FnOnce(&[PageTable]) -> T) -> T {
        let vms: RwLockReadGuard<'_, Registry> = self.vms.read();
        let mut guards = Vec::with_capacity(vms.len() + 1);
        guards.push(self.hypervisor.lock());
        guards.extend(vms.values().map(RootTable::lock));
        let tables: Vec<PageTable> = guards.iter().map(|locked| locked.table).collect();
        f(&tables)
    }

    fn recompute(&self) -> Result<OwnershipState, IsolationError> {
        self.with_all_tables(|tables| verify::recompute(&self.arena, tables)).map_err(IsolationError::from)
    }

    /// Full representation check: exclusivity, pool consistency, stage
    /// disjointness and, when tracked, ledger agreement.
    pub fn verify(&self) -> Result<(), IsolationError> {
        self.with_all_tables(|tables| {
            let pool = self.pool.lock();
            let ledger = self.ledger.as_ref().map(|ledger| ledger.lock());
            verify::verify(&self.arena, &pool, tables, ledger.as_deref()).map(|_| ())
        })
        .map_err(|violation: Violation| {
            log::warn!(target: "pt", "verification failed: {}", violation);
            IsolationError::from(violation)
        })
    }

    /// Leaf entries of `entity` overlapping `range`, for diagnostics.
    pub fn dump(&self, entity: Entity, range: AddrRange) -> Result<Vec<(AddrRange, Mode)>, IsolationError> {
        let vms = self.vms.read();
        let locked = self.root(&vms, entity)?.lock();
        let stage = *locked.table.stage();
        let mut out = Vec::new();
        locked
            .table
            .walk_leaves(&self.arena, range, &mut |leaf, kind| {
                if kind != PteKind::Absent {
                    out.push((leaf, stage.leaf_mode(kind).unwrap_or(Mode::ABSENT)));
                }
            })
            .map_err(invariant_violation)?;
        Ok(out)
    }
}
