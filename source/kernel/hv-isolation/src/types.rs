// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Newtypes shared by every layer of the isolation core
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PAddr, VAddr, AddrRange, VmId, Entity, EntitySet
//! DEPENDS_ON: core only
//! INVARIANTS: Entity order is the global lock order (hypervisor first, then VMs by id)

use core::fmt;

use static_assertions::const_assert;

/// log2 of the smallest translation granule.
pub const PAGE_BITS: u32 = 12;
/// Size of a page in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_BITS;
/// Index bits consumed by one table level.
pub const PAGE_LEVEL_BITS: u32 = 9;
/// Number of PTEs in one page-table node.
pub const ENTRIES_PER_NODE: usize = 1 << PAGE_LEVEL_BITS;
/// Highest number of guest VMs the core can attribute memory to.
pub const MAX_VMS: usize = 63;

// Entity sets are a single u64 mask with bit 0 reserved for the hypervisor.
const_assert!(MAX_VMS < 64);

/// Physical address.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PAddr(u64);

impl PAddr {
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    #[inline]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

/// Input address of a translation stage (stage-1 VA or stage-2 IPA).
///
/// Every mapping installed by this crate is an identity mapping, so a `VAddr`
/// and the `PAddr` it translates to carry the same value.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VAddr(u64);

impl VAddr {
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    /// Physical address reached through an identity mapping.
    #[inline]
    pub const fn identity(self) -> PAddr {
        PAddr(self.0)
    }
}

impl From<PAddr> for VAddr {
    fn from(pa: PAddr) -> Self {
        Self(pa.raw())
    }
}

/// Half-open address range `[begin, end)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AddrRange {
    pub begin: VAddr,
    pub end: VAddr,
}

impl AddrRange {
    #[inline]
    pub const fn new(begin: u64, end: u64) -> Self {
        Self { begin: VAddr(begin), end: VAddr(end) }
    }

    /// Range of `pages` pages starting at `begin`, if it does not overflow.
    pub fn from_pages(begin: u64, pages: u64) -> Option<Self> {
        let len = pages.checked_mul(PAGE_SIZE)?;
        let end = begin.checked_add(len)?;
        Some(Self::new(begin, end))
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.end.0 <= self.begin.0
    }

    #[inline]
    pub const fn len(&self) -> u64 {
        self.end.0.saturating_sub(self.begin.0)
    }

    #[inline]
    pub const fn is_page_aligned(&self) -> bool {
        self.begin.is_page_aligned() && self.end.is_page_aligned()
    }

    #[inline]
    pub const fn contains(&self, addr: VAddr) -> bool {
        self.begin.0 <= addr.0 && addr.0 < self.end.0
    }

    /// Whether `other` lies completely inside this range.
    #[inline]
    pub const fn covers(&self, other: &AddrRange) -> bool {
        self.begin.0 <= other.begin.0 && other.end.0 <= self.end.0
    }

    /// Overlap of two ranges; empty ranges come back as `None`.
    pub fn intersect(&self, other: &AddrRange) -> Option<AddrRange> {
        let begin = self.begin.0.max(other.begin.0);
        let end = self.end.0.min(other.end.0);
        if begin < end {
            Some(AddrRange::new(begin, end))
        } else {
            None
        }
    }
}

impl fmt::Display for AddrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.begin.0, self.end.0)
    }
}

/// Guest VM identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VmId(u16);

impl VmId {
    #[inline]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        (self.0 as usize) < MAX_VMS
    }
}

/// Unit of memory ownership and access.
///
/// The derived order (hypervisor before every VM, VMs by id) is the order in
/// which per-root table locks must be taken.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Entity {
    Hypervisor,
    Vm(VmId),
}

impl Entity {
    #[inline]
    pub const fn vm(raw: u16) -> Self {
        Entity::Vm(VmId::new(raw))
    }

    #[inline]
    const fn bit(self) -> u64 {
        match self {
            Entity::Hypervisor => 1,
            Entity::Vm(id) => 1 << (id.0 as u32 + 1),
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Hypervisor => f.write_str("hypervisor"),
            Entity::Vm(id) => write!(f, "vm{}", id.0),
        }
    }
}

/// Set of entities, stored as a bitmask.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct EntitySet(u64);

impl EntitySet {
    pub const EMPTY: Self = Self(0);

    pub fn of(entity: Entity) -> Self {
        Self(entity.bit())
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(self, entity: Entity) -> bool {
        self.0 & entity.bit() != 0
    }

    #[inline]
    pub const fn with(self, entity: Entity) -> Self {
        Self(self.0 | entity.bit())
    }

    #[inline]
    pub const fn without(self, entity: Entity) -> Self {
        Self(self.0 & !entity.bit())
    }

    /// Adds `entity` when `member` holds, removes it otherwise.
    #[inline]
    pub const fn set(self, entity: Entity, member: bool) -> Self {
        if member {
            self.with(entity)
        } else {
            self.without(entity)
        }
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(self) -> impl Iterator<Item = Entity> {
        (0..64u32).filter(move |bit| self.0 & (1 << bit) != 0).map(|bit| {
            if bit == 0 {
                Entity::Hypervisor
            } else {
                Entity::Vm(VmId((bit - 1) as u16))
            }
        })
    }
}

impl FromIterator<Entity> for EntitySet {
    fn from_iter<I: IntoIterator<Item = Entity>>(iter: I) -> Self {
        iter.into_iter().fold(EntitySet::EMPTY, EntitySet::with)
    }
}

impl fmt::Debug for EntitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_order_puts_hypervisor_first() {
        assert!(Entity::Hypervisor < Entity::vm(0));
        assert!(Entity::vm(1) < Entity::vm(2));
    }

    #[test]
    fn entity_set_membership() {
        let set = EntitySet::of(Entity::vm(3)).with(Entity::Hypervisor);
        assert!(set.contains(Entity::Hypervisor));
        assert!(set.contains(Entity::vm(3)));
        assert!(!set.contains(Entity::vm(2)));
        assert_eq!(set.iter().collect::<alloc::vec::Vec<_>>(), [Entity::Hypervisor, Entity::vm(3)]);
        assert!(set.without(Entity::vm(3)).without(Entity::Hypervisor).is_empty());
    }

    #[test]
    fn range_intersection() {
        let a = AddrRange::new(0x1000, 0x3000);
        let b = AddrRange::new(0x2000, 0x5000);
        assert_eq!(a.intersect(&b), Some(AddrRange::new(0x2000, 0x3000)));
        assert_eq!(a.intersect(&AddrRange::new(0x3000, 0x4000)), None);
        assert!(AddrRange::new(0x2000, 0x1000).is_empty());
    }
}
