// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page-table entries and the memory-mode vocabulary.

use core::fmt;

use bitflags::bitflags;

use crate::arch::aarch64::{PTE_ADDR_MASK, PTE_ATTR_MASK};
use crate::mm::node::TablePtr;
use crate::types::PAddr;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    /// Access and attribution mode of a mapping.
    ///
    /// Owned and valid are expressed negatively so that the empty set is the
    /// most privileged mode, mirroring how modes are combined when sharing.
    pub struct Mode: u32 {
        const R = 1 << 0;
        const W = 1 << 1;
        const X = 1 << 2;
        /// Device memory.
        const D = 1 << 3;
        /// Not accessible through the table.
        const INVALID = 1 << 4;
        /// Not owned by the table's entity.
        const UNOWNED = 1 << 5;
        /// Owned or borrowed memory that another entity can also access.
        const SHARED = 1 << 6;
    }
}

impl Mode {
    /// Mode of an unmapped address.
    pub const ABSENT: Mode = Mode::INVALID.union(Mode::UNOWNED);
    /// Access permission bits.
    pub const RWX: Mode = Mode::R.union(Mode::W).union(Mode::X);

    #[inline]
    pub const fn is_absent(self) -> bool {
        self.contains(Mode::ABSENT)
    }

    #[inline]
    pub const fn is_owned(self) -> bool {
        !self.contains(Mode::UNOWNED)
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        !self.contains(Mode::INVALID)
    }

    /// Collapses every absent mode onto [`Mode::ABSENT`].
    #[inline]
    pub const fn canonical(self) -> Mode {
        if self.is_absent() {
            Mode::ABSENT
        } else {
            self
        }
    }

    #[inline]
    pub const fn leaf_attrs(self) -> LeafAttrs {
        LeafAttrs { owned: self.is_owned(), valid: self.is_valid() }
    }
}

/// Ownership view of one leaf: the two booleans the abstract model tracks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct LeafAttrs {
    pub owned: bool,
    pub valid: bool,
}

impl LeafAttrs {
    pub const NONE: LeafAttrs = LeafAttrs { owned: false, valid: false };
}

/// Raw 64-bit descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Pte(u64);

impl Pte {
    pub const ABSENT: Pte = Pte(0);

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Output address field (table pointer or block base).
    #[inline]
    pub const fn output_address(self) -> PAddr {
        PAddr::new(self.0 & PTE_ADDR_MASK)
    }

    /// Attribute bits shared by every level a block can live at.
    #[inline]
    pub const fn block_attrs(self) -> u64 {
        self.0 & PTE_ATTR_MASK
    }
}

impl fmt::Debug for Pte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pte({:#018x})", self.0)
    }
}

/// Decoded shape of a PTE at a given level. Decoding is total.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PteKind {
    Absent,
    Block { pa: PAddr, attrs: u64 },
    Table(TablePtr),
}
