// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-stage table geometry and descriptor encoding
//! OWNERS: @kernel-mm-team
//! PUBLIC API: StageKind, Stage (entry_size/index/classify/leaf_pte/leaf_mode), NodeLocation
//! DEPENDS_ON: arch::aarch64, mm::pte, config::MmConfig
//! INVARIANTS: classify() is total; leaf_mode(leaf_pte(m)) == canonical(m)
//!
//! Levels count upwards from the leaves: level 0 maps 4 KiB pages, level 1
//! 2 MiB blocks, level 2 1 GiB blocks and level 3 is table-only.

use crate::arch::aarch64::{self, stage1, stage2, PTE_LEVEL0_BLOCK, PTE_TABLE, PTE_VALID};
use crate::config::MmConfig;
use crate::mm::node::{IndexPath, TablePtr};
use crate::mm::pte::{LeafAttrs, Mode, Pte, PteKind};
use crate::types::{AddrRange, PAddr, VAddr, ENTRIES_PER_NODE, PAGE_BITS, PAGE_LEVEL_BITS};

/// Highest level at which a block descriptor is architecturally permitted.
const MAX_BLOCK_LEVEL: u8 = 2;

/// Translation stage a table belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Hypervisor (EL2) translation.
    Stage1,
    /// Guest IPA to PA translation.
    Stage2,
}

/// Geometry and encoding of one translation stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stage {
    kind: StageKind,
    max_level: u8,
    root_frames: usize,
    limit: u64,
}

/// Position of a node inside its table: the first input address it
/// translates and the level of its entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeLocation {
    pub ptr: TablePtr,
    pub base: VAddr,
    pub level: u8,
}

impl Stage {
    pub fn stage1(config: &MmConfig) -> Self {
        let max_level = if config.pa_bits >= 40 { 3 } else { 2 };
        Self { kind: StageKind::Stage1, max_level, root_frames: 1, limit: config.address_limit() }
    }

    pub fn stage2(config: &MmConfig) -> Self {
        let bits = u32::from(config.pa_bits);
        let (max_level, root_frames) = if bits >= 44 {
            (3, 1)
        } else if bits >= 35 {
            (2, 1usize << bits.saturating_sub(39))
        } else {
            (1, 1usize << (bits - 30))
        };
        Self { kind: StageKind::Stage2, max_level, root_frames, limit: config.address_limit() }
    }

    #[inline]
    pub const fn kind(&self) -> StageKind {
        self.kind
    }

    #[inline]
    pub const fn max_level(&self) -> u8 {
        self.max_level
    }

    /// Number of concatenated frames forming the root table.
    #[inline]
    pub const fn root_frames(&self) -> usize {
        self.root_frames
    }

    /// Entries in the (possibly concatenated) root table.
    #[inline]
    pub const fn root_entries(&self) -> usize {
        self.root_frames * ENTRIES_PER_NODE
    }

    /// Exclusive bound on input addresses.
    #[inline]
    pub const fn limit(&self) -> u64 {
        self.limit
    }

    /// Bytes translated by one entry at `level`.
    #[inline]
    pub const fn entry_size(level: u8) -> u64 {
        1 << (PAGE_BITS + PAGE_LEVEL_BITS * level as u32)
    }

    /// Bytes translated by one node whose entries sit at `level`.
    #[inline]
    pub const fn node_span(level: u8) -> u64 {
        Self::entry_size(level) * ENTRIES_PER_NODE as u64
    }

    /// Index of `addr` within a node at `level`. At the root level the index
    /// counts across every concatenated root frame.
    #[inline]
    pub fn index(&self, addr: VAddr, level: u8) -> usize {
        let shift = PAGE_BITS + PAGE_LEVEL_BITS * u32::from(level);
        let index = (addr.raw() >> shift) as usize;
        if level == self.max_level {
            index
        } else {
            index % ENTRIES_PER_NODE
        }
    }

    #[inline]
    pub const fn is_block_allowed(level: u8) -> bool {
        level <= MAX_BLOCK_LEVEL
    }

    /// Whole input space of the table.
    pub const fn span(&self) -> AddrRange {
        AddrRange::new(0, self.limit)
    }

    fn owned_bit(&self) -> u64 {
        match self.kind {
            StageKind::Stage1 => stage1::SW_OWNED,
            StageKind::Stage2 => stage2::SW_OWNED,
        }
    }

    fn mode_to_attrs(&self, mode: Mode) -> u64 {
        match self.kind {
            StageKind::Stage1 => stage1::mode_to_attrs(mode),
            StageKind::Stage2 => stage2::mode_to_attrs(mode),
        }
    }

    fn attrs_to_mode(&self, attrs: u64) -> Mode {
        match self.kind {
            StageKind::Stage1 => stage1::attrs_to_mode(attrs),
            StageKind::Stage2 => stage2::attrs_to_mode(attrs),
        }
    }

    /// Brings `mode` into the form this stage can represent.
    ///
    /// Absent modes collapse to [`Mode::ABSENT`]; stage-1 mappings are
    /// always readable.
    pub fn canonical(&self, mode: Mode) -> Mode {
        let mode = mode.canonical();
        if mode.is_absent() {
            return mode;
        }
        match self.kind {
            StageKind::Stage1 => mode | Mode::R,
            StageKind::Stage2 => mode,
        }
    }

    #[inline]
    fn is_present(&self, pte: Pte) -> bool {
        pte.raw() & (PTE_VALID | self.owned_bit()) != 0
    }

    /// Decodes `pte` found at `level`. Every bit pattern maps to some kind.
    pub fn classify(&self, pte: Pte, level: u8) -> PteKind {
        let raw = pte.raw();
        if level > 0 && raw & PTE_VALID != 0 && raw & PTE_TABLE != 0 {
            return PteKind::Table(TablePtr::new(pte.output_address()));
        }
        if !self.is_present(pte) {
            return PteKind::Absent;
        }
        let is_block = if level == 0 { raw & PTE_LEVEL0_BLOCK != 0 } else { Self::is_block_allowed(level) };
        if is_block {
            PteKind::Block { pa: pte.output_address(), attrs: pte.block_attrs() }
        } else {
            PteKind::Absent
        }
    }

    pub fn table_pte(ptr: TablePtr) -> Pte {
        Pte::from_raw((ptr.addr().raw() & aarch64::PTE_ADDR_MASK) | PTE_TABLE | PTE_VALID)
    }

    /// Block descriptor from already encoded attribute bits.
    pub fn block_pte(level: u8, pa: PAddr, attrs: u64) -> Pte {
        let marker = if level == 0 { PTE_LEVEL0_BLOCK } else { 0 };
        Pte::from_raw((pa.raw() & aarch64::PTE_ADDR_MASK) | (attrs & aarch64::PTE_ATTR_MASK) | marker)
    }

    /// Leaf descriptor mapping `base` with `mode`; absent modes encode as zero.
    pub fn leaf_pte(&self, level: u8, base: PAddr, mode: Mode) -> Pte {
        let mode = self.canonical(mode);
        if mode.is_absent() {
            return Pte::ABSENT;
        }
        Self::block_pte(level, base, self.mode_to_attrs(mode))
    }

    /// Mode encoded by a leaf. Table descriptors have no mode of their own.
    pub fn leaf_mode(&self, kind: PteKind) -> Option<Mode> {
        match kind {
            PteKind::Absent => Some(Mode::ABSENT),
            PteKind::Block { attrs, .. } => Some(self.attrs_to_mode(attrs).canonical()),
            PteKind::Table(_) => None,
        }
    }

    /// Ownership booleans of a leaf.
    pub fn leaf_attrs(&self, kind: PteKind) -> LeafAttrs {
        self.leaf_mode(kind).map(Mode::leaf_attrs).unwrap_or(LeafAttrs::NONE)
    }

    /// First input address and entry level of the node reached by `path`.
    pub fn path_location(&self, path: &IndexPath) -> (VAddr, u8) {
        let indices = path.indices();
        let mut base = match indices.first() {
            Some(_) => 0,
            None => path.root_frame() as u64 * Self::node_span(self.max_level),
        };
        for (depth, index) in indices.iter().enumerate() {
            base += *index as u64 * Self::entry_size(self.max_level - depth as u8);
        }
        (VAddr::new(base), self.max_level - indices.len() as u8)
    }

    /// Location of the node `ptr` reached by `path`.
    pub fn node_location(&self, ptr: TablePtr, path: &IndexPath) -> NodeLocation {
        let (base, level) = self.path_location(path);
        NodeLocation { ptr, base, level }
    }
}
