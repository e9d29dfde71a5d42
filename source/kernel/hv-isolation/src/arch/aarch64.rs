// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: AArch64 VMSAv8-64 descriptor bits for the hypervisor's stage-1 and guests' stage-2
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PTE_* constants, stage1/stage2 mode <-> attribute conversion
//! DEPENDS_ON: mm::pte::Mode
//! INVARIANTS: attrs_to_mode(mode_to_attrs(m)) == m for canonical, present modes
//!
//! Ownership lives in the software-reserved descriptor bits (55..58), which the
//! MMU ignores. The two stages place and polarise them differently but give
//! them the same meaning: "owned" and "shared with someone else".

use crate::mm::pte::Mode;

pub const PTE_VALID: u64 = 1 << 0;
/// Table descriptor at levels above 0.
pub const PTE_TABLE: u64 = 1 << 1;
/// Page descriptor marker at level 0.
pub const PTE_LEVEL0_BLOCK: u64 = 1 << 1;
/// Output address bits [47:12].
pub const PTE_ADDR_MASK: u64 = 0x0000_ffff_ffff_f000;
/// Attribute bits carried by blocks: everything except the address and bit 1.
pub const PTE_ATTR_MASK: u64 = !(PTE_ADDR_MASK | PTE_TABLE);

const PTE_AF: u64 = 1 << 10;
const PTE_SH_INNER: u64 = 3 << 8;

pub mod stage1 {
    //! EL2 stage-1 layout. Entries are always readable.

    use super::*;

    pub const ATTRINDX_MASK: u64 = 7 << 2;
    pub const ATTRINDX_NORMAL: u64 = 0 << 2;
    pub const ATTRINDX_DEVICE: u64 = 1 << 2;
    /// AP[2]: read-only.
    pub const AP_RO: u64 = 1 << 7;
    pub const XN: u64 = 1 << 54;
    pub const SW_SHARED: u64 = 1 << 55;
    pub const SW_OWNED: u64 = 1 << 56;

    pub fn mode_to_attrs(mode: Mode) -> u64 {
        let mut attrs = PTE_AF | PTE_SH_INNER;
        if !mode.contains(Mode::W) {
            attrs |= AP_RO;
        }
        if !mode.contains(Mode::X) {
            attrs |= XN;
        }
        attrs |= if mode.contains(Mode::D) { ATTRINDX_DEVICE } else { ATTRINDX_NORMAL };
        if !mode.contains(Mode::INVALID) {
            attrs |= PTE_VALID;
        }
        if !mode.contains(Mode::UNOWNED) {
            attrs |= SW_OWNED;
        }
        if mode.contains(Mode::SHARED) {
            attrs |= SW_SHARED;
        }
        attrs
    }

    pub fn attrs_to_mode(attrs: u64) -> Mode {
        let mut mode = Mode::R;
        if attrs & AP_RO == 0 {
            mode |= Mode::W;
        }
        if attrs & XN == 0 {
            mode |= Mode::X;
        }
        if attrs & ATTRINDX_MASK == ATTRINDX_DEVICE {
            mode |= Mode::D;
        }
        if attrs & PTE_VALID == 0 {
            mode |= Mode::INVALID;
        }
        if attrs & SW_OWNED == 0 {
            mode |= Mode::UNOWNED;
        }
        if attrs & SW_SHARED != 0 {
            mode |= Mode::SHARED;
        }
        mode
    }
}

pub mod stage2 {
    //! Stage-2 (IPA -> PA) layout.

    use super::*;

    pub const MEMATTR_MASK: u64 = 0xf << 2;
    pub const MEMATTR_DEVICE_NGNRE: u64 = 0b0001 << 2;
    pub const MEMATTR_NORMAL_WB: u64 = 0b1111 << 2;
    pub const S2AP_R: u64 = 1 << 6;
    pub const S2AP_W: u64 = 1 << 7;
    pub const XN_MASK: u64 = 3 << 53;
    pub const XN_NONE: u64 = 2 << 53;
    pub const SW_OWNED: u64 = 1 << 55;
    pub const SW_EXCLUSIVE: u64 = 1 << 56;

    pub fn mode_to_attrs(mode: Mode) -> u64 {
        let mut attrs = PTE_AF | PTE_SH_INNER;
        if mode.contains(Mode::R) {
            attrs |= S2AP_R;
        }
        if mode.contains(Mode::W) {
            attrs |= S2AP_W;
        }
        if !mode.contains(Mode::X) {
            attrs |= XN_NONE;
        }
        attrs |= if mode.contains(Mode::D) { MEMATTR_DEVICE_NGNRE } else { MEMATTR_NORMAL_WB };
        if !mode.contains(Mode::INVALID) {
            attrs |= PTE_VALID;
        }
        if !mode.contains(Mode::UNOWNED) {
            attrs |= SW_OWNED;
        }
        if !mode.contains(Mode::SHARED) {
            attrs |= SW_EXCLUSIVE;
        }
        attrs
    }

    pub fn attrs_to_mode(attrs: u64) -> Mode {
        let mut mode = Mode::empty();
        if attrs & S2AP_R != 0 {
            mode |= Mode::R;
        }
        if attrs & S2AP_W != 0 {
            mode |= Mode::W;
        }
        if attrs & XN_MASK != XN_NONE {
            mode |= Mode::X;
        }
        if attrs & MEMATTR_MASK == MEMATTR_DEVICE_NGNRE {
            mode |= Mode::D;
        }
        if attrs & PTE_VALID == 0 {
            mode |= Mode::INVALID;
        }
        if attrs & SW_OWNED == 0 {
            mode |= Mode::UNOWNED;
        }
        if attrs & SW_EXCLUSIVE == 0 {
            mode |= Mode::SHARED;
        }
        mode
    }
}
