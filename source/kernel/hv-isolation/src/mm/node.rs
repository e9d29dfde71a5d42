// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Table indirection layer: node storage and pointer resolution
//! OWNERS: @kernel-mm-team
//! PUBLIC API: TablePtr, PageTableNode, NodeArena::deref, IndexPath, index_sequences_to_pointer
//! DEPENDS_ON: mm::stage (geometry), mm::pte
//! INVARIANTS: A TablePtr derefs only if it names a slot of the arena;
//!             only the holder of a root's lock stores into nodes reachable from it
//!
//! Table nodes live in one arena of frame-sized slots. A pointer is the
//! physical address `base + index * PAGE_SIZE`, so PTEs can hold it directly
//! while dereferencing stays a bounds-checked slice lookup.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use static_assertions::{assert_eq_size, const_assert_eq};

use crate::error::Violation;
use crate::mm::pte::{Pte, PteKind};
use crate::mm::stage::Stage;
use crate::types::{PAddr, ENTRIES_PER_NODE, PAGE_SIZE};

/// Physical address of a page-table node.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TablePtr(PAddr);

impl TablePtr {
    #[inline]
    pub const fn new(addr: PAddr) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn addr(self) -> PAddr {
        self.0
    }

    /// Pointer to the `frames`-th frame after this one.
    #[inline]
    pub const fn offset(self, frames: usize) -> Self {
        Self(PAddr::new(self.0.raw() + frames as u64 * PAGE_SIZE))
    }
}

impl fmt::Debug for TablePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TablePtr({:#x})", self.0.raw())
    }
}

/// One 4 KiB frame of PTEs.
#[repr(C, align(4096))]
pub struct PageTableNode {
    entries: [AtomicU64; ENTRIES_PER_NODE],
}

assert_eq_size!(PageTableNode, [u8; PAGE_SIZE as usize]);
const_assert_eq!(core::mem::align_of::<PageTableNode>(), PAGE_SIZE as usize);

impl PageTableNode {
    fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self { entries: [ZERO; ENTRIES_PER_NODE] }
    }

    #[inline]
    pub fn load(&self, index: usize) -> Pte {
        Pte::from_raw(self.entries[index].load(Ordering::Acquire))
    }

    #[inline]
    pub fn store(&self, index: usize, pte: Pte) {
        self.entries[index].store(pte.raw(), Ordering::Release);
    }

    /// Copy of every entry.
    pub fn snapshot(&self) -> [Pte; ENTRIES_PER_NODE] {
        let mut out = [Pte::ABSENT; ENTRIES_PER_NODE];
        for (slot, entry) in out.iter_mut().zip(self.entries.iter()) {
            *slot = Pte::from_raw(entry.load(Ordering::Acquire));
        }
        out
    }

    pub fn clear(&self) {
        for entry in self.entries.iter() {
            entry.store(0, Ordering::Relaxed);
        }
    }
}

/// Backing storage for every table node of the system.
pub struct NodeArena {
    base: PAddr,
    nodes: Box<[PageTableNode]>,
}

impl NodeArena {
    pub fn new(base: PAddr, frames: usize) -> Self {
        let nodes: Vec<PageTableNode> = (0..frames).map(|_| PageTableNode::new()).collect();
        Self { base, nodes: nodes.into_boxed_slice() }
    }

    #[inline]
    pub fn frames(&self) -> usize {
        self.nodes.len()
    }

    /// Pointer naming slot `index`.
    #[inline]
    pub fn ptr(&self, index: usize) -> TablePtr {
        TablePtr::new(self.base).offset(index)
    }

    /// Slot index of `ptr`, if it names one.
    pub fn frame_of(&self, ptr: TablePtr) -> Option<usize> {
        let offset = ptr.addr().raw().checked_sub(self.base.raw())?;
        if offset % PAGE_SIZE != 0 {
            return None;
        }
        let index = usize::try_from(offset / PAGE_SIZE).ok()?;
        (index < self.nodes.len()).then_some(index)
    }

    #[inline]
    pub fn contains(&self, ptr: TablePtr) -> bool {
        self.frame_of(ptr).is_some()
    }

    /// Resolves a node pointer.
    pub fn deref(&self, ptr: TablePtr) -> Result<&PageTableNode, Violation> {
        self.frame_of(ptr).map(|index| &self.nodes[index]).ok_or(Violation::DanglingPointer(ptr))
    }
}

/// Sequence of entry indices leading from a root to a node.
///
/// The first index counts across concatenated root frames. A path without
/// indices names root frame `root_frame` itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexPath {
    root_frame: usize,
    indices: Vec<usize>,
}

impl IndexPath {
    pub fn root(frame: usize) -> Self {
        Self { root_frame: frame, indices: Vec::new() }
    }

    /// Path to the node referenced by entry `index` of this one. `index` is
    /// local to the frame, including for root frames.
    pub fn child(&self, index: usize) -> Self {
        let mut indices = self.indices.clone();
        let index = if indices.is_empty() { self.root_frame * ENTRIES_PER_NODE + index % ENTRIES_PER_NODE } else { index };
        indices.push(index);
        Self { root_frame: self.root_frame, indices }
    }

    #[inline]
    pub fn root_frame(&self) -> usize {
        self.root_frame
    }

    #[inline]
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }
}

/// Every path by which `target` is reachable from the table rooted at `root`.
///
/// A well-formed table yields at most one. Walking stops at the leaves, so
/// cyclic pointers cannot loop.
pub fn index_sequences_to_pointer(
    arena: &NodeArena,
    target: TablePtr,
    root: TablePtr,
    stage: &Stage,
) -> Result<Vec<IndexPath>, Violation> {
    let mut paths = Vec::new();
    for frame in 0..stage.root_frames() {
        let ptr = root.offset(frame);
        let path = IndexPath::root(frame);
        if ptr == target {
            paths.push(path.clone());
        }
        collect_paths(arena, target, ptr, stage.max_level(), stage, path, &mut paths)?;
    }
    Ok(paths)
}

fn collect_paths(
    arena: &NodeArena,
    target: TablePtr,
    node: TablePtr,
    level: u8,
    stage: &Stage,
    path: IndexPath,
    out: &mut Vec<IndexPath>,
) -> Result<(), Violation> {
    if level == 0 {
        return Ok(());
    }
    let entries = arena.deref(node)?;
    for index in 0..ENTRIES_PER_NODE {
        if let PteKind::Table(child) = stage.classify(entries.load(index), level) {
            let child_path = path.child(index);
            if child == target {
                out.push(child_path.clone());
            }
            collect_paths(arena, target, child, level - 1, stage, child_path, out)?;
        }
    }
    Ok(())
}
