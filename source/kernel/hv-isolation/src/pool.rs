// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page frame pool backing page-table nodes
//! OWNERS: @kernel-mm-team
//! PUBLIC API: FrameAllocator, FramePool (global), LocalPool (per operation)
//! DEPENDS_ON: mm::node::NodeArena
//! INVARIANTS: A frame is either free in exactly one pool or in use, never both;
//!             allocated frames are zeroed
//!
//! The global pool is a bitmap with a rotating cursor. Operations draw from a
//! [`LocalPool`] chained to it, which keeps frames freed mid-operation for
//! reuse and hands everything back to the global pool when dropped.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::mm::node::{NodeArena, TablePtr};

const WORD_BITS: usize = 64;

/// Source and sink of zeroed page-table frames.
pub trait FrameAllocator {
    /// Returns a zeroed frame, or `None` when the pool is empty.
    fn allocate(&mut self) -> Option<TablePtr>;

    /// Returns `frame` to the pool. The caller guarantees that nothing
    /// references it any more.
    fn free(&mut self, frame: TablePtr);
}

/// Global pool covering every slot of the node arena.
pub struct FramePool {
    arena: Arc<NodeArena>,
    bitmap: Vec<u64>,
    next: usize,
    free: usize,
    #[cfg(feature = "failpoints")]
    budget: Option<usize>,
}

impl FramePool {
    pub fn new(arena: Arc<NodeArena>) -> Self {
        let frames = arena.frames();
        Self {
            bitmap: vec![0; frames.div_ceil(WORD_BITS)],
            arena,
            next: 0,
            free: frames,
            #[cfg(feature = "failpoints")]
            budget: None,
        }
    }

    /// Number of frames currently free.
    #[inline]
    pub fn free_count(&self) -> usize {
        self.free
    }

    /// Whether `frame` belongs to the arena and is currently free.
    pub fn is_free(&self, frame: TablePtr) -> bool {
        self.arena.frame_of(frame).is_some_and(|index| !self.is_used(index))
    }

    /// Lets at most `budget` further allocations succeed; `None` lifts the limit.
    #[cfg(feature = "failpoints")]
    pub fn set_alloc_budget(&mut self, budget: Option<usize>) {
        self.budget = budget;
    }

    #[cfg(feature = "failpoints")]
    fn take_budget(&mut self, frames: usize) -> bool {
        match self.budget {
            Some(left) if left < frames => false,
            Some(left) => {
                self.budget = Some(left - frames);
                true
            }
            None => true,
        }
    }

    #[cfg(not(feature = "failpoints"))]
    #[inline]
    fn take_budget(&mut self, _frames: usize) -> bool {
        true
    }

    #[inline]
    fn is_used(&self, index: usize) -> bool {
        self.bitmap[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    #[inline]
    fn mark(&mut self, index: usize, used: bool) {
        let word = &mut self.bitmap[index / WORD_BITS];
        if used {
            *word |= 1 << (index % WORD_BITS);
        } else {
            *word &= !(1 << (index % WORD_BITS));
        }
    }

    fn take(&mut self, index: usize) -> TablePtr {
        self.mark(index, true);
        self.free -= 1;
        let ptr = self.arena.ptr(index);
        if let Ok(node) = self.arena.deref(ptr) {
            node.clear();
        }
        ptr
    }

    /// Returns `count` consecutive zeroed frames aligned to `count` frames.
    ///
    /// Used for concatenated stage-2 root tables; `count` must be a power of two.
    pub fn allocate_contiguous(&mut self, count: usize) -> Option<TablePtr> {
        if count == 0 || !count.is_power_of_two() || count > self.free {
            return None;
        }
        let frames = self.arena.frames();
        let start = (0..frames.saturating_sub(count - 1))
            .step_by(count)
            .find(|&start| (start..start + count).all(|index| !self.is_used(index)))?;
        if !self.take_budget(count) {
            return None;
        }
        for index in start..start + count {
            self.take(index);
        }
        Some(self.arena.ptr(start))
    }
}

impl FrameAllocator for FramePool {
    fn allocate(&mut self) -> Option<TablePtr> {
        if self.free == 0 {
            return None;
        }
        let frames = self.arena.frames();
        for _ in 0..frames {
            let index = self.next % frames;
            self.next = (index + 1) % frames;
            if !self.is_used(index) {
                if !self.take_budget(1) {
                    log::debug!(target: "pool", "allocation denied by failpoint budget");
                    return None;
                }
                return Some(self.take(index));
            }
        }
        None
    }

    fn free(&mut self, frame: TablePtr) {
        match self.arena.frame_of(frame) {
            Some(index) if self.is_used(index) => {
                self.mark(index, false);
                self.free += 1;
            }
            Some(_) => log::warn!(target: "pool", "double free of {:?}", frame),
            None => log::warn!(target: "pool", "free of foreign frame {:?}", frame),
        }
    }
}

/// Per-operation pool chained to the global [`FramePool`].
///
/// Allocation prefers frames freed earlier in the same operation and falls
/// back to the global pool, locking it only for the duration of the call.
pub struct LocalPool<'a> {
    fallback: &'a spin::Mutex<FramePool>,
    arena: &'a NodeArena,
    frames: Vec<TablePtr>,
}

impl<'a> LocalPool<'a> {
    pub fn new(fallback: &'a spin::Mutex<FramePool>, arena: &'a NodeArena) -> Self {
        Self { fallback, arena, frames: Vec::new() }
    }

    /// Frames currently held locally.
    pub fn held(&self) -> usize {
        self.frames.len()
    }
}

impl FrameAllocator for LocalPool<'_> {
    fn allocate(&mut self) -> Option<TablePtr> {
        if let Some(frame) = self.frames.pop() {
            if let Ok(node) = self.arena.deref(frame) {
                node.clear();
            }
            return Some(frame);
        }
        self.fallback.lock().allocate()
    }

    fn free(&mut self, frame: TablePtr) {
        self.frames.push(frame);
    }
}

impl Drop for LocalPool<'_> {
    fn drop(&mut self) {
        if self.frames.is_empty() {
            return;
        }
        let mut global = self.fallback.lock();
        for frame in self.frames.drain(..) {
            global.free(frame);
        }
    }
}
