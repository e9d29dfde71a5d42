// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory-isolation core of the hypervisor
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MemoryManager, MmConfig, IsolationError, Mode, ShareMode, Entity/VmId/AddrRange
//! DEPENDS_ON: bitflags, spin, thiserror, log, static_assertions
//! INVARIANTS: Every physical page has one well-defined owner and accessor set,
//!             and the stage-1/stage-2 tables represent exactly that attribution
//!
//! The hypervisor's stage-1 table and one stage-2 table per guest all live in
//! a single node arena fed by [`pool::FramePool`]. All writes go through
//! [`reassign::Reassigner`], which records the matching ledger changes in a
//! [`reassign::LedgerDelta`] that the manager publishes once per operation;
//! [`verify`] recomputes the ledger from scratch and is the oracle the
//! tests check against.

#![cfg_attr(not(test), no_std)]
#![forbid(clippy::unwrap_used)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod error;
pub mod manager;
pub mod mm;
pub mod model;
pub mod pool;
pub mod reassign;
pub mod types;
pub mod verify;

pub use config::MmConfig;
pub use error::{ConfigError, IsolationError, Violation};
pub use manager::{MemoryManager, ShareMode};
pub use mm::page_table::Translation;
pub use mm::pte::Mode;
pub use types::{AddrRange, Entity, EntitySet, PAddr, VAddr, VmId, PAGE_SIZE};
