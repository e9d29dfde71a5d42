// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error types returned by the isolation core.

use thiserror::Error;

use crate::mm::node::TablePtr;
use crate::types::{AddrRange, Entity, PAddr, VmId};

/// Errors reported by mapping, sharing and registry operations.
///
/// Every variant except [`IsolationError::InvariantViolation`] is raised before
/// any table is edited.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IsolationError {
    /// No frame was left for a page-table node; the operation was rolled back.
    #[error("page-table frame pool exhausted")]
    PoolExhausted,
    /// The entity does not own the whole range.
    #[error("{0} does not own the requested range")]
    NotOwned(Entity),
    /// The entity may not access the range with the requested permissions.
    #[error("{0} cannot access the requested range")]
    NotAccessible(Entity),
    /// Range bounds are not page aligned.
    #[error("range {0} is not page aligned")]
    RangeMisaligned(AddrRange),
    /// Range reaches past the configured physical address width.
    #[error("range {0} exceeds the translatable address space")]
    OutOfRange(AddrRange),
    /// The range mixes several modes where a single one is required.
    #[error("{0} maps the range with mixed attributes")]
    NotUniform(Entity),
    /// Memory that is already shared cannot be shared again.
    #[error("{0} already shares the range")]
    AlreadyShared(Entity),
    /// The recipient already maps part of the range.
    #[error("{0} already maps part of the range")]
    AlreadyMapped(Entity),
    /// Device memory never changes hands.
    #[error("range is device memory")]
    DeviceMemory,
    /// Sender and recipient are the same entity.
    #[error("{0} cannot share memory with itself")]
    SameEntity(Entity),
    /// No VM is registered under the id.
    #[error("unknown vm {}", .0.as_raw())]
    UnknownVm(VmId),
    /// A VM is already registered under the id.
    #[error("vm {} already exists", .0.as_raw())]
    VmExists(VmId),
    /// The id is beyond the supported number of VMs.
    #[error("vm id {} is out of range", .0.as_raw())]
    InvalidVmId(VmId),
    /// Configuration rejected at initialisation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    /// Internal consistency failure; unreachable in correct code.
    #[error("invariant violation: {0}")]
    InvariantViolation(#[from] Violation),
}

/// Ways the concrete tables can fail to represent the abstract ownership state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    /// A node pointer lies outside the node arena or is misaligned.
    #[error("pointer {0:?} does not name a table node")]
    DanglingPointer(TablePtr),
    /// A node is reachable from more than one place.
    #[error("node {ptr:?} reachable from both {first} and {second}")]
    SharedNode { ptr: TablePtr, first: Entity, second: Entity },
    /// A node is reachable through several entries of the same table.
    #[error("node {ptr:?} reachable through {paths} entries of {entity}'s table")]
    AliasedNode { ptr: TablePtr, entity: Entity, paths: usize },
    /// A node is reachable from a stage-1 and a stage-2 root.
    #[error("node {0:?} is used by both translation stages")]
    StageOverlap(TablePtr),
    /// A reachable node is also on the pool's free list.
    #[error("node {0:?} is reachable but free")]
    FreeNodeReachable(TablePtr),
    /// The caller's idea of where a node sits disagrees with the table.
    #[error("node {0:?} is not at the expected location")]
    Misplaced(TablePtr),
    /// A partially covered entry was not split before commit.
    #[error("entry covering {0} was not split before commit")]
    UnsplitEntry(AddrRange),
    /// Incremental ownership ledger and table walk disagree.
    #[error("ownership of {addr:?} for {entity} disagrees with the tables")]
    LedgerMismatch { entity: Entity, addr: PAddr },
}

/// Rejections raised by [`crate::config::MmConfig::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("physical address width {0} outside 32..=48 bits")]
    PaBits(u8),
    #[error("node arena needs at least {min} frames, got {got}")]
    TooFewFrames { min: usize, got: usize },
    #[error("table base {0:?} is not page aligned")]
    UnalignedBase(PAddr),
}

/// Builds an [`IsolationError::InvariantViolation`], asserting in debug builds.
///
/// Release builds deny the operation instead of panicking.
#[track_caller]
pub(crate) fn invariant_violation(violation: Violation) -> IsolationError {
    log::error!(target: "pt", "invariant violation: {}", violation);
    debug_assert!(false, "invariant violation: {violation}");
    IsolationError::InvariantViolation(violation)
}
