// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Representation checker: brute-force oracle for the concrete tables
//! OWNERS: @kernel-mm-team
//! PUBLIC API: check_exclusive, recompute, verify
//! DEPENDS_ON: mm::page_table, model::OwnershipState, pool::FramePool
//! INVARIANTS: Read-only; callers hold every table lock it walks

extern crate alloc;

use alloc::collections::BTreeMap;

use crate::error::Violation;
use crate::mm::node::{NodeArena, TablePtr};
use crate::mm::page_table::PageTable;
use crate::mm::pte::PteKind;
use crate::mm::stage::StageKind;
use crate::model::OwnershipState;
use crate::pool::FramePool;
use crate::types::Entity;

/// Checks that every node is reachable from one place only, is in use and
/// serves a single stage.
pub fn check_exclusive(arena: &NodeArena, pool: &FramePool, tables: &[PageTable]) -> Result<(), Violation> {
    let mut seen: BTreeMap<TablePtr, (Entity, StageKind)> = BTreeMap::new();
    for table in tables {
        let stage = table.stage().kind();
        let nodes = table.collect_nodes(arena)?;
        for &(ptr, _) in &nodes {
            if pool.is_free(ptr) {
                return Err(Violation::FreeNodeReachable(ptr));
            }
            if let Some(&(first, first_stage)) = seen.get(&ptr) {
                if first_stage != stage {
                    return Err(Violation::StageOverlap(ptr));
                }
                if first == table.entity() {
                    let paths = nodes.iter().filter(|(other, _)| *other == ptr).count();
                    return Err(Violation::AliasedNode { ptr, entity: first, paths });
                }
                return Err(Violation::SharedNode { ptr, first, second: table.entity() });
            }
            seen.insert(ptr, (table.entity(), stage));
        }
    }
    Ok(())
}

/// Derives the abstract state from the leaves of every table.
pub fn recompute(arena: &NodeArena, tables: &[PageTable]) -> Result<OwnershipState, Violation> {
    let mut state = OwnershipState::new();
    for table in tables {
        let stage = table.stage();
        table.walk_leaves(arena, stage.span(), &mut |range, kind| {
            if kind != PteKind::Absent {
                state.reassign(table.entity(), range, stage.leaf_attrs(kind));
            }
        })?;
    }
    Ok(state)
}

/// Full representation check. Returns the recomputed state on success.
pub fn verify(
    arena: &NodeArena,
    pool: &FramePool,
    tables: &[PageTable],
    ledger: Option<&OwnershipState>,
) -> Result<OwnershipState, Violation> {
    check_exclusive(arena, pool, tables)?;
    let state = recompute(arena, tables)?;
    if let Some(ledger) = ledger {
        if let Some((entity, addr)) = state.first_difference(ledger) {
            return Err(Violation::LedgerMismatch { entity, addr });
        }
    }
    Ok(state)
}
