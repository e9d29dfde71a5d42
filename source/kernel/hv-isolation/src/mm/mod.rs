// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page-table structure for the hypervisor stage-1 and guest stage-2 tables
//! OWNERS: @kernel-mm-team
//! PUBLIC API: node (arena, TablePtr), pte (Mode, Pte), stage (Stage), page_table (PageTable)
//! DEPENDS_ON: arch::aarch64, pool
//! INVARIANTS: Every table is an identity map; input address == output address

pub mod node;
pub mod page_table;
pub mod pte;
pub mod stage;
