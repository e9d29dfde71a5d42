// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Architecture specific descriptor layouts
//! OWNERS: @kernel-arch-team
//! PUBLIC API: arch backends under `arch::<isa>`
//! DEPENDS_ON: per-ISA modules (aarch64)
//! INVARIANTS: Keep per-arch bit layouts isolated behind module boundaries

pub mod aarch64;
