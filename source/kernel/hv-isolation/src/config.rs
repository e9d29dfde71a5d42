// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boot-time configuration of the isolation core
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MmConfig (Default, with_* builders, validate)
//! DEPENDS_ON: error::ConfigError
//! INVARIANTS: Validated once in MemoryManager::new; immutable afterwards

use crate::error::ConfigError;
use crate::types::{PAddr, PAGE_SIZE};

/// Smallest and largest supported physical address widths.
const PA_BITS_MIN: u8 = 32;
const PA_BITS_MAX: u8 = 48;
/// The hypervisor root plus one concatenated stage-2 root must always fit.
const MIN_NODE_FRAMES: usize = 32;

/// Parameters fixed when the memory manager is created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MmConfig {
    /// Physical (and intermediate physical) address width.
    pub pa_bits: u8,
    /// Number of 4 KiB frames reserved for page-table nodes.
    pub node_frames: usize,
    /// Physical address of the first node frame.
    pub table_base: PAddr,
    /// Maintain the incremental ownership ledger.
    pub track_ownership: bool,
    /// Run the representation check after every mutation.
    pub verify_updates: bool,
}

impl Default for MmConfig {
    fn default() -> Self {
        Self {
            pa_bits: 40,
            node_frames: 1024,
            table_base: PAddr::new(0x4000_0000),
            track_ownership: true,
            verify_updates: cfg!(feature = "debug_pt_verify"),
        }
    }
}

impl MmConfig {
    pub fn with_pa_bits(mut self, pa_bits: u8) -> Self {
        self.pa_bits = pa_bits;
        self
    }

    pub fn with_node_frames(mut self, frames: usize) -> Self {
        self.node_frames = frames;
        self
    }

    pub fn with_table_base(mut self, base: PAddr) -> Self {
        self.table_base = base;
        self
    }

    pub fn with_ownership_tracking(mut self, enabled: bool) -> Self {
        self.track_ownership = enabled;
        self
    }

    pub fn with_update_verification(mut self, enabled: bool) -> Self {
        self.verify_updates = enabled;
        self
    }

    /// Exclusive upper bound of translatable input addresses.
    pub const fn address_limit(&self) -> u64 {
        1 << self.pa_bits
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(PA_BITS_MIN..=PA_BITS_MAX).contains(&self.pa_bits) {
            return Err(ConfigError::PaBits(self.pa_bits));
        }
        if self.node_frames < MIN_NODE_FRAMES {
            return Err(ConfigError::TooFewFrames { min: MIN_NODE_FRAMES, got: self.node_frames });
        }
        if self.table_base.raw() % PAGE_SIZE != 0 {
            return Err(ConfigError::UnalignedBase(self.table_base));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert_eq!(MmConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_out_of_range_widths() {
        assert_eq!(MmConfig::default().with_pa_bits(31).validate(), Err(ConfigError::PaBits(31)));
        assert_eq!(MmConfig::default().with_pa_bits(49).validate(), Err(ConfigError::PaBits(49)));
    }

    #[test]
    fn rejects_tiny_arena_and_unaligned_base() {
        assert!(matches!(
            MmConfig::default().with_node_frames(4).validate(),
            Err(ConfigError::TooFewFrames { .. })
        ));
        assert_eq!(
            MmConfig::default().with_table_base(PAddr::new(0x123)).validate(),
            Err(ConfigError::UnalignedBase(PAddr::new(0x123)))
        );
    }
}
