// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration the embedding host supplies to a [`crate::TrunkAllocator`].
//!
//! This crate parses no configuration file and reads no environment
//! variables of its own -- that belongs to the CLI/config-loader layer,
//! which is out of scope here. What it does do is validate the values
//! it is handed, since a malformed config can otherwise corrupt the
//! free-space index in ways that only surface much later.

use crate::error::{AllocError, Result};

/// Tunables the allocator core observes.
///
/// Every field here corresponds to one of the configuration inputs
/// named in the external-interfaces section of the design: nothing is
/// invented, and nothing the core needs is left for a caller to
/// rediscover.
#[derive(Clone, Copy, Debug)]
pub struct TrunkAllocatorConfig {
    /// Regions smaller than this are not worth tracking; `release`
    /// silently drops them and `split` prefers to over-allocate rather
    /// than leave a sliver this small behind.
    pub slot_min_size: u32,
    /// The largest region the allocator will ever hand out or index.
    pub slot_max_size: u32,
    /// The fixed size of every backing trunk file, typically 64 MiB.
    pub trunk_file_size: u32,
    /// The number of configured storage roots; valid `path_index`
    /// values to `allocate`/`precreate` are `0..store_path_count`.
    pub store_path_count: u8,
    /// How many trunk files' worth of free space `precreate` tries to
    /// keep in reserve (used by a host's own advance-creation scheduler
    /// as a second knob alongside `create_file_space_threshold`).
    pub create_file_advance: u32,
    /// The `total_free_space` floor `precreate` maintains.
    pub create_file_space_threshold: i64,
    /// Minimum seconds between two `Compactor` runs.
    pub compress_binlog_min_interval: u64,
    /// If set, recovery consults `TrunkFileIo::check_header` before
    /// re-admitting a region as free, to catch torn writes that left a
    /// region looking free when its backing bytes are still live data.
    pub init_check_occupying: bool,
    /// If set, recovery ignores any snapshot and replays the binlog
    /// from byte zero.
    pub init_reload_from_binlog: bool,
}

impl TrunkAllocatorConfig {
    /// Validates the config, returning `InvalidArgument` if the fields
    /// are mutually inconsistent.
    pub fn validate(&self) -> Result<()> {
        if self.slot_min_size == 0 {
            return Err(AllocError::invalid_argument("slot_min_size must be nonzero"));
        }
        if self.slot_min_size > self.slot_max_size {
            return Err(AllocError::invalid_argument(format!(
                "slot_min_size ({}) exceeds slot_max_size ({})",
                self.slot_min_size, self.slot_max_size
            )));
        }
        if self.slot_max_size > self.trunk_file_size {
            return Err(AllocError::invalid_argument(format!(
                "slot_max_size ({}) exceeds trunk_file_size ({})",
                self.slot_max_size, self.trunk_file_size
            )));
        }
        if self.store_path_count == 0 {
            return Err(AllocError::invalid_argument("store_path_count must be nonzero"));
        }
        if self.trunk_file_size == 0 {
            return Err(AllocError::invalid_argument("trunk_file_size must be nonzero"));
        }
        Ok(())
    }

    /// Returns `Ok(())` if `path_index` is a valid index into the
    /// configured store paths.
    pub(crate) fn check_path_index(&self, path_index: u8) -> Result<()> {
        if path_index as usize >= self.store_path_count as usize {
            return Err(AllocError::invalid_argument(format!(
                "path_index {path_index} out of range (store_path_count = {})",
                self.store_path_count
            )));
        }
        Ok(())
    }
}
