// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Value types identifying a trunk file and a packed region within it.

use static_assertions::const_assert;

/// Uniquely identifies a backing trunk file.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TrunkKey {
    /// Which configured storage root holds this trunk.
    pub store_path_index: u8,
    /// High byte of the two-level subdirectory coordinate.
    pub sub_path_high: u8,
    /// Low byte of the two-level subdirectory coordinate.
    pub sub_path_low: u8,
    /// Monotonically issued trunk identifier, persisted across restarts.
    pub file_id: u32,
}

impl TrunkKey {
    pub fn new(store_path_index: u8, sub_path_high: u8, sub_path_low: u8, file_id: u32) -> Self {
        Self { store_path_index, sub_path_high, sub_path_low, file_id }
    }
}

/// Whether a region is available for `allocate` or reserved by a caller.
///
/// Never persisted directly: recovery always reconstructs regions as
/// `Free`. A region that crashed mid-`Held` still has a surviving binlog
/// `ADD` (written durably before the caller's payload I/O even begins),
/// so recovery resurrects it as free rather than leaking it -- the
/// in-memory `Held` bit exists only to keep it out of `allocate`'s
/// search and out of `total_free_space` until `confirm` settles it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegionStatus {
    Free,
    Held,
}

/// A contiguous byte-range inside a trunk file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TrunkRegion {
    pub key: TrunkKey,
    pub offset: u32,
    pub size: u32,
    pub status: RegionStatus,
}

impl TrunkRegion {
    pub fn new(key: TrunkKey, offset: u32, size: u32, status: RegionStatus) -> Self {
        Self { key, offset, size, status }
    }

    /// The `(key, offset)` pair that identifies this region in
    /// [`crate::free_set::FreeBlockSet`].
    pub fn locator(&self) -> (TrunkKey, u32) {
        (self.key, self.offset)
    }

    pub fn end(&self) -> u32 {
        self.offset + self.size
    }

    pub fn is_free(&self) -> bool {
        self.status == RegionStatus::Free
    }
}

/// The disposition of a region after the caller's payload I/O settles.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConfirmOutcome {
    /// The payload write succeeded; the region is consumed permanently.
    Success,
    /// The region was found to already hold live data; expunge it too.
    AlreadyOccupied,
    /// The payload write failed; the region reverts to `Free`.
    Failed,
}

// A `TrunkRegion` is small enough to pass and return by value throughout
// the public API without the caller reaching for a reference.
const_assert!(core::mem::size_of::<TrunkRegion>() <= 24);
