// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The external collaborator that chooses which configured storage root
//! a freshly created trunk file should land on.

use std::sync::atomic::{AtomicU8, Ordering};

/// Returns a store-path index for a new trunk.
///
/// The allocator core calls this only from [`crate::TrunkAllocator::precreate`]
/// and from trunk creation triggered by an empty `allocate`; it never
/// second-guesses the choice.
pub trait PathPicker: Send + Sync {
    /// Returns the index of the store path to use next, in
    /// `0..store_path_count`.
    fn next_path(&self, store_path_count: u8) -> u8;
}

/// A [`PathPicker`] that cycles through `0..store_path_count` in order.
#[derive(Debug, Default)]
pub struct RoundRobinPathPicker {
    next: AtomicU8,
}

impl RoundRobinPathPicker {
    pub fn new() -> Self {
        Self { next: AtomicU8::new(0) }
    }
}

impl PathPicker for RoundRobinPathPicker {
    fn next_path(&self, store_path_count: u8) -> u8 {
        debug_assert!(store_path_count > 0);
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(if cur + 1 >= store_path_count { 0 } else { cur + 1 })
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycles_through_all_paths() {
        let picker = RoundRobinPathPicker::new();
        let picked: Vec<u8> = (0..5).map(|_| picker.next_path(3)).collect();
        assert_eq!(picked, vec![0, 1, 2, 0, 1]);
    }
}
