// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The ordered `size -> chain of free regions of that size` index that
//! backs one store path.

use std::collections::BTreeMap;

use crate::key::{RegionStatus, TrunkKey, TrunkRegion};

/// One store path's free-region index, ordered by size ascending.
///
/// Each size class holds a LIFO chain: new entries join at the head, and
/// allocation prefers the head of the smallest satisfying class. Order
/// within a class is not part of the documented contract, but is kept
/// deterministic (push/pop at the same end) so tests can assert on it.
#[derive(Debug, Default)]
pub(crate) struct SizeIndex {
    classes: BTreeMap<u32, Vec<TrunkRegion>>,
}

impl SizeIndex {
    pub(crate) fn new() -> Self {
        Self { classes: BTreeMap::new() }
    }

    /// Inserts `region` at the head of its size class.
    pub(crate) fn insert(&mut self, region: TrunkRegion) {
        self.classes.entry(region.size).or_default().push(region);
    }

    /// Finds and removes the first `Free` region in the smallest size
    /// class `>= min_size`, walking up through classes that are
    /// entirely `Held` until one yields a hit.
    ///
    /// This implements steps 2a-2c of `allocate`: iterating
    /// `BTreeMap::range(min_size..)` already visits classes in the same
    /// order as repeatedly bumping the search key to `class.size + 1`,
    /// since there are no size classes to skip over in between.
    pub(crate) fn take_free_at_least(&mut self, min_size: u32) -> Option<TrunkRegion> {
        for (&size, chain) in self.classes.range_mut(min_size..) {
            if let Some(idx) = chain.iter().rposition(|r| r.is_free()) {
                let region = chain.remove(idx);
                if chain.is_empty() {
                    self.classes.remove(&size);
                }
                return Some(region);
            }
        }
        None
    }

    /// Removes the region matching all four coordinates exactly:
    /// `(key, offset, size, status)`.
    pub(crate) fn remove_exact(&mut self, region: &TrunkRegion) -> Option<TrunkRegion> {
        let chain = self.classes.get_mut(&region.size)?;
        let idx = chain.iter().position(|r| {
            r.key == region.key && r.offset == region.offset && r.status == region.status
        })?;
        let removed = chain.remove(idx);
        if chain.is_empty() {
            self.classes.remove(&region.size);
        }
        Some(removed)
    }

    /// Flips the status of the region identified by `(key, offset,
    /// size)`, regardless of its current status. Returns `false` if no
    /// such region is indexed.
    pub(crate) fn set_status(
        &mut self,
        key: TrunkKey,
        offset: u32,
        size: u32,
        status: RegionStatus,
    ) -> bool {
        let Some(chain) = self.classes.get_mut(&size) else {
            return false;
        };
        let Some(r) = chain.iter_mut().find(|r| r.key == key && r.offset == offset) else {
            return false;
        };
        r.status = status;
        true
    }

    /// Iterates every region across every size class, ascending by size
    /// and then by chain order. Used by snapshot traversal.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &TrunkRegion> {
        self.classes.values().flatten()
    }

    #[cfg(test)]
    pub(crate) fn class_len(&self, size: u32) -> usize {
        self.classes.get(&size).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(id: u32, offset: u32, size: u32, status: RegionStatus) -> TrunkRegion {
        TrunkRegion::new(TrunkKey::new(0, 0, 0, id), offset, size, status)
    }

    #[test]
    fn take_free_skips_held_classes() {
        let mut idx = SizeIndex::new();
        idx.insert(region(1, 0, 100, RegionStatus::Held));
        idx.insert(region(1, 200, 200, RegionStatus::Free));
        let picked = idx.take_free_at_least(50).unwrap();
        assert_eq!(picked.size, 200);
        assert_eq!(idx.class_len(100), 1);
        assert_eq!(idx.class_len(200), 0);
    }

    #[test]
    fn take_free_prefers_smallest_satisfying_class() {
        let mut idx = SizeIndex::new();
        idx.insert(region(1, 0, 512, RegionStatus::Free));
        idx.insert(region(2, 512, 1024, RegionStatus::Free));
        let picked = idx.take_free_at_least(256).unwrap();
        assert_eq!(picked.size, 512);
    }

    #[test]
    fn chain_is_lifo() {
        let mut idx = SizeIndex::new();
        idx.insert(region(1, 0, 100, RegionStatus::Free));
        idx.insert(region(2, 100, 100, RegionStatus::Free));
        let picked = idx.take_free_at_least(100).unwrap();
        assert_eq!(picked.key.file_id, 2, "newest addition is served first");
    }

    #[test]
    fn remove_exact_requires_matching_status() {
        let mut idx = SizeIndex::new();
        idx.insert(region(1, 0, 100, RegionStatus::Held));
        let wrong = region(1, 0, 100, RegionStatus::Free);
        assert!(idx.remove_exact(&wrong).is_none());
        let right = region(1, 0, 100, RegionStatus::Held);
        assert!(idx.remove_exact(&right).is_some());
        assert_eq!(idx.class_len(100), 0);
    }

    #[test]
    fn set_status_flips_in_place() {
        let mut idx = SizeIndex::new();
        let key = TrunkKey::new(0, 0, 0, 1);
        idx.insert(TrunkRegion::new(key, 0, 100, RegionStatus::Held));
        assert!(idx.set_status(key, 0, 100, RegionStatus::Free));
        let picked = idx.take_free_at_least(100).unwrap();
        assert!(picked.is_free());
    }
}
