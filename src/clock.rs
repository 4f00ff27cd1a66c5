// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The process-wide clock source the allocator stamps binlog records with.
//!
//! The allocator core never reads the wall clock directly: every call
//! site threads a `&dyn Clock` through, so tests can supply a fake that
//! advances deterministically. [`SystemClock`] is the default, std-backed
//! implementation a host process can hand to [`crate::TrunkAllocator`]
//! when it doesn't care to supply its own.

use std::time::{SystemTime, UNIX_EPOCH};

/// A source of "now", expressed as seconds since the Unix epoch.
///
/// The spec does not require monotonicity: a rewound clock is tolerated,
/// and nothing in this crate compares two timestamps for ordering.
pub trait Clock: Send + Sync {
    /// Returns the current time, in seconds since the Unix epoch.
    fn now_secs(&self) -> u64;
}

/// A [`Clock`] backed by [`SystemTime::now`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}
