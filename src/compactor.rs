// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Periodically rewrites the binlog down to just the records a fresh
//! snapshot already represents, so recovery never has to replay more
//! than one compaction interval's worth of history.

use crate::allocator::TrunkAllocator;
use crate::binlog::BinlogRecord;
use crate::error::{AllocError, Result};
use crate::key::RegionStatus;

/// Drives one compaction through its four-step protocol. A single
/// instance is good for one run: `apply` captures the working set,
/// `commit` (or `rollback`) consumes it.
pub struct Compactor<'a> {
    allocator: &'a TrunkAllocator,
    working: Option<Vec<BinlogRecord>>,
}

impl<'a> Compactor<'a> {
    pub fn new(allocator: &'a TrunkAllocator) -> Self {
        Self { allocator, working: None }
    }

    /// Snapshots every currently-`Free` region as the `ADD` record set
    /// the compacted binlog will contain. Reads the live index under
    /// `mem_lock`; the live binlog is untouched and keeps accepting
    /// writes for every `allocate`/`release`/`confirm` that runs
    /// concurrently with the rest of this protocol.
    pub fn apply(&mut self) -> Result<()> {
        let mem = self.allocator.mem.lock();
        let mut records = Vec::new();
        for size_index in &mem.size_indexes {
            for region in size_index.iter() {
                if region.status != RegionStatus::Free {
                    continue;
                }
                records.push(BinlogRecord::add(
                    self.allocator.clock.now_secs(),
                    region.key,
                    region.offset,
                    region.size,
                ));
            }
        }
        drop(mem);
        self.working = Some(records);
        Ok(())
    }

    /// Writes a fresh snapshot reflecting the state `apply` captured.
    /// The allocator's own `total_free_space` may have moved on since
    /// then; that is fine, since the snapshot's watermark always refers
    /// to the binlog length at the moment it is written, not to
    /// whatever `apply` saw.
    pub fn snapshot_write(&self) -> Result<()> {
        self.allocator.snapshot_write()
    }

    /// Atomically replaces the live binlog with the working set and
    /// advances `last_compress_time`. Consumes the working set; calling
    /// `commit` twice without an intervening `apply` is a programming
    /// error.
    pub fn commit(&mut self) -> Result<()> {
        let records = self
            .working
            .take()
            .ok_or_else(|| AllocError::invalid_argument("compactor commit called before apply"))?;
        self.allocator.binlog_writer.compact(&records)?;
        let now = self.allocator.clock.now_secs();
        self.allocator.file.lock().last_compress_time = now;
        Ok(())
    }

    /// Discards the working set. The live binlog was never touched
    /// before `commit`, so there is nothing else to undo.
    pub fn rollback(&mut self) {
        self.working = None;
    }

    /// The scheduling entry point: no-ops (returning `Ok(false)`) if
    /// `compress_binlog_min_interval` has not elapsed since the last
    /// run, so a host can call this on every tick of its own timer
    /// without reimplementing interval bookkeeping. Runs the full
    /// protocol and rolls back on any failure.
    pub fn maybe_run(allocator: &'a TrunkAllocator) -> Result<bool> {
        let now = allocator.clock.now_secs();
        let last = allocator.file.lock().last_compress_time;
        if now.saturating_sub(last) < allocator.config.compress_binlog_min_interval {
            return Ok(false);
        }
        let mut compactor = Self::new(allocator);
        let outcome = compactor.apply().and_then(|_| compactor.snapshot_write()).and_then(|_| compactor.commit());
        match outcome {
            Ok(()) => Ok(true),
            Err(e) => {
                compactor.rollback();
                Err(e)
            }
        }
    }
}
