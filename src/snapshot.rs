// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Point-in-time dumps of the free-space index, bounding how much
//! binlog a restart has to replay.
//!
//! ```text
//! <binlog_size_bytes>\n
//! <record1>\n
//! <record2>\n
//! ...
//! ```
//!
//! `binlog_size_bytes` is the binlog length at the moment the snapshot
//! begins (the recovery watermark); every subsequent line is an `ADD`
//! record for a currently-`FREE` region. No `DEL` record ever appears
//! in a snapshot.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::allocator::TrunkAllocator;
use crate::binlog::{BinlogCodec, BinlogRecord, Op};
use crate::error::{AllocError, Result};
use crate::key::{RegionStatus, TrunkRegion};

/// The records making up one snapshot, plus its watermark.
pub struct SnapshotContents {
    pub watermark: u64,
    pub records: Vec<BinlogRecord>,
}

/// Reads a snapshot file, without applying it to any allocator.
pub fn read(path: &Path) -> Result<SnapshotContents> {
    let mut file = File::open(path).map_err(|e| AllocError::io(format!("open snapshot {path:?}"), e))?;
    let mut text = String::new();
    file.read_to_string(&mut text)
        .map_err(|e| AllocError::io(format!("read snapshot {path:?}"), e))?;

    if !text.ends_with('\n') {
        return Err(AllocError::corruption(format!(
            "snapshot {path:?} is not newline-terminated"
        )));
    }
    let mut lines = text.trim_end_matches('\n').split('\n');

    let header = lines
        .next()
        .ok_or_else(|| AllocError::corruption(format!("empty snapshot {path:?}")))?;
    let watermark: u64 = header
        .trim()
        .parse()
        .map_err(|_| AllocError::corruption(format!("bad snapshot watermark: {header:?}")))?;

    let mut records = Vec::new();
    for line in lines {
        let record = BinlogCodec::parse(line)?;
        if record.op != Op::Add {
            return Err(AllocError::corruption(format!(
                "snapshot {path:?} contains a non-ADD record: {line:?}"
            )));
        }
        records.push(record);
    }
    Ok(SnapshotContents { watermark, records })
}

impl TrunkAllocator {
    /// Writes a fresh snapshot to `self.paths.snapshot_path`, bounding
    /// it at the binlog length observed when the walk begins.
    ///
    /// All tree traversal happens under `mem_lock`; the write itself
    /// goes to a `.tmp` sibling, is `fsync`'d, and is renamed over the
    /// canonical path, so a crash mid-write leaves the previous
    /// snapshot intact.
    pub fn snapshot_write(&self) -> Result<()> {
        self.snapshot_write_to(&self.paths.snapshot_path)
    }

    pub(crate) fn snapshot_write_to(&self, path: &Path) -> Result<()> {
        let watermark = self.binlog_writer.len()?;
        let mem = self.mem.lock();

        let tmp_path: PathBuf = tmp_path_for(path);
        let mut tmp = File::create(&tmp_path)
            .map_err(|e| AllocError::io(format!("create snapshot tmp {tmp_path:?}"), e))?;
        writeln!(tmp, "{watermark}")
            .map_err(|e| AllocError::io(format!("write snapshot header {tmp_path:?}"), e))?;

        for size_index in &mem.size_indexes {
            for region in size_index.iter() {
                if region.status != RegionStatus::Free {
                    continue;
                }
                let record =
                    BinlogRecord::add(self.clock.now_secs(), region.key, region.offset, region.size);
                let line = BinlogCodec::format(&record);
                writeln!(tmp, "{line}")
                    .map_err(|e| AllocError::io(format!("write snapshot record {tmp_path:?}"), e))?;
            }
        }
        drop(mem);

        tmp.sync_all().map_err(|e| AllocError::io(format!("fsync snapshot tmp {tmp_path:?}"), e))?;
        drop(tmp);
        std::fs::rename(&tmp_path, path)
            .map_err(|e| AllocError::io(format!("rename snapshot tmp into {path:?}"), e))?;
        Ok(())
    }
}

/// `<snapshot>.tmp`, as a sibling of `path` rather than a fixed literal
/// name, so callers pointing at nonstandard snapshot paths (tests) get
/// a correctly-colocated temp file too.
fn tmp_path_for(path: &Path) -> PathBuf {
    let file_name = path.file_name().map(|n| format!(".{}.tmp", n.to_string_lossy())).unwrap_or_else(|| ".snapshot.tmp".to_string());
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(file_name),
        _ => PathBuf::from(file_name),
    }
}

/// Applies every record in `contents` directly to `mem`/counters,
/// *without* writing any binlog record -- used by both snapshot read
/// and the post-replay transfer in recovery.
pub(crate) fn apply_free_add_no_binlog(allocator: &TrunkAllocator, record: &BinlogRecord) {
    debug_assert_eq!(record.op, Op::Add);
    let path_index = record.key.store_path_index;
    let region = TrunkRegion::new(record.key, record.offset, record.size, RegionStatus::Free);
    let mut mem = allocator.mem.lock();
    mem.size_indexes[path_index as usize].insert(region);
    mem.free_set.insert(region.key, region.offset);
    drop(mem);
    allocator.file.lock().total_free_space += region.size as i64;
}
