// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rebuilds the free-space index from the snapshot plus the binlog
//! tail. Runs exactly once, before [`crate::TrunkAllocator::open`]
//! marks the allocator `Ready`.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::allocator::TrunkAllocator;
use crate::binlog::{BinlogCodec, BinlogRecord, Op};
use crate::error::{AllocError, Result};
use crate::key::TrunkKey;
use crate::snapshot;
use crate::trunk_io::FileType;

/// A region dropped at startup because `init_check_occupying` found its
/// backing header still marked `Normal`, even though the binlog
/// believed it free.
///
/// Recorded rather than silently discarded: a torn write can leave a
/// live region's header looking reclaimed or vice versa (see the
/// allocator's design notes), so an operator may need to reconcile
/// this list against the metadata server by hand.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DroppedRegion {
    pub key: TrunkKey,
    pub offset: u32,
    pub size: u32,
}

/// The outcome of one `(key, offset)` across the whole replay: survives
/// as free, or was deleted. Tracked per-offset so a later `DEL` cancels
/// an earlier `ADD` regardless of how many store paths are involved.
struct ByOffset {
    records: HashMap<(TrunkKey, u32), BinlogRecord>,
}

impl ByOffset {
    fn new() -> Self {
        Self { records: HashMap::new() }
    }

    fn apply(&mut self, record: BinlogRecord) {
        let locator = (record.key, record.offset);
        match record.op {
            Op::Add => {
                if self.records.insert(locator, record).is_some() {
                    log::warn!(
                        "duplicate ADD during binlog replay for {:?}@{}",
                        record.key,
                        record.offset
                    );
                }
            }
            Op::Del => {
                if self.records.remove(&locator).is_none() {
                    log::warn!(
                        "DEL during binlog replay named a region not currently tracked: {:?}@{}",
                        record.key,
                        record.offset
                    );
                }
            }
        }
    }
}

/// Reads `path` from byte offset `watermark` to EOF, parsing each
/// newline-delimited record. Returns the parsed records plus the
/// file's total length as observed at the moment of reading.
fn read_suffix(path: &Path, watermark: u64) -> Result<(Vec<BinlogRecord>, u64)> {
    let mut file =
        File::open(path).map_err(|e| AllocError::io(format!("open binlog {path:?}"), e))?;
    let len = file
        .metadata()
        .map_err(|e| AllocError::io(format!("stat binlog {path:?}"), e))?
        .len();
    if watermark > len {
        return Ok((Vec::new(), len));
    }
    use std::io::{Seek, SeekFrom};
    file.seek(SeekFrom::Start(watermark))
        .map_err(|e| AllocError::io(format!("seek binlog {path:?}"), e))?;
    let mut tail = String::new();
    file.read_to_string(&mut tail).map_err(|e| AllocError::io(format!("read binlog {path:?}"), e))?;

    let mut records = Vec::new();
    for line in tail.split('\n') {
        if line.is_empty() {
            continue;
        }
        records.push(BinlogCodec::parse(line)?);
    }
    Ok((records, len))
}

/// Runs recovery against `allocator.paths`, populating its `SizeIndex`
/// and `FreeBlockSet` directly (bypassing the binlog, since every
/// region recovery admits is already durable).
pub(crate) fn run(allocator: &TrunkAllocator) -> Result<()> {
    let watermark = if allocator.config.init_reload_from_binlog || !allocator.paths.snapshot_path.exists() {
        0
    } else {
        let contents = snapshot::read(&allocator.paths.snapshot_path)?;
        for record in &contents.records {
            admit(allocator, record)?;
        }
        contents.watermark
    };

    let (suffix, binlog_size) = match File::open(&allocator.paths.binlog_path) {
        Ok(_) => read_suffix(&allocator.paths.binlog_path, watermark)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => (Vec::new(), 0),
        Err(e) => return Err(AllocError::io(format!("open binlog {:?}", allocator.paths.binlog_path), e)),
    };

    if watermark == binlog_size {
        set_next_trunk_id(allocator);
        return Ok(());
    }
    if watermark > binlog_size {
        log::warn!(
            "snapshot watermark {watermark} exceeds binlog length {binlog_size}; resynchronising"
        );
        set_next_trunk_id(allocator);
        return allocator.snapshot_write();
    }

    let mut by_offset = ByOffset::new();
    for record in suffix {
        by_offset.apply(record);
    }
    for record in by_offset.records.values() {
        admit(allocator, record)?;
    }

    set_next_trunk_id(allocator);
    allocator.snapshot_write()?;

    let dropped_count = allocator.dropped_regions.lock().len();
    if dropped_count > 0 {
        log::warn!("recovery dropped {dropped_count} region(s) as still-occupying");
    }
    Ok(())
}

/// Admits `record` (an `ADD`) as a free region, consulting
/// `init_check_occupying` first when configured.
fn admit(allocator: &TrunkAllocator, record: &BinlogRecord) -> Result<()> {
    if allocator.config.init_check_occupying {
        match allocator.trunk_io.read_header(record.key, record.offset) {
            Ok(header) if header.file_type == FileType::Normal => {
                allocator.dropped_regions.lock().push(DroppedRegion {
                    key: record.key,
                    offset: record.offset,
                    size: record.size,
                });
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!(
                    "init_check_occupying: failed to read header for {:?}@{}: {e}",
                    record.key,
                    record.offset
                );
            }
        }
    }
    snapshot::apply_free_add_no_binlog(allocator, record);
    Ok(())
}

/// Sets `next_trunk_file_id` to one past the largest `file_id` observed
/// anywhere in the live index, so newly created trunks never collide
/// with a recovered one. The source persists this counter through a
/// separate config writer; this crate has no such collaborator (it is
/// part of the out-of-scope CLI/config-loader layer), so it is instead
/// recomputed from the recovered state every time.
fn set_next_trunk_id(allocator: &TrunkAllocator) {
    let mem = allocator.mem.lock();
    let max_id = mem
        .size_indexes
        .iter()
        .flat_map(|idx| idx.iter())
        .map(|r| r.key.file_id)
        .max()
        .unwrap_or(0);
    drop(mem);
    let mut file = allocator.file.lock();
    file.next_trunk_file_id = file.next_trunk_file_id.max(max_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{Collaborators, TrunkAllocatorPaths};
    use crate::binlog::FileBinlogWriter;
    use crate::clock::SystemClock;
    use crate::config::TrunkAllocatorConfig;
    use crate::key::ConfirmOutcome;
    use crate::path_picker::RoundRobinPathPicker;
    use crate::trunk_io::StdTrunkFileIo;
    use std::sync::Arc;

    fn config() -> TrunkAllocatorConfig {
        TrunkAllocatorConfig {
            slot_min_size: 256,
            slot_max_size: 64 * 1024 * 1024,
            trunk_file_size: 64 * 1024 * 1024,
            store_path_count: 1,
            create_file_advance: 1,
            create_file_space_threshold: 0,
            compress_binlog_min_interval: 86_400,
            init_check_occupying: false,
            init_reload_from_binlog: false,
        }
    }

    fn open(dir: &Path) -> Arc<TrunkAllocator> {
        open_with_config(dir, config())
    }

    fn open_with_config(dir: &Path, cfg: TrunkAllocatorConfig) -> Arc<TrunkAllocator> {
        let _ = env_logger::try_init();
        let paths = TrunkAllocatorPaths::under_base_dir(dir);
        let collaborators = Collaborators {
            clock: Arc::new(SystemClock),
            trunk_io: Arc::new(StdTrunkFileIo::new(dir)),
            path_picker: Arc::new(RoundRobinPathPicker::new()),
            binlog_writer: Arc::new(FileBinlogWriter::open(&paths.binlog_path).unwrap()),
        };
        TrunkAllocator::open(cfg, paths, collaborators).unwrap()
    }

    #[test]
    fn s5_crash_recover_reconstructs_exact_free_set() {
        let dir = tempfile::tempdir().unwrap();
        {
            let a = open(dir.path());
            let r1 = a.allocate(1024, 0).unwrap();
            a.confirm(r1, ConfirmOutcome::Success).unwrap();
            let r2 = a.allocate(2048, 0).unwrap();
            a.confirm(r2, ConfirmOutcome::Success).unwrap();
            a.release(crate::key::TrunkRegion::new(
                r1.key,
                0,
                1024,
                crate::key::RegionStatus::Free,
            ))
            .unwrap();
            // process "crashes": allocator dropped without snapshotting.
        }

        let a = open(dir.path());
        let mem = a.mem.lock();
        let mut free: Vec<(u32, u32)> =
            mem.size_indexes[0].iter().filter(|r| r.is_free()).map(|r| (r.offset, r.size)).collect();
        free.sort();
        assert_eq!(free, vec![(0, 1024), (3072, 64 * 1024 * 1024 - 3072)]);
    }

    #[test]
    fn recovery_is_idempotent_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        {
            let a = open(dir.path());
            let _ = a.allocate(512, 0).unwrap();
        }
        let a1 = open(dir.path());
        let total1 = a1.total_free_space();
        drop(a1);
        let a2 = open(dir.path());
        assert_eq!(a2.total_free_space(), total1);
    }

    #[test]
    fn held_region_crashed_before_confirm_resurrects_as_free() {
        let dir = tempfile::tempdir().unwrap();
        let r = {
            let a = open(dir.path());
            let r = a.allocate(1024, 0).unwrap();
            // Process "crashes" here: `r` was counted out of the free set
            // and given a surviving binlog ADD (step 8 of `allocate`), but
            // `confirm` never ran to emit the matching DEL.
            r
        };

        let a = open(dir.path());
        let mem = a.mem.lock();
        let free: Vec<(u32, u32)> =
            mem.size_indexes[0].iter().filter(|x| x.is_free()).map(|x| (x.offset, x.size)).collect();
        drop(mem);
        assert!(
            free.contains(&(r.offset, r.size)),
            "held-but-unconfirmed region should resurface as free at the same offset, got {free:?}"
        );
        assert!(a.dropped_regions().is_empty());
    }

    #[test]
    fn confirm_clears_header_so_reused_offset_is_not_dropped_on_recovery() {
        use crate::trunk_io::{FileType, TrunkHeader};

        let mut cfg = config();
        cfg.init_check_occupying = true;
        let dir = tempfile::tempdir().unwrap();
        {
            let a = open_with_config(dir.path(), cfg.clone());

            let r1 = a.allocate(1024, 0).unwrap();
            a.trunk_io
                .write_header(r1.key, r1.offset, TrunkHeader { alloc_size: r1.size, file_type: FileType::Normal })
                .unwrap();
            a.confirm(r1, ConfirmOutcome::Success).unwrap();
            a.release(crate::key::TrunkRegion::new(r1.key, r1.offset, r1.size, crate::key::RegionStatus::Free))
                .unwrap();

            // Same span handed out to a second caller, who writes its own
            // payload and also confirms it.
            let r2 = a.allocate(1024, 0).unwrap();
            assert_eq!(r2.offset, r1.offset);
            a.trunk_io
                .write_header(r2.key, r2.offset, TrunkHeader { alloc_size: r2.size, file_type: FileType::Normal })
                .unwrap();
            a.confirm(r2, ConfirmOutcome::Success).unwrap();
            a.release(crate::key::TrunkRegion::new(r2.key, r2.offset, r2.size, crate::key::RegionStatus::Free))
                .unwrap();
            // process "crashes" before the span is ever reused again.
        }

        let a = open_with_config(dir.path(), cfg);
        assert!(
            a.dropped_regions().is_empty(),
            "a confirmed DEL should have zeroed the header, so init_check_occupying must not drop this region"
        );
        let mem = a.mem.lock();
        assert!(mem.size_indexes[0].iter().any(|x| x.is_free() && x.offset == 0 && x.size == 1024));
    }

    #[test]
    fn malformed_binlog_aborts_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let paths = TrunkAllocatorPaths::under_base_dir(dir.path());
        std::fs::create_dir_all(paths.binlog_path.parent().unwrap()).unwrap();
        std::fs::write(&paths.binlog_path, "not a valid record\n").unwrap();
        let collaborators = Collaborators {
            clock: Arc::new(SystemClock),
            trunk_io: Arc::new(StdTrunkFileIo::new(dir.path())),
            path_picker: Arc::new(RoundRobinPathPicker::new()),
            binlog_writer: Arc::new(FileBinlogWriter::open(&paths.binlog_path).unwrap()),
        };
        assert!(TrunkAllocator::open(config(), paths, collaborators).is_err());
    }
}
