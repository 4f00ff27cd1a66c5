// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `TrunkAllocator`: the orchestrator that owns every `SizeIndex`, the
//! `FreeBlockSet`, and the two locks guarding them, and funnels every
//! mutation through the binlog.
//!
//! Snapshot I/O, recovery, and compaction are substantial enough to
//! live in their own modules ([`crate::snapshot`], [`crate::recovery`],
//! [`crate::compactor`]); all three extend this type with more `impl`
//! blocks rather than reaching into it from the outside, since they
//! need the same lock discipline this module enforces.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::binlog::{BinlogRecord, BinlogWriter};
use crate::clock::Clock;
use crate::config::TrunkAllocatorConfig;
use crate::error::{AllocError, Result};
use crate::free_set::FreeBlockSet;
use crate::key::{ConfirmOutcome, RegionStatus, TrunkKey, TrunkRegion};
use crate::path_picker::PathPicker;
use crate::size_index::SizeIndex;
use crate::trunk_io::{sub_path_coords, trunk_token, TrunkFileIo};

const NOT_READY: u8 = 0;
const READY: u8 = 1;
const SHUTTING_DOWN: u8 = 2;

/// Everything `mem_lock` guards: the per-path size indexes and the
/// cross-path free-block membership set.
#[derive(Debug, Default)]
pub(crate) struct MemState {
    pub(crate) size_indexes: Vec<SizeIndex>,
    pub(crate) free_set: FreeBlockSet,
}

impl MemState {
    fn new(store_path_count: u8) -> Self {
        Self {
            size_indexes: (0..store_path_count).map(|_| SizeIndex::new()).collect(),
            free_set: FreeBlockSet::new(),
        }
    }

    fn insert_free(&mut self, path_index: u8, region: TrunkRegion) {
        self.free_set.insert(region.key, region.offset);
        self.size_indexes[path_index as usize].insert(region);
    }

    pub(crate) fn remove_exact(&mut self, path_index: u8, region: &TrunkRegion) -> Option<TrunkRegion> {
        let removed = self.size_indexes[path_index as usize].remove_exact(region)?;
        self.free_set.remove(removed.key, removed.offset);
        Some(removed)
    }
}

/// Everything `file_lock` guards: the trunk id counter, the running
/// free-space total, and the compaction clock.
#[derive(Debug, Default)]
pub(crate) struct FileState {
    pub(crate) next_trunk_file_id: u32,
    pub(crate) total_free_space: i64,
    pub(crate) last_compress_time: u64,
}

/// The collaborators an embedding host supplies to a [`TrunkAllocator`].
pub struct Collaborators {
    pub clock: Arc<dyn Clock>,
    pub trunk_io: Arc<dyn TrunkFileIo>,
    pub path_picker: Arc<dyn PathPicker>,
    pub binlog_writer: Arc<dyn BinlogWriter>,
}

/// The on-disk paths a [`TrunkAllocator`] reads and writes.
#[derive(Clone, Debug)]
pub struct TrunkAllocatorPaths {
    pub snapshot_path: PathBuf,
    pub binlog_path: PathBuf,
}

impl TrunkAllocatorPaths {
    /// The canonical layout under `base_dir`, matching the paths the
    /// storage server itself uses: `data/storage_trunk.dat` and
    /// `data/trunk.binlog`.
    pub fn under_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            snapshot_path: base_dir.join("data").join("storage_trunk.dat"),
            binlog_path: base_dir.join("data").join("trunk.binlog"),
        }
    }
}

/// Packs many small user files into a small set of large trunk files,
/// tracking free regions by size and persisting every mutation to an
/// append-only binlog.
///
/// All public operations require the allocator to have completed
/// recovery; [`TrunkAllocator::open`] runs recovery before returning,
/// so a successfully constructed instance is always `Ready`.
pub struct TrunkAllocator {
    pub(crate) config: TrunkAllocatorConfig,
    pub(crate) mem: Mutex<MemState>,
    pub(crate) file: Mutex<FileState>,
    pub(crate) ready: AtomicU8,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) trunk_io: Arc<dyn TrunkFileIo>,
    pub(crate) path_picker: Arc<dyn PathPicker>,
    pub(crate) binlog_writer: Arc<dyn BinlogWriter>,
    pub(crate) paths: TrunkAllocatorPaths,
    pub(crate) dropped_regions: Mutex<Vec<crate::recovery::DroppedRegion>>,
}

/// Errors specific to `allocate`, layered over the shared [`AllocError`]
/// taxonomy so `OutOfSpace` (no class satisfies the request and no new
/// trunk can be created) is reachable without inventing a parallel
/// error type.
pub type AllocResult<T> = Result<T>;

impl TrunkAllocator {
    /// Constructs an allocator over `config` and `collaborators`,
    /// running recovery against `paths` before returning. Equivalent to
    /// the source's startup sequence: load snapshot, replay binlog
    /// tail, mark `Ready`.
    pub fn open(
        config: TrunkAllocatorConfig,
        paths: TrunkAllocatorPaths,
        collaborators: Collaborators,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let allocator = Arc::new(Self {
            mem: Mutex::new(MemState::new(config.store_path_count)),
            file: Mutex::new(FileState { next_trunk_file_id: 0, total_free_space: 0, last_compress_time: 0 }),
            ready: AtomicU8::new(NOT_READY),
            clock: collaborators.clock,
            trunk_io: collaborators.trunk_io,
            path_picker: collaborators.path_picker,
            binlog_writer: collaborators.binlog_writer,
            paths,
            config,
            dropped_regions: Mutex::new(Vec::new()),
        });
        crate::recovery::run(&allocator)?;
        allocator.ready.store(READY, Ordering::Release);
        Ok(allocator)
    }

    /// The regions recovery dropped at startup because
    /// `init_check_occupying` found their backing header still marked
    /// `Normal` even though the binlog believed them free. Empty unless
    /// that option is set and a crash actually left such a region
    /// behind.
    pub fn dropped_regions(&self) -> Vec<crate::recovery::DroppedRegion> {
        self.dropped_regions.lock().clone()
    }

    /// Begins shutdown: every subsequent public operation fails with
    /// `NotReady`. Irreversible; there is no way back to `Ready`.
    pub fn begin_shutdown(&self) {
        self.ready.store(SHUTTING_DOWN, Ordering::Release);
    }

    pub(crate) fn require_ready(&self) -> Result<()> {
        if self.ready.load(Ordering::Acquire) == READY {
            Ok(())
        } else {
            Err(AllocError::not_ready("allocator is not ready"))
        }
    }

    /// The live sum of all `FREE` region sizes.
    pub fn total_free_space(&self) -> i64 {
        self.file.lock().total_free_space
    }

    /// Allocates a region of at least `requested_size` bytes from store
    /// path `path_index`, creating a new trunk if no existing free
    /// region satisfies the request.
    ///
    /// `total_free_space` reflects only regions currently `Free`: the
    /// region this returns is `Held` and is therefore excluded from it
    /// the moment this call returns, even though its binlog `ADD` (step
    /// 8 below) makes it durable so an uncommitted allocation is not
    /// lost to a crash.
    pub fn allocate(&self, requested_size: u32, path_index: u8) -> AllocResult<TrunkRegion> {
        self.require_ready()?;
        if requested_size == 0 {
            return Err(AllocError::invalid_argument("requested_size must be nonzero"));
        }
        self.config.check_path_index(path_index)?;

        let search = requested_size.max(self.config.slot_min_size);
        let mut mem = self.mem.lock();

        let picked = match mem.size_indexes[path_index as usize].take_free_at_least(search) {
            Some(region) => {
                mem.free_set.remove(region.key, region.offset);
                region
            }
            None => self.create_trunk_locked(path_index)?,
        };

        let head = self.split_locked(&mut mem, path_index, picked, requested_size)?;

        let mut held = head;
        held.status = RegionStatus::Held;
        mem.insert_free(path_index, held);
        self.emit_held_add(held)?;

        Ok(held)
    }

    /// Splits `region` (a `Free` region already removed from both
    /// indexes) at `requested_size`, installing the free tail (if any)
    /// and returning the head that the caller will mark `Held`.
    fn split_locked(
        &self,
        mem: &mut MemState,
        path_index: u8,
        region: TrunkRegion,
        requested_size: u32,
    ) -> Result<TrunkRegion> {
        let remainder = region.size - requested_size;
        self.emit_free_del(region)?;
        if remainder < self.config.slot_min_size {
            return Ok(TrunkRegion::new(region.key, region.offset, region.size, RegionStatus::Held));
        }
        let tail = TrunkRegion::new(
            region.key,
            region.offset + requested_size,
            remainder,
            RegionStatus::Free,
        );
        mem.insert_free(path_index, tail);
        self.emit_free_add(tail)?;
        Ok(TrunkRegion::new(region.key, region.offset, requested_size, RegionStatus::Held))
    }

    /// Creates a new trunk file on `path_index` and returns its
    /// whole-file `Free` region, already accounted for in
    /// `total_free_space` and durably `ADD`ed -- but *not yet* inserted
    /// into `SizeIndex`/`FreeBlockSet`. Callers that immediately split
    /// the result (`allocate`) never need to index it only to remove it
    /// again a moment later; callers that keep it whole (`precreate`)
    /// index it themselves. Called with `mem_lock` held (not used
    /// directly here, but trunk creation must be serialized with the
    /// rest of the critical section it is part of).
    fn create_trunk_locked(&self, path_index: u8) -> Result<TrunkRegion> {
        loop {
            let file_id = {
                let mut file = self.file.lock();
                file.next_trunk_file_id = file.next_trunk_file_id.wrapping_add(1);
                file.next_trunk_file_id
            };
            let token = trunk_token(file_id);
            let (sub_path_high, sub_path_low) = sub_path_coords(&token);
            let key = TrunkKey::new(path_index, sub_path_high, sub_path_low, file_id);
            if self.trunk_io.exists(key)? {
                log::warn!("trunk id {file_id} collided with an existing file; reissuing");
                continue;
            }
            self.trunk_io.create(key, self.config.trunk_file_size)?;
            let region = TrunkRegion::new(key, 0, self.config.trunk_file_size, RegionStatus::Free);
            self.emit_free_add(region)?;
            return Ok(region);
        }
    }

    /// Frees space previously occupied by a now-deleted user file.
    pub fn release(&self, region: TrunkRegion) -> AllocResult<()> {
        self.require_ready()?;
        if region.size < self.config.slot_min_size {
            log::debug!("dropping release of undersized region ({} bytes)", region.size);
            return Ok(());
        }
        let path_index = region.key.store_path_index;
        self.config.check_path_index(path_index)?;
        let mut mem = self.mem.lock();
        if mem.free_set.contains(region.key, region.offset) {
            return Err(AllocError::duplicate(format!(
                "region {:?}@{} already free",
                region.key, region.offset
            )));
        }
        let region = TrunkRegion::new(region.key, region.offset, region.size, RegionStatus::Free);
        mem.insert_free(path_index, region);
        self.emit_free_add(region)
    }

    /// Resolves the fate of a region previously returned by `allocate`.
    pub fn confirm(&self, region: TrunkRegion, outcome: ConfirmOutcome) -> AllocResult<()> {
        self.require_ready()?;
        let path_index = region.key.store_path_index;
        self.config.check_path_index(path_index)?;
        match outcome {
            ConfirmOutcome::Success | ConfirmOutcome::AlreadyOccupied => {
                let held = TrunkRegion::new(region.key, region.offset, region.size, RegionStatus::Held);
                let mut mem = self.mem.lock();
                match mem.remove_exact(path_index, &held) {
                    // The head was never counted as `Free`, so deleting
                    // it only needs to cancel its earlier binlog `ADD`
                    // (step 8 of `allocate`), not touch the counter.
                    // The header is zeroed before the binlog catches up
                    // so a region reusing this offset is never judged
                    // against a stale `Normal` byte left by the payload
                    // that just vacated it.
                    Some(_) => {
                        self.trunk_io.delete_region(held.key, held.offset, held.size)?;
                        self.emit_held_del(held)
                    }
                    None => {
                        log::warn!(
                            "confirm({:?}) named a region not currently indexed: {:?}@{}",
                            outcome,
                            region.key,
                            region.offset
                        );
                        Ok(())
                    }
                }
            }
            ConfirmOutcome::Failed => {
                let mut mem = self.mem.lock();
                let ok = mem.size_indexes[path_index as usize].set_status(
                    region.key,
                    region.offset,
                    region.size,
                    RegionStatus::Free,
                );
                if ok {
                    // No binlog write: the region's `ADD` from step 8
                    // is already durable and un-deleted, so nothing
                    // about the binlog needs to change; only the
                    // in-memory Held->Free transition (and the counter
                    // it had been excluded from) does.
                    self.file.lock().total_free_space += region.size as i64;
                } else {
                    log::warn!(
                        "confirm(Failed) named a region not currently indexed: {:?}@{}",
                        region.key,
                        region.offset
                    );
                }
                Ok(())
            }
        }
    }

    /// Ensures `total_free_space` stays above `create_file_space_threshold`,
    /// creating whole-file trunks as needed. Returns the number of
    /// trunks created.
    pub fn precreate(&self) -> AllocResult<u32> {
        self.require_ready()?;
        let deficit = {
            let file = self.file.lock();
            self.config.create_file_space_threshold - file.total_free_space
        };
        if deficit <= 0 {
            return Ok(0);
        }
        let trunk_size = self.config.trunk_file_size as i64;
        let count = deficit.div_ceil(trunk_size).max(1) as u32;

        let mut created = 0;
        let mut mem = self.mem.lock();
        for _ in 0..count {
            let path_index = self.path_picker.next_path(self.config.store_path_count);
            let headroom = self.trunk_io.available_space(path_index)?;
            if (headroom as i64) < trunk_size {
                return Err(AllocError::out_of_space(format!(
                    "store path {path_index} has {headroom} bytes free, need {trunk_size}"
                )));
            }
            let region = self.create_trunk_locked(path_index)?;
            mem.insert_free(path_index, region);
            created += 1;
        }
        Ok(created)
    }

    /// A region just became `Free` (trunk creation, a split tail,
    /// `release`): bumps `total_free_space` and durably `ADD`s it.
    pub(crate) fn emit_free_add(&self, region: TrunkRegion) -> Result<()> {
        self.file.lock().total_free_space += region.size as i64;
        let record = BinlogRecord::add(self.clock.now_secs(), region.key, region.offset, region.size);
        self.binlog_writer.append(&record)
    }

    /// A `Free` region just stopped being free (split consuming its
    /// pre-split parent): decrements `total_free_space` and durably
    /// `DEL`s it.
    pub(crate) fn emit_free_del(&self, region: TrunkRegion) -> Result<()> {
        self.file.lock().total_free_space -= region.size as i64;
        let record = BinlogRecord::del(self.clock.now_secs(), region.key, region.offset, region.size);
        self.binlog_writer.append(&record)
    }

    /// Durably `ADD`s a region that is `Held`, not `Free` -- step 8 of
    /// `allocate`. Never touches `total_free_space`: the point is
    /// purely so a crash before `confirm` leaves a surviving `ADD` that
    /// recovery resurrects as free, rather than leaking the space.
    pub(crate) fn emit_held_add(&self, region: TrunkRegion) -> Result<()> {
        let record = BinlogRecord::add(self.clock.now_secs(), region.key, region.offset, region.size);
        self.binlog_writer.append(&record)
    }

    /// Durably `DEL`s a region that was `Held` (never counted in
    /// `total_free_space`), canceling its earlier [`Self::emit_held_add`].
    pub(crate) fn emit_held_del(&self, region: TrunkRegion) -> Result<()> {
        let record = BinlogRecord::del(self.clock.now_secs(), region.key, region.offset, region.size);
        self.binlog_writer.append(&record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::path_picker::RoundRobinPathPicker;
    use crate::trunk_io::{FileType, StdTrunkFileIo, TrunkHeader};
    use crate::binlog::FileBinlogWriter;

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

    fn open(dir: &std::path::Path) -> Arc<TrunkAllocator> {
        let _ = env_logger::try_init();
        let paths = TrunkAllocatorPaths::under_base_dir(dir);
        let collaborators = Collaborators {
            clock: Arc::new(SystemClock),
            trunk_io: Arc::new(StdTrunkFileIo::new(dir)),
            path_picker: Arc::new(RoundRobinPathPicker::new()),
            binlog_writer: Arc::new(FileBinlogWriter::open(&paths.binlog_path).unwrap()),
        };
        TrunkAllocator::open(config(), paths, collaborators).unwrap()
    }

    #[test]
    fn s1_allocate_from_empty_creates_trunk() {
        let dir = tempfile::tempdir().unwrap();
        let a = open(dir.path());
        let r = a.allocate(1024, 0).unwrap();
        assert_eq!(r.offset, 0);
        assert_eq!(r.size, 1024);
        assert_eq!(r.key.file_id, 1);
        assert_eq!(a.total_free_space(), 64 * 1024 * 1024 - 1024);
    }

    #[test]
    fn s2_split_tail_is_reused_from_same_trunk() {
        let dir = tempfile::tempdir().unwrap();
        let a = open(dir.path());
        let r1 = a.allocate(1024, 0).unwrap();
        let r2 = a.allocate(2048, 0).unwrap();
        assert_eq!(r2.key, r1.key);
        assert_eq!(r2.offset, 1024);
        assert_eq!(r2.size, 2048);
    }

    #[test]
    fn s3_undersized_tail_consumes_whole_region() {
        let dir = tempfile::tempdir().unwrap();
        let a = open(dir.path());
        let huge = 64 * 1024 * 1024 - 100;
        let r = a.allocate(huge, 0).unwrap();
        assert_eq!(r.size, 64 * 1024 * 1024);
    }

    #[test]
    fn s4_release_does_not_coalesce() {
        // `release` frees space occupied by a deleted *user file*, so
        // r1 must already have been confirmed before it can be
        // released again under a new (coincidentally identical) span.
        let dir = tempfile::tempdir().unwrap();
        let a = open(dir.path());
        let r1 = a.allocate(1024, 0).unwrap();
        a.confirm(r1, ConfirmOutcome::Success).unwrap();
        let _r2 = a.allocate(2048, 0).unwrap();
        a.release(TrunkRegion::new(r1.key, 0, 1024, RegionStatus::Free)).unwrap();
        let mem = a.mem.lock();
        assert_eq!(mem.size_indexes[0].class_len(1024), 1);
    }

    #[test]
    fn s6_confirm_failed_restores_region() {
        let dir = tempfile::tempdir().unwrap();
        let a = open(dir.path());
        let r = a.allocate(512, 0).unwrap();
        a.confirm(r, ConfirmOutcome::Failed).unwrap();
        let r2 = a.allocate(512, 0).unwrap();
        assert_eq!(r2.offset, r.offset);
        assert_eq!(r2.key, r.key);
    }

    #[test]
    fn confirm_success_zeroes_trunk_header() {
        // The storage I/O layer would have written a `Normal` header
        // when it wrote the user's payload into the held region; confirm
        // must zero it back out so a later occupant of this offset isn't
        // mistaken for still-live data by `init_check_occupying`.
        let dir = tempfile::tempdir().unwrap();
        let a = open(dir.path());
        let r = a.allocate(1024, 0).unwrap();
        a.trunk_io
            .write_header(r.key, r.offset, TrunkHeader { alloc_size: r.size, file_type: FileType::Normal })
            .unwrap();
        a.confirm(r, ConfirmOutcome::Success).unwrap();
        let header = a.trunk_io.read_header(r.key, r.offset).unwrap();
        assert_eq!(header.file_type, FileType::None);
    }

    #[test]
    fn confirm_already_occupied_also_zeroes_trunk_header() {
        let dir = tempfile::tempdir().unwrap();
        let a = open(dir.path());
        let r = a.allocate(1024, 0).unwrap();
        a.trunk_io
            .write_header(r.key, r.offset, TrunkHeader { alloc_size: r.size, file_type: FileType::Normal })
            .unwrap();
        a.confirm(r, ConfirmOutcome::AlreadyOccupied).unwrap();
        let header = a.trunk_io.read_header(r.key, r.offset).unwrap();
        assert_eq!(header.file_type, FileType::None);
    }

    #[test]
    fn allocate_before_ready_fails() {
        let dir = tempfile::tempdir().unwrap();
        let paths = TrunkAllocatorPaths::under_base_dir(dir.path());
        let a = TrunkAllocator {
            config: config(),
            mem: Mutex::new(MemState::new(1)),
            file: Mutex::new(FileState::default()),
            ready: AtomicU8::new(NOT_READY),
            clock: Arc::new(SystemClock),
            trunk_io: Arc::new(StdTrunkFileIo::new(dir.path())),
            path_picker: Arc::new(RoundRobinPathPicker::new()),
            binlog_writer: Arc::new(FileBinlogWriter::open(&paths.binlog_path).unwrap()),
            paths,
            dropped_regions: Mutex::new(Vec::new()),
        };
        assert!(matches!(a.allocate(10, 0), Err(AllocError::NotReady(_))));
    }

    #[test]
    fn release_rejects_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let a = open(dir.path());
        let r = a.allocate(1024, 0).unwrap();
        a.confirm(r, ConfirmOutcome::Failed).unwrap();
        let dup = TrunkRegion::new(r.key, r.offset, r.size, RegionStatus::Free);
        // Region is already Free+indexed (from confirm(Failed)) so the
        // free set already contains its locator.
        assert!(matches!(a.release(dup), Err(AllocError::Duplicate(_))));
    }

    #[test]
    fn release_below_slot_min_is_silently_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let a = open(dir.path());
        let key = TrunkKey::new(0, 0, 0, 999);
        let tiny = TrunkRegion::new(key, 0, 10, RegionStatus::Free);
        assert!(a.release(tiny).is_ok());
        assert!(!a.mem.lock().free_set.contains(key, 0));
    }
}
