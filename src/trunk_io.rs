// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The external collaborator that owns the backing trunk files on disk:
//! creating and preallocating them, and reading/writing the 8-byte
//! header the allocator uses to mark a region reclaimable.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::error::{AllocError, Result};
use crate::key::TrunkKey;

/// How long trunk preallocation waits for a sibling thread that lost
/// the creation race to finish sizing the file.
const CREATE_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const CREATE_WAIT_POLL: Duration = Duration::from_millis(5);

/// Marks whether the bytes at a region's header describe reclaimed
/// space or a live user payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileType {
    /// The header has been zeroed; the region is safe to reuse.
    None,
    /// A live user file occupies this region.
    Normal,
}

impl FileType {
    fn from_byte(b: u8) -> Self {
        if b == 0x01 { FileType::Normal } else { FileType::None }
    }

    fn to_byte(self) -> u8 {
        match self {
            FileType::None => 0x00,
            FileType::Normal => 0x01,
        }
    }
}

/// The 8-byte header every allocated region begins with.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TrunkHeader {
    pub alloc_size: u32,
    pub file_type: FileType,
}

impl TrunkHeader {
    pub const LEN: usize = 8;

    pub fn reclaimed(alloc_size: u32) -> Self {
        Self { alloc_size, file_type: FileType::None }
    }

    pub fn encode(self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0..4].copy_from_slice(&self.alloc_size.to_be_bytes());
        buf[4] = self.file_type.to_byte();
        buf
    }

    pub fn decode(buf: [u8; Self::LEN]) -> Self {
        let alloc_size = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        Self { alloc_size, file_type: FileType::from_byte(buf[4]) }
    }
}

/// Owns the backing trunk files: creation, preallocation, and the
/// per-region reclaim header.
///
/// The allocator core never touches `std::fs` directly for trunk
/// content; every call goes through this trait so a host can swap in
/// (say) a network block store without the core knowing the
/// difference.
pub trait TrunkFileIo: Send + Sync {
    /// Returns `true` if a backing file for `key` already exists.
    fn exists(&self, key: TrunkKey) -> Result<bool>;

    /// Creates and preallocates a fresh backing file of exactly
    /// `trunk_file_size` bytes for `key`, using an exclusive open so a
    /// racing creator of the same `key` fails with `AlreadyExists`
    /// rather than truncating a sibling's file.
    ///
    /// If another thread is mid-creation of the same file, waits up to
    /// ten seconds (polling every 5ms) for it to finish sizing the
    /// file before giving up with [`crate::error::AllocError::Timeout`].
    fn create(&self, key: TrunkKey, trunk_file_size: u32) -> Result<()>;

    /// Writes `header` at `offset` within the backing file for `key`.
    fn write_header(&self, key: TrunkKey, offset: u32, header: TrunkHeader) -> Result<()>;

    /// Reads the header at `offset` within the backing file for `key`.
    fn read_header(&self, key: TrunkKey, offset: u32) -> Result<TrunkHeader>;

    /// Zeroes the header at `offset`, marking the region reclaimable.
    fn delete_region(&self, key: TrunkKey, offset: u32, size: u32) -> Result<()> {
        self.write_header(key, offset, TrunkHeader::reclaimed(size))
    }

    /// Reports the free space available to the store path, so
    /// `precreate` can refuse to create trunks that would exhaust
    /// reserved headroom. The default implementation performs no real
    /// quota check (returns `u64::MAX`); a host with disk-space
    /// accounting to enforce should override it.
    fn available_space(&self, _store_path_index: u8) -> Result<u64> {
        Ok(u64::MAX)
    }
}

/// A [`TrunkFileIo`] backed by real files under a base directory, laid
/// out as `data/<NN>/<HH>/<LL>/<base64-id>`.
pub struct StdTrunkFileIo {
    base_dir: PathBuf,
}

impl StdTrunkFileIo {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    /// The path of the backing file for `key`, deriving its
    /// subdirectory coordinates from `key` itself rather than
    /// recomputing the base64 token, since [`trunk_token`] and
    /// [`sub_path_coords`] are only needed together at creation time.
    pub fn path_for(&self, key: TrunkKey) -> PathBuf {
        self.base_dir
            .join("data")
            .join(format!("{:02}", key.store_path_index))
            .join(format!("{:02x}", key.sub_path_high))
            .join(format!("{:02x}", key.sub_path_low))
            .join(trunk_token(key.file_id))
    }

    fn open_rw(&self, key: TrunkKey) -> Result<std::fs::File> {
        let path = self.path_for(key);
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| AllocError::io(format!("open trunk file {path:?}"), e))
    }
}

impl TrunkFileIo for StdTrunkFileIo {
    fn exists(&self, key: TrunkKey) -> Result<bool> {
        Ok(self.path_for(key).exists())
    }

    fn create(&self, key: TrunkKey, trunk_file_size: u32) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AllocError::io(format!("create trunk dir {parent:?}"), e))?;
        }
        match std::fs::OpenOptions::new().create_new(true).write(true).open(&path) {
            Ok(file) => {
                file.set_len(trunk_file_size as u64)
                    .map_err(|e| AllocError::io(format!("preallocate trunk file {path:?}"), e))?;
                file.sync_all()
                    .map_err(|e| AllocError::io(format!("sync trunk file {path:?}"), e))?;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                self.wait_for_sizing(&path, trunk_file_size as u64)
            }
            Err(e) => Err(AllocError::io(format!("create trunk file {path:?}"), e)),
        }
    }

    fn write_header(&self, key: TrunkKey, offset: u32, header: TrunkHeader) -> Result<()> {
        let path = self.path_for(key);
        let mut file = self.open_rw(key)?;
        file.seek(SeekFrom::Start(offset as u64))
            .map_err(|e| AllocError::io(format!("seek trunk file {path:?}"), e))?;
        file.write_all(&header.encode())
            .map_err(|e| AllocError::io(format!("write trunk header {path:?}@{offset}"), e))?;
        file.sync_data().map_err(|e| AllocError::io(format!("sync trunk file {path:?}"), e))
    }

    fn read_header(&self, key: TrunkKey, offset: u32) -> Result<TrunkHeader> {
        let path = self.path_for(key);
        let mut file = self.open_rw(key)?;
        file.seek(SeekFrom::Start(offset as u64))
            .map_err(|e| AllocError::io(format!("seek trunk file {path:?}"), e))?;
        let mut buf = [0u8; TrunkHeader::LEN];
        file.read_exact(&mut buf)
            .map_err(|e| AllocError::io(format!("read trunk header {path:?}@{offset}"), e))?;
        Ok(TrunkHeader::decode(buf))
    }
}

impl StdTrunkFileIo {
    fn wait_for_sizing(&self, path: &Path, want_len: u64) -> Result<()> {
        let deadline = Instant::now() + CREATE_WAIT_TIMEOUT;
        loop {
            if let Ok(meta) = std::fs::metadata(path) {
                if meta.len() >= want_len {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(AllocError::timeout(format!(
                    "timed out waiting for sibling to size trunk file {path:?}"
                )));
            }
            std::thread::sleep(CREATE_WAIT_POLL);
        }
    }
}

/// Base64-encodes `file_id` (big-endian) into its 8-character token.
pub fn trunk_token(file_id: u32) -> String {
    URL_SAFE_NO_PAD.encode(file_id.to_be_bytes())
}

/// Derives `(sub_path_high, sub_path_low)` deterministically from a
/// trunk's base64 token, by summing byte values into two buckets. This
/// only needs to be a stable hash, not cryptographic.
pub fn sub_path_coords(token: &str) -> (u8, u8) {
    let mut high: u32 = 0;
    let mut low: u32 = 0;
    for (i, b) in token.as_bytes().iter().enumerate() {
        if i % 2 == 0 {
            high = high.wrapping_add(*b as u32);
        } else {
            low = low.wrapping_add(*b as u32);
        }
    }
    ((high % 256) as u8, (low % 256) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let h = TrunkHeader { alloc_size: 1024, file_type: FileType::Normal };
        assert_eq!(TrunkHeader::decode(h.encode()), h);
    }

    #[test]
    fn reclaimed_header_is_zero_type() {
        let h = TrunkHeader::reclaimed(2048);
        let encoded = h.encode();
        assert_eq!(encoded[4], 0x00);
        assert_eq!(u32::from_be_bytes(encoded[0..4].try_into().unwrap()), 2048);
    }

    #[test]
    fn token_is_eight_chars_and_stable() {
        let t1 = trunk_token(1);
        let t2 = trunk_token(1);
        assert_eq!(t1, t2);
        assert_eq!(t1.len(), 8);
    }

    #[test]
    fn sub_path_coords_are_deterministic() {
        let token = trunk_token(42);
        assert_eq!(sub_path_coords(&token), sub_path_coords(&token));
    }

    #[test]
    fn create_then_read_write_header() {
        let dir = tempfile::tempdir().unwrap();
        let io = StdTrunkFileIo::new(dir.path());
        let key = TrunkKey::new(0, 1, 2, 7);
        io.create(key, 64 * 1024).unwrap();
        assert!(io.exists(key).unwrap());
        io.write_header(key, 0, TrunkHeader { alloc_size: 512, file_type: FileType::Normal })
            .unwrap();
        let header = io.read_header(key, 0).unwrap();
        assert_eq!(header.alloc_size, 512);
        assert_eq!(header.file_type, FileType::Normal);
    }

    #[test]
    fn create_twice_errors_already_exists_path_is_handled() {
        let dir = tempfile::tempdir().unwrap();
        let io = StdTrunkFileIo::new(dir.path());
        let key = TrunkKey::new(0, 0, 0, 1);
        io.create(key, 4096).unwrap();
        // A second create on an already-fully-sized file should return
        // immediately rather than waiting out the full timeout.
        io.create(key, 4096).unwrap();
    }
}
