// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The textual trunk binlog: one `ADD`/`DEL` record per line, and the
//! writer collaborator that durably appends them.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use crate::error::{AllocError, Result};
use crate::key::TrunkKey;

/// Whether a record marks a region as having become free (`Add`) or as
/// having stopped being free (`Del`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Op {
    Add,
    Del,
}

impl Op {
    fn as_char(self) -> char {
        match self {
            Op::Add => 'A',
            Op::Del => 'D',
        }
    }

    fn from_char(c: char) -> Option<Op> {
        match c {
            'A' => Some(Op::Add),
            'D' => Some(Op::Del),
            _ => None,
        }
    }
}

/// One parsed line of the trunk binlog.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BinlogRecord {
    pub timestamp: u64,
    pub op: Op,
    pub key: TrunkKey,
    pub offset: u32,
    pub size: u32,
}

impl BinlogRecord {
    pub fn add(timestamp: u64, key: TrunkKey, offset: u32, size: u32) -> Self {
        Self { timestamp, op: Op::Add, key, offset, size }
    }

    pub fn del(timestamp: u64, key: TrunkKey, offset: u32, size: u32) -> Self {
        Self { timestamp, op: Op::Del, key, offset, size }
    }
}

/// Parses and emits [`BinlogRecord`]s in the binlog's fixed textual
/// format.
///
/// ```text
/// <timestamp> <op> <store_path> <sub_high> <sub_low> <file_id> <offset> <size>
/// ```
///
/// A legacy 6-field form, predating per-subdirectory sharding, omits
/// `sub_high` and `sub_low` (both default to zero on read and are never
/// written by this codec):
///
/// ```text
/// <timestamp> <op> <store_path> <file_id> <offset> <size>
/// ```
pub struct BinlogCodec;

impl BinlogCodec {
    /// Formats `record` as a single line, without a trailing newline.
    pub fn format(record: &BinlogRecord) -> String {
        format!(
            "{ts} {op} {sp} {sh} {sl} {id} {off} {size}",
            ts = record.timestamp,
            op = record.op.as_char(),
            sp = record.key.store_path_index,
            sh = record.key.sub_path_high,
            sl = record.key.sub_path_low,
            id = record.key.file_id,
            off = record.offset,
            size = record.size,
        )
    }

    /// Parses one line (without its trailing newline) into a record.
    ///
    /// Field count must be exactly 6 or 8; the `op` character must be
    /// `A` or `D`. Anything else is `Corruption` — recovery treats that
    /// as fatal unless it coincides with end-of-file.
    pub fn parse(line: &str) -> Result<BinlogRecord> {
        let fields: Vec<&str> = line.split(' ').collect();
        let (timestamp, op, store_path, sub_high, sub_low, file_id, offset, size) =
            match fields.as_slice() {
                [ts, op, sp, id, off, size] => (ts, op, sp, &"0", &"0", id, off, size),
                [ts, op, sp, sh, sl, id, off, size] => (ts, op, sp, sh, sl, id, off, size),
                _ => {
                    return Err(AllocError::corruption(format!(
                        "unexpected binlog record: {} fields, want 6 or 8: {line:?}",
                        fields.len()
                    )));
                }
            };
        let op = op
            .chars()
            .next()
            .and_then(Op::from_char)
            .ok_or_else(|| AllocError::corruption(format!("unexpected binlog op: {op:?}")))?;
        let timestamp = parse_field(timestamp, "timestamp")?;
        let store_path_index = parse_field(store_path, "store_path")?;
        let sub_path_high = parse_field(sub_high, "sub_high")?;
        let sub_path_low = parse_field(sub_low, "sub_low")?;
        let file_id = parse_field(file_id, "file_id")?;
        let offset = parse_field(offset, "offset")?;
        let size = parse_field(size, "size")?;
        Ok(BinlogRecord {
            timestamp,
            op,
            key: TrunkKey::new(store_path_index, sub_path_high, sub_path_low, file_id),
            offset,
            size,
        })
    }
}

fn parse_field<T: std::str::FromStr>(field: &str, name: &str) -> Result<T> {
    field
        .parse()
        .map_err(|_| AllocError::corruption(format!("bad binlog field {name}: {field:?}")))
}

/// Durably persists binlog records, in order.
///
/// The allocator core never constructs a raw `File` itself: every
/// append goes through this trait so a host can swap in a cluster-wide
/// replicated log writer without the core knowing the difference.
pub trait BinlogWriter: Send + Sync {
    /// Appends `record` (plus its trailing newline) and returns once it
    /// is durable.
    fn append(&self, record: &BinlogRecord) -> Result<()>;

    /// The current length of the binlog, in bytes.
    fn len(&self) -> Result<u64>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Atomically replaces the entire binlog with `records`, dropping
    /// everything a just-written snapshot already captures. Used only
    /// by [`crate::compactor::Compactor::commit`], after the snapshot
    /// it is paired with has been fsync'd.
    fn compact(&self, records: &[BinlogRecord]) -> Result<()>;
}

/// A [`BinlogWriter`] backed by a single append-mode file.
pub struct FileBinlogWriter {
    path: std::path::PathBuf,
    file: parking_lot::Mutex<File>,
}

impl FileBinlogWriter {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| AllocError::io(format!("open binlog {path:?}"), e))?;
        Ok(Self { path: path.to_path_buf(), file: parking_lot::Mutex::new(file) })
    }

    fn tmp_path(&self) -> std::path::PathBuf {
        let file_name = self
            .path
            .file_name()
            .map(|n| format!(".{}.tmp", n.to_string_lossy()))
            .unwrap_or_else(|| ".binlog.tmp".to_string());
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(file_name),
            _ => std::path::PathBuf::from(file_name),
        }
    }
}

impl BinlogWriter for FileBinlogWriter {
    fn append(&self, record: &BinlogRecord) -> Result<()> {
        let line = BinlogCodec::format(record);
        let mut file = self.file.lock();
        (|| -> io::Result<()> {
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_data()
        })()
        .map_err(|e| AllocError::io(format!("append to binlog {:?}", self.path), e))
    }

    fn len(&self) -> Result<u64> {
        let file = self.file.lock();
        file.metadata()
            .map(|m| m.len())
            .map_err(|e| AllocError::io(format!("stat binlog {:?}", self.path), e))
    }

    fn compact(&self, records: &[BinlogRecord]) -> Result<()> {
        let tmp_path = self.tmp_path();
        let mut file = self.file.lock();
        (|| -> io::Result<()> {
            let mut tmp = File::create(&tmp_path)?;
            for record in records {
                tmp.write_all(BinlogCodec::format(record).as_bytes())?;
                tmp.write_all(b"\n")?;
            }
            tmp.sync_all()?;
            drop(tmp);
            std::fs::rename(&tmp_path, &self.path)?;
            // The old handle's append offset is meaningless once the
            // inode it pointed at has been replaced; reopen against the
            // new file so subsequent `append` calls land at its tail.
            *file = OpenOptions::new().create(true).append(true).open(&self.path)?;
            Ok(())
        })()
        .map_err(|e| AllocError::io(format!("compact binlog {:?}", self.path), e))
    }
}
