// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The FastDFS trunk allocator: the subsystem that packs many small
//! user files into a small set of large backing "trunk" files, tracks
//! free regions inside those trunks by size, allocates regions on
//! demand, and reconstructs its entire state from a persistent log
//! after a crash.
//!
//! [`TrunkAllocator`] is the entry point. Construct a
//! [`TrunkAllocatorConfig`], a set of [`Collaborators`] (a [`Clock`], a
//! [`TrunkFileIo`], a [`PathPicker`], a [`BinlogWriter`] -- std-backed
//! defaults for each are provided), and a [`TrunkAllocatorPaths`]
//! pointing at a base directory, then call [`TrunkAllocator::open`].
//! Recovery runs before `open` returns, so a successfully constructed
//! allocator is always ready to serve `allocate`/`release`/`confirm`.

mod allocator;
mod binlog;
mod clock;
mod compactor;
mod config;
mod error;
mod free_set;
mod key;
mod path_picker;
mod recovery;
mod size_index;
mod snapshot;
mod trunk_io;

pub use allocator::{Collaborators, TrunkAllocator, TrunkAllocatorPaths};
pub use binlog::{BinlogCodec, BinlogRecord, BinlogWriter, FileBinlogWriter, Op};
pub use clock::{Clock, SystemClock};
pub use compactor::Compactor;
pub use config::TrunkAllocatorConfig;
pub use error::{AllocError, AllocErrorKind, Result};
pub use key::{ConfirmOutcome, RegionStatus, TrunkKey, TrunkRegion};
pub use path_picker::{PathPicker, RoundRobinPathPicker};
pub use recovery::DroppedRegion;
pub use trunk_io::{FileType, StdTrunkFileIo, TrunkFileIo, TrunkHeader};
