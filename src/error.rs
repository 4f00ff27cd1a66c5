// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The allocator's error taxonomy.
//!
//! Every fallible public operation returns a named kind plus a short,
//! human-readable context string. No backtrace or source chain ever
//! crosses the public API boundary, so a caller embedding this crate in
//! a larger RPC service can forward `kind()` and the message verbatim
//! without leaking internal types.

use std::fmt;
use std::io;

/// The bare error taxonomy, with no payload.
///
/// Exposed separately from [`AllocError`] so callers that want to
/// `match` on the failure class don't need to also destructure a
/// context string.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum AllocErrorKind {
    /// Called before recovery completed, or after shutdown began.
    NotReady,
    /// Bad `path_index`, `size == 0`, or a region field out of range.
    InvalidArgument,
    /// The reserved-space check failed during `precreate`.
    OutOfSpace,
    /// `release` named a region already present in the free set.
    Duplicate,
    /// A `confirm` or internal deletion named a region that isn't indexed.
    NotFound,
    /// A binlog or snapshot record was malformed, or a trunk id collided.
    Corruption,
    /// The underlying filesystem returned an error.
    Io,
    /// A peer-creation wait exceeded its deadline.
    Timeout,
}

impl AllocErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::NotReady => "allocator not ready",
            Self::InvalidArgument => "invalid argument",
            Self::OutOfSpace => "out of space",
            Self::Duplicate => "duplicate region",
            Self::NotFound => "region not found",
            Self::Corruption => "corruption",
            Self::Io => "I/O error",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for AllocErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error type returned across the allocator's public boundary.
#[derive(thiserror::Error, Debug)]
pub enum AllocError {
    #[error("allocator not ready: {0}")]
    NotReady(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("out of space: {0}")]
    OutOfSpace(String),

    #[error("duplicate region: {0}")]
    Duplicate(String),

    #[error("region not found: {0}")]
    NotFound(String),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("timeout: {0}")]
    Timeout(String),
}

impl AllocError {
    /// Returns the bare kind, discarding the context string.
    pub fn kind(&self) -> AllocErrorKind {
        match self {
            Self::NotReady(_) => AllocErrorKind::NotReady,
            Self::InvalidArgument(_) => AllocErrorKind::InvalidArgument,
            Self::OutOfSpace(_) => AllocErrorKind::OutOfSpace,
            Self::Duplicate(_) => AllocErrorKind::Duplicate,
            Self::NotFound(_) => AllocErrorKind::NotFound,
            Self::Corruption(_) => AllocErrorKind::Corruption,
            Self::Io { .. } => AllocErrorKind::Io,
            Self::Timeout(_) => AllocErrorKind::Timeout,
        }
    }

    pub(crate) fn not_ready(context: impl Into<String>) -> Self {
        Self::NotReady(context.into())
    }

    pub(crate) fn invalid_argument(context: impl Into<String>) -> Self {
        Self::InvalidArgument(context.into())
    }

    pub(crate) fn out_of_space(context: impl Into<String>) -> Self {
        Self::OutOfSpace(context.into())
    }

    pub(crate) fn duplicate(context: impl Into<String>) -> Self {
        Self::Duplicate(context.into())
    }

    pub(crate) fn not_found(context: impl Into<String>) -> Self {
        Self::NotFound(context.into())
    }

    pub(crate) fn corruption(context: impl Into<String>) -> Self {
        Self::Corruption(context.into())
    }

    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io { context: context.into(), source }
    }

    pub(crate) fn timeout(context: impl Into<String>) -> Self {
        Self::Timeout(context.into())
    }
}

pub type Result<T> = core::result::Result<T, AllocError>;
