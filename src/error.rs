//! Core error taxonomy.
//!
//! Structural and codec failures are typed (`thiserror`) so callers can match on
//! them; I/O plumbing in the store adapter wraps `anyhow::Error` instead, the same
//! split the teacher's database layer makes between `WriteBatchError` (typed) and
//! `anyhow::Context` (I/O).

use crate::hash::Hash;
use thiserror::Error;

/// Errors raised by the inode value layer and the pack codec.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("step ordering exceeded digest length at depth {0}")]
    MaxDepth(u32),

    #[error("corrupted entry at offset {offset}: {field}")]
    CorruptedEntry { offset: u64, field: &'static str },

    #[error("unknown pack entry kind byte 0x{0:02x}")]
    UnknownKind(u8),

    #[error("unknown hash {0:?} at truncated boundary")]
    UnknownHashAtTruncatedBoundary(Hash),

    #[error("add/remove called on a non-root inode")]
    WriteOnNonRoot,

    #[error("child pointer is broken (unreachable) and cannot be resolved")]
    BrokenPointer,

    #[error("negative offset/length passed to seq")]
    InvalidSeqArgs,

    #[error("store I/O error: {0}")]
    Store(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Structural integrity problems, returned (not raised) by the integrity checker
/// so tooling (an `irmin-fsck`-shaped binary) can render a full report rather than
/// stopping at the first failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("node hash does not match its recomputed hash")]
    WrongHash,
    #[error("referenced value is absent from the store")]
    AbsentValue,
    #[error("child depth does not equal parent depth + 1")]
    InvalidDepth,
    #[error("tree length does not match the sum of its children")]
    InvalidLength,
    #[error("a values leaf contains the same step twice")]
    DuplicatedEntries,
    #[error("a values leaf is not sorted by step")]
    UnsortedEntries,
    #[error("a tree node has two pointers in the same slot")]
    DuplicatedPointers,
    #[error("a tree node's pointers are not sorted by slot index")]
    UnsortedPointers,
    #[error("an inode is empty but not the root")]
    Empty,
}
