//! One-byte kind tags distinguishing every persisted pack entry.
//!
//! `Inode_v1_*` predate the root/non-root split introduced by `Inode_v2_*`;
//! stability was the only distinction V1 made, and a stable inode is always a
//! root (invariant 6), so `InodeV1Stable` maps to a root inode and
//! `InodeV1Unstable` to a non-root one on decode.

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    Contents = 0,
    CommitV1 = 1,
    CommitV2 = 2,
    InodeV1Unstable = 3,
    InodeV1Stable = 4,
    InodeV2Root = 5,
    InodeV2NonRoot = 6,
}

impl EntryKind {
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Result<Self, CoreError> {
        match byte {
            0 => Ok(EntryKind::Contents),
            1 => Ok(EntryKind::CommitV1),
            2 => Ok(EntryKind::CommitV2),
            3 => Ok(EntryKind::InodeV1Unstable),
            4 => Ok(EntryKind::InodeV1Stable),
            5 => Ok(EntryKind::InodeV2Root),
            6 => Ok(EntryKind::InodeV2NonRoot),
            other => Err(CoreError::UnknownKind(other)),
        }
    }

    /// V1 entries have no explicit length header and must be size-probed; V2
    /// entries carry an explicit length, enabling O(1) skipping during scans.
    /// The encoder only ever emits V2 kinds; V1 is decode-only.
    pub fn is_v1(self) -> bool {
        matches!(
            self,
            EntryKind::CommitV1 | EntryKind::InodeV1Unstable | EntryKind::InodeV1Stable
        )
    }

    pub fn is_inode(self) -> bool {
        matches!(
            self,
            EntryKind::InodeV1Unstable
                | EntryKind::InodeV1Stable
                | EntryKind::InodeV2Root
                | EntryKind::InodeV2NonRoot
        )
    }

    /// Whether this kind, once decoded, represents a root inode. Only
    /// meaningful when `is_inode()` is true.
    pub fn is_root_inode(self) -> bool {
        matches!(self, EntryKind::InodeV2Root | EntryKind::InodeV1Stable)
    }
}
