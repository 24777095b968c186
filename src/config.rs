//! Store configuration (A1): the validated `ENTRIES`/`STABLE_HASH` pair, the
//! step-ordering policy, and the on-disk knobs, in the shape of the teacher's
//! `DBConfig` (a plain struct with a validating constructor and a `Default` impl).

use crate::step::Ordering;
use std::path::PathBuf;

/// Control files must fit in one page; see `control::MAX_CONTROL_FILE_SIZE`.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

#[derive(Debug, Clone)]
pub struct Config {
    /// Branching factor. Must be a power of two.
    pub entries: u32,
    /// Size threshold below which a root inode hashes as a flat map.
    /// Must satisfy `stable_hash >= entries`.
    pub stable_hash: u32,
    pub ordering: Ordering,
    /// Root directory containing `store.pack` and `store.control`.
    pub root: PathBuf,
    pub page_size: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("entries ({0}) must be a power of two")]
    EntriesNotPowerOfTwo(u32),
    #[error("stable_hash ({stable_hash}) must be >= entries ({entries})")]
    StableHashTooSmall { stable_hash: u32, entries: u32 },
    #[error("hash-bits ordering requires entries <= 1024, got {0}")]
    HashBitsEntriesTooLarge(u32),
}

impl Config {
    pub fn new(
        entries: u32,
        stable_hash: u32,
        ordering: Ordering,
        root: impl Into<PathBuf>,
    ) -> std::result::Result<Self, ConfigError> {
        if !entries.is_power_of_two() {
            return Err(ConfigError::EntriesNotPowerOfTwo(entries));
        }
        if stable_hash < entries {
            return Err(ConfigError::StableHashTooSmall {
                stable_hash,
                entries,
            });
        }
        if matches!(ordering, Ordering::HashBits) && entries > 1024 {
            return Err(ConfigError::HashBitsEntriesTooLarge(entries));
        }
        Ok(Config {
            entries,
            stable_hash,
            ordering,
            root: root.into(),
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    /// `floor(50 / log2(entries))`, per invariant 8: the deepest a tree may
    /// recurse before `ordering` is guaranteed to raise `MaxDepth`.
    pub fn max_depth(&self) -> u32 {
        let log2_entries = self.entries.trailing_zeros().max(1);
        50 / log2_entries
    }

    pub fn should_be_stable(&self, length: u64, root: bool) -> bool {
        length == 0 || (root && length <= self.stable_hash as u64)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new(32, 256, Ordering::SeededHash, "./irmin_store")
            .expect("default configuration is always valid")
    }
}
