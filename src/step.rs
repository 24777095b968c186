//! Step ordering (C2) and the `Value`/`Metadata` parts of the data model.

use crate::error::{CoreError, Result};
use crate::hash::{Hash, HashDomain, Key};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One path component. Its binary serialisation is simply its bytes; ordering
/// between steps (for the Values-leaf map) is plain byte-lexicographic order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Step(pub Vec<u8>);

impl Step {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Step(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for Step {
    fn from(s: &str) -> Self {
        Step(s.as_bytes().to_vec())
    }
}

/// Per-binding metadata. Real Irmin metadata also carries a permission bit; the
/// default (non-executable) is the fast path the Compress codec special-cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Metadata {
    pub executable: bool,
}

impl Metadata {
    pub fn is_default(&self) -> bool {
        *self == Metadata::default()
    }
}

/// `Contents(key, metadata) | Node(key)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Contents(Key, Metadata),
    Node(Key),
}

impl Value {
    pub fn key(&self) -> Key {
        match self {
            Value::Contents(k, _) => *k,
            Value::Node(k) => *k,
        }
    }
}

/// Step-to-bucket assignment policy. Fixed per store; affects on-disk layout but
/// never the root hash of a stable inode (stable hashing bypasses chunking
/// entirely).
#[derive(Clone)]
pub enum Ordering {
    /// Only valid when `entries <= 1024`: slice `log2(entries)` consecutive bits
    /// out of a cryptographic digest of the step, starting at bit
    /// `depth * log2(entries)`.
    HashBits,
    /// A non-cryptographic short hash of the step, seeded by `depth`, reduced
    /// modulo `entries`. Grounded on the HAMT bucket-indexing pattern in
    /// `ipld-hamt` (`murmur3_x64_128` keyed by the item's bytes).
    SeededHash,
    /// Caller-supplied pure function.
    Custom(Arc<dyn Fn(&Step, u32) -> u32 + Send + Sync>),
}

impl std::fmt::Debug for Ordering {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ordering::HashBits => write!(f, "Ordering::HashBits"),
            Ordering::SeededHash => write!(f, "Ordering::SeededHash"),
            Ordering::Custom(_) => write!(f, "Ordering::Custom(..)"),
        }
    }
}

impl Ordering {
    /// `log2(entries)` consecutive bits of `hash`, starting at bit `start`,
    /// handling windows that straddle a byte boundary.
    fn extract_bits(hash: &Hash, start: u32, nbits: u32) -> Option<u32> {
        let total_bits = (hash.as_bytes().len() * 8) as u32;
        if start + nbits > total_bits {
            return None;
        }
        let mut value: u32 = 0;
        for i in 0..nbits {
            let bit_index = start + i;
            let byte = hash.as_bytes()[(bit_index / 8) as usize];
            let bit = (byte >> (7 - (bit_index % 8))) & 1;
            value = (value << 1) | bit as u32;
        }
        Some(value)
    }

    pub fn bucket(&self, step: &Step, depth: u32, entries: u32) -> Result<u32> {
        let log2_entries = entries.trailing_zeros();
        match self {
            Ordering::HashBits => {
                assert!(
                    entries <= 1024,
                    "hash-bits ordering requires entries <= 1024"
                );
                let digest = Hash::digest(HashDomain::Step, &[step.as_bytes()]);
                let start = depth * log2_entries;
                Self::extract_bits(&digest, start, log2_entries)
                    .ok_or(CoreError::MaxDepth(depth))
            }
            Ordering::SeededHash => {
                let seed = depth;
                let mut cursor = step.as_bytes();
                let digest = murmur3::murmur3_x64_128(&mut cursor, seed)
                    .expect("murmur3 over an in-memory slice never fails");
                let folded = (digest as u64) ^ ((digest >> 64) as u64);
                Ok((folded % entries as u64) as u32)
            }
            Ordering::Custom(f) => Ok(f(step, depth) % entries),
        }
    }
}
