//! Hash & Key (C1).
//!
//! `Hash` is a fixed-width, totally-ordered content hash. `Key` is a hash plus an
//! optional `(offset, length)` hint into a pack file; `Key` always carries the
//! hash, so `Key -> Hash` is a total projection and keys never "demote" to a bare
//! hash — they simply may or may not carry a location hint alongside it.

use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const HASH_LEN: usize = 32;

/// One-byte domain separators, mirroring the teacher's domain-tagging
/// pattern, which prefixes every hashed form with a tag to prevent
/// cross-domain collisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HashDomain {
    /// Hashing the Bin form of an unstable inode.
    StructuralNode = 0x01,
    /// Hashing the flat bindings of a stable inode.
    StableNode = 0x02,
    /// Hashing a step for bucket ordering.
    Step = 0x03,
    /// Hashing raw contents bytes.
    Contents = 0x04,
    /// Checksumming a framed pack entry (kind byte + payload).
    PackEntry = 0x05,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; HASH_LEN]);

impl Hash {
    pub const fn zero() -> Self {
        Hash([0u8; HASH_LEN])
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != HASH_LEN {
            return None;
        }
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(bytes);
        Some(Hash(out))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Domain-separated BLAKE2b-256 over an arbitrary number of byte slices.
    pub fn digest(domain: HashDomain, parts: &[&[u8]]) -> Self {
        let mut hasher = Blake2bVar::new(HASH_LEN).expect("32 is a valid blake2b output size");
        hasher.update(&[domain as u8]);
        for part in parts {
            hasher.update(part);
        }
        let mut out = [0u8; HASH_LEN];
        hasher
            .finalize_variable(&mut out)
            .expect("output buffer is exactly HASH_LEN");
        Hash(out)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// An optional hint that a key's bytes live at a known position in a pack file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyHint {
    pub offset: u64,
    pub length: u32,
}

/// Hash, plus an optional in-pack location hint. `Key -> Hash` is total: `to_hash`
/// never fails, regardless of whether a hint is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    hash: Hash,
    hint: Option<KeyHint>,
}

impl Key {
    pub fn new(hash: Hash) -> Self {
        Key { hash, hint: None }
    }

    pub fn with_hint(hash: Hash, offset: u64, length: u32) -> Self {
        Key {
            hash,
            hint: Some(KeyHint { offset, length }),
        }
    }

    pub fn to_hash(&self) -> Hash {
        self.hash
    }

    pub fn hint(&self) -> Option<KeyHint> {
        self.hint
    }
}

impl From<Hash> for Key {
    fn from(hash: Hash) -> Self {
        Key::new(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_and_domain_separated() {
        let a = Hash::digest(HashDomain::Step, &[b"foo"]);
        let b = Hash::digest(HashDomain::Step, &[b"foo"]);
        assert_eq!(a, b);

        let c = Hash::digest(HashDomain::Contents, &[b"foo"]);
        assert_ne!(a, c, "domain separation must change the digest");
    }

    #[test]
    fn hash_orders_lexicographically() {
        let low = Hash([0u8; HASH_LEN]);
        let mut high_bytes = [0u8; HASH_LEN];
        high_bytes[0] = 1;
        let high = Hash(high_bytes);
        assert!(low < high);
    }

    #[test]
    fn key_projects_to_hash_regardless_of_hint() {
        let h = Hash::digest(HashDomain::Step, &[b"bar"]);
        let plain = Key::new(h);
        let hinted = Key::with_hint(h, 128, 64);
        assert_eq!(plain.to_hash(), h);
        assert_eq!(hinted.to_hash(), h);
        assert_ne!(plain, hinted);
    }
}
