//! Dictionary and offset-resolver external collaborators (A2).
//!
//! Both are optional, pure lookup interfaces the Compress codec (§4.5) consults
//! while encoding; absent collaborators (the `Null*` impls) make the codec
//! degrade cleanly to the `Direct` encodings.

use crate::hash::{Hash, Key};
use parking_lot::Mutex;
use std::collections::HashMap;

/// String <-> small-integer-id interning, used for the Compress `Name` field.
/// Real stores only intern steps whose binary form is at least 4 bytes (shorter
/// strings don't pay for the indirection).
pub trait Dictionary: Send + Sync {
    /// Looks up (but never creates) an id for `bytes`.
    fn lookup(&self, bytes: &[u8]) -> Option<u16>;
    /// Interns `bytes`, returning its id (existing or freshly assigned).
    fn intern(&self, bytes: &[u8]) -> u16;
    fn resolve(&self, id: u16) -> Option<Vec<u8>>;
}

pub struct NullDictionary;

impl Dictionary for NullDictionary {
    fn lookup(&self, _bytes: &[u8]) -> Option<u16> {
        None
    }
    fn intern(&self, _bytes: &[u8]) -> u16 {
        // A dictionary-less store never indirects, so callers must not actually
        // persist this id; see `MIN_INDIRECT_LEN` gating in `inode::compress`.
        0
    }
    fn resolve(&self, _id: u16) -> Option<Vec<u8>> {
        None
    }
}

#[derive(Default)]
pub struct InMemoryDictionary {
    inner: Mutex<InMemoryDictionaryInner>,
}

#[derive(Default)]
struct InMemoryDictionaryInner {
    forward: HashMap<Vec<u8>, u16>,
    backward: Vec<Vec<u8>>,
}

impl InMemoryDictionary {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Dictionary for InMemoryDictionary {
    fn lookup(&self, bytes: &[u8]) -> Option<u16> {
        self.inner.lock().forward.get(bytes).copied()
    }

    fn intern(&self, bytes: &[u8]) -> u16 {
        let mut inner = self.inner.lock();
        if let Some(id) = inner.forward.get(bytes) {
            return *id;
        }
        let id = inner.backward.len() as u16;
        inner.backward.push(bytes.to_vec());
        inner.forward.insert(bytes.to_vec(), id);
        id
    }

    fn resolve(&self, id: u16) -> Option<Vec<u8>> {
        self.inner.lock().backward.get(id as usize).cloned()
    }
}

/// Recovers pack-file locations from keys (encode direction) and hashes from
/// pack-file locations (decode direction). A pack store naturally owns both
/// directions since it assigns the offset at `append` time.
pub trait OffsetResolver: Send + Sync {
    fn offset_of_key(&self, key: &Key) -> Option<u64>;
    fn hash_at_offset(&self, offset: u64) -> Option<Hash>;
}

pub struct NullOffsetResolver;

impl OffsetResolver for NullOffsetResolver {
    fn offset_of_key(&self, _key: &Key) -> Option<u64> {
        None
    }
    fn hash_at_offset(&self, _offset: u64) -> Option<Hash> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_dictionary_round_trips() {
        let dict = InMemoryDictionary::new();
        let id = dict.intern(b"some/long/step");
        assert_eq!(dict.lookup(b"some/long/step"), Some(id));
        assert_eq!(dict.resolve(id), Some(b"some/long/step".to_vec()));
    }

    #[test]
    fn in_memory_dictionary_is_idempotent() {
        let dict = InMemoryDictionary::new();
        let a = dict.intern(b"repeat");
        let b = dict.intern(b"repeat");
        assert_eq!(a, b);
    }

    #[test]
    fn null_collaborators_always_degrade() {
        let dict = NullDictionary;
        assert_eq!(dict.lookup(b"anything"), None);
        let resolver = NullOffsetResolver;
        assert_eq!(resolver.hash_at_offset(0), None);
    }
}
