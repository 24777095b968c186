//! In-memory pack store: a `HashMap` guarded by a `parking_lot::RwLock`,
//! used by unit tests and anywhere a throwaway store is useful. `index` is
//! the identity over `mem` — there is no separate location to recover, since
//! nothing is ever actually written to a file.

use super::{PackStore, Raw};
use crate::error::Result;
use crate::hash::{Hash, Key};
use crate::pack::kind::EntryKind;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Default)]
pub struct MemStore {
    entries: RwLock<HashMap<Hash, (EntryKind, Vec<u8>)>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl PackStore for MemStore {
    fn mem(&self, hash: &Hash) -> bool {
        self.entries.read().contains_key(hash)
    }

    fn find(&self, key: &Key) -> Result<Option<Raw>> {
        Ok(self
            .entries
            .read()
            .get(&key.to_hash())
            .map(|(kind, bytes)| Raw {
                kind: *kind,
                bytes: bytes.clone(),
            }))
    }

    fn index(&self, hash: &Hash) -> Result<Option<Key>> {
        Ok(self
            .entries
            .read()
            .contains_key(hash)
            .then(|| Key::new(*hash)))
    }

    fn append(&self, hash: Hash, kind: EntryKind, payload: &[u8]) -> Result<Key> {
        self.entries
            .write()
            .entry(hash)
            .or_insert_with(|| (kind, payload.to_vec()));
        Ok(Key::new(hash))
    }
}
