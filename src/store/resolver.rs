//! Bridges a `PackStore`, a `Dictionary`, and an `OffsetResolver` into a
//! `NodeResolver`: the thing `Inode::find`/`seq`/`add` call to turn a `Lazy`
//! child pointer's key back into a usable `Inode`.

use crate::config::Config;
use crate::dict::{Dictionary, OffsetResolver};
use crate::error::{CoreError, Result};
use crate::hash::Key;
use crate::inode::compress::{self, Compress};
use crate::inode::value::{Inode, NodeResolver};
use crate::store::PackStore;
use std::sync::Arc;

pub struct PackResolver<'a> {
    cfg: Config,
    store: &'a dyn PackStore,
    dict: &'a dyn Dictionary,
    offset_resolver: &'a dyn OffsetResolver,
}

impl<'a> PackResolver<'a> {
    pub fn new(
        cfg: Config,
        store: &'a dyn PackStore,
        dict: &'a dyn Dictionary,
        offset_resolver: &'a dyn OffsetResolver,
    ) -> Self {
        PackResolver {
            cfg,
            store,
            dict,
            offset_resolver,
        }
    }
}

impl<'a> NodeResolver for PackResolver<'a> {
    fn resolve(&self, key: Key, depth: u32) -> Result<Arc<Inode>> {
        let raw = self
            .store
            .find(&key)?
            .ok_or(CoreError::UnknownHashAtTruncatedBoundary(key.to_hash()))?;
        if !raw.kind.is_inode() {
            return Err(CoreError::UnknownKind(raw.kind.to_byte()));
        }
        let compress = Compress::from_bytes(&raw.bytes)?;
        let bin = compress::decompress(&compress, self.dict, self.offset_resolver)?;
        let root = raw.kind.is_root_inode();
        Inode::from_bin(&self.cfg, &bin, depth, root, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::{NullDictionary, NullOffsetResolver};
    use crate::hash::{Hash, HashDomain};
    use crate::step::{Metadata, Ordering, Step, Value};
    use crate::store::MemStore;

    fn cfg() -> Config {
        Config::new(2, 2, Ordering::SeededHash, ".").unwrap()
    }

    fn contents(tag: &str) -> Value {
        Value::Contents(
            Key::new(Hash::digest(HashDomain::Contents, &[tag.as_bytes()])),
            Metadata::default(),
        )
    }

    #[test]
    fn save_then_resolve_through_a_fresh_pack_resolver_reconstructs_the_tree() {
        let cfg = cfg();
        let store = MemStore::new();
        let dict = NullDictionary;
        let offsets = NullOffsetResolver;

        let mut root = Inode::empty_root();
        for tag in ["a", "b", "c", "d"] {
            root = root
                .add(&cfg, &Step::from(tag), contents(tag), None)
                .unwrap();
        }
        let original_hash = root.hash();

        let root_key = root
            .save(&cfg, &store, &dict, &offsets, None)
            .expect("saving a fully Total tree never needs a resolver");

        let resolver = PackResolver::new(cfg.clone(), &store, &dict, &offsets);
        let reloaded = resolver.resolve(root_key, 0).unwrap();

        assert_eq!(reloaded.hash(), original_hash);
        for tag in ["a", "b", "c", "d"] {
            assert_eq!(
                reloaded
                    .find(&Step::from(tag), &cfg, Some(&resolver))
                    .unwrap(),
                Some(contents(tag))
            );
        }
        assert_eq!(
            reloaded.find(&Step::from("missing"), &cfg, Some(&resolver)).unwrap(),
            None
        );
    }
}
