//! Bin layout (C3): the in-memory, on-the-wire shape of an inode, before the
//! Compress codec's dictionary/offset indirection is applied.

use crate::hash::Key;
use crate::step::{Metadata, Step};

/// One slot in a Tree node's pointer list. Only non-empty slots are carried;
/// `index` is the bucket (`ordering(step, depth)`), not a dense array position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinPtr {
    pub index: u32,
    pub hash: Key,
}

/// The wire shape of one inode, with its child pointers already resolved to
/// keys (`save` promotes every pointer to a key before encoding).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bin {
    /// A Values leaf: ordered bindings, step ascending.
    Values(Vec<(Step, BinValue)>),
    /// A Tree node: depth, total length, and the non-empty child slots in
    /// ascending `index` order.
    Tree {
        depth: u32,
        length: u64,
        pointers: Vec<BinPtr>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinValue {
    Contents(Key, Metadata),
    Node(Key),
}

impl Bin {
    /// Concatenates the Bin form into a canonical byte sequence for structural
    /// hashing (§4.3): each child pointer contributes its own hash bytes, never
    /// a recomputation of the child's content.
    pub fn hash_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Bin::Values(bindings) => {
                out.push(0u8);
                out.extend_from_slice(&(bindings.len() as u32).to_be_bytes());
                for (step, value) in bindings {
                    out.extend_from_slice(&(step.as_bytes().len() as u32).to_be_bytes());
                    out.extend_from_slice(step.as_bytes());
                    match value {
                        BinValue::Contents(key, metadata) => {
                            out.push(0);
                            out.extend_from_slice(key.to_hash().as_bytes());
                            out.push(metadata.executable as u8);
                        }
                        BinValue::Node(key) => {
                            out.push(1);
                            out.extend_from_slice(key.to_hash().as_bytes());
                        }
                    }
                }
            }
            Bin::Tree {
                depth,
                length,
                pointers,
            } => {
                out.push(1u8);
                out.extend_from_slice(&depth.to_be_bytes());
                out.extend_from_slice(&length.to_be_bytes());
                for ptr in pointers {
                    out.extend_from_slice(&ptr.index.to_be_bytes());
                    out.extend_from_slice(ptr.hash.to_hash().as_bytes());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{Hash, HashDomain};

    #[test]
    fn values_and_tree_hash_bytes_diverge() {
        let key = Key::new(Hash::digest(HashDomain::Contents, &[b"x"]));
        let values = Bin::Values(vec![(
            Step::from("a"),
            BinValue::Contents(key, Metadata::default()),
        )]);
        let tree = Bin::Tree {
            depth: 0,
            length: 1,
            pointers: vec![BinPtr { index: 0, hash: key }],
        };
        assert_ne!(values.hash_bytes(), tree.hash_bytes());
    }

    #[test]
    fn hash_bytes_is_order_sensitive_over_pointers() {
        let k1 = Key::new(Hash::digest(HashDomain::Contents, &[b"1"]));
        let k2 = Key::new(Hash::digest(HashDomain::Contents, &[b"2"]));
        let a = Bin::Tree {
            depth: 0,
            length: 2,
            pointers: vec![
                BinPtr { index: 0, hash: k1 },
                BinPtr { index: 1, hash: k2 },
            ],
        };
        let b = Bin::Tree {
            depth: 0,
            length: 2,
            pointers: vec![
                BinPtr { index: 1, hash: k2 },
                BinPtr { index: 0, hash: k1 },
            ],
        };
        assert_ne!(a.hash_bytes(), b.hash_bytes());
    }
}
