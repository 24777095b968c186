//! Compress layout (C4): a space-optimised encoding of `Bin` that indirects
//! through a `Dictionary` for repeated step strings and an `OffsetResolver` for
//! in-pack addresses, falling back to direct encodings when either collaborator
//! has nothing to offer.

use crate::dict::{Dictionary, OffsetResolver};
use crate::error::{CoreError, Result};
use crate::hash::{Hash, Key};
use crate::inode::bin::{Bin, BinPtr, BinValue};
use crate::step::{Metadata, Step};
use serde::{Deserialize, Serialize};

/// Steps shorter than this never pay for dictionary indirection.
const MIN_INDIRECT_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Name {
    Indirect(u16),
    Direct(Step),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Address {
    Indirect(u64),
    Direct(Hash),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CompressValue {
    address: Address,
    metadata: Metadata,
    is_node: bool,
}

/// The byte-serialisable form actually written to the pack; see
/// `pack::entry::encode_inode`/`decode_inode` for the kind/length framing
/// wrapped around this payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compress {
    Values(Vec<(Name, CompressValue)>),
    Tree {
        depth: u32,
        length: u64,
        pointers: Vec<(u32, Address)>,
    },
}

impl Compress {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|_| CoreError::CorruptedEntry {
            offset: 0,
            field: "compress.serialize",
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|_| CoreError::CorruptedEntry {
            offset: 0,
            field: "compress.deserialize",
        })
    }
}

fn encode_name(step: &Step, dict: &dyn Dictionary) -> Name {
    if step.as_bytes().len() >= MIN_INDIRECT_LEN {
        if let Some(id) = dict.lookup(step.as_bytes()) {
            return Name::Indirect(id);
        }
    }
    Name::Direct(step.clone())
}

fn decode_name(name: &Name, dict: &dyn Dictionary) -> Result<Step> {
    match name {
        Name::Direct(step) => Ok(step.clone()),
        Name::Indirect(id) => dict
            .resolve(*id)
            .map(Step::new)
            .ok_or(CoreError::CorruptedEntry {
                offset: 0,
                field: "compress.name.indirect",
            }),
    }
}

fn encode_address(key: &Key, resolver: &dyn OffsetResolver) -> Address {
    match resolver.offset_of_key(key) {
        Some(offset) => Address::Indirect(offset),
        None => Address::Direct(key.to_hash()),
    }
}

fn decode_address(address: &Address, resolver: &dyn OffsetResolver) -> Result<Key> {
    match address {
        Address::Direct(hash) => Ok(Key::new(*hash)),
        Address::Indirect(offset) => resolver
            .hash_at_offset(*offset)
            .map(Key::new)
            .ok_or(CoreError::CorruptedEntry {
                offset: *offset,
                field: "compress.address.indirect",
            }),
    }
}

/// Encodes a Bin form into Compress, consulting `dict`/`resolver` for the
/// short-path indirections. Both collaborators may be the `Null*` impls.
pub fn compress(bin: &Bin, dict: &dyn Dictionary, resolver: &dyn OffsetResolver) -> Compress {
    match bin {
        Bin::Values(bindings) => {
            let values = bindings
                .iter()
                .map(|(step, value)| {
                    let name = encode_name(step, dict);
                    let compressed = match value {
                        BinValue::Contents(key, metadata) => CompressValue {
                            address: encode_address(key, resolver),
                            metadata: *metadata,
                            is_node: false,
                        },
                        BinValue::Node(key) => CompressValue {
                            address: encode_address(key, resolver),
                            metadata: Metadata::default(),
                            is_node: true,
                        },
                    };
                    (name, compressed)
                })
                .collect();
            Compress::Values(values)
        }
        Bin::Tree {
            depth,
            length,
            pointers,
        } => Compress::Tree {
            depth: *depth,
            length: *length,
            pointers: pointers
                .iter()
                .map(|ptr| (ptr.index, encode_address(&ptr.hash, resolver)))
                .collect(),
        },
    }
}

pub fn decompress(
    compress: &Compress,
    dict: &dyn Dictionary,
    resolver: &dyn OffsetResolver,
) -> Result<Bin> {
    match compress {
        Compress::Values(values) => {
            let mut bindings = Vec::with_capacity(values.len());
            for (name, value) in values {
                let step = decode_name(name, dict)?;
                let key = decode_address(&value.address, resolver)?;
                let bin_value = if value.is_node {
                    BinValue::Node(key)
                } else {
                    BinValue::Contents(key, value.metadata)
                };
                bindings.push((step, bin_value));
            }
            Ok(Bin::Values(bindings))
        }
        Compress::Tree {
            depth,
            length,
            pointers,
        } => {
            let mut out = Vec::with_capacity(pointers.len());
            for (index, address) in pointers {
                let key = decode_address(address, resolver)?;
                out.push(BinPtr {
                    index: *index,
                    hash: key,
                });
            }
            Ok(Bin::Tree {
                depth: *depth,
                length: *length,
                pointers: out,
            })
        }
    }
}
