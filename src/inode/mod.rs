//! Inode-structured node representation: the bounded, hash-consed map from
//! steps to values that backs every directory-like node, laid out as three
//! cooperating modules: the in-memory `Bin` layout (C3), the on-disk
//! `Compress` codec (C4), and the recursive `Inode` value itself (C5).

pub mod bin;
pub mod compress;
pub mod value;

pub use bin::{Bin, BinPtr, BinValue};
pub use compress::Compress;
pub use value::{ChildPtr, Inode, NodeResolver};
