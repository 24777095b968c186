//! Inode-structured node representation, pack value codec, and control file
//! for a content-addressed, branchable store.
//!
//! Module map: `hash` (C1), `step` (C2), `inode::bin` (C3), `inode::compress`
//! (C4), `pack` (C6), `inode::value` (C5, the core recursive type), `store`
//! (C8, pack store adapters), `control` (C7, the control file), `dict` (A2),
//! `config` (A1), `error` (A3).

pub mod config;
pub mod control;
pub mod dict;
pub mod error;
pub mod hash;
pub mod inode;
pub mod pack;
pub mod step;
pub mod store;

pub use config::Config;
pub use error::{CoreError, IntegrityError, Result};
pub use hash::{Hash, HashDomain, Key, KeyHint};
pub use inode::{Bin, ChildPtr, Compress, Inode, NodeResolver};
pub use step::{Metadata, Ordering, Step, Value};
pub use store::{FileStore, MemStore, PackResolver, PackStore, Raw};
