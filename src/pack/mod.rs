//! Pack value kinds and entry framing (C6): the tagged-kind byte and length
//! header that wraps every persisted Compress payload in the append-only pack
//! file.

pub mod entry;
pub mod kind;

pub use entry::{decode_entry, encode_entry, DecodedEntry};
pub use kind::EntryKind;
