//! Entry framing: `[kind:1][length:4][payload][checksum:4]` for the V2 kinds
//! the encoder emits, and `[kind:1][payload, self-delimiting][checksum:4]` for
//! the V1 kinds the decoder must still accept. The checksum is a truncated
//! domain-separated hash over the kind byte and payload, catching torn writes
//! independently of whatever the payload's own codec (Compress) checks.

use crate::error::CoreError;
use crate::hash::{Hash, HashDomain};
use crate::pack::kind::EntryKind;

const CHECKSUM_LEN: usize = 4;

fn checksum(kind_byte: u8, payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = Hash::digest(HashDomain::PackEntry, &[&[kind_byte], payload]);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest.as_bytes()[..CHECKSUM_LEN]);
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEntry {
    pub kind: EntryKind,
    pub payload: Vec<u8>,
}

/// Frames `payload` under `kind` using V2 (explicit length) framing.
pub fn encode_entry(kind: EntryKind, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 4 + payload.len() + CHECKSUM_LEN);
    out.push(kind.to_byte());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&checksum(kind.to_byte(), payload));
    out
}

/// Decodes one framed entry starting at `bytes[0]`. `offset` is only used to
/// annotate errors with the entry's position in the pack file. Returns the
/// decoded entry and the number of bytes consumed (so the caller can advance
/// past it during a scan).
pub fn decode_entry(bytes: &[u8], offset: u64) -> Result<(DecodedEntry, usize), CoreError> {
    let kind_byte = *bytes.first().ok_or(CoreError::CorruptedEntry {
        offset,
        field: "kind",
    })?;
    let kind = EntryKind::from_byte(kind_byte)?;
    let rest = &bytes[1..];
    let (payload, consumed_after_kind) = if kind.is_v1() {
        probe_v1_payload(rest, offset)?
    } else {
        decode_v2_payload(rest, offset)?
    };
    let before_checksum = 1 + consumed_after_kind;
    let total = before_checksum + CHECKSUM_LEN;
    if bytes.len() < total {
        return Err(CoreError::CorruptedEntry {
            offset,
            field: "checksum",
        });
    }
    let expected = checksum(kind_byte, &payload);
    if bytes[before_checksum..total] != expected {
        return Err(CoreError::CorruptedEntry {
            offset,
            field: "checksum",
        });
    }
    Ok((DecodedEntry { kind, payload }, total))
}

fn decode_v2_payload(rest: &[u8], offset: u64) -> Result<(Vec<u8>, usize), CoreError> {
    if rest.len() < 4 {
        return Err(CoreError::CorruptedEntry {
            offset,
            field: "length",
        });
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&rest[..4]);
    let len = u32::from_be_bytes(len_bytes) as usize;
    if rest.len() < 4 + len {
        return Err(CoreError::CorruptedEntry {
            offset,
            field: "payload",
        });
    }
    Ok((rest[4..4 + len].to_vec(), 4 + len))
}

/// V1 entries carry no length header; the payload (a Compress value encoded
/// as JSON) is self-delimiting, so the number of bytes it occupies is
/// recovered from where the JSON parser stopped.
fn probe_v1_payload(rest: &[u8], offset: u64) -> Result<(Vec<u8>, usize), CoreError> {
    let mut de = serde_json::Deserializer::from_slice(rest);
    let _value: serde_json::Value =
        serde::Deserialize::deserialize(&mut de).map_err(|_| CoreError::CorruptedEntry {
            offset,
            field: "v1.payload",
        })?;
    let consumed = de.byte_offset();
    Ok((rest[..consumed].to_vec(), consumed))
}
