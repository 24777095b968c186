//! Control file (C7): the tiny, atomically-rewritten file describing the
//! pack's current layout. Three on-disk versions are understood on read
//! (V3, V4, V5); only V5, the current target, is ever written. Every
//! version's payload carries its own Adler-32 `checksum` field, computed
//! over the payload with that field zeroed; both the read-time verification
//! and the write-time fill-in serialise through the same typed
//! `#[derive(Serialize)]` struct so the byte order of fields never drifts
//! between the two, which a generic `serde_json::Value` round-trip would
//! not guarantee.

use crate::config::DEFAULT_PAGE_SIZE;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

const VERSION_TAG_LEN: usize = 8;
const TAG_V3: &[u8; VERSION_TAG_LEN] = b"IRMIN_V3";
const TAG_V4: &[u8; VERSION_TAG_LEN] = b"IRMIN_V4";
const TAG_V5: &[u8; VERSION_TAG_LEN] = b"IRMIN_V5";

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("control file is corrupted")]
    CorruptedControlFile,
    #[error("unknown major pack version tag {0:?}")]
    UnknownMajorPackVersion(String),
    #[error("control file payload of {0} bytes exceeds the page size of {1} bytes")]
    PayloadTooLarge(usize, usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ControlError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GcStatus {
    NoGcYet,
    UsedNonMinimalIndexingStrategy,
    FromV1V2PostUpgrade { generation: u64 },
    Gced {
        suffix_start_offset: u64,
        generation: u64,
        latest_gc_target_offset: u64,
        suffix_dead_bytes: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusV3 {
    FromV3Gced { generation: u32 },
    FromV3NoGcYet,
}

/// A payload that carries its own Adler-32 checksum over a zeroed copy of
/// itself, so write and verify always agree on field order.
trait ChecksummedPayload: Serialize + Clone {
    fn stored_checksum(&self) -> i64;
    fn with_checksum(&self, checksum: i64) -> Self;

    fn computed_checksum(&self) -> i64 {
        let zeroed = self.with_checksum(0);
        let bytes = serde_json::to_vec(&zeroed).expect("payload structs always serialise");
        adler32::adler32(&bytes[..]).expect("in-memory slices never fail to read") as i64
    }

    fn verify(&self) -> Result<()> {
        if self.stored_checksum() == self.computed_checksum() {
            Ok(())
        } else {
            Err(ControlError::CorruptedControlFile)
        }
    }

    fn finalized(&self) -> Self {
        let checksum = self.with_checksum(0).computed_checksum();
        self.with_checksum(checksum)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadV3 {
    pub dict_end_poff: u64,
    pub suffix_end_poff: u64,
    pub status: StatusV3,
    pub checksum: i64,
}

impl ChecksummedPayload for PayloadV3 {
    fn stored_checksum(&self) -> i64 {
        self.checksum
    }
    fn with_checksum(&self, checksum: i64) -> Self {
        PayloadV3 {
            checksum,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadV4 {
    pub dict_end_poff: u64,
    pub appendable_chunk_poff: u64,
    pub chunk_start_idx: u32,
    pub chunk_num: u32,
    pub volume_num: u32,
    pub status: GcStatus,
    pub checksum: i64,
}

impl ChecksummedPayload for PayloadV4 {
    fn stored_checksum(&self) -> i64 {
        self.checksum
    }
    fn with_checksum(&self, checksum: i64) -> Self {
        PayloadV4 {
            checksum,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadV5 {
    pub dict_end_poff: u64,
    pub appendable_chunk_poff: u64,
    pub chunk_start_idx: u32,
    pub chunk_num: u32,
    pub volume_num: u32,
    pub status: GcStatus,
    /// `Some(3|4)` when this payload was produced by upgrading an older
    /// control file on read; `None` for a file natively written as V5.
    pub upgraded_from: Option<u8>,
    pub checksum: i64,
}

impl ChecksummedPayload for PayloadV5 {
    fn stored_checksum(&self) -> i64 {
        self.checksum
    }
    fn with_checksum(&self, checksum: i64) -> Self {
        PayloadV5 {
            checksum,
            ..self.clone()
        }
    }
}

impl PayloadV5 {
    pub fn new(
        dict_end_poff: u64,
        appendable_chunk_poff: u64,
        chunk_start_idx: u32,
        chunk_num: u32,
        volume_num: u32,
        status: GcStatus,
    ) -> Self {
        PayloadV5 {
            dict_end_poff,
            appendable_chunk_poff,
            chunk_start_idx,
            chunk_num,
            volume_num,
            status,
            upgraded_from: None,
            checksum: 0,
        }
    }
}

fn upgrade_v3(v3: PayloadV3) -> PayloadV5 {
    let (status, chunk_start_idx) = match v3.status {
        StatusV3::FromV3Gced { generation } => (
            GcStatus::Gced {
                suffix_start_offset: 0,
                generation: generation as u64,
                latest_gc_target_offset: 0,
                suffix_dead_bytes: 0,
            },
            generation,
        ),
        StatusV3::FromV3NoGcYet => (GcStatus::NoGcYet, 0),
    };
    PayloadV5 {
        dict_end_poff: v3.dict_end_poff,
        appendable_chunk_poff: v3.suffix_end_poff,
        chunk_start_idx,
        chunk_num: 1,
        volume_num: 0,
        status,
        upgraded_from: Some(3),
        checksum: 0,
    }
}

fn upgrade_v4(v4: PayloadV4) -> PayloadV5 {
    PayloadV5 {
        dict_end_poff: v4.dict_end_poff,
        appendable_chunk_poff: v4.appendable_chunk_poff,
        chunk_start_idx: v4.chunk_start_idx,
        chunk_num: v4.chunk_num,
        volume_num: v4.volume_num,
        status: v4.status,
        upgraded_from: Some(4),
        checksum: 0,
    }
}

fn parse_payload(bytes: &[u8]) -> Result<PayloadV5> {
    if bytes.len() < VERSION_TAG_LEN {
        return Err(ControlError::CorruptedControlFile);
    }
    let (tag, rest) = bytes.split_at(VERSION_TAG_LEN);
    if tag == TAG_V3 {
        let v3: PayloadV3 =
            serde_json::from_slice(rest).map_err(|_| ControlError::CorruptedControlFile)?;
        v3.verify()?;
        Ok(upgrade_v3(v3))
    } else if tag == TAG_V4 {
        let v4: PayloadV4 =
            serde_json::from_slice(rest).map_err(|_| ControlError::CorruptedControlFile)?;
        v4.verify()?;
        Ok(upgrade_v4(v4))
    } else if tag == TAG_V5 {
        let v5: PayloadV5 =
            serde_json::from_slice(rest).map_err(|_| ControlError::CorruptedControlFile)?;
        v5.verify()?;
        Ok(v5)
    } else {
        Err(ControlError::UnknownMajorPackVersion(
            String::from_utf8_lossy(tag).into_owned(),
        ))
    }
}

pub fn read_control_file(path: impl AsRef<Path>) -> Result<PayloadV5> {
    let bytes = std::fs::read(path.as_ref())?;
    parse_payload(&bytes)
}

/// Serialises `payload` with a freshly computed checksum and atomically
/// rewrites the control file at `path`: the new contents land in a
/// `tempfile::NamedTempFile` created in the same directory (so the final
/// rename is same-filesystem) which is `sync_all`'d and then `persist`'d
/// over the target.
pub fn write_control_file(path: impl AsRef<Path>, payload: &PayloadV5) -> Result<()> {
    let path = path.as_ref();
    let finalized = payload.finalized();
    let mut out = Vec::with_capacity(DEFAULT_PAGE_SIZE);
    out.extend_from_slice(TAG_V5);
    out.extend_from_slice(
        &serde_json::to_vec(&finalized).expect("PayloadV5 always serialises"),
    );
    if out.len() > DEFAULT_PAGE_SIZE {
        return Err(ControlError::PayloadTooLarge(out.len(), DEFAULT_PAGE_SIZE));
    }
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(&out)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// A control file open for reading and writing. `reload` is unsupported
/// here: an `Rw` handle's in-memory payload is the single source of truth
/// until it is explicitly replaced via `set_payload`.
pub struct RwControlFile {
    path: PathBuf,
    payload: PayloadV5,
}

impl RwControlFile {
    pub fn create(path: impl AsRef<Path>, payload: PayloadV5) -> Result<Self> {
        write_control_file(path.as_ref(), &payload)?;
        Ok(RwControlFile {
            path: path.as_ref().to_path_buf(),
            payload: payload.finalized(),
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let payload = read_control_file(path.as_ref())?;
        Ok(RwControlFile {
            path: path.as_ref().to_path_buf(),
            payload,
        })
    }

    pub fn payload(&self) -> &PayloadV5 {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: PayloadV5) -> Result<()> {
        write_control_file(&self.path, &payload)?;
        self.payload = payload.finalized();
        Ok(())
    }

    pub fn close(self) {}
}

/// A control file open for reading only. `set_payload` is deliberately not
/// offered; `reload` re-reads the file atomically and replaces the
/// in-memory payload.
pub struct RoControlFile {
    path: PathBuf,
    payload: PayloadV5,
}

impl RoControlFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let payload = read_control_file(path.as_ref())?;
        Ok(RoControlFile {
            path: path.as_ref().to_path_buf(),
            payload,
        })
    }

    pub fn payload(&self) -> &PayloadV5 {
        &self.payload
    }

    pub fn reload(&mut self) -> Result<()> {
        self.payload = read_control_file(&self.path)?;
        Ok(())
    }

    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_v5() -> PayloadV5 {
        PayloadV5::new(100, 200, 0, 1, 0, GcStatus::NoGcYet)
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.control");
        write_control_file(&path, &sample_v5()).unwrap();
        let read = read_control_file(&path).unwrap();
        assert_eq!(read.dict_end_poff, 100);
        assert_eq!(read.appendable_chunk_poff, 200);
        assert_eq!(read.status, GcStatus::NoGcYet);
        assert_eq!(read.upgraded_from, None);
    }

    #[test]
    fn mutating_a_byte_outside_the_checksum_field_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.control");
        write_control_file(&path, &sample_v5()).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last - 20] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            read_control_file(&path),
            Err(ControlError::CorruptedControlFile)
        ));
    }

    #[test]
    fn v3_upgrades_to_v5_with_upgraded_from_tag_s4() {
        let v3 = PayloadV3 {
            dict_end_poff: 42,
            suffix_end_poff: 99,
            status: StatusV3::FromV3Gced { generation: 7 },
            checksum: 0,
        };
        let finalized = v3.finalized();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(TAG_V3);
        bytes.extend_from_slice(&serde_json::to_vec(&finalized).unwrap());

        let upgraded = parse_payload(&bytes).unwrap();
        assert_eq!(upgraded.upgraded_from, Some(3));
        assert_eq!(upgraded.chunk_num, 1);
        assert_eq!(upgraded.dict_end_poff, 42);
        assert_eq!(upgraded.appendable_chunk_poff, 99);
        assert_eq!(upgraded.chunk_start_idx, 7);

        let dir = tempdir().unwrap();
        let path = dir.path().join("store.control");
        write_control_file(&path, &upgraded).unwrap();
        let reread = read_control_file(&path).unwrap();
        assert_eq!(reread, upgraded);
    }

    #[test]
    fn v4_upgrades_to_v5_preserving_common_fields() {
        let v4 = PayloadV4 {
            dict_end_poff: 10,
            appendable_chunk_poff: 20,
            chunk_start_idx: 3,
            chunk_num: 5,
            volume_num: 2,
            status: GcStatus::UsedNonMinimalIndexingStrategy,
            checksum: 0,
        };
        let finalized = v4.finalized();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(TAG_V4);
        bytes.extend_from_slice(&serde_json::to_vec(&finalized).unwrap());

        let upgraded = parse_payload(&bytes).unwrap();
        assert_eq!(upgraded.upgraded_from, Some(4));
        assert_eq!(upgraded.chunk_num, 5);
        assert_eq!(upgraded.volume_num, 2);
        assert_eq!(upgraded.status, GcStatus::UsedNonMinimalIndexingStrategy);
    }

    #[test]
    fn unknown_version_tag_is_rejected() {
        let mut bytes = b"BOGUS000".to_vec();
        bytes.extend_from_slice(b"{}");
        assert!(matches!(
            parse_payload(&bytes),
            Err(ControlError::UnknownMajorPackVersion(tag)) if tag == "BOGUS000"
        ));
    }

    #[test]
    fn ro_reload_picks_up_a_subsequent_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.control");
        write_control_file(&path, &sample_v5()).unwrap();
        let mut ro = RoControlFile::open(&path).unwrap();
        assert_eq!(ro.payload().chunk_num, 1);

        let mut updated = sample_v5();
        updated.chunk_num = 9;
        write_control_file(&path, &updated).unwrap();

        ro.reload().unwrap();
        assert_eq!(ro.payload().chunk_num, 9);
    }

    #[test]
    fn rw_set_payload_persists_to_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.control");
        let mut rw = RwControlFile::create(&path, sample_v5()).unwrap();
        let mut updated = sample_v5();
        updated.chunk_num = 42;
        rw.set_payload(updated).unwrap();
        assert_eq!(read_control_file(&path).unwrap().chunk_num, 42);
    }
}
