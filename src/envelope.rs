//! Checkpoint envelope and the format-specific descriptors it carries.
//!
//! An envelope ([`CheckpointMetaData`]) is created by the source node and
//! travels with the shard move. Its `serialized_checkpoint` payload is an
//! opaque, versioned blob that decodes into one of three descriptors
//! according to the [`CheckpointFormat`] tag:
//!
//! - [`ColumnFamilyCheckpoint`] — an exported column family: per-file
//!   metadata for every SST plus the comparator name the engine must match.
//! - [`KeyValuesCheckpoint`] — range-sliced SSTs materialized locally from a
//!   key/value stream, one disjoint file per sub-range.
//! - [`FullDbCheckpoint`] — a whole-database snapshot directory.
//!
//! Field names and ordering are part of the wire format: the fetcher
//! re-encodes descriptors as files arrive and the result must round-trip
//! byte-identically through the matching `decode`.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CheckpointError, CheckpointResult};
use crate::range::KeyRange;

/// Magic prefix of every serialized checkpoint payload.
const ENVELOPE_MAGIC: u32 = 0x5450_4B43; // "CKPT"

/// Current payload encoding version.
const ENVELOPE_VERSION: u16 = 1;

/// Header bytes preceding the descriptor body: magic, version, format tag.
const ENVELOPE_HEADER_LEN: usize = 8;

/// Unique identifier of a checkpoint, assigned by the source node.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CheckpointId(pub u64, pub u64);

impl CheckpointId {
    pub const fn new(hi: u64, lo: u64) -> Self {
        Self(hi, lo)
    }

    /// High half, used as the stable prefix when naming range files.
    pub const fn hi(self) -> u64 {
        self.0
    }

    pub const fn lo(self) -> u64 {
        self.1
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.0, self.1)
    }
}

/// Identifier of a storage node in the server directory.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl NodeId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Concrete layout of a checkpoint's serialized payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckpointFormat {
    /// Exported column family: SST files plus import metadata.
    ColumnFamily,
    /// Range-sliced SST files fetched by key range.
    KeyValues,
    /// Whole-database snapshot directory.
    FullDb,
}

impl CheckpointFormat {
    fn wire_tag(self) -> u16 {
        match self {
            CheckpointFormat::ColumnFamily => 1,
            CheckpointFormat::KeyValues => 2,
            CheckpointFormat::FullDb => 3,
        }
    }

    fn from_wire_tag(tag: u16) -> CheckpointResult<Self> {
        Ok(match tag {
            1 => CheckpointFormat::ColumnFamily,
            2 => CheckpointFormat::KeyValues,
            3 => CheckpointFormat::FullDb,
            other => {
                return Err(CheckpointError::malformed(format!(
                    "unknown checkpoint format tag: {other}"
                )));
            }
        })
    }
}

impl fmt::Display for CheckpointFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointFormat::ColumnFamily => write!(f, "column_family"),
            CheckpointFormat::KeyValues => write!(f, "key_values"),
            CheckpointFormat::FullDb => write!(f, "full_db"),
        }
    }
}

/// The outer checkpoint record handed between nodes.
///
/// The fetcher mutates a local copy in place as files arrive and persists it
/// through the progress callback; readers treat it as immutable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetaData {
    pub checkpoint_id: CheckpointId,
    pub format: CheckpointFormat,
    /// Key ranges this checkpoint represents.
    pub ranges: Vec<KeyRange>,
    /// Source nodes; the first entry is the authoritative fetch source.
    pub src: Vec<NodeId>,
    /// Format-specific descriptor, encoded with the versioned envelope codec.
    pub serialized_checkpoint: Vec<u8>,
}

impl fmt::Display for CheckpointMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "checkpoint {} format={} ranges={} src={}",
            self.checkpoint_id,
            self.format,
            self.ranges.len(),
            self.src
                .first()
                .map(|n| n.to_string())
                .unwrap_or_else(|| "none".to_string()),
        )
    }
}

/// One key/value pair, as carried by range-read batches and the key-value
/// fetch stream.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl KeyValue {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Everything the engine needs to re-import one externally produced SST.
///
/// Mirrors the engine's live-file metadata field for field; `fetched` and the
/// rewritten `db_path` are transport-side state tracked by the fetcher.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveFileMeta {
    pub name: String,
    pub db_path: String,
    pub size: u64,
    pub file_number: u64,
    pub smallest_seqno: u64,
    pub largest_seqno: u64,
    pub smallest_key: Vec<u8>,
    pub largest_key: Vec<u8>,
    pub num_reads_sampled: u64,
    pub being_compacted: bool,
    pub num_entries: u64,
    pub num_deletions: u64,
    pub temperature: u8,
    pub oldest_blob_file_number: u64,
    pub oldest_ancester_time: u64,
    pub file_creation_time: u64,
    pub file_checksum: String,
    pub file_checksum_func_name: String,
    pub column_family_name: String,
    pub level: i32,
    /// True once the byte-identical file exists under `db_path` locally.
    pub fetched: bool,
}

impl LiveFileMeta {
    /// Absolute path of the file: `db_path` joined with `name`.
    pub fn local_path(&self) -> String {
        sst_file_path(&self.db_path, &self.name)
    }
}

/// Joins a database directory and an SST file name.
///
/// File names conventionally carry a leading separator (`"/000007.sst"`);
/// tolerate both spellings so envelope producers don't have to care.
pub fn sst_file_path(db_path: &str, name: &str) -> String {
    if name.starts_with('/') || db_path.ends_with('/') {
        format!("{db_path}{name}")
    } else {
        format!("{db_path}/{name}")
    }
}

/// Descriptor for [`CheckpointFormat::ColumnFamily`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnFamilyCheckpoint {
    /// Comparator the exporting engine used; import refuses a mismatch.
    pub db_comparator_name: String,
    pub sst_files: Vec<LiveFileMeta>,
}

/// One locally materialized range file inside a [`KeyValuesCheckpoint`] or
/// [`FullDbCheckpoint`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointFile {
    pub path: String,
    pub range: KeyRange,
    pub size: u64,
}

/// Descriptor for [`CheckpointFormat::KeyValues`].
///
/// `fetched_files` entries cover pairwise disjoint sub-ranges whose union is
/// a subset of `ranges`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValuesCheckpoint {
    pub ranges: Vec<KeyRange>,
    pub fetched_files: Vec<CheckpointFile>,
}

/// Descriptor for [`CheckpointFormat::FullDb`]. Read-side support is not
/// implemented in this revision; the deleter consumes `checkpoint_dir`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullDbCheckpoint {
    pub checkpoint_dir: String,
    pub fetched_files: Vec<CheckpointFile>,
}

fn encode_envelope<T: Serialize>(format: CheckpointFormat, value: &T) -> CheckpointResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    buf.write_u32::<LittleEndian>(ENVELOPE_MAGIC)
        .expect("vec write");
    buf.write_u16::<LittleEndian>(ENVELOPE_VERSION)
        .expect("vec write");
    buf.write_u16::<LittleEndian>(format.wire_tag())
        .expect("vec write");
    let body = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|err| CheckpointError::malformed(format!("encode descriptor: {err}")))?;
    buf.extend_from_slice(&body);
    Ok(buf)
}

fn decode_envelope<T: DeserializeOwned>(
    expected: CheckpointFormat,
    bytes: &[u8],
) -> CheckpointResult<T> {
    if bytes.len() < ENVELOPE_HEADER_LEN {
        return Err(CheckpointError::malformed(format!(
            "envelope payload truncated: {} bytes",
            bytes.len()
        )));
    }
    let magic = LittleEndian::read_u32(&bytes[0..4]);
    if magic != ENVELOPE_MAGIC {
        return Err(CheckpointError::malformed(format!(
            "bad envelope magic: {magic:#010x}"
        )));
    }
    let version = LittleEndian::read_u16(&bytes[4..6]);
    if version != ENVELOPE_VERSION {
        return Err(CheckpointError::malformed(format!(
            "unsupported envelope version: {version}"
        )));
    }
    let format = CheckpointFormat::from_wire_tag(LittleEndian::read_u16(&bytes[6..8]))?;
    if format != expected {
        return Err(CheckpointError::malformed(format!(
            "descriptor format mismatch: have {format}, want {expected}"
        )));
    }
    let (value, consumed) =
        bincode::serde::decode_from_slice(&bytes[ENVELOPE_HEADER_LEN..], bincode::config::standard())
            .map_err(|err| CheckpointError::malformed(format!("decode descriptor: {err}")))?;
    if consumed != bytes.len() - ENVELOPE_HEADER_LEN {
        return Err(CheckpointError::malformed("trailing bytes after descriptor"));
    }
    Ok(value)
}

impl ColumnFamilyCheckpoint {
    pub fn encode(&self) -> CheckpointResult<Vec<u8>> {
        encode_envelope(CheckpointFormat::ColumnFamily, self)
    }

    pub fn decode(bytes: &[u8]) -> CheckpointResult<Self> {
        decode_envelope(CheckpointFormat::ColumnFamily, bytes)
    }
}

impl KeyValuesCheckpoint {
    pub fn encode(&self) -> CheckpointResult<Vec<u8>> {
        encode_envelope(CheckpointFormat::KeyValues, self)
    }

    pub fn decode(bytes: &[u8]) -> CheckpointResult<Self> {
        decode_envelope(CheckpointFormat::KeyValues, bytes)
    }
}

impl FullDbCheckpoint {
    pub fn encode(&self) -> CheckpointResult<Vec<u8>> {
        encode_envelope(CheckpointFormat::FullDb, self)
    }

    pub fn decode(bytes: &[u8]) -> CheckpointResult<Self> {
        decode_envelope(CheckpointFormat::FullDb, bytes)
    }
}

/// Decodes the column-family descriptor out of an envelope.
pub fn column_family_checkpoint(
    checkpoint: &CheckpointMetaData,
) -> CheckpointResult<ColumnFamilyCheckpoint> {
    ColumnFamilyCheckpoint::decode(&checkpoint.serialized_checkpoint)
}

/// Decodes the key-values descriptor out of an envelope.
pub fn key_values_checkpoint(
    checkpoint: &CheckpointMetaData,
) -> CheckpointResult<KeyValuesCheckpoint> {
    KeyValuesCheckpoint::decode(&checkpoint.serialized_checkpoint)
}

/// Decodes the full-database descriptor out of an envelope.
pub fn full_db_checkpoint(checkpoint: &CheckpointMetaData) -> CheckpointResult<FullDbCheckpoint> {
    FullDbCheckpoint::decode(&checkpoint.serialized_checkpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file(name: &str) -> LiveFileMeta {
        LiveFileMeta {
            name: name.to_string(),
            db_path: "/var/data/cp".to_string(),
            size: 4096,
            file_number: 7,
            smallest_seqno: 10,
            largest_seqno: 900,
            smallest_key: b"aardvark".to_vec(),
            largest_key: b"zebra".to_vec(),
            num_reads_sampled: 3,
            being_compacted: false,
            num_entries: 128,
            num_deletions: 1,
            temperature: 0,
            oldest_blob_file_number: 0,
            oldest_ancester_time: 1_700_000_000,
            file_creation_time: 1_700_000_100,
            file_checksum: "abc123".to_string(),
            file_checksum_func_name: "crc64".to_string(),
            column_family_name: "RocksDBCheckpoint".to_string(),
            level: 0,
            fetched: false,
        }
    }

    #[test]
    fn column_family_round_trip() {
        let cf = ColumnFamilyCheckpoint {
            db_comparator_name: "bytewise".to_string(),
            sst_files: vec![sample_file("/000007.sst"), sample_file("/000008.sst")],
        };
        let bytes = cf.encode().unwrap();
        let decoded = ColumnFamilyCheckpoint::decode(&bytes).unwrap();
        assert_eq!(cf, decoded);
    }

    #[test]
    fn key_values_round_trip() {
        let kv = KeyValuesCheckpoint {
            ranges: vec![KeyRange::new(b"a".to_vec(), b"m".to_vec())],
            fetched_files: vec![CheckpointFile {
                path: "/tmp/cp/0001_0002.sst".to_string(),
                range: KeyRange::new(b"a".to_vec(), b"g".to_vec()),
                size: 512,
            }],
        };
        let bytes = kv.encode().unwrap();
        assert_eq!(kv, KeyValuesCheckpoint::decode(&bytes).unwrap());
    }

    #[test]
    fn full_db_round_trip() {
        let full = FullDbCheckpoint {
            checkpoint_dir: "/tmp/cp/full".to_string(),
            fetched_files: vec![],
        };
        let bytes = full.encode().unwrap();
        assert_eq!(full, FullDbCheckpoint::decode(&bytes).unwrap());
    }

    #[test]
    fn decode_rejects_wrong_format_tag() {
        let cf = ColumnFamilyCheckpoint::default();
        let bytes = cf.encode().unwrap();
        let err = KeyValuesCheckpoint::decode(&bytes).unwrap_err();
        assert!(matches!(err, CheckpointError::MalformedEnvelope(_)));
    }

    #[test]
    fn decode_rejects_garbage() {
        for bytes in [&b""[..], &b"\x01\x02"[..], &[0u8; 32][..]] {
            assert!(matches!(
                ColumnFamilyCheckpoint::decode(bytes),
                Err(CheckpointError::MalformedEnvelope(_))
            ));
        }
    }

    #[test]
    fn sst_path_join_tolerates_both_spellings() {
        assert_eq!(sst_file_path("/a/b", "/f.sst"), "/a/b/f.sst");
        assert_eq!(sst_file_path("/a/b", "f.sst"), "/a/b/f.sst");
        assert_eq!(sst_file_path("/a/b/", "f.sst"), "/a/b/f.sst");
    }

    #[test]
    fn checkpoint_id_display_is_fixed_width() {
        let id = CheckpointId::new(0xab, 0x1);
        assert_eq!(id.to_string().len(), 32);
    }
}
