//! Deterministic in-memory collaborators for exercising the fetch/read stack
//! without a network or a remote node.
//!
//! [`InMemoryTransport`] plays the source storage node: it serves scripted
//! file bytes and key/value pairs in small stream chunks, counts attempts per
//! unit, and can be told to fail the first N attempts of any unit mid-stream.
//! [`StaticDirectory`] is a fixed server directory. The builder functions
//! produce real on-disk source SSTs and matching envelopes.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::StreamExt;
use parking_lot::Mutex;

use crate::engine::{SstFileWriter, BYTEWISE_COMPARATOR};
use crate::envelope::{
    CheckpointFile, CheckpointFormat, CheckpointId, CheckpointMetaData, ColumnFamilyCheckpoint,
    KeyValue, KeyValuesCheckpoint, LiveFileMeta, NodeId,
};
use crate::error::{CheckpointError, CheckpointResult};
use crate::fetch::{
    CheckpointByteStream, CheckpointKeyValuesStream, CheckpointTransport, FetchCheckpointReply,
    FetchKeyValuesReply, StorageNodeDirectory,
};
use crate::range::KeyRange;

/// Bytes per reply in a scripted file stream.
const FILE_REPLY_BYTES: usize = 8 * 1024;

/// Pairs per reply in a scripted key/value stream.
const KV_REPLY_PAIRS: usize = 4;

/// A scripted source node serving checkpoint data from memory.
#[derive(Default)]
pub struct InMemoryTransport {
    files: Mutex<HashMap<String, Vec<u8>>>,
    pairs: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    fail_counts: Mutex<HashMap<String, u32>>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl InMemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers the byte content served for `name` (leading separators are
    /// ignored when matching).
    pub fn add_file(&self, name: &str, bytes: Vec<u8>) {
        self.files
            .lock()
            .insert(name.trim_start_matches('/').to_string(), bytes);
    }

    /// Reads `path` and registers its content under `name`.
    pub fn add_file_from_disk(&self, name: &str, path: &Path) {
        let bytes = std::fs::read(path).expect("read source file");
        self.add_file(name, bytes);
    }

    /// Adds pairs served by key/value streams.
    pub fn add_pairs(&self, pairs: &[(&[u8], &[u8])]) {
        let mut map = self.pairs.lock();
        for (key, value) in pairs {
            map.insert(key.to_vec(), value.to_vec());
        }
    }

    /// Scripts the first `count` attempts for `unit` to fail mid-stream.
    /// Units are file names for file fetches and `range.to_string()` for
    /// range fetches.
    pub fn fail_first_attempts(&self, unit: &str, count: u32) {
        self.fail_counts
            .lock()
            .insert(unit.trim_start_matches('/').to_string(), count);
    }

    /// Number of stream opens observed for `unit`.
    pub fn attempts(&self, unit: &str) -> u32 {
        self.attempts
            .lock()
            .get(unit.trim_start_matches('/'))
            .copied()
            .unwrap_or(0)
    }

    /// Records one attempt; returns true when this attempt should fail.
    fn begin_attempt(&self, unit: &str) -> bool {
        let mut attempts = self.attempts.lock();
        let seen = attempts.entry(unit.to_string()).or_insert(0);
        *seen += 1;
        let current = *seen;
        drop(attempts);
        self.fail_counts
            .lock()
            .get(unit)
            .is_some_and(|count| current <= *count)
    }
}

impl CheckpointTransport for InMemoryTransport {
    fn fetch_checkpoint(
        &self,
        _checkpoint_id: CheckpointId,
        file_name: &str,
    ) -> BoxFuture<'_, CheckpointResult<CheckpointByteStream>> {
        let name = file_name.trim_start_matches('/').to_string();
        Box::pin(async move {
            let fail = self.begin_attempt(&name);
            let bytes = self
                .files
                .lock()
                .get(&name)
                .cloned()
                .ok_or_else(|| CheckpointError::CheckpointNotFound(name.clone()))?;

            let mut replies: Vec<CheckpointResult<FetchCheckpointReply>> = bytes
                .chunks(FILE_REPLY_BYTES)
                .map(|chunk| {
                    Ok(FetchCheckpointReply {
                        data: chunk.to_vec(),
                    })
                })
                .collect();
            if fail {
                // Deliver half the stream, then break the connection.
                replies.truncate(replies.len() / 2);
                replies.push(Err(CheckpointError::transport("scripted stream failure")));
            }
            Ok(futures::stream::iter(replies).boxed())
        })
    }

    fn fetch_checkpoint_key_values(
        &self,
        _checkpoint_id: CheckpointId,
        range: &KeyRange,
    ) -> BoxFuture<'_, CheckpointResult<CheckpointKeyValuesStream>> {
        let range = range.clone();
        Box::pin(async move {
            let fail = self.begin_attempt(&range.to_string());
            let pairs: Vec<KeyValue> = self
                .pairs
                .lock()
                .iter()
                .filter(|(key, _)| range.contains(key))
                .map(|(key, value)| KeyValue::new(key.clone(), value.clone()))
                .collect();

            let mut replies: Vec<CheckpointResult<FetchKeyValuesReply>> = pairs
                .chunks(KV_REPLY_PAIRS)
                .map(|chunk| {
                    Ok(FetchKeyValuesReply {
                        data: chunk.to_vec(),
                    })
                })
                .collect();
            if fail {
                replies.truncate(replies.len() / 2);
                replies.push(Err(CheckpointError::transport("scripted stream failure")));
            }
            Ok(futures::stream::iter(replies).boxed())
        })
    }
}

/// A fixed node-id → transport mapping.
#[derive(Default)]
pub struct StaticDirectory {
    nodes: Mutex<HashMap<NodeId, Arc<dyn CheckpointTransport>>>,
}

impl StaticDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, node: NodeId, transport: Arc<dyn CheckpointTransport>) {
        self.nodes.lock().insert(node, transport);
    }
}

impl StorageNodeDirectory for StaticDirectory {
    fn resolve(
        &self,
        node: NodeId,
    ) -> BoxFuture<'_, CheckpointResult<Arc<dyn CheckpointTransport>>> {
        Box::pin(async move {
            self.nodes
                .lock()
                .get(&node)
                .cloned()
                .ok_or_else(|| CheckpointError::CheckpointNotFound(node.to_string()))
        })
    }
}

/// Writes a real SST into `source_dir` and returns its live-file metadata as
/// the source node would export it.
pub fn write_source_sst(
    source_dir: &Path,
    name: &str,
    pairs: &[(&[u8], &[u8])],
) -> LiveFileMeta {
    let path = source_dir.join(name.trim_start_matches('/'));
    let mut writer = SstFileWriter::new();
    writer.open(&path).expect("open source sst");
    for (key, value) in pairs {
        writer.put(key, value).expect("write source sst");
    }
    writer.finish().expect("finish source sst");

    let size = std::fs::metadata(&path).expect("stat source sst").len();
    LiveFileMeta {
        name: name.to_string(),
        db_path: source_dir.to_string_lossy().into_owned(),
        size,
        smallest_key: pairs.first().map(|(k, _)| k.to_vec()).unwrap_or_default(),
        largest_key: pairs.last().map(|(k, _)| k.to_vec()).unwrap_or_default(),
        num_entries: pairs.len() as u64,
        column_family_name: "shard".to_string(),
        ..LiveFileMeta::default()
    }
}

/// Assembles a column-family envelope over already written source files.
pub fn column_family_envelope(
    checkpoint_id: CheckpointId,
    source: NodeId,
    ranges: Vec<KeyRange>,
    sst_files: Vec<LiveFileMeta>,
) -> CheckpointMetaData {
    let descriptor = ColumnFamilyCheckpoint {
        db_comparator_name: BYTEWISE_COMPARATOR.to_string(),
        sst_files,
    };
    CheckpointMetaData {
        checkpoint_id,
        format: CheckpointFormat::ColumnFamily,
        ranges,
        src: vec![source],
        serialized_checkpoint: descriptor.encode().expect("encode descriptor"),
    }
}

/// Assembles a key-values envelope, optionally carrying prior progress.
pub fn key_values_envelope(
    checkpoint_id: CheckpointId,
    source: NodeId,
    ranges: Vec<KeyRange>,
    fetched_files: Vec<CheckpointFile>,
) -> CheckpointMetaData {
    let descriptor = KeyValuesCheckpoint {
        ranges: ranges.clone(),
        fetched_files,
    };
    CheckpointMetaData {
        checkpoint_id,
        format: CheckpointFormat::KeyValues,
        ranges,
        src: vec![source],
        serialized_checkpoint: descriptor.encode().expect("encode descriptor"),
    }
}
