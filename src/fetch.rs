//! The checkpoint fetcher: pulls a remote checkpoint into a local directory.
//!
//! Two sub-protocols, dispatched by envelope format:
//!
//! - **file fetch** copies one SST per remote file over an ordered byte
//!   stream;
//! - **range fetch** streams key/value pairs for each uncovered sub-range
//!   and materializes a fresh SST through [`SstWriter`].
//!
//! Every fetched file and range is an independently resumable unit: the
//! envelope is updated and persisted through the progress callback as each
//! unit completes, so a crash-restart skips everything already marked
//! fetched. Per-unit failures retry up to a bounded attempt count; the
//! transport and server directory are injected seams so tests (and
//! deterministic simulation) can script failures.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{try_join_all, BoxFuture};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::CheckpointConfig;
use crate::envelope::{
    column_family_checkpoint, key_values_checkpoint, CheckpointFile, CheckpointFormat,
    CheckpointId, CheckpointMetaData, KeyValue, NodeId,
};
use crate::error::{CheckpointError, CheckpointResult};
use crate::range::{uncovered_ranges, KeyRange};
use crate::writer::SstWriter;

/// One reply in a file-fetch stream: the next ordered run of file bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchCheckpointReply {
    pub data: Vec<u8>,
}

/// One reply in a key-values-fetch stream: the next ordered run of pairs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchKeyValuesReply {
    pub data: Vec<KeyValue>,
}

pub type CheckpointByteStream = BoxStream<'static, CheckpointResult<FetchCheckpointReply>>;
pub type CheckpointKeyValuesStream = BoxStream<'static, CheckpointResult<FetchKeyValuesReply>>;

/// The streaming RPC surface a source storage node exposes.
///
/// Streams are ordered; the stream ending is the success signal. An `Err`
/// item is a mid-stream failure and the fetcher treats it as retryable.
pub trait CheckpointTransport: Send + Sync {
    /// Opens an ordered byte stream over one checkpoint file.
    fn fetch_checkpoint(
        &self,
        checkpoint_id: CheckpointId,
        file_name: &str,
    ) -> BoxFuture<'_, CheckpointResult<CheckpointByteStream>>;

    /// Opens an ordered key/value stream over one key range.
    fn fetch_checkpoint_key_values(
        &self,
        checkpoint_id: CheckpointId,
        range: &KeyRange,
    ) -> BoxFuture<'_, CheckpointResult<CheckpointKeyValuesStream>>;
}

/// Resolves a node id to its RPC interface via the server directory.
///
/// Implementations surface [`CheckpointError::CheckpointNotFound`] for
/// absent nodes; transient lookup failures are retried by the fetcher.
pub trait StorageNodeDirectory: Send + Sync {
    fn resolve(&self, node: NodeId) -> BoxFuture<'_, CheckpointResult<Arc<dyn CheckpointTransport>>>;
}

/// Deterministic failure-injection policy for simulation and tests.
pub trait FaultInjection: Send + Sync {
    /// When true, the first otherwise-successful attempt for `file_name` is
    /// converted into a retryable failure.
    fn fail_first_fetch_attempt(&self, file_name: &str) -> bool {
        let _ = file_name;
        false
    }
}

/// The production policy: no injected faults.
pub struct NoFaults;

impl FaultInjection for NoFaults {}

/// Async callback persisting fetch progress to durable metadata storage.
///
/// Invoked with the updated envelope after each completed unit; a failure
/// aborts the fetch.
pub type ProgressCallback =
    Arc<dyn Fn(CheckpointMetaData) -> BoxFuture<'static, CheckpointResult<()>> + Send + Sync>;

/// Fetches remote checkpoints into local directories.
pub struct CheckpointFetcher {
    directory: Arc<dyn StorageNodeDirectory>,
    config: CheckpointConfig,
    faults: Arc<dyn FaultInjection>,
}

impl CheckpointFetcher {
    pub fn new(directory: Arc<dyn StorageNodeDirectory>, config: CheckpointConfig) -> Self {
        Self {
            directory,
            config: config.normalized(),
            faults: Arc::new(NoFaults),
        }
    }

    /// Replaces the fault-injection policy (simulation only).
    pub fn with_fault_injection(mut self, faults: Arc<dyn FaultInjection>) -> Self {
        self.faults = faults;
        self
    }

    /// Fetches `checkpoint` into `target_dir`.
    ///
    /// Returns the updated envelope: every file entry carries its local path
    /// and fetched mark. The envelope handed in is persisted through
    /// `progress` at each completed file or once per range batch, so a
    /// partial fetch can resume.
    pub async fn fetch(
        &self,
        checkpoint: CheckpointMetaData,
        target_dir: impl AsRef<Path>,
        progress: Option<ProgressCallback>,
    ) -> CheckpointResult<CheckpointMetaData> {
        let dir = target_dir.as_ref().to_path_buf();
        info!(checkpoint = %checkpoint, dir = %dir.display(), "fetch checkpoint begin");
        debug_assert!(!checkpoint.ranges.is_empty());

        tokio::fs::create_dir_all(&dir).await?;
        let format = checkpoint.format;
        let state = Arc::new(tokio::sync::Mutex::new(checkpoint));

        match format {
            CheckpointFormat::ColumnFamily => {
                let file_count = {
                    let meta = state.lock().await;
                    let rocks_cf = column_family_checkpoint(&meta)?;
                    debug!(checkpoint = %meta, files = rocks_cf.sst_files.len(), "fetching column family checkpoint");
                    rocks_cf.sst_files.len()
                };
                try_join_all((0..file_count).map(|idx| {
                    self.fetch_file(Arc::clone(&state), idx, dir.clone(), progress.clone())
                }))
                .await?;
            }
            CheckpointFormat::KeyValues => {
                self.fetch_ranges(Arc::clone(&state), dir.clone(), progress.clone())
                    .await?;
            }
            CheckpointFormat::FullDb => {
                return Err(CheckpointError::NotImplemented(
                    "fetching full-database checkpoints",
                ));
            }
        }

        let result = state.lock().await.clone();
        info!(checkpoint = %result, "fetch checkpoint end");
        Ok(result)
    }

    /// Fetches a single SST file. A no-op when the envelope already marks
    /// this entry fetched into `dir`.
    async fn fetch_file(
        &self,
        state: Arc<tokio::sync::Mutex<CheckpointMetaData>>,
        idx: usize,
        dir: PathBuf,
        progress: Option<ProgressCallback>,
    ) -> CheckpointResult<()> {
        let (checkpoint_id, source, remote_file) = {
            let meta = state.lock().await;
            let rocks_cf = column_family_checkpoint(&meta)?;
            let entry = rocks_cf
                .sst_files
                .get(idx)
                .ok_or_else(|| CheckpointError::internal("sst file index out of bounds"))?;
            // Skip fetched file.
            if entry.fetched && Path::new(&entry.db_path) == dir.as_path() {
                return Ok(());
            }
            let source = meta
                .src
                .first()
                .copied()
                .ok_or_else(|| CheckpointError::internal("checkpoint has no source node"))?;
            (meta.checkpoint_id, source, entry.name.clone())
        };
        let local_file = dir.join(remote_file.trim_start_matches('/'));

        let transport = self.resolve_source(source).await?;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self
                .fetch_file_attempt(
                    transport.as_ref(),
                    checkpoint_id,
                    &remote_file,
                    &local_file,
                    attempt,
                )
                .await
            {
                Ok(data_size) => {
                    let mut meta = state.lock().await;
                    let mut rocks_cf = column_family_checkpoint(&meta)?;
                    rocks_cf.sst_files[idx].db_path = dir.to_string_lossy().into_owned();
                    rocks_cf.sst_files[idx].fetched = true;
                    meta.serialized_checkpoint = rocks_cf.encode()?;
                    if let Some(callback) = &progress {
                        callback(meta.clone()).await?;
                    }
                    info!(
                        remote_file = %remote_file,
                        local_file = %local_file.display(),
                        attempt,
                        data_size,
                        "fetch checkpoint file end"
                    );
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        remote_file = %remote_file,
                        local_file = %local_file.display(),
                        attempt,
                        error = %err,
                        "fetch checkpoint file error"
                    );
                    if attempt >= self.config.max_fetch_retries {
                        return Err(err);
                    }
                }
            }
        }
    }

    async fn fetch_file_attempt(
        &self,
        transport: &dyn CheckpointTransport,
        checkpoint_id: CheckpointId,
        remote_file: &str,
        local_file: &Path,
        attempt: u32,
    ) -> CheckpointResult<u64> {
        info!(
            remote_file = %remote_file,
            local_file = %local_file.display(),
            attempt,
            "fetch checkpoint file begin"
        );

        delete_file(local_file).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(local_file)
            .await?;

        let mut stream = transport
            .fetch_checkpoint(checkpoint_id, remote_file)
            .await?;
        debug!(
            remote_file = %remote_file,
            local_file = %local_file.display(),
            attempt,
            "fetch checkpoint file receiving data"
        );

        let mut offset: u64 = 0;
        while let Some(reply) = stream.next().await {
            let reply = reply?;
            file.write_all(&reply.data).await?;
            file.flush().await?;
            offset += reply.data.len() as u64;
        }

        // The stream ending is the success signal; the simulation hook may
        // turn the first success into one extra retry.
        if attempt == 1 && self.faults.fail_first_fetch_attempt(remote_file) {
            return Err(CheckpointError::transport(
                "injected failure on first fetch attempt",
            ));
        }

        file.sync_all().await?;
        Ok(offset)
    }

    /// Fetches every sub-range of a key-values checkpoint not already
    /// covered by `fetched_files`, then persists progress once.
    async fn fetch_ranges(
        &self,
        state: Arc<tokio::sync::Mutex<CheckpointMetaData>>,
        dir: PathBuf,
        progress: Option<ProgressCallback>,
    ) -> CheckpointResult<()> {
        let (requested, covered) = {
            let meta = state.lock().await;
            let descriptor = key_values_checkpoint(&meta)?;
            info!(
                checkpoint = %meta,
                requested = descriptor.ranges.len(),
                covered = descriptor.fetched_files.len(),
                "fetch checkpoint ranges"
            );
            let covered: Vec<KeyRange> = descriptor
                .fetched_files
                .iter()
                .map(|file| file.range.clone())
                .collect();
            (descriptor.ranges, covered)
        };

        let gaps = uncovered_ranges(&requested, &covered);
        try_join_all(
            gaps.into_iter()
                .map(|range| self.fetch_range(Arc::clone(&state), range, dir.clone())),
        )
        .await?;

        if let Some(callback) = &progress {
            let meta = state.lock().await;
            callback(meta.clone()).await?;
        }
        Ok(())
    }

    /// Streams one sub-range into a freshly named local SST.
    async fn fetch_range(
        &self,
        state: Arc<tokio::sync::Mutex<CheckpointMetaData>>,
        range: KeyRange,
        dir: PathBuf,
    ) -> CheckpointResult<()> {
        let (checkpoint_id, source) = {
            let meta = state.lock().await;
            let descriptor = key_values_checkpoint(&meta)?;
            for file in &descriptor.fetched_files {
                debug_assert!(
                    !file.range.intersects(&range),
                    "requested range overlaps an already fetched file"
                );
            }
            let source = meta
                .src
                .first()
                .copied()
                .ok_or_else(|| CheckpointError::internal("checkpoint has no source node"))?;
            (meta.checkpoint_id, source)
        };

        let suffix: u64 = rand::random();
        let local_file = dir.join(format!("{:016x}_{:016x}.sst", checkpoint_id.hi(), suffix));
        info!(
            checkpoint = %checkpoint_id,
            range = %range,
            local_file = %local_file.display(),
            "fetch checkpoint range"
        );

        let transport = self.resolve_source(source).await?;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self
                .fetch_range_attempt(
                    transport.as_ref(),
                    checkpoint_id,
                    &range,
                    &local_file,
                    attempt,
                )
                .await
            {
                Ok(total_bytes) => {
                    if total_bytes > 0 {
                        let mut meta = state.lock().await;
                        let mut descriptor = key_values_checkpoint(&meta)?;
                        descriptor.fetched_files.push(CheckpointFile {
                            path: local_file.to_string_lossy().into_owned(),
                            range: range.clone(),
                            size: total_bytes,
                        });
                        meta.serialized_checkpoint = descriptor.encode()?;
                    }
                    info!(
                        checkpoint = %checkpoint_id,
                        range = %range,
                        local_file = %local_file.display(),
                        attempt,
                        total_bytes,
                        "fetch checkpoint range end"
                    );
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        checkpoint = %checkpoint_id,
                        range = %range,
                        local_file = %local_file.display(),
                        attempt,
                        error = %err,
                        "fetch checkpoint range error"
                    );
                    if attempt >= self.config.max_fetch_retries {
                        return Err(err);
                    }
                }
            }
        }
    }

    async fn fetch_range_attempt(
        &self,
        transport: &dyn CheckpointTransport,
        checkpoint_id: CheckpointId,
        range: &KeyRange,
        local_file: &Path,
        attempt: u32,
    ) -> CheckpointResult<u64> {
        info!(
            checkpoint = %checkpoint_id,
            range = %range,
            local_file = %local_file.display(),
            attempt,
            "fetch checkpoint range begin"
        );

        delete_file(local_file).await?;
        let mut writer = SstWriter::new();
        writer.open(local_file)?;

        let mut stream = transport
            .fetch_checkpoint_key_values(checkpoint_id, range)
            .await?;
        debug!(
            checkpoint = %checkpoint_id,
            range = %range,
            attempt,
            "fetch checkpoint key values receiving data"
        );

        let mut total_bytes: u64 = 0;
        let streamed: CheckpointResult<()> = async {
            while let Some(reply) = stream.next().await {
                let reply = reply?;
                for pair in reply.data {
                    writer.write(&pair.key, &pair.value)?;
                    total_bytes += (pair.key.len() + pair.value.len()) as u64;
                }
            }
            Ok(())
        }
        .await;

        match streamed {
            Ok(()) => {
                if total_bytes > 0 {
                    writer.finish()?;
                    if !local_file.exists() {
                        // Finalize claims success but produced nothing; force
                        // another attempt rather than record a phantom file.
                        warn!(
                            local_file = %local_file.display(),
                            attempt,
                            total_bytes,
                            "fetch checkpoint range end file not found"
                        );
                        return Err(CheckpointError::internal(
                            "finalized range file missing on disk",
                        ));
                    }
                } else {
                    // Empty range: leave no file behind.
                    writer.finish()?;
                }
                Ok(total_bytes)
            }
            Err(err) => {
                // Salvage whatever was streamed; a finalize failure replaces
                // the stream error.
                if total_bytes > 0 {
                    writer.finish()?;
                }
                Err(err)
            }
        }
    }

    /// Resolves the source node's transport, retrying transient directory
    /// failures indefinitely.
    async fn resolve_source(&self, node: NodeId) -> CheckpointResult<Arc<dyn CheckpointTransport>> {
        loop {
            match self.directory.resolve(node).await {
                Ok(transport) => return Ok(transport),
                Err(err) if err.is_transient_lookup() => {
                    debug!(node = %node, error = %err, "server directory lookup retrying");
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Err(err) => {
                    warn!(node = %node, error = %err, "source node lookup failed");
                    return Err(err);
                }
            }
        }
    }
}

async fn delete_file(path: &Path) -> CheckpointResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
