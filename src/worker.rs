//! The checkpoint storage worker: a fixed-size pool of OS threads that owns
//! the engine's handles and serializes every native call.
//!
//! No other component touches the database or column-family handles. The
//! async side posts [`ReaderAction`]s over a channel and awaits a oneshot
//! completion; within one reader, actions execute in submission order.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::config::CheckpointConfig;
use crate::engine::{
    ColumnFamily, ColumnFamilyDescriptor, ColumnFamilyOptions, Db, DbIterator,
    ExportImportFilesMetaData, ImportColumnFamilyOptions, LiveFileMetaData, Options, ReadOptions,
    Status, WriteOptions, DEFAULT_CF,
};
use crate::envelope::{
    column_family_checkpoint, CheckpointFormat, CheckpointMetaData, ColumnFamilyCheckpoint,
    KeyValue,
};
use crate::error::{status_to_error, CheckpointError, CheckpointResult};

/// Column family a checkpoint is imported into. Part of the on-disk protocol.
pub const CHECKPOINT_CF: &str = "RocksDBCheckpoint";

/// Subdirectory of the fetched checkpoint that holds the live reader DB.
pub const READER_SUBDIR: &str = "/reader";

/// Sentinel key in the default CF marking a completed import.
pub const READER_INITIALIZED_KEY: &[u8] = b"\xff\xff/ReaderInitialized";

/// Fixed accounting overhead per returned pair, on top of key and value
/// bytes: two slice headers.
pub(crate) const PER_PAIR_OVERHEAD: usize = 32;

/// Engine iterator plus the exclusive upper bound it was created with.
pub(crate) struct CheckpointIteratorState {
    pub(crate) iter: DbIterator,
    pub(crate) end: Vec<u8>,
}

/// Handles owned by the worker. `db`/`cf` are only ever touched from pool
/// threads once the reader is initialized.
#[derive(Default)]
pub(crate) struct NativeState {
    pub(crate) db: Option<Db>,
    pub(crate) cf: Option<ColumnFamily>,
}

pub(crate) struct ReaderShared {
    pub(crate) state: Mutex<NativeState>,
    pub(crate) config: CheckpointConfig,
}

/// Work items the reader posts to the pool.
pub(crate) enum ReaderAction {
    Open {
        checkpoint: CheckpointMetaData,
        done: oneshot::Sender<CheckpointResult<()>>,
    },
    ReadRange {
        row_limit: usize,
        byte_limit: usize,
        iterator: Arc<Mutex<CheckpointIteratorState>>,
        done: oneshot::Sender<CheckpointResult<Vec<KeyValue>>>,
    },
    Close {
        path: PathBuf,
        delete_on_close: bool,
        done: oneshot::Sender<()>,
    },
}

/// The worker pool itself. Dropping it (or calling [`stop`](Self::stop))
/// closes the channel and joins the threads.
pub(crate) struct ReaderPool {
    tx: Option<Sender<ReaderAction>>,
    threads: Vec<thread::JoinHandle<()>>,
    shared: Arc<ReaderShared>,
}

impl ReaderPool {
    pub(crate) fn new(config: CheckpointConfig) -> Self {
        let config = config.normalized();
        let shared = Arc::new(ReaderShared {
            state: Mutex::new(NativeState::default()),
            config: config.clone(),
        });
        let (tx, rx) = unbounded::<ReaderAction>();
        let mut threads = Vec::with_capacity(config.reader_parallelism);
        for i in 0..config.reader_parallelism {
            let rx = rx.clone();
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("ckpt-reader-{i}"))
                .spawn(move || worker_loop(rx, shared))
                .expect("spawn checkpoint reader thread");
            threads.push(handle);
        }
        Self {
            tx: Some(tx),
            threads,
            shared,
        }
    }

    pub(crate) fn shared(&self) -> Arc<ReaderShared> {
        Arc::clone(&self.shared)
    }

    pub(crate) fn post(&self, action: ReaderAction) -> CheckpointResult<()> {
        match &self.tx {
            Some(tx) => tx
                .send(action)
                .map_err(|_| CheckpointError::internal("checkpoint worker pool stopped")),
            None => Err(CheckpointError::internal("checkpoint worker pool stopped")),
        }
    }

    /// Closes the channel and joins every worker thread. Idempotent.
    pub(crate) fn stop(&mut self) {
        self.tx = None;
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ReaderPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(rx: Receiver<ReaderAction>, shared: Arc<ReaderShared>) {
    while let Ok(action) = rx.recv() {
        match action {
            ReaderAction::Open { checkpoint, done } => {
                let _ = done.send(open_action(&shared, &checkpoint));
            }
            ReaderAction::ReadRange {
                row_limit,
                byte_limit,
                iterator,
                done,
            } => {
                let _ = done.send(read_range_action(row_limit, byte_limit, &iterator));
            }
            ReaderAction::Close {
                path,
                delete_on_close,
                done,
            } => {
                close_action(&shared, &path, delete_on_close);
                let _ = done.send(());
            }
        }
    }
}

/// Mirrors the engine's per-file metadata from the envelope descriptor,
/// field for field.
pub(crate) fn export_metadata(checkpoint: &ColumnFamilyCheckpoint) -> ExportImportFilesMetaData {
    let mut metadata = ExportImportFilesMetaData {
        db_comparator_name: checkpoint.db_comparator_name.clone(),
        files: Vec::with_capacity(checkpoint.sst_files.len()),
    };
    for file in &checkpoint.sst_files {
        metadata.files.push(LiveFileMetaData {
            name: file.name.clone(),
            db_path: file.db_path.clone(),
            size: file.size,
            file_number: file.file_number,
            smallest_seqno: file.smallest_seqno,
            largest_seqno: file.largest_seqno,
            smallest_key: file.smallest_key.clone(),
            largest_key: file.largest_key.clone(),
            num_reads_sampled: file.num_reads_sampled,
            being_compacted: file.being_compacted,
            num_entries: file.num_entries,
            num_deletions: file.num_deletions,
            temperature: file.temperature,
            oldest_blob_file_number: file.oldest_blob_file_number,
            oldest_ancester_time: file.oldest_ancester_time,
            file_creation_time: file.file_creation_time,
            file_checksum: file.file_checksum.clone(),
            file_checksum_func_name: file.file_checksum_func_name.clone(),
            column_family_name: file.column_family_name.clone(),
            level: file.level,
        });
    }
    metadata
}

/// Computes the live reader directory for a column-family checkpoint.
pub(crate) fn reader_db_path(checkpoint: &ColumnFamilyCheckpoint) -> CheckpointResult<PathBuf> {
    let first = checkpoint.sst_files.first().ok_or_else(|| {
        CheckpointError::internal("column family checkpoint has no sst files")
    })?;
    Ok(PathBuf::from(format!("{}{}", first.db_path, READER_SUBDIR)))
}

fn log_engine_error(status: &Status, method: &str) {
    if status.is_timed_out() {
        warn!(method, status = %status, "checkpoint reader engine error");
    } else {
        error!(method, status = %status, "checkpoint reader engine error");
    }
}

fn read_options() -> ReadOptions {
    ReadOptions::default()
}

fn open_action(shared: &ReaderShared, checkpoint: &CheckpointMetaData) -> CheckpointResult<()> {
    debug!(checkpoint = %checkpoint, "checkpoint reader init begin");

    if checkpoint.format != CheckpointFormat::ColumnFamily {
        debug!(checkpoint = %checkpoint, "unsupported format for checkpoint reader");
        return Err(CheckpointError::NotImplemented(
            "checkpoint reader supports only column-family checkpoints",
        ));
    }

    let rocks_cf = column_family_checkpoint(checkpoint)?;
    let path = reader_db_path(&rocks_cf)?;

    if let Err(status) = try_open_for_read(shared, &path) {
        debug!(path = %path.display(), status = %status, "re-open failed, importing from scratch");
        let _ = std::fs::remove_dir_all(&path);
        import_checkpoint(&path, &rocks_cf, &shared.config).map_err(|status| {
            log_engine_error(&status, "import_checkpoint");
            status_to_error(&status)
        })?;
        try_open_for_read(shared, &path).map_err(|status| {
            log_engine_error(&status, "open_after_import");
            status_to_error(&status)
        })?;
    }

    let cf_name = {
        let state = shared.state.lock();
        state
            .cf
            .as_ref()
            .map(|cf| cf.name().to_string())
            .unwrap_or_default()
    };
    debug!(path = %path.display(), column_family = %cf_name, "checkpoint reader init end");
    Ok(())
}

/// The read-only open protocol.
///
/// Aborted forces the caller down the import path; any other status is a
/// hard failure of this attempt.
fn try_open_for_read(shared: &ReaderShared, path: &PathBuf) -> Result<(), Status> {
    let columns = Db::list_column_families(path).unwrap_or_default();
    if !columns.iter().any(|name| name == DEFAULT_CF)
        || !columns.iter().any(|name| name == CHECKPOINT_CF)
    {
        return Err(Status::aborted("checkpoint column families not present"));
    }

    let descriptors: Vec<ColumnFamilyDescriptor> = columns
        .iter()
        .map(|name| ColumnFamilyDescriptor::new(name.clone(), ColumnFamilyOptions::default()))
        .collect();
    let db = Db::open_for_read_only(&Options::default(), path, &descriptors).map_err(
        |status| {
            log_engine_error(&status, "open_for_read_only");
            status
        },
    )?;

    let initialized = db
        .get(&read_options(), &db.default_cf(), READER_INITIALIZED_KEY)
        .map_err(|status| {
            log_engine_error(&status, "check_init_state");
            status
        })?;
    if initialized.is_none() {
        drop(db);
        Db::destroy(path)?;
        debug!(path = %path.display(), "reader db missing init sentinel, discarded");
        return Err(Status::aborted("reader db was never initialized"));
    }

    let cf = db
        .cf_handle(CHECKPOINT_CF)
        .ok_or_else(|| Status::aborted("checkpoint column family vanished"))?;
    debug!(path = %path.display(), column_family = CHECKPOINT_CF, "checkpoint column family cached");

    let mut state = shared.state.lock();
    state.db = Some(db);
    state.cf = Some(cf);
    Ok(())
}

/// The import protocol: open read-write, import the column family with copy
/// semantics, persist the init sentinel, close.
fn import_checkpoint(
    path: &PathBuf,
    checkpoint: &ColumnFamilyCheckpoint,
    config: &CheckpointConfig,
) -> Result<(), Status> {
    let options = Options {
        create_if_missing: true,
    };
    let descriptors = vec![ColumnFamilyDescriptor::new(
        DEFAULT_CF,
        ColumnFamilyOptions::default(),
    )];
    let db = Db::open(&options, path, &descriptors).map_err(|status| {
        log_engine_error(&status, "import_open");
        status
    })?;

    let metadata = export_metadata(checkpoint);
    let import_options = ImportColumnFamilyOptions { move_files: false };
    db.create_column_family_with_import(
        ColumnFamilyOptions::default(),
        CHECKPOINT_CF,
        &import_options,
        &metadata,
    )
    .map_err(|status| {
        log_engine_error(&status, "import_column_family");
        status
    })?;
    debug!(path = %path.display(), "checkpoint column family imported");

    let write_options = WriteOptions {
        sync: !config.unsafe_auto_fsync,
    };
    db.put(
        &write_options,
        &db.default_cf(),
        READER_INITIALIZED_KEY,
        b"1",
    )
    .map_err(|status| {
        log_engine_error(&status, "persist_init_key");
        status
    })?;

    // Close without destroying; the re-open validates the result.
    drop(db);
    Ok(())
}

fn read_range_action(
    row_limit: usize,
    byte_limit: usize,
    iterator: &Arc<Mutex<CheckpointIteratorState>>,
) -> CheckpointResult<Vec<KeyValue>> {
    debug!(row_limit, byte_limit, "checkpoint read range begin");

    let mut result = Vec::new();
    if row_limit == 0 || byte_limit == 0 {
        return Ok(result);
    }

    let mut state = iterator.lock();
    let end = state.end.clone();
    let iter = &mut state.iter;
    let mut accumulated = 0usize;
    while iter.valid() && iter.key() < end.as_slice() {
        let pair = KeyValue::new(iter.key().to_vec(), iter.value().to_vec());
        accumulated += PER_PAIR_OVERHEAD + pair.key.len() + pair.value.len();
        result.push(pair);
        iter.next();
        if result.len() >= row_limit || accumulated >= byte_limit {
            break;
        }
    }

    if let Err(status) = iter.status() {
        log_engine_error(&status, "read_range");
        return Err(status_to_error(&status));
    }

    if result.is_empty() {
        Err(CheckpointError::EndOfStream)
    } else {
        Ok(result)
    }
}

fn close_action(shared: &ReaderShared, path: &PathBuf, delete_on_close: bool) {
    {
        let mut state = shared.state.lock();
        state.cf = None;
        state.db = None;
    }
    if delete_on_close {
        if let Err(status) = Db::destroy(path) {
            log_engine_error(&status, "destroy");
        } else {
            debug!(path = %path.display(), method = "destroy", "checkpoint reader");
        }
    }
    debug!(path = %path.display(), method = "close", "checkpoint reader");
}
