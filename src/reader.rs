//! Checkpoint readers.
//!
//! Two very different payloads hide behind one constructor:
//!
//! - [`RangeReader`] imports a column-family checkpoint into a local engine
//!   instance and serves range-bounded key/value batches through
//!   [`CheckpointIterator`]s. All engine work happens on the storage worker
//!   pool; the reader itself only posts actions and awaits completions.
//! - [`FileChunkReader`] streams the raw bytes of one SST file from a
//!   previously fetched checkpoint directory.
//!
//! They share only `init`/`close`, so [`CheckpointReader`] models them as a
//! sum type rather than forcing both "next" shapes into one signature.

use std::alloc::Layout;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::sync::{oneshot, OnceCell};
use tracing::{debug, warn};

use crate::config::CheckpointConfig;
use crate::engine::ReadOptions;
use crate::envelope::{
    column_family_checkpoint, sst_file_path, CheckpointFormat, CheckpointMetaData, KeyValue,
};
use crate::error::{status_to_error, CheckpointError, CheckpointResult};
use crate::range::KeyRange;
use crate::worker::{
    reader_db_path, CheckpointIteratorState, ReaderAction, ReaderPool, ReaderShared,
};

/// Disk block size for file-mode chunk reads.
const FILE_CHUNK_BYTES: usize = 64 * 1024;

/// Alignment of file-mode chunk buffers: one page, as uncached/direct file
/// modes require of buffer pointers and lengths.
const FILE_CHUNK_ALIGN: usize = 4096;

/// A heap buffer with page alignment, used for uncached chunk reads.
///
/// Capacity is rounded up to a whole number of pages; the read length is
/// still capped by the caller's byte limit and only the filled prefix is
/// handed out.
struct AlignedChunkBuf {
    ptr: NonNull<u8>,
    cap: usize,
}

// Safety: `AlignedChunkBuf` uniquely owns its allocation and does not expose
// shared mutable aliasing across threads. Moving it between threads is safe.
unsafe impl Send for AlignedChunkBuf {}
unsafe impl Sync for AlignedChunkBuf {}

impl AlignedChunkBuf {
    /// Allocates at least `cap` bytes, rounded up to the page alignment.
    fn new(cap: usize) -> Self {
        let cap = cap.max(1).next_multiple_of(FILE_CHUNK_ALIGN);
        let layout = Layout::from_size_align(cap, FILE_CHUNK_ALIGN).expect("invalid chunk layout");
        // Safety: layout is valid and non-zero sized. Zeroed so the whole
        // capacity can be viewed as an initialized slice.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).expect("chunk buffer alloc failed");
        Self { ptr, cap }
    }

    /// View the full capacity as mutable bytes.
    #[inline]
    fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: the allocation is `cap` bytes and zero-initialized.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.cap) }
    }

    /// Copy the first `len` bytes out of the buffer.
    fn to_vec(&self, len: usize) -> Vec<u8> {
        assert!(len <= self.cap);
        // Safety: `[0..len)` lies within the zero-initialized allocation.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), len) }.to_vec()
    }
}

impl Drop for AlignedChunkBuf {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.cap, FILE_CHUNK_ALIGN).expect("invalid chunk layout");
        unsafe {
            std::alloc::dealloc(self.ptr.as_ptr(), layout);
        }
    }
}

/// Reader over an imported column-family checkpoint.
///
/// Holds the envelope, the worker pool, and a live-iterator counter. The
/// reader refuses to close while any iterator is alive.
pub struct RangeReader {
    checkpoint: CheckpointMetaData,
    pool: Arc<Mutex<ReaderPool>>,
    shared: Arc<ReaderShared>,
    init: OnceCell<()>,
    path: Mutex<Option<PathBuf>>,
    num_iter: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl RangeReader {
    pub fn new(checkpoint: CheckpointMetaData, config: CheckpointConfig) -> Self {
        let pool = ReaderPool::new(config);
        let shared = pool.shared();
        Self {
            checkpoint,
            pool: Arc::new(Mutex::new(pool)),
            shared,
            init: OnceCell::new(),
            path: Mutex::new(None),
            num_iter: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        }
    }

    /// Opens (importing if necessary) the checkpoint. Idempotent: concurrent
    /// and repeated calls share a single Open action.
    ///
    /// `token` is unused by this reader; it selects a file in
    /// [`FileChunkReader::init`].
    pub async fn init(&self, token: &str) -> CheckpointResult<()> {
        let _ = token;
        self.init
            .get_or_try_init(|| async {
                let (done, completion) = oneshot::channel();
                self.pool.lock().post(ReaderAction::Open {
                    checkpoint: self.checkpoint.clone(),
                    done,
                })?;
                completion
                    .await
                    .map_err(|_| CheckpointError::internal("worker dropped open completion"))??;
                if let Ok(descriptor) = column_family_checkpoint(&self.checkpoint) {
                    if let Ok(path) = reader_db_path(&descriptor) {
                        *self.path.lock() = Some(path);
                    }
                }
                Ok::<(), CheckpointError>(())
            })
            .await
            .map(|_| ())
    }

    /// Creates an iterator over exactly the half-open `range`.
    ///
    /// The iterator seeks to `range.begin` immediately and carries a
    /// wall-clock deadline anchored to the engine's clock.
    pub fn get_iterator(&self, range: KeyRange) -> CheckpointResult<CheckpointIterator> {
        let state = self.shared.state.lock();
        let db = state
            .db
            .as_ref()
            .ok_or_else(|| CheckpointError::internal("checkpoint reader not initialized"))?;
        let cf = state
            .cf
            .as_ref()
            .ok_or_else(|| CheckpointError::internal("checkpoint column family not cached"))?;

        let options = ReadOptions {
            iterate_lower_bound: Some(range.begin.clone()),
            iterate_upper_bound: Some(range.end.clone()),
            // Bulk scan: do not pollute any cache, read far ahead.
            fill_cache: false,
            readahead_size: self.shared.config.read_ahead_bytes,
            deadline: Some(db.now() + self.shared.config.read_checkpoint_timeout),
        };
        let mut iter = db.iterator(&options, cf).map_err(|s| status_to_error(&s))?;
        iter.seek(&range.begin);
        drop(state);

        self.num_iter.fetch_add(1, Ordering::SeqCst);
        Ok(CheckpointIterator {
            pool: Arc::clone(&self.pool),
            state: Arc::new(Mutex::new(CheckpointIteratorState {
                iter,
                end: range.end.clone(),
            })),
            range,
            counter: Arc::clone(&self.num_iter),
        })
    }

    /// True iff any iterator created by this reader is still alive.
    pub fn in_use(&self) -> bool {
        self.num_iter.load(Ordering::SeqCst) > 0
    }

    /// Closes the reader: posts a Close action (without destroying the
    /// on-disk state), awaits it, and stops the worker pool. Idempotent.
    ///
    /// # Panics
    ///
    /// Panics if any iterator is still alive; drop all iterators first.
    pub async fn close(&self) -> CheckpointResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        assert!(
            !self.in_use(),
            "checkpoint reader closed with live iterators"
        );

        let path = self.path.lock().clone().unwrap_or_default();
        let (done, completion) = oneshot::channel();
        self.pool.lock().post(ReaderAction::Close {
            path,
            delete_on_close: false,
            done,
        })?;
        let _ = completion.await;
        self.pool.lock().stop();
        Ok(())
    }
}

/// A range-bounded iterator handed out by [`RangeReader::get_iterator`].
///
/// Holds a non-owning back reference to the reader's iterator counter;
/// dropping the iterator releases its slot.
pub struct CheckpointIterator {
    pool: Arc<Mutex<ReaderPool>>,
    state: Arc<Mutex<CheckpointIteratorState>>,
    range: KeyRange,
    counter: Arc<AtomicUsize>,
}

impl CheckpointIterator {
    /// Returns the next batch of key/value pairs in ascending key order.
    ///
    /// A batch ends when `row_limit` pairs are collected or the accumulated
    /// size (key + value + fixed per-pair overhead) reaches `byte_limit`.
    /// Zero for either limit yields an empty batch immediately. Exhaustion
    /// is reported as [`CheckpointError::EndOfStream`], never as an empty
    /// success.
    pub async fn next_batch(
        &self,
        row_limit: usize,
        byte_limit: usize,
    ) -> CheckpointResult<Vec<KeyValue>> {
        let (done, completion) = oneshot::channel();
        self.pool.lock().post(ReaderAction::ReadRange {
            row_limit,
            byte_limit,
            iterator: Arc::clone(&self.state),
            done,
        })?;
        completion
            .await
            .map_err(|_| CheckpointError::internal("worker dropped batch completion"))?
    }

    /// The half-open range this iterator covers.
    pub fn range(&self) -> &KeyRange {
        &self.range
    }
}

impl Drop for CheckpointIterator {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Streams the raw bytes of a single SST file from a fetched checkpoint.
pub struct FileChunkReader {
    checkpoint: CheckpointMetaData,
    file: Option<tokio::fs::File>,
    offset: u64,
    path: Option<PathBuf>,
}

impl FileChunkReader {
    pub fn new(checkpoint: CheckpointMetaData) -> Self {
        Self {
            checkpoint,
            file: None,
            offset: 0,
            path: None,
        }
    }

    /// Opens the file named by `token` (the SST's basename) for streaming.
    ///
    /// Fails with [`CheckpointError::CheckpointNotFound`] if the envelope's
    /// descriptor lists no such file.
    pub async fn init(&mut self, token: &str) -> CheckpointResult<()> {
        if self.checkpoint.format != CheckpointFormat::ColumnFamily {
            return Err(CheckpointError::NotImplemented(
                "file streaming supports only column-family checkpoints",
            ));
        }
        self.offset = 0;
        self.path = None;

        let descriptor = column_family_checkpoint(&self.checkpoint)?;
        let wanted = token.trim_start_matches('/');
        for sst_file in &descriptor.sst_files {
            if sst_file.name.trim_start_matches('/') == wanted {
                self.path = Some(PathBuf::from(sst_file_path(
                    &sst_file.db_path,
                    &sst_file.name,
                )));
                break;
            }
        }

        let Some(path) = self.path.clone() else {
            warn!(file = token, "checkpoint file not present in envelope");
            return Err(CheckpointError::CheckpointNotFound(token.to_string()));
        };

        match tokio::fs::File::open(&path).await {
            Ok(file) => {
                debug!(file = %path.display(), "checkpoint reader opened file");
                self.file = Some(file);
                Ok(())
            }
            Err(err) => {
                warn!(file = %path.display(), error = %err, "failed to open checkpoint file");
                Err(err.into())
            }
        }
    }

    /// Reads the next chunk at the current offset, at most
    /// `min(64 KiB, byte_limit)` bytes, through a page-aligned buffer. A
    /// zero-byte read terminates the stream with
    /// [`CheckpointError::EndOfStream`].
    pub async fn next_chunk(&mut self, byte_limit: usize) -> CheckpointResult<Vec<u8>> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| CheckpointError::internal("file reader not initialized"))?;
        let block = FILE_CHUNK_BYTES.min(byte_limit);
        if block == 0 {
            return Ok(Vec::new());
        }
        let mut buf = AlignedChunkBuf::new(block);
        let read = file.read(&mut buf.as_mut_slice()[..block]).await?;
        if read == 0 {
            debug!(offset = self.offset, "checkpoint file stream end");
            return Err(CheckpointError::EndOfStream);
        }
        self.offset += read as u64;
        Ok(buf.to_vec(read))
    }

    /// Releases the file handle. Idempotent.
    pub async fn close(&mut self) -> CheckpointResult<()> {
        self.file = None;
        Ok(())
    }
}

/// A checkpoint reader: either structured range batches or raw file chunks.
pub enum CheckpointReader {
    Ranges(RangeReader),
    File(FileChunkReader),
}

impl CheckpointReader {
    pub async fn init(&mut self, token: &str) -> CheckpointResult<()> {
        match self {
            CheckpointReader::Ranges(reader) => reader.init(token).await,
            CheckpointReader::File(reader) => reader.init(token).await,
        }
    }

    pub async fn close(&mut self) -> CheckpointResult<()> {
        match self {
            CheckpointReader::Ranges(reader) => reader.close().await,
            CheckpointReader::File(reader) => reader.close().await,
        }
    }

    pub fn as_ranges(&self) -> Option<&RangeReader> {
        match self {
            CheckpointReader::Ranges(reader) => Some(reader),
            CheckpointReader::File(_) => None,
        }
    }

    pub fn as_file_mut(&mut self) -> Option<&mut FileChunkReader> {
        match self {
            CheckpointReader::Ranges(_) => None,
            CheckpointReader::File(reader) => Some(reader),
        }
    }
}

/// Builds the reader appropriate for a checkpoint.
///
/// A column-family checkpoint read as raw files gets the chunk reader;
/// everything else (including reading a column-family checkpoint back as
/// key/values) gets the range reader.
pub fn new_checkpoint_reader(
    checkpoint: &CheckpointMetaData,
    as_key_values: bool,
    config: &CheckpointConfig,
) -> CheckpointReader {
    if checkpoint.format == CheckpointFormat::ColumnFamily && !as_key_values {
        CheckpointReader::File(FileChunkReader::new(checkpoint.clone()))
    } else {
        CheckpointReader::Ranges(RangeReader::new(checkpoint.clone(), config.clone()))
    }
}
