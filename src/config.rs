use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of worker threads dedicated to engine calls.
///
/// One thread is enough to serialize every native operation for a single
/// checkpoint reader; raising this trades strict submission ordering for
/// parallel batch reads across iterators.
const DEFAULT_READER_PARALLELISM: usize = 1;

/// Default readahead applied to checkpoint scans (2 MiB).
///
/// Checkpoint iteration is a bulk forward scan, so a large readahead window
/// keeps the disk busy without polluting any block cache.
const DEFAULT_READ_AHEAD_BYTES: usize = 2 * 1024 * 1024;

/// Default wall-clock budget for a single checkpoint read (seconds).
const DEFAULT_READ_CHECKPOINT_TIMEOUT_SECS: u64 = 60;

/// Default cap on per-file and per-range fetch attempts.
const DEFAULT_MAX_FETCH_RETRIES: u32 = 3;

/// Configuration surface for checkpoint fetching and reading.
///
/// All knobs have conservative defaults; call [`normalized`](Self::normalized)
/// after loading from an external source to clamp invalid values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Number of OS threads in the storage worker pool.
    ///
    /// Engine handles are confined to this pool; every open, import, batch
    /// read, and close runs on one of these threads.
    pub reader_parallelism: usize,

    /// Readahead window for checkpoint range scans, in bytes.
    pub read_ahead_bytes: usize,

    /// Wall-clock deadline for a checkpoint read, measured from iterator
    /// construction on the engine's own clock.
    pub read_checkpoint_timeout: Duration,

    /// Skip the fsync when persisting the reader-initialized sentinel.
    ///
    /// Leaving this off means a crash between import and sync can force one
    /// extra re-import on the next open; turning it on trades that safety for
    /// a faster import.
    pub unsafe_auto_fsync: bool,

    /// Maximum attempts for fetching a single remote file or key range.
    pub max_fetch_retries: u32,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            reader_parallelism: DEFAULT_READER_PARALLELISM,
            read_ahead_bytes: DEFAULT_READ_AHEAD_BYTES,
            read_checkpoint_timeout: Duration::from_secs(DEFAULT_READ_CHECKPOINT_TIMEOUT_SECS),
            unsafe_auto_fsync: false,
            max_fetch_retries: DEFAULT_MAX_FETCH_RETRIES,
        }
    }
}

impl CheckpointConfig {
    /// Returns a copy of the configuration with out-of-range values clamped.
    pub fn normalized(mut self) -> Self {
        if self.reader_parallelism == 0 {
            self.reader_parallelism = DEFAULT_READER_PARALLELISM;
        }
        if self.max_fetch_retries == 0 {
            self.max_fetch_retries = 1;
        }
        if self.read_checkpoint_timeout.is_zero() {
            self.read_checkpoint_timeout =
                Duration::from_secs(DEFAULT_READ_CHECKPOINT_TIMEOUT_SECS);
        }
        self
    }
}
