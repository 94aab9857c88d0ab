//! A small embedded storage engine with the surface the checkpoint subsystem
//! needs: sorted-string-table files, a multi-column-family database directory
//! that can import externally produced SSTs by metadata, and range-bounded,
//! deadline-aware iterators.
//!
//! The engine is deliberately minimal. Files are immutable once finalized,
//! imports use copy semantics so source files survive retries, and direct
//! writes go through a per-column-family log that is replayed on open. All
//! failures are reported as a [`Status`] whose code predicates drive the
//! reader's open/import protocol.

pub mod db;
pub mod iter;
pub mod sst;

use std::fmt;

pub use db::{Db, ColumnFamily, ColumnFamilyDescriptor, DEFAULT_CF};
pub use iter::DbIterator;
pub use sst::{SstFile, SstFileIter, SstFileWriter};

/// Name of the engine's one and only comparator: plain byte order.
pub const BYTEWISE_COMPARATOR: &str = "bytewise";

/// Broad classification of an engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    NotFound,
    Corruption,
    IoError,
    TimedOut,
    Aborted,
    InvalidArgument,
    NotSupported,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::NotFound => "not found",
            StatusCode::Corruption => "corruption",
            StatusCode::IoError => "io error",
            StatusCode::TimedOut => "timed out",
            StatusCode::Aborted => "aborted",
            StatusCode::InvalidArgument => "invalid argument",
            StatusCode::NotSupported => "not supported",
        };
        f.write_str(name)
    }
}

/// An engine failure: a coarse code plus human-readable context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: StatusCode,
    message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, message)
    }

    pub fn corruption(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Corruption, message)
    }

    pub fn io_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::IoError, message)
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TimedOut, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Aborted, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotSupported, message)
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn is_not_found(&self) -> bool {
        self.code == StatusCode::NotFound
    }

    pub fn is_io_error(&self) -> bool {
        self.code == StatusCode::IoError
    }

    pub fn is_timed_out(&self) -> bool {
        self.code == StatusCode::TimedOut
    }

    pub fn is_aborted(&self) -> bool {
        self.code == StatusCode::Aborted
    }

    pub fn is_corruption(&self) -> bool {
        self.code == StatusCode::Corruption
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for Status {}

impl From<std::io::Error> for Status {
    fn from(err: std::io::Error) -> Self {
        Status::io_error(err.to_string())
    }
}

/// A Result type alias for engine operations.
pub type EngineResult<T> = Result<T, Status>;

/// Database open options.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Create the database directory and manifest if absent.
    pub create_if_missing: bool,
}

/// Per-column-family options. The engine currently has no per-CF tuning but
/// the import and open surfaces accept this for interface parity.
#[derive(Debug, Clone, Copy, Default)]
pub struct ColumnFamilyOptions {}

/// Read options applied to gets and iterators.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Inclusive lower bound for iteration.
    pub iterate_lower_bound: Option<Vec<u8>>,
    /// Exclusive upper bound for iteration.
    pub iterate_upper_bound: Option<Vec<u8>>,
    /// Advisory: whether scanned blocks should populate a block cache. The
    /// engine keeps no cache, but the flag is part of the read contract.
    pub fill_cache: bool,
    /// Advisory readahead window for sequential scans, in bytes.
    pub readahead_size: usize,
    /// Wall-clock deadline; iterator advances past it report `TimedOut`.
    pub deadline: Option<std::time::Instant>,
}

/// Write options applied to puts.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Fsync the column-family log before acknowledging the write.
    pub sync: bool,
}

/// Options governing `create_column_family_with_import`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImportColumnFamilyOptions {
    /// Move source files instead of copying them. The checkpoint reader
    /// always imports with copy semantics so fetched files survive retries.
    pub move_files: bool,
}

/// Engine-side description of one live SST file, as required to import it
/// into a fresh column family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveFileMetaData {
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
}

/// The full metadata bundle for importing an exported column family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportImportFilesMetaData {
    pub db_comparator_name: String,
    pub files: Vec<LiveFileMetaData>,
}
