//! Checkpoint transport and reading for shard moves between storage nodes.
//!
//! A source node produces an on-disk checkpoint — immutable SST files plus
//! column-family metadata — describing a point-in-time snapshot of one or
//! more key ranges. This crate gives the destination node the three halves
//! of the move:
//!
//! - **Fetch** ([`CheckpointFetcher`]): pull the checkpoint over a streaming
//!   RPC into a local directory, with bounded per-file retries and durable
//!   per-file progress so a crash-restart resumes where it left off.
//! - **Read** ([`new_checkpoint_reader`]): reconstruct the checkpoint into a
//!   locally openable instance and iterate it as range-bounded key/value
//!   batches, or stream raw SST bytes for file-level replication.
//! - **Delete** ([`delete_checkpoint`]): erase the on-disk artifacts once
//!   the move completes.
//!
//! ## Architecture
//!
//! The engine's handles are not thread-safe, so every native call is funneled
//! through a dedicated worker pool that owns them outright; the async side
//! exchanges actions and oneshot completions with it. The fetcher runs each
//! file (or uncovered sub-range) as an independent task and serializes
//! envelope updates at completion points. Remote endpoints, the server
//! directory, and failure injection are injected traits, so the whole stack
//! runs deterministically under test.
//!
//! ## Example
//!
//! ```ignore
//! let fetcher = CheckpointFetcher::new(directory, CheckpointConfig::default());
//! let fetched = fetcher.fetch(envelope, "/data/moves/cp1", Some(progress)).await?;
//!
//! let mut reader = new_checkpoint_reader(&fetched, true, &CheckpointConfig::default());
//! reader.init("").await?;
//! let ranges = reader.as_ranges().unwrap();
//! let iter = ranges.get_iterator(KeyRange::new(b"a".to_vec(), b"z".to_vec()))?;
//! loop {
//!     match iter.next_batch(1 << 10, 1 << 20).await {
//!         Ok(batch) => replay(batch),
//!         Err(err) if err.is_end_of_stream() => break,
//!         Err(err) => return Err(err),
//!     }
//! }
//! ```

pub mod config;
pub mod delete;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod fetch;
pub mod range;
pub mod reader;
pub mod test_support;
pub mod writer;

mod worker;

pub use config::CheckpointConfig;
pub use delete::delete_checkpoint;
pub use envelope::{
    column_family_checkpoint, full_db_checkpoint, key_values_checkpoint, CheckpointFile,
    CheckpointFormat, CheckpointId, CheckpointMetaData, ColumnFamilyCheckpoint, FullDbCheckpoint,
    KeyValue, KeyValuesCheckpoint, LiveFileMeta, NodeId,
};
pub use error::{CheckpointError, CheckpointResult};
pub use fetch::{
    CheckpointFetcher, CheckpointTransport, FaultInjection, FetchCheckpointReply,
    FetchKeyValuesReply, NoFaults, ProgressCallback, StorageNodeDirectory,
};
pub use range::KeyRange;
pub use reader::{
    new_checkpoint_reader, CheckpointIterator, CheckpointReader, FileChunkReader, RangeReader,
};
pub use worker::{CHECKPOINT_CF, READER_INITIALIZED_KEY, READER_SUBDIR};
pub use writer::SstWriter;
