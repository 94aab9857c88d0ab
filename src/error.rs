use std::fmt::Display;

use crate::engine::Status;

/// A specialized error type for checkpoint transport operations.
///
/// Engine failures never cross a component boundary raw: the worker and the
/// SST writer translate an [`engine::Status`](crate::engine::Status) into one
/// of these kinds before surfacing it.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Tenant operations are not permitted on this cluster. Raised by the
    /// tenant metadata collaborator, never by the checkpoint core itself.
    #[error("tenants disabled on this cluster")]
    TenantsDisabled,
    /// The source node is missing from the server directory, or a named file
    /// is absent from the checkpoint envelope.
    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),
    /// The requested operation is not supported for this checkpoint format.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
    /// The serialized checkpoint descriptor failed to decode.
    #[error("malformed checkpoint envelope: {0}")]
    MalformedEnvelope(String),
    /// The SST writer could not create its output file.
    #[error("sst writer failed to open output: {0}")]
    SstWriterOpenFailed(String),
    /// The SST writer could not append a key/value pair.
    #[error("sst writer failed to append: {0}")]
    SstWriterWriteFailed(String),
    /// The SST writer could not finalize its output file.
    #[error("sst writer failed to finalize: {0}")]
    SstWriterFinalizeFailed(String),
    /// An I/O error occurred, either directly or inside the engine.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The engine reported a timed-out read.
    #[error("transaction too old")]
    TransactionTooOld,
    /// Normal terminator for iterators, file-chunk streams, and RPC streams.
    #[error("end of stream")]
    EndOfStream,
    /// The remote stream failed for a reason other than reaching its end.
    #[error("transport error: {0}")]
    Transport(String),
    /// Invalid internal state (handle missing, lock poisoned, ...).
    #[error("internal error: {0}")]
    Internal(String),
    /// Catch-all for engine failures with no dedicated translation.
    #[error("unknown storage engine error: {0}")]
    UnknownEngine(String),
}

impl CheckpointError {
    /// Create a malformed-envelope error from a displayable value.
    pub fn malformed<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::MalformedEnvelope(msg.to_string())
    }

    /// Create a transport error from a displayable value.
    pub fn transport<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Transport(msg.to_string())
    }

    /// Create an internal error from a displayable value.
    pub fn internal<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Internal(msg.to_string())
    }

    /// True iff this is the normal stream terminator rather than a failure.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }

    /// True for transient failures worth retrying during a server-directory
    /// lookup. Absent keys (CheckpointNotFound) fail fast.
    pub(crate) fn is_transient_lookup(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::TransactionTooOld | Self::Transport(_)
        )
    }
}

/// A Result type alias for checkpoint transport operations.
pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Translates an engine status into the error kind surfaced to callers.
pub(crate) fn status_to_error(status: &Status) -> CheckpointError {
    if status.is_io_error() {
        CheckpointError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            status.to_string(),
        ))
    } else if status.is_timed_out() {
        CheckpointError::TransactionTooOld
    } else {
        CheckpointError::UnknownEngine(status.to_string())
    }
}
