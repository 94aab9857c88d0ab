use std::path::{Path, PathBuf};

use tracing::error;

use crate::engine::SstFileWriter;
use crate::error::{CheckpointError, CheckpointResult};

/// Single-use sink that materializes one sorted key/value stream as an SST
/// file.
///
/// Callers must supply keys in strictly ascending order; the engine enforces
/// this. `finish` reports whether a file was produced: an empty stream leaves
/// nothing on disk and is not an error, so range fetches that see no data
/// simply record no file.
pub struct SstWriter {
    inner: SstFileWriter,
    local_file: Option<PathBuf>,
}

impl Default for SstWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl SstWriter {
    pub fn new() -> Self {
        Self {
            inner: SstFileWriter::new(),
            local_file: None,
        }
    }

    /// Starts a new SST at `local_file`.
    pub fn open(&mut self, local_file: impl AsRef<Path>) -> CheckpointResult<()> {
        let path = local_file.as_ref().to_path_buf();
        if let Err(status) = self.inner.open(&path) {
            error!(file = %path.display(), status = %status, "sst writer failed to open");
            return Err(CheckpointError::SstWriterOpenFailed(status.to_string()));
        }
        self.local_file = Some(path);
        Ok(())
    }

    /// Appends one key/value pair.
    pub fn write(&mut self, key: &[u8], value: &[u8]) -> CheckpointResult<()> {
        if let Err(status) = self.inner.put(key, value) {
            error!(
                file = %self.file_display(),
                status = %status,
                "sst writer failed to append"
            );
            return Err(CheckpointError::SstWriterWriteFailed(status.to_string()));
        }
        Ok(())
    }

    /// Finalizes the file.
    ///
    /// Returns `true` and closes the file iff at least one key was written;
    /// returns `false` without creating a file otherwise.
    pub fn finish(&mut self) -> CheckpointResult<bool> {
        if self.inner.entries() == 0 {
            // The engine cannot finalize an sst with no entries.
            self.inner
                .discard()
                .map_err(|status| CheckpointError::SstWriterFinalizeFailed(status.to_string()))?;
            return Ok(false);
        }
        if let Err(status) = self.inner.finish() {
            error!(
                file = %self.file_display(),
                status = %status,
                "sst writer failed to finalize"
            );
            return Err(CheckpointError::SstWriterFinalizeFailed(status.to_string()));
        }
        Ok(true)
    }

    fn file_display(&self) -> String {
        self.local_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<unopened>".to_string())
    }
}
