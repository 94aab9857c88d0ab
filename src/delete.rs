use std::collections::BTreeSet;

use tracing::info;

use crate::envelope::{
    column_family_checkpoint, full_db_checkpoint, CheckpointFormat, CheckpointMetaData,
};
use crate::error::{CheckpointError, CheckpointResult};

/// Erases every directory referenced by a checkpoint envelope.
///
/// Column-family checkpoints contribute the distinct `db_path` of each SST
/// (which also removes the live `/reader` instance nested inside); full-db
/// checkpoints contribute their snapshot directory. Deleting key-values
/// checkpoints is not supported in this revision.
///
/// Yields to the scheduler between directories so large deletions interleave
/// with other work.
pub async fn delete_checkpoint(checkpoint: &CheckpointMetaData) -> CheckpointResult<()> {
    let mut dirs: BTreeSet<String> = BTreeSet::new();
    match checkpoint.format {
        CheckpointFormat::ColumnFamily => {
            let descriptor = column_family_checkpoint(checkpoint)?;
            info!(
                checkpoint = %checkpoint,
                files = descriptor.sst_files.len(),
                "delete column family checkpoint"
            );
            for file in &descriptor.sst_files {
                dirs.insert(file.db_path.clone());
            }
        }
        CheckpointFormat::FullDb => {
            let descriptor = full_db_checkpoint(checkpoint)?;
            info!(checkpoint = %checkpoint, dir = %descriptor.checkpoint_dir, "delete full db checkpoint");
            dirs.insert(descriptor.checkpoint_dir);
        }
        CheckpointFormat::KeyValues => {
            return Err(CheckpointError::NotImplemented(
                "deleting key-values checkpoints",
            ));
        }
    }

    for dir in dirs {
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        info!(checkpoint_id = %checkpoint.checkpoint_id, dir = %dir, "checkpoint directory removed");
        tokio::task::yield_now().await;
    }
    Ok(())
}
