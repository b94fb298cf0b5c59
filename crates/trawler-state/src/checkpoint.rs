//! Checkpoint store: one overwritable progress marker per run.

use std::sync::Arc;

use trawler_types::checkpoint::{RunCheckpoint, MAX_PAYLOAD_BYTES};
use trawler_types::run::RunId;

use crate::backend::StateBackend;
use crate::error::{self, StateError};

/// Put/get over the backend with the payload size bound enforced on
/// write. Bulky intermediate state (detail text) belongs in the blob
/// store; only references travel through checkpoints.
pub struct CheckpointStore {
    backend: Arc<dyn StateBackend>,
}

impl CheckpointStore {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend }
    }

    /// Overwrite the run's checkpoint.
    ///
    /// # Errors
    ///
    /// Fails with `PayloadTooLarge` above [`MAX_PAYLOAD_BYTES`], and with
    /// `RunFinalized` / `RunMissing` from the backend guard.
    pub fn put(&self, run_id: RunId, checkpoint: &RunCheckpoint) -> error::Result<()> {
        let size = serde_json::to_vec(&checkpoint.payload)?.len();
        if size > MAX_PAYLOAD_BYTES {
            return Err(StateError::PayloadTooLarge {
                size,
                limit: MAX_PAYLOAD_BYTES,
            });
        }
        self.backend.put_checkpoint(run_id, checkpoint)?;
        tracing::debug!(
            run_id,
            stage = %checkpoint.stage,
            bytes = size,
            "checkpoint written"
        );
        Ok(())
    }

    /// Latest checkpoint for a run.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    pub fn get(&self, run_id: RunId) -> error::Result<Option<RunCheckpoint>> {
        self.backend.get_checkpoint(run_id)
    }
}
