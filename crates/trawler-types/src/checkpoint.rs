//! Run progress checkpoints.
//!
//! One checkpoint per run, overwritten in place. The payload carries just
//! enough to resume without redoing completed work; anything bulky (detail
//! text) lives in the blob store and is referenced from the items.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::item::JobItem;
use crate::run::{RunCounts, Stage};

/// Upper bound on one serialized checkpoint payload.
pub const MAX_PAYLOAD_BYTES: usize = 100 * 1024;

/// Resumable progress state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointPayload {
    /// Normalized items extracted so far.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<JobItem>,
    /// Pagination cursor when the listing was still in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_cursor: Option<String>,
    /// Detail fetches already completed; resume continues at this index.
    #[serde(default)]
    pub details_done: u64,
    #[serde(default)]
    pub counts: RunCounts,
}

/// The run's single progress marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCheckpoint {
    /// Last fully completed stage.
    pub stage: Stage,
    pub written_at: DateTime<Utc>,
    pub payload: CheckpointPayload,
}

impl RunCheckpoint {
    #[must_use]
    pub fn new(stage: Stage, payload: CheckpointPayload) -> Self {
        Self {
            stage,
            written_at: Utc::now(),
            payload,
        }
    }
}
