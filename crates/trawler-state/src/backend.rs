//! State backend trait definition.
//!
//! [`StateBackend`] defines the storage contract for run records, source
//! locks, checkpoints, and source configuration/health. Model types live
//! in [`trawler_types`].

use chrono::{DateTime, Utc};
use trawler_types::checkpoint::RunCheckpoint;
use trawler_types::ids::{HolderId, SourceKey};
use trawler_types::run::{RunCounts, RunId, RunRecord, RunStatus, Stage, StageTimings};
use trawler_types::source::{SourceConfig, SourceHealth};
use trawler_types::stats::HttpStats;

use crate::error;
use crate::lock::SourceLock;

/// Terminal write for a run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub finished_at: DateTime<Utc>,
    pub confidence_score: Option<f64>,
    pub counts: RunCounts,
    pub http_stats: HttpStats,
    pub stage_timings: StageTimings,
    pub error_message: Option<String>,
}

/// Storage contract for orchestration state.
///
/// Implementations must be `Send + Sync` for use behind
/// `Arc<dyn StateBackend>`.
pub trait StateBackend: Send + Sync {
    /// Create a run in `running` status, returning its id.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn create_run(&self, source: &SourceKey, now: DateTime<Utc>) -> error::Result<RunId>;

    /// Record the stage a run has entered.
    ///
    /// # Errors
    ///
    /// Fails with `RunFinalized` if the run already has a terminal status,
    /// `RunMissing` if it does not exist.
    fn update_run_stage(&self, run_id: RunId, stage: Stage) -> error::Result<()>;

    /// Write a run's terminal status and aggregates. Exactly one terminal
    /// write is accepted per run.
    ///
    /// # Errors
    ///
    /// Fails with `RunFinalized` on a second terminal write, `RunMissing`
    /// if the run does not exist.
    fn finish_run(&self, run_id: RunId, outcome: &RunOutcome) -> error::Result<()>;

    /// Fetch one run record.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get_run(&self, run_id: RunId) -> error::Result<Option<RunRecord>>;

    /// Most recent run for `source` still in `running` status, if any.
    /// Used to adopt and resume interrupted work.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn latest_unfinished_run(&self, source: &SourceKey) -> error::Result<Option<RunRecord>>;

    /// Recent runs, newest first, optionally filtered by source.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn recent_runs(
        &self,
        source: Option<&SourceKey>,
        limit: u64,
    ) -> error::Result<Vec<RunRecord>>;

    /// Hygiene sweep: fail `running` runs started before `cutoff` as
    /// `dependency_error`. Returns the count updated. Correctness never
    /// depends on this; adoption and lock TTL do the real work.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn fail_abandoned_runs(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> error::Result<u64>;

    /// Overwrite the run's single checkpoint.
    ///
    /// # Errors
    ///
    /// Fails with `RunFinalized` if the run already has a terminal status,
    /// `RunMissing` if it does not exist.
    fn put_checkpoint(&self, run_id: RunId, checkpoint: &RunCheckpoint) -> error::Result<()>;

    /// Latest checkpoint for a run, if one was written.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get_checkpoint(&self, run_id: RunId) -> error::Result<Option<RunCheckpoint>>;

    /// Compare-and-set lock acquisition: succeeds when no lock row exists
    /// for `source` or the existing one has expired. Never blocks.
    ///
    /// Returns `true` when the lease was taken.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn try_acquire_lock(
        &self,
        source: &SourceKey,
        holder: &HolderId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> error::Result<bool>;

    /// Release a lock only if `holder` still owns it. Returns `true` when
    /// a row was deleted; a stale holder's release is a no-op `false`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn release_lock(&self, source: &SourceKey, holder: &HolderId) -> error::Result<bool>;

    /// Current lock row for a source, expired or not.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get_lock(&self, source: &SourceKey) -> error::Result<Option<SourceLock>>;

    /// Delete lock rows whose expiry has passed. Returns the count
    /// removed. Hygiene only.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn delete_expired_locks(&self, now: DateTime<Utc>) -> error::Result<u64>;

    /// Read one source's configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get_source_config(&self, key: &SourceKey) -> error::Result<Option<SourceConfig>>;

    /// Upsert one source's configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn put_source_config(&self, config: &SourceConfig, now: DateTime<Utc>) -> error::Result<()>;

    /// All configured sources, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn list_source_configs(&self) -> error::Result<Vec<SourceConfig>>;

    /// Read one source's health record; a source never written yet gets a
    /// zeroed record with version 0.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get_source_health(&self, key: &SourceKey) -> error::Result<SourceHealth>;

    /// Write a health record guarded by its version: the stored row must
    /// still be at `health.version`, and the write advances it by one.
    ///
    /// # Errors
    ///
    /// Fails with `VersionConflict` when another writer advanced the row
    /// first.
    fn put_source_health(&self, health: &SourceHealth) -> error::Result<()>;
}
