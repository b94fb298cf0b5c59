//! Contracts for the shared job inventory, blob storage, and event sinks.
//!
//! The engine consumes these traits and owns when they are called; the
//! platform provides implementations. Inventory mutations only ever
//! happen inside finalize, behind the gate tier.

use chrono::{DateTime, Utc};

use trawler_types::ids::SourceKey;
use trawler_types::item::{DetailRef, JobItem};
use trawler_types::run::RunRecord;
use trawler_types::source::DisableReason;

/// Failure from a store implementation. The engine maps these to
/// `database_error` / `storage_error` and retries them as such.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct GatewayError(pub String);

impl GatewayError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// What one upsert call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Rows created by this call. A replay of already-stored items
    /// reports zero, which keeps `jobs_new` honest across resumes.
    pub created: u64,
    pub updated: u64,
}

/// The shared job inventory.
pub trait JobStore: Send + Sync {
    /// Insert or refresh jobs keyed on (source, job id). Must be
    /// idempotent: replaying the same items is safe.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] when the inventory rejects the write.
    fn upsert_jobs(&self, source: &SourceKey, items: &[JobItem]) -> GatewayResult<UpsertOutcome>;

    /// Mark this source's active jobs that are absent from `seen_ids`
    /// inactive as of `as_of`, returning how many flipped. Only reachable
    /// through full-tier gating.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] when the inventory rejects the write.
    fn mark_inactive(
        &self,
        source: &SourceKey,
        seen_ids: &[String],
        as_of: DateTime<Utc>,
    ) -> GatewayResult<u64>;

    /// Refresh per-source rollups after a full-tier run.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] when the refresh fails.
    fn update_aggregates(&self, source: &SourceKey) -> GatewayResult<()>;
}

/// Storage for fetched detail documents.
pub trait BlobStore: Send + Sync {
    /// Store one detail document and return a stable reference to it.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] when the blob cannot be stored.
    fn store_detail(&self, source: &SourceKey, job_id: &str, text: &str) -> GatewayResult<DetailRef>;
}

/// Outbound run and kill-switch events.
///
/// Delivery is fire-and-forget by contract: implementations swallow and
/// log their own transport failures, and the engine never lets a sink
/// problem affect a run.
pub trait NotificationSink: Send + Sync {
    fn run_finished(&self, record: &RunRecord);

    fn source_disabled(
        &self,
        source: &SourceKey,
        reason: DisableReason,
        retry_after: Option<DateTime<Utc>>,
    );

    fn source_reenabled(&self, source: &SourceKey);
}

/// Default sink: structured log lines only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn run_finished(&self, record: &RunRecord) {
        tracing::info!(
            run_id = record.id,
            source = %record.source,
            status = %record.status,
            score = record.confidence_score,
            fetched = record.counts.fetched,
            new = record.counts.new,
            marked_inactive = record.counts.marked_inactive,
            "run finished"
        );
    }

    fn source_disabled(
        &self,
        source: &SourceKey,
        reason: DisableReason,
        retry_after: Option<DateTime<Utc>>,
    ) {
        tracing::warn!(
            source = %source,
            reason = %reason,
            retry_after = retry_after.map(|t| t.to_rfc3339()),
            "source disabled"
        );
    }

    fn source_reenabled(&self, source: &SourceKey) {
        tracing::info!(source = %source, "source re-enabled");
    }
}
