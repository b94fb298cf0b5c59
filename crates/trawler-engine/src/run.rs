//! The run state machine.
//!
//! A driver owns exactly one run for one source and walks it through
//! init, fetch, classify, score, and finalize. It runs synchronously on a
//! blocking worker; the orchestrator owns locks, adoption, and fan-out.
//!
//! Stage faults are classified through [`classify`] and retried per the
//! policy table inside the stage; whatever survives retries terminates
//! the fetch phase. Classification and scoring always run afterwards, so
//! even a failed run gets an honest confidence score (config and budget
//! faults excepted).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use trawler_state::backend::{RunOutcome, StateBackend};
use trawler_state::checkpoint::CheckpointStore;
use trawler_state::error::StateError;
use trawler_types::checkpoint::{CheckpointPayload, RunCheckpoint};
use trawler_types::failure::{
    FailureKind, ParseOutcome, ScrapeFailure, SymptomBundle, Verdict,
};
use trawler_types::item::JobItem;
use trawler_types::run::{RunCounts, RunId, RunStatus, Stage, StageTimings};
use trawler_types::source::SourceConfig;
use trawler_types::stats::HttpStats;

use crate::adapter::{FetchContext, SourceAdapter};
use crate::budget::BudgetGuard;
use crate::classify::{classify, next_delay, retry_policy};
use crate::errors::RunError;
use crate::gateway::{BlobStore, GatewayError, JobStore};
use crate::killswitch::{self, SwitchTransition};
use crate::result::RunReport;
use crate::score::{confidence_score, gate_tier, GateTier, ScoreInputs};

/// Checkpoint cadence for listing and detail progress.
const CHECKPOINT_EVERY_ITEMS: u64 = 50;
/// Base per-request time ceiling; timeout retries escalate it up to 3x.
const BASE_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_TIMEOUT_ESCALATION: u32 = 3;
/// Safe mode doubles the configured pacing between requests.
const SAFE_MODE_PACING_FACTOR: u64 = 2;

// ---------------------------------------------------------------------------
// Driver wiring
// ---------------------------------------------------------------------------

/// Everything a driver needs, resolved by the orchestrator.
pub(crate) struct DriverContext {
    pub state: Arc<dyn StateBackend>,
    /// `None` when the registry has no adapter under the configured name;
    /// init then fails the run as `config_error`.
    pub adapter: Option<Arc<dyn SourceAdapter>>,
    pub jobs: Arc<dyn JobStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub config: SourceConfig,
    /// `None` for dry runs, which never create a record.
    pub run_id: Option<RunId>,
    /// Checkpoint of an adopted unfinished run, if one existed.
    pub resume: Option<RunCheckpoint>,
    pub cancel: Arc<AtomicBool>,
    pub dry_run: bool,
}

pub(crate) struct DriverOutput {
    pub report: RunReport,
    pub transition: Option<SwitchTransition>,
}

pub(crate) struct RunDriver {
    state: Arc<dyn StateBackend>,
    checkpoints: CheckpointStore,
    adapter: Option<Arc<dyn SourceAdapter>>,
    jobs: Arc<dyn JobStore>,
    blobs: Arc<dyn BlobStore>,
    config: SourceConfig,
    run_id: Option<RunId>,
    cancel: Arc<AtomicBool>,
    dry_run: bool,

    budget: BudgetGuard,
    started: Instant,
    counts: RunCounts,
    stats: HttpStats,
    timings: StageTimings,
    items: Vec<JobItem>,
    page_cursor: Option<String>,
    details_done: u64,
    resume_from: Option<Stage>,
    resumed: bool,
    unexpected_content: bool,
}

impl RunDriver {
    pub(crate) fn new(ctx: DriverContext) -> Self {
        let checkpoints = CheckpointStore::new(Arc::clone(&ctx.state));
        let budget = BudgetGuard::new(ctx.config.budget);

        let mut counts = RunCounts::default();
        let mut items = Vec::new();
        let mut page_cursor = None;
        let mut details_done = 0;
        let mut resume_from = None;
        let resumed = ctx.resume.is_some();
        if let Some(checkpoint) = ctx.resume {
            counts = checkpoint.payload.counts;
            items = checkpoint.payload.items;
            page_cursor = checkpoint.payload.page_cursor;
            details_done = checkpoint.payload.details_done;
            resume_from = Some(checkpoint.stage);
        }

        Self {
            state: ctx.state,
            checkpoints,
            adapter: ctx.adapter,
            jobs: ctx.jobs,
            blobs: ctx.blobs,
            config: ctx.config,
            run_id: ctx.run_id,
            cancel: ctx.cancel,
            dry_run: ctx.dry_run,
            budget,
            started: Instant::now(),
            counts,
            stats: HttpStats::default(),
            timings: StageTimings::default(),
            items,
            page_cursor,
            details_done,
            resume_from,
            resumed,
            unexpected_content: false,
        }
    }

    // -----------------------------------------------------------------------
    // Top-level flow
    // -----------------------------------------------------------------------

    pub(crate) fn execute(mut self) -> Result<DriverOutput, RunError> {
        if self.resumed {
            tracing::info!(
                source = %self.config.key,
                run_id = self.run_id,
                resume_from = self.resume_from.map(|s| s.as_str()),
                items = self.items.len(),
                details_done = self.details_done,
                "resuming adopted run from checkpoint"
            );
        }

        let init_started = Instant::now();
        let mut failure = self.stage_init().err();
        self.timings
            .record(Stage::Init, init_started.elapsed().as_secs_f64());

        if failure.is_none() {
            failure = self.run_fetch_stages();
        }

        // Classification always happens once fetching stops, whether the
        // stages ran dry, failed, or finished clean.
        let classify_started = Instant::now();
        self.note_stage(Stage::Classify);
        let verdict = match &failure {
            Some(f) => Verdict::Failure(f.kind),
            None => self.final_verdict(),
        };
        if let (Verdict::Failure(kind), None) = (verdict, &failure) {
            failure = Some(ScrapeFailure::new(
                kind,
                Stage::Classify,
                "listing completed with zero extractable items",
            ));
        }
        self.timings
            .record(Stage::Classify, classify_started.elapsed().as_secs_f64());

        let score_started = Instant::now();
        self.note_stage(Stage::Score);
        let score = match failure.as_ref().map(|f| f.kind) {
            Some(FailureKind::ConfigError | FailureKind::BudgetExceeded) => None,
            _ => Some(confidence_score(&ScoreInputs {
                stats: &self.stats,
                fetched: self.counts.fetched,
                processed: self.counts.processed,
                expected: self.config.expected_jobs,
                unexpected_content: self.unexpected_content,
            })),
        };
        self.timings
            .record(Stage::Score, score_started.elapsed().as_secs_f64());

        self.stage_finalize(verdict, score, failure)
    }

    fn run_fetch_stages(&mut self) -> Option<ScrapeFailure> {
        let resume_from = self.resume_from;

        if resume_from.map_or(true, |done| done < Stage::ParseList) {
            if let Err(f) = self.timed(Stage::FetchList, Self::fetch_list_inner) {
                return Some(f);
            }
            if let Err(f) = self.timed(Stage::ParseList, Self::parse_list_inner) {
                return Some(f);
            }
            if let Err(f) = self.write_checkpoint(Stage::ParseList, None) {
                return Some(f);
            }
        }

        if resume_from.map_or(true, |done| done < Stage::Finalize) {
            if let Err(f) = self.timed(Stage::FetchDetails, Self::fetch_details_inner) {
                return Some(f);
            }
        }

        None
    }

    fn timed(
        &mut self,
        stage: Stage,
        body: fn(&mut Self) -> Result<(), ScrapeFailure>,
    ) -> Result<(), ScrapeFailure> {
        let started = Instant::now();
        let result = body(self);
        self.timings.record(stage, started.elapsed().as_secs_f64());
        result
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    fn stage_init(&mut self) -> Result<(), ScrapeFailure> {
        self.enter_stage(Stage::Init)?;

        if self.adapter.is_none() {
            return Err(ScrapeFailure::config(format!(
                "no adapter registered under '{}'",
                self.config.adapter
            )));
        }
        let budget = &self.config.budget;
        if budget.max_requests == 0 {
            return Err(ScrapeFailure::config("budget max_requests must be positive"));
        }
        if budget.max_runtime_secs == 0 {
            return Err(ScrapeFailure::config(
                "budget max_runtime_secs must be positive",
            ));
        }
        if budget.max_bytes == 0 {
            return Err(ScrapeFailure::config("budget max_bytes must be positive"));
        }
        if let Some(bounds) = self.config.expected_jobs {
            if bounds.max.is_some_and(|max| max < bounds.min) {
                return Err(ScrapeFailure::config(format!(
                    "expected job bounds inverted: min {} > max {}",
                    bounds.min,
                    bounds.max.unwrap_or(0)
                )));
            }
        }
        Ok(())
    }

    fn fetch_list_inner(&mut self) -> Result<(), ScrapeFailure> {
        self.enter_stage(Stage::FetchList)?;
        // Init already rejected the run unless an adapter resolved.
        let Some(adapter) = self.adapter.clone() else {
            return Err(ScrapeFailure::config("adapter missing"));
        };

        let mut cursor = self.page_cursor.take();
        let mut pages: u64 = 0;
        let mut checkpointed_at = self.items.len() as u64;

        loop {
            if pages > 0 {
                self.pace();
            }
            let cursor_arg = cursor.clone();
            let page = self.call_with_retries(Stage::FetchList, |ctx| {
                adapter.fetch_listing_page(ctx, cursor_arg.as_deref())
            })?;

            self.stats.merge(&page.stats);
            self.after_request(Stage::FetchList)?;

            self.counts.fetched += page.items.len() as u64;
            self.items.extend(page.items);
            pages += 1;
            cursor = page.next_cursor;

            let total = self.items.len() as u64;
            if cursor.is_some() && total.saturating_sub(checkpointed_at) >= CHECKPOINT_EVERY_ITEMS
            {
                self.write_checkpoint(Stage::FetchList, cursor.clone())?;
                checkpointed_at = total;
            }
            if cursor.is_none() {
                break;
            }
        }

        tracing::debug!(
            source = %self.config.key,
            pages,
            items = self.items.len(),
            "listing fetch complete"
        );
        Ok(())
    }

    /// Normalization and per-item validation. Pure: re-running it over the
    /// same raw items is free, which is what makes mid-listing resume
    /// checkpoints safe.
    fn parse_list_inner(&mut self) -> Result<(), ScrapeFailure> {
        self.enter_stage(Stage::ParseList)?;

        let raw = std::mem::take(&mut self.items);
        let total = raw.len();
        self.counts.processed = 0;
        self.counts.skipped = 0;

        let mut seen = HashSet::with_capacity(total);
        let mut valid = Vec::with_capacity(total);
        for item in raw {
            if item_is_valid(&item) && seen.insert(item.id.clone()) {
                valid.push(item);
            } else {
                self.counts.skipped += 1;
            }
        }
        self.counts.processed = valid.len() as u64;
        self.items = valid;

        if total > 0 && self.items.is_empty() {
            return Err(ScrapeFailure::new(
                FailureKind::ValidationError,
                Stage::ParseList,
                format!("all {total} extracted items failed validation"),
            ));
        }
        if self.counts.skipped > 0 {
            tracing::debug!(
                source = %self.config.key,
                skipped = self.counts.skipped,
                kept = self.counts.processed,
                "dropped invalid or duplicate items"
            );
        }
        Ok(())
    }

    fn fetch_details_inner(&mut self) -> Result<(), ScrapeFailure> {
        if !self.config.fetch_details {
            return Ok(());
        }
        if self.config.safe_mode {
            tracing::debug!(source = %self.config.key, "safe mode: skipping detail fetches");
            return Ok(());
        }

        self.enter_stage(Stage::FetchDetails)?;
        let Some(adapter) = self.adapter.clone() else {
            return Err(ScrapeFailure::config("adapter missing"));
        };
        let key = self.config.key.clone();

        let start = usize::try_from(self.details_done).unwrap_or(usize::MAX);
        for idx in start..self.items.len() {
            let item = self.items[idx].clone();
            if item.detail_url.is_none() {
                self.details_done = idx as u64 + 1;
                continue;
            }

            self.pace();
            let detail = self.call_with_retries(Stage::FetchDetails, |ctx| {
                adapter.fetch_detail(ctx, &item)
            })?;
            self.stats.merge(&detail.stats);
            self.after_request(Stage::FetchDetails)?;

            let reference = retry_gateway(Stage::FetchDetails, FailureKind::StorageError, || {
                self.blobs.store_detail(&key, &item.id, &detail.text)
            })?;
            self.items[idx].detail_ref = Some(reference);
            self.details_done = idx as u64 + 1;

            if self.details_done % CHECKPOINT_EVERY_ITEMS == 0 {
                self.write_checkpoint(Stage::FetchDetails, None)?;
            }
        }
        Ok(())
    }

    fn final_verdict(&self) -> Verdict {
        let symptoms = SymptomBundle {
            parse: ParseOutcome::Parsed,
            items_extracted: self.counts.fetched,
            ..SymptomBundle::default()
        };
        classify(&symptoms)
    }

    fn stage_finalize(
        mut self,
        verdict: Verdict,
        score: Option<f64>,
        failure: Option<ScrapeFailure>,
    ) -> Result<DriverOutput, RunError> {
        let finalize_started = Instant::now();
        self.note_stage(Stage::Finalize);

        let (mut status, tier) = match verdict {
            Verdict::Failure(kind) => (RunStatus::Failed(kind), None),
            Verdict::Success => {
                let mut tier = gate_tier(score.unwrap_or(0.0));
                if self.config.safe_mode && tier == GateTier::Full {
                    // Safe mode never reaches the destructive tier.
                    tier = GateTier::UpsertOnly;
                }
                let status = if tier == GateTier::Full {
                    RunStatus::Success
                } else {
                    RunStatus::PartialSuccess
                };
                (status, Some(tier))
            }
        };
        let mut error_message = failure.map(|f| f.to_string());

        let mutate = verdict.is_success()
            && tier.is_some_and(|t| t != GateTier::Discard)
            && !self.dry_run;
        if mutate {
            let full = tier == Some(GateTier::Full);
            if let Err(f) = self.apply_mutations(full) {
                status = RunStatus::Failed(f.kind);
                error_message = Some(f.to_string());
            }
        } else if tier == Some(GateTier::Discard) {
            tracing::warn!(
                source = %self.config.key,
                score,
                fetched = self.counts.fetched,
                "confidence below floor; fetched data discarded"
            );
        }

        let transition = if self.dry_run {
            None
        } else {
            match self.apply_kill_switch(status, score) {
                Ok(t) => t,
                Err(err) => {
                    tracing::error!(
                        source = %self.config.key,
                        error = %err,
                        "kill-switch update failed; streaks not recorded for this run"
                    );
                    None
                }
            }
        };

        self.timings
            .record(Stage::Finalize, finalize_started.elapsed().as_secs_f64());

        if let Some(run_id) = self.run_id {
            let outcome = RunOutcome {
                status,
                finished_at: Utc::now(),
                confidence_score: score,
                counts: self.counts,
                http_stats: self.stats.clone(),
                stage_timings: self.timings.clone(),
                error_message: error_message.clone(),
            };
            retry_state(Stage::Finalize, || self.state.finish_run(run_id, &outcome))
                .map_err(RunError::Failure)?;
        }

        let report = RunReport {
            run_id: self.run_id,
            source: self.config.key.clone(),
            status,
            confidence_score: score,
            tier,
            counts: self.counts,
            total_requests: self.stats.total_requests,
            bytes_downloaded: self.stats.bytes_downloaded,
            duration_secs: self.started.elapsed().as_secs_f64(),
            resumed: self.resumed,
            safe_mode: self.config.safe_mode,
            dry_run: self.dry_run,
            error_message,
        };
        Ok(DriverOutput { report, transition })
    }

    /// Gated inventory writes. The checkpoint beforehand means a crash
    /// anywhere in here replays finalize against idempotent upserts
    /// instead of refetching.
    fn apply_mutations(&mut self, full: bool) -> Result<(), ScrapeFailure> {
        self.write_checkpoint(Stage::Finalize, None)?;
        let key = self.config.key.clone();

        let outcome = retry_gateway(Stage::Finalize, FailureKind::DatabaseError, || {
            self.jobs.upsert_jobs(&key, &self.items)
        })?;
        self.counts.new = outcome.created;

        if full {
            let as_of = Utc::now();
            let seen: Vec<String> = self.items.iter().map(|item| item.id.clone()).collect();
            let flipped = retry_gateway(Stage::Finalize, FailureKind::DatabaseError, || {
                self.jobs.mark_inactive(&key, &seen, as_of)
            })?;
            self.counts.marked_inactive = flipped;
            retry_gateway(Stage::Finalize, FailureKind::DatabaseError, || {
                self.jobs.update_aggregates(&key)
            })?;
        }

        tracing::info!(
            source = %self.config.key,
            created = outcome.created,
            updated = outcome.updated,
            marked_inactive = self.counts.marked_inactive,
            full,
            "inventory updated"
        );
        Ok(())
    }

    fn apply_kill_switch(
        &mut self,
        status: RunStatus,
        score: Option<f64>,
    ) -> Result<Option<SwitchTransition>, StateError> {
        let key = self.config.key.clone();
        let mut health = self.state.get_source_health(&key)?;
        let transition =
            killswitch::apply_outcome(&mut health, &mut self.config, status, score, Utc::now());
        self.state.put_source_health(&health)?;
        if transition.is_some() {
            self.state.put_source_config(&self.config, Utc::now())?;
        }
        Ok(transition)
    }

    // -----------------------------------------------------------------------
    // Retry loop and bookkeeping
    // -----------------------------------------------------------------------

    /// Drive one adapter call through the retry policy. Attempts are
    /// counted across kind switches, so an alternating fault can never
    /// loop past the tightest applicable cap.
    fn call_with_retries<T>(
        &mut self,
        stage: Stage,
        mut call: impl FnMut(&FetchContext) -> Result<T, SymptomBundle>,
    ) -> Result<T, ScrapeFailure> {
        let mut attempt: u32 = 1;
        let mut rotate = false;
        let mut timeout_factor: u32 = 1;

        loop {
            let ctx = FetchContext {
                source: self.config.key.clone(),
                attempt,
                rotate_route: rotate,
                timeout: BASE_REQUEST_TIMEOUT * timeout_factor,
                safe_mode: self.config.safe_mode,
            };
            let bundle = match call(&ctx) {
                Ok(value) => return Ok(value),
                Err(bundle) => bundle,
            };

            self.observe_bundle(&bundle);
            self.after_request(stage)?;

            let kind = match classify(&bundle) {
                Verdict::Failure(kind) => kind,
                // An Err with benign symptoms is an adapter defect.
                Verdict::Success => FailureKind::DependencyError,
            };
            let policy = retry_policy(kind);

            match next_delay(kind, attempt, bundle.retry_after) {
                Some(delay) => {
                    tracing::warn!(
                        source = %self.config.key,
                        stage = %stage,
                        attempt,
                        kind = %kind,
                        delay_ms = delay.as_millis() as u64,
                        "stage call failed; retrying"
                    );
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    rotate = policy.rotate_route;
                    if policy.escalate_timeout {
                        timeout_factor = (timeout_factor + 1).min(MAX_TIMEOUT_ESCALATION);
                    }
                    attempt += 1;
                }
                None => {
                    tracing::warn!(
                        source = %self.config.key,
                        stage = %stage,
                        attempts = attempt,
                        kind = %kind,
                        "stage call failed; retries exhausted"
                    );
                    let message = bundle
                        .detail
                        .clone()
                        .unwrap_or_else(|| format!("{kind} after {attempt} attempts"));
                    let mut failure = ScrapeFailure::new(kind, stage, message);
                    if let Some(wait) = bundle.retry_after {
                        failure = failure.with_retry_after(wait);
                    }
                    return Err(failure);
                }
            }
        }
    }

    fn observe_bundle(&mut self, bundle: &SymptomBundle) {
        self.stats.merge(&bundle.stats);
        if self.stats.last_error.is_none() {
            if let Some(detail) = &bundle.detail {
                self.stats.last_error = Some(detail.clone());
            }
        }
        if let (Some(expected), Some(actual)) = (bundle.expected_content, bundle.actual_content) {
            if expected != actual {
                self.unexpected_content = true;
            }
        }
    }

    /// Budget and cancellation gate, applied after every request and at
    /// stage boundaries.
    fn after_request(&self, stage: Stage) -> Result<(), ScrapeFailure> {
        if let Err(breach) = self.budget.check(&self.stats) {
            return Err(ScrapeFailure::budget(stage, breach.message()));
        }
        if self.cancel.load(Ordering::Relaxed) {
            return Err(ScrapeFailure::dependency(stage, "run cancelled"));
        }
        Ok(())
    }

    fn pace(&self) {
        let mut ms = self.config.pacing_ms;
        if self.config.safe_mode {
            ms = ms.saturating_mul(SAFE_MODE_PACING_FACTOR);
        }
        if ms > 0 {
            std::thread::sleep(Duration::from_millis(ms));
        }
    }

    /// Stage transition that gates further work: retried, then terminal
    /// as `database_error`.
    fn enter_stage(&self, stage: Stage) -> Result<(), ScrapeFailure> {
        let Some(run_id) = self.run_id else {
            return Ok(());
        };
        retry_state(stage, || self.state.update_run_stage(run_id, stage))
    }

    /// Visibility-only stage note for the pure stages; never fails a run.
    fn note_stage(&self, stage: Stage) {
        let Some(run_id) = self.run_id else {
            return;
        };
        if let Err(err) = self.state.update_run_stage(run_id, stage) {
            tracing::warn!(run_id, stage = %stage, error = %err, "stage note write failed");
        }
    }

    fn write_checkpoint(
        &self,
        completed: Stage,
        page_cursor: Option<String>,
    ) -> Result<(), ScrapeFailure> {
        let Some(run_id) = self.run_id else {
            return Ok(());
        };
        let checkpoint = RunCheckpoint::new(
            completed,
            CheckpointPayload {
                items: self.items.clone(),
                page_cursor,
                details_done: self.details_done,
                counts: self.counts,
            },
        );
        retry_state(completed, || self.checkpoints.put(run_id, &checkpoint))
    }
}

fn item_is_valid(item: &JobItem) -> bool {
    !item.id.trim().is_empty() && !item.title.trim().is_empty() && !item.url.trim().is_empty()
}

// ---------------------------------------------------------------------------
// Infrastructure retry helpers
// ---------------------------------------------------------------------------

/// Run a state operation under the `database_error` retry policy.
/// Non-transient state errors (guard violations, oversized payloads) fail
/// immediately; only storage-level faults are worth the wait.
fn retry_state<T>(
    stage: Stage,
    mut op: impl FnMut() -> Result<T, StateError>,
) -> Result<T, ScrapeFailure> {
    let mut attempt: u32 = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => {
                let transient = matches!(err, StateError::Sqlite(_) | StateError::Io(_));
                let delay = if transient {
                    next_delay(FailureKind::DatabaseError, attempt, None)
                } else {
                    None
                };
                match delay {
                    Some(delay) => {
                        tracing::warn!(
                            stage = %stage,
                            attempt,
                            error = %err,
                            delay_ms = delay.as_millis() as u64,
                            "state write failed; retrying"
                        );
                        std::thread::sleep(delay);
                        attempt += 1;
                    }
                    None => return Err(ScrapeFailure::database(stage, err.to_string())),
                }
            }
        }
    }
}

/// Run a gateway operation under the linear retry policy for the given
/// kind (`database_error` for the inventory, `storage_error` for blobs).
fn retry_gateway<T>(
    stage: Stage,
    kind: FailureKind,
    mut op: impl FnMut() -> Result<T, GatewayError>,
) -> Result<T, ScrapeFailure> {
    let mut attempt: u32 = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => match next_delay(kind, attempt, None) {
                Some(delay) => {
                    tracing::warn!(
                        stage = %stage,
                        attempt,
                        kind = %kind,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "gateway call failed; retrying"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                None => return Err(ScrapeFailure::new(kind, stage, err.to_string())),
            },
        }
    }
}
