//! Source-level coordination above the run state machine.
//!
//! The orchestrator owns everything a single run must not: per-source
//! locks, adoption of unfinished runs, bounded fan-out across sources,
//! and the notification sink. Each source pass runs on a blocking worker
//! since the state backend and the adapters are synchronous.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use trawler_state::backend::{RunOutcome, StateBackend};
use trawler_state::error::StateError;
use trawler_state::lock::{LockManager, DEFAULT_LOCK_TTL};
use trawler_types::checkpoint::RunCheckpoint;
use trawler_types::failure::FailureKind;
use trawler_types::ids::SourceKey;
use trawler_types::run::{RunCounts, RunId, RunStatus, Stage, StageTimings};
use trawler_types::source::SourceConfig;
use trawler_types::stats::HttpStats;

use crate::adapter::AdapterRegistry;
use crate::errors::RunError;
use crate::gateway::{BlobStore, JobStore, NotificationSink};
use crate::killswitch::SwitchTransition;
use crate::result::{CheckReport, SkipReason, SourceOutcome, SweepSummary};
use crate::run::{DriverContext, DriverOutput, RunDriver};

/// Knobs the caller sets once per process.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub lock_ttl: Duration,
    /// Maximum sources scraped concurrently by [`Orchestrator::run_all`].
    pub parallelism: usize,
    /// Walk every stage but never write: no run record, no checkpoints,
    /// no inventory mutation, no kill-switch bookkeeping.
    pub dry_run: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            lock_ttl: DEFAULT_LOCK_TTL,
            parallelism: 4,
            dry_run: false,
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    state: Arc<dyn StateBackend>,
    locks: LockManager,
    adapters: AdapterRegistry,
    jobs: Arc<dyn JobStore>,
    blobs: Arc<dyn BlobStore>,
    notify: Arc<dyn NotificationSink>,
    options: EngineOptions,
    cancel: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(
        state: Arc<dyn StateBackend>,
        adapters: AdapterRegistry,
        jobs: Arc<dyn JobStore>,
        blobs: Arc<dyn BlobStore>,
        notify: Arc<dyn NotificationSink>,
        options: EngineOptions,
    ) -> Self {
        let locks = LockManager::new(Arc::clone(&state), options.lock_ttl);
        Self {
            state,
            locks,
            adapters,
            jobs,
            blobs,
            notify,
            options,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked between requests; setting it drains in-flight runs
    /// into a terminal `dependency_error`.
    #[must_use]
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    // -----------------------------------------------------------------------
    // Single-source pass
    // -----------------------------------------------------------------------

    /// Run one source end to end: lock, adopt or create, drive, notify.
    ///
    /// # Errors
    ///
    /// Returns [`RunError`] when the pass dies outside the run state
    /// machine; any created run got a best-effort terminal write first.
    pub async fn run_source(&self, key: &SourceKey) -> Result<SourceOutcome, RunError> {
        let this = self.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || this.run_source_blocking(&key))
            .await
            .map_err(|err| {
                RunError::Infrastructure(anyhow::anyhow!("source task panicked: {err}"))
            })?
    }

    fn run_source_blocking(&self, key: &SourceKey) -> Result<SourceOutcome, RunError> {
        let config = self
            .state
            .get_source_config(key)
            .map_err(|err| RunError::from_state(Stage::Init, &err))?
            .ok_or_else(|| {
                RunError::Infrastructure(anyhow::anyhow!("unknown source '{key}'"))
            })?;

        if !config.is_runnable(Utc::now()) {
            tracing::info!(
                source = %key,
                reason = config.disabled_reason.map(|r| r.as_str()),
                retry_after = config.retry_after.map(|t| t.to_rfc3339()),
                "source not runnable; skipping"
            );
            return Ok(SourceOutcome::Skipped {
                source: key.clone(),
                reason: SkipReason::Disabled,
            });
        }

        let Some(lease) = self
            .locks
            .acquire(key)
            .map_err(|err| RunError::from_state(Stage::Init, &err))?
        else {
            tracing::info!(source = %key, "another worker holds the lock; skipping");
            return Ok(SourceOutcome::Skipped {
                source: key.clone(),
                reason: SkipReason::Locked,
            });
        };

        let outcome = self.drive_locked(config);

        if let Err(err) = self.locks.release(&lease) {
            // The TTL reclaims it either way.
            tracing::warn!(source = %key, error = %err, "lock release failed");
        }
        outcome
    }

    /// Everything that must happen under the source lock.
    fn drive_locked(&self, config: SourceConfig) -> Result<SourceOutcome, RunError> {
        let (run_id, resume) = self.prepare_run(&config)?;

        let adapter = self.adapters.get(&config.adapter);
        let driver = RunDriver::new(DriverContext {
            state: Arc::clone(&self.state),
            adapter,
            jobs: Arc::clone(&self.jobs),
            blobs: Arc::clone(&self.blobs),
            config,
            run_id,
            resume,
            cancel: Arc::clone(&self.cancel),
            dry_run: self.options.dry_run,
        });

        match driver.execute() {
            Ok(output) => {
                self.notify_outcome(&output, run_id);
                Ok(SourceOutcome::Ran(output.report))
            }
            Err(err) => {
                if let Some(run_id) = run_id {
                    self.best_effort_finish(run_id, &err);
                }
                Err(err)
            }
        }
    }

    /// Adopt the newest unfinished run for this source, or create a fresh
    /// record. Dry runs get neither.
    fn prepare_run(
        &self,
        config: &SourceConfig,
    ) -> Result<(Option<RunId>, Option<RunCheckpoint>), RunError> {
        if self.options.dry_run {
            return Ok((None, None));
        }
        let key = &config.key;

        if let Some(existing) = self
            .state
            .latest_unfinished_run(key)
            .map_err(|err| RunError::from_state(Stage::Init, &err))?
        {
            let checkpoint = self
                .state
                .get_checkpoint(existing.id)
                .map_err(|err| RunError::from_state(Stage::Init, &err))?;
            tracing::info!(
                source = %key,
                run_id = existing.id,
                has_checkpoint = checkpoint.is_some(),
                "adopting unfinished run"
            );
            return Ok((Some(existing.id), checkpoint));
        }

        let run_id = self
            .state
            .create_run(key, Utc::now())
            .map_err(|err| RunError::from_state(Stage::Init, &err))?;
        Ok((Some(run_id), None))
    }

    fn notify_outcome(&self, output: &DriverOutput, run_id: Option<RunId>) {
        match &output.transition {
            Some(SwitchTransition::Disabled { reason, retry_after }) => {
                self.notify
                    .source_disabled(&output.report.source, *reason, *retry_after);
            }
            Some(SwitchTransition::Reenabled) => {
                self.notify.source_reenabled(&output.report.source);
            }
            None => {}
        }
        if let Some(run_id) = run_id {
            match self.state.get_run(run_id) {
                Ok(Some(record)) => self.notify.run_finished(&record),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(run_id, error = %err, "finished run not loadable for notification");
                }
            }
        }
    }

    /// Terminal write for a run whose driver died mid-flight, so the
    /// record does not dangle until someone adopts it.
    fn best_effort_finish(&self, run_id: RunId, err: &RunError) {
        let kind = err.failure_kind().unwrap_or(FailureKind::DependencyError);
        let outcome = RunOutcome {
            status: RunStatus::Failed(kind),
            finished_at: Utc::now(),
            confidence_score: None,
            counts: RunCounts::default(),
            http_stats: HttpStats::default(),
            stage_timings: StageTimings::default(),
            error_message: Some(err.to_string()),
        };
        match self.state.finish_run(run_id, &outcome) {
            Ok(()) => {}
            // Already terminal means the driver got its write in.
            Err(StateError::RunFinalized(_)) => {}
            Err(state_err) => {
                tracing::error!(
                    run_id,
                    error = %state_err,
                    "could not finalize crashed run; it will be adopted later"
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // Fleet operations
    // -----------------------------------------------------------------------

    /// Scrape every configured source with bounded parallelism. Individual
    /// failures become [`SourceOutcome::Errored`] instead of aborting the
    /// fleet.
    ///
    /// # Errors
    ///
    /// Returns [`RunError`] only when the source list itself cannot be
    /// loaded.
    pub async fn run_all(&self) -> Result<Vec<SourceOutcome>, RunError> {
        let state = Arc::clone(&self.state);
        let configs = tokio::task::spawn_blocking(move || state.list_source_configs())
            .await
            .map_err(|err| RunError::Infrastructure(anyhow::anyhow!("list task panicked: {err}")))?
            .map_err(|err| RunError::from_state(Stage::Init, &err))?;

        let semaphore = Arc::new(Semaphore::new(self.options.parallelism.max(1)));
        let mut tasks = JoinSet::new();
        for config in configs {
            let this = self.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return SourceOutcome::Errored {
                            source: config.key.clone(),
                            message: "scheduler shut down".to_string(),
                        }
                    }
                };
                let key = config.key.clone();
                match this.run_source(&key).await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        tracing::error!(source = %key, error = %err, "source pass failed");
                        SourceOutcome::Errored {
                            source: key,
                            message: err.to_string(),
                        }
                    }
                }
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => tracing::error!(error = %err, "source task panicked"),
            }
        }
        outcomes.sort_by(|a, b| a.source().as_str().cmp(b.source().as_str()));
        Ok(outcomes)
    }

    /// Write declarative source definitions into state. Runtime-owned
    /// fields (`enabled`, `disabled_at`, `disabled_reason`, `retry_after`,
    /// `safe_mode`) survive re-seeding; everything else follows the
    /// definition.
    ///
    /// # Errors
    ///
    /// Returns [`RunError`] on storage failure.
    pub async fn seed_sources(&self, configs: Vec<SourceConfig>) -> Result<(), RunError> {
        let state = Arc::clone(&self.state);
        tokio::task::spawn_blocking(move || -> Result<(), RunError> {
            let now = Utc::now();
            for mut config in configs {
                if let Some(existing) = state
                    .get_source_config(&config.key)
                    .map_err(|err| RunError::from_state(Stage::Init, &err))?
                {
                    config.enabled = existing.enabled;
                    config.disabled_at = existing.disabled_at;
                    config.disabled_reason = existing.disabled_reason;
                    config.retry_after = existing.retry_after;
                    config.safe_mode = existing.safe_mode;
                }
                state
                    .put_source_config(&config, now)
                    .map_err(|err| RunError::from_state(Stage::Init, &err))?;
            }
            Ok(())
        })
        .await
        .map_err(|err| RunError::Infrastructure(anyhow::anyhow!("seed task panicked: {err}")))?
    }

    /// Health pass: can state answer, and does every source resolve an
    /// adapter. Never fails; problems land in the report.
    pub async fn check(&self) -> CheckReport {
        let state = Arc::clone(&self.state);
        let listed = tokio::task::spawn_blocking(move || state.list_source_configs()).await;

        match listed {
            Ok(Ok(configs)) => {
                let missing: Vec<String> = configs
                    .iter()
                    .filter(|c| self.adapters.get(&c.adapter).is_none())
                    .map(|c| format!("{} -> {}", c.key, c.adapter))
                    .collect();
                CheckReport {
                    config_ok: true,
                    state_ok: true,
                    sources: configs.len(),
                    missing_adapters: missing,
                }
            }
            Ok(Err(err)) => {
                tracing::error!(error = %err, "state backend check failed");
                CheckReport {
                    config_ok: true,
                    state_ok: false,
                    sources: 0,
                    missing_adapters: Vec::new(),
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "state check task panicked");
                CheckReport {
                    config_ok: true,
                    state_ok: false,
                    sources: 0,
                    missing_adapters: Vec::new(),
                }
            }
        }
    }

    /// Hygiene: fail runs started before `abandoned_after` ago and drop
    /// expired locks. Adoption and lock TTLs keep the system correct
    /// without this; the sweep keeps dashboards honest.
    ///
    /// # Errors
    ///
    /// Returns [`RunError`] on storage failure.
    pub async fn sweep(&self, abandoned_after: TimeDelta) -> Result<SweepSummary, RunError> {
        let state = Arc::clone(&self.state);
        let locks = self.locks.clone();
        tokio::task::spawn_blocking(move || -> Result<SweepSummary, RunError> {
            let now = Utc::now();
            let cutoff = now - abandoned_after;
            let abandoned = state
                .fail_abandoned_runs(cutoff, now)
                .map_err(|err| RunError::from_state(Stage::Finalize, &err))?;
            let expired = locks
                .sweep_expired()
                .map_err(|err| RunError::from_state(Stage::Finalize, &err))?;
            if abandoned > 0 || expired > 0 {
                tracing::info!(abandoned, expired, "maintenance sweep cleaned up");
            }
            Ok(SweepSummary {
                abandoned_runs: abandoned,
                expired_locks: expired,
            })
        })
        .await
        .map_err(|err| RunError::Infrastructure(anyhow::anyhow!("sweep task panicked: {err}")))?
    }

    /// True once [`Orchestrator::cancel_handle`] has been flipped.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}
