//! `SQLite`-backed implementation of [`StateBackend`].
//!
//! Uses a single `Mutex<Connection>` for thread safety. All timestamps are
//! stored as RFC 3339 TEXT with fixed millisecond precision and a `Z`
//! suffix, so lexicographic comparison in SQL matches chronological order.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use trawler_types::checkpoint::RunCheckpoint;
use trawler_types::failure::FailureKind;
use trawler_types::ids::{HolderId, SourceKey};
use trawler_types::run::{RunCounts, RunId, RunRecord, RunStatus, Stage};
use trawler_types::source::{JobCountBounds, RunBudget, SourceConfig, SourceHealth};

use crate::backend::{RunOutcome, StateBackend};
use crate::error::{self, StateError};
use crate::lock::SourceLock;

/// Idempotent DDL for orchestration state.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT NOT NULL,
    status TEXT NOT NULL,
    current_stage TEXT,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    confidence_score REAL,
    jobs_fetched INTEGER NOT NULL DEFAULT 0,
    jobs_processed INTEGER NOT NULL DEFAULT 0,
    jobs_new INTEGER NOT NULL DEFAULT 0,
    jobs_marked_inactive INTEGER NOT NULL DEFAULT 0,
    jobs_skipped INTEGER NOT NULL DEFAULT 0,
    http_stats TEXT NOT NULL DEFAULT '{}',
    stage_durations TEXT NOT NULL DEFAULT '{}',
    checkpoint TEXT,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_source_started ON runs (source, started_at);

CREATE TABLE IF NOT EXISTS source_locks (
    source TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS source_configs (
    source TEXT PRIMARY KEY,
    adapter TEXT NOT NULL DEFAULT '',
    enabled INTEGER NOT NULL DEFAULT 1,
    safe_mode INTEGER NOT NULL DEFAULT 0,
    disabled_at TEXT,
    disabled_reason TEXT,
    retry_after TEXT,
    expected_min_jobs INTEGER,
    expected_max_jobs INTEGER,
    max_requests INTEGER NOT NULL,
    max_runtime_secs INTEGER NOT NULL,
    max_bytes INTEGER NOT NULL,
    fetch_details INTEGER NOT NULL DEFAULT 1,
    pacing_ms INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS source_health (
    source TEXT PRIMARY KEY,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    consecutive_low_confidence INTEGER NOT NULL DEFAULT 0,
    last_status TEXT,
    last_run_at TEXT,
    version INTEGER NOT NULL DEFAULT 0
);
";

const RUN_COLUMNS: &str = "id, source, status, current_stage, started_at, finished_at, \
     confidence_score, jobs_fetched, jobs_processed, jobs_new, jobs_marked_inactive, \
     jobs_skipped, http_stats, stage_durations, error_message";

/// `SQLite`-backed state storage.
///
/// Create with [`SqliteStateBackend::open`] for file-backed persistence or
/// [`SqliteStateBackend::in_memory`] for tests.
pub struct SqliteStateBackend {
    conn: Mutex<Connection>,
}

impl SqliteStateBackend {
    /// Open (and initialize) a database file, creating parent directories
    /// as needed.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the directory or database cannot be
    /// created.
    pub fn open(path: impl AsRef<Path>) -> error::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Fresh in-memory database, used by tests.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the database cannot be created.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }
}

fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(field: &'static str, s: &str) -> error::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StateError::Decode {
            field,
            value: s.to_string(),
        })
}

/// Distinguish "run already terminal" from "run does not exist" after a
/// guarded UPDATE touched zero rows.
fn missing_or_finalized(conn: &Connection, run_id: RunId) -> StateError {
    let exists = conn
        .query_row("SELECT 1 FROM runs WHERE id = ?1", params![run_id], |_| {
            Ok(())
        })
        .optional();
    match exists {
        Ok(Some(())) => StateError::RunFinalized(run_id),
        Ok(None) => StateError::RunMissing(run_id),
        Err(e) => StateError::Sqlite(e),
    }
}

struct RawRun {
    id: RunId,
    source: String,
    status: String,
    current_stage: Option<String>,
    started_at: String,
    finished_at: Option<String>,
    confidence_score: Option<f64>,
    fetched: u64,
    processed: u64,
    new: u64,
    marked_inactive: u64,
    skipped: u64,
    http_stats: String,
    stage_durations: String,
    error_message: Option<String>,
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRun> {
    Ok(RawRun {
        id: row.get(0)?,
        source: row.get(1)?,
        status: row.get(2)?,
        current_stage: row.get(3)?,
        started_at: row.get(4)?,
        finished_at: row.get(5)?,
        confidence_score: row.get(6)?,
        fetched: row.get(7)?,
        processed: row.get(8)?,
        new: row.get(9)?,
        marked_inactive: row.get(10)?,
        skipped: row.get(11)?,
        http_stats: row.get(12)?,
        stage_durations: row.get(13)?,
        error_message: row.get(14)?,
    })
}

fn decode_run(raw: RawRun) -> error::Result<RunRecord> {
    let status = RunStatus::parse(&raw.status).ok_or_else(|| StateError::Decode {
        field: "status",
        value: raw.status.clone(),
    })?;
    let current_stage = match raw.current_stage {
        None => None,
        Some(s) => Some(Stage::parse(&s).ok_or(StateError::Decode {
            field: "current_stage",
            value: s,
        })?),
    };
    let finished_at = match raw.finished_at {
        None => None,
        Some(s) => Some(parse_ts("finished_at", &s)?),
    };
    Ok(RunRecord {
        id: raw.id,
        source: SourceKey::new(raw.source),
        status,
        current_stage,
        started_at: parse_ts("started_at", &raw.started_at)?,
        finished_at,
        confidence_score: raw.confidence_score,
        counts: RunCounts {
            fetched: raw.fetched,
            processed: raw.processed,
            new: raw.new,
            marked_inactive: raw.marked_inactive,
            skipped: raw.skipped,
        },
        http_stats: serde_json::from_str(&raw.http_stats)?,
        stage_timings: serde_json::from_str(&raw.stage_durations)?,
        error_message: raw.error_message,
    })
}

impl StateBackend for SqliteStateBackend {
    fn create_run(&self, source: &SourceKey, now: DateTime<Utc>) -> error::Result<RunId> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO runs (source, status, current_stage, started_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                source.as_str(),
                RunStatus::Running.as_str(),
                Stage::Init.as_str(),
                fmt_ts(now)
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn update_run_stage(&self, run_id: RunId, stage: Stage) -> error::Result<()> {
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE runs SET current_stage = ?1 WHERE id = ?2 AND finished_at IS NULL",
            params![stage.as_str(), run_id],
        )?;
        if updated == 0 {
            return Err(missing_or_finalized(&conn, run_id));
        }
        Ok(())
    }

    fn finish_run(&self, run_id: RunId, outcome: &RunOutcome) -> error::Result<()> {
        let stats_json = serde_json::to_string(&outcome.http_stats)?;
        let timings_json = serde_json::to_string(&outcome.stage_timings)?;
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2, confidence_score = ?3, \
                 jobs_fetched = ?4, jobs_processed = ?5, jobs_new = ?6, \
                 jobs_marked_inactive = ?7, jobs_skipped = ?8, http_stats = ?9, \
                 stage_durations = ?10, error_message = ?11 \
             WHERE id = ?12 AND finished_at IS NULL",
            params![
                outcome.status.as_str(),
                fmt_ts(outcome.finished_at),
                outcome.confidence_score,
                outcome.counts.fetched,
                outcome.counts.processed,
                outcome.counts.new,
                outcome.counts.marked_inactive,
                outcome.counts.skipped,
                stats_json,
                timings_json,
                outcome.error_message,
                run_id
            ],
        )?;
        if updated == 0 {
            return Err(missing_or_finalized(&conn, run_id));
        }
        Ok(())
    }

    fn get_run(&self, run_id: RunId) -> error::Result<Option<RunRecord>> {
        let conn = self.lock_conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                params![run_id],
                row_to_raw,
            )
            .optional()?;
        raw.map(decode_run).transpose()
    }

    fn latest_unfinished_run(&self, source: &SourceKey) -> error::Result<Option<RunRecord>> {
        let conn = self.lock_conn()?;
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM runs \
                     WHERE source = ?1 AND finished_at IS NULL \
                     ORDER BY id DESC LIMIT 1"
                ),
                params![source.as_str()],
                row_to_raw,
            )
            .optional()?;
        raw.map(decode_run).transpose()
    }

    fn recent_runs(
        &self,
        source: Option<&SourceKey>,
        limit: u64,
    ) -> error::Result<Vec<RunRecord>> {
        let conn = self.lock_conn()?;
        let raws: Vec<RawRun> = match source {
            Some(key) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RUN_COLUMNS} FROM runs WHERE source = ?1 \
                     ORDER BY id DESC LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![key.as_str(), limit], row_to_raw)?;
                rows.collect::<rusqlite::Result<_>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RUN_COLUMNS} FROM runs ORDER BY id DESC LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit], row_to_raw)?;
                rows.collect::<rusqlite::Result<_>>()?
            }
        };
        raws.into_iter().map(decode_run).collect()
    }

    fn fail_abandoned_runs(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> error::Result<u64> {
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2, error_message = ?3 \
             WHERE finished_at IS NULL AND started_at < ?4",
            params![
                RunStatus::Failed(FailureKind::DependencyError).as_str(),
                fmt_ts(now),
                "abandoned run failed by hygiene sweep",
                fmt_ts(cutoff)
            ],
        )?;
        Ok(updated as u64)
    }

    fn put_checkpoint(&self, run_id: RunId, checkpoint: &RunCheckpoint) -> error::Result<()> {
        let json = serde_json::to_string(checkpoint)?;
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE runs SET checkpoint = ?1 WHERE id = ?2 AND finished_at IS NULL",
            params![json, run_id],
        )?;
        if updated == 0 {
            return Err(missing_or_finalized(&conn, run_id));
        }
        Ok(())
    }

    fn get_checkpoint(&self, run_id: RunId) -> error::Result<Option<RunCheckpoint>> {
        let conn = self.lock_conn()?;
        let json: Option<Option<String>> = conn
            .query_row(
                "SELECT checkpoint FROM runs WHERE id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        match json.flatten() {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    fn try_acquire_lock(
        &self,
        source: &SourceKey,
        holder: &HolderId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> error::Result<bool> {
        let conn = self.lock_conn()?;
        // Single CAS statement: take a free slot, or steal an expired one.
        // Expiry comparison is a string compare over the fixed-width
        // timestamp format.
        let updated = conn.execute(
            "INSERT INTO source_locks (source, holder, acquired_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(source) DO UPDATE SET \
                 holder = excluded.holder, \
                 acquired_at = excluded.acquired_at, \
                 expires_at = excluded.expires_at \
             WHERE source_locks.expires_at <= excluded.acquired_at",
            params![
                source.as_str(),
                holder.as_str(),
                fmt_ts(now),
                fmt_ts(expires_at)
            ],
        )?;
        Ok(updated > 0)
    }

    fn release_lock(&self, source: &SourceKey, holder: &HolderId) -> error::Result<bool> {
        let conn = self.lock_conn()?;
        let deleted = conn.execute(
            "DELETE FROM source_locks WHERE source = ?1 AND holder = ?2",
            params![source.as_str(), holder.as_str()],
        )?;
        Ok(deleted > 0)
    }

    fn get_lock(&self, source: &SourceKey) -> error::Result<Option<SourceLock>> {
        let conn = self.lock_conn()?;
        let raw: Option<(String, String, String)> = conn
            .query_row(
                "SELECT holder, acquired_at, expires_at FROM source_locks WHERE source = ?1",
                params![source.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        match raw {
            None => Ok(None),
            Some((holder, acquired_at, expires_at)) => Ok(Some(SourceLock {
                source: source.clone(),
                holder: HolderId::new(holder),
                acquired_at: parse_ts("acquired_at", &acquired_at)?,
                expires_at: parse_ts("expires_at", &expires_at)?,
            })),
        }
    }

    fn delete_expired_locks(&self, now: DateTime<Utc>) -> error::Result<u64> {
        let conn = self.lock_conn()?;
        let deleted = conn.execute(
            "DELETE FROM source_locks WHERE expires_at <= ?1",
            params![fmt_ts(now)],
        )?;
        Ok(deleted as u64)
    }

    fn get_source_config(&self, key: &SourceKey) -> error::Result<Option<SourceConfig>> {
        let conn = self.lock_conn()?;
        let raw = conn
            .query_row(
                "SELECT adapter, enabled, safe_mode, disabled_at, disabled_reason, \
                     retry_after, expected_min_jobs, expected_max_jobs, max_requests, \
                     max_runtime_secs, max_bytes, fetch_details, pacing_ms \
                 FROM source_configs WHERE source = ?1",
                params![key.as_str()],
                row_to_raw_config,
            )
            .optional()?;
        raw.map(|r| decode_config(key.clone(), r)).transpose()
    }

    fn put_source_config(
        &self,
        config: &SourceConfig,
        now: DateTime<Utc>,
    ) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO source_configs (source, adapter, enabled, safe_mode, disabled_at, \
                 disabled_reason, retry_after, expected_min_jobs, expected_max_jobs, \
                 max_requests, max_runtime_secs, max_bytes, fetch_details, pacing_ms, \
                 updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15) \
             ON CONFLICT(source) DO UPDATE SET \
                 adapter = excluded.adapter, \
                 enabled = excluded.enabled, \
                 safe_mode = excluded.safe_mode, \
                 disabled_at = excluded.disabled_at, \
                 disabled_reason = excluded.disabled_reason, \
                 retry_after = excluded.retry_after, \
                 expected_min_jobs = excluded.expected_min_jobs, \
                 expected_max_jobs = excluded.expected_max_jobs, \
                 max_requests = excluded.max_requests, \
                 max_runtime_secs = excluded.max_runtime_secs, \
                 max_bytes = excluded.max_bytes, \
                 fetch_details = excluded.fetch_details, \
                 pacing_ms = excluded.pacing_ms, \
                 updated_at = excluded.updated_at",
            params![
                config.key.as_str(),
                config.adapter,
                config.enabled,
                config.safe_mode,
                config.disabled_at.map(fmt_ts),
                config.disabled_reason.map(|r| r.as_str()),
                config.retry_after.map(fmt_ts),
                config.expected_jobs.map(|b| b.min),
                config.expected_jobs.and_then(|b| b.max),
                config.budget.max_requests,
                config.budget.max_runtime_secs,
                config.budget.max_bytes,
                config.fetch_details,
                config.pacing_ms,
                fmt_ts(now)
            ],
        )?;
        Ok(())
    }

    fn list_source_configs(&self) -> error::Result<Vec<SourceConfig>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT source, adapter, enabled, safe_mode, disabled_at, disabled_reason, \
                 retry_after, expected_min_jobs, expected_max_jobs, max_requests, \
                 max_runtime_secs, max_bytes, fetch_details, pacing_ms \
             FROM source_configs ORDER BY source",
        )?;
        let rows = stmt.query_map([], |row| {
            let key: String = row.get(0)?;
            let raw = row_to_raw_config_offset(row, 1)?;
            Ok((key, raw))
        })?;
        let raws: Vec<(String, RawConfig)> = rows.collect::<rusqlite::Result<_>>()?;
        raws.into_iter()
            .map(|(key, raw)| decode_config(SourceKey::new(key), raw))
            .collect()
    }

    fn get_source_health(&self, key: &SourceKey) -> error::Result<SourceHealth> {
        let conn = self.lock_conn()?;
        let raw: Option<(u32, u32, Option<String>, Option<String>, i64)> = conn
            .query_row(
                "SELECT consecutive_failures, consecutive_low_confidence, last_status, \
                     last_run_at, version \
                 FROM source_health WHERE source = ?1",
                params![key.as_str()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((failures, low_confidence, last_status, last_run_at, version)) = raw else {
            return Ok(SourceHealth::new(key.clone()));
        };
        let last_status = match last_status {
            None => None,
            Some(s) => Some(RunStatus::parse(&s).ok_or(StateError::Decode {
                field: "last_status",
                value: s,
            })?),
        };
        let last_run_at = match last_run_at {
            None => None,
            Some(s) => Some(parse_ts("last_run_at", &s)?),
        };
        Ok(SourceHealth {
            key: key.clone(),
            consecutive_failures: failures,
            consecutive_low_confidence: low_confidence,
            last_status,
            last_run_at,
            version,
        })
    }

    fn put_source_health(&self, health: &SourceHealth) -> error::Result<()> {
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "INSERT INTO source_health (source, consecutive_failures, \
                 consecutive_low_confidence, last_status, last_run_at, version) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6 + 1) \
             ON CONFLICT(source) DO UPDATE SET \
                 consecutive_failures = excluded.consecutive_failures, \
                 consecutive_low_confidence = excluded.consecutive_low_confidence, \
                 last_status = excluded.last_status, \
                 last_run_at = excluded.last_run_at, \
                 version = excluded.version \
             WHERE source_health.version = ?6",
            params![
                health.key.as_str(),
                health.consecutive_failures,
                health.consecutive_low_confidence,
                health.last_status.map(|s| s.as_str()),
                health.last_run_at.map(fmt_ts),
                health.version
            ],
        )?;
        if updated == 0 {
            return Err(StateError::VersionConflict {
                source_key: health.key.as_str().to_string(),
                expected: health.version,
            });
        }
        Ok(())
    }
}

struct RawConfig {
    adapter: String,
    enabled: bool,
    safe_mode: bool,
    disabled_at: Option<String>,
    disabled_reason: Option<String>,
    retry_after: Option<String>,
    expected_min_jobs: Option<u64>,
    expected_max_jobs: Option<u64>,
    max_requests: u64,
    max_runtime_secs: u64,
    max_bytes: u64,
    fetch_details: bool,
    pacing_ms: u64,
}

fn row_to_raw_config(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawConfig> {
    row_to_raw_config_offset(row, 0)
}

fn row_to_raw_config_offset(row: &rusqlite::Row<'_>, base: usize) -> rusqlite::Result<RawConfig> {
    Ok(RawConfig {
        adapter: row.get(base)?,
        enabled: row.get(base + 1)?,
        safe_mode: row.get(base + 2)?,
        disabled_at: row.get(base + 3)?,
        disabled_reason: row.get(base + 4)?,
        retry_after: row.get(base + 5)?,
        expected_min_jobs: row.get(base + 6)?,
        expected_max_jobs: row.get(base + 7)?,
        max_requests: row.get(base + 8)?,
        max_runtime_secs: row.get(base + 9)?,
        max_bytes: row.get(base + 10)?,
        fetch_details: row.get(base + 11)?,
        pacing_ms: row.get(base + 12)?,
    })
}

fn decode_config(key: SourceKey, raw: RawConfig) -> error::Result<SourceConfig> {
    use trawler_types::source::DisableReason;

    let disabled_reason = match raw.disabled_reason {
        None => None,
        Some(s) => Some(DisableReason::parse(&s).ok_or(StateError::Decode {
            field: "disabled_reason",
            value: s,
        })?),
    };
    let disabled_at = match raw.disabled_at {
        None => None,
        Some(s) => Some(parse_ts("disabled_at", &s)?),
    };
    let retry_after = match raw.retry_after {
        None => None,
        Some(s) => Some(parse_ts("retry_after", &s)?),
    };
    Ok(SourceConfig {
        key,
        adapter: raw.adapter,
        enabled: raw.enabled,
        safe_mode: raw.safe_mode,
        disabled_at,
        disabled_reason,
        retry_after,
        expected_jobs: raw.expected_min_jobs.map(|min| JobCountBounds {
            min,
            max: raw.expected_max_jobs,
        }),
        budget: RunBudget {
            max_requests: raw.max_requests,
            max_runtime_secs: raw.max_runtime_secs,
            max_bytes: raw.max_bytes,
        },
        fetch_details: raw.fetch_details,
        pacing_ms: raw.pacing_ms,
    })
}

#[cfg(test)]
impl SqliteStateBackend {
    /// Raw status string for a run, bypassing the model layer.
    pub(crate) fn raw_run_status(&self, run_id: RunId) -> String {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT status FROM runs WHERE id = ?1",
            params![run_id],
            |row| row.get(0),
        )
        .unwrap()
    }

    pub(crate) fn lock_count(&self) -> i64 {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM source_locks", [], |row| row.get(0))
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeDelta;
    use trawler_types::checkpoint::CheckpointPayload;
    use trawler_types::item::JobItem;
    use trawler_types::run::StageTimings;
    use trawler_types::stats::HttpStats;

    use super::*;

    fn backend() -> SqliteStateBackend {
        SqliteStateBackend::in_memory().unwrap()
    }

    fn outcome(status: RunStatus, score: Option<f64>) -> RunOutcome {
        RunOutcome {
            status,
            finished_at: Utc::now(),
            confidence_score: score,
            counts: RunCounts {
                fetched: 10,
                processed: 9,
                new: 3,
                marked_inactive: 1,
                skipped: 1,
            },
            http_stats: HttpStats::default(),
            stage_timings: StageTimings::default(),
            error_message: None,
        }
    }

    // -- runs ---------------------------------------------------------------

    #[test]
    fn run_lifecycle_round_trips() {
        let backend = backend();
        let source = SourceKey::new("acme_jobs");
        let run_id = backend.create_run(&source, Utc::now()).unwrap();

        let record = backend.get_run(run_id).unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Running);
        assert_eq!(record.current_stage, Some(Stage::Init));
        assert_eq!(record.source, source);
        assert!(record.finished_at.is_none());

        backend.update_run_stage(run_id, Stage::FetchList).unwrap();
        let record = backend.get_run(run_id).unwrap().unwrap();
        assert_eq!(record.current_stage, Some(Stage::FetchList));

        backend
            .finish_run(run_id, &outcome(RunStatus::Success, Some(0.93)))
            .unwrap();
        let record = backend.get_run(run_id).unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Success);
        assert_eq!(record.confidence_score, Some(0.93));
        assert_eq!(record.counts.new, 3);
        assert!(record.finished_at.is_some());
    }

    #[test]
    fn terminal_status_is_absorbing() {
        let backend = backend();
        let run_id = backend
            .create_run(&SourceKey::new("acme_jobs"), Utc::now())
            .unwrap();
        backend
            .finish_run(run_id, &outcome(RunStatus::Success, Some(0.9)))
            .unwrap();

        let second = backend.finish_run(
            run_id,
            &outcome(RunStatus::Failed(FailureKind::Blocked), Some(0.1)),
        );
        assert!(matches!(second, Err(StateError::RunFinalized(id)) if id == run_id));

        // The first write survives.
        assert_eq!(backend.raw_run_status(run_id), "success");
    }

    #[test]
    fn finished_run_rejects_stage_and_checkpoint_writes() {
        let backend = backend();
        let run_id = backend
            .create_run(&SourceKey::new("acme_jobs"), Utc::now())
            .unwrap();
        backend
            .finish_run(run_id, &outcome(RunStatus::PartialSuccess, Some(0.6)))
            .unwrap();

        assert!(matches!(
            backend.update_run_stage(run_id, Stage::Finalize),
            Err(StateError::RunFinalized(_))
        ));
        let checkpoint = RunCheckpoint::new(Stage::ParseList, CheckpointPayload::default());
        assert!(matches!(
            backend.put_checkpoint(run_id, &checkpoint),
            Err(StateError::RunFinalized(_))
        ));
    }

    #[test]
    fn missing_run_is_distinguished() {
        let backend = backend();
        assert!(matches!(
            backend.finish_run(999, &outcome(RunStatus::Success, None)),
            Err(StateError::RunMissing(999))
        ));
        assert!(backend.get_run(999).unwrap().is_none());
    }

    #[test]
    fn failure_status_round_trips_through_text() {
        let backend = backend();
        let run_id = backend
            .create_run(&SourceKey::new("acme_jobs"), Utc::now())
            .unwrap();
        backend
            .finish_run(
                run_id,
                &outcome(RunStatus::Failed(FailureKind::RateLimited), Some(0.2)),
            )
            .unwrap();

        assert_eq!(backend.raw_run_status(run_id), "rate_limited");
        let record = backend.get_run(run_id).unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Failed(FailureKind::RateLimited));
    }

    #[test]
    fn latest_unfinished_run_ignores_terminal_runs() {
        let backend = backend();
        let source = SourceKey::new("acme_jobs");

        let first = backend.create_run(&source, Utc::now()).unwrap();
        backend
            .finish_run(first, &outcome(RunStatus::Success, Some(0.9)))
            .unwrap();
        assert!(backend.latest_unfinished_run(&source).unwrap().is_none());

        let second = backend.create_run(&source, Utc::now()).unwrap();
        let adopted = backend.latest_unfinished_run(&source).unwrap().unwrap();
        assert_eq!(adopted.id, second);

        // Other sources do not leak in.
        assert!(backend
            .latest_unfinished_run(&SourceKey::new("other"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn recent_runs_orders_and_limits() {
        let backend = backend();
        let a = SourceKey::new("a");
        let b = SourceKey::new("b");
        for _ in 0..3 {
            let id = backend.create_run(&a, Utc::now()).unwrap();
            backend
                .finish_run(id, &outcome(RunStatus::Success, Some(0.9)))
                .unwrap();
        }
        let id = backend.create_run(&b, Utc::now()).unwrap();
        backend
            .finish_run(id, &outcome(RunStatus::Success, Some(0.9)))
            .unwrap();

        let all = backend.recent_runs(None, 10).unwrap();
        assert_eq!(all.len(), 4);
        assert!(all.windows(2).all(|w| w[0].id > w[1].id));

        let only_a = backend.recent_runs(Some(&a), 2).unwrap();
        assert_eq!(only_a.len(), 2);
        assert!(only_a.iter().all(|r| r.source == a));
    }

    #[test]
    fn sweep_fails_only_stale_unfinished_runs() {
        let backend = backend();
        let source = SourceKey::new("acme_jobs");
        let now = Utc::now();

        let stale = backend
            .create_run(&source, now - TimeDelta::hours(3))
            .unwrap();
        let fresh = backend.create_run(&source, now).unwrap();

        let failed = backend
            .fail_abandoned_runs(now - TimeDelta::hours(1), now)
            .unwrap();
        assert_eq!(failed, 1);
        assert_eq!(backend.raw_run_status(stale), "dependency_error");
        assert_eq!(backend.raw_run_status(fresh), "running");
    }

    // -- checkpoints --------------------------------------------------------

    #[test]
    fn checkpoint_overwrites_in_place() {
        let backend = backend();
        let run_id = backend
            .create_run(&SourceKey::new("acme_jobs"), Utc::now())
            .unwrap();
        assert!(backend.get_checkpoint(run_id).unwrap().is_none());

        let first = RunCheckpoint::new(
            Stage::ParseList,
            CheckpointPayload {
                items: vec![JobItem::new("j1", "Engineer", "https://x/j1")],
                ..CheckpointPayload::default()
            },
        );
        backend.put_checkpoint(run_id, &first).unwrap();

        let second = RunCheckpoint::new(
            Stage::FetchDetails,
            CheckpointPayload {
                items: vec![JobItem::new("j1", "Engineer", "https://x/j1")],
                details_done: 50,
                ..CheckpointPayload::default()
            },
        );
        backend.put_checkpoint(run_id, &second).unwrap();

        let loaded = backend.get_checkpoint(run_id).unwrap().unwrap();
        assert_eq!(loaded.stage, Stage::FetchDetails);
        assert_eq!(loaded.payload.details_done, 50);
    }

    #[test]
    fn checkpoint_for_unknown_run_is_none() {
        let backend = backend();
        assert!(backend.get_checkpoint(42).unwrap().is_none());
    }

    // -- locks --------------------------------------------------------------

    #[test]
    fn lock_acquire_then_contend() {
        let backend = backend();
        let source = SourceKey::new("acme_jobs");
        let now = Utc::now();
        let expires = now + TimeDelta::minutes(30);

        assert!(backend
            .try_acquire_lock(&source, &HolderId::new("h1"), now, expires)
            .unwrap());
        assert!(!backend
            .try_acquire_lock(&source, &HolderId::new("h2"), now, expires)
            .unwrap());

        let lock = backend.get_lock(&source).unwrap().unwrap();
        assert_eq!(lock.holder, HolderId::new("h1"));
    }

    #[test]
    fn expired_lock_can_be_stolen_and_old_release_is_noop() {
        let backend = backend();
        let source = SourceKey::new("acme_jobs");
        let now = Utc::now();

        // Held lease that expired a minute ago.
        assert!(backend
            .try_acquire_lock(
                &source,
                &HolderId::new("old"),
                now - TimeDelta::minutes(31),
                now - TimeDelta::minutes(1),
            )
            .unwrap());

        assert!(backend
            .try_acquire_lock(
                &source,
                &HolderId::new("new"),
                now,
                now + TimeDelta::minutes(30),
            )
            .unwrap());

        // The previous holder's release must not disturb the new lease.
        assert!(!backend
            .release_lock(&source, &HolderId::new("old"))
            .unwrap());
        let lock = backend.get_lock(&source).unwrap().unwrap();
        assert_eq!(lock.holder, HolderId::new("new"));

        assert!(backend
            .release_lock(&source, &HolderId::new("new"))
            .unwrap());
        assert!(backend.get_lock(&source).unwrap().is_none());
    }

    #[test]
    fn release_is_idempotent() {
        let backend = backend();
        let source = SourceKey::new("acme_jobs");
        let holder = HolderId::new("h1");
        let now = Utc::now();

        backend
            .try_acquire_lock(&source, &holder, now, now + TimeDelta::minutes(30))
            .unwrap();
        assert!(backend.release_lock(&source, &holder).unwrap());
        assert!(!backend.release_lock(&source, &holder).unwrap());
    }

    #[test]
    fn lock_acquisition_is_exclusive_under_contention() {
        let backend = Arc::new(backend());
        let source = SourceKey::new("contended");
        let now = Utc::now();
        let expires = now + TimeDelta::minutes(30);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let backend = Arc::clone(&backend);
                let source = source.clone();
                std::thread::spawn(move || {
                    let holder = HolderId::new(format!("h{i}"));
                    backend
                        .try_acquire_lock(&source, &holder, now, expires)
                        .unwrap()
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(backend.lock_count(), 1);
    }

    #[test]
    fn expired_lock_sweep_leaves_live_leases() {
        let backend = backend();
        let now = Utc::now();
        backend
            .try_acquire_lock(
                &SourceKey::new("dead"),
                &HolderId::new("h1"),
                now - TimeDelta::hours(1),
                now - TimeDelta::minutes(30),
            )
            .unwrap();
        backend
            .try_acquire_lock(
                &SourceKey::new("live"),
                &HolderId::new("h2"),
                now,
                now + TimeDelta::minutes(30),
            )
            .unwrap();

        assert_eq!(backend.delete_expired_locks(now).unwrap(), 1);
        assert!(backend.get_lock(&SourceKey::new("dead")).unwrap().is_none());
        assert!(backend.get_lock(&SourceKey::new("live")).unwrap().is_some());
    }

    // -- source config and health -------------------------------------------

    #[test]
    fn source_config_upserts_and_lists() {
        let backend = backend();
        let key = SourceKey::new("acme_jobs");
        assert!(backend.get_source_config(&key).unwrap().is_none());

        let mut config = SourceConfig::new(key.clone());
        config.adapter = "greenhouse".to_string();
        config.expected_jobs = Some(JobCountBounds {
            min: 40,
            max: Some(3_000),
        });
        config.pacing_ms = 250;
        backend.put_source_config(&config, Utc::now()).unwrap();

        let loaded = backend.get_source_config(&key).unwrap().unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.adapter, "greenhouse");

        config.safe_mode = true;
        config.budget.max_requests = 50;
        backend.put_source_config(&config, Utc::now()).unwrap();
        let loaded = backend.get_source_config(&key).unwrap().unwrap();
        assert!(loaded.safe_mode);
        assert_eq!(loaded.budget.max_requests, 50);

        backend
            .put_source_config(&SourceConfig::new(SourceKey::new("beta")), Utc::now())
            .unwrap();
        let all = backend.list_source_configs().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].key, SourceKey::new("acme_jobs"));
        assert_eq!(all[1].key, SourceKey::new("beta"));
    }

    #[test]
    fn disabled_config_round_trips_kill_switch_fields() {
        let backend = backend();
        let key = SourceKey::new("acme_jobs");
        let now = Utc::now();

        let mut config = SourceConfig::new(key.clone());
        config.enabled = false;
        config.disabled_at = Some(now);
        config.disabled_reason = Some(trawler_types::source::DisableReason::LowConfidence);
        backend.put_source_config(&config, now).unwrap();

        let loaded = backend.get_source_config(&key).unwrap().unwrap();
        assert!(!loaded.enabled);
        assert_eq!(
            loaded.disabled_reason,
            Some(trawler_types::source::DisableReason::LowConfidence)
        );
        assert!(loaded.retry_after.is_none());
    }

    #[test]
    fn health_defaults_then_versions_advance() {
        let backend = backend();
        let key = SourceKey::new("acme_jobs");

        let health = backend.get_source_health(&key).unwrap();
        assert_eq!(health.version, 0);
        assert_eq!(health.consecutive_failures, 0);

        let mut health = health;
        health.consecutive_failures = 1;
        health.last_status = Some(RunStatus::Failed(FailureKind::Blocked));
        health.last_run_at = Some(Utc::now());
        backend.put_source_health(&health).unwrap();

        let loaded = backend.get_source_health(&key).unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.consecutive_failures, 1);
        assert_eq!(loaded.last_status, Some(RunStatus::Failed(FailureKind::Blocked)));
    }

    #[test]
    fn stale_health_write_is_rejected() {
        let backend = backend();
        let key = SourceKey::new("acme_jobs");

        let fresh = backend.get_source_health(&key).unwrap();
        backend.put_source_health(&fresh).unwrap();

        // A writer still holding version 0 loses.
        let stale = fresh;
        assert!(matches!(
            backend.put_source_health(&stale),
            Err(StateError::VersionConflict { expected: 0, .. })
        ));
    }

    // -- timestamps ---------------------------------------------------------

    #[test]
    fn timestamps_are_fixed_width_and_ordered() {
        let earlier = Utc::now();
        let later = earlier + TimeDelta::milliseconds(1);

        let a = fmt_ts(earlier);
        let b = fmt_ts(later);
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert!(a.ends_with('Z'));
    }

    #[test]
    fn timestamp_round_trip_preserves_milliseconds() {
        let now = Utc::now();
        let parsed = parse_ts("t", &fmt_ts(now)).unwrap();
        assert_eq!(parsed.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn bad_timestamp_is_a_decode_error() {
        assert!(matches!(
            parse_ts("started_at", "last tuesday"),
            Err(StateError::Decode {
                field: "started_at",
                ..
            })
        ));
    }
}
