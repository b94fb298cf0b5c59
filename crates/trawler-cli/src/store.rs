//! Self-contained inventory and blob store implementations.
//!
//! Production deployments put the job inventory behind a warehouse and
//! detail text in object storage; the binary ships local equivalents so
//! `trawler run` works end to end. The inventory is a SQLite file, the
//! blob store a plain directory of text files.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};

use trawler_engine::gateway::{
    BlobStore, GatewayError, GatewayResult, JobStore, UpsertOutcome,
};
use trawler_types::ids::SourceKey;
use trawler_types::item::{DetailRef, JobItem};

const INVENTORY_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS jobs (
    source        TEXT NOT NULL,
    job_id        TEXT NOT NULL,
    title         TEXT NOT NULL,
    url           TEXT NOT NULL,
    company       TEXT,
    location      TEXT,
    posted_at     TEXT,
    detail_ref    TEXT,
    active        INTEGER NOT NULL DEFAULT 1,
    first_seen_at TEXT NOT NULL,
    last_seen_at  TEXT NOT NULL,
    inactive_at   TEXT,
    PRIMARY KEY (source, job_id)
);

CREATE INDEX IF NOT EXISTS idx_jobs_source_active ON jobs (source, active);

CREATE TABLE IF NOT EXISTS source_aggregates (
    source       TEXT PRIMARY KEY,
    active_jobs  INTEGER NOT NULL,
    total_jobs   INTEGER NOT NULL,
    refreshed_at TEXT NOT NULL
);
";

/// SQLite-backed job inventory.
pub struct SqliteInventory {
    conn: Mutex<Connection>,
}

impl SqliteInventory {
    /// Open (and initialize) an inventory file, creating parent
    /// directories as needed.
    pub fn open(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(gateway_err)?;
            }
        }
        let conn = Connection::open(path).map_err(gateway_err)?;
        conn.execute_batch(INVENTORY_TABLES).map_err(gateway_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    fn in_memory() -> Self {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(INVENTORY_TABLES).unwrap();
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn lock_conn(&self) -> GatewayResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| GatewayError::new("inventory connection poisoned"))
    }
}

impl JobStore for SqliteInventory {
    fn upsert_jobs(&self, source: &SourceKey, items: &[JobItem]) -> GatewayResult<UpsertOutcome> {
        let mut conn = self.lock_conn()?;
        upsert_tx(&mut conn, source, items).map_err(gateway_err)
    }

    fn mark_inactive(
        &self,
        source: &SourceKey,
        seen_ids: &[String],
        as_of: DateTime<Utc>,
    ) -> GatewayResult<u64> {
        let mut conn = self.lock_conn()?;
        mark_inactive_tx(&mut conn, source, seen_ids, as_of).map_err(gateway_err)
    }

    fn update_aggregates(&self, source: &SourceKey) -> GatewayResult<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO source_aggregates (source, active_jobs, total_jobs, refreshed_at) \
             SELECT ?1, COUNT(*) FILTER (WHERE active = 1), COUNT(*), ?2 \
             FROM jobs WHERE source = ?1 \
             ON CONFLICT(source) DO UPDATE SET \
                 active_jobs = excluded.active_jobs, \
                 total_jobs = excluded.total_jobs, \
                 refreshed_at = excluded.refreshed_at",
            params![source.as_str(), fmt_ts(Utc::now())],
        )
        .map_err(gateway_err)?;
        Ok(())
    }
}

fn upsert_tx(
    conn: &mut Connection,
    source: &SourceKey,
    items: &[JobItem],
) -> rusqlite::Result<UpsertOutcome> {
    let tx = conn.transaction()?;
    let now = fmt_ts(Utc::now());
    let mut outcome = UpsertOutcome::default();
    {
        let mut exists = tx.prepare("SELECT 1 FROM jobs WHERE source = ?1 AND job_id = ?2")?;
        // A replayed item must not erase a detail reference stored by an
        // earlier attempt, hence the COALESCE.
        let mut upsert = tx.prepare(
            "INSERT INTO jobs (source, job_id, title, url, company, location, posted_at, \
                 detail_ref, active, first_seen_at, last_seen_at, inactive_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?9, NULL) \
             ON CONFLICT(source, job_id) DO UPDATE SET \
                 title = excluded.title, \
                 url = excluded.url, \
                 company = excluded.company, \
                 location = excluded.location, \
                 posted_at = excluded.posted_at, \
                 detail_ref = COALESCE(excluded.detail_ref, jobs.detail_ref), \
                 active = 1, \
                 last_seen_at = excluded.last_seen_at, \
                 inactive_at = NULL",
        )?;
        for item in items {
            let created = !exists.exists(params![source.as_str(), item.id])?;
            upsert.execute(params![
                source.as_str(),
                item.id,
                item.title,
                item.url,
                item.company,
                item.location,
                item.posted_at.map(fmt_ts),
                item.detail_ref.as_ref().map(DetailRef::as_str),
                now,
            ])?;
            if created {
                outcome.created += 1;
            } else {
                outcome.updated += 1;
            }
        }
    }
    tx.commit()?;
    Ok(outcome)
}

fn mark_inactive_tx(
    conn: &mut Connection,
    source: &SourceKey,
    seen_ids: &[String],
    as_of: DateTime<Utc>,
) -> rusqlite::Result<u64> {
    let seen: HashSet<&str> = seen_ids.iter().map(String::as_str).collect();
    let tx = conn.transaction()?;
    let mut flipped = 0u64;
    {
        let active: Vec<String> = tx
            .prepare("SELECT job_id FROM jobs WHERE source = ?1 AND active = 1")?
            .query_map(params![source.as_str()], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        let mut flip = tx.prepare(
            "UPDATE jobs SET active = 0, inactive_at = ?3 \
             WHERE source = ?1 AND job_id = ?2",
        )?;
        for id in active.iter().filter(|id| !seen.contains(id.as_str())) {
            flipped += flip.execute(params![source.as_str(), id, fmt_ts(as_of)])? as u64;
        }
    }
    tx.commit()?;
    Ok(flipped)
}

/// Directory-backed blob store: one text file per detail document.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl BlobStore for FsBlobStore {
    fn store_detail(
        &self,
        source: &SourceKey,
        job_id: &str,
        text: &str,
    ) -> GatewayResult<DetailRef> {
        let dir = self.root.join(source.as_str());
        std::fs::create_dir_all(&dir).map_err(gateway_err)?;
        let path = dir.join(format!("{}.txt", sanitize(job_id)));
        std::fs::write(&path, text).map_err(gateway_err)?;
        Ok(DetailRef::new(path.to_string_lossy()))
    }
}

/// Source job ids come from outside; flatten anything path-hostile.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn gateway_err(err: impl std::fmt::Display) -> GatewayError {
    GatewayError::new(err.to_string())
}

fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}
