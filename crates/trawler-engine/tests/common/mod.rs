//! Shared harness for engine integration tests: a scriptable adapter,
//! in-memory gateways, and a collecting notification sink wired into an
//! orchestrator over an in-memory SQLite backend.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use trawler_engine::adapter::{
    AdapterRegistry, DetailPage, FetchContext, ListingPage, SourceAdapter,
};
use trawler_engine::gateway::{
    BlobStore, GatewayError, GatewayResult, JobStore, NotificationSink, UpsertOutcome,
};
use trawler_engine::{EngineOptions, Orchestrator};
use trawler_state::backend::StateBackend;
use trawler_state::sqlite::SqliteStateBackend;
use trawler_types::failure::SymptomBundle;
use trawler_types::ids::SourceKey;
use trawler_types::item::{DetailRef, JobItem};
use trawler_types::run::RunRecord;
use trawler_types::source::{DisableReason, SourceConfig};
use trawler_types::stats::HttpStats;

// ---------------------------------------------------------------------------
// Scripted adapter
// ---------------------------------------------------------------------------

/// Adapter whose listing responses are a scripted queue; each call pops
/// the next entry. Detail fetches succeed with synthesized text unless
/// told to fail.
#[derive(Default)]
pub struct ScriptedAdapter {
    listing: Mutex<VecDeque<Result<ListingPage, SymptomBundle>>>,
    pub listing_contexts: Mutex<Vec<FetchContext>>,
    pub detail_calls: AtomicU64,
    pub fail_details: AtomicBool,
}

impl ScriptedAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, entry: Result<ListingPage, SymptomBundle>) {
        self.listing.lock().unwrap().push_back(entry);
    }

    pub fn push_page(&self, ids: &[&str], next_cursor: Option<&str>) {
        self.push(Ok(listing_page(ids, next_cursor)));
    }

    pub fn push_failure(&self, bundle: SymptomBundle) {
        self.push(Err(bundle));
    }

    pub fn listing_calls(&self) -> usize {
        self.listing_contexts.lock().unwrap().len()
    }
}

impl SourceAdapter for ScriptedAdapter {
    fn fetch_listing_page(
        &self,
        ctx: &FetchContext,
        _cursor: Option<&str>,
    ) -> Result<ListingPage, SymptomBundle> {
        self.listing_contexts.lock().unwrap().push(ctx.clone());
        self.listing
            .lock()
            .unwrap()
            .pop_front()
            .expect("scripted adapter ran out of listing entries")
    }

    fn fetch_detail(
        &self,
        _ctx: &FetchContext,
        item: &JobItem,
    ) -> Result<DetailPage, SymptomBundle> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_details.load(Ordering::SeqCst) {
            let mut stats = HttpStats::default();
            stats.record_response(500, 120, 40);
            return Err(SymptomBundle::from_status(500).with_stats(stats));
        }
        let mut stats = HttpStats::default();
        stats.record_response(200, 2_048, 35);
        Ok(DetailPage {
            text: format!("detail body for {}", item.id),
            stats,
        })
    }
}

/// A listing page of well-formed items, one 200 response worth of stats.
pub fn listing_page(ids: &[&str], next_cursor: Option<&str>) -> ListingPage {
    let items = ids.iter().map(|id| job_item(id)).collect();
    let mut stats = HttpStats::default();
    stats.record_response(200, 8_192, 60);
    ListingPage {
        items,
        next_cursor: next_cursor.map(String::from),
        stats,
    }
}

pub fn job_item(id: &str) -> JobItem {
    let mut item = JobItem::new(id, format!("Job {id}"), format!("https://jobs.example/{id}"));
    item.detail_url = Some(format!("https://jobs.example/{id}/detail"));
    item
}

/// An item that fails listing validation (blank title).
pub fn invalid_item(id: &str) -> JobItem {
    JobItem::new(id, "  ", format!("https://jobs.example/{id}"))
}

/// Failure bundle for an HTTP status, with the request counted.
pub fn status_failure(status: u16) -> SymptomBundle {
    let mut stats = HttpStats::default();
    stats.record_response(status, 512, 45);
    SymptomBundle::from_status(status).with_stats(stats)
}

// ---------------------------------------------------------------------------
// In-memory gateways
// ---------------------------------------------------------------------------

/// Idempotent in-memory job inventory keyed by `source:id`.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, bool>>,
    pub upsert_calls: AtomicU64,
    pub aggregate_calls: AtomicU64,
    pub fail_next_upsert: AtomicBool,
}

impl MemoryJobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_active(&self, source: &str, id: &str) {
        self.jobs
            .lock()
            .unwrap()
            .insert(format!("{source}:{id}"), true);
    }

    pub fn total(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn active_count(&self, source: &str) -> usize {
        let prefix = format!("{source}:");
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, active)| k.starts_with(&prefix) && **active)
            .count()
    }

    pub fn is_active(&self, source: &str, id: &str) -> Option<bool> {
        self.jobs
            .lock()
            .unwrap()
            .get(&format!("{source}:{id}"))
            .copied()
    }
}

impl JobStore for MemoryJobStore {
    fn upsert_jobs(&self, source: &SourceKey, items: &[JobItem]) -> GatewayResult<UpsertOutcome> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_upsert.swap(false, Ordering::SeqCst) {
            return Err(GatewayError::new("injected upsert failure"));
        }
        let mut jobs = self.jobs.lock().unwrap();
        let mut outcome = UpsertOutcome::default();
        for item in items {
            if jobs.insert(format!("{source}:{}", item.id), true).is_some() {
                outcome.updated += 1;
            } else {
                outcome.created += 1;
            }
        }
        Ok(outcome)
    }

    fn mark_inactive(
        &self,
        source: &SourceKey,
        seen_ids: &[String],
        _as_of: DateTime<Utc>,
    ) -> GatewayResult<u64> {
        let seen: HashSet<&str> = seen_ids.iter().map(String::as_str).collect();
        let prefix = format!("{source}:");
        let mut flipped = 0;
        for (key, active) in self.jobs.lock().unwrap().iter_mut() {
            if let Some(id) = key.strip_prefix(&prefix) {
                if *active && !seen.contains(id) {
                    *active = false;
                    flipped += 1;
                }
            }
        }
        Ok(flipped)
    }

    fn update_aggregates(&self, _source: &SourceKey) -> GatewayResult<()> {
        self.aggregate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, String>>,
    pub fail_writes: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    pub fn contains(&self, source: &str, job_id: &str) -> bool {
        self.blobs
            .lock()
            .unwrap()
            .contains_key(&format!("{source}:{job_id}"))
    }
}

impl BlobStore for MemoryBlobStore {
    fn store_detail(
        &self,
        source: &SourceKey,
        job_id: &str,
        text: &str,
    ) -> GatewayResult<DetailRef> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(GatewayError::new("blob volume unavailable"));
        }
        self.blobs
            .lock()
            .unwrap()
            .insert(format!("{source}:{job_id}"), text.to_string());
        Ok(DetailRef::new(format!("mem://{source}/{job_id}")))
    }
}

// ---------------------------------------------------------------------------
// Notification sink
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum SinkEvent {
    RunFinished { source: String, status: String },
    Disabled { source: String, reason: DisableReason },
    Reenabled { source: String },
}

#[derive(Default)]
pub struct CollectingSink {
    pub events: Mutex<Vec<SinkEvent>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn disabled_events(&self) -> Vec<(String, DisableReason)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Disabled { source, reason } => Some((source.clone(), *reason)),
                _ => None,
            })
            .collect()
    }

    pub fn reenabled_sources(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Reenabled { source } => Some(source.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn finished_count(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| matches!(event, SinkEvent::RunFinished { .. }))
            .count()
    }
}

impl NotificationSink for CollectingSink {
    fn run_finished(&self, record: &RunRecord) {
        self.events.lock().unwrap().push(SinkEvent::RunFinished {
            source: record.source.to_string(),
            status: record.status.to_string(),
        });
    }

    fn source_disabled(
        &self,
        source: &SourceKey,
        reason: DisableReason,
        _retry_after: Option<DateTime<Utc>>,
    ) {
        self.events.lock().unwrap().push(SinkEvent::Disabled {
            source: source.to_string(),
            reason,
        });
    }

    fn source_reenabled(&self, source: &SourceKey) {
        self.events.lock().unwrap().push(SinkEvent::Reenabled {
            source: source.to_string(),
        });
    }
}

// ---------------------------------------------------------------------------
// Rig
// ---------------------------------------------------------------------------

pub const ADAPTER_NAME: &str = "scripted";

pub struct TestRig {
    pub state: Arc<dyn StateBackend>,
    pub adapter: Arc<ScriptedAdapter>,
    pub jobs: Arc<MemoryJobStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub sink: Arc<CollectingSink>,
    pub orchestrator: Orchestrator,
}

impl TestRig {
    pub fn health_of(&self, key: &str) -> trawler_types::source::SourceHealth {
        self.state
            .get_source_health(&SourceKey::new(key))
            .expect("health readable")
    }

    pub fn config_of(&self, key: &str) -> SourceConfig {
        self.state
            .get_source_config(&SourceKey::new(key))
            .expect("config readable")
            .expect("config seeded")
    }

    pub fn runs_of(&self, key: &str) -> Vec<RunRecord> {
        self.state
            .recent_runs(Some(&SourceKey::new(key)), 50)
            .expect("runs readable")
    }
}

/// A config bound to the scripted adapter, details on, no pacing.
pub fn scripted_config(key: &str) -> SourceConfig {
    let mut config = SourceConfig::new(SourceKey::new(key));
    config.adapter = ADAPTER_NAME.to_string();
    config
}

pub fn rig(configs: Vec<SourceConfig>, options: EngineOptions) -> TestRig {
    let state: Arc<dyn StateBackend> =
        Arc::new(SqliteStateBackend::in_memory().expect("in-memory state"));
    let now = Utc::now();
    for config in &configs {
        state.put_source_config(config, now).expect("seed config");
    }

    let adapter = ScriptedAdapter::new();
    let mut registry = AdapterRegistry::new();
    registry.register(ADAPTER_NAME, Arc::clone(&adapter) as Arc<dyn SourceAdapter>);

    let jobs = MemoryJobStore::new();
    let blobs = MemoryBlobStore::new();
    let sink = CollectingSink::new();
    let orchestrator = Orchestrator::new(
        Arc::clone(&state),
        registry,
        Arc::clone(&jobs) as Arc<dyn JobStore>,
        Arc::clone(&blobs) as Arc<dyn BlobStore>,
        Arc::clone(&sink) as Arc<dyn NotificationSink>,
        options,
    );

    TestRig {
        state,
        adapter,
        jobs,
        blobs,
        sink,
        orchestrator,
    }
}

pub fn single_source_rig(key: &str) -> TestRig {
    rig(vec![scripted_config(key)], EngineOptions::default())
}
