//! Filesystem fixture adapter.
//!
//! Serves listings and details from a local directory tree so a full run
//! can be exercised without any out-of-tree HTTP adapter:
//!
//! ```text
//! fixtures/
//!   <source key>/
//!     listing.json       JSON array of job items (one page)
//!     details/
//!       <job id>.txt     detail text per item
//! ```
//!
//! The adapter speaks the engine's HTTP-shaped symptom vocabulary: a
//! served file reports a 200 response, a missing one a 404, and malformed
//! JSON a failed parse. Set `TRAWLER_FIXTURE_DIR` to relocate the tree.

use std::path::PathBuf;
use std::time::Instant;

use trawler_engine::adapter::{
    AdapterResult, DetailPage, FetchContext, ListingPage, SourceAdapter,
};
use trawler_types::failure::SymptomBundle;
use trawler_types::item::JobItem;
use trawler_types::stats::HttpStats;

pub const FIXTURE_DIR_ENV: &str = "TRAWLER_FIXTURE_DIR";
pub const DEFAULT_FIXTURE_DIR: &str = "fixtures";

pub struct FixtureAdapter {
    root: PathBuf,
}

impl FixtureAdapter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_env() -> Self {
        let root = std::env::var(FIXTURE_DIR_ENV)
            .unwrap_or_else(|_| DEFAULT_FIXTURE_DIR.to_string());
        Self::new(root)
    }

    fn read(&self, ctx: &FetchContext, relative: &str) -> Result<(String, HttpStats), SymptomBundle> {
        let path = self.root.join(ctx.source.as_str()).join(relative);
        let started = Instant::now();
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let mut stats = HttpStats::default();
                stats.record_response(200, text.len() as u64, elapsed_ms(started));
                Ok((text, stats))
            }
            Err(err) => {
                let mut stats = HttpStats::default();
                stats.record_response(404, 0, elapsed_ms(started));
                Err(SymptomBundle::from_status(404)
                    .with_detail(format!("no fixture at {}: {err}", path.display()))
                    .with_stats(stats))
            }
        }
    }
}

impl SourceAdapter for FixtureAdapter {
    fn fetch_listing_page(
        &self,
        ctx: &FetchContext,
        _cursor: Option<&str>,
    ) -> AdapterResult<ListingPage> {
        let (text, stats) = self.read(ctx, "listing.json")?;
        match serde_json::from_str::<Vec<JobItem>>(&text) {
            Ok(mut items) => {
                // Details are served from the same tree; point each item at
                // its file so the driver fetches them.
                for item in &mut items {
                    if item.detail_url.is_none() {
                        item.detail_url = Some(format!("details/{}.txt", item.id));
                    }
                }
                Ok(ListingPage {
                    items,
                    next_cursor: None,
                    stats,
                })
            }
            Err(err) => {
                let mut bundle = SymptomBundle::parse_failed(format!("invalid listing JSON: {err}"))
                    .with_stats(stats);
                bundle.http_status = Some(200);
                bundle.body_bytes = text.len() as u64;
                Err(bundle)
            }
        }
    }

    fn fetch_detail(&self, ctx: &FetchContext, item: &JobItem) -> AdapterResult<DetailPage> {
        let relative = format!("details/{}.txt", item.id);
        let (text, stats) = self.read(ctx, &relative)?;
        Ok(DetailPage { text, stats })
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
