//! The fetch/parse adapter contract.
//!
//! Per-source mechanics (HTTP, selectors, pagination rules) live outside
//! the engine. An adapter fetches and extracts; it never classifies
//! failures and never touches stores. On failure it returns the raw
//! [`SymptomBundle`] and the engine decides what the symptoms mean.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use trawler_types::failure::SymptomBundle;
use trawler_types::ids::SourceKey;
use trawler_types::item::JobItem;
use trawler_types::stats::HttpStats;

/// What one adapter call may assume about its attempt.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub source: SourceKey,
    /// 1-based attempt number within the current stage call.
    pub attempt: u32,
    /// The previous attempt hit a block or egress fault; the adapter
    /// should switch route before this one.
    pub rotate_route: bool,
    /// Per-request time ceiling for this attempt.
    pub timeout: Duration,
    pub safe_mode: bool,
}

/// One listing page: extracted items plus what fetching it cost.
#[derive(Debug, Clone)]
pub struct ListingPage {
    pub items: Vec<JobItem>,
    /// Opaque cursor for the next page; `None` ends pagination.
    pub next_cursor: Option<String>,
    pub stats: HttpStats,
}

/// One item's detail document.
#[derive(Debug, Clone)]
pub struct DetailPage {
    pub text: String,
    pub stats: HttpStats,
}

/// Stage call outcome. The error side carries symptoms, not a judgment;
/// failed calls must still report their request stats so budgets and
/// rates see them.
pub type AdapterResult<T> = Result<T, SymptomBundle>;

/// Fetch and extraction mechanics for one source family.
///
/// Calls are synchronous and driven from blocking worker tasks; an
/// implementation may block on its own HTTP client freely.
pub trait SourceAdapter: Send + Sync {
    /// Fetch and extract one listing page. `cursor` is `None` for the
    /// first page and the previous page's `next_cursor` afterwards.
    fn fetch_listing_page(
        &self,
        ctx: &FetchContext,
        cursor: Option<&str>,
    ) -> AdapterResult<ListingPage>;

    /// Fetch one item's detail document.
    fn fetch_detail(&self, ctx: &FetchContext, item: &JobItem) -> AdapterResult<DetailPage>;
}

/// Registry mapping adapter names (as referenced by source configs) to
/// implementations.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(name.into(), adapter);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(name).cloned()
    }

    /// Registered adapter names, sorted for stable output.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}
