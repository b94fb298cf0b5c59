//! Per-run resource ceilings.
//!
//! The guard is consulted after every request and at stage boundaries. A
//! breach is terminal: no retry, and nothing fetched under the breached
//! budget reaches the inventory.

use std::time::{Duration, Instant};

use trawler_types::source::RunBudget;
use trawler_types::stats::HttpStats;

/// Which ceiling was crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDimension {
    Requests,
    Runtime,
    Bytes,
}

impl BudgetDimension {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requests => "requests",
            Self::Runtime => "runtime",
            Self::Bytes => "bytes",
        }
    }
}

impl std::fmt::Display for BudgetDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A crossed ceiling with the observed and allowed totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetBreach {
    pub dimension: BudgetDimension,
    pub used: u64,
    pub limit: u64,
}

impl BudgetBreach {
    #[must_use]
    pub fn message(&self) -> String {
        format!(
            "{} budget exceeded: {} > {}",
            self.dimension, self.used, self.limit
        )
    }
}

/// Tracks one run's consumption against its configured budget.
pub struct BudgetGuard {
    budget: RunBudget,
    started: Instant,
}

impl BudgetGuard {
    #[must_use]
    pub fn new(budget: RunBudget) -> Self {
        Self {
            budget,
            started: Instant::now(),
        }
    }

    /// Check the run's totals now. Limits are inclusive: a run may use
    /// exactly its budget.
    ///
    /// # Errors
    ///
    /// Returns the first crossed [`BudgetBreach`], checked in the order
    /// requests, runtime, bytes.
    pub fn check(&self, stats: &HttpStats) -> Result<(), BudgetBreach> {
        self.check_at(stats, self.started.elapsed())
    }

    /// Same checks with an explicit elapsed duration.
    ///
    /// # Errors
    ///
    /// Returns the first crossed [`BudgetBreach`].
    pub fn check_at(&self, stats: &HttpStats, elapsed: Duration) -> Result<(), BudgetBreach> {
        if stats.total_requests > self.budget.max_requests {
            return Err(BudgetBreach {
                dimension: BudgetDimension::Requests,
                used: stats.total_requests,
                limit: self.budget.max_requests,
            });
        }
        if elapsed.as_secs() > self.budget.max_runtime_secs {
            return Err(BudgetBreach {
                dimension: BudgetDimension::Runtime,
                used: elapsed.as_secs(),
                limit: self.budget.max_runtime_secs,
            });
        }
        if stats.bytes_downloaded > self.budget.max_bytes {
            return Err(BudgetBreach {
                dimension: BudgetDimension::Bytes,
                used: stats.bytes_downloaded,
                limit: self.budget.max_bytes,
            });
        }
        Ok(())
    }
}
