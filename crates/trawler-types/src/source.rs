//! Per-source configuration and health records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::SourceKey;
use crate::run::RunStatus;

/// Resource ceilings for one run. A breach is immediately terminal and
/// discards everything the run fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunBudget {
    pub max_requests: u64,
    pub max_runtime_secs: u64,
    pub max_bytes: u64,
}

impl Default for RunBudget {
    fn default() -> Self {
        Self {
            max_requests: 1_000,
            // Runs must finish inside the lock TTL.
            max_runtime_secs: 1_800,
            max_bytes: 128 * 1024 * 1024,
        }
    }
}

/// Expected job-count bounds for a source. The scorer penalizes a fetch
/// below half of `min`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCountBounds {
    pub min: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u64>,
}

/// Why a source is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisableReason {
    /// Tripped by consecutive terminal failures; re-runnable after
    /// `retry_after`.
    ConsecutiveFailures,
    /// Tripped by consecutive low-confidence scores; cleared manually.
    LowConfidence,
    /// Operator action; never flipped automatically.
    Manual,
}

impl DisableReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConsecutiveFailures => "consecutive_failures",
            Self::LowConfidence => "low_confidence",
            Self::Manual => "manual",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "consecutive_failures" => Self::ConsecutiveFailures,
            "low_confidence" => Self::LowConfidence,
            "manual" => Self::Manual,
            _ => return None,
        })
    }
}

impl std::fmt::Display for DisableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted configuration for one source.
///
/// Static fields are seeded from the platform config file; the kill-switch
/// fields (`enabled`, `disabled_*`, `retry_after`, `safe_mode`) are owned
/// by the state store and survive re-seeding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub key: SourceKey,
    /// Registry name of the fetch/parse adapter serving this source.
    pub adapter: String,
    pub enabled: bool,
    /// Reduced-footprint scraping: no detail fetches, slower pacing, and
    /// finalize is capped at the partial tier.
    pub safe_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<DisableReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_jobs: Option<JobCountBounds>,
    pub budget: RunBudget,
    /// Whether runs fetch per-item detail pages.
    pub fetch_details: bool,
    /// Delay between listing page requests.
    pub pacing_ms: u64,
}

impl SourceConfig {
    #[must_use]
    pub fn new(key: SourceKey) -> Self {
        Self {
            key,
            adapter: String::new(),
            enabled: true,
            safe_mode: false,
            disabled_at: None,
            disabled_reason: None,
            retry_after: None,
            expected_jobs: None,
            budget: RunBudget::default(),
            fetch_details: true,
            pacing_ms: 0,
        }
    }

    /// Whether the orchestrator may start a run now. A
    /// `consecutive_failures` disable becomes runnable again once its
    /// cooldown elapses; `low_confidence` and `manual` require an
    /// operator.
    #[must_use]
    pub fn is_runnable(&self, now: DateTime<Utc>) -> bool {
        if self.enabled {
            return true;
        }
        self.disabled_reason == Some(DisableReason::ConsecutiveFailures)
            && self.retry_after.is_some_and(|t| t <= now)
    }
}

/// Consecutive-outcome history for one source. Updated only by the
/// kill-switch controller under the source lock; `version` guards against
/// lost updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceHealth {
    pub key: SourceKey,
    pub consecutive_failures: u32,
    pub consecutive_low_confidence: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl SourceHealth {
    #[must_use]
    pub fn new(key: SourceKey) -> Self {
        Self {
            key,
            consecutive_failures: 0,
            consecutive_low_confidence: 0,
            last_status: None,
            last_run_at: None,
            version: 0,
        }
    }
}
