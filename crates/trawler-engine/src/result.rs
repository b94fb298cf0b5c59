//! Outcome summaries handed back to embedders and the CLI.

use serde::Serialize;

use trawler_types::ids::SourceKey;
use trawler_types::run::{RunCounts, RunId, RunStatus};

use crate::score::GateTier;

/// Why a source pass ended without executing a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Another holder owns the source lock.
    Locked,
    /// Disabled without an elapsed cooldown.
    Disabled,
}

impl SkipReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Locked => "locked",
            Self::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One orchestrated source pass.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SourceOutcome {
    Ran(RunReport),
    Skipped {
        source: SourceKey,
        reason: SkipReason,
    },
    /// The pass died outside the run state machine; any created run got a
    /// best-effort terminal write.
    Errored {
        source: SourceKey,
        message: String,
    },
}

impl SourceOutcome {
    #[must_use]
    pub fn source(&self) -> &SourceKey {
        match self {
            Self::Ran(report) => &report.source,
            Self::Skipped { source, .. } | Self::Errored { source, .. } => source,
        }
    }
}

/// Summary of one executed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// `None` for dry runs, which record nothing.
    pub run_id: Option<RunId>,
    pub source: SourceKey,
    pub status: RunStatus,
    pub confidence_score: Option<f64>,
    pub tier: Option<GateTier>,
    pub counts: RunCounts,
    pub total_requests: u64,
    pub bytes_downloaded: u64,
    pub duration_secs: f64,
    /// The run was adopted from an unfinished predecessor.
    pub resumed: bool,
    pub safe_mode: bool,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Result of a `check` pass over configuration and state.
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub config_ok: bool,
    pub state_ok: bool,
    pub sources: usize,
    /// Sources whose configured adapter is not registered.
    pub missing_adapters: Vec<String>,
}

impl CheckReport {
    #[must_use]
    pub fn ok(&self) -> bool {
        self.config_ok && self.state_ok && self.missing_adapters.is_empty()
    }
}

/// Result of a maintenance sweep.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SweepSummary {
    /// Stale `running` rows flipped to a terminal failure.
    pub abandoned_runs: u64,
    /// Expired scheduler locks removed.
    pub expired_locks: u64,
}
