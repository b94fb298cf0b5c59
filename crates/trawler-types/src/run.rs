//! Run lifecycle model: stages, statuses, counts, timings, the persisted
//! record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::failure::FailureKind;
use crate::ids::SourceKey;
use crate::stats::HttpStats;

/// Run identifier, allocated by the state backend.
pub type RunId = i64;

/// Stages of one run, in execution order. Ordering is meaningful: resume
/// logic compares a checkpoint's stage against this progression.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    FetchList,
    ParseList,
    FetchDetails,
    Classify,
    Score,
    Finalize,
}

impl Stage {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::FetchList => "fetch_list",
            Self::ParseList => "parse_list",
            Self::FetchDetails => "fetch_details",
            Self::Classify => "classify",
            Self::Score => "score",
            Self::Finalize => "finalize",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "init" => Self::Init,
            "fetch_list" => Self::FetchList,
            "parse_list" => Self::ParseList,
            "fetch_details" => Self::FetchDetails,
            "classify" => Self::Classify,
            "score" => Self::Score,
            "finalize" => Self::Finalize,
            _ => return None,
        })
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a run. Terminal statuses are absorbing: the backend refuses
/// any further status write once one is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Success,
    PartialSuccess,
    Failed(FailureKind),
}

impl RunStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Failed(kind) => kind.as_str(),
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "partial_success" => Some(Self::PartialSuccess),
            other => FailureKind::parse(other).map(Self::Failed),
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Success-class outcomes reset the kill-switch failure counter.
    #[must_use]
    pub fn is_success_class(&self) -> bool {
        matches!(self, Self::Success | Self::PartialSuccess)
    }

    #[must_use]
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Failed(kind) => Some(*kind),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for RunStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RunStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown run status: {s}")))
    }
}

/// Item counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    /// Items the listing yielded.
    pub fetched: u64,
    /// Items surviving normalization and validation.
    pub processed: u64,
    /// Items the gateway reported as newly created.
    pub new: u64,
    /// Previously active jobs marked inactive by this run.
    pub marked_inactive: u64,
    /// Items dropped by per-item validation.
    pub skipped: u64,
}

/// Wall-clock seconds spent per stage. Retries within a stage accumulate
/// into the same entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageTimings(BTreeMap<String, f64>);

impl StageTimings {
    pub fn record(&mut self, stage: Stage, secs: f64) {
        *self.0.entry(stage.as_str().to_string()).or_insert(0.0) += secs;
    }

    #[must_use]
    pub fn get(&self, stage: Stage) -> Option<f64> {
        self.0.get(stage.as_str()).copied()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// One scrape attempt for one source, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub source: SourceKey,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<Stage>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Null only for `config_error` / `budget_exceeded` outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
    pub counts: RunCounts,
    pub http_stats: HttpStats,
    pub stage_timings: StageTimings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}
