//! Failure taxonomy, symptom bundles, and classified failures.
//!
//! Adapters never classify: they report raw [`SymptomBundle`] facts and the
//! engine maps those to exactly one [`FailureKind`]. The set is closed so
//! that retry policy and kill-switch handling stay exhaustive at compile
//! time.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::run::Stage;
use crate::stats::HttpStats;

/// Canonical failure kinds a run can terminate with.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Upstream throttling (HTTP 429 or an explicit wait hint).
    RateLimited,
    /// Access denied: 403/401, captcha walls, or markup served where
    /// structured data was expected.
    Blocked,
    /// Egress route failure: proxy refusal, connection reset, DNS, TLS.
    ProxyError,
    /// Request exceeded its time ceiling.
    Timeout,
    /// Response arrived but could not be parsed.
    ParseError,
    /// Parsed data failed semantic validation wholesale.
    ValidationError,
    /// Well-formed response with zero extractable items.
    EmptyResponse,
    /// State or inventory persistence failure.
    DatabaseError,
    /// Blob store failure.
    StorageError,
    /// Invalid source configuration; a deployment defect.
    ConfigError,
    /// A per-run resource budget was breached.
    BudgetExceeded,
    /// Infrastructure catch-all: upstream 5xx, unclassified transport
    /// faults, external cancellation.
    DependencyError,
}

impl FailureKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Blocked => "blocked",
            Self::ProxyError => "proxy_error",
            Self::Timeout => "timeout",
            Self::ParseError => "parse_error",
            Self::ValidationError => "validation_error",
            Self::EmptyResponse => "empty_response",
            Self::DatabaseError => "database_error",
            Self::StorageError => "storage_error",
            Self::ConfigError => "config_error",
            Self::BudgetExceeded => "budget_exceeded",
            Self::DependencyError => "dependency_error",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "rate_limited" => Self::RateLimited,
            "blocked" => Self::Blocked,
            "proxy_error" => Self::ProxyError,
            "timeout" => Self::Timeout,
            "parse_error" => Self::ParseError,
            "validation_error" => Self::ValidationError,
            "empty_response" => Self::EmptyResponse,
            "database_error" => Self::DatabaseError,
            "storage_error" => Self::StorageError,
            "config_error" => Self::ConfigError,
            "budget_exceeded" => Self::BudgetExceeded,
            "dependency_error" => Self::DependencyError,
            _ => return None,
        })
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-level exception kinds an adapter can observe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TransportException {
    Timeout,
    ProxyRefused,
    ConnectionReset,
    DnsFailure,
    TlsFailure,
}

impl TransportException {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ProxyRefused => "proxy_refused",
            Self::ConnectionReset => "connection_reset",
            Self::DnsFailure => "dns_failure",
            Self::TlsFailure => "tls_failure",
        }
    }
}

impl std::fmt::Display for TransportException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload shape a stage expects or receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Json,
    Html,
    Xml,
    Text,
}

impl ContentKind {
    /// Structured kinds carry machine-readable listings; markup served in
    /// their place is a block page until proven otherwise.
    #[must_use]
    pub fn is_structured(&self) -> bool {
        matches!(self, Self::Json | Self::Xml)
    }
}

/// What the adapter's parse step concluded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseOutcome {
    #[default]
    NotAttempted,
    Parsed,
    Failed,
}

/// Raw facts from one stage call, reported by the adapter for the engine
/// to classify.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymptomBundle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<TransportException>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_content: Option<ContentKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_content: Option<ContentKind>,
    #[serde(default)]
    pub body_bytes: u64,
    #[serde(default)]
    pub parse: ParseOutcome,
    #[serde(default)]
    pub items_extracted: u64,
    /// Server-provided wait hint (e.g. a Retry-After header).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Requests spent on the failed call, folded into the run totals.
    #[serde(default)]
    pub stats: HttpStats,
}

impl SymptomBundle {
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        Self {
            http_status: Some(status),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn from_exception(kind: TransportException) -> Self {
        Self {
            exception: Some(kind),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn parse_failed(detail: impl Into<String>) -> Self {
        Self {
            parse: ParseOutcome::Failed,
            detail: Some(detail.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_content(mut self, expected: ContentKind, actual: ContentKind) -> Self {
        self.expected_content = Some(expected);
        self.actual_content = Some(actual);
        self
    }

    #[must_use]
    pub fn with_retry_after(mut self, wait: Duration) -> Self {
        self.retry_after = Some(wait);
        self
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    #[must_use]
    pub fn with_stats(mut self, stats: HttpStats) -> Self {
        self.stats = stats;
        self
    }
}

/// Classifier output: either the stage work is trustworthy or it maps to
/// exactly one failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failure(FailureKind),
}

impl Verdict {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// A classified, stage-attributed failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("[{kind}] {stage}: {message}")]
pub struct ScrapeFailure {
    pub kind: FailureKind,
    pub stage: Stage,
    pub message: String,
    /// Honored by the retry loop in place of computed backoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
}

impl ScrapeFailure {
    #[must_use]
    pub fn new(kind: FailureKind, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Invalid configuration, caught before any network call.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ConfigError, Stage::Init, message)
    }

    #[must_use]
    pub fn budget(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(FailureKind::BudgetExceeded, stage, message)
    }

    #[must_use]
    pub fn database(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(FailureKind::DatabaseError, stage, message)
    }

    #[must_use]
    pub fn storage(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(FailureKind::StorageError, stage, message)
    }

    #[must_use]
    pub fn dependency(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(FailureKind::DependencyError, stage, message)
    }

    #[must_use]
    pub fn with_retry_after(mut self, wait: Duration) -> Self {
        self.retry_after = Some(wait);
        self
    }
}
