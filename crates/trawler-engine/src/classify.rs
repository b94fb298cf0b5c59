//! Symptom classification and the per-kind retry policy table.
//!
//! Classification is a pure function from a [`SymptomBundle`] to a
//! [`Verdict`]. The precedence is fixed: transport exceptions beat HTTP
//! status, status beats content shape, content shape beats parse outcome.
//! A content-type mismatch on a structured endpoint is treated as a block
//! even when the status is 2xx, because block pages and captcha walls are
//! routinely served with 200.

use std::time::Duration;

use trawler_types::failure::{
    FailureKind, ParseOutcome, SymptomBundle, TransportException, Verdict,
};

const BACKOFF_BASE_MS: u64 = 1_000;
const BACKOFF_CAP_MS: u64 = 60_000;
const LINEAR_STEP_MS: u64 = 500;

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Map one stage call's raw symptoms to a verdict.
#[must_use]
pub fn classify(symptoms: &SymptomBundle) -> Verdict {
    if let Some(exception) = symptoms.exception {
        let kind = match exception {
            TransportException::Timeout => FailureKind::Timeout,
            TransportException::ProxyRefused
            | TransportException::ConnectionReset
            | TransportException::DnsFailure
            | TransportException::TlsFailure => FailureKind::ProxyError,
        };
        return Verdict::Failure(kind);
    }

    if let Some(status) = symptoms.http_status {
        if status == 429 {
            return Verdict::Failure(FailureKind::RateLimited);
        }
        if status == 403 || status == 401 {
            return Verdict::Failure(FailureKind::Blocked);
        }
        if status >= 500 {
            return Verdict::Failure(FailureKind::DependencyError);
        }
    }

    if let (Some(expected), Some(actual)) = (symptoms.expected_content, symptoms.actual_content) {
        if expected.is_structured() && !actual.is_structured() {
            return Verdict::Failure(FailureKind::Blocked);
        }
    }

    match symptoms.parse {
        ParseOutcome::Failed => Verdict::Failure(FailureKind::ParseError),
        ParseOutcome::Parsed if symptoms.items_extracted == 0 => {
            Verdict::Failure(FailureKind::EmptyResponse)
        }
        ParseOutcome::Parsed => Verdict::Success,
        ParseOutcome::NotAttempted => {
            // Detail-style calls succeed without a parse step as long as
            // the response itself was sound.
            match symptoms.http_status {
                Some(status) if (200..300).contains(&status) => Verdict::Success,
                _ => Verdict::Failure(FailureKind::DependencyError),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// How one failure kind behaves inside a stage's retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts for the stage call, the first try included.
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Ask the adapter for a fresh egress route before the next attempt.
    pub rotate_route: bool,
    /// Raise the per-request time ceiling on each attempt, up to 3x.
    pub escalate_timeout: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    None,
    Exponential,
    Linear,
}

/// The closed policy table. Terminal kinds get a single attempt; every
/// transient kind has a hard attempt cap so no retry loop is unbounded.
#[must_use]
pub fn retry_policy(kind: FailureKind) -> RetryPolicy {
    match kind {
        FailureKind::RateLimited | FailureKind::DependencyError => RetryPolicy {
            max_attempts: 3,
            backoff: Backoff::Exponential,
            rotate_route: false,
            escalate_timeout: false,
        },
        // Backing off does not un-block an IP; switching routes might.
        FailureKind::Blocked | FailureKind::ProxyError => RetryPolicy {
            max_attempts: 3,
            backoff: Backoff::None,
            rotate_route: true,
            escalate_timeout: false,
        },
        FailureKind::Timeout => RetryPolicy {
            max_attempts: 3,
            backoff: Backoff::None,
            rotate_route: false,
            escalate_timeout: true,
        },
        FailureKind::DatabaseError | FailureKind::StorageError => RetryPolicy {
            max_attempts: 3,
            backoff: Backoff::Linear,
            rotate_route: false,
            escalate_timeout: false,
        },
        FailureKind::ParseError
        | FailureKind::ValidationError
        | FailureKind::EmptyResponse
        | FailureKind::ConfigError
        | FailureKind::BudgetExceeded => RetryPolicy {
            max_attempts: 1,
            backoff: Backoff::None,
            rotate_route: false,
            escalate_timeout: false,
        },
    }
}

/// Delay before the next attempt, or `None` when the policy is out of
/// attempts. `attempt` is 1-based and names the try that just failed. A
/// server wait hint replaces the computed backoff but never extends the
/// attempt budget, and is capped so a hostile header cannot stall a run.
#[must_use]
pub fn next_delay(kind: FailureKind, attempt: u32, hint: Option<Duration>) -> Option<Duration> {
    let policy = retry_policy(kind);
    if attempt >= policy.max_attempts {
        return None;
    }
    if let Some(hint) = hint {
        return Some(hint.min(Duration::from_millis(BACKOFF_CAP_MS)));
    }
    let delay_ms = match policy.backoff {
        Backoff::None => 0,
        Backoff::Exponential => BACKOFF_BASE_MS
            .saturating_mul(2u64.pow(attempt.saturating_sub(1)))
            .min(BACKOFF_CAP_MS),
        Backoff::Linear => LINEAR_STEP_MS.saturating_mul(u64::from(attempt)),
    };
    Some(Duration::from_millis(delay_ms))
}
