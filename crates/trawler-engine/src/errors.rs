//! Run error model: classified scrape failures vs host infrastructure.

use trawler_state::error::StateError;
use trawler_types::failure::{FailureKind, ScrapeFailure};
use trawler_types::run::Stage;

// ---------------------------------------------------------------------------
// RunError: what can stop a run
// ---------------------------------------------------------------------------

/// Top-level error for run execution.
///
/// `Failure` wraps a classified [`ScrapeFailure`] that terminates the run
/// through the normal finalize path (recorded, scored where applicable,
/// counted by the kill switch).
///
/// `Infrastructure` wraps opaque host-side errors (task join failures,
/// unreadable state at startup, etc.) that escape the state machine; the
/// orchestrator gives those runs a best-effort terminal write instead.
#[derive(Debug)]
pub enum RunError {
    /// Classified failure from the run state machine.
    Failure(ScrapeFailure),
    /// Host-side error outside the failure taxonomy.
    Infrastructure(anyhow::Error),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failure(e) => write!(f, "{e}"),
            Self::Infrastructure(e) => write!(f, "{e:#}"),
        }
    }
}

impl std::error::Error for RunError {}

impl From<ScrapeFailure> for RunError {
    fn from(e: ScrapeFailure) -> Self {
        Self::Failure(e)
    }
}

impl From<anyhow::Error> for RunError {
    fn from(e: anyhow::Error) -> Self {
        Self::Infrastructure(e)
    }
}

impl RunError {
    /// Returns the classified kind if this is a `Failure` variant.
    #[must_use]
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Failure(e) => Some(e.kind),
            Self::Infrastructure(_) => None,
        }
    }

    /// Fold a state-layer error into the taxonomy at the stage where it
    /// struck.
    #[must_use]
    pub fn from_state(stage: Stage, err: &StateError) -> Self {
        Self::Failure(ScrapeFailure::database(stage, err.to_string()))
    }
}
