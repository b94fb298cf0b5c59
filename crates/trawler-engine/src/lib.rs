//! Core runtime/orchestration crate for trawler scrape execution.

pub mod adapter;
pub mod budget;
pub mod classify;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod killswitch;
pub mod orchestrator;
pub mod result;
pub(crate) mod run;
pub mod score;

// Re-export public API for convenience
pub use errors::RunError;
pub use orchestrator::{EngineOptions, Orchestrator};
pub use result::{CheckReport, RunReport, SourceOutcome, SweepSummary};
pub use score::GateTier;
