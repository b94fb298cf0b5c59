//! Shared model types for the trawler scrape engine.
//!
//! Everything here is plain data: ids, the failure taxonomy, run records,
//! HTTP statistics, source configuration and health, checkpoints, and job
//! items. No I/O lives in this crate.

pub mod checkpoint;
pub mod failure;
pub mod ids;
pub mod item;
pub mod run;
pub mod source;
pub mod stats;
