//! Durable state for the trawler scrape engine.
//!
//! Provides the [`StateBackend`] trait with a [`SqliteStateBackend`]
//! implementation covering run records, per-source locks, checkpoints, and
//! source configuration/health, plus the [`LockManager`] and
//! [`CheckpointStore`] built on top of it.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod checkpoint;
pub mod error;
pub mod lock;
pub mod sqlite;
