//! Shared command bootstrap: config loading, state access, and engine
//! assembly.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use trawler_engine::adapter::AdapterRegistry;
use trawler_engine::config::parser;
use trawler_engine::config::types::PlatformConfig;
use trawler_engine::config::validator;
use trawler_engine::gateway::LogSink;
use trawler_engine::{EngineOptions, Orchestrator};
use trawler_state::backend::StateBackend;
use trawler_state::sqlite::SqliteStateBackend;

use crate::fixture::FixtureAdapter;
use crate::store::{FsBlobStore, SqliteInventory};

/// Parse and validate a platform YAML file.
pub fn load_config(path: &Path) -> Result<PlatformConfig> {
    let config = parser::parse_platform(path)
        .with_context(|| format!("Failed to parse platform config: {}", path.display()))?;
    validator::validate_platform(&config)?;
    Ok(config)
}

/// Open the state database named by the config.
pub fn open_state(config: &PlatformConfig) -> Result<Arc<dyn StateBackend>> {
    let backend = SqliteStateBackend::open(&config.state.path)
        .with_context(|| format!("Failed to open state database '{}'", config.state.path))?;
    Ok(Arc::new(backend))
}

/// Built-in adapters. Real HTTP adapters live out of tree and register
/// through the engine API; the binary ships the filesystem fixture.
fn builtin_adapters() -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    registry.register("fixture", Arc::new(FixtureAdapter::from_env()));
    registry
}

/// Everything a run-capable command needs.
pub struct Platform {
    pub config: PlatformConfig,
    pub orchestrator: Orchestrator,
}

/// Assemble the engine from a validated config: state backend, inventory,
/// blob store, registry, orchestrator.
pub fn build(config: PlatformConfig, parallelism: Option<usize>, dry_run: bool) -> Result<Platform> {
    let state = open_state(&config)?;
    let inventory = SqliteInventory::open(&config.inventory.path).with_context(|| {
        format!(
            "Failed to open inventory database '{}'",
            config.inventory.path
        )
    })?;
    let blobs = FsBlobStore::new(&config.blobs.root);

    let options = EngineOptions {
        lock_ttl: Duration::from_secs(config.lock_ttl_minutes * 60),
        parallelism: parallelism.unwrap_or(config.parallelism),
        dry_run,
    };
    let orchestrator = Orchestrator::new(
        state,
        builtin_adapters(),
        Arc::new(inventory),
        Arc::new(blobs),
        Arc::new(LogSink),
        options,
    );

    Ok(Platform {
        config,
        orchestrator,
    })
}

/// Reconcile the YAML source list into the config store. Static fields
/// follow the file; kill-switch state stays untouched.
pub async fn seed_sources(platform: &Platform) -> Result<()> {
    let mut seeds = Vec::with_capacity(platform.config.sources.len());
    for spec in &platform.config.sources {
        seeds.push(spec.to_source_config()?);
    }
    platform.orchestrator.seed_sources(seeds).await?;
    Ok(())
}
