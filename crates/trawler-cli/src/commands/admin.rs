//! Manual source overrides: `enable`, `disable`, `safe-mode`.
//!
//! These edit the persisted source config directly. A manual disable
//! outranks the kill-switch: no cooldown ever re-enables it.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Utc;

use trawler_state::backend::StateBackend;
use trawler_types::ids::SourceKey;
use trawler_types::source::{DisableReason, SourceConfig};

use crate::platform;

/// Re-enable a source and clear its kill-switch state.
pub fn enable(config_path: &Path, source: &str) -> Result<()> {
    let (state, key, mut config) = load_source(config_path, source)?;

    config.enabled = true;
    config.disabled_at = None;
    config.disabled_reason = None;
    config.retry_after = None;
    state.put_source_config(&config, Utc::now())?;

    // Leftover streaks would re-trip the switch on the next bad run.
    let mut health = state.get_source_health(&key)?;
    health.consecutive_failures = 0;
    health.consecutive_low_confidence = 0;
    state.put_source_health(&health)?;

    tracing::info!(source = %key, "source enabled manually");
    println!("Source '{key}' enabled.");
    Ok(())
}

/// Disable a source until manually re-enabled.
pub fn disable(config_path: &Path, source: &str) -> Result<()> {
    let (state, key, mut config) = load_source(config_path, source)?;

    config.enabled = false;
    config.disabled_at = Some(Utc::now());
    config.disabled_reason = Some(DisableReason::Manual);
    config.retry_after = None;
    state.put_source_config(&config, Utc::now())?;

    tracing::info!(source = %key, "source disabled manually");
    println!("Source '{key}' disabled until manually re-enabled.");
    Ok(())
}

/// Toggle reduced-footprint scraping for a source.
pub fn safe_mode(config_path: &Path, source: &str, enabled: bool) -> Result<()> {
    let (state, key, mut config) = load_source(config_path, source)?;

    config.safe_mode = enabled;
    state.put_source_config(&config, Utc::now())?;

    let label = if enabled { "on" } else { "off" };
    tracing::info!(source = %key, safe_mode = enabled, "safe mode toggled");
    println!("Source '{key}' safe mode {label}.");
    Ok(())
}

fn load_source(
    config_path: &Path,
    source: &str,
) -> Result<(Arc<dyn StateBackend>, SourceKey, SourceConfig)> {
    let config = platform::load_config(config_path)?;
    let state = platform::open_state(&config)?;
    let key = SourceKey::new(source);
    let Some(source_config) = state.get_source_config(&key)? else {
        bail!("unknown source '{key}'; `trawler run` or `trawler check` seeds sources first");
    };
    Ok((state, key, source_config))
}
