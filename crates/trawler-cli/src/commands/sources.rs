use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};

use trawler_types::source::{SourceConfig, SourceHealth};

use crate::platform;

/// Execute the `sources` command: configured sources with health and
/// kill-switch state, as seeded into the config store.
pub fn execute(config_path: &Path, json: bool) -> Result<()> {
    let config = platform::load_config(config_path)?;
    let state = platform::open_state(&config)?;

    let configs = state.list_source_configs()?;
    if configs.is_empty() {
        println!("No sources in the config store yet.");
        println!("`trawler run` or `trawler check` seeds them from the platform YAML.");
        return Ok(());
    }

    let mut rows: Vec<(SourceConfig, SourceHealth)> = Vec::with_capacity(configs.len());
    for source_config in configs {
        let health = state.get_source_health(&source_config.key)?;
        rows.push((source_config, health));
    }

    if json {
        let report: Vec<serde_json::Value> = rows
            .iter()
            .map(|(config, health)| {
                serde_json::json!({
                    "config": config,
                    "health": health,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for (config, health) in &rows {
        println!(
            "  {} ({})  [{}]",
            config.key,
            config.adapter,
            state_label(config)
        );
        if config.safe_mode {
            println!("    safe mode");
        }
        println!(
            "    health: {} consecutive failures, {} low-confidence",
            health.consecutive_failures, health.consecutive_low_confidence
        );
        match (health.last_status, health.last_run_at) {
            (Some(status), Some(at)) => {
                println!("    last run: {} at {}", status, fmt_ts(at));
            }
            (Some(status), None) => println!("    last run: {status}"),
            _ => println!("    last run: never"),
        }
    }

    Ok(())
}

fn state_label(config: &SourceConfig) -> String {
    if config.enabled {
        return "enabled".to_string();
    }
    let reason = config
        .disabled_reason
        .map_or_else(|| "disabled".to_string(), |r| format!("disabled: {r}"));
    match config.retry_after {
        Some(at) => format!("{reason}, retry after {}", fmt_ts(at)),
        None => reason,
    }
}

fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}
