use std::path::Path;

use anyhow::Result;
use chrono::TimeDelta;

use crate::platform;

/// Execute the `sweep` command: delete expired locks and fail abandoned
/// runs.
pub async fn execute(config_path: &Path, abandoned_after_hours: i64) -> Result<()> {
    let config = platform::load_config(config_path)?;
    let platform = platform::build(config, None, false)?;

    let summary = platform
        .orchestrator
        .sweep(TimeDelta::hours(abandoned_after_hours))
        .await?;

    println!("Abandoned runs failed:  {}", summary.abandoned_runs);
    println!("Expired locks removed:  {}", summary.expired_locks);
    Ok(())
}
