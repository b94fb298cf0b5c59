use std::path::Path;

use anyhow::Result;

use crate::platform;

/// Execute the `check` command: validate the platform config, seed the
/// config store, and verify state reachability and adapter registration.
pub async fn execute(config_path: &Path) -> Result<()> {
    let config = platform::load_config(config_path)?;
    println!("Platform config:   OK ({} sources)", config.sources.len());

    let platform = platform::build(config, None, false)?;
    platform::seed_sources(&platform).await?;

    let report = platform.orchestrator.check().await;

    println!(
        "State backend:     {}",
        if report.state_ok { "OK" } else { "FAILED" }
    );
    if report.missing_adapters.is_empty() {
        println!("Adapters:          OK ({} sources)", report.sources);
    } else {
        println!(
            "Adapters:          {} source(s) without a registered adapter",
            report.missing_adapters.len()
        );
        for entry in &report.missing_adapters {
            println!("  {entry}");
        }
    }

    if report.ok() {
        println!("\nAll checks passed.");
        Ok(())
    } else {
        anyhow::bail!("One or more checks failed")
    }
}
