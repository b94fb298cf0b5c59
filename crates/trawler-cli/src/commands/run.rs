use std::path::Path;

use anyhow::Result;

use trawler_engine::{RunReport, SourceOutcome};
use trawler_types::ids::SourceKey;

use crate::platform;

/// Execute the `run` command: seed sources from the config, then run one
/// source or every due source.
pub async fn execute(
    config_path: &Path,
    source: Option<&str>,
    parallelism: Option<usize>,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let config = platform::load_config(config_path)?;
    let platform = platform::build(config, parallelism, dry_run)?;
    platform::seed_sources(&platform).await?;

    tracing::info!(
        platform = platform.config.name,
        sources = platform.config.sources.len(),
        dry_run,
        "platform loaded"
    );

    let outcomes = match source {
        Some(key) => vec![
            platform
                .orchestrator
                .run_source(&SourceKey::new(key))
                .await?,
        ],
        None => platform.orchestrator.run_all().await?,
    };

    let mut failed = 0usize;
    for outcome in &outcomes {
        print_outcome(outcome);
        match outcome {
            SourceOutcome::Ran(report) if !report.status.is_success_class() => failed += 1,
            SourceOutcome::Errored { .. } => failed += 1,
            _ => {}
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&outcomes)?);
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} source passes failed", outcomes.len());
    }
    Ok(())
}

fn print_outcome(outcome: &SourceOutcome) {
    match outcome {
        SourceOutcome::Ran(report) => print_report(report),
        SourceOutcome::Skipped { source, reason } => {
            println!("Source '{source}': skipped ({reason})");
        }
        SourceOutcome::Errored { source, message } => {
            println!("Source '{source}': error: {message}");
        }
    }
}

fn print_report(report: &RunReport) {
    let suffix = if report.dry_run { " (dry run)" } else { "" };
    println!("Source '{}': {}{}", report.source, report.status, suffix);
    match report.tier {
        Some(tier) => println!("  Tier:       {tier}"),
        None => println!("  Tier:       none"),
    }
    match report.confidence_score {
        Some(score) => println!("  Score:      {score:.2}"),
        None => println!("  Score:      n/a"),
    }
    println!(
        "  Jobs:       {} fetched, {} processed, {} new, {} marked inactive, {} skipped",
        report.counts.fetched,
        report.counts.processed,
        report.counts.new,
        report.counts.marked_inactive,
        report.counts.skipped,
    );
    println!(
        "  Requests:   {} ({})",
        report.total_requests,
        format_bytes(report.bytes_downloaded)
    );
    println!("  Duration:   {:.2}s", report.duration_secs);
    if report.resumed {
        println!("  Resumed from a checkpoint");
    }
    if report.safe_mode {
        println!("  Safe mode");
    }
    if let Some(message) = &report.error_message {
        println!("  Error:      {message}");
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.2} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.2} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}
