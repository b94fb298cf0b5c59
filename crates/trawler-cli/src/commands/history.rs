use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};

use trawler_types::ids::SourceKey;
use trawler_types::run::RunRecord;

use crate::platform;

/// Execute the `history` command: recent runs, newest first.
pub fn execute(config_path: &Path, source: Option<&str>, limit: u64, json: bool) -> Result<()> {
    let config = platform::load_config(config_path)?;
    let state = platform::open_state(&config)?;

    let key = source.map(SourceKey::new);
    let runs = state.recent_runs(key.as_ref(), limit)?;

    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    println!(
        "{:>6}  {:<20} {:<18} {:>6} {:>8} {:>6} {:>9}  {:<20} {:>9}",
        "RUN", "SOURCE", "STATUS", "SCORE", "FETCHED", "NEW", "REQUESTS", "STARTED", "DURATION"
    );
    for run in &runs {
        println!(
            "{:>6}  {:<20} {:<18} {:>6} {:>8} {:>6} {:>9}  {:<20} {:>9}",
            run.id,
            run.source.as_str(),
            run.status.as_str(),
            score_cell(run),
            run.counts.fetched,
            run.counts.new,
            run.http_stats.total_requests,
            fmt_ts(run.started_at),
            duration_cell(run),
        );
        if let Some(message) = &run.error_message {
            println!("{:>6}  {}", "", message);
        }
    }

    Ok(())
}

fn score_cell(run: &RunRecord) -> String {
    run.confidence_score
        .map_or_else(|| "-".to_string(), |score| format!("{score:.2}"))
}

fn duration_cell(run: &RunRecord) -> String {
    match run.finished_at {
        Some(finished) => {
            let secs = (finished - run.started_at).num_milliseconds() as f64 / 1000.0;
            format!("{secs:.1}s")
        }
        None => "running".to_string(),
    }
}

fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}
