mod commands;
mod fixture;
mod logging;
mod platform;
mod store;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(
    name = "trawler",
    version,
    about = "Run orchestration and data-quality gating for job scraping"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every due source, or a single one with --source
    Run {
        /// Path to platform YAML file
        config: PathBuf,
        /// Run only this source key
        #[arg(long)]
        source: Option<String>,
        /// Override the configured worker count
        #[arg(long)]
        parallelism: Option<usize>,
        /// Walk every stage and score, but never write anything
        #[arg(long)]
        dry_run: bool,
        /// Append a machine-readable JSON report
        #[arg(long)]
        json: bool,
    },
    /// Validate platform configuration and state reachability
    Check {
        /// Path to platform YAML file
        config: PathBuf,
    },
    /// Show configured sources with health and kill-switch state
    Sources {
        /// Path to platform YAML file
        config: PathBuf,
        /// Emit JSON instead of the table
        #[arg(long)]
        json: bool,
    },
    /// Show recent runs, newest first
    History {
        /// Path to platform YAML file
        config: PathBuf,
        /// Only runs for this source key
        #[arg(long)]
        source: Option<String>,
        /// Maximum rows shown
        #[arg(long, default_value_t = 20)]
        limit: u64,
        /// Emit JSON instead of the table
        #[arg(long)]
        json: bool,
    },
    /// Re-enable a disabled source and clear its kill-switch state
    Enable {
        /// Path to platform YAML file
        config: PathBuf,
        /// Source key
        source: String,
    },
    /// Disable a source until manually re-enabled
    Disable {
        /// Path to platform YAML file
        config: PathBuf,
        /// Source key
        source: String,
    },
    /// Toggle reduced-footprint scraping for a source
    SafeMode {
        /// Path to platform YAML file
        config: PathBuf,
        /// Source key
        source: String,
        /// Desired state
        state: Toggle,
    },
    /// Remove expired locks and fail abandoned runs
    Sweep {
        /// Path to platform YAML file
        config: PathBuf,
        /// Fail `running` runs older than this many hours
        #[arg(long, default_value_t = 6, value_parser = clap::value_parser!(i64).range(1..))]
        abandoned_after_hours: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Run {
            config,
            source,
            parallelism,
            dry_run,
            json,
        } => commands::run::execute(&config, source.as_deref(), parallelism, dry_run, json).await,
        Commands::Check { config } => commands::check::execute(&config).await,
        Commands::Sources { config, json } => commands::sources::execute(&config, json),
        Commands::History {
            config,
            source,
            limit,
            json,
        } => commands::history::execute(&config, source.as_deref(), limit, json),
        Commands::Enable { config, source } => commands::admin::enable(&config, &source),
        Commands::Disable { config, source } => commands::admin::disable(&config, &source),
        Commands::SafeMode {
            config,
            source,
            state,
        } => commands::admin::safe_mode(&config, &source, state == Toggle::On),
        Commands::Sweep {
            config,
            abandoned_after_hours,
        } => commands::sweep::execute(&config, abandoned_after_hours).await,
    }
}
