//! Platform configuration schema.
//!
//! The YAML file is the declarative half of source configuration: it
//! names sources and their static knobs. The runtime half (kill-switch
//! state, operator toggles) lives in the state store and is never
//! expressed here.

use anyhow::{bail, Result};
use serde::Deserialize;

use trawler_types::ids::SourceKey;
use trawler_types::source::{JobCountBounds, RunBudget, SourceConfig};

fn default_version() -> String {
    "1".to_string()
}

fn default_parallelism() -> usize {
    4
}

fn default_lock_ttl_minutes() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_inventory_path() -> String {
    "inventory.sqlite".to_string()
}

fn default_blob_root() -> String {
    "details".to_string()
}

/// Top-level platform configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformConfig {
    #[serde(default = "default_version")]
    pub version: String,
    pub name: String,
    pub state: StateConfig,
    #[serde(default)]
    pub inventory: InventoryConfig,
    #[serde(default)]
    pub blobs: BlobConfig,
    #[serde(default = "default_lock_ttl_minutes")]
    pub lock_ttl_minutes: u64,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default)]
    pub sources: Vec<SourceSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateConfig {
    /// Path to the SQLite database file.
    pub path: String,
}

/// Where the shared job inventory lives.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InventoryConfig {
    pub path: String,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            path: default_inventory_path(),
        }
    }
}

/// Where fetched detail documents land.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlobConfig {
    /// Directory for per-source detail text files.
    pub root: String,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            root: default_blob_root(),
        }
    }
}

/// Declarative definition of one source.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceSpec {
    pub key: String,
    /// Adapter registry name.
    pub adapter: String,
    #[serde(default)]
    pub safe_mode: bool,
    #[serde(default = "default_true")]
    pub fetch_details: bool,
    /// Delay between requests in milliseconds.
    #[serde(default)]
    pub pacing_ms: u64,
    #[serde(default)]
    pub expected_jobs: Option<BoundsSpec>,
    #[serde(default)]
    pub budget: Option<BudgetSpec>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoundsSpec {
    pub min: u64,
    #[serde(default)]
    pub max: Option<u64>,
}

/// Budget overrides; anything unset falls back to [`RunBudget::default`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BudgetSpec {
    #[serde(default)]
    pub max_requests: Option<u64>,
    #[serde(default)]
    pub max_runtime_secs: Option<u64>,
    /// Byte-size string, e.g. `"64mb"`.
    #[serde(default)]
    pub max_bytes: Option<String>,
}

impl SourceSpec {
    /// Build the persisted config this definition seeds. Runtime fields
    /// start in their enabled defaults; re-seeding preserves them.
    ///
    /// # Errors
    ///
    /// Returns an error when the budget byte-size string is invalid.
    pub fn to_source_config(&self) -> Result<SourceConfig> {
        let mut config = SourceConfig::new(SourceKey::new(self.key.trim()));
        config.adapter = self.adapter.trim().to_string();
        config.safe_mode = self.safe_mode;
        config.fetch_details = self.fetch_details;
        config.pacing_ms = self.pacing_ms;
        config.expected_jobs = self.expected_jobs.map(|b| JobCountBounds {
            min: b.min,
            max: b.max,
        });

        let mut budget = RunBudget::default();
        if let Some(spec) = &self.budget {
            if let Some(max_requests) = spec.max_requests {
                budget.max_requests = max_requests;
            }
            if let Some(max_runtime_secs) = spec.max_runtime_secs {
                budget.max_runtime_secs = max_runtime_secs;
            }
            if let Some(max_bytes) = &spec.max_bytes {
                budget.max_bytes = parse_byte_size(max_bytes)?;
            }
        }
        config.budget = budget;
        Ok(config)
    }
}

/// Parse a byte-size string like `"512kb"`, `"64mb"`, `"1gb"`, or a bare
/// byte count.
///
/// # Errors
///
/// Returns an error for empty, non-numeric, or unknown-suffix input.
pub fn parse_byte_size(input: &str) -> Result<u64> {
    let s = input.trim().to_ascii_lowercase();
    if s.is_empty() {
        bail!("empty byte size");
    }
    let (number, multiplier) = if let Some(prefix) = s.strip_suffix("gb") {
        (prefix, 1024 * 1024 * 1024)
    } else if let Some(prefix) = s.strip_suffix("mb") {
        (prefix, 1024 * 1024)
    } else if let Some(prefix) = s.strip_suffix("kb") {
        (prefix, 1024)
    } else if let Some(prefix) = s.strip_suffix('b') {
        (prefix, 1)
    } else {
        (s.as_str(), 1)
    };
    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid byte size '{input}'"))?;
    Ok(value * multiplier)
}
