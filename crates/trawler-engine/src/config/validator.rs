//! Semantic validation for parsed platform configuration values.

use std::collections::HashSet;

use anyhow::{bail, Result};

use crate::config::types::{parse_byte_size, PlatformConfig, SourceSpec};

fn validate_source(spec: &SourceSpec, index: usize, errors: &mut Vec<String>) {
    let context = if spec.key.trim().is_empty() {
        format!("Source {index}")
    } else {
        format!("Source '{}'", spec.key)
    };

    if spec.key.trim().is_empty() {
        errors.push(format!("{context}: key must not be empty"));
    }
    if spec.adapter.trim().is_empty() {
        errors.push(format!("{context}: adapter must not be empty"));
    }
    if let Some(bounds) = spec.expected_jobs {
        if bounds.max.is_some_and(|max| max < bounds.min) {
            errors.push(format!(
                "{context}: expected_jobs min {} exceeds max {}",
                bounds.min,
                bounds.max.unwrap_or(0)
            ));
        }
    }
    if let Some(budget) = &spec.budget {
        if budget.max_requests == Some(0) {
            errors.push(format!("{context}: budget max_requests must be > 0"));
        }
        if budget.max_runtime_secs == Some(0) {
            errors.push(format!("{context}: budget max_runtime_secs must be > 0"));
        }
        if let Some(max_bytes) = &budget.max_bytes {
            match parse_byte_size(max_bytes) {
                Ok(0) => errors.push(format!("{context}: budget max_bytes must be > 0")),
                Ok(_) => {}
                Err(_) => {
                    errors.push(format!("{context}: invalid budget max_bytes '{max_bytes}'"));
                }
            }
        }
    }
}

/// Validate a parsed platform configuration.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the config.
pub fn validate_platform(config: &PlatformConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != "1" {
        errors.push(format!(
            "Unsupported platform version '{}', expected '1'",
            config.version
        ));
    }

    if config.name.trim().is_empty() {
        errors.push("Platform name must not be empty".to_string());
    }

    if config.state.path.trim().is_empty() {
        errors.push("State path must not be empty".to_string());
    }

    if config.inventory.path.trim().is_empty() {
        errors.push("Inventory path must not be empty".to_string());
    }

    if config.blobs.root.trim().is_empty() {
        errors.push("Blob root must not be empty".to_string());
    }

    if config.parallelism == 0 {
        errors.push("parallelism must be at least 1".to_string());
    }

    if config.lock_ttl_minutes == 0 {
        errors.push("lock_ttl_minutes must be at least 1".to_string());
    }

    let mut seen = HashSet::new();
    for (i, spec) in config.sources.iter().enumerate() {
        if !spec.key.trim().is_empty() && !seen.insert(spec.key.trim().to_string()) {
            errors.push(format!("Duplicate source key '{}'", spec.key));
        }
        validate_source(spec, i, &mut errors);
    }

    if !errors.is_empty() {
        bail!("Invalid platform config:\n  - {}", errors.join("\n  - "));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::parse_platform_str;

    fn valid_yaml() -> &'static str {
        r#"
version: "1"
name: job-trawler
state:
  path: state.db
sources:
  - key: acme_jobs
    adapter: greenhouse
  - key: globex_board
    adapter: fixture
"#
    }

    #[test]
    fn test_valid_config_passes() {
        let config = parse_platform_str(valid_yaml()).unwrap();
        assert!(validate_platform(&config).is_ok());
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut config = parse_platform_str(valid_yaml()).unwrap();
        config.version = "2".to_string();
        let err = validate_platform(&config).unwrap_err().to_string();
        assert!(err.contains("Unsupported platform version"));
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let mut config = parse_platform_str(valid_yaml()).unwrap();
        config.sources[1].key = "acme_jobs".to_string();
        let err = validate_platform(&config).unwrap_err().to_string();
        assert!(err.contains("Duplicate source key 'acme_jobs'"));
    }

    #[test]
    fn test_all_errors_reported_at_once() {
        let mut config = parse_platform_str(valid_yaml()).unwrap();
        config.parallelism = 0;
        config.sources[0].adapter = String::new();
        config.sources[1].budget = Some(crate::config::types::BudgetSpec {
            max_requests: Some(0),
            max_runtime_secs: None,
            max_bytes: Some("lots".to_string()),
        });
        let err = validate_platform(&config).unwrap_err().to_string();
        assert!(err.contains("parallelism must be at least 1"));
        assert!(err.contains("adapter must not be empty"));
        assert!(err.contains("max_requests must be > 0"));
        assert!(err.contains("invalid budget max_bytes 'lots'"));
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let mut config = parse_platform_str(valid_yaml()).unwrap();
        config.sources[0].expected_jobs = Some(crate::config::types::BoundsSpec {
            min: 100,
            max: Some(50),
        });
        let err = validate_platform(&config).unwrap_err().to_string();
        assert!(err.contains("min 100 exceeds max 50"));
    }
}
