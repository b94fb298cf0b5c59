//! Automatic source disabling driven by consecutive run outcomes.
//!
//! The rules are deliberately narrow: only failure kinds that indicate a
//! broken source relationship count toward the failure trip, and only the
//! confidence streak can demand manual clearance. `safe_mode` belongs to
//! operators and is never touched here.

use chrono::{DateTime, TimeDelta, Utc};

use trawler_types::failure::FailureKind;
use trawler_types::run::RunStatus;
use trawler_types::source::{DisableReason, SourceConfig, SourceHealth};

/// Consecutive counted failures before an automatic disable.
pub const FAILURE_TRIP_COUNT: u32 = 3;
/// Consecutive sub-threshold scores before a manual-clearance disable.
pub const LOW_CONFIDENCE_TRIP_COUNT: u32 = 5;
/// Cooldown granted to a failure-tripped source.
pub const FAILURE_COOLDOWN_HOURS: i64 = 24;
/// Scores below this count toward the low-confidence streak.
pub const LOW_CONFIDENCE_THRESHOLD: f64 = 0.5;

/// A config flip performed while applying an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchTransition {
    Disabled {
        reason: DisableReason,
        retry_after: Option<DateTime<Utc>>,
    },
    Reenabled,
}

/// Kinds that count toward the failure trip. Config errors are deployment
/// defects and budget breaches are operator-set ceilings; neither says
/// anything about the source itself. Timeouts and transport faults are
/// too noisy to disable over.
#[must_use]
pub fn counts_toward_trip(kind: FailureKind) -> bool {
    matches!(
        kind,
        FailureKind::Blocked
            | FailureKind::RateLimited
            | FailureKind::ParseError
            | FailureKind::DependencyError
    )
}

/// Apply one terminal run outcome to the source's streak counters and
/// flip the config when a trip threshold is crossed.
///
/// Runs under the source lock, so the read-modify-write on both records
/// is race-free. Returns the transition performed, if any.
pub fn apply_outcome(
    health: &mut SourceHealth,
    config: &mut SourceConfig,
    status: RunStatus,
    score: Option<f64>,
    now: DateTime<Utc>,
) -> Option<SwitchTransition> {
    health.last_status = Some(status);
    health.last_run_at = Some(now);

    match status {
        RunStatus::Failed(kind) if counts_toward_trip(kind) => {
            health.consecutive_failures += 1;
        }
        status if status.is_success_class() => {
            health.consecutive_failures = 0;
        }
        // Neutral kinds neither extend nor reset the streak.
        _ => {}
    }

    match score {
        Some(s) if s < LOW_CONFIDENCE_THRESHOLD => {
            health.consecutive_low_confidence += 1;
        }
        Some(_) => {
            health.consecutive_low_confidence = 0;
        }
        // Unscored runs (config/budget) leave the streak alone.
        None => {}
    }

    if config.disabled_reason == Some(DisableReason::Manual) {
        // Operator disables outrank every automatic transition.
        return None;
    }

    if health.consecutive_low_confidence >= LOW_CONFIDENCE_TRIP_COUNT {
        config.enabled = false;
        config.disabled_at = Some(now);
        config.disabled_reason = Some(DisableReason::LowConfidence);
        config.retry_after = None;
        return Some(SwitchTransition::Disabled {
            reason: DisableReason::LowConfidence,
            retry_after: None,
        });
    }

    if health.consecutive_failures >= FAILURE_TRIP_COUNT {
        let retry_after = now + TimeDelta::hours(FAILURE_COOLDOWN_HOURS);
        config.enabled = false;
        config.disabled_at = Some(now);
        config.disabled_reason = Some(DisableReason::ConsecutiveFailures);
        config.retry_after = Some(retry_after);
        return Some(SwitchTransition::Disabled {
            reason: DisableReason::ConsecutiveFailures,
            retry_after: Some(retry_after),
        });
    }

    if !config.enabled
        && config.disabled_reason == Some(DisableReason::ConsecutiveFailures)
        && status.is_success_class()
    {
        // A cooldown-window run came back healthy.
        config.enabled = true;
        config.disabled_at = None;
        config.disabled_reason = None;
        config.retry_after = None;
        return Some(SwitchTransition::Reenabled);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use trawler_types::ids::SourceKey;

    fn fixtures() -> (SourceHealth, SourceConfig) {
        let key = SourceKey::new("acme_jobs");
        (SourceHealth::new(key.clone()), SourceConfig::new(key))
    }

    fn failed(kind: FailureKind) -> RunStatus {
        RunStatus::Failed(kind)
    }

    #[test]
    fn test_third_counted_failure_disables_with_cooldown() {
        let (mut health, mut config) = fixtures();
        config.safe_mode = true;
        let now = Utc::now();

        for _ in 0..2 {
            let t = apply_outcome(
                &mut health,
                &mut config,
                failed(FailureKind::Blocked),
                Some(0.0),
                now,
            );
            assert!(t.is_none());
            assert!(config.enabled);
        }

        let t = apply_outcome(
            &mut health,
            &mut config,
            failed(FailureKind::Blocked),
            Some(0.0),
            now,
        );
        assert_eq!(
            t,
            Some(SwitchTransition::Disabled {
                reason: DisableReason::ConsecutiveFailures,
                retry_after: Some(now + TimeDelta::hours(24)),
            })
        );
        assert!(!config.enabled);
        assert_eq!(health.consecutive_failures, 3);
        // Operator-owned flag is untouched by automatic transitions.
        assert!(config.safe_mode);
    }

    #[test]
    fn test_mixed_counted_kinds_share_one_streak() {
        let (mut health, mut config) = fixtures();
        let now = Utc::now();

        apply_outcome(
            &mut health,
            &mut config,
            failed(FailureKind::RateLimited),
            Some(0.0),
            now,
        );
        apply_outcome(
            &mut health,
            &mut config,
            failed(FailureKind::ParseError),
            Some(0.0),
            now,
        );
        let t = apply_outcome(
            &mut health,
            &mut config,
            failed(FailureKind::DependencyError),
            Some(0.0),
            now,
        );
        assert!(matches!(t, Some(SwitchTransition::Disabled { .. })));
    }

    #[test]
    fn test_uncounted_kinds_leave_streak_alone() {
        let (mut health, mut config) = fixtures();
        let now = Utc::now();

        apply_outcome(
            &mut health,
            &mut config,
            failed(FailureKind::Blocked),
            Some(0.0),
            now,
        );
        apply_outcome(
            &mut health,
            &mut config,
            failed(FailureKind::Timeout),
            Some(0.0),
            now,
        );
        assert_eq!(health.consecutive_failures, 1);

        apply_outcome(
            &mut health,
            &mut config,
            failed(FailureKind::ConfigError),
            None,
            now,
        );
        assert_eq!(health.consecutive_failures, 1);
        assert!(config.enabled);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let (mut health, mut config) = fixtures();
        let now = Utc::now();

        apply_outcome(
            &mut health,
            &mut config,
            failed(FailureKind::Blocked),
            Some(0.0),
            now,
        );
        apply_outcome(
            &mut health,
            &mut config,
            failed(FailureKind::Blocked),
            Some(0.0),
            now,
        );
        apply_outcome(&mut health, &mut config, RunStatus::Success, Some(0.95), now);
        assert_eq!(health.consecutive_failures, 0);

        apply_outcome(
            &mut health,
            &mut config,
            failed(FailureKind::Blocked),
            Some(0.0),
            now,
        );
        assert!(config.enabled);
    }

    #[test]
    fn test_fifth_low_score_requires_manual_clearance() {
        let (mut health, mut config) = fixtures();
        let now = Utc::now();

        for _ in 0..4 {
            let t = apply_outcome(
                &mut health,
                &mut config,
                RunStatus::PartialSuccess,
                Some(0.42),
                now,
            );
            assert!(t.is_none());
        }
        let t = apply_outcome(
            &mut health,
            &mut config,
            RunStatus::PartialSuccess,
            Some(0.42),
            now,
        );
        assert_eq!(
            t,
            Some(SwitchTransition::Disabled {
                reason: DisableReason::LowConfidence,
                retry_after: None,
            })
        );
        assert!(!config.enabled);
        assert!(config.retry_after.is_none());
        // No cooldown: still not runnable far in the future.
        assert!(!config.is_runnable(now + TimeDelta::days(30)));
    }

    #[test]
    fn test_adequate_score_resets_low_confidence_streak() {
        let (mut health, mut config) = fixtures();
        let now = Utc::now();

        for _ in 0..4 {
            apply_outcome(
                &mut health,
                &mut config,
                RunStatus::PartialSuccess,
                Some(0.3),
                now,
            );
        }
        apply_outcome(&mut health, &mut config, RunStatus::Success, Some(0.5), now);
        assert_eq!(health.consecutive_low_confidence, 0);
        assert!(config.enabled);
    }

    #[test]
    fn test_streaks_are_independent() {
        let (mut health, mut config) = fixtures();
        let now = Utc::now();

        // A scored partial success resets failures but extends the
        // low-confidence streak.
        apply_outcome(
            &mut health,
            &mut config,
            failed(FailureKind::Blocked),
            Some(0.1),
            now,
        );
        apply_outcome(
            &mut health,
            &mut config,
            RunStatus::PartialSuccess,
            Some(0.4),
            now,
        );
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.consecutive_low_confidence, 2);
    }

    #[test]
    fn test_low_confidence_trip_wins_over_failure_trip() {
        let (mut health, mut config) = fixtures();
        let now = Utc::now();
        health.consecutive_failures = 2;
        health.consecutive_low_confidence = 4;

        let t = apply_outcome(
            &mut health,
            &mut config,
            failed(FailureKind::Blocked),
            Some(0.0),
            now,
        );
        assert_eq!(
            t,
            Some(SwitchTransition::Disabled {
                reason: DisableReason::LowConfidence,
                retry_after: None,
            })
        );
    }

    #[test]
    fn test_manual_disable_suppresses_automatic_transitions() {
        let (mut health, mut config) = fixtures();
        let now = Utc::now();
        config.enabled = false;
        config.disabled_reason = Some(DisableReason::Manual);
        health.consecutive_failures = 2;

        let t = apply_outcome(
            &mut health,
            &mut config,
            failed(FailureKind::Blocked),
            Some(0.0),
            now,
        );
        assert!(t.is_none());
        // Counters still track history while manually disabled.
        assert_eq!(health.consecutive_failures, 3);
        assert_eq!(config.disabled_reason, Some(DisableReason::Manual));
        assert!(config.retry_after.is_none());
    }

    #[test]
    fn test_cooldown_success_reenables() {
        let (mut health, mut config) = fixtures();
        let now = Utc::now();
        config.enabled = false;
        config.disabled_at = Some(now - TimeDelta::hours(25));
        config.disabled_reason = Some(DisableReason::ConsecutiveFailures);
        config.retry_after = Some(now - TimeDelta::hours(1));
        health.consecutive_failures = 3;

        let t = apply_outcome(&mut health, &mut config, RunStatus::Success, Some(0.9), now);
        assert_eq!(t, Some(SwitchTransition::Reenabled));
        assert!(config.enabled);
        assert!(config.disabled_reason.is_none());
        assert!(config.retry_after.is_none());
        assert_eq!(health.consecutive_failures, 0);
    }

    #[test]
    fn test_cooldown_failure_redisables_with_fresh_window() {
        let (mut health, mut config) = fixtures();
        let now = Utc::now();
        config.enabled = false;
        config.disabled_at = Some(now - TimeDelta::hours(25));
        config.disabled_reason = Some(DisableReason::ConsecutiveFailures);
        config.retry_after = Some(now - TimeDelta::hours(1));
        health.consecutive_failures = 3;

        let t = apply_outcome(
            &mut health,
            &mut config,
            failed(FailureKind::Blocked),
            Some(0.0),
            now,
        );
        assert_eq!(
            t,
            Some(SwitchTransition::Disabled {
                reason: DisableReason::ConsecutiveFailures,
                retry_after: Some(now + TimeDelta::hours(24)),
            })
        );
        assert_eq!(health.consecutive_failures, 4);
    }
}
