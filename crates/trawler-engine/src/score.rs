//! Confidence scoring and the mutation gate.
//!
//! The score is a product of independent penalty factors over one run's
//! observed counters. It decides how much of the shared inventory the run
//! is allowed to touch; it never decides whether the run "failed".

use serde::{Deserialize, Serialize};

use trawler_types::source::JobCountBounds;
use trawler_types::stats::HttpStats;

/// Score at or above which a run may mutate the inventory in full,
/// including marking unseen jobs inactive.
pub const FULL_TIER_THRESHOLD: f64 = 0.8;
/// Score at or above which upserts are allowed but nothing may be marked
/// inactive.
pub const UPSERT_TIER_THRESHOLD: f64 = 0.5;

/// Low-yield penalty applied when fetched count falls below half the
/// configured minimum.
const LOW_YIELD_FACTOR: f64 = 0.6;
/// Penalty applied when any response arrived with an unexpected content
/// type.
const CONTENT_MISMATCH_FACTOR: f64 = 0.5;
/// Block symptoms weigh double: they predict silent corruption, not just
/// missing data.
const BLOCK_RATE_WEIGHT: f64 = 2.0;

/// Inputs to one score computation.
#[derive(Debug, Clone, Copy)]
pub struct ScoreInputs<'a> {
    pub stats: &'a HttpStats,
    /// Items extracted across all listing pages.
    pub fetched: u64,
    /// Items that survived normalization and validation.
    pub processed: u64,
    pub expected: Option<JobCountBounds>,
    /// Any response in the run carried a content type other than the
    /// expected one, whether or not the stage recovered.
    pub unexpected_content: bool,
}

/// Compute the confidence score for a run's fetched data.
///
/// Zero fetched items is unconditionally `0.0`. Otherwise the factors
/// multiply and the result is clamped to `[0, 1]`.
#[must_use]
pub fn confidence_score(inputs: &ScoreInputs<'_>) -> f64 {
    if inputs.fetched == 0 {
        return 0.0;
    }

    let mut score = 1.0_f64;

    if let Some(bounds) = inputs.expected {
        if (inputs.fetched as f64) < 0.5 * bounds.min as f64 {
            score *= LOW_YIELD_FACTOR;
        }
    }

    score *= inputs.processed as f64 / inputs.fetched as f64;
    score *= 1.0 - inputs.stats.error_rate();
    score *= 1.0 - BLOCK_RATE_WEIGHT * inputs.stats.block_rate();

    if inputs.unexpected_content {
        score *= CONTENT_MISMATCH_FACTOR;
    }

    score.clamp(0.0, 1.0)
}

/// Mutation tier derived from a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateTier {
    /// Upsert, mark unseen jobs inactive, refresh aggregates.
    Full,
    /// Upsert only; unseen jobs keep their current state.
    UpsertOnly,
    /// No inventory mutation at all; the run is recorded for diagnosis.
    Discard,
}

impl GateTier {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::UpsertOnly => "upsert_only",
            Self::Discard => "discard",
        }
    }
}

impl std::fmt::Display for GateTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[must_use]
pub fn gate_tier(score: f64) -> GateTier {
    if score >= FULL_TIER_THRESHOLD {
        GateTier::Full
    } else if score >= UPSERT_TIER_THRESHOLD {
        GateTier::UpsertOnly
    } else {
        GateTier::Discard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(stats: &HttpStats) -> ScoreInputs<'_> {
        ScoreInputs {
            stats,
            fetched: 100,
            processed: 100,
            expected: None,
            unexpected_content: false,
        }
    }

    fn clean_stats(requests: u64) -> HttpStats {
        let mut stats = HttpStats::default();
        for _ in 0..requests {
            stats.record_response(200, 2_048, 40);
        }
        stats
    }

    #[test]
    fn test_clean_run_scores_one() {
        let stats = clean_stats(10);
        let score = confidence_score(&inputs(&stats));
        assert!((score - 1.0).abs() < f64::EPSILON);
        assert_eq!(gate_tier(score), GateTier::Full);
    }

    #[test]
    fn test_zero_fetched_is_zero_regardless_of_stats() {
        let stats = clean_stats(10);
        let mut i = inputs(&stats);
        i.fetched = 0;
        i.processed = 0;
        assert_eq!(confidence_score(&i), 0.0);
        assert_eq!(gate_tier(0.0), GateTier::Discard);
    }

    #[test]
    fn test_low_yield_penalty_below_half_minimum() {
        let stats = clean_stats(5);
        let mut i = inputs(&stats);
        i.fetched = 20;
        i.processed = 20;
        i.expected = Some(JobCountBounds {
            min: 50,
            max: None,
        });
        // 20 < 25, so the 0.6 factor applies.
        let score = confidence_score(&i);
        assert!((score - 0.6).abs() < 1e-9);

        // At exactly half the minimum the penalty does not apply.
        i.fetched = 25;
        i.processed = 25;
        let score = confidence_score(&i);
        assert!((score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_rate_scales_score() {
        let stats = clean_stats(5);
        let mut i = inputs(&stats);
        i.fetched = 100;
        i.processed = 65;
        let score = confidence_score(&i);
        assert!((score - 0.65).abs() < 1e-9);
        assert_eq!(gate_tier(score), GateTier::UpsertOnly);
    }

    #[test]
    fn test_block_rate_weighs_double() {
        // 45 requests: 40 ok, 2 blocked, 1 throttled, 2 upstream errors.
        let mut stats = HttpStats::default();
        for _ in 0..40 {
            stats.record_response(200, 4_096, 80);
        }
        stats.record_response(403, 512, 60);
        stats.record_response(403, 512, 60);
        stats.record_response(429, 128, 30);
        stats.record_response(500, 256, 90);
        stats.record_response(502, 256, 90);

        let mut i = inputs(&stats);
        i.fetched = 150;
        i.processed = 150;
        i.expected = Some(JobCountBounds {
            min: 50,
            max: None,
        });

        let score = confidence_score(&i);
        // error_rate 3/45, block_rate 3/45 doubled.
        let expected = (1.0 - 3.0 / 45.0) * (1.0 - 2.0 * (3.0 / 45.0));
        assert!((score - expected).abs() < 1e-9);
        assert!((score - 0.8089).abs() < 1e-3);
        assert_eq!(gate_tier(score), GateTier::Full);
    }

    #[test]
    fn test_content_mismatch_halves_score() {
        let stats = clean_stats(10);
        let mut i = inputs(&stats);
        i.unexpected_content = true;
        let score = confidence_score(&i);
        assert!((score - 0.5).abs() < 1e-9);
        assert_eq!(gate_tier(score), GateTier::UpsertOnly);
    }

    #[test]
    fn test_heavy_blocking_clamps_to_zero() {
        // 6 of 10 requests blocked pushes the block factor negative.
        let mut stats = HttpStats::default();
        for _ in 0..4 {
            stats.record_response(200, 1_024, 50);
        }
        for _ in 0..6 {
            stats.record_response(403, 512, 50);
        }
        let score = confidence_score(&inputs(&stats));
        assert_eq!(score, 0.0);
        assert_eq!(gate_tier(score), GateTier::Discard);
    }

    #[test]
    fn test_gate_tier_boundaries() {
        assert_eq!(gate_tier(0.81), GateTier::Full);
        assert_eq!(gate_tier(0.8), GateTier::Full);
        assert_eq!(gate_tier(0.79), GateTier::UpsertOnly);
        assert_eq!(gate_tier(0.5), GateTier::UpsertOnly);
        assert_eq!(gate_tier(0.49), GateTier::Discard);
    }

    #[test]
    fn test_gate_tier_serde_is_snake_case() {
        assert_eq!(
            serde_json::to_string(&GateTier::UpsertOnly).unwrap(),
            "\"upsert_only\""
        );
    }
}
