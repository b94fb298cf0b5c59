//! HTTP request statistics accumulated across a run.
//!
//! Adapters report a delta per stage call; the engine merges deltas into the
//! run's running totals. Accumulation is append-only: counts never decrease.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::failure::TransportException;

/// Aggregated HTTP statistics for one run (or one stage-call delta).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpStats {
    /// Requests attempted, including those that died in transport.
    pub total_requests: u64,
    /// Responses by HTTP status code.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub status_counts: BTreeMap<u16, u64>,
    /// Requests that never produced a response, by exception kind.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub transport_errors: BTreeMap<TransportException, u64>,
    pub bytes_downloaded: u64,
    pub latency_ms_total: u64,
    pub latency_ms_max: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl HttpStats {
    pub fn record_response(&mut self, status: u16, bytes: u64, latency_ms: u64) {
        self.total_requests += 1;
        *self.status_counts.entry(status).or_insert(0) += 1;
        self.bytes_downloaded += bytes;
        self.latency_ms_total += latency_ms;
        self.latency_ms_max = self.latency_ms_max.max(latency_ms);
    }

    pub fn record_exception(&mut self, kind: TransportException, latency_ms: u64) {
        self.total_requests += 1;
        *self.transport_errors.entry(kind).or_insert(0) += 1;
        self.latency_ms_total += latency_ms;
        self.latency_ms_max = self.latency_ms_max.max(latency_ms);
    }

    /// Fold a stage-call delta into these totals.
    pub fn merge(&mut self, delta: &HttpStats) {
        self.total_requests += delta.total_requests;
        for (status, n) in &delta.status_counts {
            *self.status_counts.entry(*status).or_insert(0) += n;
        }
        for (kind, n) in &delta.transport_errors {
            *self.transport_errors.entry(*kind).or_insert(0) += n;
        }
        self.bytes_downloaded += delta.bytes_downloaded;
        self.latency_ms_total += delta.latency_ms_total;
        self.latency_ms_max = self.latency_ms_max.max(delta.latency_ms_max);
        if delta.last_error.is_some() {
            self.last_error.clone_from(&delta.last_error);
        }
    }

    /// Responses observed with the given status code.
    #[must_use]
    pub fn count(&self, status: u16) -> u64 {
        self.status_counts.get(&status).copied().unwrap_or(0)
    }

    /// Requests counted as failures for scoring: 429s, 5xx, and everything
    /// that died in transport. Other 4xx (expired detail pages and the
    /// like) are routine for scrape traffic and do not reduce trust;
    /// 403/429 are penalized separately through the block rate.
    #[must_use]
    pub fn failed_requests(&self) -> u64 {
        let status_failures: u64 = self
            .status_counts
            .iter()
            .filter(|(status, _)| **status == 429 || **status >= 500)
            .map(|(_, n)| n)
            .sum();
        status_failures + self.transport_errors.values().sum::<u64>()
    }

    #[must_use]
    pub fn timeout_count(&self) -> u64 {
        self.transport_errors
            .get(&TransportException::Timeout)
            .copied()
            .unwrap_or(0)
    }

    /// `failed_requests / total_requests`, zero-safe.
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        self.failed_requests() as f64 / self.total_requests.max(1) as f64
    }

    /// `(403s + 429s) / total_requests`, zero-safe.
    #[must_use]
    pub fn block_rate(&self) -> f64 {
        (self.count(403) + self.count(429)) as f64 / self.total_requests.max(1) as f64
    }

    #[must_use]
    pub fn mean_latency_ms(&self) -> f64 {
        self.latency_ms_total as f64 / self.total_requests.max(1) as f64
    }
}
