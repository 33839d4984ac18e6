//! Simulation metrics.

use std::collections::{BTreeMap, VecDeque};

use balanced_common::LedgerError;
use serde::Serialize;

/// Simulation metrics.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationMetrics {
    /// Total operations attempted.
    pub total_operations: u64,
    /// Operations that committed.
    pub committed: u64,
    /// Failed operations by error code.
    pub failures: BTreeMap<&'static str, u64>,
    /// Latency samples (µs).
    #[serde(skip)]
    latency_samples: VecDeque<u64>,
    /// Maximum samples to keep.
    #[serde(skip)]
    max_samples: usize,
}

impl SimulationMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self {
            total_operations: 0,
            committed: 0,
            failures: BTreeMap::new(),
            latency_samples: VecDeque::with_capacity(10000),
            max_samples: 10000,
        }
    }

    /// Record a committed operation.
    pub fn record_success(&mut self, latency_us: u64) {
        self.total_operations += 1;
        self.committed += 1;

        if self.latency_samples.len() >= self.max_samples {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency_us);
    }

    /// Record a failed operation.
    pub fn record_failure(&mut self, err: &LedgerError) {
        self.total_operations += 1;
        *self.failures.entry(err.error_code()).or_default() += 1;
    }

    /// Record the outcome of one operation.
    pub fn record<T>(&mut self, result: &Result<T, LedgerError>, latency_us: u64) {
        match result {
            Ok(_) => self.record_success(latency_us),
            Err(err) => self.record_failure(err),
        }
    }

    /// Number of failures with the given error code.
    pub fn failures_with(&self, code: &str) -> u64 {
        self.failures.get(code).copied().unwrap_or(0)
    }

    /// Get average latency in µs.
    pub fn average_latency_us(&self) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let sum: u64 = self.latency_samples.iter().sum();
        sum / self.latency_samples.len() as u64
    }

    /// Get p99 latency in µs.
    pub fn p99_latency_us(&self) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let mut sorted: Vec<_> = self.latency_samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (sorted.len() * 99 / 100).min(sorted.len() - 1);
        sorted[idx]
    }
}

impl Default for SimulationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use balanced_common::AccountId;

    #[test]
    fn test_metrics() {
        let mut metrics = SimulationMetrics::new();

        metrics.record_success(100);
        metrics.record_success(200);
        metrics.record_success(150);
        metrics.record_failure(&LedgerError::AccountNotFound(AccountId::new()));

        assert_eq!(metrics.total_operations, 4);
        assert_eq!(metrics.committed, 3);
        assert_eq!(metrics.failures_with("ACCOUNT_NOT_FOUND"), 1);
        assert_eq!(metrics.average_latency_us(), 150);
        assert_eq!(metrics.p99_latency_us(), 200);
    }
}
