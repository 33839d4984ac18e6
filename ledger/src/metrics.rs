//! Metrics collection for ledger monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use balanced_common::LedgerError;

/// Ledger metrics.
pub struct Metrics {
    /// Committed transfers.
    pub transfers_committed: AtomicU64,
    /// Committed deposits.
    pub deposits_committed: AtomicU64,
    /// Committed withdrawals.
    pub withdrawals_committed: AtomicU64,
    /// Postings rejected for insufficient funds.
    pub insufficient_funds: AtomicU64,
    /// Row-lock waits that timed out.
    pub lock_timeouts: AtomicU64,
    /// Operations that failed in the store.
    pub storage_failures: AtomicU64,
    /// Integrity audits run.
    pub audits_run: AtomicU64,
    /// Integrity audits that reported findings.
    pub audits_failed: AtomicU64,
}

impl Metrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self {
            transfers_committed: AtomicU64::new(0),
            deposits_committed: AtomicU64::new(0),
            withdrawals_committed: AtomicU64::new(0),
            insufficient_funds: AtomicU64::new(0),
            lock_timeouts: AtomicU64::new(0),
            storage_failures: AtomicU64::new(0),
            audits_run: AtomicU64::new(0),
            audits_failed: AtomicU64::new(0),
        }
    }

    /// Record a committed transfer.
    pub fn transfer_committed(&self) {
        self.transfers_committed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a committed deposit.
    pub fn deposit_committed(&self) {
        self.deposits_committed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a committed withdrawal.
    pub fn withdrawal_committed(&self) {
        self.withdrawals_committed.fetch_add(1, Ordering::Relaxed);
    }

    /// Classify a failed write operation.
    pub fn record_failure(&self, err: &LedgerError) {
        match err {
            LedgerError::InsufficientFunds { .. } => {
                self.insufficient_funds.fetch_add(1, Ordering::Relaxed);
            }
            LedgerError::LockTimeout { .. } => {
                self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
            }
            LedgerError::Storage(_) => {
                self.storage_failures.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Record an audit outcome.
    pub fn audit_completed(&self, passed: bool) {
        self.audits_run.fetch_add(1, Ordering::Relaxed);
        if !passed {
            self.audits_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transfers_committed: self.transfers_committed.load(Ordering::Relaxed),
            deposits_committed: self.deposits_committed.load(Ordering::Relaxed),
            withdrawals_committed: self.withdrawals_committed.load(Ordering::Relaxed),
            insufficient_funds: self.insufficient_funds.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            storage_failures: self.storage_failures.load(Ordering::Relaxed),
            audits_run: self.audits_run.load(Ordering::Relaxed),
            audits_failed: self.audits_failed.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        format!(
            r#"# HELP balanced_transfers_committed_total Committed transfers
# TYPE balanced_transfers_committed_total counter
balanced_transfers_committed_total {}

# HELP balanced_deposits_committed_total Committed deposits
# TYPE balanced_deposits_committed_total counter
balanced_deposits_committed_total {}

# HELP balanced_withdrawals_committed_total Committed withdrawals
# TYPE balanced_withdrawals_committed_total counter
balanced_withdrawals_committed_total {}

# HELP balanced_insufficient_funds_total Postings rejected for insufficient funds
# TYPE balanced_insufficient_funds_total counter
balanced_insufficient_funds_total {}

# HELP balanced_lock_timeouts_total Row-lock waits that timed out
# TYPE balanced_lock_timeouts_total counter
balanced_lock_timeouts_total {}

# HELP balanced_storage_failures_total Operations failed by the store
# TYPE balanced_storage_failures_total counter
balanced_storage_failures_total {}

# HELP balanced_audits_total Integrity audits run
# TYPE balanced_audits_total counter
balanced_audits_total {}

# HELP balanced_audits_failed_total Integrity audits with findings
# TYPE balanced_audits_failed_total counter
balanced_audits_failed_total {}
"#,
            snapshot.transfers_committed,
            snapshot.deposits_committed,
            snapshot.withdrawals_committed,
            snapshot.insufficient_funds,
            snapshot.lock_timeouts,
            snapshot.storage_failures,
            snapshot.audits_run,
            snapshot.audits_failed,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub transfers_committed: u64,
    pub deposits_committed: u64,
    pub withdrawals_committed: u64,
    pub insufficient_funds: u64,
    pub lock_timeouts: u64,
    pub storage_failures: u64,
    pub audits_run: u64,
    pub audits_failed: u64,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<Metrics>;

#[cfg(test)]
mod tests {
    use super::*;
    use balanced_common::{AccountId, Amount};

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();

        metrics.transfer_committed();
        metrics.transfer_committed();
        metrics.deposit_committed();
        metrics.record_failure(&LedgerError::InsufficientFunds {
            account: AccountId::new(),
            required: Amount::from_minor(100),
            available: Amount::ZERO,
        });
        metrics.record_failure(&LedgerError::AccountNotFound(AccountId::new()));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.transfers_committed, 2);
        assert_eq!(snapshot.deposits_committed, 1);
        assert_eq!(snapshot.insufficient_funds, 1);
        assert_eq!(snapshot.lock_timeouts, 0);
    }

    #[test]
    fn test_audit_counters() {
        let metrics = Metrics::new();
        metrics.audit_completed(true);
        metrics.audit_completed(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.audits_run, 2);
        assert_eq!(snapshot.audits_failed, 1);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = Metrics::new();
        metrics.withdrawal_committed();

        let output = metrics.to_prometheus();
        assert!(output.contains("balanced_withdrawals_committed_total 1"));
        assert!(output.contains("balanced_transfers_committed_total 0"));
    }
}
