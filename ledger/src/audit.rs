//! System-wide integrity audit.
//!
//! The auditor is read-only. It reports findings as values and never repairs
//! anything.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use balanced_common::{AccountId, Amount, EntryId, Result, Timestamp, Total, TransactionId};
use chrono::Utc;

use crate::account::Account;
use crate::balance::{AccountBalance, BalanceCalculator};
use crate::journal::{Direction, LedgerEntry, Posting, Transaction, TransactionKind};
use crate::metrics::SharedMetrics;
use crate::store::{LedgerRead, LedgerStore};

/// A structural finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntegrityViolation {
    /// An account's derived balance is below zero.
    NegativeBalance { account: AccountId, balance: Amount },
    /// A transaction's entries do not match the shape its kind requires.
    MalformedTransaction {
        transaction: TransactionId,
        kind: TransactionKind,
        reason: String,
    },
    /// An entry references a transaction or account that does not exist.
    OrphanEntry { entry: EntryId, reason: String },
    /// Global credits minus debits differs from net external funds.
    TrialBalanceMismatch { net: Total, expected: Total },
}

/// Ledger-wide totals.
///
/// These sum over every account, so they are carried as [`Total`] and never
/// overflow for balances that are each within range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTotals {
    /// Sum of every credit entry.
    pub credits: Total,
    /// Sum of every debit entry.
    pub debits: Total,
    /// Sum of credits on deposit transactions.
    pub deposited: Total,
    /// Sum of debits on withdrawal transactions.
    pub withdrawn: Total,
}

impl LedgerTotals {
    /// Credits minus debits.
    pub fn net(&self) -> Total {
        self.credits.minus(self.debits)
    }

    /// Deposited minus withdrawn: what `net` must equal.
    pub fn expected_net(&self) -> Total {
        self.deposited.minus(self.withdrawn)
    }
}

/// Result of an integrity audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// True only when there are no findings.
    pub passed: bool,
    /// When the audit ran.
    pub checked_at: Timestamp,
    /// Number of accounts checked.
    pub accounts_checked: usize,
    /// Number of transactions checked.
    pub transactions_checked: usize,
    /// Number of entries checked.
    pub entries_checked: usize,
    /// Global totals.
    pub totals: LedgerTotals,
    /// Credits minus debits.
    pub net: Total,
    /// Accounts whose derived balance is negative.
    pub negative_balances: Vec<AccountBalance>,
    /// Every finding.
    pub violations: Vec<IntegrityViolation>,
}

/// Totals and structural findings over a set of records.
#[derive(Debug, Default)]
pub struct JournalInspection {
    pub totals: LedgerTotals,
    pub violations: Vec<IntegrityViolation>,
}

/// Check transaction shapes, entry references and the trial balance.
pub fn inspect_journal(
    accounts: &[Account],
    transactions: &[Transaction],
    entries: &[LedgerEntry],
) -> JournalInspection {
    let known_accounts: HashSet<AccountId> = accounts.iter().map(|a| a.id).collect();
    let mut postings: HashMap<TransactionId, Posting> = transactions
        .iter()
        .map(|t| (t.id, Posting::new(t.clone())))
        .collect();

    let mut inspection = JournalInspection::default();
    let totals = &mut inspection.totals;

    for entry in entries {
        match entry.direction {
            Direction::Credit => totals.credits = totals.credits.plus(entry.amount),
            Direction::Debit => totals.debits = totals.debits.plus(entry.amount),
        }

        if !known_accounts.contains(&entry.account_id) {
            inspection.violations.push(IntegrityViolation::OrphanEntry {
                entry: entry.id,
                reason: format!("unknown account {}", entry.account_id),
            });
        }

        match postings.get_mut(&entry.transaction_id) {
            Some(posting) => posting.add_entry(entry.clone()),
            None => inspection.violations.push(IntegrityViolation::OrphanEntry {
                entry: entry.id,
                reason: format!("unknown transaction {}", entry.transaction_id),
            }),
        }
    }

    // Creation order keeps the findings stable across runs.
    for transaction in transactions {
        let Some(posting) = postings.get(&transaction.id) else {
            continue;
        };

        if let Some(reason) = posting.shape_violation() {
            inspection.violations.push(IntegrityViolation::MalformedTransaction {
                transaction: transaction.id,
                kind: transaction.kind,
                reason,
            });
        }

        for entry in &posting.entries {
            match (transaction.kind, entry.direction) {
                (TransactionKind::Deposit, Direction::Credit) => {
                    totals.deposited = totals.deposited.plus(entry.amount);
                }
                (TransactionKind::Withdrawal, Direction::Debit) => {
                    totals.withdrawn = totals.withdrawn.plus(entry.amount);
                }
                _ => {}
            }
        }
    }

    let net = totals.net();
    let expected = totals.expected_net();
    if net != expected {
        inspection
            .violations
            .push(IntegrityViolation::TrialBalanceMismatch { net, expected });
    }

    inspection
}

/// Runs integrity audits against a store.
pub struct IntegrityAuditor<S: LedgerStore> {
    store: Arc<S>,
    metrics: SharedMetrics,
}

impl<S: LedgerStore> IntegrityAuditor<S> {
    /// Create a new auditor.
    pub fn new(store: Arc<S>, metrics: SharedMetrics) -> Self {
        Self { store, metrics }
    }

    /// Audit the whole ledger within one consistent snapshot.
    #[instrument(skip(self))]
    pub async fn check_integrity(&self) -> Result<IntegrityReport> {
        let mut snapshot = self.store.begin_read().await?;

        let accounts = snapshot.list_accounts().await?;
        let transactions = snapshot.list_transactions().await?;
        let entries = snapshot.list_entries().await?;

        let JournalInspection {
            totals,
            mut violations,
        } = inspect_journal(&accounts, &transactions, &entries);

        let mut negative_balances = Vec::new();
        for account in &accounts {
            let balance = BalanceCalculator::summarize(&mut snapshot, account.id).await?;
            if balance.balance.is_negative() {
                violations.push(IntegrityViolation::NegativeBalance {
                    account: account.id,
                    balance: balance.balance,
                });
                negative_balances.push(balance);
            }
        }

        let report = IntegrityReport {
            passed: violations.is_empty(),
            checked_at: Utc::now(),
            accounts_checked: accounts.len(),
            transactions_checked: transactions.len(),
            entries_checked: entries.len(),
            totals,
            net: totals.net(),
            negative_balances,
            violations,
        };

        self.metrics.audit_completed(report.passed);
        if report.passed {
            info!(
                accounts = report.accounts_checked,
                entries = report.entries_checked,
                credits = %totals.credits,
                debits = %totals.debits,
                "Integrity check passed"
            );
        } else {
            error!(
                violations = report.violations.len(),
                "Integrity check found violations"
            );
        }

        Ok(report)
    }
}
