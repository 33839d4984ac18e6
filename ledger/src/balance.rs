//! Derived account balances.
//!
//! There is no stored balance anywhere in the ledger. A balance is a fold
//! over the account's entries, recomputed on every read.

use balanced_common::{AccountId, Amount, Result, Timestamp, Total};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::journal::{Direction, LedgerEntry};
use crate::store::LedgerRead;

/// Aggregated credit and debit totals over a set of entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryTotals {
    /// Sum of credit amounts.
    pub credits: Total,
    /// Sum of debit amounts.
    pub debits: Total,
    /// Number of entries folded.
    pub entry_count: u64,
}

impl EntryTotals {
    /// Fold a sequence of entries.
    pub fn fold<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = &'a LedgerEntry>,
    {
        let mut totals = Self::default();
        for entry in entries {
            totals.record(entry);
        }
        totals
    }

    /// Add one entry to the totals.
    pub fn record(&mut self, entry: &LedgerEntry) {
        match entry.direction {
            Direction::Credit => self.credits = self.credits.plus(entry.amount),
            Direction::Debit => self.debits = self.debits.plus(entry.amount),
        }
        self.entry_count += 1;
    }

    /// Credits minus debits, at full width.
    pub fn net(&self) -> Total {
        self.credits.minus(self.debits)
    }

    /// Credits minus debits as an amount.
    ///
    /// Postings keep every balance within `Amount` range, so this only fails
    /// on a history written around the engines.
    pub fn balance(&self) -> Result<Amount> {
        self.net().to_amount()
    }
}

/// Account balance at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    /// Account identifier.
    pub account_id: AccountId,
    /// Derived balance (credits minus debits).
    pub balance: Amount,
    /// Sum of all credit entries.
    pub total_credits: Total,
    /// Sum of all debit entries.
    pub total_debits: Total,
    /// Number of entries the balance was derived from.
    pub entry_count: u64,
    /// When the balance was computed.
    pub computed_at: Timestamp,
}

impl AccountBalance {
    /// Build from aggregated totals.
    pub fn from_totals(account_id: AccountId, totals: EntryTotals) -> Result<Self> {
        Ok(Self {
            account_id,
            balance: totals.balance()?,
            total_credits: totals.credits,
            total_debits: totals.debits,
            entry_count: totals.entry_count,
            computed_at: Utc::now(),
        })
    }

    /// Check if the account can cover a debit of `amount`.
    pub fn has_sufficient_funds(&self, amount: Amount) -> bool {
        self.balance >= amount
    }
}

/// Stateless balance derivation over a store scope.
///
/// When the scope is a write scope holding the account's lock, the totals
/// include entries staged earlier in the same scope.
pub struct BalanceCalculator;

impl BalanceCalculator {
    /// Compute `SUM(credits) - SUM(debits)` for an account. Zero when it has no entries.
    pub async fn compute_balance<R>(scope: &mut R, account_id: AccountId) -> Result<Amount>
    where
        R: LedgerRead + ?Sized,
    {
        scope.entry_totals(account_id).await?.balance()
    }

    /// Compute the balance together with its credit and debit totals.
    pub async fn summarize<R>(scope: &mut R, account_id: AccountId) -> Result<AccountBalance>
    where
        R: LedgerRead + ?Sized,
    {
        let totals = scope.entry_totals(account_id).await?;
        AccountBalance::from_totals(account_id, totals)
    }
}
