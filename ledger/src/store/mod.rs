//! Storage abstraction for the ledger.
//!
//! The core never talks to a database directly. It opens scopes on a
//! [`LedgerStore`]:
//!
//! - a **read scope** ([`LedgerRead`]) sees a consistent snapshot and never
//!   takes locks;
//! - a **write scope** ([`LedgerWrite`]) is one all-or-nothing atomic unit. It
//!   can take exclusive row locks on accounts with a bounded wait, stage new
//!   records, read its own staged writes, and then either commit everything
//!   or roll everything back. Dropping a write scope without committing rolls
//!   it back.
//!
//! There is deliberately no update or delete operation anywhere in this
//! surface: accounts, transactions and entries are append-only.

use std::time::Duration;

use async_trait::async_trait;
use balanced_common::{AccountId, Result, TransactionId};
use tracing::error;

use crate::account::Account;
use crate::balance::EntryTotals;
use crate::journal::{LedgerEntry, Transaction};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

/// Read operations available inside any scope.
#[async_trait]
pub trait LedgerRead: Send {
    /// Look up an account.
    async fn fetch_account(&mut self, id: AccountId) -> Result<Option<Account>>;

    /// All accounts in creation order.
    async fn list_accounts(&mut self) -> Result<Vec<Account>>;

    /// Credit and debit totals for one account (store-level indexed sum).
    async fn entry_totals(&mut self, account_id: AccountId) -> Result<EntryTotals>;

    /// Entries of one account in ascending sequence order.
    async fn account_entries(&mut self, account_id: AccountId) -> Result<Vec<LedgerEntry>>;

    /// Look up a transaction header.
    async fn fetch_transaction(&mut self, id: TransactionId) -> Result<Option<Transaction>>;

    /// Entries linked to one transaction in ascending sequence order.
    async fn transaction_entries(&mut self, id: TransactionId) -> Result<Vec<LedgerEntry>>;

    /// All transactions in creation order.
    async fn list_transactions(&mut self) -> Result<Vec<Transaction>>;

    /// All entries in ascending sequence order.
    async fn list_entries(&mut self) -> Result<Vec<LedgerEntry>>;
}

/// A single atomic write unit.
#[async_trait]
pub trait LedgerWrite: LedgerRead {
    /// Take an exclusive lock on an account row until the scope ends.
    ///
    /// Blocks while another scope holds the lock, for at most `wait`, then
    /// fails with `LockTimeout`. Fails with `AccountNotFound` for unknown
    /// accounts. Locking an account the scope already holds is a no-op.
    async fn lock_account(&mut self, id: AccountId, wait: Duration) -> Result<Account>;

    /// Stage a new account.
    async fn insert_account(&mut self, account: &Account) -> Result<()>;

    /// Stage a new transaction header.
    async fn insert_transaction(&mut self, transaction: &Transaction) -> Result<()>;

    /// Stage a new entry and return it with its assigned sequence number.
    async fn insert_entry(&mut self, entry: LedgerEntry) -> Result<LedgerEntry>;

    /// Make every staged record durable, atomically, and release locks.
    async fn commit(self) -> Result<()>;

    /// Discard every staged record and release locks.
    async fn rollback(self) -> Result<()>;
}

/// A durable store that hands out read and write scopes.
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    /// Consistent read-only snapshot scope.
    type Reader: LedgerRead;
    /// Atomic read-write scope.
    type Writer: LedgerWrite;

    /// Open a snapshot scope.
    async fn begin_read(&self) -> Result<Self::Reader>;

    /// Open an atomic write scope.
    async fn begin_write(&self) -> Result<Self::Writer>;
}

/// Commit the scope if `outcome` succeeded, otherwise roll it back and
/// return the original error.
///
/// A failed rollback is logged; the error that caused it is what the caller
/// sees.
pub async fn finish_scope<W, T>(scope: W, outcome: Result<T>) -> Result<T>
where
    W: LedgerWrite,
{
    match outcome {
        Ok(value) => {
            scope.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = scope.rollback().await {
                error!(
                    error = %rollback_err,
                    cause = %err,
                    "Rollback failed"
                );
            }
            Err(err)
        }
    }
}
