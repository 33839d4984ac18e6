//! In-memory ledger store.
//!
//! Committed records live in append-only vectors behind a single
//! `parking_lot::RwLock`. Because nothing is ever updated or removed, a
//! consistent snapshot is just the lengths of those vectors at the moment the
//! snapshot was taken. Row locks are per-account `tokio` mutexes kept in a
//! `DashMap`, so waiting for a lock suspends the task instead of a thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use balanced_common::{duration_ms, AccountId, LedgerError, Result, TransactionId};

use crate::account::Account;
use crate::balance::EntryTotals;
use crate::journal::{LedgerEntry, Transaction};
use crate::store::{LedgerRead, LedgerStore, LedgerWrite};

/// Committed tables.
#[derive(Default)]
struct Tables {
    accounts: Vec<Account>,
    account_index: HashMap<AccountId, usize>,
    transactions: Vec<Transaction>,
    transaction_index: HashMap<TransactionId, usize>,
    entries: Vec<LedgerEntry>,
    entries_by_account: HashMap<AccountId, Vec<usize>>,
    entries_by_transaction: HashMap<TransactionId, Vec<usize>>,
}

/// Visible prefix of each table.
#[derive(Debug, Clone, Copy)]
struct Watermark {
    accounts: usize,
    transactions: usize,
    entries: usize,
}

impl Watermark {
    /// Everything committed so far, including later commits.
    const LATEST: Watermark = Watermark {
        accounts: usize::MAX,
        transactions: usize::MAX,
        entries: usize::MAX,
    };
}

impl Tables {
    fn watermark(&self) -> Watermark {
        Watermark {
            accounts: self.accounts.len(),
            transactions: self.transactions.len(),
            entries: self.entries.len(),
        }
    }

    fn account(&self, id: &AccountId, wm: Watermark) -> Option<Account> {
        self.account_index
            .get(id)
            .filter(|&&idx| idx < wm.accounts)
            .map(|&idx| self.accounts[idx].clone())
    }

    fn accounts(&self, wm: Watermark) -> Vec<Account> {
        self.accounts.iter().take(wm.accounts).cloned().collect()
    }

    fn transaction(&self, id: &TransactionId, wm: Watermark) -> Option<Transaction> {
        self.transaction_index
            .get(id)
            .filter(|&&idx| idx < wm.transactions)
            .map(|&idx| self.transactions[idx].clone())
    }

    fn transactions(&self, wm: Watermark) -> Vec<Transaction> {
        self.transactions.iter().take(wm.transactions).cloned().collect()
    }

    fn indexed_entries(&self, indices: Option<&Vec<usize>>, wm: Watermark) -> Vec<LedgerEntry> {
        indices
            .map(|indices| {
                indices
                    .iter()
                    .filter(|&&idx| idx < wm.entries)
                    .map(|&idx| self.entries[idx].clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn account_entries(&self, id: &AccountId, wm: Watermark) -> Vec<LedgerEntry> {
        self.indexed_entries(self.entries_by_account.get(id), wm)
    }

    fn transaction_entries(&self, id: &TransactionId, wm: Watermark) -> Vec<LedgerEntry> {
        self.indexed_entries(self.entries_by_transaction.get(id), wm)
    }

    fn entries(&self, wm: Watermark) -> Vec<LedgerEntry> {
        self.entries.iter().take(wm.entries).cloned().collect()
    }

    fn entry_totals(&self, id: &AccountId, wm: Watermark) -> EntryTotals {
        let mut totals = EntryTotals::default();
        if let Some(indices) = self.entries_by_account.get(id) {
            for &idx in indices.iter().filter(|&&idx| idx < wm.entries) {
                totals.record(&self.entries[idx]);
            }
        }
        totals
    }

    /// Apply a staged batch. Either every record is appended or none is.
    fn apply(&mut self, staged: Staged) -> Result<()> {
        for entry in &staged.entries {
            let account_known = self.account_index.contains_key(&entry.account_id)
                || staged.accounts.iter().any(|a| a.id == entry.account_id);
            if !account_known {
                return Err(LedgerError::Storage(format!(
                    "entry {} references missing account {}",
                    entry.id, entry.account_id
                )));
            }

            let transaction_known = self.transaction_index.contains_key(&entry.transaction_id)
                || staged.transactions.iter().any(|t| t.id == entry.transaction_id);
            if !transaction_known {
                return Err(LedgerError::Storage(format!(
                    "entry {} references missing transaction {}",
                    entry.id, entry.transaction_id
                )));
            }
        }

        for account in staged.accounts {
            self.account_index.insert(account.id, self.accounts.len());
            self.accounts.push(account);
        }

        for transaction in staged.transactions {
            self.transaction_index
                .insert(transaction.id, self.transactions.len());
            self.transactions.push(transaction);
        }

        for entry in staged.entries {
            let idx = self.entries.len();
            self.entries_by_account
                .entry(entry.account_id)
                .or_default()
                .push(idx);
            self.entries_by_transaction
                .entry(entry.transaction_id)
                .or_default()
                .push(idx);
            self.entries.push(entry);
        }

        Ok(())
    }
}

/// Records written by a scope but not yet committed.
#[derive(Default)]
struct Staged {
    accounts: Vec<Account>,
    transactions: Vec<Transaction>,
    entries: Vec<LedgerEntry>,
}

impl Staged {
    fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.transactions.is_empty() && self.entries.is_empty()
    }
}

struct Shared {
    tables: RwLock<Tables>,
    row_locks: DashMap<AccountId, Arc<Mutex<()>>>,
    next_sequence: AtomicU64,
    failing_commits: AtomicU32,
}

impl Shared {
    fn row_lock(&self, id: AccountId) -> Arc<Mutex<()>> {
        self.row_locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// In-memory store with row locking and atomic commits.
///
/// Cloning is cheap and every clone shares the same tables.
#[derive(Clone)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: RwLock::new(Tables::default()),
                row_locks: DashMap::new(),
                next_sequence: AtomicU64::new(0),
                failing_commits: AtomicU32::new(0),
            }),
        }
    }

    /// Make the next `count` commits fail with a storage error after all
    /// records have been staged.
    pub fn fail_next_commits(&self, count: u32) {
        self.shared.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Number of committed entries.
    pub fn entry_count(&self) -> usize {
        self.shared.tables.read().entries.len()
    }

    /// Number of committed transactions.
    pub fn transaction_count(&self) -> usize {
        self.shared.tables.read().transactions.len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    type Reader = MemoryReader;
    type Writer = MemoryWriter;

    async fn begin_read(&self) -> Result<MemoryReader> {
        let watermark = self.shared.tables.read().watermark();
        Ok(MemoryReader {
            shared: self.shared.clone(),
            watermark,
        })
    }

    async fn begin_write(&self) -> Result<MemoryWriter> {
        Ok(MemoryWriter {
            shared: self.shared.clone(),
            guards: HashMap::new(),
            staged: Staged::default(),
        })
    }
}

/// Snapshot scope over the in-memory store.
pub struct MemoryReader {
    shared: Arc<Shared>,
    watermark: Watermark,
}

#[async_trait]
impl LedgerRead for MemoryReader {
    async fn fetch_account(&mut self, id: AccountId) -> Result<Option<Account>> {
        Ok(self.shared.tables.read().account(&id, self.watermark))
    }

    async fn list_accounts(&mut self) -> Result<Vec<Account>> {
        Ok(self.shared.tables.read().accounts(self.watermark))
    }

    async fn entry_totals(&mut self, account_id: AccountId) -> Result<EntryTotals> {
        Ok(self
            .shared
            .tables
            .read()
            .entry_totals(&account_id, self.watermark))
    }

    async fn account_entries(&mut self, account_id: AccountId) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .shared
            .tables
            .read()
            .account_entries(&account_id, self.watermark))
    }

    async fn fetch_transaction(&mut self, id: TransactionId) -> Result<Option<Transaction>> {
        Ok(self.shared.tables.read().transaction(&id, self.watermark))
    }

    async fn transaction_entries(&mut self, id: TransactionId) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .shared
            .tables
            .read()
            .transaction_entries(&id, self.watermark))
    }

    async fn list_transactions(&mut self) -> Result<Vec<Transaction>> {
        Ok(self.shared.tables.read().transactions(self.watermark))
    }

    async fn list_entries(&mut self) -> Result<Vec<LedgerEntry>> {
        Ok(self.shared.tables.read().entries(self.watermark))
    }
}

/// Write scope over the in-memory store.
///
/// Reads see everything committed so far plus this scope's staged records.
pub struct MemoryWriter {
    shared: Arc<Shared>,
    guards: HashMap<AccountId, OwnedMutexGuard<()>>,
    staged: Staged,
}

impl MemoryWriter {
    fn visible_account(&self, id: &AccountId) -> Option<Account> {
        self.shared
            .tables
            .read()
            .account(id, Watermark::LATEST)
            .or_else(|| self.staged.accounts.iter().find(|a| a.id == *id).cloned())
    }

    fn staged_entries<'a>(
        &'a self,
        filter: impl Fn(&LedgerEntry) -> bool + 'a,
    ) -> impl Iterator<Item = LedgerEntry> + 'a {
        self.staged
            .entries
            .iter()
            .filter(move |e| filter(*e))
            .cloned()
    }
}

#[async_trait]
impl LedgerRead for MemoryWriter {
    async fn fetch_account(&mut self, id: AccountId) -> Result<Option<Account>> {
        Ok(self.visible_account(&id))
    }

    async fn list_accounts(&mut self) -> Result<Vec<Account>> {
        let mut accounts = self.shared.tables.read().accounts(Watermark::LATEST);
        accounts.extend(self.staged.accounts.iter().cloned());
        Ok(accounts)
    }

    async fn entry_totals(&mut self, account_id: AccountId) -> Result<EntryTotals> {
        let mut totals = self
            .shared
            .tables
            .read()
            .entry_totals(&account_id, Watermark::LATEST);
        for entry in self
            .staged
            .entries
            .iter()
            .filter(|e| e.account_id == account_id)
        {
            totals.record(entry);
        }
        Ok(totals)
    }

    async fn account_entries(&mut self, account_id: AccountId) -> Result<Vec<LedgerEntry>> {
        let mut entries = self
            .shared
            .tables
            .read()
            .account_entries(&account_id, Watermark::LATEST);
        entries.extend(self.staged_entries(move |e| e.account_id == account_id));
        Ok(entries)
    }

    async fn fetch_transaction(&mut self, id: TransactionId) -> Result<Option<Transaction>> {
        let committed = self.shared.tables.read().transaction(&id, Watermark::LATEST);
        Ok(committed.or_else(|| {
            self.staged
                .transactions
                .iter()
                .find(|t| t.id == id)
                .cloned()
        }))
    }

    async fn transaction_entries(&mut self, id: TransactionId) -> Result<Vec<LedgerEntry>> {
        let mut entries = self
            .shared
            .tables
            .read()
            .transaction_entries(&id, Watermark::LATEST);
        entries.extend(self.staged_entries(move |e| e.transaction_id == id));
        Ok(entries)
    }

    async fn list_transactions(&mut self) -> Result<Vec<Transaction>> {
        let mut transactions = self.shared.tables.read().transactions(Watermark::LATEST);
        transactions.extend(self.staged.transactions.iter().cloned());
        Ok(transactions)
    }

    async fn list_entries(&mut self) -> Result<Vec<LedgerEntry>> {
        let mut entries = self.shared.tables.read().entries(Watermark::LATEST);
        entries.extend(self.staged.entries.iter().cloned());
        Ok(entries)
    }
}

#[async_trait]
impl LedgerWrite for MemoryWriter {
    async fn lock_account(&mut self, id: AccountId, wait: Duration) -> Result<Account> {
        let account = self
            .visible_account(&id)
            .ok_or(LedgerError::AccountNotFound(id))?;

        if self.guards.contains_key(&id) {
            return Ok(account);
        }

        let row_lock = self.shared.row_lock(id);
        match tokio::time::timeout(wait, row_lock.lock_owned()).await {
            Ok(guard) => {
                debug!(account = %id, "Row lock acquired");
                self.guards.insert(id, guard);
                Ok(account)
            }
            Err(_) => {
                warn!(account = %id, wait_ms = duration_ms(wait), "Row lock wait timed out");
                Err(LedgerError::LockTimeout {
                    account: id,
                    waited_ms: duration_ms(wait),
                })
            }
        }
    }

    async fn insert_account(&mut self, account: &Account) -> Result<()> {
        self.staged.accounts.push(account.clone());
        Ok(())
    }

    async fn insert_transaction(&mut self, transaction: &Transaction) -> Result<()> {
        self.staged.transactions.push(transaction.clone());
        Ok(())
    }

    async fn insert_entry(&mut self, mut entry: LedgerEntry) -> Result<LedgerEntry> {
        entry.sequence = self.shared.next_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.staged.entries.push(entry.clone());
        Ok(entry)
    }

    async fn commit(mut self) -> Result<()> {
        let staged = std::mem::take(&mut self.staged);
        if staged.is_empty() {
            return Ok(());
        }

        if self.shared.take_injected_failure() {
            warn!(
                entries = staged.entries.len(),
                "Injected commit failure, discarding staged records"
            );
            return Err(LedgerError::Storage("injected commit failure".to_string()));
        }

        let applied = self.shared.tables.write().apply(staged);
        // Row locks are released when `self.guards` drops here.
        applied
    }

    async fn rollback(mut self) -> Result<()> {
        let staged = std::mem::take(&mut self.staged);
        debug!(
            entries = staged.entries.len(),
            locks = self.guards.len(),
            "Scope rolled back"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountType;
    use balanced_common::Amount;

    async fn seeded_store() -> (InMemoryStore, Account) {
        let store = InMemoryStore::new();
        let account = Account::new("user_001", AccountType::Checking);
        let mut scope = store.begin_write().await.unwrap();
        scope.insert_account(&account).await.unwrap();
        scope.commit().await.unwrap();
        (store, account)
    }

    #[tokio::test]
    async fn test_staged_records_invisible_until_commit() {
        let (store, account) = seeded_store().await;

        let mut writer = store.begin_write().await.unwrap();
        let tx = Transaction::new(crate::journal::TransactionKind::Deposit, None);
        writer.insert_transaction(&tx).await.unwrap();
        writer
            .insert_entry(LedgerEntry::credit(tx.id, account.id, Amount::from_minor(500)).unwrap())
            .await
            .unwrap();

        // Read-your-own-writes inside the scope.
        let own = writer.entry_totals(account.id).await.unwrap();
        assert_eq!(own.balance().unwrap(), Amount::from_minor(500));

        // Nothing leaks to other scopes before commit.
        let mut reader = store.begin_read().await.unwrap();
        assert_eq!(reader.entry_totals(account.id).await.unwrap().entry_count, 0);

        writer.commit().await.unwrap();
        let mut reader = store.begin_read().await.unwrap();
        assert_eq!(reader.entry_totals(account.id).await.unwrap().entry_count, 1);
    }

    #[tokio::test]
    async fn test_snapshot_ignores_later_commits() {
        let (store, account) = seeded_store().await;
        let mut snapshot = store.begin_read().await.unwrap();

        let mut writer = store.begin_write().await.unwrap();
        let tx = Transaction::new(crate::journal::TransactionKind::Deposit, None);
        writer.insert_transaction(&tx).await.unwrap();
        writer
            .insert_entry(LedgerEntry::credit(tx.id, account.id, Amount::from_minor(100)).unwrap())
            .await
            .unwrap();
        writer.commit().await.unwrap();

        assert!(snapshot.account_entries(account.id).await.unwrap().is_empty());
        assert!(snapshot.list_transactions().await.unwrap().is_empty());
        assert_eq!(snapshot.list_accounts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lock_times_out_while_held() {
        let (store, account) = seeded_store().await;

        let mut holder = store.begin_write().await.unwrap();
        holder
            .lock_account(account.id, Duration::from_millis(50))
            .await
            .unwrap();

        let mut waiter = store.begin_write().await.unwrap();
        let err = waiter
            .lock_account(account.id, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::LockTimeout { .. }));

        holder.rollback().await.unwrap();
        waiter
            .lock_account(account.id, Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_relocking_same_account_is_reentrant() {
        let (store, account) = seeded_store().await;
        let mut scope = store.begin_write().await.unwrap();
        scope
            .lock_account(account.id, Duration::from_millis(50))
            .await
            .unwrap();
        scope
            .lock_account(account.id, Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_lock_unknown_account() {
        let store = InMemoryStore::new();
        let mut scope = store.begin_write().await.unwrap();
        let missing = AccountId::new();
        let err = scope
            .lock_account(missing, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::AccountNotFound(missing));
    }

    #[tokio::test]
    async fn test_commit_rejects_dangling_references() {
        let (store, account) = seeded_store().await;
        let mut scope = store.begin_write().await.unwrap();
        scope
            .insert_entry(
                LedgerEntry::credit(TransactionId::new(), account.id, Amount::from_minor(1))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(matches!(
            scope.commit().await,
            Err(LedgerError::Storage(_))
        ));
        assert_eq!(store.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_injected_failure_discards_everything() {
        let (store, account) = seeded_store().await;
        store.fail_next_commits(1);

        let mut scope = store.begin_write().await.unwrap();
        let tx = Transaction::new(crate::journal::TransactionKind::Deposit, None);
        scope.insert_transaction(&tx).await.unwrap();
        scope
            .insert_entry(LedgerEntry::credit(tx.id, account.id, Amount::from_minor(1)).unwrap())
            .await
            .unwrap();

        assert!(scope.commit().await.is_err());
        assert_eq!(store.entry_count(), 0);
        assert_eq!(store.transaction_count(), 0);
    }

    #[tokio::test]
    async fn test_sequences_increase() {
        let (store, account) = seeded_store().await;
        let mut scope = store.begin_write().await.unwrap();
        let tx = Transaction::new(crate::journal::TransactionKind::Deposit, None);
        scope.insert_transaction(&tx).await.unwrap();
        let first = scope
            .insert_entry(LedgerEntry::credit(tx.id, account.id, Amount::from_minor(1)).unwrap())
            .await
            .unwrap();
        let second = scope
            .insert_entry(LedgerEntry::credit(tx.id, account.id, Amount::from_minor(2)).unwrap())
            .await
            .unwrap();
        assert!(first.sequence > 0);
        assert!(second.sequence > first.sequence);
    }
}
