//! Two-sided atomic transfers between accounts.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use balanced_common::{AccountId, Amount, LedgerError, Result};

use crate::balance::BalanceCalculator;
use crate::journal::{resolve_memo, LedgerEntry, Posting, Transaction, TransactionKind};
use crate::metrics::SharedMetrics;
use crate::registry::AccountRegistry;
use crate::store::{finish_scope, LedgerStore, LedgerWrite};

/// Memo used when a transfer request carries none.
pub const DEFAULT_TRANSFER_MEMO: &str = "Internal Transfer";

/// Request to move funds between two accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Account debited.
    pub source: AccountId,
    /// Account credited.
    pub destination: AccountId,
    /// Amount moved, must be positive.
    pub amount: Amount,
    /// Optional memo.
    pub memo: Option<String>,
}

impl TransferRequest {
    /// Create a transfer request without a memo.
    pub fn new(source: AccountId, destination: AccountId, amount: Amount) -> Self {
        Self {
            source,
            destination,
            amount,
            memo: None,
        }
    }

    /// Attach a memo.
    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    /// Check the preconditions that need no storage access.
    pub fn validate(&self) -> Result<()> {
        if !self.amount.is_positive() {
            return Err(LedgerError::InvalidAmount(format!(
                "transfer amount must be positive, got {}",
                self.amount
            )));
        }
        if self.source == self.destination {
            return Err(LedgerError::SelfTransfer(self.source));
        }
        Ok(())
    }
}

/// Order in which two accounts must be locked.
///
/// Every caller locks the smaller identifier first, so two transfers over
/// the same pair in opposite directions queue instead of deadlocking.
pub fn lock_order(a: AccountId, b: AccountId) -> (AccountId, AccountId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Orchestrates transfers.
pub struct TransferEngine<S: LedgerStore> {
    store: Arc<S>,
    registry: AccountRegistry<S>,
    metrics: SharedMetrics,
}

impl<S: LedgerStore> TransferEngine<S> {
    /// Create a new transfer engine.
    pub fn new(store: Arc<S>, registry: AccountRegistry<S>, metrics: SharedMetrics) -> Self {
        Self {
            store,
            registry,
            metrics,
        }
    }

    /// Move `request.amount` from source to destination in one atomic scope.
    ///
    /// On any failure the scope is rolled back before the error is returned,
    /// so neither the transaction nor either entry is persisted.
    #[instrument(
        skip(self, request),
        fields(source = %request.source, destination = %request.destination, amount = %request.amount)
    )]
    pub async fn transfer(&self, request: TransferRequest) -> Result<Posting> {
        request.validate()?;
        let memo = resolve_memo(request.memo.as_deref(), DEFAULT_TRANSFER_MEMO)?;

        let result = self.execute(&request, memo).await;
        match &result {
            Ok(posting) => {
                self.metrics.transfer_committed();
                info!(transaction = %posting.id(), "Transfer committed");
            }
            Err(err) => {
                if matches!(err, LedgerError::Storage(_)) {
                    error!(error = %err, "Transfer failed in storage");
                }
                self.metrics.record_failure(err);
            }
        }
        result
    }

    async fn execute(&self, request: &TransferRequest, memo: String) -> Result<Posting> {
        let mut scope = self.store.begin_write().await?;
        let outcome = self.post(&mut scope, request, memo).await;
        finish_scope(scope, outcome).await
    }

    async fn post(
        &self,
        scope: &mut S::Writer,
        request: &TransferRequest,
        memo: String,
    ) -> Result<Posting> {
        let (first, second) = lock_order(request.source, request.destination);
        self.registry.lock_for_update(scope, first).await?;
        self.registry.lock_for_update(scope, second).await?;

        let available = BalanceCalculator::compute_balance(scope, request.source).await?;
        if available.try_sub(request.amount)?.is_negative() {
            warn!(
                account = %request.source,
                required = %request.amount,
                available = %available,
                "Transfer rejected: insufficient funds"
            );
            return Err(LedgerError::InsufficientFunds {
                account: request.source,
                required: request.amount,
                available,
            });
        }

        // The destination balance must stay representable.
        BalanceCalculator::compute_balance(scope, request.destination)
            .await?
            .try_add(request.amount)?;

        let transaction = Transaction::new(TransactionKind::Transfer, Some(memo));
        scope.insert_transaction(&transaction).await?;

        let debit = LedgerEntry::debit(transaction.id, request.source, request.amount)?;
        let credit = LedgerEntry::credit(transaction.id, request.destination, request.amount)?;

        let mut posting = Posting::new(transaction);
        posting.add_entry(scope.insert_entry(debit).await?);
        posting.add_entry(scope.insert_entry(credit).await?);
        Ok(posting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountType;
    use crate::journal::Direction;
    use crate::metrics::Metrics;
    use crate::store::{InMemoryStore, LedgerRead};
    use std::time::Duration;

    struct Fixture {
        store: Arc<InMemoryStore>,
        registry: AccountRegistry<InMemoryStore>,
        engine: TransferEngine<InMemoryStore>,
        metrics: SharedMetrics,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let registry = AccountRegistry::new(store.clone(), Duration::from_millis(200));
        let metrics: SharedMetrics = Arc::new(Metrics::new());
        let engine = TransferEngine::new(store.clone(), registry.clone(), metrics.clone());
        Fixture {
            store,
            registry,
            engine,
            metrics,
        }
    }

    async fn fund(store: &InMemoryStore, account: AccountId, minor: i64) {
        let mut scope = store.begin_write().await.unwrap();
        let tx = Transaction::new(TransactionKind::Deposit, None);
        scope.insert_transaction(&tx).await.unwrap();
        scope
            .insert_entry(LedgerEntry::credit(tx.id, account, Amount::from_minor(minor)).unwrap())
            .await
            .unwrap();
        scope.commit().await.unwrap();
    }

    async fn balance(store: &InMemoryStore, account: AccountId) -> Amount {
        let mut snapshot = store.begin_read().await.unwrap();
        BalanceCalculator::compute_balance(&mut snapshot, account)
            .await
            .unwrap()
    }

    #[test]
    fn test_lock_order_is_symmetric() {
        let a = AccountId::new();
        let b = AccountId::new();
        assert_eq!(lock_order(a, b), lock_order(b, a));
        assert!(lock_order(a, b).0 <= lock_order(a, b).1);
    }

    #[test]
    fn test_request_validation() {
        let a = AccountId::new();
        let b = AccountId::new();

        assert!(TransferRequest::new(a, b, Amount::from_minor(1)).validate().is_ok());
        assert!(matches!(
            TransferRequest::new(a, b, Amount::ZERO).validate(),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            TransferRequest::new(a, b, Amount::from_minor(-10)).validate(),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert_eq!(
            TransferRequest::new(a, a, Amount::from_minor(1)).validate(),
            Err(LedgerError::SelfTransfer(a))
        );
    }

    #[tokio::test]
    async fn test_transfer_writes_two_linked_entries() {
        let f = fixture();
        let x = f.registry.create_account("x", AccountType::Checking).await.unwrap();
        let y = f.registry.create_account("y", AccountType::Savings).await.unwrap();
        fund(&f.store, x.id, 10_000).await;

        let posting = f
            .engine
            .transfer(TransferRequest::new(x.id, y.id, Amount::from_minor(4_000)))
            .await
            .unwrap();

        assert!(posting.is_well_formed());
        assert_eq!(posting.transaction.memo.as_deref(), Some(DEFAULT_TRANSFER_MEMO));
        assert_eq!(posting.entries[0].direction, Direction::Debit);
        assert_eq!(posting.entries[0].account_id, x.id);
        assert_eq!(posting.entries[1].direction, Direction::Credit);
        assert_eq!(posting.entries[1].account_id, y.id);

        assert_eq!(balance(&f.store, x.id).await, Amount::from_minor(6_000));
        assert_eq!(balance(&f.store, y.id).await, Amount::from_minor(4_000));

        let mut snapshot = f.store.begin_read().await.unwrap();
        let stored = snapshot.transaction_entries(posting.id()).await.unwrap();
        assert_eq!(stored, posting.entries);
        assert_eq!(f.metrics.snapshot().transfers_committed, 1);
    }

    #[tokio::test]
    async fn test_transfer_can_drain_to_zero() {
        let f = fixture();
        let x = f.registry.create_account("x", AccountType::Checking).await.unwrap();
        let y = f.registry.create_account("y", AccountType::Checking).await.unwrap();
        fund(&f.store, x.id, 500).await;

        f.engine
            .transfer(TransferRequest::new(x.id, y.id, Amount::from_minor(500)))
            .await
            .unwrap();
        assert_eq!(balance(&f.store, x.id).await, Amount::ZERO);
    }

    #[tokio::test]
    async fn test_insufficient_funds_rolls_back() {
        let f = fixture();
        let x = f.registry.create_account("x", AccountType::Checking).await.unwrap();
        let y = f.registry.create_account("y", AccountType::Checking).await.unwrap();
        fund(&f.store, x.id, 6_000).await;
        let transactions_before = f.store.transaction_count();

        let err = f
            .engine
            .transfer(TransferRequest::new(x.id, y.id, Amount::from_minor(10_000)))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            LedgerError::InsufficientFunds {
                account: x.id,
                required: Amount::from_minor(10_000),
                available: Amount::from_minor(6_000),
            }
        );
        assert_eq!(f.store.transaction_count(), transactions_before);
        assert_eq!(balance(&f.store, y.id).await, Amount::ZERO);
        assert_eq!(f.metrics.snapshot().insufficient_funds, 1);
    }

    #[tokio::test]
    async fn test_unknown_destination() {
        let f = fixture();
        let x = f.registry.create_account("x", AccountType::Checking).await.unwrap();
        fund(&f.store, x.id, 100).await;
        let missing = AccountId::new();

        let err = f
            .engine
            .transfer(TransferRequest::new(x.id, missing, Amount::from_minor(50)))
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::AccountNotFound(missing));
        assert_eq!(balance(&f.store, x.id).await, Amount::from_minor(100));
    }

    #[tokio::test]
    async fn test_self_transfer_rejected_before_storage() {
        let f = fixture();
        // The account does not even exist: validation runs first.
        let a = AccountId::new();
        let err = f
            .engine
            .transfer(TransferRequest::new(a, a, Amount::from_minor(1)))
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::SelfTransfer(a));
    }

    #[tokio::test]
    async fn test_custom_memo() {
        let f = fixture();
        let x = f.registry.create_account("x", AccountType::Checking).await.unwrap();
        let y = f.registry.create_account("y", AccountType::Checking).await.unwrap();
        fund(&f.store, x.id, 100).await;

        let posting = f
            .engine
            .transfer(TransferRequest::new(x.id, y.id, Amount::from_minor(25)).with_memo("rent"))
            .await
            .unwrap();
        assert_eq!(posting.transaction.memo.as_deref(), Some("rent"));
    }
}
