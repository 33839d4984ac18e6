//! Single-sided postings of external funds.
//!
//! A deposit credits one account. A withdrawal debits one account. The other
//! leg of each is outside the ledger and is not persisted.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use balanced_common::{AccountId, Amount, LedgerError, Result};

use crate::balance::BalanceCalculator;
use crate::journal::{resolve_memo, LedgerEntry, Posting, Transaction, TransactionKind};
use crate::metrics::SharedMetrics;
use crate::registry::AccountRegistry;
use crate::store::{finish_scope, LedgerStore, LedgerWrite};

/// Memo used when a deposit request carries none.
pub const DEFAULT_DEPOSIT_MEMO: &str = "Cash Deposit";

/// Memo used when a withdrawal request carries none.
pub const DEFAULT_WITHDRAWAL_MEMO: &str = "Cash Withdrawal";

/// Request to move external funds into or out of one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalRequest {
    /// Account credited (deposit) or debited (withdrawal).
    pub account: AccountId,
    /// Amount, must be positive.
    pub amount: Amount,
    /// Optional memo.
    pub memo: Option<String>,
}

impl ExternalRequest {
    /// Create a request without a memo.
    pub fn new(account: AccountId, amount: Amount) -> Self {
        Self {
            account,
            amount,
            memo: None,
        }
    }

    /// Attach a memo.
    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    fn validate(&self, kind: TransactionKind) -> Result<()> {
        if !self.amount.is_positive() {
            return Err(LedgerError::InvalidAmount(format!(
                "{} amount must be positive, got {}",
                kind.as_str().to_lowercase(),
                self.amount
            )));
        }
        Ok(())
    }
}

/// Orchestrates deposits.
pub struct DepositEngine<S: LedgerStore> {
    store: Arc<S>,
    registry: AccountRegistry<S>,
    metrics: SharedMetrics,
}

impl<S: LedgerStore> DepositEngine<S> {
    /// Create a new deposit engine.
    pub fn new(store: Arc<S>, registry: AccountRegistry<S>, metrics: SharedMetrics) -> Self {
        Self {
            store,
            registry,
            metrics,
        }
    }

    /// Credit `request.amount` to the account in one atomic scope.
    ///
    /// No overdraft check applies; a deposit only raises the balance.
    #[instrument(skip(self, request), fields(account = %request.account, amount = %request.amount))]
    pub async fn deposit(&self, request: ExternalRequest) -> Result<Posting> {
        request.validate(TransactionKind::Deposit)?;
        let memo = resolve_memo(request.memo.as_deref(), DEFAULT_DEPOSIT_MEMO)?;

        let result = self.execute(&request, memo).await;
        match &result {
            Ok(posting) => {
                self.metrics.deposit_committed();
                info!(transaction = %posting.id(), "Deposit committed");
            }
            Err(err) => {
                if matches!(err, LedgerError::Storage(_)) {
                    error!(error = %err, "Deposit failed in storage");
                }
                self.metrics.record_failure(err);
            }
        }
        result
    }

    async fn execute(&self, request: &ExternalRequest, memo: String) -> Result<Posting> {
        let mut scope = self.store.begin_write().await?;
        let outcome = self.post(&mut scope, request, memo).await;
        finish_scope(scope, outcome).await
    }

    async fn post(
        &self,
        scope: &mut S::Writer,
        request: &ExternalRequest,
        memo: String,
    ) -> Result<Posting> {
        self.registry.lock_for_update(scope, request.account).await?;

        BalanceCalculator::compute_balance(scope, request.account)
            .await?
            .try_add(request.amount)?;

        let transaction = Transaction::new(TransactionKind::Deposit, Some(memo));
        scope.insert_transaction(&transaction).await?;
        let credit = LedgerEntry::credit(transaction.id, request.account, request.amount)?;

        let mut posting = Posting::new(transaction);
        posting.add_entry(scope.insert_entry(credit).await?);
        Ok(posting)
    }
}

/// Orchestrates withdrawals.
pub struct WithdrawalEngine<S: LedgerStore> {
    store: Arc<S>,
    registry: AccountRegistry<S>,
    metrics: SharedMetrics,
}

impl<S: LedgerStore> WithdrawalEngine<S> {
    /// Create a new withdrawal engine.
    pub fn new(store: Arc<S>, registry: AccountRegistry<S>, metrics: SharedMetrics) -> Self {
        Self {
            store,
            registry,
            metrics,
        }
    }

    /// Debit `request.amount` from the account in one atomic scope.
    ///
    /// Fails with `InsufficientFunds` and persists nothing if the balance
    /// would go negative.
    #[instrument(skip(self, request), fields(account = %request.account, amount = %request.amount))]
    pub async fn withdraw(&self, request: ExternalRequest) -> Result<Posting> {
        request.validate(TransactionKind::Withdrawal)?;
        let memo = resolve_memo(request.memo.as_deref(), DEFAULT_WITHDRAWAL_MEMO)?;

        let result = self.execute(&request, memo).await;
        match &result {
            Ok(posting) => {
                self.metrics.withdrawal_committed();
                info!(transaction = %posting.id(), "Withdrawal committed");
            }
            Err(err) => {
                if matches!(err, LedgerError::Storage(_)) {
                    error!(error = %err, "Withdrawal failed in storage");
                }
                self.metrics.record_failure(err);
            }
        }
        result
    }

    async fn execute(&self, request: &ExternalRequest, memo: String) -> Result<Posting> {
        let mut scope = self.store.begin_write().await?;
        let outcome = self.post(&mut scope, request, memo).await;
        finish_scope(scope, outcome).await
    }

    async fn post(
        &self,
        scope: &mut S::Writer,
        request: &ExternalRequest,
        memo: String,
    ) -> Result<Posting> {
        self.registry.lock_for_update(scope, request.account).await?;

        let available = BalanceCalculator::compute_balance(scope, request.account).await?;
        if available.try_sub(request.amount)?.is_negative() {
            warn!(
                account = %request.account,
                required = %request.amount,
                available = %available,
                "Withdrawal rejected: insufficient funds"
            );
            return Err(LedgerError::InsufficientFunds {
                account: request.account,
                required: request.amount,
                available,
            });
        }

        let transaction = Transaction::new(TransactionKind::Withdrawal, Some(memo));
        scope.insert_transaction(&transaction).await?;
        let debit = LedgerEntry::debit(transaction.id, request.account, request.amount)?;

        let mut posting = Posting::new(transaction);
        posting.add_entry(scope.insert_entry(debit).await?);
        Ok(posting)
    }
}
