//! Ledger engine: the operation surface a service layer binds to.

use std::sync::Arc;

use tracing::{info, instrument};

use balanced_common::{AccountId, Amount, LedgerError, Result, TransactionId};

use crate::account::{Account, AccountType};
use crate::audit::{IntegrityAuditor, IntegrityReport};
use crate::balance::{AccountBalance, BalanceCalculator};
use crate::config::LedgerConfig;
use crate::deposit::{DepositEngine, ExternalRequest, WithdrawalEngine};
use crate::journal::{LedgerEntry, Posting};
use crate::metrics::{Metrics, SharedMetrics};
use crate::registry::AccountRegistry;
use crate::store::{LedgerRead, LedgerStore};
use crate::transfer::{TransferEngine, TransferRequest};

/// The ledger engine ties the registry, posting engines and auditor to one
/// store.
///
/// It keeps no state between calls beyond the store handle and counters, so
/// any number of engines may share a store.
pub struct LedgerEngine<S: LedgerStore> {
    store: Arc<S>,
    registry: AccountRegistry<S>,
    transfers: TransferEngine<S>,
    deposits: DepositEngine<S>,
    withdrawals: WithdrawalEngine<S>,
    auditor: IntegrityAuditor<S>,
    metrics: SharedMetrics,
}

impl<S: LedgerStore> LedgerEngine<S> {
    /// Create a new ledger engine.
    pub fn new(store: Arc<S>, config: &LedgerConfig) -> Self {
        Self::with_metrics(store, config, Arc::new(Metrics::new()))
    }

    /// Create a ledger engine that reports into existing metrics.
    pub fn with_metrics(store: Arc<S>, config: &LedgerConfig, metrics: SharedMetrics) -> Self {
        let registry = AccountRegistry::new(store.clone(), config.lock_timeout);
        Self {
            transfers: TransferEngine::new(store.clone(), registry.clone(), metrics.clone()),
            deposits: DepositEngine::new(store.clone(), registry.clone(), metrics.clone()),
            withdrawals: WithdrawalEngine::new(store.clone(), registry.clone(), metrics.clone()),
            auditor: IntegrityAuditor::new(store.clone(), metrics.clone()),
            registry,
            store,
            metrics,
        }
    }

    /// Get the underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Get the metrics.
    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    /// Create an account.
    pub async fn create_account(&self, owner: &str, account_type: AccountType) -> Result<Account> {
        self.registry.create_account(owner, account_type).await
    }

    /// Look up an account.
    pub async fn get_account(&self, id: AccountId) -> Result<Account> {
        self.registry.get_account(id).await
    }

    /// All accounts in creation order.
    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        self.registry.list_accounts().await
    }

    /// Derived balance of an account, read from one snapshot.
    #[instrument(skip(self))]
    pub async fn get_balance(&self, account_id: AccountId) -> Result<AccountBalance> {
        let mut snapshot = self.store.begin_read().await?;
        if snapshot.fetch_account(account_id).await?.is_none() {
            return Err(LedgerError::AccountNotFound(account_id));
        }
        BalanceCalculator::summarize(&mut snapshot, account_id).await
    }

    /// Move funds between two accounts.
    pub async fn transfer(
        &self,
        source: AccountId,
        destination: AccountId,
        amount: Amount,
    ) -> Result<Posting> {
        self.transfers
            .transfer(TransferRequest::new(source, destination, amount))
            .await
    }

    /// Move funds between two accounts with a full request.
    pub async fn submit_transfer(&self, request: TransferRequest) -> Result<Posting> {
        self.transfers.transfer(request).await
    }

    /// Credit external funds to an account.
    pub async fn deposit(&self, account: AccountId, amount: Amount) -> Result<Posting> {
        self.deposits
            .deposit(ExternalRequest::new(account, amount))
            .await
    }

    /// Credit external funds with a full request.
    pub async fn submit_deposit(&self, request: ExternalRequest) -> Result<Posting> {
        self.deposits.deposit(request).await
    }

    /// Debit funds from an account to the outside.
    pub async fn withdraw(&self, account: AccountId, amount: Amount) -> Result<Posting> {
        self.withdrawals
            .withdraw(ExternalRequest::new(account, amount))
            .await
    }

    /// Debit funds to the outside with a full request.
    pub async fn submit_withdrawal(&self, request: ExternalRequest) -> Result<Posting> {
        self.withdrawals.withdraw(request).await
    }

    /// Entries of an account in the order they were written.
    ///
    /// Every call runs a fresh query; there is no cursor state.
    #[instrument(skip(self))]
    pub async fn get_ledger(&self, account_id: AccountId) -> Result<Vec<LedgerEntry>> {
        let mut snapshot = self.store.begin_read().await?;
        if snapshot.fetch_account(account_id).await?.is_none() {
            return Err(LedgerError::AccountNotFound(account_id));
        }
        let mut entries = snapshot.account_entries(account_id).await?;
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    /// A transaction together with its entries.
    #[instrument(skip(self))]
    pub async fn get_transaction(&self, id: TransactionId) -> Result<Posting> {
        let mut snapshot = self.store.begin_read().await?;
        let transaction = snapshot
            .fetch_transaction(id)
            .await?
            .ok_or(LedgerError::TransactionNotFound(id))?;

        let mut posting = Posting::new(transaction);
        for entry in snapshot.transaction_entries(id).await? {
            posting.add_entry(entry);
        }
        Ok(posting)
    }

    /// Audit the whole ledger.
    pub async fn check_integrity(&self) -> Result<IntegrityReport> {
        let report = self.auditor.check_integrity().await?;
        if !report.passed {
            info!(violations = report.violations.len(), "Audit reported findings");
        }
        Ok(report)
    }
}
