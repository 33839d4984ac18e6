//! Account registry: creation, lookup and row locking.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument};

use balanced_common::{AccountId, LedgerError, Result};

use crate::account::{Account, AccountType};
use crate::store::{finish_scope, LedgerRead, LedgerStore, LedgerWrite};

/// Maximum length of an account owner reference, in characters.
const MAX_OWNER_LEN: usize = 128;

/// Creates and looks up accounts, and owns the lock-acquisition policy.
///
/// Posting engines never call the store's lock primitive directly; they go
/// through [`AccountRegistry::lock_for_update`] so the wait bound is applied
/// in one place.
pub struct AccountRegistry<S: LedgerStore> {
    store: Arc<S>,
    lock_timeout: Duration,
}

impl<S: LedgerStore> Clone for AccountRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            lock_timeout: self.lock_timeout,
        }
    }
}

impl<S: LedgerStore> AccountRegistry<S> {
    /// Create a new registry.
    pub fn new(store: Arc<S>, lock_timeout: Duration) -> Self {
        Self {
            store,
            lock_timeout,
        }
    }

    /// Bound applied to every row-lock wait.
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Create a new account with a fresh identifier.
    #[instrument(skip(self))]
    pub async fn create_account(&self, owner: &str, account_type: AccountType) -> Result<Account> {
        let owner = owner.trim();
        if owner.is_empty() {
            return Err(LedgerError::invalid_field("owner", "owner must not be empty"));
        }
        if owner.chars().count() > MAX_OWNER_LEN {
            return Err(LedgerError::invalid_field(
                "owner",
                format!("owner must be at most {MAX_OWNER_LEN} characters"),
            ));
        }

        let account = Account::new(owner, account_type);
        let mut scope = self.store.begin_write().await?;
        let outcome = scope.insert_account(&account).await;
        finish_scope(scope, outcome).await?;

        info!(
            account = %account.id,
            account_type = %account.account_type,
            "Account created"
        );
        Ok(account)
    }

    /// Look up an account.
    pub async fn get_account(&self, id: AccountId) -> Result<Account> {
        let mut snapshot = self.store.begin_read().await?;
        snapshot
            .fetch_account(id)
            .await?
            .ok_or(LedgerError::AccountNotFound(id))
    }

    /// All accounts in creation order.
    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        let mut snapshot = self.store.begin_read().await?;
        snapshot.list_accounts().await
    }

    /// Take the account's row lock for the rest of `scope`.
    ///
    /// Must be called before any balance-affecting read or write that
    /// touches the account.
    pub async fn lock_for_update(&self, scope: &mut S::Writer, id: AccountId) -> Result<Account> {
        scope.lock_account(id, self.lock_timeout).await
    }
}
