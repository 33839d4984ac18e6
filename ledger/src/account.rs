//! Account definitions for ledger.

use std::fmt;
use std::str::FromStr;

use balanced_common::{AccountId, LedgerError, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Account type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountType {
    /// Everyday transactional account.
    Checking,
    /// Savings account.
    Savings,
}

impl AccountType {
    /// Get the stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Checking => "CHECKING",
            AccountType::Savings => "SAVINGS",
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CHECKING" => Ok(AccountType::Checking),
            "SAVINGS" => Ok(AccountType::Savings),
            other => Err(LedgerError::invalid_field(
                "account_type",
                format!("unknown account type {other:?}"),
            )),
        }
    }
}

/// A ledger account.
///
/// Accounts carry no balance. The balance is always derived from entries,
/// and the account row itself only serves as a lock target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Unique account identifier.
    pub id: AccountId,
    /// Opaque identifier of the holder.
    pub owner: String,
    /// Account type.
    pub account_type: AccountType,
    /// When the account was created.
    pub created_at: Timestamp,
}

impl Account {
    /// Create a new account.
    pub fn new(owner: impl Into<String>, account_type: AccountType) -> Self {
        Self {
            id: AccountId::new(),
            owner: owner.into(),
            account_type,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_type_round_trip_through_storage_form() {
        for kind in [AccountType::Checking, AccountType::Savings] {
            assert_eq!(kind.as_str().parse::<AccountType>().unwrap(), kind);
        }
        assert_eq!("savings".parse::<AccountType>().unwrap(), AccountType::Savings);
        assert!("brokerage".parse::<AccountType>().is_err());
    }

    #[test]
    fn test_new_accounts_have_distinct_ids() {
        let a = Account::new("user_001", AccountType::Checking);
        let b = Account::new("user_001", AccountType::Checking);
        assert_ne!(a.id, b.id);
        assert_eq!(a.owner, "user_001");
    }
}
