//! Error types for ledger operations.

use crate::{AccountId, Amount, TransactionId};
use thiserror::Error;

/// Main error type for ledger operations.
///
/// Integrity findings are not errors; the auditor reports them as values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Referenced account does not exist.
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Referenced transaction does not exist.
    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    /// Projected balance would go negative.
    #[error("Insufficient funds in {account}: required {required}, available {available}")]
    InsufficientFunds {
        account: AccountId,
        required: Amount,
        available: Amount,
    },

    /// Row lock could not be acquired within the wait bound.
    #[error("Timed out after {waited_ms}ms waiting for lock on account {account}")]
    LockTimeout { account: AccountId, waited_ms: u64 },

    /// Underlying durable store failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Amount is malformed or not positive.
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Source and destination of a transfer are the same account.
    #[error("Cannot transfer from account {0} to itself")]
    SelfTransfer(AccountId),

    /// Arithmetic on amounts exceeded the representable range.
    #[error("Amount overflow")]
    AmountOverflow,

    /// Request failed validation.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        message: String,
        field: Option<String>,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl LedgerError {
    /// Create a validation error for a specific field.
    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        LedgerError::InvalidRequest {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Check if the whole operation may be retried from scratch.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::LockTimeout { .. } | LedgerError::Storage(_)
        )
    }

    /// Get suggested retry delay in milliseconds.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            LedgerError::LockTimeout { .. } => Some(100),
            LedgerError::Storage(_) => Some(1000),
            _ => None,
        }
    }

    /// Check if this is a rejected business rule rather than a fault.
    pub fn is_rejection(&self) -> bool {
        matches!(self, LedgerError::InsufficientFunds { .. })
    }

    /// Get a stable error code for the service boundary.
    pub fn error_code(&self) -> &'static str {
        match self {
            LedgerError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            LedgerError::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LedgerError::LockTimeout { .. } => "LOCK_TIMEOUT",
            LedgerError::Storage(_) => "STORAGE_ERROR",
            LedgerError::InvalidAmount(_) => "INVALID_AMOUNT",
            LedgerError::SelfTransfer(_) => "SELF_TRANSFER",
            LedgerError::AmountOverflow => "AMOUNT_OVERFLOW",
            LedgerError::InvalidRequest { .. } => "INVALID_REQUEST",
            LedgerError::ConfigurationError(_) => "CONFIGURATION_ERROR",
        }
    }

    /// Get the HTTP-equivalent status an adapter should surface.
    pub fn status_code(&self) -> u16 {
        match self {
            LedgerError::AccountNotFound(_) | LedgerError::TransactionNotFound(_) => 404,
            LedgerError::InsufficientFunds { .. } => 422,
            LedgerError::LockTimeout { .. } => 409,
            LedgerError::InvalidAmount(_)
            | LedgerError::SelfTransfer(_)
            | LedgerError::AmountOverflow
            | LedgerError::InvalidRequest { .. } => 400,
            LedgerError::Storage(_) | LedgerError::ConfigurationError(_) => 500,
        }
    }
}

/// Result type alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_funds_is_unprocessable() {
        let err = LedgerError::InsufficientFunds {
            account: AccountId::new(),
            required: Amount::from_minor(10_000),
            available: Amount::from_minor(6_000),
        };
        assert_eq!(err.status_code(), 422);
        assert_eq!(err.error_code(), "INSUFFICIENT_FUNDS");
        assert!(err.is_rejection());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("required 100.00, available 60.00"));
    }

    #[test]
    fn test_retryable_errors() {
        let timeout = LedgerError::LockTimeout {
            account: AccountId::new(),
            waited_ms: 50,
        };
        assert!(timeout.is_retryable());
        assert_eq!(timeout.retry_after_ms(), Some(100));
        assert!(LedgerError::Storage("disk full".into()).is_retryable());
        assert!(!LedgerError::AccountNotFound(AccountId::new()).is_retryable());
    }

    #[test]
    fn test_validation_errors_map_to_bad_request() {
        assert_eq!(LedgerError::SelfTransfer(AccountId::new()).status_code(), 400);
        assert_eq!(LedgerError::invalid_field("memo", "too long").status_code(), 400);
        assert_eq!(
            LedgerError::TransactionNotFound(TransactionId::new()).status_code(),
            404
        );
    }
}
