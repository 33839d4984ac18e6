//! Balanced Ledger Engine
//!
//! Double-entry ledger whose balances are always derived from an append-only
//! history of entries. Writes run in atomic scopes under pessimistic row
//! locks taken in a fixed order; reads run against consistent snapshots.

pub mod account;
pub mod audit;
pub mod balance;
pub mod config;
pub mod deposit;
pub mod engine;
pub mod journal;
pub mod metrics;
pub mod registry;
pub mod store;
pub mod transfer;

pub use account::{Account, AccountType};
pub use audit::{IntegrityAuditor, IntegrityReport, IntegrityViolation, LedgerTotals};
pub use balance::{AccountBalance, BalanceCalculator, EntryTotals};
pub use config::LedgerConfig;
pub use deposit::{DepositEngine, ExternalRequest, WithdrawalEngine};
pub use engine::LedgerEngine;
pub use journal::{Direction, LedgerEntry, Posting, Transaction, TransactionKind};
pub use metrics::{Metrics, MetricsSnapshot, SharedMetrics};
pub use registry::AccountRegistry;
pub use store::{InMemoryStore, LedgerRead, LedgerStore, LedgerWrite, PgStore};
pub use transfer::{TransferEngine, TransferRequest};
