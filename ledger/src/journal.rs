//! Journal types for double-entry bookkeeping.

use std::fmt;
use std::str::FromStr;

use balanced_common::{AccountId, Amount, EntryId, LedgerError, Result, Timestamp, TransactionId};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Direction of a ledger entry, from the account holder's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    /// Debit entry (decreases the account balance).
    Debit,
    /// Credit entry (increases the account balance).
    Credit,
}

impl Direction {
    /// Get the stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Debit => "DEBIT",
            Direction::Credit => "CREDIT",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "DEBIT" => Ok(Direction::Debit),
            "CREDIT" => Ok(Direction::Credit),
            other => Err(LedgerError::Storage(format!("unknown entry direction {other:?}"))),
        }
    }
}

/// Kind of ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    /// Movement between two accounts: one debit, one credit.
    Transfer,
    /// External funds in: a single credit, the debit leg is not tracked.
    Deposit,
    /// External funds out: a single debit, the credit leg is not tracked.
    Withdrawal,
}

impl TransactionKind {
    /// Get the stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Transfer => "TRANSFER",
            TransactionKind::Deposit => "DEPOSIT",
            TransactionKind::Withdrawal => "WITHDRAWAL",
        }
    }

    /// Directions of the entries a well-formed transaction of this kind carries.
    pub fn expected_directions(&self) -> &'static [Direction] {
        match self {
            TransactionKind::Transfer => &[Direction::Debit, Direction::Credit],
            TransactionKind::Deposit => &[Direction::Credit],
            TransactionKind::Withdrawal => &[Direction::Debit],
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "TRANSFER" => Ok(TransactionKind::Transfer),
            "DEPOSIT" => Ok(TransactionKind::Deposit),
            "WITHDRAWAL" => Ok(TransactionKind::Withdrawal),
            other => Err(LedgerError::Storage(format!(
                "unknown transaction kind {other:?}"
            ))),
        }
    }
}

/// Longest memo a transaction may carry, in characters.
pub const MAX_MEMO_LEN: usize = 255;

/// Resolve a request memo: trimmed, falling back to `default` when absent or blank.
pub fn resolve_memo(memo: Option<&str>, default: &str) -> Result<String> {
    let memo = memo.map(str::trim).filter(|m| !m.is_empty()).unwrap_or(default);
    if memo.chars().count() > MAX_MEMO_LEN {
        return Err(LedgerError::invalid_field(
            "memo",
            format!("memo must be at most {MAX_MEMO_LEN} characters"),
        ));
    }
    Ok(memo.to_string())
}

/// A ledger transaction header. Its entries reference it by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique transaction ID.
    pub id: TransactionId,
    /// Transaction kind.
    pub kind: TransactionKind,
    /// Optional free-text memo.
    pub memo: Option<String>,
    /// When the transaction was created.
    pub created_at: Timestamp,
}

impl Transaction {
    /// Create a new transaction header.
    pub fn new(kind: TransactionKind, memo: Option<String>) -> Self {
        Self {
            id: TransactionId::new(),
            kind,
            memo,
            created_at: Utc::now(),
        }
    }
}

/// A single immutable entry in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry ID.
    pub id: EntryId,
    /// Store-assigned position; zero until the entry is inserted.
    pub sequence: u64,
    /// Account affected.
    pub account_id: AccountId,
    /// Transaction this entry belongs to.
    pub transaction_id: TransactionId,
    /// Debit or credit.
    pub direction: Direction,
    /// Amount, always positive.
    pub amount: Amount,
    /// When this entry was created.
    pub created_at: Timestamp,
}

impl LedgerEntry {
    fn new(
        transaction_id: TransactionId,
        account_id: AccountId,
        direction: Direction,
        amount: Amount,
    ) -> Result<Self> {
        if !amount.is_positive() {
            return Err(LedgerError::InvalidAmount(format!(
                "entry amount must be positive, got {amount}"
            )));
        }

        Ok(Self {
            id: EntryId::new(),
            sequence: 0,
            account_id,
            transaction_id,
            direction,
            amount,
            created_at: Utc::now(),
        })
    }

    /// Create a debit entry.
    pub fn debit(
        transaction_id: TransactionId,
        account_id: AccountId,
        amount: Amount,
    ) -> Result<Self> {
        Self::new(transaction_id, account_id, Direction::Debit, amount)
    }

    /// Create a credit entry.
    pub fn credit(
        transaction_id: TransactionId,
        account_id: AccountId,
        amount: Amount,
    ) -> Result<Self> {
        Self::new(transaction_id, account_id, Direction::Credit, amount)
    }

    /// Get signed amount (positive for credit, negative for debit).
    pub fn signed_amount(&self) -> Amount {
        match self.direction {
            Direction::Credit => self.amount,
            Direction::Debit => -self.amount,
        }
    }
}

/// A transaction together with the entries committed with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    /// Transaction header.
    pub transaction: Transaction,
    /// Entries linked to the transaction.
    pub entries: Vec<LedgerEntry>,
}

impl Posting {
    /// Create a posting with no entries yet.
    pub fn new(transaction: Transaction) -> Self {
        Self {
            transaction,
            entries: Vec::new(),
        }
    }

    /// Add an entry to the posting.
    pub fn add_entry(&mut self, entry: LedgerEntry) {
        self.entries.push(entry);
    }

    /// Get the transaction ID.
    pub fn id(&self) -> TransactionId {
        self.transaction.id
    }

    /// Get total debits.
    pub fn total_debits(&self) -> Result<Amount> {
        Amount::try_sum(
            self.entries
                .iter()
                .filter(|e| e.direction == Direction::Debit)
                .map(|e| e.amount),
        )
    }

    /// Get total credits.
    pub fn total_credits(&self) -> Result<Amount> {
        Amount::try_sum(
            self.entries
                .iter()
                .filter(|e| e.direction == Direction::Credit)
                .map(|e| e.amount),
        )
    }

    /// Describe how this posting deviates from the shape its kind requires.
    ///
    /// Returns `None` for a well-formed posting.
    pub fn shape_violation(&self) -> Option<String> {
        let kind = self.transaction.kind;
        let expected = kind.expected_directions();

        if self.entries.len() != expected.len() {
            return Some(format!(
                "{kind} must have {} entries, found {}",
                expected.len(),
                self.entries.len()
            ));
        }

        for direction in expected {
            let count = self
                .entries
                .iter()
                .filter(|e| e.direction == *direction)
                .count();
            if count != 1 {
                return Some(format!("{kind} must have exactly one {direction} entry"));
            }
        }

        if let Some(entry) = self.entries.iter().find(|e| !e.amount.is_positive()) {
            return Some(format!("entry {} has non-positive amount {}", entry.id, entry.amount));
        }

        if kind == TransactionKind::Transfer {
            let (debits, credits) = match (self.total_debits(), self.total_credits()) {
                (Ok(d), Ok(c)) => (d, c),
                _ => return Some("entry amounts overflow".to_string()),
            };
            if debits != credits {
                return Some(format!(
                    "debits {debits} do not equal credits {credits}"
                ));
            }
            if self.entries[0].account_id == self.entries[1].account_id {
                return Some("transfer debits and credits the same account".to_string());
            }
        }

        None
    }

    /// Check that the posting has the shape its kind requires.
    pub fn is_well_formed(&self) -> bool {
        self.shape_violation().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer_posting(debit: i64, credit: i64) -> Posting {
        let mut posting = Posting::new(Transaction::new(TransactionKind::Transfer, None));
        let tx_id = posting.id();
        posting.add_entry(
            LedgerEntry::debit(tx_id, AccountId::new(), Amount::from_minor(debit)).unwrap(),
        );
        posting.add_entry(
            LedgerEntry::credit(tx_id, AccountId::new(), Amount::from_minor(credit)).unwrap(),
        );
        posting
    }

    #[test]
    fn test_balanced_transfer() {
        let posting = transfer_posting(1000, 1000);

        assert!(posting.is_well_formed());
        assert_eq!(posting.total_debits().unwrap(), Amount::from_minor(1000));
        assert_eq!(posting.total_credits().unwrap(), Amount::from_minor(1000));
    }

    #[test]
    fn test_unbalanced_transfer() {
        let posting = transfer_posting(1000, 900);
        let violation = posting.shape_violation().unwrap();
        assert!(violation.contains("do not equal"));
    }

    #[test]
    fn test_transfer_with_missing_leg() {
        let mut posting = Posting::new(Transaction::new(TransactionKind::Transfer, None));
        let tx_id = posting.id();
        posting.add_entry(
            LedgerEntry::debit(tx_id, AccountId::new(), Amount::from_minor(1000)).unwrap(),
        );

        assert!(!posting.is_well_formed());
    }

    #[test]
    fn test_deposit_shape() {
        let mut posting = Posting::new(Transaction::new(
            TransactionKind::Deposit,
            Some("Cash Deposit".into()),
        ));
        let tx_id = posting.id();
        posting.add_entry(
            LedgerEntry::credit(tx_id, AccountId::new(), Amount::from_minor(500)).unwrap(),
        );
        assert!(posting.is_well_formed());

        let mut wrong = Posting::new(Transaction::new(TransactionKind::Deposit, None));
        let tx_id = wrong.id();
        wrong.add_entry(
            LedgerEntry::debit(tx_id, AccountId::new(), Amount::from_minor(500)).unwrap(),
        );
        assert!(!wrong.is_well_formed());
    }

    #[test]
    fn test_entry_rejects_non_positive_amount() {
        let tx_id = TransactionId::new();
        assert!(LedgerEntry::credit(tx_id, AccountId::new(), Amount::ZERO).is_err());
        assert!(LedgerEntry::debit(tx_id, AccountId::new(), Amount::from_minor(-5)).is_err());
    }

    #[test]
    fn test_resolve_memo() {
        assert_eq!(resolve_memo(None, "Cash Deposit").unwrap(), "Cash Deposit");
        assert_eq!(resolve_memo(Some("  "), "Cash Deposit").unwrap(), "Cash Deposit");
        assert_eq!(resolve_memo(Some(" rent "), "Cash Deposit").unwrap(), "rent");
        assert!(resolve_memo(Some(&"x".repeat(MAX_MEMO_LEN + 1)), "Cash Deposit").is_err());
    }

    #[test]
    fn test_signed_amount() {
        let tx_id = TransactionId::new();
        let credit = LedgerEntry::credit(tx_id, AccountId::new(), Amount::from_minor(40)).unwrap();
        let debit = LedgerEntry::debit(tx_id, AccountId::new(), Amount::from_minor(40)).unwrap();
        assert_eq!(credit.signed_amount(), Amount::from_minor(40));
        assert_eq!(debit.signed_amount(), Amount::from_minor(-40));
    }
}
