//! PostgreSQL ledger store.
//!
//! Every scope is one database transaction. Write scopes run at the default
//! READ COMMITTED level and lock account rows with `SELECT ... FOR UPDATE`
//! under a transaction-local `lock_timeout`; read scopes run at REPEATABLE
//! READ, READ ONLY, which gives them a stable snapshot without taking locks.
//!
//! ## Error Mapping
//!
//! | Condition | SQLSTATE | LedgerError |
//! |-----------|----------|-------------|
//! | Lock wait exceeded `lock_timeout` | `55P03` | `LockTimeout` |
//! | Anything else | any | `Storage` |

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction as DbTransaction};
use tracing::{info, instrument, warn};

use balanced_common::{
    duration_ms, AccountId, Amount, EntryId, LedgerError, Result, Total, TransactionId,
};

use crate::account::Account;
use crate::balance::EntryTotals;
use crate::journal::{LedgerEntry, Transaction};
use crate::store::{LedgerRead, LedgerStore, LedgerWrite};

const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Schema statements, applied in order by [`PgStore::migrate`]. Idempotent.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS accounts (
        id UUID PRIMARY KEY,
        owner TEXT NOT NULL,
        account_type TEXT NOT NULL CHECK (account_type IN ('CHECKING', 'SAVINGS')),
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transactions (
        id UUID PRIMARY KEY,
        kind TEXT NOT NULL CHECK (kind IN ('TRANSFER', 'DEPOSIT', 'WITHDRAWAL')),
        memo TEXT,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ledger_entries (
        id UUID PRIMARY KEY,
        seq BIGSERIAL NOT NULL UNIQUE,
        account_id UUID NOT NULL REFERENCES accounts (id),
        transaction_id UUID NOT NULL REFERENCES transactions (id),
        direction TEXT NOT NULL CHECK (direction IN ('DEBIT', 'CREDIT')),
        amount BIGINT NOT NULL CHECK (amount > 0),
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ledger_entries_account_seq_idx ON ledger_entries (account_id, seq)",
    "CREATE INDEX IF NOT EXISTS ledger_entries_transaction_idx ON ledger_entries (transaction_id)",
    r#"
    CREATE OR REPLACE FUNCTION ledger_reject_mutation() RETURNS trigger AS $$
    BEGIN
        RAISE EXCEPTION '% is append-only', TG_TABLE_NAME;
    END;
    $$ LANGUAGE plpgsql
    "#,
    "DROP TRIGGER IF EXISTS ledger_entries_append_only ON ledger_entries",
    r#"
    CREATE TRIGGER ledger_entries_append_only
        BEFORE UPDATE OR DELETE ON ledger_entries
        FOR EACH ROW EXECUTE FUNCTION ledger_reject_mutation()
    "#,
    "DROP TRIGGER IF EXISTS transactions_append_only ON transactions",
    r#"
    CREATE TRIGGER transactions_append_only
        BEFORE UPDATE OR DELETE ON transactions
        FOR EACH ROW EXECUTE FUNCTION ledger_reject_mutation()
    "#,
];

const ENTRY_COLUMNS: &str = "id, seq, account_id, transaction_id, direction, amount, created_at";

fn storage_error(e: sqlx::Error) -> LedgerError {
    LedgerError::Storage(e.to_string())
}

fn is_lock_timeout(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(LOCK_NOT_AVAILABLE),
        _ => false,
    }
}

fn lock_timeout_statement(wait: Duration) -> String {
    // Zero would mean "wait forever" to PostgreSQL.
    format!("SET LOCAL lock_timeout = '{}ms'", duration_ms(wait).max(1))
}

fn account_from_row(row: &PgRow) -> Result<Account> {
    let account_type: String = row.try_get("account_type").map_err(storage_error)?;
    Ok(Account {
        id: AccountId::from_uuid(row.try_get("id").map_err(storage_error)?),
        owner: row.try_get("owner").map_err(storage_error)?,
        account_type: account_type
            .parse()
            .map_err(|_| LedgerError::Storage(format!("unknown account type {account_type:?}")))?,
        created_at: row.try_get("created_at").map_err(storage_error)?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction> {
    let kind: String = row.try_get("kind").map_err(storage_error)?;
    Ok(Transaction {
        id: TransactionId::from_uuid(row.try_get("id").map_err(storage_error)?),
        kind: kind.parse()?,
        memo: row.try_get("memo").map_err(storage_error)?,
        created_at: row.try_get("created_at").map_err(storage_error)?,
    })
}

fn entry_from_row(row: &PgRow) -> Result<LedgerEntry> {
    let seq: i64 = row.try_get("seq").map_err(storage_error)?;
    let direction: String = row.try_get("direction").map_err(storage_error)?;
    let amount: i64 = row.try_get("amount").map_err(storage_error)?;
    Ok(LedgerEntry {
        id: EntryId::from_uuid(row.try_get("id").map_err(storage_error)?),
        sequence: u64::try_from(seq)
            .map_err(|_| LedgerError::Storage(format!("negative sequence {seq}")))?,
        account_id: AccountId::from_uuid(row.try_get("account_id").map_err(storage_error)?),
        transaction_id: TransactionId::from_uuid(
            row.try_get("transaction_id").map_err(storage_error)?,
        ),
        direction: direction.parse()?,
        amount: Amount::from_minor(amount),
        created_at: row.try_get("created_at").map_err(storage_error)?,
    })
}

/// Decode a NUMERIC sum of minor units. Sums are taken at full width in the
/// database, so totals past `i64` decode instead of failing the cast.
fn total_from_row(row: &PgRow, column: &str) -> Result<Total> {
    let sum: Decimal = row.try_get(column).map_err(storage_error)?;
    sum.to_i128()
        .map(Total::from_minor)
        .ok_or(LedgerError::AmountOverflow)
}

fn collect<T>(rows: Vec<PgRow>, decode: fn(&PgRow) -> Result<T>) -> Result<Vec<T>> {
    rows.iter().map(decode).collect()
}

/// PostgreSQL-backed ledger store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect a new pool.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(storage_error)?;
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables, indexes and append-only triggers if missing.
    #[instrument(skip(self))]
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(storage_error)?;
        }
        info!(statements = SCHEMA.len(), "Ledger schema ready");
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    type Reader = PgScope;
    type Writer = PgScope;

    async fn begin_read(&self) -> Result<PgScope> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;
        Ok(PgScope { tx })
    }

    async fn begin_write(&self) -> Result<PgScope> {
        let tx = self.pool.begin().await.map_err(storage_error)?;
        Ok(PgScope { tx })
    }
}

/// One database transaction.
pub struct PgScope {
    tx: DbTransaction<'static, Postgres>,
}

#[async_trait]
impl LedgerRead for PgScope {
    async fn fetch_account(&mut self, id: AccountId) -> Result<Option<Account>> {
        let row = sqlx::query(
            "SELECT id, owner, account_type, created_at FROM accounts WHERE id = $1",
        )
        .bind(*id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(storage_error)?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn list_accounts(&mut self) -> Result<Vec<Account>> {
        let rows = sqlx::query(
            "SELECT id, owner, account_type, created_at FROM accounts ORDER BY created_at, id",
        )
        .fetch_all(&mut *self.tx)
        .await
        .map_err(storage_error)?;

        collect(rows, account_from_row)
    }

    async fn entry_totals(&mut self, account_id: AccountId) -> Result<EntryTotals> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(amount) FILTER (WHERE direction = 'CREDIT'), 0) AS credits,
                COALESCE(SUM(amount) FILTER (WHERE direction = 'DEBIT'), 0) AS debits,
                COUNT(*) AS entry_count
            FROM ledger_entries
            WHERE account_id = $1
            "#,
        )
        .bind(*account_id.as_uuid())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(storage_error)?;

        let entry_count: i64 = row.try_get("entry_count").map_err(storage_error)?;

        Ok(EntryTotals {
            credits: total_from_row(&row, "credits")?,
            debits: total_from_row(&row, "debits")?,
            entry_count: entry_count.max(0) as u64,
        })
    }

    async fn account_entries(&mut self, account_id: AccountId) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE account_id = $1 ORDER BY seq"
        ))
        .bind(*account_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(storage_error)?;

        collect(rows, entry_from_row)
    }

    async fn fetch_transaction(&mut self, id: TransactionId) -> Result<Option<Transaction>> {
        let row = sqlx::query("SELECT id, kind, memo, created_at FROM transactions WHERE id = $1")
            .bind(*id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage_error)?;

        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn transaction_entries(&mut self, id: TransactionId) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE transaction_id = $1 ORDER BY seq"
        ))
        .bind(*id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(storage_error)?;

        collect(rows, entry_from_row)
    }

    async fn list_transactions(&mut self) -> Result<Vec<Transaction>> {
        let rows = sqlx::query(
            "SELECT id, kind, memo, created_at FROM transactions ORDER BY created_at, id",
        )
        .fetch_all(&mut *self.tx)
        .await
        .map_err(storage_error)?;

        collect(rows, transaction_from_row)
    }

    async fn list_entries(&mut self) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries ORDER BY seq"
        ))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(storage_error)?;

        collect(rows, entry_from_row)
    }
}

#[async_trait]
impl LedgerWrite for PgScope {
    async fn lock_account(&mut self, id: AccountId, wait: Duration) -> Result<Account> {
        sqlx::query(&lock_timeout_statement(wait))
            .execute(&mut *self.tx)
            .await
            .map_err(storage_error)?;

        let row = sqlx::query(
            "SELECT id, owner, account_type, created_at FROM accounts WHERE id = $1 FOR UPDATE",
        )
        .bind(*id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| {
            if is_lock_timeout(&e) {
                warn!(account = %id, wait_ms = duration_ms(wait), "Row lock wait timed out");
                LedgerError::LockTimeout {
                    account: id,
                    waited_ms: duration_ms(wait),
                }
            } else {
                storage_error(e)
            }
        })?;

        match row {
            Some(row) => account_from_row(&row),
            None => Err(LedgerError::AccountNotFound(id)),
        }
    }

    async fn insert_account(&mut self, account: &Account) -> Result<()> {
        sqlx::query(
            "INSERT INTO accounts (id, owner, account_type, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(*account.id.as_uuid())
        .bind(account.owner.as_str())
        .bind(account.account_type.as_str())
        .bind(account.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(storage_error)?;
        Ok(())
    }

    async fn insert_transaction(&mut self, transaction: &Transaction) -> Result<()> {
        sqlx::query("INSERT INTO transactions (id, kind, memo, created_at) VALUES ($1, $2, $3, $4)")
            .bind(*transaction.id.as_uuid())
            .bind(transaction.kind.as_str())
            .bind(transaction.memo.as_deref())
            .bind(transaction.created_at)
            .execute(&mut *self.tx)
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    async fn insert_entry(&mut self, mut entry: LedgerEntry) -> Result<LedgerEntry> {
        let row = sqlx::query(
            r#"
            INSERT INTO ledger_entries (id, account_id, transaction_id, direction, amount, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING seq
            "#,
        )
        .bind(*entry.id.as_uuid())
        .bind(*entry.account_id.as_uuid())
        .bind(*entry.transaction_id.as_uuid())
        .bind(entry.direction.as_str())
        .bind(entry.amount.minor_units())
        .bind(entry.created_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(storage_error)?;

        let seq: i64 = row.try_get("seq").map_err(storage_error)?;
        entry.sequence = u64::try_from(seq)
            .map_err(|_| LedgerError::Storage(format!("negative sequence {seq}")))?;
        Ok(entry)
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await.map_err(storage_error)
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.map_err(storage_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_timeout_statement_never_disables_timeout() {
        assert_eq!(
            lock_timeout_statement(Duration::from_millis(250)),
            "SET LOCAL lock_timeout = '250ms'"
        );
        assert_eq!(
            lock_timeout_statement(Duration::ZERO),
            "SET LOCAL lock_timeout = '1ms'"
        );
    }

    #[test]
    fn test_schema_enforces_positive_amounts() {
        let entries_table = SCHEMA
            .iter()
            .find(|s| s.contains("CREATE TABLE IF NOT EXISTS ledger_entries"))
            .unwrap();
        assert!(entries_table.contains("CHECK (amount > 0)"));
        assert!(SCHEMA.iter().any(|s| s.contains("BEFORE UPDATE OR DELETE ON ledger_entries")));
    }

    mod database {
        //! Run against a live PostgreSQL: `DATABASE_URL=... cargo test -- --ignored`.

        use super::*;
        use crate::account::AccountType;
        use crate::journal::TransactionKind;
        use tokio::sync::OnceCell;

        static MIGRATED: OnceCell<()> = OnceCell::const_new();

        async fn connect() -> PgStore {
            let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
            let store = PgStore::connect(&url, 4).await.unwrap();
            MIGRATED
                .get_or_init(|| async { store.migrate().await.unwrap() })
                .await;
            store
        }

        async fn open_account(store: &PgStore) -> Account {
            let account = Account::new("pg_test", AccountType::Checking);
            let mut scope = store.begin_write().await.unwrap();
            scope.insert_account(&account).await.unwrap();
            scope.commit().await.unwrap();
            account
        }

        async fn post(store: &PgStore, account: AccountId, legs: &[(bool, Amount)]) {
            let mut scope = store.begin_write().await.unwrap();
            let tx = Transaction::new(TransactionKind::Deposit, None);
            scope.insert_transaction(&tx).await.unwrap();
            for &(credit, amount) in legs {
                let entry = if credit {
                    LedgerEntry::credit(tx.id, account, amount)
                } else {
                    LedgerEntry::debit(tx.id, account, amount)
                };
                scope.insert_entry(entry.unwrap()).await.unwrap();
            }
            scope.commit().await.unwrap();
        }

        #[tokio::test]
        #[ignore = "requires DATABASE_URL"]
        async fn test_contended_row_lock_times_out() {
            let store = connect().await;
            let account = open_account(&store).await;

            let mut holder = store.begin_write().await.unwrap();
            holder
                .lock_account(account.id, Duration::from_secs(5))
                .await
                .unwrap();

            let mut waiter = store.begin_write().await.unwrap();
            let err = waiter
                .lock_account(account.id, Duration::from_millis(50))
                .await
                .unwrap_err();
            assert_eq!(
                err,
                LedgerError::LockTimeout {
                    account: account.id,
                    waited_ms: 50,
                }
            );
            assert_eq!(err.status_code(), 409);

            waiter.rollback().await.unwrap();
            holder.rollback().await.unwrap();
        }

        #[tokio::test]
        #[ignore = "requires DATABASE_URL"]
        async fn test_read_scope_keeps_its_snapshot() {
            let store = connect().await;
            let account = open_account(&store).await;

            let mut reader = store.begin_read().await.unwrap();
            assert_eq!(
                reader.entry_totals(account.id).await.unwrap().entry_count,
                0
            );

            post(&store, account.id, &[(true, Amount::from_minor(700))]).await;

            let stale = reader.entry_totals(account.id).await.unwrap();
            assert_eq!(stale.entry_count, 0);
            assert_eq!(stale.balance().unwrap(), Amount::ZERO);

            let mut fresh = store.begin_read().await.unwrap();
            let totals = fresh.entry_totals(account.id).await.unwrap();
            assert_eq!(totals.balance().unwrap(), Amount::from_minor(700));
        }

        #[tokio::test]
        #[ignore = "requires DATABASE_URL"]
        async fn test_totals_past_i64_still_decode() {
            let store = connect().await;
            let account = open_account(&store).await;
            let large = Amount::from_minor(i64::MAX / 2 + 1);

            post(&store, account.id, &[(true, large), (false, large)]).await;
            post(&store, account.id, &[(true, large)]).await;

            let mut reader = store.begin_read().await.unwrap();
            let totals = reader.entry_totals(account.id).await.unwrap();
            assert_eq!(totals.credits, Total::from(large).plus(large));
            assert_eq!(totals.balance().unwrap(), large);
        }
    }
}
