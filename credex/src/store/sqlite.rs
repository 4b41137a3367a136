use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};

use super::{
    Beneficiary, ClaimReceipt, CreditStore, HoldOutcome, hold_entry, purchase_entry, refund_entry,
};
use crate::account::{AccountStatus, CreditAccount, CreditTransaction, LedgerEntry};
use crate::error::{CreditError, EntityKind};
use crate::escrow::{EscrowHold, HoldResolution};
use crate::payment::PaymentRequest;
use crate::timestamp::UnixTimestamp;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS accounts (
    id              TEXT PRIMARY KEY,
    credits         INTEGER NOT NULL CHECK (credits >= 0),
    status          TEXT NOT NULL,
    credential_hash TEXT NOT NULL UNIQUE,
    created_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS credit_transactions (
    seq                INTEGER PRIMARY KEY AUTOINCREMENT,
    id                 TEXT NOT NULL UNIQUE,
    account_id         TEXT NOT NULL REFERENCES accounts(id),
    amount             INTEGER NOT NULL,
    balance_after      INTEGER NOT NULL,
    transaction_type   TEXT NOT NULL,
    description        TEXT NOT NULL,
    related_payment_id TEXT,
    related_hold_id    TEXT,
    created_at         INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_credit_transactions_account
    ON credit_transactions(account_id, seq);

CREATE TABLE IF NOT EXISTS payment_requests (
    payment_token      TEXT PRIMARY KEY,
    id                 TEXT NOT NULL UNIQUE,
    account_id         TEXT,
    chain              TEXT NOT NULL,
    deposit_address    TEXT NOT NULL,
    credits_requested  INTEGER NOT NULL,
    usd_amount         TEXT NOT NULL,
    required_amount    INTEGER NOT NULL,
    status             TEXT NOT NULL,
    confirmations_seen INTEGER NOT NULL DEFAULT 0,
    created_at         INTEGER NOT NULL,
    confirmed_at       INTEGER,
    claimed_at         INTEGER
);

CREATE TABLE IF NOT EXISTS escrow_holds (
    seq              INTEGER PRIMARY KEY AUTOINCREMENT,
    id               TEXT NOT NULL UNIQUE,
    account_id       TEXT NOT NULL REFERENCES accounts(id),
    amount_usd       TEXT NOT NULL,
    credits_held     INTEGER NOT NULL,
    reference        TEXT NOT NULL,
    service          TEXT NOT NULL,
    status           TEXT NOT NULL,
    refund_percent   INTEGER,
    refunded_credits INTEGER,
    created_at       INTEGER NOT NULL,
    released_at      INTEGER,
    voided_at        INTEGER
);
CREATE INDEX IF NOT EXISTS idx_escrow_holds_account ON escrow_holds(account_id, seq);
";

const ACCOUNT_COLUMNS: &str = "id, credits, status, credential_hash, created_at";
const TRANSACTION_COLUMNS: &str = "id, account_id, amount, balance_after, transaction_type, \
     description, related_payment_id, related_hold_id, created_at";
const PAYMENT_COLUMNS: &str = "id, payment_token, account_id, chain, deposit_address, \
     credits_requested, usd_amount, required_amount, status, confirmations_seen, created_at, \
     confirmed_at, claimed_at";
const HOLD_COLUMNS: &str = "id, account_id, amount_usd, credits_held, reference, service, status, \
     refund_percent, refunded_credits, created_at, released_at, voided_at";

/// [`CreditStore`] backed by a single SQLite connection.
///
/// Each operation runs on the blocking pool inside a `BEGIN IMMEDIATE`
/// transaction, so it takes the write lock up front and either commits all of
/// its effects or rolls back.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) a database file and applies the schema.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::Storage`] if the file cannot be opened or migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CreditError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_connection(conn)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::Storage`] if the schema cannot be applied.
    pub fn open_in_memory() -> Result<Self, CreditError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, CreditError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, CreditError>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> Result<T, CreditError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            // Dropping `tx` on the error path rolls back.
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
        .await
        .map_err(|e| CreditError::Storage(format!("storage task failed: {e}")))?
    }
}

fn parse<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn ts(secs: u64) -> UnixTimestamp {
    UnixTimestamp::from_secs(secs)
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<CreditAccount> {
    Ok(CreditAccount {
        id: row.get(0)?,
        credits: row.get(1)?,
        status: parse(2, &row.get::<_, String>(2)?)?,
        credential_hash: row.get(3)?,
        created_at: ts(row.get(4)?),
    })
}

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<CreditTransaction> {
    Ok(CreditTransaction {
        id: row.get(0)?,
        account_id: row.get(1)?,
        amount: row.get(2)?,
        balance_after: row.get(3)?,
        transaction_type: parse(4, &row.get::<_, String>(4)?)?,
        description: row.get(5)?,
        related_payment_id: row.get(6)?,
        related_hold_id: row.get(7)?,
        created_at: ts(row.get(8)?),
    })
}

fn payment_from_row(row: &Row<'_>) -> rusqlite::Result<PaymentRequest> {
    Ok(PaymentRequest {
        id: row.get(0)?,
        payment_token: row.get(1)?,
        account_id: row.get(2)?,
        chain: parse(3, &row.get::<_, String>(3)?)?,
        deposit_address: row.get(4)?,
        credits_requested: row.get(5)?,
        usd_amount: parse(6, &row.get::<_, String>(6)?)?,
        required_amount: row.get(7)?,
        status: parse(8, &row.get::<_, String>(8)?)?,
        confirmations_seen: row.get(9)?,
        created_at: ts(row.get(10)?),
        confirmed_at: row.get::<_, Option<u64>>(11)?.map(ts),
        claimed_at: row.get::<_, Option<u64>>(12)?.map(ts),
    })
}

fn hold_from_row(row: &Row<'_>) -> rusqlite::Result<EscrowHold> {
    Ok(EscrowHold {
        id: row.get(0)?,
        account_id: row.get(1)?,
        amount_usd: parse(2, &row.get::<_, String>(2)?)?,
        credits_held: row.get(3)?,
        reference: row.get(4)?,
        service: row.get(5)?,
        status: parse(6, &row.get::<_, String>(6)?)?,
        refund_percent: row.get(7)?,
        refunded_credits: row.get(8)?,
        created_at: ts(row.get(9)?),
        released_at: row.get::<_, Option<u64>>(10)?.map(ts),
        voided_at: row.get::<_, Option<u64>>(11)?.map(ts),
    })
}

fn load_account(conn: &Connection, account_id: &str) -> Result<Option<CreditAccount>, CreditError> {
    Ok(conn
        .query_row(
            &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
            params![account_id],
            account_from_row,
        )
        .optional()?)
}

fn load_payment(conn: &Connection, token: &str) -> Result<Option<PaymentRequest>, CreditError> {
    Ok(conn
        .query_row(
            &format!("SELECT {PAYMENT_COLUMNS} FROM payment_requests WHERE payment_token = ?1"),
            params![token],
            payment_from_row,
        )
        .optional()?)
}

fn load_hold(conn: &Connection, hold_id: &str) -> Result<Option<EscrowHold>, CreditError> {
    Ok(conn
        .query_row(
            &format!("SELECT {HOLD_COLUMNS} FROM escrow_holds WHERE id = ?1"),
            params![hold_id],
            hold_from_row,
        )
        .optional()?)
}

fn insert_account(conn: &Connection, account: &CreditAccount) -> Result<(), CreditError> {
    conn.execute(
        &format!("INSERT INTO accounts ({ACCOUNT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
        params![
            account.id,
            account.credits,
            account.status.as_str(),
            account.credential_hash,
            account.created_at.as_secs(),
        ],
    )?;
    Ok(())
}

/// Applies `entry` to `account` and writes both the balance and the log row.
fn write_entry(
    conn: &Connection,
    mut account: CreditAccount,
    entry: LedgerEntry,
    at: UnixTimestamp,
) -> Result<(CreditAccount, CreditTransaction), CreditError> {
    let applied = account.apply(entry.amount, entry.mode)?;
    let tx = CreditTransaction::record(entry, applied, &account, at);
    conn.execute(
        "UPDATE accounts SET credits = ?1 WHERE id = ?2",
        params![account.credits, account.id],
    )?;
    conn.execute(
        &format!(
            "INSERT INTO credit_transactions ({TRANSACTION_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        ),
        params![
            tx.id,
            tx.account_id,
            tx.amount,
            tx.balance_after,
            tx.transaction_type.as_str(),
            tx.description,
            tx.related_payment_id,
            tx.related_hold_id,
            tx.created_at.as_secs(),
        ],
    )?;
    Ok((account, tx))
}

fn apply_to_existing(
    conn: &Connection,
    entry: LedgerEntry,
    at: UnixTimestamp,
) -> Result<CreditTransaction, CreditError> {
    let account = load_account(conn, &entry.account_id)?
        .ok_or_else(|| CreditError::not_found(EntityKind::Account, &entry.account_id))?;
    let (_, tx) = write_entry(conn, account, entry, at)?;
    Ok(tx)
}

fn update_payment(conn: &Connection, payment: &PaymentRequest) -> Result<(), CreditError> {
    conn.execute(
        "UPDATE payment_requests SET account_id = ?1, status = ?2, confirmations_seen = ?3, \
         confirmed_at = ?4, claimed_at = ?5 WHERE payment_token = ?6",
        params![
            payment.account_id,
            payment.status.as_str(),
            payment.confirmations_seen,
            payment.confirmed_at.map(UnixTimestamp::as_secs),
            payment.claimed_at.map(UnixTimestamp::as_secs),
            payment.payment_token,
        ],
    )?;
    Ok(())
}

#[async_trait::async_trait]
impl CreditStore for SqliteStore {
    async fn create_account(&self, account: CreditAccount) -> Result<(), CreditError> {
        self.run(move |tx| insert_account(tx, &account)).await
    }

    async fn account(&self, account_id: &str) -> Result<Option<CreditAccount>, CreditError> {
        let account_id = account_id.to_owned();
        self.run(move |tx| load_account(tx, &account_id)).await
    }

    async fn account_by_credential(
        &self,
        credential_hash: &str,
    ) -> Result<Option<CreditAccount>, CreditError> {
        let hash = credential_hash.to_owned();
        self.run(move |tx| {
            Ok(tx
                .query_row(
                    &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE credential_hash = ?1"),
                    params![hash],
                    account_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn set_account_status(
        &self,
        account_id: &str,
        status: AccountStatus,
    ) -> Result<CreditAccount, CreditError> {
        let account_id = account_id.to_owned();
        self.run(move |tx| {
            let changed = tx.execute(
                "UPDATE accounts SET status = ?1 WHERE id = ?2",
                params![status.as_str(), account_id],
            )?;
            if changed == 0 {
                return Err(CreditError::not_found(EntityKind::Account, &account_id));
            }
            load_account(tx, &account_id)?
                .ok_or_else(|| CreditError::not_found(EntityKind::Account, &account_id))
        })
        .await
    }

    async fn apply_entry(
        &self,
        entry: LedgerEntry,
        at: UnixTimestamp,
    ) -> Result<CreditTransaction, CreditError> {
        self.run(move |tx| apply_to_existing(tx, entry, at)).await
    }

    async fn transactions(
        &self,
        account_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<CreditTransaction>, CreditError> {
        let account_id = account_id.to_owned();
        // SQLite treats a negative LIMIT as unbounded.
        let limit = limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));
        self.run(move |tx| {
            let mut stmt = tx.prepare(&format!(
                "SELECT {TRANSACTION_COLUMNS} FROM (
                     SELECT seq, {TRANSACTION_COLUMNS} FROM credit_transactions
                     WHERE account_id = ?1 ORDER BY seq DESC LIMIT ?2
                 ) ORDER BY seq ASC"
            ))?;
            let rows = stmt
                .query_map(params![account_id, limit], transaction_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn insert_payment(&self, payment: PaymentRequest) -> Result<(), CreditError> {
        self.run(move |tx| {
            tx.execute(
                &format!(
                    "INSERT INTO payment_requests ({PAYMENT_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    payment.id,
                    payment.payment_token,
                    payment.account_id,
                    payment.chain.as_str(),
                    payment.deposit_address,
                    payment.credits_requested,
                    payment.usd_amount.to_string(),
                    payment.required_amount,
                    payment.status.as_str(),
                    payment.confirmations_seen,
                    payment.created_at.as_secs(),
                    payment.confirmed_at.map(UnixTimestamp::as_secs),
                    payment.claimed_at.map(UnixTimestamp::as_secs),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn payment_by_token(&self, token: &str) -> Result<Option<PaymentRequest>, CreditError> {
        let token = token.to_owned();
        self.run(move |tx| load_payment(tx, &token)).await
    }

    async fn record_confirmations(
        &self,
        token: &str,
        confirmations: u64,
    ) -> Result<(), CreditError> {
        let token = token.to_owned();
        self.run(move |tx| {
            let changed = tx.execute(
                "UPDATE payment_requests SET confirmations_seen = MAX(confirmations_seen, ?1) \
                 WHERE payment_token = ?2 AND claimed_at IS NULL",
                params![confirmations, token],
            )?;
            if changed == 0 && load_payment(tx, &token)?.is_none() {
                return Err(CreditError::not_found(EntityKind::Payment, &token));
            }
            Ok(())
        })
        .await
    }

    async fn mark_confirmed(
        &self,
        token: &str,
        confirmations: u64,
        at: UnixTimestamp,
    ) -> Result<PaymentRequest, CreditError> {
        let token = token.to_owned();
        self.run(move |tx| {
            let mut payment = load_payment(tx, &token)?
                .ok_or_else(|| CreditError::not_found(EntityKind::Payment, &token))?;
            if payment.confirm(confirmations, at) {
                update_payment(tx, &payment)?;
            }
            Ok(payment)
        })
        .await
    }

    async fn claim_payment(
        &self,
        token: &str,
        beneficiary: Beneficiary,
        at: UnixTimestamp,
    ) -> Result<ClaimReceipt, CreditError> {
        let token = token.to_owned();
        self.run(move |tx| {
            let mut payment = load_payment(tx, &token)?
                .ok_or_else(|| CreditError::not_found(EntityKind::Payment, &token))?;
            payment.claim(beneficiary.account_id(), at)?;

            let account = match beneficiary {
                Beneficiary::Existing(id) => load_account(tx, &id)?
                    .ok_or_else(|| CreditError::not_found(EntityKind::Account, &id))?,
                Beneficiary::New(account) => {
                    insert_account(tx, &account)?;
                    account
                }
            };
            // Final guard: only the row whose claimed_at is still unset moves.
            let claimed = tx.execute(
                "UPDATE payment_requests SET account_id = ?1, status = ?2, claimed_at = ?3 \
                 WHERE payment_token = ?4 AND claimed_at IS NULL",
                params![
                    payment.account_id,
                    payment.status.as_str(),
                    payment.claimed_at.map(UnixTimestamp::as_secs),
                    token,
                ],
            )?;
            if claimed == 0 {
                return Err(CreditError::conflict(EntityKind::Payment, "claimed"));
            }
            let entry = purchase_entry(&payment, &account.id)?;
            let (account, transaction) = write_entry(tx, account, entry, at)?;
            Ok(ClaimReceipt {
                payment,
                account,
                transaction,
            })
        })
        .await
    }

    async fn create_hold(&self, hold: EscrowHold) -> Result<CreditTransaction, CreditError> {
        self.run(move |tx| {
            let debit = apply_to_existing(tx, hold_entry(&hold)?, hold.created_at)?;
            tx.execute(
                &format!(
                    "INSERT INTO escrow_holds ({HOLD_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    hold.id,
                    hold.account_id,
                    hold.amount_usd.to_string(),
                    hold.credits_held,
                    hold.reference,
                    hold.service,
                    hold.status.as_str(),
                    hold.refund_percent,
                    hold.refunded_credits,
                    hold.created_at.as_secs(),
                    hold.released_at.map(UnixTimestamp::as_secs),
                    hold.voided_at.map(UnixTimestamp::as_secs),
                ],
            )?;
            Ok(debit)
        })
        .await
    }

    async fn resolve_hold(
        &self,
        hold_id: &str,
        account_id: &str,
        resolution: HoldResolution,
        at: UnixTimestamp,
    ) -> Result<HoldOutcome, CreditError> {
        let hold_id = hold_id.to_owned();
        let account_id = account_id.to_owned();
        self.run(move |tx| {
            let mut hold = load_hold(tx, &hold_id)?
                .ok_or_else(|| CreditError::not_found(EntityKind::Hold, &hold_id))?;
            let refunded = hold.resolve(&account_id, resolution, at)?;
            let moved = tx.execute(
                "UPDATE escrow_holds SET status = ?1, refund_percent = ?2, refunded_credits = ?3, \
                 released_at = ?4, voided_at = ?5 WHERE id = ?6 AND status = 'held'",
                params![
                    hold.status.as_str(),
                    hold.refund_percent,
                    hold.refunded_credits,
                    hold.released_at.map(UnixTimestamp::as_secs),
                    hold.voided_at.map(UnixTimestamp::as_secs),
                    hold.id,
                ],
            )?;
            if moved == 0 {
                return Err(CreditError::Storage(format!("hold {hold_id} changed concurrently")));
            }
            let refund = if refunded > 0 {
                Some(apply_to_existing(tx, refund_entry(&hold, refunded)?, at)?)
            } else {
                None
            };
            Ok(HoldOutcome { hold, refund })
        })
        .await
    }

    async fn hold(&self, hold_id: &str) -> Result<Option<EscrowHold>, CreditError> {
        let hold_id = hold_id.to_owned();
        self.run(move |tx| load_hold(tx, &hold_id)).await
    }

    async fn holds_for_account(&self, account_id: &str) -> Result<Vec<EscrowHold>, CreditError> {
        let account_id = account_id.to_owned();
        self.run(move |tx| {
            let mut stmt = tx.prepare(&format!(
                "SELECT {HOLD_COLUMNS} FROM escrow_holds WHERE account_id = ?1 ORDER BY seq"
            ))?;
            let rows = stmt
                .query_map(params![account_id], hold_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::super::conformance;
    use super::*;
    use crate::account::Credential;

    fn store() -> Arc<dyn CreditStore> {
        Arc::new(SqliteStore::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_ledger_roundtrip() {
        conformance::ledger_roundtrip(store()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_claim_exactly_once() {
        conformance::claim_exactly_once(store()).await;
    }

    #[tokio::test]
    async fn test_escrow_lifecycle() {
        conformance::escrow_lifecycle(store()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_holds_never_overdraw() {
        conformance::concurrent_holds_never_overdraw(store()).await;
    }

    #[tokio::test]
    async fn test_duplicate_credential_rolls_back() {
        let store = SqliteStore::open_in_memory().unwrap();
        let cred = Credential::generate();
        let first = CreditAccount::open(&cred, UnixTimestamp::from_secs(1));
        store.create_account(first).await.unwrap();
        let second = CreditAccount::open(&cred, UnixTimestamp::from_secs(2));
        let err = store.create_account(second.clone()).await.unwrap_err();
        assert!(matches!(err, CreditError::Storage(_)));
        assert!(store.account(&second.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = std::env::temp_dir().join(format!("credex-{}.db", uuid::Uuid::new_v4()));
        let account = CreditAccount::open(&Credential::generate(), UnixTimestamp::from_secs(1));
        {
            let store = SqliteStore::open(&dir).unwrap();
            store.create_account(account.clone()).await.unwrap();
        }
        let reopened = SqliteStore::open(&dir).unwrap();
        let loaded = reopened.account(&account.id).await.unwrap().unwrap();
        assert_eq!(loaded, account);
        drop(reopened);
        let _ = std::fs::remove_file(&dir);
    }
}
