//! PostgreSQL backend
//!
//! Schema: `migrations/0001_wallet_ledger.sql`. A unit of work is one
//! `sqlx::Transaction`; wallet rows are serialized with `SELECT ... FOR UPDATE`
//! and every balance write is additionally guarded by the row's `version`.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, Postgres};
use sqlx::Transaction;
use std::time::Duration;

use super::{
    LedgerReader, LedgerStore, PageRequest, PeriodFilter, UnitOfWork, UserDirectory,
    WalletReader, WalletStore,
};
use crate::core_types::UserId;
use crate::db::Database;
use crate::error::LedgerError;
use crate::models::{LedgerEntry, NewLedgerEntry, Wallet};

const WALLET_COLUMNS: &str = "id, user_id, balance, version, created_at, updated_at";
const ENTRY_COLUMNS: &str =
    "id, amount, note, kind, occurred_at, sender_id, recipient_id, request_key";

/// Wallets, ledger entries and the user directory on one PostgreSQL pool
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgLedger {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    pub fn from_database(db: &Database, lock_timeout: Duration) -> Self {
        Self::new(db.pool().clone(), lock_timeout)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

#[async_trait]
impl UnitOfWork for PgLedger {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx, LedgerError> {
        let mut tx = self.pool.begin().await?;

        // Blocked row locks surface as 55P03 instead of waiting forever
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .execute(&mut *tx)
            .await?;

        Ok(tx)
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), LedgerError> {
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), LedgerError> {
        tx.rollback().await?;
        Ok(())
    }
}

// ============================================================================
// Wallets
// ============================================================================

#[async_trait]
impl WalletReader for PgLedger {
    async fn find_by_user(&self, user_id: UserId) -> Result<Option<Wallet>, LedgerError> {
        let sql = format!("SELECT {} FROM wallets WHERE user_id = $1", WALLET_COLUMNS);
        let wallet = sqlx::query_as::<_, Wallet>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(wallet)
    }
}

#[async_trait]
impl WalletStore<Transaction<'static, Postgres>> for PgLedger {
    async fn lock_by_user(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        user_id: UserId,
    ) -> Result<Option<Wallet>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM wallets WHERE user_id = $1 FOR UPDATE",
            WALLET_COLUMNS
        );
        let wallet = sqlx::query_as::<_, Wallet>(&sql)
            .bind(user_id)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(wallet)
    }

    async fn save_balance(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        wallet: &Wallet,
    ) -> Result<Wallet, LedgerError> {
        let sql = format!(
            "UPDATE wallets SET balance = $1, version = version + 1, updated_at = NOW() \
             WHERE id = $2 AND version = $3 RETURNING {}",
            WALLET_COLUMNS
        );
        let saved = sqlx::query_as::<_, Wallet>(&sql)
            .bind(wallet.balance)
            .bind(wallet.id)
            .bind(wallet.version)
            .fetch_optional(&mut **tx)
            .await?;

        saved.ok_or_else(|| {
            LedgerError::ConcurrencyConflict(format!(
                "wallet {} changed since version {}",
                wallet.id, wallet.version
            ))
        })
    }

    async fn create(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        user_id: UserId,
    ) -> Result<Wallet, LedgerError> {
        let sql = format!(
            "INSERT INTO wallets (user_id, balance, version) VALUES ($1, 0, 0) RETURNING {}",
            WALLET_COLUMNS
        );
        sqlx::query_as::<_, Wallet>(&sql)
            .bind(user_id)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    LedgerError::InvalidArgument(format!("user {} already has a wallet", user_id))
                } else {
                    e.into()
                }
            })
    }
}

// ============================================================================
// Ledger
// ============================================================================

#[async_trait]
impl LedgerReader for PgLedger {
    async fn list_by_user(&self, user_id: UserId) -> Result<Vec<LedgerEntry>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM ledger_entries WHERE sender_id = $1 OR recipient_id = $1 \
             ORDER BY occurred_at DESC, id DESC",
            ENTRY_COLUMNS
        );
        let entries = sqlx::query_as::<_, LedgerEntry>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(entries)
    }

    async fn list_in_period(
        &self,
        user_id: UserId,
        period: &PeriodFilter,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM ledger_entries \
             WHERE (sender_id = $1 OR recipient_id = $1) \
               AND occurred_at >= $2 AND occurred_at < $3 \
             ORDER BY occurred_at DESC, id DESC",
            ENTRY_COLUMNS
        );
        let entries = sqlx::query_as::<_, LedgerEntry>(&sql)
            .bind(user_id)
            .bind(period.start)
            .bind(period.end_exclusive)
            .fetch_all(&self.pool)
            .await?;
        Ok(entries)
    }

    async fn list_page(
        &self,
        user_id: UserId,
        request: PageRequest,
    ) -> Result<(Vec<LedgerEntry>, u64), LedgerError> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM ledger_entries WHERE sender_id = $1 OR recipient_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        let sql = format!(
            "SELECT {} FROM ledger_entries WHERE sender_id = $1 OR recipient_id = $1 \
             ORDER BY occurred_at DESC, id DESC LIMIT $2 OFFSET $3",
            ENTRY_COLUMNS
        );
        let entries = sqlx::query_as::<_, LedgerEntry>(&sql)
            .bind(user_id)
            .bind(request.limit() as i64)
            .bind(request.offset() as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok((entries, total.max(0) as u64))
    }

    async fn find_by_request_key(&self, key: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM ledger_entries WHERE request_key = $1",
            ENTRY_COLUMNS
        );
        let entry = sqlx::query_as::<_, LedgerEntry>(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(entry)
    }

    async fn net_flow(&self, user_id: UserId) -> Result<Decimal, LedgerError> {
        let flow: Decimal = sqlx::query_scalar(
            "SELECT COALESCE(SUM(CASE WHEN recipient_id = $1 THEN amount ELSE 0 END), 0) \
                  - COALESCE(SUM(CASE WHEN kind = 2 AND sender_id = $1 THEN amount ELSE 0 END), 0) \
             FROM ledger_entries WHERE sender_id = $1 OR recipient_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(flow)
    }
}

#[async_trait]
impl LedgerStore<Transaction<'static, Postgres>> for PgLedger {
    async fn append(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        entry: NewLedgerEntry,
    ) -> Result<LedgerEntry, LedgerError> {
        let sql = format!(
            "INSERT INTO ledger_entries \
               (amount, note, kind, occurred_at, sender_id, recipient_id, request_key) \
             VALUES ($1, $2, $3, COALESCE($4, NOW()), $5, $6, $7) RETURNING {}",
            ENTRY_COLUMNS
        );
        sqlx::query_as::<_, LedgerEntry>(&sql)
            .bind(entry.amount)
            .bind(&entry.note)
            .bind(entry.kind.id())
            .bind(entry.occurred_at)
            .bind(entry.sender_id)
            .bind(entry.recipient_id)
            .bind(&entry.request_key)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| {
                // Only request_key carries a UNIQUE constraint on this table
                if is_unique_violation(&e) {
                    LedgerError::ConcurrencyConflict(format!(
                        "request key {:?} recorded concurrently",
                        entry.request_key
                    ))
                } else {
                    e.into()
                }
            })
    }
}

// ============================================================================
// Users
// ============================================================================

#[async_trait]
impl UserDirectory for PgLedger {
    async fn exists(&self, user_id: UserId) -> Result<bool, LedgerError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE id = $1)")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn display_name(&self, user_id: UserId) -> Result<Option<String>, LedgerError> {
        let name: Option<String> = sqlx::query_scalar("SELECT name FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(name)
    }
}
