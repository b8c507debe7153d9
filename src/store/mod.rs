//! Store contracts
//!
//! The transfer engine consumes storage only through these traits. Every
//! mutating call takes the caller's transaction handle (`&mut Tx`) so that the
//! wallet store and the ledger store take part in one atomic commit.
//!
//! Backends:
//! - [`postgres::PgLedger`] - sqlx/PostgreSQL, row locks via `SELECT ... FOR UPDATE`
//! - [`memory::MemoryLedger`] - in-process, same transactional semantics

pub mod memory;
pub mod postgres;
pub mod query;

pub use memory::MemoryLedger;
pub use postgres::PgLedger;
pub use query::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, Page, PageRequest, PeriodFilter};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::core_types::UserId;
use crate::error::LedgerError;
use crate::models::{LedgerEntry, NewLedgerEntry, Wallet};

/// Unit-of-work provider
///
/// Dropping a transaction handle without committing must roll it back.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    type Tx: Send + 'static;

    async fn begin(&self) -> Result<Self::Tx, LedgerError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), LedgerError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), LedgerError>;
}

// ============================================================================
// Wallets
// ============================================================================

/// Read-only wallet access outside any unit of work
#[async_trait]
pub trait WalletReader: Send + Sync {
    async fn find_by_user(&self, user_id: UserId) -> Result<Option<Wallet>, LedgerError>;
}

/// Wallet writes inside a unit of work
#[async_trait]
pub trait WalletStore<Tx: Send>: WalletReader {
    /// Load the wallet and hold its row lock until the unit of work ends
    async fn lock_by_user(
        &self,
        tx: &mut Tx,
        user_id: UserId,
    ) -> Result<Option<Wallet>, LedgerError>;

    /// Persist a new balance
    ///
    /// Fails `ConcurrencyConflict` if `wallet.version` no longer matches the row.
    /// Returns the wallet with its bumped version.
    async fn save_balance(&self, tx: &mut Tx, wallet: &Wallet) -> Result<Wallet, LedgerError>;

    /// Create a zero-balance wallet; fails `InvalidArgument` if one exists
    async fn create(&self, tx: &mut Tx, user_id: UserId) -> Result<Wallet, LedgerError>;
}

// ============================================================================
// Ledger
// ============================================================================

/// Ledger queries. Every listing is newest first and includes entries where
/// the user is either party.
#[async_trait]
pub trait LedgerReader: Send + Sync {
    async fn list_by_user(&self, user_id: UserId) -> Result<Vec<LedgerEntry>, LedgerError>;

    async fn list_in_period(
        &self,
        user_id: UserId,
        period: &PeriodFilter,
    ) -> Result<Vec<LedgerEntry>, LedgerError>;

    /// Returns the requested page and the total number of matching entries
    async fn list_page(
        &self,
        user_id: UserId,
        request: PageRequest,
    ) -> Result<(Vec<LedgerEntry>, u64), LedgerError>;

    async fn find_by_request_key(&self, key: &str) -> Result<Option<LedgerEntry>, LedgerError>;

    /// Sum credited to the user minus sum transferred away by the user
    async fn net_flow(&self, user_id: UserId) -> Result<Decimal, LedgerError>;

    /// Entries in `[start, end]`, `end` inclusive through its calendar day
    async fn list_by_user_and_period(
        &self,
        user_id: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let period = PeriodFilter::new(start, end)?;
        self.list_in_period(user_id, &period).await
    }

    /// Page of entries; `page < 1` becomes 1, `page_size` outside `[1, 100]` becomes 10
    async fn list_by_user_paginated(
        &self,
        user_id: UserId,
        page: i64,
        page_size: i64,
    ) -> Result<Page<LedgerEntry>, LedgerError> {
        let request = PageRequest::new(page, page_size);
        let (items, total) = self.list_page(user_id, request).await?;
        Ok(Page::new(items, request, total))
    }
}

/// Ledger appends inside a unit of work
#[async_trait]
pub trait LedgerStore<Tx: Send>: LedgerReader {
    /// Assigns the id, and the timestamp when `entry.occurred_at` is `None`
    async fn append(&self, tx: &mut Tx, entry: NewLedgerEntry) -> Result<LedgerEntry, LedgerError>;
}

// ============================================================================
// Users
// ============================================================================

/// User directory collaborator
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn exists(&self, user_id: UserId) -> Result<bool, LedgerError>;

    /// `None` when the user does not exist
    async fn display_name(&self, user_id: UserId) -> Result<Option<String>, LedgerError>;
}
