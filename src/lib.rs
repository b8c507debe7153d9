//! wallet_ledger - Wallet balances and an append-only transfer ledger
//!
//! Deposits and user-to-user transfers run as one atomic unit of work that
//! spans the wallet store and the ledger store. Balances never go negative,
//! transfers conserve the total, and a lost race on a wallet row is retried
//! from scratch a bounded number of times.
//!
//! # Modules
//!
//! - [`core_types`] - Identifier aliases (UserId, WalletId, EntryId)
//! - [`money`] - Fixed-point amount parsing and validation
//! - [`error`] - `LedgerError` taxonomy
//! - [`models`] - Wallet, LedgerEntry and presentation records
//! - [`store`] - Store contracts plus PostgreSQL and in-process backends
//! - [`transfer`] - Transfer engine (Deposit, Transfer, OpenWallet)
//! - [`balance`] - Balance query service
//! - [`history`] - Transaction history listings
//! - [`config`] / [`logging`] / [`db`] - Runtime plumbing

// Core types - must be first!
pub mod core_types;

pub mod error;
pub mod models;
pub mod money;

pub mod balance;
pub mod history;
pub mod store;
pub mod transfer;

pub mod config;
pub mod db;
pub mod logging;

// Convenient re-exports at crate root
pub use balance::{BalanceService, Reconciliation};
pub use core_types::{EntryId, UserId, WalletId};
pub use error::LedgerError;
pub use history::HistoryService;
pub use models::{
    DepositCommand, DepositReceipt, EntryKind, EntryView, LedgerEntry, NewLedgerEntry,
    TransferCommand, TransferReceipt, Wallet, WalletView,
};
pub use store::{MemoryLedger, Page, PageRequest, PeriodFilter, PgLedger};
pub use transfer::{MemoryTransferEngine, PgTransferEngine, RetryPolicy, TransferEngine};
