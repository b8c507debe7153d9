//! Core types used throughout the system
//!
//! Identifier aliases shared by every module. All of them map to
//! PostgreSQL `BIGSERIAL`/`BIGINT` columns, hence `i64`.

/// User ID - owned by the user directory, immutable after assignment.
///
/// # Usage:
/// - Foreign key of `wallets.user_id` (UNIQUE, one wallet per user)
/// - `sender_id` / `recipient_id` of every ledger entry
pub type UserId = i64;

/// Wallet ID - primary key of `wallets`
pub type WalletId = i64;

/// Ledger entry ID - primary key of `ledger_entries`, assigned on append
pub type EntryId = i64;
