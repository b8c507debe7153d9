//! Wallet Transfer Core
//!
//! Atomic deposits and user-to-user transfers over the store contracts in
//! [`crate::store`].
//!
//! # Safety Invariants
//!
//! 1. **Non-negative**: a debit that would take a balance below zero fails
//!    `InsufficientFunds` and leaves both wallets untouched
//! 2. **Atomic**: debit, credit and ledger append commit together or not at all
//! 3. **Conservation**: a transfer changes the sum of all balances by zero;
//!    only deposits change it, by exactly their amount
//! 4. **Serialized per wallet**: a wallet row stays locked for the whole unit of
//!    work; wallets are always locked in ascending user id order
//! 5. **Bounded retry**: lost races are re-run from scratch, at most
//!    `RetryPolicy::max_attempts` times

pub mod engine;
pub mod retry;

#[cfg(test)]
mod integration_tests;

pub use engine::TransferEngine;
pub use retry::RetryPolicy;

use crate::store::{MemoryLedger, PgLedger};

/// Engine over the PostgreSQL backend
pub type PgTransferEngine = TransferEngine<PgLedger, PgLedger, PgLedger, PgLedger>;

/// Engine over the in-process backend
pub type MemoryTransferEngine =
    TransferEngine<MemoryLedger, MemoryLedger, MemoryLedger, MemoryLedger>;
