//! Wallet and ledger entry types
//!
//! Flat value structs with explicit foreign-key fields. Related display data
//! (user names) is resolved through [`crate::store::UserDirectory`] lookups,
//! never carried on the row itself.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

use crate::core_types::{EntryId, UserId, WalletId};
use crate::error::LedgerError;
use crate::money;

/// Longest note accepted on a ledger entry (`VARCHAR(200)`)
pub const MAX_NOTE_LEN: usize = 200;

/// Longest client request key accepted for idempotent replays
pub const MAX_REQUEST_KEY_LEN: usize = 64;

/// Note recorded on a deposit submitted without one
pub const DEFAULT_DEPOSIT_NOTE: &str = "Deposit";

// ============================================================================
// EntryKind
// ============================================================================

/// Ledger entry kind, persisted as `INT`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum EntryKind {
    /// Self-credit: sender == recipient
    Deposit = 1,
    /// Value moved between two different users
    Transfer = 2,
}

impl EntryKind {
    pub fn id(&self) -> i32 {
        *self as i32
    }

    pub fn from_id(id: i32) -> Option<Self> {
        match id {
            1 => Some(EntryKind::Deposit),
            2 => Some(EntryKind::Transfer),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Deposit => "deposit",
            EntryKind::Transfer => "transfer",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored `kind` value outside the known set
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Invalid entry kind: {0}")]
pub struct InvalidEntryKind(pub i32);

impl TryFrom<i32> for EntryKind {
    type Error = InvalidEntryKind;

    fn try_from(id: i32) -> Result<Self, Self::Error> {
        EntryKind::from_id(id).ok_or(InvalidEntryKind(id))
    }
}

// ============================================================================
// Wallet
// ============================================================================

/// One wallet per user. `version` is bumped on every balance write.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct Wallet {
    pub id: WalletId,
    pub user_id: UserId,
    pub balance: Decimal,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Debit the balance, refusing to go below zero
    pub fn debit(&mut self, amount: Decimal) -> Result<(), LedgerError> {
        if self.balance < amount {
            return Err(LedgerError::InsufficientFunds {
                available: self.balance,
                requested: amount,
            });
        }
        self.balance -= amount;
        Ok(())
    }

    /// Credit the balance, refusing to exceed the column bound
    pub fn credit(&mut self, amount: Decimal) -> Result<(), LedgerError> {
        self.balance = money::check_balance(self.balance + amount)?;
        Ok(())
    }

    pub fn view(&self) -> WalletView {
        WalletView {
            wallet_id: self.id,
            user_id: self.user_id,
            balance: self.balance,
            updated_at: self.updated_at,
        }
    }
}

/// Read-only wallet projection returned to callers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WalletView {
    pub wallet_id: WalletId,
    pub user_id: UserId,
    #[serde(with = "rust_decimal::serde::str")]
    pub balance: Decimal,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Ledger Entry
// ============================================================================

/// Immutable record of one money movement
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct LedgerEntry {
    pub id: EntryId,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub note: Option<String>,
    #[sqlx(try_from = "i32")]
    pub kind: EntryKind,
    pub occurred_at: DateTime<Utc>,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub request_key: Option<String>,
}

impl LedgerEntry {
    /// Whether the user is one of the two parties
    pub fn involves(&self, user_id: UserId) -> bool {
        self.sender_id == user_id || self.recipient_id == user_id
    }

    /// Signed effect of this entry on the user's balance
    pub fn effect_on(&self, user_id: UserId) -> Decimal {
        let mut effect = Decimal::ZERO;
        if self.recipient_id == user_id {
            effect += self.amount;
        }
        if self.kind == EntryKind::Transfer && self.sender_id == user_id {
            effect -= self.amount;
        }
        effect
    }

    /// Whether a replayed command describes the same movement as this entry
    pub fn matches(&self, new: &NewLedgerEntry) -> bool {
        self.kind == new.kind
            && self.sender_id == new.sender_id
            && self.recipient_id == new.recipient_id
            && self.amount == new.amount
            && self.note == new.note
    }
}

/// Entry to be appended; id is assigned by the store, timestamp when absent
#[derive(Debug, Clone, PartialEq)]
pub struct NewLedgerEntry {
    pub amount: Decimal,
    pub note: Option<String>,
    pub kind: EntryKind,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub occurred_at: Option<DateTime<Utc>>,
    pub request_key: Option<String>,
}

impl NewLedgerEntry {
    pub fn deposit(user_id: UserId, amount: Decimal, note: Option<String>) -> Self {
        Self {
            amount,
            note,
            kind: EntryKind::Deposit,
            sender_id: user_id,
            recipient_id: user_id,
            occurred_at: None,
            request_key: None,
        }
    }

    pub fn transfer(
        sender_id: UserId,
        recipient_id: UserId,
        amount: Decimal,
        note: Option<String>,
    ) -> Self {
        Self {
            amount,
            note,
            kind: EntryKind::Transfer,
            sender_id,
            recipient_id,
            occurred_at: None,
            request_key: None,
        }
    }

    pub fn with_request_key(mut self, request_key: Option<String>) -> Self {
        self.request_key = request_key;
        self
    }

    /// Normalize and check the entry before it reaches a store
    ///
    /// Notes are trimmed and an empty note becomes `None`.
    pub fn validate(mut self) -> Result<Self, LedgerError> {
        if self.amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidArgument(
                "amount must be greater than zero".into(),
            ));
        }

        self.note = normalize_note(self.note)?;
        self.request_key = normalize_request_key(self.request_key)?;

        match self.kind {
            EntryKind::Deposit if self.sender_id != self.recipient_id => {
                Err(LedgerError::InvalidArgument(
                    "deposit sender and recipient must be the same user".into(),
                ))
            }
            EntryKind::Transfer if self.sender_id == self.recipient_id => Err(
                LedgerError::InvalidArgument("cannot transfer to the same user".into()),
            ),
            _ => Ok(self),
        }
    }
}

/// Trim a note; empty becomes `None`, over-long is rejected
pub fn normalize_note(note: Option<String>) -> Result<Option<String>, LedgerError> {
    let Some(note) = note else {
        return Ok(None);
    };
    let trimmed = note.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.chars().count() > MAX_NOTE_LEN {
        return Err(LedgerError::InvalidArgument(format!(
            "note exceeds {} characters",
            MAX_NOTE_LEN
        )));
    }
    Ok(Some(trimmed.to_string()))
}

fn normalize_request_key(key: Option<String>) -> Result<Option<String>, LedgerError> {
    match key {
        None => Ok(None),
        Some(key) => {
            let len = key.chars().count();
            if len == 0 || len > MAX_REQUEST_KEY_LEN || key.trim() != key {
                return Err(LedgerError::InvalidArgument(format!(
                    "request key must be 1-{} characters without surrounding whitespace",
                    MAX_REQUEST_KEY_LEN
                )));
            }
            Ok(Some(key))
        }
    }
}

// ============================================================================
// Presentation records
// ============================================================================

/// Ledger entry with denormalized party names
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryView {
    #[serde(flatten)]
    pub entry: LedgerEntry,
    pub sender_name: String,
    pub recipient_name: String,
}

/// Outcome of a transfer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferReceipt {
    #[serde(flatten)]
    pub view: EntryView,
    /// True when an earlier transfer with the same request key was returned
    pub replayed: bool,
}

/// Outcome of a deposit: the wallet after the credit plus its ledger entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepositReceipt {
    pub wallet: WalletView,
    pub entry: LedgerEntry,
    pub replayed: bool,
}

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransferCommand {
    pub sender_id: UserId,
    pub recipient_id: UserId,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub request_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DepositCommand {
    pub user_id: UserId,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub request_key: Option<String>,
}
