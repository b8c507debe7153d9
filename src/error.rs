//! Ledger Error Types
//!
//! One error taxonomy for every wallet and ledger operation. Domain failures
//! (not-found, invalid input, insufficient funds) are values, never panics.
//! Storage failures carry a `transient` flag that drives the retry loop of the
//! transfer engine.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::core_types::UserId;
use crate::money::MoneyError;

/// PostgreSQL SQLSTATE codes treated as a lost race on a wallet row
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Ledger error types
///
/// `Clone` so the same error can be observed by each attempt of a retried
/// unit of work and still be returned to the caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    // === Lookup Errors ===
    #[error("User not found: {0}")]
    UserNotFound(UserId),

    /// User exists but has no wallet - a data-integrity anomaly
    #[error("Wallet not found for user {0}")]
    WalletNotFound(UserId),

    // === Validation Errors ===
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds {
        available: Decimal,
        requested: Decimal,
    },

    // === Storage Errors ===
    /// The unit of work lost a race on a wallet row
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Storage failure: {message}")]
    StorageFailure { message: String, transient: bool },
}

impl LedgerError {
    /// Non-transient storage failure
    pub fn storage(message: impl Into<String>) -> Self {
        LedgerError::StorageFailure {
            message: message.into(),
            transient: false,
        }
    }

    /// Transient storage failure (connectivity, timeout) - safe to re-run the unit of work
    pub fn transient(message: impl Into<String>) -> Self {
        LedgerError::StorageFailure {
            message: message.into(),
            transient: true,
        }
    }

    /// Whether re-running the whole unit of work may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::ConcurrencyConflict(_)
                | LedgerError::StorageFailure {
                    transient: true,
                    ..
                }
        )
    }

    /// Convert a retryable error into the failure surfaced once retries are spent
    pub fn exhausted(self, attempts: u32) -> Self {
        match self {
            LedgerError::ConcurrencyConflict(message)
            | LedgerError::StorageFailure {
                message,
                transient: true,
            } => LedgerError::transient(format!("{} (gave up after {} attempts)", message, attempts)),
            other => other,
        }
    }

    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::UserNotFound(_) => "USER_NOT_FOUND",
            LedgerError::WalletNotFound(_) => "WALLET_NOT_FOUND",
            LedgerError::InvalidArgument(_) => "INVALID_ARGUMENT",
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LedgerError::ConcurrencyConflict(_) => "CONCURRENCY_CONFLICT",
            LedgerError::StorageFailure { .. } => "STORAGE_FAILURE",
        }
    }

    /// Get HTTP status code suggestion for the boundary layer
    pub fn http_status(&self) -> u16 {
        match self {
            LedgerError::UserNotFound(_) | LedgerError::WalletNotFound(_) => 404,
            LedgerError::InvalidArgument(_) | LedgerError::InsufficientFunds { .. } => 400,
            LedgerError::ConcurrencyConflict(_) | LedgerError::StorageFailure { .. } => 500,
        }
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) => match db.code().as_deref() {
                Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) | Some(LOCK_NOT_AVAILABLE) => {
                    LedgerError::ConcurrencyConflict(db.message().to_string())
                }
                _ => LedgerError::storage(e.to_string()),
            },
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                LedgerError::transient(e.to_string())
            }
            _ => LedgerError::storage(e.to_string()),
        }
    }
}

impl From<MoneyError> for LedgerError {
    fn from(e: MoneyError) -> Self {
        LedgerError::InvalidArgument(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_error_codes() {
        assert_eq!(LedgerError::UserNotFound(1).code(), "USER_NOT_FOUND");
        assert_eq!(
            LedgerError::InsufficientFunds {
                available: dec!(50),
                requested: dec!(100)
            }
            .code(),
            "INSUFFICIENT_FUNDS"
        );
        assert_eq!(LedgerError::storage("x").code(), "STORAGE_FAILURE");
    }

    #[test]
    fn test_http_status() {
        assert_eq!(LedgerError::UserNotFound(7).http_status(), 404);
        assert_eq!(LedgerError::WalletNotFound(7).http_status(), 404);
        assert_eq!(
            LedgerError::InvalidArgument("self transfer".into()).http_status(),
            400
        );
        assert_eq!(
            LedgerError::InsufficientFunds {
                available: dec!(0),
                requested: dec!(1)
            }
            .http_status(),
            400
        );
        assert_eq!(LedgerError::transient("pool").http_status(), 500);
    }

    #[test]
    fn test_retry_classification() {
        assert!(LedgerError::ConcurrencyConflict("row".into()).is_retryable());
        assert!(LedgerError::transient("io").is_retryable());
        assert!(!LedgerError::storage("constraint").is_retryable());
        assert!(!LedgerError::UserNotFound(1).is_retryable());
        assert!(
            !LedgerError::InsufficientFunds {
                available: dec!(1),
                requested: dec!(2)
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_exhausted_conflict_becomes_transient_storage() {
        let err = LedgerError::ConcurrencyConflict("wallet 3 changed".into()).exhausted(3);
        match err {
            LedgerError::StorageFailure { message, transient } => {
                assert!(transient);
                assert!(message.contains("3 attempts"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let domain = LedgerError::WalletNotFound(2).exhausted(3);
        assert_eq!(domain, LedgerError::WalletNotFound(2));
    }

    #[test]
    fn test_sqlx_pool_timeout_is_transient() {
        let err: LedgerError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_retryable());
        let err: LedgerError = sqlx::Error::RowNotFound.into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_money_error_is_invalid_argument() {
        let err: LedgerError = MoneyError::InvalidAmount.into();
        assert!(matches!(err, LedgerError::InvalidArgument(_)));
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn test_display() {
        assert_eq!(LedgerError::UserNotFound(42).to_string(), "User not found: 42");
    }
}
