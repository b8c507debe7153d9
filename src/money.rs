//! Money Module
//!
//! Fixed-point amounts for wallet balances and ledger entries. All amounts are
//! `rust_decimal::Decimal` values with two fractional digits, matching the
//! `DECIMAL(18,2)` columns they are stored in. Binary floating point never
//! touches a balance.
//!
//! ## Design Principles
//! 1. Explicit Error Handling: no silent rounding or truncation
//! 2. Strict input format: `0.5` not `.5`, `5.0` not `5.`
//! 3. One scale everywhere: values leave this module rescaled to [`MONEY_SCALE`]
//!
//! ## Usage
//! ```rust
//! use wallet_ledger::money::{format_amount, parse_amount};
//!
//! let amount = parse_amount("400.5").unwrap();
//! assert_eq!(format_amount(amount), "400.50");
//! ```

use rust_decimal::prelude::*;
use thiserror::Error;

/// Fractional digits kept for every amount and balance
pub const MONEY_SCALE: u32 = 2;

/// Largest value a `DECIMAL(18,2)` column holds: 9999999999999999.99
pub const MAX_BALANCE: Decimal = Decimal::from_parts(
    // 999_999_999_999_999_999 split into lo/mid 32-bit words
    0xA763_FFFF,
    0x0DE0_B6B3,
    0,
    false,
    MONEY_SCALE,
);

// ============================================================================
// Error Types
// ============================================================================

/// Money validation errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Amount exceeds the maximum of {max}", max = MAX_BALANCE)]
    Overflow,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

// ============================================================================
// Parse & Validate
// ============================================================================

/// Parse a client-supplied amount string
///
/// # Errors
/// * `InvalidFormat` - empty, signed, `.5`, `5.`, exponent or non-digit input
/// * `PrecisionOverflow` - more than [`MONEY_SCALE`] fractional digits
/// * `InvalidAmount` - zero
/// * `Overflow` - above [`MAX_BALANCE`]
pub fn parse_amount(amount_str: &str) -> Result<Decimal, MoneyError> {
    let amount_str = amount_str.trim();
    if amount_str.is_empty() {
        return Err(MoneyError::InvalidFormat("empty string".into()));
    }

    if amount_str.starts_with('-') || amount_str.starts_with('+') {
        return Err(MoneyError::InvalidAmount);
    }

    let parts: Vec<&str> = amount_str.split('.').collect();
    match parts.as_slice() {
        [whole] => check_digits(whole)?,
        [whole, frac] => {
            if whole.is_empty() {
                return Err(MoneyError::InvalidFormat(
                    "missing leading zero (e.g., use 0.5 instead of .5)".into(),
                ));
            }
            if frac.is_empty() {
                return Err(MoneyError::InvalidFormat(
                    "missing fractional part (e.g., use 5.0 instead of 5.)".into(),
                ));
            }
            check_digits(whole)?;
            check_digits(frac)?;
        }
        _ => return Err(MoneyError::InvalidFormat("multiple decimal points".into())),
    }

    let decimal = Decimal::from_str(amount_str).map_err(|_| MoneyError::Overflow)?;
    validate_amount(decimal)
}

fn check_digits(part: &str) -> Result<(), MoneyError> {
    if part.chars().all(|c| c.is_ascii_digit()) {
        Ok(())
    } else {
        Err(MoneyError::InvalidFormat(format!(
            "invalid character in '{}'",
            part
        )))
    }
}

/// Validate a transfer/deposit amount and rescale it to [`MONEY_SCALE`]
///
/// Trailing zeros do not count against precision: `1.500` is accepted as `1.50`.
pub fn validate_amount(amount: Decimal) -> Result<Decimal, MoneyError> {
    if amount <= Decimal::ZERO {
        return Err(MoneyError::InvalidAmount);
    }

    let normalized = amount.normalize();
    if normalized.scale() > MONEY_SCALE {
        return Err(MoneyError::PrecisionOverflow {
            provided: normalized.scale(),
            max: MONEY_SCALE,
        });
    }

    if normalized > MAX_BALANCE {
        return Err(MoneyError::Overflow);
    }

    Ok(to_money_scale(normalized))
}

/// Check that a resulting balance still fits its column
pub fn check_balance(balance: Decimal) -> Result<Decimal, MoneyError> {
    if balance > MAX_BALANCE {
        return Err(MoneyError::Overflow);
    }
    Ok(to_money_scale(balance))
}

fn to_money_scale(value: Decimal) -> Decimal {
    let mut scaled = value;
    scaled.rescale(MONEY_SCALE);
    scaled
}

// ============================================================================
// Format
// ============================================================================

/// Format an amount for display, always with two fractional digits
pub fn format_amount(amount: Decimal) -> String {
    format!("{:.prec$}", amount, prec = MONEY_SCALE as usize)
}
