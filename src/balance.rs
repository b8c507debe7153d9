//! Balance Query Service
//!
//! Read-only projection of a wallet. Never takes part in a write unit of work.

use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, warn};

use crate::core_types::UserId;
use crate::error::LedgerError;
use crate::models::{Wallet, WalletView};
use crate::store::{LedgerReader, UserDirectory, WalletReader};

/// Wallet balance compared against the ledger's net flow for the user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reconciliation {
    pub user_id: UserId,
    #[serde(with = "rust_decimal::serde::str")]
    pub wallet_balance: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub ledger_balance: Decimal,
    pub consistent: bool,
}

pub struct BalanceService<W, L, D> {
    wallets: Arc<W>,
    ledger: Arc<L>,
    users: Arc<D>,
}

impl<W, L, D> BalanceService<W, L, D>
where
    W: WalletReader,
    L: LedgerReader,
    D: UserDirectory,
{
    pub fn new(wallets: Arc<W>, ledger: Arc<L>, users: Arc<D>) -> Self {
        Self {
            wallets,
            ledger,
            users,
        }
    }

    /// Current wallet projection
    ///
    /// # Errors
    /// * `UserNotFound` - unknown user
    /// * `WalletNotFound` - user exists without a wallet (integrity violation)
    pub async fn get_balance(&self, user_id: UserId) -> Result<WalletView, LedgerError> {
        let wallet = self.load(user_id).await?;
        Ok(wallet.view())
    }

    /// Compare the stored balance with the sum of the user's ledger entries
    pub async fn reconcile(&self, user_id: UserId) -> Result<Reconciliation, LedgerError> {
        let wallet = self.load(user_id).await?;
        let ledger_balance = self.ledger.net_flow(user_id).await?;
        let consistent = wallet.balance == ledger_balance;

        if !consistent {
            warn!(
                user_id,
                wallet_balance = %wallet.balance,
                ledger_balance = %ledger_balance,
                "Wallet balance does not match ledger"
            );
        }

        Ok(Reconciliation {
            user_id,
            wallet_balance: wallet.balance,
            ledger_balance,
            consistent,
        })
    }

    async fn load(&self, user_id: UserId) -> Result<Wallet, LedgerError> {
        if !self.users.exists(user_id).await? {
            return Err(LedgerError::UserNotFound(user_id));
        }

        let wallet = self
            .wallets
            .find_by_user(user_id)
            .await?
            .ok_or_else(|| {
                error!(user_id, "User has no wallet");
                LedgerError::WalletNotFound(user_id)
            })?;

        if wallet.balance < Decimal::ZERO {
            error!(user_id, balance = %wallet.balance, "Negative balance read");
            return Err(LedgerError::storage(format!(
                "wallet {} holds a negative balance",
                wallet.id
            )));
        }
        Ok(wallet)
    }
}

impl<S> BalanceService<S, S, S>
where
    S: WalletReader + LedgerReader + UserDirectory,
{
    pub fn from_store(store: Arc<S>) -> Self {
        Self::new(store.clone(), store.clone(), store)
    }
}
