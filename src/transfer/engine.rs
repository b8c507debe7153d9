//! Transfer Engine
//!
//! Orchestrates every balance mutation as one unit of work spanning the wallet
//! store and the ledger store.
//!
//! # Unit of work (transfer)
//!
//! ```text
//! replay check → begin → lock wallets (ascending user id) → debit → credit
//!              → save both → append entry → commit
//! ```
//!
//! Any failure inside the unit of work rolls it back. Validation, user lookups
//! and the request-key replay check happen before `begin`: they take no locks,
//! and an open transaction never waits on a second pooled connection. Two
//! requests racing past the replay check collide on the unique request key at
//! append or commit; the loser is retried and then replays.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::retry::{RetryPolicy, with_retry};
use crate::core_types::UserId;
use crate::error::LedgerError;
use crate::models::{
    DEFAULT_DEPOSIT_NOTE, DepositCommand, DepositReceipt, EntryView, LedgerEntry, NewLedgerEntry,
    TransferCommand, TransferReceipt, WalletView, normalize_note,
};
use crate::money;
use crate::store::{LedgerStore, UnitOfWork, UserDirectory, WalletStore};

pub struct TransferEngine<U, W, L, D> {
    uow: Arc<U>,
    wallets: Arc<W>,
    ledger: Arc<L>,
    users: Arc<D>,
    policy: RetryPolicy,
}

impl<S> TransferEngine<S, S, S, S>
where
    S: UnitOfWork + WalletStore<S::Tx> + LedgerStore<S::Tx> + UserDirectory,
{
    /// Engine over a single backend that provides every store
    pub fn from_store(store: Arc<S>, policy: RetryPolicy) -> Self {
        Self::new(store.clone(), store.clone(), store.clone(), store, policy)
    }
}

impl<U, W, L, D> TransferEngine<U, W, L, D>
where
    U: UnitOfWork,
    W: WalletStore<U::Tx>,
    L: LedgerStore<U::Tx>,
    D: UserDirectory,
{
    pub fn new(
        uow: Arc<U>,
        wallets: Arc<W>,
        ledger: Arc<L>,
        users: Arc<D>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            uow,
            wallets,
            ledger,
            users,
            policy,
        }
    }

    // ========================================================================
    // Deposit
    // ========================================================================

    /// Credit `amount` to the user's wallet
    pub async fn deposit(
        &self,
        user_id: UserId,
        amount: Decimal,
        note: Option<String>,
    ) -> Result<DepositReceipt, LedgerError> {
        self.execute_deposit(DepositCommand {
            user_id,
            amount,
            note,
            request_key: None,
        })
        .await
    }

    pub async fn execute_deposit(&self, cmd: DepositCommand) -> Result<DepositReceipt, LedgerError> {
        let amount = money::validate_amount(cmd.amount)?;
        let note = normalize_note(cmd.note)?.or_else(|| Some(DEFAULT_DEPOSIT_NOTE.to_string()));
        let entry = NewLedgerEntry::deposit(cmd.user_id, amount, note)
            .with_request_key(cmd.request_key)
            .validate()?;

        if !self.users.exists(cmd.user_id).await? {
            return Err(LedgerError::UserNotFound(cmd.user_id));
        }

        let entry = &entry;
        let receipt = with_retry(&self.policy, "deposit", move || self.deposit_once(entry)).await?;

        if !receipt.replayed {
            info!(
                user_id = cmd.user_id,
                entry_id = receipt.entry.id,
                amount = %amount,
                balance = %receipt.wallet.balance,
                "Deposit committed"
            );
        }
        Ok(receipt)
    }

    async fn deposit_once(&self, entry: &NewLedgerEntry) -> Result<DepositReceipt, LedgerError> {
        if let Some(existing) = self.replay(entry).await? {
            let user_id = entry.recipient_id;
            let wallet = self
                .wallets
                .find_by_user(user_id)
                .await?
                .ok_or(LedgerError::WalletNotFound(user_id))?;
            return Ok(DepositReceipt {
                wallet: wallet.view(),
                entry: existing,
                replayed: true,
            });
        }

        let mut tx = self.uow.begin().await?;
        debug!(user_id = entry.recipient_id, "Deposit unit of work started");
        let outcome = self.deposit_in(&mut tx, entry).await;
        self.finish(tx, "deposit", outcome).await
    }

    async fn deposit_in(
        &self,
        tx: &mut U::Tx,
        entry: &NewLedgerEntry,
    ) -> Result<DepositReceipt, LedgerError> {
        let user_id = entry.recipient_id;
        let mut wallet = self
            .wallets
            .lock_by_user(tx, user_id)
            .await?
            .ok_or(LedgerError::WalletNotFound(user_id))?;
        wallet.credit(entry.amount)?;

        let saved = self.wallets.save_balance(tx, &wallet).await?;
        let persisted = self.ledger.append(tx, entry.clone()).await?;

        Ok(DepositReceipt {
            wallet: saved.view(),
            entry: persisted,
            replayed: false,
        })
    }

    // ========================================================================
    // Transfer
    // ========================================================================

    /// Move `amount` from `sender_id` to `recipient_id`
    pub async fn transfer(
        &self,
        sender_id: UserId,
        recipient_id: UserId,
        amount: Decimal,
        note: Option<String>,
    ) -> Result<TransferReceipt, LedgerError> {
        self.execute_transfer(TransferCommand {
            sender_id,
            recipient_id,
            amount,
            note,
            request_key: None,
        })
        .await
    }

    pub async fn execute_transfer(
        &self,
        cmd: TransferCommand,
    ) -> Result<TransferReceipt, LedgerError> {
        let amount = money::validate_amount(cmd.amount)?;
        if cmd.sender_id == cmd.recipient_id {
            return Err(LedgerError::InvalidArgument(
                "cannot transfer to the same user".into(),
            ));
        }
        let entry = NewLedgerEntry::transfer(cmd.sender_id, cmd.recipient_id, amount, cmd.note)
            .with_request_key(cmd.request_key)
            .validate()?;

        let sender_name = self.resolve_user(cmd.sender_id).await?;
        let recipient_name = self.resolve_user(cmd.recipient_id).await?;

        let entry = &entry;
        let (persisted, replayed) =
            with_retry(&self.policy, "transfer", move || self.transfer_once(entry)).await?;

        if replayed {
            info!(
                entry_id = persisted.id,
                request_key = ?persisted.request_key,
                "Transfer replayed"
            );
        } else {
            info!(
                entry_id = persisted.id,
                sender_id = persisted.sender_id,
                recipient_id = persisted.recipient_id,
                amount = %persisted.amount,
                "Transfer committed"
            );
        }

        Ok(TransferReceipt {
            view: EntryView {
                entry: persisted,
                sender_name,
                recipient_name,
            },
            replayed,
        })
    }

    async fn transfer_once(
        &self,
        entry: &NewLedgerEntry,
    ) -> Result<(LedgerEntry, bool), LedgerError> {
        if let Some(existing) = self.replay(entry).await? {
            return Ok((existing, true));
        }

        let mut tx = self.uow.begin().await?;
        debug!(
            sender_id = entry.sender_id,
            recipient_id = entry.recipient_id,
            "Transfer unit of work started"
        );
        let outcome = self
            .transfer_in(&mut tx, entry)
            .await
            .map(|persisted| (persisted, false));
        self.finish(tx, "transfer", outcome).await
    }

    async fn transfer_in(
        &self,
        tx: &mut U::Tx,
        entry: &NewLedgerEntry,
    ) -> Result<LedgerEntry, LedgerError> {
        let (sender_id, recipient_id) = (entry.sender_id, entry.recipient_id);

        // Fixed lock order: two opposite transfers cannot deadlock
        let (sender, recipient) = if sender_id < recipient_id {
            let sender = self.wallets.lock_by_user(tx, sender_id).await?;
            let recipient = self.wallets.lock_by_user(tx, recipient_id).await?;
            (sender, recipient)
        } else {
            let recipient = self.wallets.lock_by_user(tx, recipient_id).await?;
            let sender = self.wallets.lock_by_user(tx, sender_id).await?;
            (sender, recipient)
        };
        let mut sender = sender.ok_or(LedgerError::WalletNotFound(sender_id))?;
        let mut recipient = recipient.ok_or(LedgerError::WalletNotFound(recipient_id))?;

        sender.debit(entry.amount)?;
        recipient.credit(entry.amount)?;

        self.wallets.save_balance(tx, &sender).await?;
        self.wallets.save_balance(tx, &recipient).await?;
        self.ledger.append(tx, entry.clone()).await
    }

    // ========================================================================
    // Wallet provisioning
    // ========================================================================

    /// Create the zero-balance wallet of a newly created user
    pub async fn open_wallet(&self, user_id: UserId) -> Result<WalletView, LedgerError> {
        if !self.users.exists(user_id).await? {
            return Err(LedgerError::UserNotFound(user_id));
        }

        let wallet = with_retry(&self.policy, "open_wallet", move || async move {
            let mut tx = self.uow.begin().await?;
            let outcome = self.wallets.create(&mut tx, user_id).await;
            self.finish(tx, "open_wallet", outcome).await
        })
        .await?;

        info!(user_id, wallet_id = wallet.id, "Wallet opened");
        Ok(wallet.view())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn resolve_user(&self, user_id: UserId) -> Result<String, LedgerError> {
        self.users
            .display_name(user_id)
            .await?
            .ok_or(LedgerError::UserNotFound(user_id))
    }

    /// Earlier entry recorded under the same request key, if any
    async fn replay(&self, entry: &NewLedgerEntry) -> Result<Option<LedgerEntry>, LedgerError> {
        let Some(key) = entry.request_key.as_deref() else {
            return Ok(None);
        };

        match self.ledger.find_by_request_key(key).await? {
            Some(existing) if existing.matches(entry) => {
                debug!(request_key = key, entry_id = existing.id, "Request key replay");
                Ok(Some(existing))
            }
            Some(existing) => Err(LedgerError::InvalidArgument(format!(
                "request key {} already used by entry {} with different parameters",
                key, existing.id
            ))),
            None => Ok(None),
        }
    }

    /// Commit on success, roll back on failure
    async fn finish<T>(
        &self,
        tx: U::Tx,
        operation: &'static str,
        outcome: Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        match outcome {
            Ok(value) => {
                self.uow.commit(tx).await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.uow.rollback(tx).await {
                    error!(operation, error = %rollback_err, "Rollback failed");
                }
                warn!(operation, code = e.code(), error = %e, "Unit of work rolled back");
                Err(e)
            }
        }
    }
}
