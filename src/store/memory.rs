//! In-process ledger backend
//!
//! Same transactional semantics as the PostgreSQL backend:
//! - a wallet row lock is held from `lock_by_user` until the unit of work ends
//! - writes are staged on the transaction and applied on commit
//! - dropping a transaction without committing discards its writes
//!
//! Also carries fault injection so tests can force conflicts, failed appends
//! and slow commits.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{
    LedgerReader, LedgerStore, PageRequest, PeriodFilter, UnitOfWork, UserDirectory,
    WalletReader, WalletStore,
};
use crate::core_types::{EntryId, UserId, WalletId};
use crate::error::LedgerError;
use crate::models::{LedgerEntry, NewLedgerEntry, Wallet};

#[derive(Default)]
struct MemoryState {
    users: HashMap<UserId, String>,
    wallets: HashMap<UserId, Wallet>,
    entries: Vec<LedgerEntry>,
}

#[derive(Default)]
struct FaultPlan {
    conflicts: AtomicU32,
    failing_appends: AtomicU32,
    commit_delay_ms: AtomicU64,
}

/// Consume one pending fault, if any
fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Open unit of work on a [`MemoryLedger`]
pub struct MemoryTx {
    locks: HashMap<UserId, OwnedMutexGuard<()>>,
    wallets: HashMap<UserId, Wallet>,
    entries: Vec<LedgerEntry>,
}

impl MemoryTx {
    fn holds(&self, user_id: UserId) -> bool {
        self.locks.contains_key(&user_id)
    }
}

/// In-process wallets, ledger and user directory
#[derive(Default)]
pub struct MemoryLedger {
    state: RwLock<MemoryState>,
    row_locks: DashMap<UserId, Arc<Mutex<()>>>,
    next_wallet_id: AtomicI64,
    next_entry_id: AtomicI64,
    faults: FaultPlan,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>, LedgerError> {
        self.state
            .read()
            .map_err(|_| LedgerError::storage("memory ledger state poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>, LedgerError> {
        self.state
            .write()
            .map_err(|_| LedgerError::storage("memory ledger state poisoned"))
    }

    /// Register a user in the directory
    pub fn add_user(&self, user_id: UserId, name: impl Into<String>) -> Result<(), LedgerError> {
        self.write()?.users.insert(user_id, name.into());
        Ok(())
    }

    /// Overwrite a committed balance without a ledger entry
    ///
    /// Only for exercising integrity checks; bypasses every invariant.
    pub fn set_balance(&self, user_id: UserId, balance: Decimal) -> Result<(), LedgerError> {
        let mut state = self.write()?;
        let wallet = state
            .wallets
            .get_mut(&user_id)
            .ok_or(LedgerError::WalletNotFound(user_id))?;
        wallet.balance = balance;
        wallet.version += 1;
        Ok(())
    }

    /// Sum of all committed balances
    pub fn total_balance(&self) -> Result<Decimal, LedgerError> {
        Ok(self.read()?.wallets.values().map(|w| w.balance).sum())
    }

    pub fn entry_count(&self) -> Result<usize, LedgerError> {
        Ok(self.read()?.entries.len())
    }

    // === Fault injection ===

    /// The next `n` balance writes fail with `ConcurrencyConflict`
    pub fn inject_conflicts(&self, n: u32) {
        self.faults.conflicts.store(n, Ordering::SeqCst);
    }

    /// The next `n` ledger appends fail with a non-transient `StorageFailure`
    pub fn fail_next_appends(&self, n: u32) {
        self.faults.failing_appends.store(n, Ordering::SeqCst);
    }

    /// Delay every commit, before anything is applied
    pub fn set_commit_delay(&self, delay: Duration) {
        self.faults
            .commit_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn acquire_row(&self, tx: &mut MemoryTx, user_id: UserId) {
        if tx.holds(user_id) {
            return;
        }
        // Clone the Arc so the DashMap shard is released before awaiting
        let lock = self.row_locks.entry(user_id).or_default().clone();
        let guard = lock.lock_owned().await;
        tx.locks.insert(user_id, guard);
    }

    fn current_wallet(
        &self,
        tx: &MemoryTx,
        user_id: UserId,
    ) -> Result<Option<Wallet>, LedgerError> {
        if let Some(staged) = tx.wallets.get(&user_id) {
            return Ok(Some(staged.clone()));
        }
        Ok(self.read()?.wallets.get(&user_id).cloned())
    }
}

fn newest_first(mut entries: Vec<LedgerEntry>) -> Vec<LedgerEntry> {
    entries.sort_by(|a, b| {
        b.occurred_at
            .cmp(&a.occurred_at)
            .then_with(|| b.id.cmp(&a.id))
    });
    entries
}

#[async_trait]
impl UnitOfWork for MemoryLedger {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, LedgerError> {
        Ok(MemoryTx {
            locks: HashMap::new(),
            wallets: HashMap::new(),
            entries: Vec::new(),
        })
    }

    async fn commit(&self, tx: MemoryTx) -> Result<(), LedgerError> {
        let delay = self.faults.commit_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let mut state = self.write()?;
        for entry in &tx.entries {
            if let Some(key) = &entry.request_key {
                if state
                    .entries
                    .iter()
                    .any(|e| e.request_key.as_deref() == Some(key.as_str()))
                {
                    return Err(LedgerError::ConcurrencyConflict(format!(
                        "request key {} recorded concurrently",
                        key
                    )));
                }
            }
        }

        let MemoryTx {
            locks,
            wallets,
            entries,
        } = tx;
        state.wallets.extend(wallets);
        state.entries.extend(entries);
        drop(state);

        // Row locks are released only after the writes are visible
        drop(locks);
        Ok(())
    }

    async fn rollback(&self, tx: MemoryTx) -> Result<(), LedgerError> {
        drop(tx);
        Ok(())
    }
}

// ============================================================================
// Wallets
// ============================================================================

#[async_trait]
impl WalletReader for MemoryLedger {
    async fn find_by_user(&self, user_id: UserId) -> Result<Option<Wallet>, LedgerError> {
        Ok(self.read()?.wallets.get(&user_id).cloned())
    }
}

#[async_trait]
impl WalletStore<MemoryTx> for MemoryLedger {
    async fn lock_by_user(
        &self,
        tx: &mut MemoryTx,
        user_id: UserId,
    ) -> Result<Option<Wallet>, LedgerError> {
        self.acquire_row(tx, user_id).await;
        self.current_wallet(tx, user_id)
    }

    async fn save_balance(&self, tx: &mut MemoryTx, wallet: &Wallet) -> Result<Wallet, LedgerError> {
        if take(&self.faults.conflicts) {
            return Err(LedgerError::ConcurrencyConflict(format!(
                "wallet {} changed since version {}",
                wallet.id, wallet.version
            )));
        }

        self.acquire_row(tx, wallet.user_id).await;
        let current = self
            .current_wallet(tx, wallet.user_id)?
            .filter(|w| w.id == wallet.id && w.version == wallet.version)
            .ok_or_else(|| {
                LedgerError::ConcurrencyConflict(format!(
                    "wallet {} changed since version {}",
                    wallet.id, wallet.version
                ))
            })?;

        let saved = Wallet {
            balance: wallet.balance,
            version: current.version + 1,
            updated_at: Utc::now(),
            ..current
        };
        tx.wallets.insert(saved.user_id, saved.clone());
        Ok(saved)
    }

    async fn create(&self, tx: &mut MemoryTx, user_id: UserId) -> Result<Wallet, LedgerError> {
        self.acquire_row(tx, user_id).await;

        if !self.read()?.users.contains_key(&user_id) {
            return Err(LedgerError::storage(format!(
                "wallet owner {} violates users foreign key",
                user_id
            )));
        }
        if self.current_wallet(tx, user_id)?.is_some() {
            return Err(LedgerError::InvalidArgument(format!(
                "user {} already has a wallet",
                user_id
            )));
        }

        let now = Utc::now();
        let id: WalletId = self.next_wallet_id.fetch_add(1, Ordering::SeqCst) + 1;
        let wallet = Wallet {
            id,
            user_id,
            balance: Decimal::ZERO,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        tx.wallets.insert(user_id, wallet.clone());
        Ok(wallet)
    }
}

// ============================================================================
// Ledger
// ============================================================================

#[async_trait]
impl LedgerReader for MemoryLedger {
    async fn list_by_user(&self, user_id: UserId) -> Result<Vec<LedgerEntry>, LedgerError> {
        let state = self.read()?;
        let entries = state
            .entries
            .iter()
            .filter(|e| e.involves(user_id))
            .cloned()
            .collect();
        Ok(newest_first(entries))
    }

    async fn list_in_period(
        &self,
        user_id: UserId,
        period: &PeriodFilter,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let state = self.read()?;
        let entries = state
            .entries
            .iter()
            .filter(|e| e.involves(user_id) && period.contains(e.occurred_at))
            .cloned()
            .collect();
        Ok(newest_first(entries))
    }

    async fn list_page(
        &self,
        user_id: UserId,
        request: PageRequest,
    ) -> Result<(Vec<LedgerEntry>, u64), LedgerError> {
        let all = self.list_by_user(user_id).await?;
        let total = all.len() as u64;
        let items = all
            .into_iter()
            .skip(request.offset() as usize)
            .take(request.limit() as usize)
            .collect();
        Ok((items, total))
    }

    async fn find_by_request_key(&self, key: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        let state = self.read()?;
        Ok(state
            .entries
            .iter()
            .find(|e| e.request_key.as_deref() == Some(key))
            .cloned())
    }

    async fn net_flow(&self, user_id: UserId) -> Result<Decimal, LedgerError> {
        let state = self.read()?;
        Ok(state.entries.iter().map(|e| e.effect_on(user_id)).sum())
    }
}

#[async_trait]
impl LedgerStore<MemoryTx> for MemoryLedger {
    async fn append(
        &self,
        tx: &mut MemoryTx,
        entry: NewLedgerEntry,
    ) -> Result<LedgerEntry, LedgerError> {
        if take(&self.faults.failing_appends) {
            return Err(LedgerError::storage("injected ledger append failure"));
        }

        if let Some(key) = &entry.request_key {
            if self.find_by_request_key(key).await?.is_some() {
                return Err(LedgerError::ConcurrencyConflict(format!(
                    "request key {} recorded concurrently",
                    key
                )));
            }
        }

        let id: EntryId = self.next_entry_id.fetch_add(1, Ordering::SeqCst) + 1;
        let persisted = LedgerEntry {
            id,
            amount: entry.amount,
            note: entry.note,
            kind: entry.kind,
            occurred_at: entry.occurred_at.unwrap_or_else(Utc::now),
            sender_id: entry.sender_id,
            recipient_id: entry.recipient_id,
            request_key: entry.request_key,
        };
        tx.entries.push(persisted.clone());
        Ok(persisted)
    }
}

// ============================================================================
// Users
// ============================================================================

#[async_trait]
impl UserDirectory for MemoryLedger {
    async fn exists(&self, user_id: UserId) -> Result<bool, LedgerError> {
        Ok(self.read()?.users.contains_key(&user_id))
    }

    async fn display_name(&self, user_id: UserId) -> Result<Option<String>, LedgerError> {
        Ok(self.read()?.users.get(&user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn ledger_with_wallet(user: UserId) -> MemoryLedger {
        let ledger = MemoryLedger::new();
        ledger.add_user(user, "alice").unwrap();
        let mut tx = ledger.begin().await.unwrap();
        ledger.create(&mut tx, user).await.unwrap();
        ledger.commit(tx).await.unwrap();
        ledger
    }

    #[tokio::test]
    async fn test_staged_writes_invisible_until_commit() {
        let ledger = ledger_with_wallet(1).await;

        let mut tx = ledger.begin().await.unwrap();
        let mut wallet = ledger.lock_by_user(&mut tx, 1).await.unwrap().unwrap();
        wallet.credit(dec!(10)).unwrap();
        ledger.save_balance(&mut tx, &wallet).await.unwrap();
        ledger
            .append(&mut tx, NewLedgerEntry::deposit(1, dec!(10), None))
            .await
            .unwrap();

        assert_eq!(ledger.find_by_user(1).await.unwrap().unwrap().balance, Decimal::ZERO);
        assert_eq!(ledger.entry_count().unwrap(), 0);

        ledger.commit(tx).await.unwrap();
        assert_eq!(ledger.find_by_user(1).await.unwrap().unwrap().balance, dec!(10));
        assert_eq!(ledger.entry_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_drop_rolls_back() {
        let ledger = ledger_with_wallet(1).await;
        {
            let mut tx = ledger.begin().await.unwrap();
            let mut wallet = ledger.lock_by_user(&mut tx, 1).await.unwrap().unwrap();
            wallet.credit(dec!(5)).unwrap();
            ledger.save_balance(&mut tx, &wallet).await.unwrap();
        }
        assert_eq!(ledger.find_by_user(1).await.unwrap().unwrap().balance, Decimal::ZERO);

        // Lock was released by the drop
        let mut tx = ledger.begin().await.unwrap();
        assert!(ledger.lock_by_user(&mut tx, 1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let ledger = ledger_with_wallet(1).await;
        let mut tx = ledger.begin().await.unwrap();
        let wallet = ledger.lock_by_user(&mut tx, 1).await.unwrap().unwrap();
        ledger.save_balance(&mut tx, &wallet).await.unwrap();

        let err = ledger.save_balance(&mut tx, &wallet).await.unwrap_err();
        assert!(matches!(err, LedgerError::ConcurrencyConflict(_)));
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed() {
        let ledger = ledger_with_wallet(1).await;
        ledger.inject_conflicts(1);
        ledger.fail_next_appends(1);

        let mut tx = ledger.begin().await.unwrap();
        let wallet = ledger.lock_by_user(&mut tx, 1).await.unwrap().unwrap();
        assert!(ledger.save_balance(&mut tx, &wallet).await.is_err());
        assert!(ledger.save_balance(&mut tx, &wallet).await.is_ok());

        let deposit = NewLedgerEntry::deposit(1, dec!(1), None);
        assert!(ledger.append(&mut tx, deposit.clone()).await.is_err());
        assert!(ledger.append(&mut tx, deposit).await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_wallet_rejected() {
        let ledger = ledger_with_wallet(1).await;
        let mut tx = ledger.begin().await.unwrap();
        let err = ledger.create(&mut tx, 1).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_request_key_unique_at_commit() {
        let ledger = ledger_with_wallet(1).await;
        let keyed = NewLedgerEntry::deposit(1, dec!(1), None).with_request_key(Some("k-1".into()));

        let mut first = ledger.begin().await.unwrap();
        let mut second = ledger.begin().await.unwrap();
        ledger.append(&mut first, keyed.clone()).await.unwrap();
        ledger.append(&mut second, keyed).await.unwrap();

        ledger.commit(first).await.unwrap();
        let err = ledger.commit(second).await.unwrap_err();
        assert!(matches!(err, LedgerError::ConcurrencyConflict(_)));
        assert_eq!(ledger.entry_count().unwrap(), 1);
    }
}
