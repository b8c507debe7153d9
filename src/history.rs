//! Transaction history listings
//!
//! Wraps the ledger queries with a user existence check and resolves party
//! display names for presentation.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use crate::core_types::UserId;
use crate::error::LedgerError;
use crate::models::{EntryView, LedgerEntry};
use crate::store::{LedgerReader, Page, UserDirectory};

/// Shown when a party's name cannot be resolved
pub const UNKNOWN_USER: &str = "unknown user";

pub struct HistoryService<L, D> {
    ledger: Arc<L>,
    users: Arc<D>,
}

impl<L, D> HistoryService<L, D>
where
    L: LedgerReader,
    D: UserDirectory,
{
    pub fn new(ledger: Arc<L>, users: Arc<D>) -> Self {
        Self { ledger, users }
    }

    /// Every entry involving the user, newest first
    pub async fn list(&self, user_id: UserId) -> Result<Vec<EntryView>, LedgerError> {
        self.ensure_user(user_id).await?;
        let entries = self.ledger.list_by_user(user_id).await?;
        self.decorate(entries).await
    }

    /// Entries in `[start, end]`, `end` inclusive through its calendar day
    pub async fn list_in_period(
        &self,
        user_id: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EntryView>, LedgerError> {
        self.ensure_user(user_id).await?;
        let entries = self
            .ledger
            .list_by_user_and_period(user_id, start, end)
            .await?;
        self.decorate(entries).await
    }

    pub async fn list_page(
        &self,
        user_id: UserId,
        page: i64,
        page_size: i64,
    ) -> Result<Page<EntryView>, LedgerError> {
        self.ensure_user(user_id).await?;
        let page = self
            .ledger
            .list_by_user_paginated(user_id, page, page_size)
            .await?;

        let names = self.names_for(&page.items).await?;
        Ok(page.map(|entry| with_names(entry, &names)))
    }

    async fn ensure_user(&self, user_id: UserId) -> Result<(), LedgerError> {
        if self.users.exists(user_id).await? {
            Ok(())
        } else {
            Err(LedgerError::UserNotFound(user_id))
        }
    }

    async fn decorate(&self, entries: Vec<LedgerEntry>) -> Result<Vec<EntryView>, LedgerError> {
        let names = self.names_for(&entries).await?;
        Ok(entries
            .into_iter()
            .map(|entry| with_names(entry, &names))
            .collect())
    }

    /// One directory lookup per distinct party
    async fn names_for(
        &self,
        entries: &[LedgerEntry],
    ) -> Result<HashMap<UserId, String>, LedgerError> {
        let mut names = HashMap::new();
        for id in entries.iter().flat_map(|e| [e.sender_id, e.recipient_id]) {
            if names.contains_key(&id) {
                continue;
            }
            let name = self
                .users
                .display_name(id)
                .await?
                .unwrap_or_else(|| UNKNOWN_USER.to_string());
            names.insert(id, name);
        }
        Ok(names)
    }
}

impl<S> HistoryService<S, S>
where
    S: LedgerReader + UserDirectory,
{
    pub fn from_store(store: Arc<S>) -> Self {
        Self::new(store.clone(), store)
    }
}

fn with_names(entry: LedgerEntry, names: &HashMap<UserId, String>) -> EntryView {
    let name_of = |id: UserId| {
        names
            .get(&id)
            .cloned()
            .unwrap_or_else(|| UNKNOWN_USER.to_string())
    };
    EntryView {
        sender_name: name_of(entry.sender_id),
        recipient_name: name_of(entry.recipient_id),
        entry,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryLedger;
    use crate::transfer::{MemoryTransferEngine, RetryPolicy};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    async fn setup() -> (Arc<MemoryLedger>, HistoryService<MemoryLedger, MemoryLedger>) {
        let store = Arc::new(MemoryLedger::new());
        let engine = MemoryTransferEngine::from_store(store.clone(), RetryPolicy::default());
        for (id, name) in [(1, "alice"), (2, "bob"), (3, "carol")] {
            store.add_user(id, name).unwrap();
            engine.open_wallet(id).await.unwrap();
        }
        engine.deposit(1, dec!(100), Some("salary".into())).await.unwrap();
        engine.transfer(1, 2, dec!(10), None).await.unwrap();
        engine.transfer(1, 3, dec!(20), None).await.unwrap();
        engine.transfer(2, 1, dec!(5), None).await.unwrap();
        (store.clone(), HistoryService::from_store(store))
    }

    #[tokio::test]
    async fn test_list_newest_first_with_names() {
        let (_store, history) = setup().await;
        let views = history.list(1).await.unwrap();

        assert_eq!(views.len(), 4);
        for pair in views.windows(2) {
            assert!(pair[0].entry.id > pair[1].entry.id);
        }
        assert_eq!(views[0].sender_name, "bob");
        assert_eq!(views[0].recipient_name, "alice");

        // Bob sees entries where he is either party
        assert_eq!(history.list(2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_user_rejected() {
        let (_store, history) = setup().await;
        assert_eq!(history.list(42).await.unwrap_err(), LedgerError::UserNotFound(42));
        assert_eq!(
            history.list_page(42, 1, 10).await.unwrap_err(),
            LedgerError::UserNotFound(42)
        );
    }

    #[tokio::test]
    async fn test_period_listing() {
        let (_store, history) = setup().await;
        let now = Utc::now();

        let today = history.list_in_period(1, now - Duration::days(1), now).await.unwrap();
        assert_eq!(today.len(), 4);

        let past = history
            .list_in_period(1, now - Duration::days(10), now - Duration::days(5))
            .await
            .unwrap();
        assert!(past.is_empty());

        assert!(matches!(
            history.list_in_period(1, now, now - Duration::days(1)).await,
            Err(LedgerError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_paging_clamps_size() {
        let (_store, history) = setup().await;

        let page = history.list_page(1, 0, 500).await.unwrap();
        assert_eq!(page.page, 1);
        assert_eq!(page.page_size, 10);
        assert_eq!(page.total_count, 4);
        assert_eq!(page.items.len(), 4);

        let second = history.list_page(1, 2, 3).await.unwrap();
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.total_pages, 2);
        assert!(second.has_previous_page);
        assert!(!second.has_next_page);
        assert_eq!(second.items[0].entry.note.as_deref(), Some("salary"));
    }
}
