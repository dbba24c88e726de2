use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::conflict::validate_range;
use super::{Engine, EngineError};

/// Read surface. Every query returns a point-in-time snapshot taken under
/// the document's read lock; none of them block writers for longer than a
/// clone.
impl Engine {
    pub async fn balance_of(&self, account_id: Ulid) -> Result<Amount, EngineError> {
        let doc = self
            .store
            .account(&account_id)
            .ok_or(EngineError::NotFound(account_id))?;
        let guard = doc.read().await;
        Ok(guard.value.balance)
    }

    /// Full entry chain, oldest first.
    pub async fn ledger_of(&self, account_id: Ulid) -> Result<Vec<LedgerEntry>, EngineError> {
        let doc = self
            .store
            .account(&account_id)
            .ok_or(EngineError::NotFound(account_id))?;
        let guard = doc.read().await;
        Ok(guard.value.entries.clone())
    }

    pub async fn payments_of(
        &self,
        account_id: Ulid,
    ) -> Result<Vec<SourceTransaction>, EngineError> {
        let doc = self
            .store
            .account(&account_id)
            .ok_or(EngineError::NotFound(account_id))?;
        let guard = doc.read().await;
        Ok(guard.value.payments.clone())
    }

    pub async fn subscriptions_of(
        &self,
        account_id: Ulid,
    ) -> Result<Vec<SubscriptionState>, EngineError> {
        if !self.store.contains_account(&account_id) {
            return Err(EngineError::NotFound(account_id));
        }
        let mut subs = Vec::new();
        for id in self.store.subscription_ids_of(&account_id) {
            if let Some(doc) = self.store.subscription(&id) {
                subs.push(doc.read().await.value.clone());
            }
        }
        Ok(subs)
    }

    pub async fn sessions_of(&self, account_id: Ulid) -> Result<Vec<SessionRecord>, EngineError> {
        if !self.store.contains_account(&account_id) {
            return Err(EngineError::NotFound(account_id));
        }
        let mut sessions = Vec::new();
        for id in self.store.session_ids_of(&account_id) {
            if let Some(doc) = self.store.session(&id) {
                sessions.push(doc.read().await.value.clone());
            }
        }
        sessions.sort_by_key(|s| (s.date, s.range.start));
        Ok(sessions)
    }

    /// All reservations of one resource on one date, sorted by start.
    pub async fn slots_on(&self, resource_id: Ulid, date: NaiveDate) -> Vec<ReservedSlot> {
        match self.store.slot_page(&SlotKey { resource_id, date }) {
            Some(doc) => doc.read().await.value.slots.clone(),
            None => Vec::new(),
        }
    }

    /// Advisory pre-check for interfaces that want to grey out a slot before
    /// submitting. The booking path re-runs this check inside its commit, so
    /// an empty answer here is never a promise.
    pub async fn conflicts_on(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
        range: TimeRange,
    ) -> Result<Vec<ReservedSlot>, EngineError> {
        validate_range(&range)?;
        let Some(doc) = self.store.slot_page(&SlotKey { resource_id, date }) else {
            return Ok(Vec::new());
        };
        let guard = doc.read().await;
        Ok(guard.value.overlapping(&range).copied().collect())
    }

    /// One row per account, sorted by id (ULIDs order by creation time).
    pub async fn accounts_overview(&self) -> Vec<AccountOverview> {
        let mut rows = Vec::new();
        for id in self.store.account_ids() {
            if let Some(doc) = self.store.account(&id) {
                let guard = doc.read().await;
                rows.push(AccountOverview {
                    account_id: guard.value.id,
                    balance: guard.value.balance,
                    entries: guard.value.entries.len() as u64,
                    payments: guard.value.payments.len() as u64,
                    opened_at: guard.value.opened_at,
                });
            }
        }
        rows.sort_by_key(|r| r.account_id);
        rows
    }

    pub async fn status(&self) -> StatusInfo {
        StatusInfo {
            accounts: self.store.account_count() as u64,
            subscriptions: self.store.subscription_count() as u64,
            sessions: self.store.session_count() as u64,
            wal_appends_since_compact: self.wal_appends_since_compact().await,
        }
    }
}
