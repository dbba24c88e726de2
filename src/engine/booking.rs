use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, now_ms, validate_range};
use super::entitlement::check_reservable;
use super::ledger::{build_entry, validate_amount};
use super::{Engine, EngineError, SharedDoc, check_version};

/// Charge worked out from snapshots, certified and applied at commit.
enum ChargePlan {
    Pack {
        doc: SharedDoc<SubscriptionState>,
        version: u64,
        subscription_id: Ulid,
        remaining_after: u32,
    },
    Annual {
        subscription_id: Ulid,
    },
    Balance {
        doc: SharedDoc<AccountState>,
        version: u64,
        entry: LedgerEntry,
    },
}

impl Engine {
    /// Book a slot. Validation runs in a fixed order — slot shape, conflict,
    /// entitlement or funds — so a request that both collides and lacks
    /// funds reports the collision. Session record, reserved slot and charge
    /// then land in one conditional write: every snapshot version is
    /// re-checked under the write locks before the WAL append, and a moved
    /// version restarts the whole attempt. No partial state survives a loss.
    ///
    /// The session id is claimed for the duration of the call; of two racing
    /// bookings with the same id, one charges and the other reports
    /// `AlreadyExists`.
    pub async fn create_booking(
        &self,
        session_id: Ulid,
        account_id: Ulid,
        resource_id: Ulid,
        date: NaiveDate,
        range: TimeRange,
        funding: Funding,
    ) -> Result<SessionRecord, EngineError> {
        validate_range(&range)?;
        if let Funding::Balance(price) = funding {
            validate_amount(price)?;
        }
        if !self.store.contains_account(&account_id) {
            return Err(EngineError::NotFound(account_id));
        }
        // The claim is the only duplicate guard that holds across slot pages:
        // same-id racers on different pages share no document lock, so the
        // commit certification alone would let both through.
        if !self.store.claim_session_id(session_id) {
            return Err(EngineError::AlreadyExists(session_id));
        }
        let result = self
            .create_booking_claimed(session_id, account_id, resource_id, date, range, funding)
            .await;
        self.store.release_session_id(&session_id);
        result
    }

    async fn create_booking_claimed(
        &self,
        session_id: Ulid,
        account_id: Ulid,
        resource_id: Ulid,
        date: NaiveDate,
        range: TimeRange,
        funding: Funding,
    ) -> Result<SessionRecord, EngineError> {
        if self.store.contains_session(&session_id) {
            return Err(EngineError::AlreadyExists(session_id));
        }
        if self.store.session_ids_of(&account_id).len() >= MAX_SESSIONS_PER_ACCOUNT {
            return Err(EngineError::LimitExceeded("too many sessions"));
        }
        self.retry_commit(EngineError::BookingUnavailable, || {
            self.try_create_booking(session_id, account_id, resource_id, date, range, funding)
        })
        .await
    }

    async fn try_create_booking(
        &self,
        session_id: Ulid,
        account_id: Ulid,
        resource_id: Ulid,
        date: NaiveDate,
        range: TimeRange,
        funding: Funding,
    ) -> Result<SessionRecord, EngineError> {
        let now = now_ms();
        let key = SlotKey { resource_id, date };

        // Conflict check against a page snapshot. A missing page reads as an
        // empty one at version 0; it is materialized only at the commit
        // below, so rejected bookings never leave pages behind. The commit
        // certifies the version either way, and a page another writer
        // created in the meantime has moved past 0, so check and insert
        // behave as one conditional write even though the lock is dropped in
        // between.
        let page_version = match self.store.slot_page(&key) {
            Some(doc) => {
                let guard = doc.read().await;
                if guard.value.slots.len() >= MAX_SLOTS_PER_PAGE {
                    return Err(EngineError::LimitExceeded("too many slots on this day"));
                }
                check_no_conflict(&guard.value, &range)?;
                guard.version
            }
            None => 0,
        };

        let plan = match funding {
            Funding::Subscription(sub_id) => {
                let doc = self
                    .store
                    .subscription(&sub_id)
                    .ok_or(EngineError::NotFound(sub_id))?;
                let guard = doc.read().await;
                let sub = &guard.value;
                if sub.account_id != account_id {
                    return Err(EngineError::Forbidden(
                        "subscription belongs to a different account",
                    ));
                }
                check_reservable(sub, now)?;
                match sub.plan {
                    Plan::SessionPack { remaining, .. } => ChargePlan::Pack {
                        version: guard.version,
                        subscription_id: sub_id,
                        remaining_after: remaining - 1,
                        doc: doc.clone(),
                    },
                    Plan::Annual { .. } => ChargePlan::Annual { subscription_id: sub_id },
                }
            }
            Funding::Balance(price) => {
                let doc = self
                    .store
                    .account(&account_id)
                    .ok_or(EngineError::NotFound(account_id))?;
                let guard = doc.read().await;
                let entry = build_entry(
                    &guard.value,
                    Direction::Debit,
                    price,
                    EntryCause::Purchase { session_id },
                    Actor::Account(account_id),
                )?;
                ChargePlan::Balance {
                    version: guard.version,
                    entry,
                    doc: doc.clone(),
                }
            }
        };

        let session = SessionRecord {
            id: session_id,
            account_id,
            subscription_id: match funding {
                Funding::Subscription(sub_id) => Some(sub_id),
                Funding::Balance(_) => None,
            },
            resource_id,
            date,
            range,
            status: SessionStatus::Scheduled,
            booked_at: now,
            closed_at: None,
        };
        let charge = match &plan {
            ChargePlan::Pack { subscription_id, remaining_after, .. } => Charge::Pack {
                subscription_id: *subscription_id,
                remaining_after: *remaining_after,
            },
            ChargePlan::Annual { subscription_id } => Charge::Annual {
                subscription_id: *subscription_id,
            },
            ChargePlan::Balance { entry, .. } => Charge::Balance { entry: entry.clone() },
        };
        let event = Event::BookingCreated { session: session.clone(), charge };

        // Commit point. Fixed lock order: account or subscription, then the
        // slot page, which is materialized only now that every validation
        // has passed.
        let page_doc = self.store.slot_page_or_empty(key);
        match plan {
            ChargePlan::Pack { doc, version, remaining_after, .. } => {
                let mut sub_guard = doc.write().await;
                check_version(&sub_guard, version)?;
                let mut page_guard = page_doc.write().await;
                check_version(&page_guard, page_version)?;
                self.wal_append(&event).await?;
                sub_guard.value.set_remaining(remaining_after);
                sub_guard.version += 1;
                page_guard.value.insert(ReservedSlot { range, session_id });
                page_guard.version += 1;
            }
            ChargePlan::Annual { .. } => {
                let mut page_guard = page_doc.write().await;
                check_version(&page_guard, page_version)?;
                self.wal_append(&event).await?;
                page_guard.value.insert(ReservedSlot { range, session_id });
                page_guard.version += 1;
            }
            ChargePlan::Balance { doc, version, entry } => {
                let mut acct_guard = doc.write().await;
                check_version(&acct_guard, version)?;
                let mut page_guard = page_doc.write().await;
                check_version(&page_guard, page_version)?;
                self.wal_append(&event).await?;
                acct_guard.value.apply_entry(entry);
                acct_guard.version += 1;
                page_guard.value.insert(ReservedSlot { range, session_id });
                page_guard.version += 1;
            }
        }
        self.store.insert_session(session.clone());

        self.notify.send(account_id, &event);
        self.notify.send(resource_id, &event);
        Ok(session)
    }
}
