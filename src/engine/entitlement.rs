use tokio::sync::OwnedRwLockWriteGuard;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::now_ms;
use super::ledger::build_entry;
use super::{Engine, EngineError, SharedDoc, Versioned, check_version};

/// Refund leg worked out from snapshots, to be certified at commit.
enum RefundPlan {
    None,
    Pack {
        doc: SharedDoc<SubscriptionState>,
        version: u64,
        subscription_id: Ulid,
        remaining_after: u32,
    },
    Balance {
        doc: SharedDoc<AccountState>,
        version: u64,
        entry: LedgerEntry,
    },
}

/// Same leg with its write lock held.
enum RefundGuard {
    None,
    Pack(OwnedRwLockWriteGuard<Versioned<SubscriptionState>>, u32),
    Balance(OwnedRwLockWriteGuard<Versioned<AccountState>>, LedgerEntry),
}

/// Whether a subscription can pay for one more booking right now.
pub(super) fn check_reservable(sub: &SubscriptionState, now: Ms) -> Result<(), EngineError> {
    if !sub.is_active() {
        return Err(EngineError::SubscriptionExpired(sub.id));
    }
    match sub.plan {
        Plan::SessionPack { remaining, .. } => {
            if remaining == 0 {
                return Err(EngineError::NoSessionsRemaining(sub.id));
            }
        }
        Plan::Annual { ends_at } => {
            if now > ends_at {
                return Err(EngineError::SubscriptionExpired(sub.id));
            }
        }
    }
    Ok(())
}

impl Engine {
    /// Grant a plan to an account. Packs start full; validity windows must
    /// land inside the plausible timestamp range.
    pub async fn grant_subscription(
        &self,
        id: Ulid,
        account_id: Ulid,
        plan: Plan,
    ) -> Result<SubscriptionState, EngineError> {
        match plan {
            Plan::SessionPack { total, remaining } => {
                if total == 0 || total > MAX_PACK_SESSIONS {
                    return Err(EngineError::LimitExceeded("pack size"));
                }
                if remaining != total {
                    return Err(EngineError::Forbidden("fresh pack must start full"));
                }
            }
            Plan::Annual { ends_at } => {
                if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&ends_at) {
                    return Err(EngineError::LimitExceeded("end date out of range"));
                }
            }
        }
        if !self.store.contains_account(&account_id) {
            return Err(EngineError::NotFound(account_id));
        }
        if self.store.contains_subscription(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.store.subscription_ids_of(&account_id).len() >= MAX_SUBSCRIPTIONS_PER_ACCOUNT {
            return Err(EngineError::LimitExceeded("too many subscriptions"));
        }
        let sub = SubscriptionState {
            id,
            account_id,
            plan,
            status: SubscriptionStatus::Active,
            started_at: now_ms(),
        };
        let event = Event::SubscriptionGranted { sub: sub.clone() };
        self.wal_append(&event).await?;
        self.store.insert_subscription(sub.clone());
        self.notify.send(account_id, &event);
        Ok(sub)
    }

    /// Lifecycle surface. Only `active` subscriptions transition, and
    /// `expired`/`cancelled` are terminal, so a repeated call fails
    /// `InvalidStateTransition` instead of silently re-applying.
    pub async fn set_subscription_status(
        &self,
        id: Ulid,
        status: SubscriptionStatus,
    ) -> Result<SubscriptionState, EngineError> {
        self.retry_commit(EngineError::BookingUnavailable, || {
            self.try_set_subscription_status(id, status)
        })
        .await
    }

    async fn try_set_subscription_status(
        &self,
        id: Ulid,
        status: SubscriptionStatus,
    ) -> Result<SubscriptionState, EngineError> {
        let doc = self
            .store
            .subscription(&id)
            .ok_or(EngineError::NotFound(id))?;
        let (version, mut sub) = {
            let guard = doc.read().await;
            (guard.version, guard.value.clone())
        };
        if sub.status != SubscriptionStatus::Active || status == SubscriptionStatus::Active {
            return Err(EngineError::InvalidStateTransition {
                from: sub.status.as_str(),
                to: status.as_str(),
            });
        }
        let changed_at = now_ms();
        let event = Event::SubscriptionStatusChanged { id, status, changed_at };
        self.commit_doc(&doc, version, &event, |s| {
            s.status = status;
        })
        .await?;
        sub.status = status;
        self.notify.send(sub.account_id, &event);
        Ok(sub)
    }

    /// The session happened. Terminal; no restore leg.
    pub async fn mark_attended(&self, session_id: Ulid) -> Result<SessionRecord, EngineError> {
        self.close_session(session_id, SessionStatus::Attended).await
    }

    /// The customer did not show. Terminal; restores whatever paid for the
    /// booking. The slot stays blocked.
    pub async fn mark_missed(&self, session_id: Ulid) -> Result<SessionRecord, EngineError> {
        self.close_session(session_id, SessionStatus::Missed).await
    }

    /// Called off in time. Terminal; restores the charge and frees the slot.
    pub async fn mark_cancelled(&self, session_id: Ulid) -> Result<SessionRecord, EngineError> {
        self.close_session(session_id, SessionStatus::Cancelled).await
    }

    /// Shared dispatch for the status surface; `scheduled` is never a valid
    /// target.
    pub(crate) async fn close_session(
        &self,
        session_id: Ulid,
        to: SessionStatus,
    ) -> Result<SessionRecord, EngineError> {
        self.retry_commit(EngineError::BookingUnavailable, || {
            self.try_close_session(session_id, to)
        })
        .await
    }

    /// One conditional write closes the session, applies the refund leg and
    /// (for cancellations) frees the slot. The session document's version is
    /// part of the certification, so two racing closes cannot both refund:
    /// the loser retries, finds the record terminal and fails
    /// `InvalidStateTransition`.
    async fn try_close_session(
        &self,
        session_id: Ulid,
        to: SessionStatus,
    ) -> Result<SessionRecord, EngineError> {
        let session_doc = self
            .store
            .session(&session_id)
            .ok_or(EngineError::NotFound(session_id))?;
        let (session_version, session) = {
            let guard = session_doc.read().await;
            (guard.version, guard.value.clone())
        };
        if session.status.is_terminal() {
            return Err(EngineError::InvalidStateTransition {
                from: session.status.as_str(),
                to: to.as_str(),
            });
        }
        let refund = match to {
            SessionStatus::Attended => RefundPlan::None,
            SessionStatus::Missed | SessionStatus::Cancelled => self.plan_refund(&session).await?,
            SessionStatus::Scheduled => {
                return Err(EngineError::InvalidStateTransition {
                    from: session.status.as_str(),
                    to: to.as_str(),
                });
            }
        };

        let closed_at = now_ms();
        let refund_record = match &refund {
            RefundPlan::None => None,
            RefundPlan::Pack { subscription_id, remaining_after, .. } => Some(Refund::PackUnit {
                subscription_id: *subscription_id,
                remaining_after: *remaining_after,
            }),
            RefundPlan::Balance { entry, .. } => Some(Refund::Balance { entry: entry.clone() }),
        };
        let event = Event::SessionClosed {
            id: session_id,
            status: to,
            closed_at,
            refund: refund_record,
        };

        // Fixed lock order: account, subscription, session, slot page.
        let refund_guard = match refund {
            RefundPlan::None => RefundGuard::None,
            RefundPlan::Pack { doc, version, remaining_after, .. } => {
                let g = doc.write_owned().await;
                check_version(&g, version)?;
                RefundGuard::Pack(g, remaining_after)
            }
            RefundPlan::Balance { doc, version, entry } => {
                let g = doc.write_owned().await;
                check_version(&g, version)?;
                RefundGuard::Balance(g, entry)
            }
        };
        let mut sess_guard = session_doc.write().await;
        check_version(&sess_guard, session_version)?;
        let page_doc = if to == SessionStatus::Cancelled {
            self.store.slot_page(&SlotKey {
                resource_id: session.resource_id,
                date: session.date,
            })
        } else {
            None
        };
        let mut page_guard = match &page_doc {
            Some(doc) => Some(doc.write().await),
            None => None,
        };

        self.wal_append(&event).await?;

        match refund_guard {
            RefundGuard::None => {}
            RefundGuard::Pack(mut g, remaining_after) => {
                g.value.set_remaining(remaining_after);
                g.version += 1;
            }
            RefundGuard::Balance(mut g, entry) => {
                g.value.apply_entry(entry);
                g.version += 1;
            }
        }
        sess_guard.value.close(to, closed_at);
        sess_guard.version += 1;
        if let Some(g) = page_guard.as_mut() {
            g.value.remove(session_id);
            g.version += 1;
        }
        drop(page_guard);
        drop(sess_guard);

        let mut closed = session;
        closed.close(to, closed_at);
        self.notify.send(closed.account_id, &event);
        self.notify.send(closed.resource_id, &event);
        Ok(closed)
    }

    /// Decide what a missed or cancelled session gives back: one pack unit
    /// for pack-funded bookings, the purchase amount for balance-funded
    /// ones, nothing for annual plans.
    async fn plan_refund(&self, session: &SessionRecord) -> Result<RefundPlan, EngineError> {
        match session.subscription_id {
            Some(sub_id) => {
                let doc = self
                    .store
                    .subscription(&sub_id)
                    .ok_or(EngineError::NotFound(sub_id))?;
                let guard = doc.read().await;
                match guard.value.plan {
                    Plan::SessionPack { total, remaining } => Ok(RefundPlan::Pack {
                        version: guard.version,
                        subscription_id: sub_id,
                        remaining_after: (remaining + 1).min(total),
                        doc: doc.clone(),
                    }),
                    Plan::Annual { .. } => Ok(RefundPlan::None),
                }
            }
            None => {
                let doc = self
                    .store
                    .account(&session.account_id)
                    .ok_or(EngineError::NotFound(session.account_id))?;
                let guard = doc.read().await;
                let account = &guard.value;
                let paid = account.entries.iter().rev().find(|e| {
                    e.direction == Direction::Debit
                        && matches!(e.cause, EntryCause::Purchase { session_id } if session_id == session.id)
                });
                match paid {
                    Some(p) => {
                        let entry = build_entry(
                            account,
                            Direction::Credit,
                            p.amount,
                            EntryCause::Purchase { session_id: session.id },
                            Actor::System,
                        )?;
                        Ok(RefundPlan::Balance {
                            version: guard.version,
                            entry,
                            doc: doc.clone(),
                        })
                    }
                    None => {
                        tracing::error!(
                            session = %session.id,
                            "no purchase entry behind balance-funded session"
                        );
                        Ok(RefundPlan::None)
                    }
                }
            }
        }
    }
}
