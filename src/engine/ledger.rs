use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::now_ms;
use super::{Engine, EngineError};

/// Positive and under the per-operation cap.
pub(super) fn validate_amount(amount: Amount) -> Result<(), EngineError> {
    if !amount.is_positive() {
        return Err(EngineError::InvalidAmount(amount));
    }
    if amount.cents() > MAX_AMOUNT_CENTS {
        return Err(EngineError::LimitExceeded("amount too large"));
    }
    Ok(())
}

/// Build the next chain link from an account snapshot. Debits past the
/// balance fail here, so a balance can never go negative.
pub(super) fn build_entry(
    account: &AccountState,
    direction: Direction,
    amount: Amount,
    cause: EntryCause,
    actor: Actor,
) -> Result<LedgerEntry, EngineError> {
    let balance_before = account.balance;
    let balance_after = match direction {
        Direction::Credit => balance_before
            .checked_add(amount)
            .ok_or(EngineError::LimitExceeded("balance overflow"))?,
        Direction::Debit => {
            if amount > balance_before {
                return Err(EngineError::InsufficientFunds {
                    balance: balance_before,
                    requested: amount,
                });
            }
            balance_before
                .checked_sub(amount)
                .ok_or(EngineError::LimitExceeded("balance overflow"))?
        }
    };
    Ok(LedgerEntry {
        id: Ulid::new(),
        account_id: account.id,
        seq: account.next_seq(),
        direction,
        amount,
        cause,
        actor,
        balance_before,
        balance_after,
        created_at: now_ms(),
    })
}

/// Replay one account's chain from zero and compare with the live balance.
/// Past the first fault the fold keeps going so the report still shows the
/// full replayed balance.
pub(super) fn audit_chain(account: &AccountState) -> AuditReport {
    let mut replayed = Amount::ZERO;
    let mut fault: Option<String> = None;
    for (i, entry) in account.entries.iter().enumerate() {
        let next = match entry.direction {
            Direction::Credit => replayed.checked_add(entry.amount),
            Direction::Debit => replayed.checked_sub(entry.amount),
        };
        let Some(next) = next else {
            fault.get_or_insert_with(|| format!("entry {i}: balance overflow"));
            break;
        };
        if fault.is_none() {
            if entry.seq != i as u64 {
                fault = Some(format!("entry {i}: seq {} != {i}", entry.seq));
            } else if entry.balance_before != replayed {
                fault = Some(format!(
                    "entry {i}: balance_before {} != prior balance_after {}",
                    entry.balance_before, replayed
                ));
            } else if !entry.amount.is_positive() {
                fault = Some(format!("entry {i}: non-positive amount {}", entry.amount));
            } else if entry.balance_after != next {
                fault = Some(format!(
                    "entry {i}: balance_after {} does not match amount",
                    entry.balance_after
                ));
            } else if next < Amount::ZERO {
                fault = Some(format!("entry {i}: negative balance {next}"));
            }
        }
        replayed = next;
    }
    if fault.is_none() && replayed != account.balance {
        fault = Some(format!(
            "replayed balance {replayed} != live balance {}",
            account.balance
        ));
    }
    AuditReport {
        account_id: account.id,
        live_balance: account.balance,
        replayed_balance: replayed,
        entries: account.entries.len() as u64,
        consistent: fault.is_none(),
        fault,
    }
}

impl Engine {
    pub async fn open_account(&self, id: Ulid) -> Result<(), EngineError> {
        if self.store.account_count() >= MAX_ACCOUNTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many accounts"));
        }
        if self.store.contains_account(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let opened_at = now_ms();
        let event = Event::AccountOpened { id, opened_at };
        self.wal_append(&event).await?;
        self.store.insert_account(AccountState::new(id, opened_at));
        self.notify.send(id, &event);
        Ok(())
    }

    /// Append a credit entry. Entry and balance move in one conditional
    /// write; on contention the attempt is recomputed from a fresh snapshot.
    pub async fn credit(
        &self,
        account_id: Ulid,
        amount: Amount,
        cause: EntryCause,
        actor: Actor,
    ) -> Result<LedgerEntry, EngineError> {
        validate_amount(amount)?;
        self.retry_commit(EngineError::LedgerUnavailable, || {
            self.try_append_entry(account_id, Direction::Credit, amount, cause.clone(), actor)
        })
        .await
    }

    /// Append a debit entry; fails `InsufficientFunds` rather than let the
    /// balance go negative.
    pub async fn debit(
        &self,
        account_id: Ulid,
        amount: Amount,
        cause: EntryCause,
        actor: Actor,
    ) -> Result<LedgerEntry, EngineError> {
        validate_amount(amount)?;
        self.retry_commit(EngineError::LedgerUnavailable, || {
            self.try_append_entry(account_id, Direction::Debit, amount, cause.clone(), actor)
        })
        .await
    }

    async fn try_append_entry(
        &self,
        account_id: Ulid,
        direction: Direction,
        amount: Amount,
        cause: EntryCause,
        actor: Actor,
    ) -> Result<LedgerEntry, EngineError> {
        let doc = self
            .store
            .account(&account_id)
            .ok_or(EngineError::NotFound(account_id))?;
        let (version, entry) = {
            let guard = doc.read().await;
            if guard.value.entries.len() >= MAX_ENTRIES_PER_ACCOUNT {
                return Err(EngineError::LimitExceeded("too many ledger entries"));
            }
            let entry = build_entry(&guard.value, direction, amount, cause, actor)?;
            (guard.version, entry)
        };
        let event = Event::LedgerAppended { entry: entry.clone() };
        self.commit_doc(&doc, version, &event, |account| {
            account.apply_entry(entry.clone());
        })
        .await?;
        self.notify.send(account_id, &event);
        Ok(entry)
    }

    /// Support correction surface: a plain credit or debit with the note
    /// kept on the entry.
    pub async fn admin_adjust(
        &self,
        account_id: Ulid,
        direction: Direction,
        amount: Amount,
        note: Option<String>,
        admin_id: Ulid,
    ) -> Result<LedgerEntry, EngineError> {
        if let Some(ref n) = note
            && n.len() > MAX_NOTE_LEN {
                return Err(EngineError::LimitExceeded("note too long"));
            }
        let cause = EntryCause::AdminAdjustment { note };
        match direction {
            Direction::Credit => {
                self.credit(account_id, amount, cause, Actor::Admin(admin_id)).await
            }
            Direction::Debit => {
                self.debit(account_id, amount, cause, Actor::Admin(admin_id)).await
            }
        }
    }

    /// Credit referrer and referred as two independent per-account commits.
    /// The second failing does not roll back the first; each account's books
    /// stay internally consistent either way.
    pub async fn referral_bonus(
        &self,
        referrer: Ulid,
        referred: Ulid,
        amount: Amount,
    ) -> Result<(LedgerEntry, LedgerEntry), EngineError> {
        validate_amount(amount)?;
        if referrer == referred {
            return Err(EngineError::Forbidden("referrer and referred must differ"));
        }
        if !self.store.contains_account(&referred) {
            return Err(EngineError::NotFound(referred));
        }
        let cause = EntryCause::ReferralBonus { referred_account: referred };
        let first = self
            .credit(referrer, amount, cause.clone(), Actor::System)
            .await?;
        let second = self.credit(referred, amount, cause, Actor::System).await?;
        Ok((first, second))
    }

    /// Idempotent payment webhook. A completed capture records the
    /// transaction and credits the ledger in one commit; pending/failed
    /// captures record only. The duplicate guard keys on *completed*
    /// transactions, so a previously failed reference may complete later.
    pub async fn record_payment(
        &self,
        account_id: Ulid,
        payment_id: Ulid,
        method: PaymentMethod,
        amount: Amount,
        external_reference: String,
        status: PaymentStatus,
    ) -> Result<Option<LedgerEntry>, EngineError> {
        validate_amount(amount)?;
        if external_reference.is_empty() || external_reference.len() > MAX_REFERENCE_LEN {
            return Err(EngineError::LimitExceeded("external reference length"));
        }
        self.retry_commit(EngineError::LedgerUnavailable, || {
            self.try_record_payment(
                account_id,
                payment_id,
                method,
                amount,
                external_reference.clone(),
                status,
            )
        })
        .await
    }

    async fn try_record_payment(
        &self,
        account_id: Ulid,
        payment_id: Ulid,
        method: PaymentMethod,
        amount: Amount,
        external_reference: String,
        status: PaymentStatus,
    ) -> Result<Option<LedgerEntry>, EngineError> {
        // Cross-account guard via the reference index. The same-account case
        // is re-checked below under the document snapshot, which the commit
        // certifies against.
        if let Some(owner) = self.store.account_for_reference(&external_reference)
            && owner != account_id
            && let Some(doc) = self.store.account(&owner) {
                let guard = doc.read().await;
                if let Some(tx) = guard.value.payment_by_reference(&external_reference)
                    && tx.status == PaymentStatus::Completed {
                        return Err(EngineError::DuplicatePayment(external_reference));
                    }
            }

        let doc = self
            .store
            .account(&account_id)
            .ok_or(EngineError::NotFound(account_id))?;
        let (version, tx, entry) = {
            let guard = doc.read().await;
            let account = &guard.value;
            if let Some(existing) = account.payment_by_reference(&external_reference)
                && existing.status == PaymentStatus::Completed {
                    return Err(EngineError::DuplicatePayment(external_reference));
                }
            if account.payments.len() >= MAX_PAYMENTS_PER_ACCOUNT {
                return Err(EngineError::LimitExceeded("too many payments"));
            }
            let tx = SourceTransaction {
                id: payment_id,
                method,
                amount,
                external_reference: external_reference.clone(),
                status,
                created_at: now_ms(),
            };
            let entry = if status == PaymentStatus::Completed {
                if account.entries.len() >= MAX_ENTRIES_PER_ACCOUNT {
                    return Err(EngineError::LimitExceeded("too many ledger entries"));
                }
                Some(build_entry(
                    account,
                    Direction::Credit,
                    amount,
                    EntryCause::TopUp {
                        external_reference: external_reference.clone(),
                        method,
                    },
                    Actor::System,
                )?)
            } else {
                None
            };
            (guard.version, tx, entry)
        };

        let event = match &entry {
            Some(e) => Event::PaymentCaptured { tx: tx.clone(), entry: e.clone() },
            None => Event::PaymentRecorded { account_id, tx: tx.clone() },
        };
        self.commit_doc(&doc, version, &event, |account| {
            account.upsert_payment(tx);
            if let Some(e) = &entry {
                account.apply_entry(e.clone());
            }
        })
        .await?;
        self.store.index_reference(external_reference, account_id);
        self.notify.send(account_id, &event);
        Ok(entry)
    }

    /// Fold the account's chain from zero — the replayed balance, not the
    /// stored one.
    pub async fn reconstruct_balance(&self, account_id: Ulid) -> Result<Amount, EngineError> {
        Ok(self.audit_account(account_id).await?.replayed_balance)
    }

    /// Replay the chain and compare with the live balance. Inconsistencies
    /// are logged and counted as integrity alerts, never repaired.
    pub async fn audit_account(&self, account_id: Ulid) -> Result<AuditReport, EngineError> {
        let doc = self
            .store
            .account(&account_id)
            .ok_or(EngineError::NotFound(account_id))?;
        let report = {
            let guard = doc.read().await;
            audit_chain(&guard.value)
        };
        if !report.consistent {
            metrics::counter!(crate::observability::INTEGRITY_ALERTS_TOTAL).increment(1);
            tracing::error!(
                account = %account_id,
                report = %serde_json::to_string(&report).unwrap_or_default(),
                "ledger integrity violation"
            );
        }
        Ok(report)
    }

    /// Audit every account. Inconsistent chains are logged and counted by
    /// `audit_account`; the caller gets every report either way.
    pub async fn audit_all(&self) -> Vec<AuditReport> {
        let mut reports = Vec::new();
        for id in self.store.account_ids() {
            if let Ok(report) = self.audit_account(id).await {
                reports.push(report);
            }
        }
        reports
    }
}
