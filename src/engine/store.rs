use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

/// A document plus its optimistic-concurrency version. Readers take a
/// snapshot of `(value, version)` without blocking writers; a commit re-checks
/// the version under the write lock and bumps it by one. The short write-lock
/// section is the store's compare-then-write primitive.
#[derive(Debug)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

impl<T> Versioned<T> {
    pub fn new(value: T) -> Self {
        Self { version: 0, value }
    }
}

pub type SharedDoc<T> = Arc<RwLock<Versioned<T>>>;

fn shared<T>(value: T) -> SharedDoc<T> {
    Arc::new(RwLock::new(Versioned::new(value)))
}

/// One tenant's documents: accounts (balance + chain + payments),
/// subscriptions, sessions, and slot pages keyed by (resource, date), plus
/// the reverse indexes the query surface needs.
///
/// Keeping the whole slot page of one resource-day as a single document means
/// the conflict check and the slot insert commit against one version, so two
/// interleaved bookings for overlapping ranges cannot both win.
pub struct DocumentStore {
    accounts: DashMap<Ulid, SharedDoc<AccountState>>,
    subscriptions: DashMap<Ulid, SharedDoc<SubscriptionState>>,
    sessions: DashMap<Ulid, SharedDoc<SessionRecord>>,
    /// Session ids with a booking in flight; claimed before any charge runs.
    booking_claims: DashSet<Ulid>,
    slots: DashMap<SlotKey, SharedDoc<SlotPage>>,
    /// account → subscription ids, in grant order.
    subscriptions_by_account: DashMap<Ulid, Vec<Ulid>>,
    /// account → session ids, in booking order.
    sessions_by_account: DashMap<Ulid, Vec<Ulid>>,
    /// payment external reference → account id, across all accounts.
    payment_refs: DashMap<String, Ulid>,
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore {
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
            subscriptions: DashMap::new(),
            sessions: DashMap::new(),
            booking_claims: DashSet::new(),
            slots: DashMap::new(),
            subscriptions_by_account: DashMap::new(),
            sessions_by_account: DashMap::new(),
            payment_refs: DashMap::new(),
        }
    }

    // ── Accounts ─────────────────────────────────────────────

    pub fn account(&self, id: &Ulid) -> Option<SharedDoc<AccountState>> {
        self.accounts.get(id).map(|e| e.value().clone())
    }

    pub fn contains_account(&self, id: &Ulid) -> bool {
        self.accounts.contains_key(id)
    }

    pub fn insert_account(&self, state: AccountState) {
        self.accounts.insert(state.id, shared(state));
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    pub fn account_ids(&self) -> Vec<Ulid> {
        self.accounts.iter().map(|e| *e.key()).collect()
    }

    // ── Subscriptions ────────────────────────────────────────

    pub fn subscription(&self, id: &Ulid) -> Option<SharedDoc<SubscriptionState>> {
        self.subscriptions.get(id).map(|e| e.value().clone())
    }

    pub fn contains_subscription(&self, id: &Ulid) -> bool {
        self.subscriptions.contains_key(id)
    }

    pub fn insert_subscription(&self, sub: SubscriptionState) {
        self.subscriptions_by_account
            .entry(sub.account_id)
            .or_default()
            .push(sub.id);
        self.subscriptions.insert(sub.id, shared(sub));
    }

    pub fn subscription_ids_of(&self, account_id: &Ulid) -> Vec<Ulid> {
        self.subscriptions_by_account
            .get(account_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    // ── Sessions ─────────────────────────────────────────────

    pub fn session(&self, id: &Ulid) -> Option<SharedDoc<SessionRecord>> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    pub fn contains_session(&self, id: &Ulid) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn insert_session(&self, session: SessionRecord) {
        self.sessions_by_account
            .entry(session.account_id)
            .or_default()
            .push(session.id);
        self.sessions.insert(session.id, shared(session));
    }

    pub fn session_ids_of(&self, account_id: &Ulid) -> Vec<Ulid> {
        self.sessions_by_account
            .get(account_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Claim a session id for an in-flight booking. False means another
    /// booking holds the claim right now; committed ids are guarded by the
    /// session map itself.
    pub fn claim_session_id(&self, id: Ulid) -> bool {
        self.booking_claims.insert(id)
    }

    pub fn release_session_id(&self, id: &Ulid) {
        self.booking_claims.remove(id);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    // ── Slot pages ───────────────────────────────────────────

    /// Read path: missing page means no reservations that day.
    pub fn slot_page(&self, key: &SlotKey) -> Option<SharedDoc<SlotPage>> {
        self.slots.get(key).map(|e| e.value().clone())
    }

    /// Write path: creates an empty page (version 0) on first booking. A
    /// concurrent first booking for the same key gets the same Arc and loses
    /// the version race instead of creating a second page.
    pub fn slot_page_or_empty(&self, key: SlotKey) -> SharedDoc<SlotPage> {
        self.slots
            .entry(key)
            .or_insert_with(|| shared(SlotPage::default()))
            .value()
            .clone()
    }

    // ── Payment reference index ──────────────────────────────

    pub fn account_for_reference(&self, reference: &str) -> Option<Ulid> {
        self.payment_refs.get(reference).map(|e| *e.value())
    }

    pub fn index_reference(&self, reference: String, account_id: Ulid) {
        self.payment_refs.insert(reference, account_id);
    }

    // ── Replay ───────────────────────────────────────────────

    /// Apply one event during startup replay. We are the sole owner of every
    /// Arc at this point, so try_write always succeeds instantly. Never use
    /// blocking_write here because replay may run inside an async context
    /// (lazy tenant creation).
    pub fn apply_replay(&self, event: &Event) {
        match event {
            Event::AccountOpened { id, opened_at } => {
                self.insert_account(AccountState::new(*id, *opened_at));
            }
            Event::LedgerAppended { entry } => {
                if let Some(doc) = self.account(&entry.account_id) {
                    let mut guard = doc.try_write().expect("replay: uncontended write");
                    guard.value.apply_entry(entry.clone());
                    guard.version += 1;
                }
            }
            Event::PaymentRecorded { account_id, tx } => {
                if let Some(doc) = self.account(account_id) {
                    let mut guard = doc.try_write().expect("replay: uncontended write");
                    guard.value.upsert_payment(tx.clone());
                    guard.version += 1;
                    self.index_reference(tx.external_reference.clone(), *account_id);
                }
            }
            Event::PaymentCaptured { tx, entry } => {
                if let Some(doc) = self.account(&entry.account_id) {
                    let mut guard = doc.try_write().expect("replay: uncontended write");
                    guard.value.upsert_payment(tx.clone());
                    guard.value.apply_entry(entry.clone());
                    guard.version += 1;
                    self.index_reference(tx.external_reference.clone(), entry.account_id);
                }
            }
            Event::SubscriptionGranted { sub } => {
                self.insert_subscription(sub.clone());
            }
            Event::SubscriptionStatusChanged { id, status, .. } => {
                if let Some(doc) = self.subscription(id) {
                    let mut guard = doc.try_write().expect("replay: uncontended write");
                    guard.value.status = *status;
                    guard.version += 1;
                }
            }
            Event::BookingCreated { session, charge } => {
                self.insert_session_with_slot(session.clone());
                match charge {
                    Charge::Pack { subscription_id, remaining_after } => {
                        if let Some(doc) = self.subscription(subscription_id) {
                            let mut guard = doc.try_write().expect("replay: uncontended write");
                            guard.value.set_remaining(*remaining_after);
                            guard.version += 1;
                        }
                    }
                    Charge::Annual { .. } => {}
                    Charge::Balance { entry } => {
                        if let Some(doc) = self.account(&entry.account_id) {
                            let mut guard = doc.try_write().expect("replay: uncontended write");
                            guard.value.apply_entry(entry.clone());
                            guard.version += 1;
                        }
                    }
                }
            }
            Event::SessionLogged { session } => {
                self.insert_session_with_slot(session.clone());
            }
            Event::SessionClosed { id, status, closed_at, refund } => {
                let mut slot_owner = None;
                if let Some(doc) = self.session(id) {
                    let mut guard = doc.try_write().expect("replay: uncontended write");
                    guard.value.close(*status, *closed_at);
                    guard.version += 1;
                    if *status == SessionStatus::Cancelled {
                        slot_owner = Some(SlotKey {
                            resource_id: guard.value.resource_id,
                            date: guard.value.date,
                        });
                    }
                }
                if let Some(key) = slot_owner
                    && let Some(page) = self.slot_page(&key) {
                        let mut guard = page.try_write().expect("replay: uncontended write");
                        guard.value.remove(*id);
                        guard.version += 1;
                    }
                match refund {
                    Some(Refund::PackUnit { subscription_id, remaining_after }) => {
                        if let Some(doc) = self.subscription(subscription_id) {
                            let mut guard = doc.try_write().expect("replay: uncontended write");
                            guard.value.set_remaining(*remaining_after);
                            guard.version += 1;
                        }
                    }
                    Some(Refund::Balance { entry }) => {
                        if let Some(doc) = self.account(&entry.account_id) {
                            let mut guard = doc.try_write().expect("replay: uncontended write");
                            guard.value.apply_entry(entry.clone());
                            guard.version += 1;
                        }
                    }
                    None => {}
                }
            }
        }
    }

    fn insert_session_with_slot(&self, session: SessionRecord) {
        if session.status != SessionStatus::Cancelled {
            let key = SlotKey {
                resource_id: session.resource_id,
                date: session.date,
            };
            let page = self.slot_page_or_empty(key);
            let mut guard = page.try_write().expect("replay: uncontended write");
            guard.value.insert(ReservedSlot {
                range: session.range,
                session_id: session.id,
            });
            guard.version += 1;
        }
        self.insert_session(session);
    }
}
