use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Unix milliseconds — the only instant type.
pub type Ms = i64;

/// Minutes since midnight — the only time-of-day type.
pub type Minutes = i64;

/// Exclusive upper bound for a time-of-day: ranges live in `[0, 1440]`.
pub const DAY_MINUTES: Minutes = 24 * 60;

// ── Money ────────────────────────────────────────────────────────

/// Money in integer cents — the only money type. Two decimal places on the
/// wire ("25.00"), never floats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn from_cents(cents: i64) -> Self {
        Amount(cents)
    }

    pub fn cents(&self) -> i64 {
        self.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn checked_add(&self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(&self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    /// Parse a decimal string with at most two fractional digits:
    /// "25" → 2500, "25.5" → 2550, "25.50" → 2550. Returns None for
    /// malformed input or more than two decimals.
    pub fn parse(s: &str) -> Option<Amount> {
        let s = s.trim();
        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (whole, frac) = match digits.split_once('.') {
            Some((w, f)) => (w, f),
            None => (digits, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return None;
        }
        if frac.len() > 2 {
            return None;
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
        let mut frac_cents: i64 = if frac.is_empty() { 0 } else { frac.parse().ok()? };
        if frac.len() == 1 {
            frac_cents *= 10;
        }
        let cents = whole.checked_mul(100)?.checked_add(frac_cents)?;
        Some(Amount(if negative { -cents } else { cents }))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

// ── Time of day ──────────────────────────────────────────────────

/// Half-open time-of-day range `[start, end)` in minutes since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Minutes,
    pub end: Minutes,
}

impl TimeRange {
    pub fn new(start: Minutes, end: Minutes) -> Self {
        debug_assert!(start < end, "TimeRange start must be before end");
        Self { start, end }
    }

    pub fn duration_min(&self) -> Minutes {
        self.end - self.start
    }

    /// Half-open overlap: touching boundaries do not conflict, so back-to-back
    /// ranges like 10:00–11:00 and 11:00–12:00 coexist.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// "10:30" → 630. Accepts "24:00" as an end bound.
pub fn hhmm_to_minutes(s: &str) -> Option<Minutes> {
    let (h, m) = s.split_once(':')?;
    if m.len() != 2 {
        return None;
    }
    let h: Minutes = h.parse().ok()?;
    let m: Minutes = m.parse().ok()?;
    if !(0..60).contains(&m) {
        return None;
    }
    let total = h * 60 + m;
    if !(0..=DAY_MINUTES).contains(&total) {
        return None;
    }
    Some(total)
}

/// 630 → "10:30".
pub fn minutes_to_hhmm(m: Minutes) -> String {
    format!("{:02}:{:02}", m / 60, m % 60)
}

// ── Ledger ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Credit,
    Debit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Credit => "credit",
            Direction::Debit => "debit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    Paypal,
    Internal,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Card => "card",
            PaymentMethod::Paypal => "paypal",
            PaymentMethod::Internal => "internal",
        }
    }
}

/// Why a ledger entry exists. The payload names the record that caused it, so
/// every entry can be traced back without joins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryCause {
    TopUp {
        external_reference: String,
        method: PaymentMethod,
    },
    /// Debit at booking time; the same cause on a credit entry is the
    /// reversal when a paid session is missed or cancelled.
    Purchase { session_id: Ulid },
    AdminAdjustment { note: Option<String> },
    ReferralBonus { referred_account: Ulid },
}

impl EntryCause {
    pub fn label(&self) -> &'static str {
        match self {
            EntryCause::TopUp { .. } => "top_up",
            EntryCause::Purchase { .. } => "purchase",
            EntryCause::AdminAdjustment { .. } => "admin_adjustment",
            EntryCause::ReferralBonus { .. } => "referral_bonus",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Account(Ulid),
    Admin(Ulid),
    System,
}

/// One link in an account's chain. `balance_before` of entry n must equal
/// `balance_after` of entry n-1; the first entry starts from zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Ulid,
    pub account_id: Ulid,
    /// Position in the account's chain, starting at 0.
    pub seq: u64,
    pub direction: Direction,
    pub amount: Amount,
    pub cause: EntryCause,
    pub actor: Actor,
    pub balance_before: Amount,
    pub balance_after: Amount,
    pub created_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
        }
    }
}

/// A payment-provider capture. `external_reference` is the idempotency key:
/// at most one completed transaction per reference, ever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTransaction {
    pub id: Ulid,
    pub method: PaymentMethod,
    pub amount: Amount,
    pub external_reference: String,
    pub status: PaymentStatus,
    pub created_at: Ms,
}

#[derive(Debug, Clone)]
pub struct AccountState {
    pub id: Ulid,
    pub balance: Amount,
    /// Append-only, ordered by `seq`.
    pub entries: Vec<LedgerEntry>,
    pub payments: Vec<SourceTransaction>,
    pub opened_at: Ms,
}

impl AccountState {
    pub fn new(id: Ulid, opened_at: Ms) -> Self {
        Self {
            id,
            balance: Amount::ZERO,
            entries: Vec::new(),
            payments: Vec::new(),
            opened_at,
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn payment_by_reference(&self, reference: &str) -> Option<&SourceTransaction> {
        self.payments.iter().find(|t| t.external_reference == reference)
    }

    /// Append an entry and move the balance to its `balance_after`. The one
    /// place live commits and replay agree on what an entry does.
    pub fn apply_entry(&mut self, entry: LedgerEntry) {
        self.balance = entry.balance_after;
        self.entries.push(entry);
    }

    /// Insert or replace the transaction with the same external reference
    /// (a pending capture completing later replaces its record).
    pub fn upsert_payment(&mut self, tx: SourceTransaction) {
        match self
            .payments
            .iter_mut()
            .find(|t| t.external_reference == tx.external_reference)
        {
            Some(existing) => *existing = tx,
            None => self.payments.push(tx),
        }
    }
}

// ── Subscriptions ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    /// Prepaid bundle of sessions; each booking consumes one unit.
    SessionPack { total: u32, remaining: u32 },
    /// Unlimited bookings while active and before `ends_at` (inclusive).
    Annual { ends_at: Ms },
}

impl Plan {
    pub fn kind(&self) -> &'static str {
        match self {
            Plan::SessionPack { .. } => "session_pack",
            Plan::Annual { .. } => "annual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Expired,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }
}

/// Status never changes inside the booking core; only the explicit status
/// surface (billing job, cancellation) moves it, and the move is logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionState {
    pub id: Ulid,
    pub account_id: Ulid,
    pub plan: Plan,
    pub status: SubscriptionStatus,
    pub started_at: Ms,
}

impl SubscriptionState {
    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    /// Remaining units for a pack, None for annual.
    pub fn remaining(&self) -> Option<u32> {
        match self.plan {
            Plan::SessionPack { remaining, .. } => Some(remaining),
            Plan::Annual { .. } => None,
        }
    }

    /// Set a pack's remaining counter; no-op for annual.
    pub fn set_remaining(&mut self, value: u32) {
        if let Plan::SessionPack { remaining, .. } = &mut self.plan {
            *remaining = value;
        }
    }
}

// ── Sessions & slots ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Scheduled,
    Attended,
    Missed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Scheduled => "scheduled",
            SessionStatus::Attended => "attended",
            SessionStatus::Missed => "missed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    /// Every status except Scheduled is final.
    pub fn is_terminal(&self) -> bool {
        *self != SessionStatus::Scheduled
    }
}

/// A booked session. `subscription_id` None means the session was paid from
/// the account balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Ulid,
    pub account_id: Ulid,
    pub subscription_id: Option<Ulid>,
    pub resource_id: Ulid,
    pub date: NaiveDate,
    pub range: TimeRange,
    pub status: SessionStatus,
    pub booked_at: Ms,
    pub closed_at: Option<Ms>,
}

impl SessionRecord {
    /// Move to a terminal status. Caller has already validated the transition.
    pub fn close(&mut self, status: SessionStatus, closed_at: Ms) {
        self.status = status;
        self.closed_at = Some(closed_at);
    }
}

/// Key of one slot page: all reservations of one resource on one date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub resource_id: Ulid,
    pub date: NaiveDate,
}

/// One reservation inside a slot page; the owning session id is the booking
/// reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedSlot {
    pub range: TimeRange,
    pub session_id: Ulid,
}

/// Reservations of one (resource, date), sorted by `range.start`.
/// Invariant: no two slots overlap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotPage {
    pub slots: Vec<ReservedSlot>,
}

impl SlotPage {
    /// Insert maintaining sort order by range.start.
    pub fn insert(&mut self, slot: ReservedSlot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.range.start, |s| s.range.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    /// Remove the slot owned by `session_id`.
    pub fn remove(&mut self, session_id: Ulid) -> Option<ReservedSlot> {
        if let Some(pos) = self.slots.iter().position(|s| s.session_id == session_id) {
            Some(self.slots.remove(pos))
        } else {
            None
        }
    }

    /// Slots whose range overlaps the query range.
    /// Skips everything starting at or after `query.end` via binary search.
    pub fn overlapping(&self, query: &TimeRange) -> impl Iterator<Item = &ReservedSlot> {
        let right_bound = self.slots.partition_point(|s| s.range.start < query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.range.end > query.start)
    }
}

/// How a booking request wants to pay: draw down a subscription, or debit
/// the prepaid balance at the given price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Funding {
    Subscription(Ulid),
    Balance(Amount),
}

// ── WAL events ───────────────────────────────────────────────────

/// How a booking was funded, carrying the state the charge leaves behind so
/// replay needs no recomputation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Charge {
    Pack { subscription_id: Ulid, remaining_after: u32 },
    Annual { subscription_id: Ulid },
    Balance { entry: LedgerEntry },
}

/// Entitlement restored when a scheduled session is missed or cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Refund {
    PackUnit { subscription_id: Ulid, remaining_after: u32 },
    Balance { entry: LedgerEntry },
}

/// The event types — one logical mutation per record, applied atomically on
/// replay. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AccountOpened {
        id: Ulid,
        opened_at: Ms,
    },
    LedgerAppended {
        entry: LedgerEntry,
    },
    /// Pending or failed capture: transaction recorded, no ledger effect.
    /// Compaction also uses this to re-emit completed transactions whose
    /// entries are logged separately.
    PaymentRecorded {
        account_id: Ulid,
        tx: SourceTransaction,
    },
    /// Completed capture: transaction plus its credit entry in one record.
    PaymentCaptured {
        tx: SourceTransaction,
        entry: LedgerEntry,
    },
    SubscriptionGranted {
        sub: SubscriptionState,
    },
    SubscriptionStatusChanged {
        id: Ulid,
        status: SubscriptionStatus,
        changed_at: Ms,
    },
    BookingCreated {
        session: SessionRecord,
        charge: Charge,
    },
    /// Compaction snapshot of an existing session; inserts the session and,
    /// unless cancelled, its slot. Never charges anything.
    SessionLogged {
        session: SessionRecord,
    },
    SessionClosed {
        id: Ulid,
        status: SessionStatus,
        closed_at: Ms,
        refund: Option<Refund>,
    },
}

// ── Query result types ───────────────────────────────────────────

/// Outcome of replaying one account's chain against its live balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub account_id: Ulid,
    pub live_balance: Amount,
    pub replayed_balance: Amount,
    pub entries: u64,
    pub consistent: bool,
    /// First broken invariant, if any, e.g. "entry 3: balance_before 10.00 != prior balance_after 12.00".
    pub fault: Option<String>,
}

/// One row of the accounts listing: headline numbers without entry detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountOverview {
    pub account_id: Ulid,
    pub balance: Amount,
    pub entries: u64,
    pub payments: u64,
    pub opened_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusInfo {
    pub accounts: u64,
    pub subscriptions: u64,
    pub sessions: u64,
    pub wal_appends_since_compact: u64,
}
