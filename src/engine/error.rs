use ulid::Ulid;

use crate::model::Amount;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Zero or negative amount where a positive one is required.
    InvalidAmount(Amount),
    InsufficientFunds {
        balance: Amount,
        requested: Amount,
    },
    NoSessionsRemaining(Ulid),
    SubscriptionExpired(Ulid),
    /// Requested range overlaps the reservation owned by this session.
    SlotConflict(Ulid),
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },
    DuplicatePayment(String),
    Forbidden(&'static str),
    InvalidSlot(&'static str),
    LimitExceeded(&'static str),
    /// A document moved between snapshot and commit. Internal; retried and
    /// never surfaced directly.
    WriteConflict,
    /// Ledger commit retries exhausted. Callers may retry.
    LedgerUnavailable,
    /// Booking or session commit retries exhausted. Callers may retry.
    BookingUnavailable,
    WalError(String),
}

impl EngineError {
    /// True for errors a caller should retry; false for errors that will fail
    /// the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::WriteConflict
                | EngineError::LedgerUnavailable
                | EngineError::BookingUnavailable
        )
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidAmount(a) => write!(f, "invalid amount: {a}"),
            EngineError::InsufficientFunds { balance, requested } => {
                write!(f, "insufficient funds: balance {balance}, requested {requested}")
            }
            EngineError::NoSessionsRemaining(id) => {
                write!(f, "no sessions remaining on subscription: {id}")
            }
            EngineError::SubscriptionExpired(id) => write!(f, "subscription expired: {id}"),
            EngineError::SlotConflict(id) => write!(f, "slot conflict with session: {id}"),
            EngineError::InvalidStateTransition { from, to } => {
                write!(f, "invalid state transition: {from} -> {to}")
            }
            EngineError::DuplicatePayment(reference) => {
                write!(f, "duplicate payment: {reference} already captured")
            }
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::InvalidSlot(msg) => write!(f, "invalid slot: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WriteConflict => write!(f, "write conflict"),
            EngineError::LedgerUnavailable => {
                write!(f, "ledger unavailable: commit retries exhausted, try again")
            }
            EngineError::BookingUnavailable => {
                write!(f, "booking unavailable: commit retries exhausted, try again")
            }
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
