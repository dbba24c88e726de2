//! Hard caps on tenant state and request shapes. Everything here fails fast
//! with `EngineError::LimitExceeded` rather than letting one caller grow a
//! tenant without bound.

/// Tenants per process.
pub const MAX_TENANTS: usize = 64;

/// Tenant (database) name length.
pub const MAX_TENANT_NAME_LEN: usize = 64;

/// Accounts per tenant.
pub const MAX_ACCOUNTS_PER_TENANT: usize = 100_000;

/// Ledger entries per account. The chain is append-only, so this also bounds
/// replay and audit cost per account.
pub const MAX_ENTRIES_PER_ACCOUNT: usize = 100_000;

/// Source transactions per account.
pub const MAX_PAYMENTS_PER_ACCOUNT: usize = 10_000;

/// Subscriptions per account.
pub const MAX_SUBSCRIPTIONS_PER_ACCOUNT: usize = 1_000;

/// Sessions per account.
pub const MAX_SESSIONS_PER_ACCOUNT: usize = 10_000;

/// Reserved slots per resource per day. 288 five-minute slots fit a day;
/// leave headroom for odd durations.
pub const MAX_SLOTS_PER_PAGE: usize = 512;

/// Admin adjustment note length.
pub const MAX_NOTE_LEN: usize = 256;

/// Payment external reference length.
pub const MAX_REFERENCE_LEN: usize = 128;

/// Single-operation amount cap in cents (one million currency units).
pub const MAX_AMOUNT_CENTS: i64 = 100_000_000;

/// Sessions in one pack grant.
pub const MAX_PACK_SESSIONS: u32 = 1_000;

/// Valid instant window: 2000-01-01 .. 2100-01-01 UTC, in unix ms.
pub const MIN_VALID_TIMESTAMP_MS: i64 = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: i64 = 4_102_444_800_000;

/// Optimistic commit attempts before an operation surfaces as unavailable.
pub const COMMIT_ATTEMPTS: u32 = 4;

/// Linear backoff step between commit attempts.
pub const COMMIT_BACKOFF_MS: u64 = 2;
