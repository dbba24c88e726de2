//! Booking and credit consistency core speaking the Postgres wire protocol.
//! Accounts carry an append-only ledger, subscriptions meter entitlement,
//! and the booking path commits slot, session and charge as one
//! conditional write.

pub mod auditor;
pub mod auth;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod sql;
pub mod tenant;
pub mod tls;
pub mod wal;
pub mod wire;
