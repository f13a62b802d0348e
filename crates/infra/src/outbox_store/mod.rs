//! Outbox store implementations.
//!
//! The store abstraction lives in `relaykit-outbox` as pure mechanics. This
//! module provides the in-memory implementation (tests/dev) and the
//! Postgres-backed implementation (production).

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryOutboxStore;
pub use postgres::PostgresOutboxStore;
