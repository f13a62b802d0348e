//! Transactional-outbox relay domain.
//!
//! ## Design
//!
//! - Event records are written durably in the same transaction as the
//!   business mutation they describe (the outbox pattern)
//! - A relay forwards records to the message bus with at-least-once delivery
//! - Retry policy with exponential backoff and a dead-letter terminal state
//! - Per-aggregate publish ordering; no cross-aggregate ordering promises
//!
//! ## Components
//!
//! - `EventRecord`: the durable unit of delivery state
//! - `RetryPolicy`: backoff and attempt budget for failed publishes
//! - `tracker::decide`: pure status-transition decision for one attempt
//! - `OutboxStore`: persistence boundary (in-memory or durable)
//! - `Publisher`: message bus boundary (one publish per record)

pub mod policy;
pub mod publisher;
pub mod record;
pub mod store;
pub mod tracker;

pub use policy::{BackoffStrategy, RetryPolicy};
pub use publisher::{BusMessage, PublishError, Publisher};
pub use record::{EventRecord, EventStatus};
pub use store::{OutboxStats, OutboxStore, OutboxStoreError};
pub use tracker::{decide, FailureVerdict, Verdict};
