//! Outbox store boundary.
//!
//! The store is the single source of truth for delivery state and the only
//! component permitted to persist status changes. The dispatcher holds
//! records only as transient working copies during a cycle.
//!
//! ## Implementation Requirements
//!
//! - `append` must be callable inside the same atomic transaction as the
//!   business mutation it accompanies (durable implementations expose a
//!   transaction-scoped variant for this)
//! - `mark_sent` / `mark_failed` must be single-row conditional updates
//!   (compare-and-set on `status`), never application-level
//!   read-modify-write, so they stay correct under concurrent workers
//! - Both marks are idempotent: re-applying to a terminal record is a no-op

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use relaykit_core::EventId;

use crate::record::EventRecord;
use crate::tracker::FailureVerdict;

/// Outbox store error.
#[derive(Debug, Clone, Error)]
pub enum OutboxStoreError {
    #[error("event record not found: {0}")]
    NotFound(EventId),
    #[error("event record already exists: {0}")]
    AlreadyExists(EventId),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Point-in-time delivery statistics.
///
/// `oldest_pending_created_at` drives the relay's key health signal: the age
/// of the oldest unsent record. A growing age means the relay has stalled.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub sent: u64,
    pub failed: u64,
    pub oldest_pending_created_at: Option<DateTime<Utc>>,
}

impl OutboxStats {
    /// Age of the oldest unsent record, if any records are pending.
    pub fn oldest_pending_age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.oldest_pending_created_at.map(|at| now - at)
    }
}

/// Durable table of pending/sent/failed event records.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a new record in status `New`.
    async fn append(&self, record: EventRecord) -> Result<EventId, OutboxStoreError>;

    /// Up to `limit` dispatchable records: status `New`, backoff gate elapsed
    /// at `now`, ordered ascending by `created_at` (FIFO fairness).
    async fn fetch_pending(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>, OutboxStoreError>;

    /// Atomically transition a record to `Sent`, setting `sent_at` and
    /// clearing `last_error`. No-op if the record is already terminal.
    async fn mark_sent(&self, id: EventId, now: DateTime<Utc>) -> Result<(), OutboxStoreError>;

    /// Atomically record a failed attempt. Retry verdicts keep the record
    /// `New` behind a backoff gate; exhausted/rejected verdicts move it to
    /// `Failed`. No-op if the record is already terminal.
    async fn mark_failed(
        &self,
        id: EventId,
        verdict: &FailureVerdict,
        now: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError>;

    /// Point lookup by id (operator surface, tests).
    async fn get(&self, id: EventId) -> Result<Option<EventRecord>, OutboxStoreError>;

    /// Delivery statistics across all records.
    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError>;
}

#[async_trait]
impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    async fn append(&self, record: EventRecord) -> Result<EventId, OutboxStoreError> {
        (**self).append(record).await
    }

    async fn fetch_pending(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>, OutboxStoreError> {
        (**self).fetch_pending(limit, now).await
    }

    async fn mark_sent(&self, id: EventId, now: DateTime<Utc>) -> Result<(), OutboxStoreError> {
        (**self).mark_sent(id, now).await
    }

    async fn mark_failed(
        &self,
        id: EventId,
        verdict: &FailureVerdict,
        now: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        (**self).mark_failed(id, verdict, now).await
    }

    async fn get(&self, id: EventId) -> Result<Option<EventRecord>, OutboxStoreError> {
        (**self).get(id).await
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        (**self).stats().await
    }
}
