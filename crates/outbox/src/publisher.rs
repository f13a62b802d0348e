//! Message bus boundary: one publish call per event record.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use relaykit_core::EventId;

use crate::record::EventRecord;

/// The message handed to the bus for a single event record.
///
/// - `key` is the partition/ordering key (the record's `aggregate_id`), so the
///   bus preserves relative order among messages for the same aggregate.
/// - `event_id` and `event_type` travel as transport metadata for downstream
///   deduplication and routing; the body stays opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub key: String,
    pub body: String,
    pub event_id: EventId,
    pub event_type: String,
}

impl BusMessage {
    pub fn from_record(record: &EventRecord) -> Self {
        Self {
            key: record.aggregate_id.clone(),
            body: record.payload.clone(),
            event_id: record.id,
            event_type: record.event_type.clone(),
        }
    }
}

/// Failure of one publish attempt.
///
/// The split drives the retry policy: transient failures stay eligible for
/// later cycles, permanent failures dead-letter the record immediately.
/// "Accepted by the client library but not broker-acknowledged" is never
/// success; when in doubt, classify as transient.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// Timeout, broker unreachable, rate limit. Worth retrying.
    #[error("transient publish failure: {0}")]
    Transient(String),

    /// Message rejected as malformed, destination misconfigured. Retrying
    /// cannot help.
    #[error("permanent publish failure: {0}")]
    Permanent(String),
}

impl PublishError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PublishError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            PublishError::Transient(msg) | PublishError::Permanent(msg) => msg,
        }
    }
}

/// Publisher boundary for the relay.
///
/// `publish` must return only after the broker has durably acknowledged the
/// message (or definitively failed). Fire-and-forget implementations would
/// silently lose events on broker failure and are not acceptable here.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, message: &BusMessage) -> Result<(), PublishError>;
}

#[async_trait]
impl<P> Publisher for Arc<P>
where
    P: Publisher + ?Sized,
{
    async fn publish(&self, message: &BusMessage) -> Result<(), PublishError> {
        (**self).publish(message).await
    }
}
