//! The durable event record and its status lifecycle.

use chrono::{DateTime, Utc};
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use relaykit_core::{DomainError, EventId};

use crate::tracker::FailureVerdict;

/// Delivery status of an outbox event record.
///
/// Transitions are owned exclusively by the relay:
/// `New -> Sent` (success, terminal), `New -> Failed` (dead-letter, terminal),
/// and `New -> New` (transient failure, attempt recorded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    New,
    Sent,
    Failed,
}

impl EventStatus {
    /// Database/wire representation (`NEW` / `SENT` / `FAILED`).
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::New => "NEW",
            EventStatus::Sent => "SENT",
            EventStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Sent | EventStatus::Failed)
    }
}

impl core::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(EventStatus::New),
            "SENT" => Ok(EventStatus::Sent),
            "FAILED" => Ok(EventStatus::Failed),
            other => Err(DomainError::validation(format!(
                "unknown event status: {other}"
            ))),
        }
    }
}

/// A durable record of a domain event awaiting delivery to the message bus.
///
/// Written by the event writer in the same atomic transaction as the business
/// mutation it describes, then read and transitioned by the relay until it
/// reaches a terminal status. Records are retained after delivery for audit;
/// retention is an external concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Writer-assigned unique identifier. Immutable after insert.
    pub id: EventId,
    /// Semantic kind of the event (e.g. "ProductCreated").
    pub event_type: String,
    /// Business entity the event concerns; publish ordering/partition key.
    pub aggregate_id: String,
    /// Opaque serialized event body. The relay never interprets it.
    pub payload: String,
    /// Current delivery status.
    pub status: EventStatus,
    /// Number of failed publish attempts so far. Never decreases.
    pub attempt_count: u32,
    /// Diagnostic message from the most recent failed attempt.
    pub last_error: Option<String>,
    /// Insert time. Immutable; defines dispatch order.
    pub created_at: DateTime<Utc>,
    /// Set exactly once, when the record transitions to `Sent`.
    pub sent_at: Option<DateTime<Utc>>,
    /// When the most recent publish attempt finished.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Backoff gate: the record is not dispatchable before this instant.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl EventRecord {
    /// Create a new record in status `New` with a fresh UUIDv7 id.
    pub fn new(
        event_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self::with_id(EventId::new(), event_type, aggregate_id, payload)
    }

    /// Create a new record with an explicit id (writer-assigned ids, tests).
    pub fn with_id(
        id: EventId,
        event_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            id,
            event_type: event_type.into(),
            aggregate_id: aggregate_id.into(),
            payload: payload.into(),
            status: EventStatus::New,
            attempt_count: 0,
            last_error: None,
            created_at: Utc::now(),
            sent_at: None,
            last_attempt_at: None,
            next_attempt_at: None,
        }
    }

    /// Override the creation timestamp (tests that need a fixed dispatch order).
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Whether the record is eligible for a publish attempt at `now`.
    ///
    /// Only `New` records whose backoff gate has elapsed are dispatchable.
    pub fn is_dispatchable(&self, now: DateTime<Utc>) -> bool {
        self.status == EventStatus::New
            && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Transition to `Sent`. No-op if the record is already terminal.
    pub fn mark_sent(&mut self, now: DateTime<Utc>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = EventStatus::Sent;
        self.sent_at = Some(now);
        self.last_error = None;
        self.next_attempt_at = None;
    }

    /// Record the outcome of a failed publish attempt. No-op on terminal records.
    pub fn apply_failure(&mut self, verdict: &FailureVerdict, now: DateTime<Utc>) {
        if self.status.is_terminal() {
            return;
        }
        self.last_attempt_at = Some(now);
        match verdict {
            FailureVerdict::Retry {
                error,
                next_attempt_at,
            } => {
                self.attempt_count += 1;
                self.last_error = Some(error.clone());
                self.next_attempt_at = Some(*next_attempt_at);
            }
            FailureVerdict::Exhausted { error } => {
                self.attempt_count += 1;
                self.last_error = Some(error.clone());
                self.status = EventStatus::Failed;
                self.next_attempt_at = None;
            }
            FailureVerdict::Rejected {
                error,
                attempt_floor,
            } => {
                // Retrying cannot help; charge the whole attempt budget at once.
                self.attempt_count = (self.attempt_count + 1).max(*attempt_floor);
                self.last_error = Some(error.clone());
                self.status = EventStatus::Failed;
                self.next_attempt_at = None;
            }
        }
    }
}
