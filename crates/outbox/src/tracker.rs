//! Status tracking: the pure decision applied after each publish attempt.
//!
//! Centralizing the retry/backoff/dead-letter policy as a pure function keeps
//! it independently testable without a live broker or store. The dispatcher
//! calls [`decide`] once per record per cycle and hands the verdict to the
//! store, which persists it with a single conditional update.

use chrono::{DateTime, Utc};

use crate::policy::RetryPolicy;
use crate::publisher::PublishError;
use crate::record::EventRecord;

/// Persistable outcome of one failed publish attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureVerdict {
    /// Record stays `New`; not dispatchable again before `next_attempt_at`.
    Retry {
        error: String,
        next_attempt_at: DateTime<Utc>,
    },
    /// The attempt budget is spent; record moves to `Failed`.
    Exhausted { error: String },
    /// The broker rejected the message outright; record moves to `Failed`
    /// and `attempt_count` jumps to at least `attempt_floor`.
    Rejected { error: String, attempt_floor: u32 },
}

impl FailureVerdict {
    pub fn error(&self) -> &str {
        match self {
            FailureVerdict::Retry { error, .. }
            | FailureVerdict::Exhausted { error }
            | FailureVerdict::Rejected { error, .. } => error,
        }
    }

    /// Whether the verdict moves the record to the `Failed` terminal state.
    pub fn is_dead_letter(&self) -> bool {
        !matches!(self, FailureVerdict::Retry { .. })
    }
}

/// Outcome of applying the retry policy to one publish attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The broker acknowledged the message; mark the record `Sent`.
    Sent,
    /// The attempt failed; persist the contained failure verdict.
    Failed(FailureVerdict),
}

/// Decide the next lifecycle state for `record` after one publish attempt.
///
/// Pure: no side effects beyond the returned verdict. Transient failures are
/// retried with backoff until the attempt budget runs out; permanent failures
/// consume the whole budget at once since retrying cannot help.
pub fn decide(
    record: &EventRecord,
    outcome: &Result<(), PublishError>,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Verdict {
    match outcome {
        Ok(()) => Verdict::Sent,
        Err(PublishError::Transient(error)) => {
            let attempts_after = record.attempt_count + 1;
            if policy.should_retry(attempts_after) {
                Verdict::Failed(FailureVerdict::Retry {
                    error: error.clone(),
                    next_attempt_at: now
                        + chrono::Duration::from_std(policy.delay_for_attempt(attempts_after))
                            .unwrap_or_default(),
                })
            } else {
                Verdict::Failed(FailureVerdict::Exhausted {
                    error: error.clone(),
                })
            }
        }
        Err(PublishError::Permanent(error)) => Verdict::Failed(FailureVerdict::Rejected {
            error: error.clone(),
            attempt_floor: policy.max_attempts,
        }),
    }
}
