//! In-memory outbox store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use relaykit_core::EventId;
use relaykit_outbox::{
    EventRecord, EventStatus, FailureVerdict, OutboxStats, OutboxStore, OutboxStoreError,
};

/// In-memory outbox store.
///
/// Intended for tests/dev. Mirrors the conditional-update discipline of the
/// durable store: `mark_sent`/`mark_failed` only apply to records still in
/// status `New`, so re-application to a terminal record is a no-op.
#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    records: RwLock<HashMap<EventId, EventRecord>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock_err() -> OutboxStoreError {
        OutboxStoreError::Storage("lock poisoned".to_string())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn append(&self, record: EventRecord) -> Result<EventId, OutboxStoreError> {
        let mut records = self.records.write().map_err(|_| Self::lock_err())?;
        if records.contains_key(&record.id) {
            return Err(OutboxStoreError::AlreadyExists(record.id));
        }
        let id = record.id;
        records.insert(id, record);
        Ok(id)
    }

    async fn fetch_pending(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>, OutboxStoreError> {
        let records = self.records.read().map_err(|_| Self::lock_err())?;
        let mut pending: Vec<_> = records
            .values()
            .filter(|r| r.is_dispatchable(now))
            .cloned()
            .collect();

        // FIFO fairness, id as a stable tiebreak for equal timestamps.
        pending.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.as_uuid().cmp(b.id.as_uuid()))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_sent(&self, id: EventId, now: DateTime<Utc>) -> Result<(), OutboxStoreError> {
        let mut records = self.records.write().map_err(|_| Self::lock_err())?;
        let record = records.get_mut(&id).ok_or(OutboxStoreError::NotFound(id))?;
        record.mark_sent(now);
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: EventId,
        verdict: &FailureVerdict,
        now: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        let mut records = self.records.write().map_err(|_| Self::lock_err())?;
        let record = records.get_mut(&id).ok_or(OutboxStoreError::NotFound(id))?;
        record.apply_failure(verdict, now);
        Ok(())
    }

    async fn get(&self, id: EventId) -> Result<Option<EventRecord>, OutboxStoreError> {
        let records = self.records.read().map_err(|_| Self::lock_err())?;
        Ok(records.get(&id).cloned())
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        let records = self.records.read().map_err(|_| Self::lock_err())?;
        let mut stats = OutboxStats::default();
        for record in records.values() {
            match record.status {
                EventStatus::New => {
                    stats.pending += 1;
                    stats.oldest_pending_created_at = Some(
                        stats
                            .oldest_pending_created_at
                            .map_or(record.created_at, |oldest| oldest.min(record.created_at)),
                    );
                }
                EventStatus::Sent => stats.sent += 1,
                EventStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}
