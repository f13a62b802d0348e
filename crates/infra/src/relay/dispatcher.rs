//! The dispatcher: one bounded batch of pending records, published with
//! per-aggregate ordering and per-record outcome commits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use relaykit_outbox::{
    decide, BusMessage, EventRecord, OutboxStats, OutboxStore, OutboxStoreError, PublishError,
    Publisher, RetryPolicy, Verdict,
};

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum records fetched per cycle (bounds memory and broker fan-out).
    pub batch_size: usize,
    /// Maximum aggregates dispatched concurrently within a cycle.
    pub max_concurrent_aggregates: usize,
    /// Hard bound on a single publish attempt; timeouts classify as transient.
    pub publish_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            max_concurrent_aggregates: 8,
            publish_timeout: Duration::from_secs(10),
        }
    }
}

impl DispatcherConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_concurrent_aggregates(mut self, max: usize) -> Self {
        self.max_concurrent_aggregates = max;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }
}

/// What one dispatch cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CycleReport {
    /// Records fetched from the store this cycle.
    pub fetched: usize,
    /// Records acknowledged by the broker and marked `SENT`.
    pub published: usize,
    /// Records that failed transiently and stay eligible for retry.
    pub retried: usize,
    /// Records that reached the `FAILED` terminal state this cycle.
    pub dead_lettered: usize,
    /// Records held back to preserve per-aggregate ordering.
    pub deferred: usize,
}

impl CycleReport {
    fn absorb(&mut self, group: GroupOutcome) {
        self.published += group.published;
        self.retried += group.retried;
        self.dead_lettered += group.dead_lettered;
        self.deferred += group.deferred;
    }
}

#[derive(Debug, Default)]
struct GroupOutcome {
    published: usize,
    retried: usize,
    dead_lettered: usize,
    deferred: usize,
}

/// Publishes pending outbox records to the message bus.
///
/// One `run_cycle` call fetches a bounded batch, publishes each record, and
/// commits each outcome independently: a single record's failure never aborts
/// the batch. Records for different aggregates are dispatched concurrently;
/// records sharing an aggregate go strictly in `created_at` order, and a
/// retryable failure defers the rest of its aggregate to the next cycle so
/// the bus never observes events out of order.
pub struct Dispatcher<S, P> {
    store: S,
    publisher: P,
    policy: RetryPolicy,
    config: DispatcherConfig,
    // Guard against overlapping cycles when triggered outside the scheduler.
    in_flight: Mutex<()>,
}

impl<S, P> Dispatcher<S, P>
where
    S: OutboxStore + Clone + Send + Sync + 'static,
    P: Publisher + Clone + Send + Sync + 'static,
{
    pub fn new(store: S, publisher: P, policy: RetryPolicy, config: DispatcherConfig) -> Self {
        Self {
            store,
            publisher,
            policy,
            config,
            in_flight: Mutex::new(()),
        }
    }

    /// Delivery statistics from the underlying store.
    pub async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        self.store.stats().await
    }

    /// Run one dispatch cycle.
    ///
    /// Returns `Err` only for store-level failures, which abort the cycle;
    /// the scheduler logs these and retries on the next tick. If a cycle is
    /// already in flight the call is a no-op.
    pub async fn run_cycle(&self) -> Result<CycleReport, OutboxStoreError> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("dispatch cycle already in flight; skipping");
            return Ok(CycleReport::default());
        };

        let batch = self
            .store
            .fetch_pending(self.config.batch_size, Utc::now())
            .await?;

        let mut report = CycleReport {
            fetched: batch.len(),
            ..Default::default()
        };
        if batch.is_empty() {
            return Ok(report);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_aggregates.max(1)));
        let mut tasks = JoinSet::new();

        for (aggregate_id, records) in group_by_aggregate(batch) {
            let store = self.store.clone();
            let publisher = self.publisher.clone();
            let policy = self.policy.clone();
            let publish_timeout = self.config.publish_timeout;
            let semaphore = Arc::clone(&semaphore);

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("dispatch semaphore closed");
                dispatch_group(
                    &store,
                    &publisher,
                    &policy,
                    publish_timeout,
                    &aggregate_id,
                    records,
                )
                .await
            });
        }

        // Drain every group before surfacing a store failure, so outcomes
        // already decided are not lost mid-cycle.
        let mut cycle_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(group)) => report.absorb(group),
                Ok(Err(store_error)) => cycle_error = Some(store_error),
                Err(join_error) => {
                    cycle_error = Some(OutboxStoreError::Storage(format!(
                        "dispatch task failed: {join_error}"
                    )));
                }
            }
        }

        match cycle_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }
}

/// Group a fetched batch by `aggregate_id`, preserving the store's
/// `created_at` order both across groups (first-seen) and within each group.
fn group_by_aggregate(batch: Vec<EventRecord>) -> Vec<(String, Vec<EventRecord>)> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<EventRecord>)> = Vec::new();

    for record in batch {
        match index.get(record.aggregate_id.as_str()) {
            Some(&slot) => groups[slot].1.push(record),
            None => {
                index.insert(record.aggregate_id.clone(), groups.len());
                groups.push((record.aggregate_id.clone(), vec![record]));
            }
        }
    }

    groups
}

async fn dispatch_group<S, P>(
    store: &S,
    publisher: &P,
    policy: &RetryPolicy,
    publish_timeout: Duration,
    aggregate_id: &str,
    records: Vec<EventRecord>,
) -> Result<GroupOutcome, OutboxStoreError>
where
    S: OutboxStore,
    P: Publisher,
{
    let mut outcome = GroupOutcome::default();
    let mut queue = records.into_iter();

    while let Some(record) = queue.next() {
        let message = BusMessage::from_record(&record);
        let attempt = match tokio::time::timeout(publish_timeout, publisher.publish(&message)).await
        {
            Ok(result) => result,
            Err(_) => Err(PublishError::Transient(format!(
                "publish timed out after {publish_timeout:?}"
            ))),
        };

        match decide(&record, &attempt, policy, Utc::now()) {
            Verdict::Sent => {
                store.mark_sent(record.id, Utc::now()).await?;
                outcome.published += 1;
                debug!(
                    event_id = %record.id,
                    aggregate_id = %aggregate_id,
                    "event published"
                );
            }
            Verdict::Failed(verdict) => {
                store.mark_failed(record.id, &verdict, Utc::now()).await?;
                if verdict.is_dead_letter() {
                    warn!(
                        event_id = %record.id,
                        aggregate_id = %aggregate_id,
                        attempt_count = record.attempt_count + 1,
                        error = %verdict.error(),
                        "event dead-lettered"
                    );
                    outcome.dead_lettered += 1;
                    // This record will never reach the bus, so later events
                    // for the aggregate are free to proceed.
                } else {
                    warn!(
                        event_id = %record.id,
                        aggregate_id = %aggregate_id,
                        error = %verdict.error(),
                        "publish failed; will retry"
                    );
                    outcome.retried += 1;
                    // The record must reach the bus before anything newer for
                    // this aggregate; hold the rest back for the next cycle.
                    outcome.deferred += queue.len();
                    break;
                }
            }
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox_store::InMemoryOutboxStore;
    use crate::publisher::InMemoryPublisher;
    use chrono::Duration as ChronoDuration;
    use relaykit_core::EventId;
    use relaykit_outbox::EventStatus;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex as StdMutex;

    /// Publisher that fails scripted attempts per event id, then delegates to
    /// an in-memory log for acknowledged messages.
    #[derive(Default)]
    struct ScriptedPublisher {
        log: InMemoryPublisher,
        scripts: StdMutex<HashMap<EventId, VecDeque<PublishError>>>,
    }

    impl ScriptedPublisher {
        fn fail_next(&self, id: EventId, errors: Vec<PublishError>) {
            self.scripts
                .lock()
                .unwrap()
                .insert(id, errors.into_iter().collect());
        }
    }

    #[async_trait::async_trait]
    impl Publisher for ScriptedPublisher {
        async fn publish(&self, message: &BusMessage) -> Result<(), PublishError> {
            let scripted = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&message.event_id)
                .and_then(|errors| errors.pop_front());
            match scripted {
                Some(err) => Err(err),
                None => self.log.publish(message).await,
            }
        }
    }

    fn dispatcher(
        store: Arc<InMemoryOutboxStore>,
        publisher: Arc<ScriptedPublisher>,
        max_attempts: u32,
    ) -> Dispatcher<Arc<InMemoryOutboxStore>, Arc<ScriptedPublisher>> {
        Dispatcher::new(
            store,
            publisher,
            RetryPolicy::immediate(max_attempts),
            DispatcherConfig::default(),
        )
    }

    #[tokio::test]
    async fn same_aggregate_records_publish_in_created_at_order() {
        let store = InMemoryOutboxStore::arc();
        let publisher = Arc::new(ScriptedPublisher::default());
        let t0 = Utc::now() - ChronoDuration::seconds(10);

        let a = EventRecord::new("ProductCreated", "product-1", r#"{"v":1}"#).created_at(t0);
        let b = EventRecord::new("ProductUpdated", "product-1", r#"{"v":2}"#)
            .created_at(t0 + ChronoDuration::seconds(1));
        store.append(a.clone()).await.unwrap();
        store.append(b.clone()).await.unwrap();

        let report = dispatcher(store.clone(), publisher.clone(), 5)
            .run_cycle()
            .await
            .unwrap();

        assert_eq!(report.fetched, 2);
        assert_eq!(report.published, 2);

        for id in [a.id, b.id] {
            let record = store.get(id).await.unwrap().unwrap();
            assert_eq!(record.status, EventStatus::Sent);
            assert!(record.sent_at.is_some());
        }

        let log = publisher.log.published_for_key("product-1");
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].event_id, a.id);
        assert_eq!(log[1].event_id, b.id);
    }

    #[tokio::test]
    async fn transient_failures_retry_until_acknowledged() {
        let store = InMemoryOutboxStore::arc();
        let publisher = Arc::new(ScriptedPublisher::default());

        let c = EventRecord::new("ProductCreated", "product-1", "{}");
        publisher.fail_next(
            c.id,
            vec![
                PublishError::Transient("broker down".to_string()),
                PublishError::Transient("broker down".to_string()),
                PublishError::Transient("broker down".to_string()),
            ],
        );
        store.append(c.clone()).await.unwrap();

        let dispatcher = dispatcher(store.clone(), publisher.clone(), 5);
        for _ in 0..4 {
            dispatcher.run_cycle().await.unwrap();
        }

        let record = store.get(c.id).await.unwrap().unwrap();
        assert_eq!(record.status, EventStatus::Sent);
        assert_eq!(record.attempt_count, 3);
        assert!(record.last_error.is_none());
        assert_eq!(publisher.log.published().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_the_record() {
        let store = InMemoryOutboxStore::arc();
        let publisher = Arc::new(ScriptedPublisher::default());

        let record = EventRecord::new("ProductCreated", "product-1", "{}");
        publisher.fail_next(
            record.id,
            vec![PublishError::Transient("down".to_string()); 10],
        );
        store.append(record.clone()).await.unwrap();

        let dispatcher = dispatcher(store.clone(), publisher.clone(), 3);
        for _ in 0..3 {
            dispatcher.run_cycle().await.unwrap();
        }

        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Failed);
        assert_eq!(stored.attempt_count, 3);
        assert!(stored.last_error.is_some());

        // Dead-lettered records are never fetched again.
        let report = dispatcher.run_cycle().await.unwrap();
        assert_eq!(report.fetched, 0);
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_without_retries() {
        let store = InMemoryOutboxStore::arc();
        let publisher = Arc::new(ScriptedPublisher::default());

        let d = EventRecord::new("ProductCreated", "product-1", "not json");
        publisher.fail_next(
            d.id,
            vec![PublishError::Permanent("malformed message".to_string())],
        );
        store.append(d.clone()).await.unwrap();

        let dispatcher = dispatcher(store.clone(), publisher.clone(), 3);
        let report = dispatcher.run_cycle().await.unwrap();
        assert_eq!(report.dead_lettered, 1);

        let stored = store.get(d.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Failed);
        assert_eq!(stored.attempt_count, 3);
        assert_eq!(stored.last_error.as_deref(), Some("malformed message"));
        assert!(publisher.log.published().is_empty());
    }

    #[tokio::test]
    async fn failure_in_one_aggregate_does_not_block_others() {
        let store = InMemoryOutboxStore::arc();
        let publisher = Arc::new(ScriptedPublisher::default());
        let t0 = Utc::now() - ChronoDuration::seconds(10);

        let blocked = EventRecord::new("ProductCreated", "product-1", "{}").created_at(t0);
        let healthy = EventRecord::new("ProductCreated", "product-2", "{}")
            .created_at(t0 + ChronoDuration::seconds(1));
        publisher.fail_next(
            blocked.id,
            vec![PublishError::Transient("down".to_string())],
        );
        store.append(blocked.clone()).await.unwrap();
        store.append(healthy.clone()).await.unwrap();

        let report = dispatcher(store.clone(), publisher.clone(), 5)
            .run_cycle()
            .await
            .unwrap();

        assert_eq!(report.published, 1);
        assert_eq!(report.retried, 1);

        let blocked = store.get(blocked.id).await.unwrap().unwrap();
        assert_eq!(blocked.status, EventStatus::New);
        assert_eq!(blocked.attempt_count, 1);
        let healthy = store.get(healthy.id).await.unwrap().unwrap();
        assert_eq!(healthy.status, EventStatus::Sent);
    }

    #[tokio::test]
    async fn retryable_failure_defers_later_records_of_the_same_aggregate() {
        let store = InMemoryOutboxStore::arc();
        let publisher = Arc::new(ScriptedPublisher::default());
        let t0 = Utc::now() - ChronoDuration::seconds(10);

        let a = EventRecord::new("ProductCreated", "product-1", r#"{"v":1}"#).created_at(t0);
        let b = EventRecord::new("ProductUpdated", "product-1", r#"{"v":2}"#)
            .created_at(t0 + ChronoDuration::seconds(1));
        publisher.fail_next(a.id, vec![PublishError::Transient("down".to_string())]);
        store.append(a.clone()).await.unwrap();
        store.append(b.clone()).await.unwrap();

        let dispatcher = dispatcher(store.clone(), publisher.clone(), 5);
        let report = dispatcher.run_cycle().await.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(report.deferred, 1);

        // B was held back untouched: no attempt charged, nothing published.
        let held = store.get(b.id).await.unwrap().unwrap();
        assert_eq!(held.status, EventStatus::New);
        assert_eq!(held.attempt_count, 0);
        assert!(publisher.log.published().is_empty());

        // Next cycle drains both, in order.
        dispatcher.run_cycle().await.unwrap();
        let log = publisher.log.published_for_key("product-1");
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].event_id, a.id);
        assert_eq!(log[1].event_id, b.id);
    }

    /// Publisher that sleeps before acknowledging, to exercise the publish
    /// timeout and the cycle-in-flight guard.
    struct SlowPublisher {
        log: InMemoryPublisher,
        delay: Duration,
    }

    impl SlowPublisher {
        fn new(delay: Duration) -> Self {
            Self {
                log: InMemoryPublisher::new(),
                delay,
            }
        }
    }

    #[async_trait::async_trait]
    impl Publisher for SlowPublisher {
        async fn publish(&self, message: &BusMessage) -> Result<(), PublishError> {
            tokio::time::sleep(self.delay).await;
            self.log.publish(message).await
        }
    }

    #[tokio::test]
    async fn publish_timeout_counts_as_a_transient_failure() {
        let store = InMemoryOutboxStore::arc();
        let publisher = Arc::new(SlowPublisher::new(Duration::from_secs(5)));

        let record = EventRecord::new("ProductCreated", "product-1", "{}");
        store.append(record.clone()).await.unwrap();

        let dispatcher = Dispatcher::new(
            store.clone(),
            publisher.clone(),
            RetryPolicy::immediate(5),
            DispatcherConfig::default().with_publish_timeout(Duration::from_millis(20)),
        );

        let report = dispatcher.run_cycle().await.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(report.published, 0);

        // Timed-out attempt is charged as transient: record stays retryable.
        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::New);
        assert_eq!(stored.attempt_count, 1);
        assert!(stored.last_error.unwrap().contains("timed out"));
        assert!(publisher.log.published().is_empty());
    }

    #[tokio::test]
    async fn overlapping_cycles_are_skipped() {
        let store = InMemoryOutboxStore::arc();
        let publisher = Arc::new(SlowPublisher::new(Duration::from_millis(200)));

        let record = EventRecord::new("ProductCreated", "product-1", "{}");
        store.append(record.clone()).await.unwrap();

        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            publisher,
            RetryPolicy::immediate(5),
            DispatcherConfig::default(),
        ));

        let running = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.run_cycle().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The first cycle still holds the in-flight guard: this call is a
        // no-op and never reaches the store.
        let skipped = dispatcher.run_cycle().await.unwrap();
        assert_eq!(skipped, CycleReport::default());

        let report = running.await.unwrap().unwrap();
        assert_eq!(report.published, 1);

        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Sent);
    }

    #[tokio::test]
    async fn empty_store_yields_an_empty_report() {
        let store = InMemoryOutboxStore::arc();
        let publisher = Arc::new(ScriptedPublisher::default());

        let report = dispatcher(store, publisher, 5).run_cycle().await.unwrap();
        assert_eq!(report, CycleReport::default());
    }

    #[tokio::test]
    async fn mixed_batch_drains_to_terminal_states_within_bounded_cycles() {
        let store = InMemoryOutboxStore::arc();
        let publisher = Arc::new(ScriptedPublisher::default());
        let max_attempts = 3;

        let flaky = EventRecord::new("ProductCreated", "product-1", "{}");
        let doomed = EventRecord::new("ProductCreated", "product-2", "{}");
        let clean = EventRecord::new("ProductCreated", "product-3", "{}");
        publisher.fail_next(
            flaky.id,
            vec![PublishError::Transient("down".to_string()); 2],
        );
        publisher.fail_next(
            doomed.id,
            vec![PublishError::Transient("down".to_string()); 10],
        );
        for record in [&flaky, &doomed, &clean] {
            store.append(record.clone()).await.unwrap();
        }

        let dispatcher = dispatcher(store.clone(), publisher.clone(), max_attempts);
        for _ in 0..max_attempts {
            dispatcher.run_cycle().await.unwrap();
        }

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.failed, 1);
    }
}
