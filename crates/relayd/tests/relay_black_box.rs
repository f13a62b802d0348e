//! Black-box tests for the relay daemon wiring: drive the same components the
//! binary assembles, using in-memory implementations end to end.

use std::sync::Arc;
use std::time::Duration;

use relaykit_infra::outbox_store::InMemoryOutboxStore;
use relaykit_infra::publisher::InMemoryPublisher;
use relaykit_infra::relay::RelayScheduler;
use relaykit_outbox::{EventRecord, EventStatus, OutboxStore, Publisher};
use relaykit_relayd::config::RelayConfig;
use relaykit_relayd::wiring;

fn fast_config() -> RelayConfig {
    RelayConfig {
        dispatch_interval: Duration::from_millis(10),
        ..RelayConfig::default()
    }
}

#[tokio::test]
async fn relay_delivers_written_records_end_to_end() {
    let config = fast_config();
    let store = InMemoryOutboxStore::arc();
    let publisher = InMemoryPublisher::arc();

    // Two events for one aggregate, one for another, written before boot.
    let first = EventRecord::new("OrderPlaced", "order-1", r#"{"total":10}"#);
    let second = EventRecord::new("OrderPaid", "order-1", r#"{"total":10}"#);
    let other = EventRecord::new("OrderPlaced", "order-2", r#"{"total":99}"#);
    for record in [&first, &second, &other] {
        store.append(record.clone()).await.unwrap();
    }

    let handle = RelayScheduler::spawn(
        store.clone(),
        publisher.clone(),
        config.retry_policy(),
        config.dispatcher_config(),
        config.scheduler_config(),
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.shutdown().await;

    for record in [&first, &second, &other] {
        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Sent);
    }

    // Relative order within the aggregate survived the relay.
    let log = publisher.published_for_key("order-1");
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].event_id, first.id);
    assert_eq!(log[1].event_id, second.id);

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.sent, 3);
}

#[tokio::test]
async fn records_written_while_running_are_picked_up() {
    let config = fast_config();
    let store = InMemoryOutboxStore::arc();
    let publisher = InMemoryPublisher::arc();

    let handle = RelayScheduler::spawn(
        store.clone(),
        publisher.clone(),
        config.retry_policy(),
        config.dispatcher_config(),
        config.scheduler_config(),
    );

    let record = EventRecord::new("OrderPlaced", "order-1", "{}");
    store.append(record.clone()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.shutdown().await;

    let stored = store.get(record.id).await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::Sent);
}

#[tokio::test]
async fn startup_smoke_test_publishes_one_probe() {
    let concrete = InMemoryPublisher::arc();
    let publisher: Arc<dyn Publisher> = concrete.clone();

    wiring::startup_smoke_test(&publisher).await;

    let published = concrete.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].event_type, "relayd.startup_probe");
}

#[tokio::test]
async fn wiring_falls_back_to_in_memory_components() {
    // No DATABASE_URL / REDIS_URL configured: wiring must still come up.
    let config = RelayConfig::default();

    let store = wiring::build_store(&config).await.unwrap();
    let publisher = wiring::build_publisher(&config).unwrap();

    let record = EventRecord::new("OrderPlaced", "order-1", "{}");
    store.append(record.clone()).await.unwrap();
    assert_eq!(store.stats().await.unwrap().pending, 1);

    wiring::startup_smoke_test(&publisher).await;
}
