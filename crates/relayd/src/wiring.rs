//! Component wiring for the relay daemon.
//!
//! `DATABASE_URL` selects the Postgres store (schema ensured at boot),
//! `REDIS_URL` the Redis Streams publisher; either falls back to the
//! in-memory implementation when unset so the daemon runs standalone.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use relaykit_core::EventId;
use relaykit_infra::outbox_store::{InMemoryOutboxStore, PostgresOutboxStore};
use relaykit_infra::publisher::InMemoryPublisher;
use relaykit_infra::relay::RelayScheduler;
use relaykit_outbox::{BusMessage, OutboxStore, Publisher};

use crate::config::RelayConfig;

pub async fn build_store(config: &RelayConfig) -> anyhow::Result<Arc<dyn OutboxStore>> {
    match &config.database_url {
        Some(url) => {
            let pool = sqlx::PgPool::connect(url)
                .await
                .context("failed to connect to Postgres")?;
            let store = PostgresOutboxStore::new(pool);
            store
                .ensure_schema()
                .await
                .context("failed to ensure outbox schema")?;
            info!("using Postgres outbox store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory outbox store");
            Ok(InMemoryOutboxStore::arc())
        }
    }
}

pub fn build_publisher(config: &RelayConfig) -> anyhow::Result<Arc<dyn Publisher>> {
    match &config.redis_url {
        Some(url) => {
            #[cfg(feature = "redis")]
            {
                use relaykit_infra::publisher::RedisStreamsPublisher;
                let publisher =
                    RedisStreamsPublisher::new(url, Some(config.stream_key.clone()))
                        .context("failed to create Redis Streams publisher")?;
                info!(stream_key = %config.stream_key, "using Redis Streams publisher");
                return Ok(Arc::new(publisher));
            }
            #[cfg(not(feature = "redis"))]
            {
                let _ = url;
                warn!("REDIS_URL set but relayd built without the redis feature; using in-memory publisher");
                Ok(InMemoryPublisher::arc())
            }
        }
        None => {
            warn!("REDIS_URL not set; using in-memory publisher");
            Ok(InMemoryPublisher::arc())
        }
    }
}

/// Publish one synthetic diagnostic message at boot to verify the bus path.
///
/// The outcome is logged either way; a failing smoke test never blocks
/// startup, since the broker may simply not be up yet and the relay's retry
/// machinery covers real records.
pub async fn startup_smoke_test(publisher: &Arc<dyn Publisher>) {
    let probe = BusMessage {
        key: "relayd:diagnostic".to_string(),
        body: r#"{"probe":true}"#.to_string(),
        event_id: EventId::new(),
        event_type: "relayd.startup_probe".to_string(),
    };

    match publisher.publish(&probe).await {
        Ok(()) => info!(event_id = %probe.event_id, "startup probe acknowledged by bus"),
        Err(e) => warn!(error = %e, "startup probe failed; relay will retry real records"),
    }
}

/// Wire everything and run the relay until ctrl-c.
pub async fn run(config: RelayConfig) -> anyhow::Result<()> {
    let store = build_store(&config).await?;
    let publisher = build_publisher(&config)?;

    startup_smoke_test(&publisher).await;

    let handle = RelayScheduler::spawn(
        store,
        publisher,
        config.retry_policy(),
        config.dispatcher_config(),
        config.scheduler_config(),
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    handle.shutdown().await;
    Ok(())
}
