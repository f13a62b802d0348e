//! Redis Streams-backed publisher (durable, broker-acknowledged).
//!
//! Each event record becomes one XADD to a configured stream, with the
//! record's `aggregate_id` as the ordering key field and `event_id` /
//! `event_type` as metadata fields for downstream deduplication. XADD only
//! returns after Redis has accepted the entry, which gives the relay the
//! synchronous acknowledgment it needs to mark records `SENT` - there is no
//! fire-and-forget path here.
//!
//! ## Failure classification
//!
//! - Connection, I/O and timeout errors are `Transient` (the broker may come
//!   back; the record stays retryable)
//! - Response errors such as a key of the wrong type are `Permanent` (the
//!   stream is misconfigured; retrying the same entry cannot help)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use relaykit_outbox::{BusMessage, PublishError, Publisher};

/// Default stream key for relayed events
const DEFAULT_STREAM_KEY: &str = "relaykit:events";

/// Default connection timeout per publish attempt
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RedisStreamsPublisher {
    client: Arc<redis::Client>,
    stream_key: String,
    connect_timeout: Duration,
}

impl RedisStreamsPublisher {
    /// Create a new Redis Streams publisher.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `stream_key` - Redis stream key (default: "relaykit:events")
    pub fn new(
        redis_url: impl AsRef<str>,
        stream_key: Option<String>,
    ) -> Result<Self, PublishError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| PublishError::Permanent(format!("invalid Redis URL: {e}")))?;

        Ok(Self {
            client: Arc::new(client),
            stream_key: stream_key.unwrap_or_else(|| DEFAULT_STREAM_KEY.to_string()),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

fn publish_blocking(
    client: &redis::Client,
    connect_timeout: Duration,
    stream_key: &str,
    message: &BusMessage,
) -> Result<(), PublishError> {
    let mut conn = client
        .get_connection_with_timeout(connect_timeout)
        .map_err(|e| PublishError::Transient(format!("Redis connection failed: {e}")))?;

    // XADD with an auto-generated entry id; the aggregate key travels as a
    // field so consumers can re-partition while the stream preserves order.
    let entry_id: String = redis::cmd("XADD")
        .arg(stream_key)
        .arg("*")
        .arg("key")
        .arg(&message.key)
        .arg("event_id")
        .arg(message.event_id.to_string())
        .arg("event_type")
        .arg(&message.event_type)
        .arg("payload")
        .arg(&message.body)
        .query(&mut conn)
        .map_err(classify_redis_error)?;

    debug!(
        stream_key = %stream_key,
        entry_id = %entry_id,
        event_id = %message.event_id,
        "event published to Redis stream"
    );

    Ok(())
}

fn classify_redis_error(e: redis::RedisError) -> PublishError {
    use redis::ErrorKind;

    match e.kind() {
        // The stream key exists with a non-stream type, or the command was
        // rejected outright; retrying the same entry cannot succeed.
        ErrorKind::TypeError | ErrorKind::ResponseError => {
            PublishError::Permanent(format!("XADD rejected: {e}"))
        }
        _ => PublishError::Transient(format!("XADD failed: {e}")),
    }
}

#[async_trait]
impl Publisher for RedisStreamsPublisher {
    async fn publish(&self, message: &BusMessage) -> Result<(), PublishError> {
        let client = Arc::clone(&self.client);
        let stream_key = self.stream_key.clone();
        let connect_timeout = self.connect_timeout;
        let message = message.clone();

        // The redis client is blocking; keep it off the relay's async workers.
        tokio::task::spawn_blocking(move || {
            publish_blocking(&client, connect_timeout, &stream_key, &message)
        })
        .await
        .map_err(|e| PublishError::Transient(format!("publish task failed: {e}")))?
    }
}
