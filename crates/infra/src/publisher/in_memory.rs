//! In-memory publisher for tests/dev.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use relaykit_outbox::{BusMessage, PublishError, Publisher};

/// In-memory publisher that acknowledges every message.
///
/// Acknowledged messages are appended to an ordered log, which doubles as the
/// "broker log" for ordering assertions in tests: for records sharing a key,
/// the log order is the delivery order a real bus partition would observe.
#[derive(Debug, Default)]
pub struct InMemoryPublisher {
    log: Mutex<Vec<BusMessage>>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot of all acknowledged messages in publish order.
    pub fn published(&self) -> Vec<BusMessage> {
        self.log.lock().expect("publisher log poisoned").clone()
    }

    /// Acknowledged messages for one ordering key, in publish order.
    pub fn published_for_key(&self, key: &str) -> Vec<BusMessage> {
        self.published()
            .into_iter()
            .filter(|m| m.key == key)
            .collect()
    }
}

#[async_trait]
impl Publisher for InMemoryPublisher {
    async fn publish(&self, message: &BusMessage) -> Result<(), PublishError> {
        self.log
            .lock()
            .map_err(|_| PublishError::Transient("publisher log poisoned".to_string()))?
            .push(message.clone());
        Ok(())
    }
}
