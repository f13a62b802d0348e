//! Infrastructure layer: outbox storage, bus publishers, and the relay loop.

pub mod outbox_store;
pub mod publisher;
pub mod relay;
