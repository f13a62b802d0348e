//! Infrastructure publisher implementations.
//!
//! The publisher abstraction lives in `relaykit-outbox` as pure mechanics.
//! This module provides an in-memory implementation (tests/dev) and a Redis
//! Streams-backed implementation behind the `redis` feature.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

pub use in_memory::InMemoryPublisher;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsPublisher;
