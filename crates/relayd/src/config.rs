//! Environment configuration for the relay daemon.
//!
//! Every knob has a sensible default; missing or malformed values warn and
//! fall back rather than abort, so a bare `relayd` always starts. The two
//! connection URLs are the exception in spirit: without `DATABASE_URL` and
//! `REDIS_URL` the daemon runs on in-memory components, which is only useful
//! for local smoke runs.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use relaykit_infra::relay::{DispatcherConfig, SchedulerConfig};
use relaykit_outbox::RetryPolicy;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Interval between dispatch cycles (`RELAY_DISPATCH_INTERVAL_MS`).
    pub dispatch_interval: Duration,
    /// Records fetched per cycle (`RELAY_BATCH_SIZE`).
    pub batch_size: usize,
    /// Attempt budget before dead-lettering (`RELAY_MAX_ATTEMPTS`).
    pub max_attempts: u32,
    /// Hard bound per publish attempt (`RELAY_PUBLISH_TIMEOUT_MS`).
    pub publish_timeout: Duration,
    /// Bus stream/topic for relayed events (`OUTBOX_STREAM`).
    pub stream_key: String,
    /// Postgres connection URL; in-memory store when unset (`DATABASE_URL`).
    pub database_url: Option<String>,
    /// Redis connection URL; in-memory publisher when unset (`REDIS_URL`).
    pub redis_url: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            dispatch_interval: Duration::from_millis(1000),
            batch_size: 200,
            max_attempts: 5,
            publish_timeout: Duration::from_millis(10_000),
            stream_key: "relaykit:events".to_string(),
            database_url: None,
            redis_url: None,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            dispatch_interval: Duration::from_millis(env_parse(
                "RELAY_DISPATCH_INTERVAL_MS",
                defaults.dispatch_interval.as_millis() as u64,
            )),
            batch_size: env_parse("RELAY_BATCH_SIZE", defaults.batch_size),
            max_attempts: env_parse("RELAY_MAX_ATTEMPTS", defaults.max_attempts),
            publish_timeout: Duration::from_millis(env_parse(
                "RELAY_PUBLISH_TIMEOUT_MS",
                defaults.publish_timeout.as_millis() as u64,
            )),
            stream_key: std::env::var("OUTBOX_STREAM").unwrap_or(defaults.stream_key),
            database_url: std::env::var("DATABASE_URL").ok(),
            redis_url: std::env::var("REDIS_URL").ok(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            ..RetryPolicy::default()
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::default()
            .with_batch_size(self.batch_size)
            .with_publish_timeout(self.publish_timeout)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::default().with_tick_interval(self.dispatch_interval)
    }
}

fn env_parse<T>(name: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display + Copy,
{
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(var = name, value = %raw, default = %default, "unparsable value; using default");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable_without_any_environment() {
        let config = RelayConfig::default();

        assert_eq!(config.dispatch_interval, Duration::from_secs(1));
        assert_eq!(config.batch_size, 200);
        assert_eq!(config.max_attempts, 5);
        assert!(config.database_url.is_none());
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn config_converts_into_relay_component_configs() {
        let config = RelayConfig {
            batch_size: 50,
            max_attempts: 3,
            publish_timeout: Duration::from_millis(250),
            dispatch_interval: Duration::from_millis(100),
            ..RelayConfig::default()
        };

        assert_eq!(config.retry_policy().max_attempts, 3);
        assert_eq!(config.dispatcher_config().batch_size, 50);
        assert_eq!(
            config.dispatcher_config().publish_timeout,
            Duration::from_millis(250)
        );
        assert_eq!(
            config.scheduler_config().tick_interval,
            Duration::from_millis(100)
        );
    }
}
