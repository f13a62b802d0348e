//! The scheduler: a single background task that drives dispatch cycles on a
//! fixed tick, with a command channel for early wakeups and clean shutdown.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use relaykit_outbox::{OutboxStore, Publisher, RetryPolicy};

use super::dispatcher::{Dispatcher, DispatcherConfig};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between dispatch cycles.
    pub tick_interval: Duration,
    /// Name used in log lines, to tell relays apart when several run.
    pub name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            name: "outbox-relay".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Cumulative counters across the relay's lifetime.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RelayStats {
    pub cycles: u64,
    pub cycles_failed: u64,
    pub published: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

enum Command {
    Trigger,
    Shutdown,
}

/// Handle to a running relay task.
pub struct RelayHandle {
    commands: mpsc::UnboundedSender<Command>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<RelayStats>>,
}

impl RelayHandle {
    /// Wake the relay for an immediate cycle instead of waiting for the tick.
    pub fn trigger(&self) {
        // A closed channel means the task already stopped; nothing to wake.
        let _ = self.commands.send(Command::Trigger);
    }

    /// Snapshot of cumulative relay statistics.
    pub fn stats(&self) -> RelayStats {
        self.stats.lock().expect("relay stats poisoned").clone()
    }

    /// Stop the relay and wait for its task to finish. The in-flight cycle,
    /// if any, runs to completion first.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!(error = %e, "relay task did not shut down cleanly");
            }
        }
    }
}

/// Spawns the relay loop.
pub struct RelayScheduler;

impl RelayScheduler {
    /// Spawn a relay task polling `store` and publishing through `publisher`.
    ///
    /// The task runs one cycle immediately, then one per tick until shutdown.
    /// Cycle failures are logged and counted; the loop itself never exits on
    /// error.
    pub fn spawn<S, P>(
        store: S,
        publisher: P,
        policy: RetryPolicy,
        dispatcher_config: DispatcherConfig,
        config: SchedulerConfig,
    ) -> RelayHandle
    where
        S: OutboxStore + Clone + Send + Sync + 'static,
        P: Publisher + Clone + Send + Sync + 'static,
    {
        let (commands, receiver) = mpsc::unbounded_channel();
        let stats = Arc::new(Mutex::new(RelayStats::default()));

        let dispatcher = Dispatcher::new(store, publisher, policy, dispatcher_config);
        let join = tokio::spawn(relay_loop(
            dispatcher,
            config,
            receiver,
            Arc::clone(&stats),
        ));

        RelayHandle {
            commands,
            join: Some(join),
            stats,
        }
    }
}

async fn relay_loop<S, P>(
    dispatcher: Dispatcher<S, P>,
    config: SchedulerConfig,
    mut commands: mpsc::UnboundedReceiver<Command>,
    stats: Arc<Mutex<RelayStats>>,
) where
    S: OutboxStore + Clone + Send + Sync + 'static,
    P: Publisher + Clone + Send + Sync + 'static,
{
    info!(
        relay = %config.name,
        tick_interval_ms = config.tick_interval.as_millis() as u64,
        "relay started"
    );

    loop {
        run_one_cycle(&dispatcher, &config, &stats).await;

        // Sleep until the next tick, but wake early on a command.
        match tokio::time::timeout(config.tick_interval, commands.recv()).await {
            Ok(Some(Command::Trigger)) | Err(_) => continue,
            Ok(Some(Command::Shutdown)) | Ok(None) => break,
        }
    }

    info!(relay = %config.name, "relay stopped");
}

async fn run_one_cycle<S, P>(
    dispatcher: &Dispatcher<S, P>,
    config: &SchedulerConfig,
    stats: &Arc<Mutex<RelayStats>>,
) where
    S: OutboxStore + Clone + Send + Sync + 'static,
    P: Publisher + Clone + Send + Sync + 'static,
{
    match dispatcher.run_cycle().await {
        Ok(report) => {
            // Guard must close before the stats().await below; the spawned
            // loop has to stay Send.
            {
                let mut stats = stats.lock().expect("relay stats poisoned");
                stats.cycles += 1;
                stats.published += report.published as u64;
                stats.retried += report.retried as u64;
                stats.dead_lettered += report.dead_lettered as u64;
                stats.last_cycle_at = Some(Utc::now());
            }

            if report.fetched > 0 {
                info!(
                    relay = %config.name,
                    fetched = report.fetched,
                    published = report.published,
                    retried = report.retried,
                    dead_lettered = report.dead_lettered,
                    deferred = report.deferred,
                    "dispatch cycle complete"
                );
            }

            // Oldest-pending age is the relay's primary health signal: it
            // growing without bound means delivery has stalled.
            if let Ok(outbox) = dispatcher.stats().await {
                if let Some(age) = outbox.oldest_pending_age(Utc::now()) {
                    if age > chrono::Duration::seconds(60) {
                        warn!(
                            relay = %config.name,
                            pending = outbox.pending,
                            oldest_pending_age_secs = age.num_seconds(),
                            "pending backlog is aging"
                        );
                    }
                }
            }
        }
        Err(e) => {
            {
                let mut stats = stats.lock().expect("relay stats poisoned");
                stats.cycles += 1;
                stats.cycles_failed += 1;
            }

            error!(relay = %config.name, error = %e, "dispatch cycle failed");
        }
    }
}
