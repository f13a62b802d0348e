//! The relay loop: Dispatcher (one bounded cycle) and Scheduler (the
//! periodic driver that guarantees at most one cycle in flight).

pub mod dispatcher;
pub mod scheduler;

pub use dispatcher::{CycleReport, Dispatcher, DispatcherConfig};
pub use scheduler::{RelayHandle, RelayScheduler, RelayStats, SchedulerConfig};
