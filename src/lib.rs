//! cronbat - a single-process cron-style job daemon.
//!
//! Jobs are YAML definitions scheduled through a tick-accurate queue,
//! executed as `sh -c` subprocesses with bounded output capture, recorded in
//! a durable SQLite run history, and observable through a lossy realtime
//! event bus.

pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod registry;
pub mod runlog;
pub mod runner;
pub mod scheduler;
pub mod store;

pub use config::{Config, Job};
pub use error::{CronbatError, Result};
pub use events::{Event, EventBroker, Subscription};
pub use orchestrator::Orchestrator;
pub use registry::{JobRegistry, RuntimeState};
pub use runner::{RunResult, Runner};
pub use scheduler::{CronSchedule, Scheduler};
pub use store::{new_run_id, JobStats, ListOpts, Run, RunStatus, RunStore, SqliteRunStore};
