//! Tick-accurate schedule queue.
//!
//! A single tokio task owns the queue: it sleeps until the earliest
//! `next_fire`, pops the head when due, invokes the fire callback, and
//! reinserts the job at its next computed time. Mutations from other tasks
//! wake the loop so it re-reads the head. Jobs due at the same instant fire
//! in name-lexicographic order because the queue is ordered by
//! `(next_fire, name)`.

pub mod cron;

pub use cron::{CronSchedule, ScheduleError};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Callback invoked on the scheduler task when a job is due. Must not block;
/// the orchestrator dispatches the actual execution to a worker task.
pub type FireFn = Arc<dyn Fn(String) + Send + Sync>;

struct ScheduledJob {
    schedule: CronSchedule,
    next_fire: DateTime<Utc>,
}

#[derive(Default)]
struct QueueState {
    /// Fire order: earliest first, ties broken by name.
    order: BTreeSet<(DateTime<Utc>, String)>,
    jobs: HashMap<String, ScheduledJob>,
}

impl QueueState {
    fn remove(&mut self, name: &str) -> bool {
        if let Some(job) = self.jobs.remove(name) {
            self.order.remove(&(job.next_fire, name.to_string()));
            true
        } else {
            false
        }
    }

    fn insert(&mut self, name: String, schedule: CronSchedule, next_fire: DateTime<Utc>) {
        self.remove(&name);
        self.order.insert((next_fire, name.clone()));
        self.jobs.insert(name, ScheduledJob { schedule, next_fire });
    }

    fn head(&self) -> Option<(DateTime<Utc>, String)> {
        self.order.iter().next().cloned()
    }
}

/// Schedule queue driven by a single timing task.
pub struct Scheduler {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    fire: FireFn,
}

impl Scheduler {
    /// Create a scheduler that calls `fire` when a job is due.
    pub fn new(fire: FireFn) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
            shutdown,
            handle: Mutex::new(None),
            fire,
        }
    }

    /// Add a job, replacing any existing entry with the same name. The next
    /// fire time is computed from now; a schedule with no future fire time
    /// leaves the job unscheduled.
    pub fn add(&self, name: impl Into<String>, schedule: CronSchedule) {
        let name = name.into();
        let mut state = self.state.lock();
        match schedule.next_after(Utc::now()) {
            Some(next_fire) => {
                state.insert(name, schedule, next_fire);
            }
            None => {
                state.remove(&name);
                tracing::warn!(job = %name, "schedule has no future fire time, leaving unscheduled");
            }
        }
        drop(state);
        self.notify.notify_one();
    }

    /// Remove a job. Removing an unknown name is a no-op.
    pub fn remove(&self, name: &str) {
        let changed = self.state.lock().remove(name);
        if changed {
            self.notify.notify_one();
        }
    }

    /// Snapshot of the next fire time for the named job.
    pub fn next_run_time(&self, name: &str) -> Option<DateTime<Utc>> {
        self.state.lock().jobs.get(name).map(|job| job.next_fire)
    }

    /// Launch the timing task. Calling `start` on a running scheduler is a
    /// no-op.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        let state = Arc::clone(&self.state);
        let notify = Arc::clone(&self.notify);
        let mut shutdown = self.shutdown.subscribe();
        let fire = Arc::clone(&self.fire);

        *handle = Some(tokio::spawn(async move {
            loop {
                let head = state.lock().head();
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                    _ = notify.notified() => {}
                    _ = sleep_until(head.as_ref().map(|(at, _)| *at)) => {
                        if let Some(name) = pop_due(&state) {
                            fire(name);
                        }
                    }
                }
            }
        }));
    }

    /// Signal the timing task to exit and wait for it. Idempotent.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Sleep until `deadline`, or forever when the queue is empty.
async fn sleep_until(deadline: Option<DateTime<Utc>>) {
    match deadline {
        None => std::future::pending::<()>().await,
        Some(at) => {
            let wait = (at - Utc::now())
                .to_std()
                .unwrap_or(StdDuration::ZERO);
            tokio::time::sleep(wait).await;
        }
    }
}

/// Pop the head if it is due, reinsert it at its next fire time, and return
/// its name. A head that moved into the future (stale wake) fires nothing.
fn pop_due(state: &Mutex<QueueState>) -> Option<String> {
    let mut guard = state.lock();
    let state = &mut *guard;
    let now = Utc::now();
    let (at, name) = state.head()?;
    if at > now {
        return None;
    }

    state.order.remove(&(at, name.clone()));
    if let Some(job) = state.jobs.get_mut(&name) {
        match job.schedule.next_after(now) {
            Some(next) => {
                job.next_fire = next;
                state.order.insert((next, name.clone()));
            }
            None => {
                state.jobs.remove(&name);
                tracing::warn!(job = %name, "schedule exhausted, removing from queue");
            }
        }
    }
    Some(name)
}
