//! Execution glue: turns scheduler ticks and manual triggers into recorded,
//! observable runs.
//!
//! Every fire reads a fresh snapshot from the registry, inserts a `running`
//! row, streams output through the runner into the run-log files, then
//! finalises the same row and publishes lifecycle events. The run always
//! reaches a terminal status; store and log-storage failures are logged or
//! downgraded, never fatal to the run.

use std::sync::{Arc, OnceLock};

use chrono::Utc;

use crate::config::Job;
use crate::events::{Event, EventBroker};
use crate::registry::JobRegistry;
use crate::runlog;
use crate::runner::{JobContext, RunOptions, Runner};
use crate::scheduler::FireFn;
use crate::store::{Run, RunStatus, RunStore};

/// Trigger tag for scheduler-initiated runs.
pub const TRIGGER_SCHEDULE: &str = "schedule";
/// Trigger tag for manually requested runs.
pub const TRIGGER_MANUAL: &str = "manual";

/// Drives job executions end to end.
pub struct Orchestrator {
    store: Arc<dyn RunStore>,
    broker: Arc<EventBroker>,
    runner: Runner,
    /// `None` when persistent run logs are disabled.
    run_logs: Option<Arc<runlog::Manager>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn RunStore>,
        broker: Arc<EventBroker>,
        run_logs: Option<Arc<runlog::Manager>>,
    ) -> Self {
        Self {
            store,
            broker,
            runner: Runner::new(),
            run_logs,
        }
    }

    /// Build the callback handed to the scheduler. It must not block the
    /// timing task, so each fire is dispatched to its own worker;
    /// overlapping runs of the same job are allowed.
    ///
    /// The registry arrives through a cell because it owns the scheduler
    /// handle while the scheduler needs this callback at construction; the
    /// caller fills the cell before anything is scheduled. Fires that race
    /// an unfilled cell are dropped.
    pub fn fire_callback(self: &Arc<Self>, registry: Arc<OnceLock<Arc<JobRegistry>>>) -> FireFn {
        let orchestrator = Arc::clone(self);
        Arc::new(move |job_name: String| {
            let Some(registry) = registry.get() else {
                return;
            };
            let orchestrator = Arc::clone(&orchestrator);
            let registry = Arc::clone(registry);
            tokio::spawn(async move {
                orchestrator
                    .on_fire(&registry, &job_name, TRIGGER_SCHEDULE)
                    .await;
            });
        })
    }

    /// Fire-and-forget manual trigger; callable from any task.
    pub fn trigger_run(self: &Arc<Self>, registry: &Arc<JobRegistry>, job_name: &str) {
        let orchestrator = Arc::clone(self);
        let registry = Arc::clone(registry);
        let job_name = job_name.to_string();
        self.broker.publish({
            let mut event = Event::job_changed(&job_name, "run");
            event.trigger = Some(TRIGGER_MANUAL.to_string());
            event
        });
        tokio::spawn(async move {
            orchestrator
                .on_fire(&registry, &job_name, TRIGGER_MANUAL)
                .await;
        });
    }

    /// Resolve a fire against the current registry snapshot and execute.
    /// Missing or disabled jobs are skipped.
    pub async fn on_fire(&self, registry: &JobRegistry, job_name: &str, trigger: &str) {
        let Some(job) = registry.get(job_name) else {
            tracing::warn!(job = %job_name, "job not found for execution");
            return;
        };
        if !job.is_enabled() {
            tracing::debug!(job = %job_name, "skipping disabled job");
            return;
        }
        self.execute_job(&job, trigger).await;
    }

    /// Execute one run of `job` and commit the outcome.
    pub async fn execute_job(&self, job: &Job, trigger: &str) {
        let timeout = match job.parse_timeout() {
            Ok(timeout) => timeout,
            Err(err) => {
                tracing::error!(job = %job.name, error = %err, "invalid timeout");
                return;
            }
        };

        tracing::info!(job = %job.name, trigger, "executing job");
        let mut run = Run::started(&job.name, trigger, Utc::now());

        // Best effort: execution proceeds even if the running row fails.
        if let Err(err) = self.store.record_run(&run).await {
            tracing::error!(job = %job.name, run = %run.id, error = %err,
                "failed to record run start");
        }
        self.broker
            .publish(Event::run_started(&job.name, &run.id, trigger));

        let mut opts = RunOptions::default();
        if !job.working_dir.is_empty() {
            opts.work_dir = Some(job.working_dir.clone().into());
        }
        let mut writers = None;
        if let Some(manager) = &self.run_logs {
            match manager.open_run_writers(&job.name, &run.id) {
                Ok(run_writers) => {
                    opts.extra_stdout = Some(run_writers.stdout_writer());
                    opts.extra_stderr = Some(run_writers.stderr_writer());
                    writers = Some(run_writers);
                }
                Err(err) => {
                    tracing::warn!(job = %job.name, run = %run.id, error = %err,
                        "failed to open run log files, continuing without");
                }
            }
        }

        let ctx = JobContext {
            job_name: job.name.clone(),
            trigger: trigger.to_string(),
            env: job.env.clone(),
        };
        let result = self.runner.run(&job.command, &ctx, timeout, &opts).await;

        if let Some(writers) = writers {
            let summary = writers.close();
            if let Some(warning) = summary.warning {
                tracing::warn!(job = %job.name, run = %run.id, warning,
                    "run log storage warning");
            }
            if summary.stdout.truncated || summary.stderr.truncated {
                tracing::debug!(job = %job.name, run = %run.id,
                    stdout_bytes = summary.stdout.bytes_written,
                    stderr_bytes = summary.stderr.bytes_written,
                    "run log output truncated at cap");
            }
        }

        let status = if result.exit_code == 0 && result.error.is_empty() {
            RunStatus::Success
        } else {
            RunStatus::Failure
        };

        run.status = status;
        run.exit_code = result.exit_code;
        run.finished_at = Some(Utc::now());
        run.duration_ms = result.duration_ms;
        run.stdout_tail = result.stdout;
        run.stderr_tail = result.stderr;
        run.error_msg = result.error;

        if let Err(err) = self.store.record_run(&run).await {
            tracing::error!(job = %job.name, run = %run.id, error = %err,
                "failed to record run result");
        }
        self.broker.publish(Event::run_completed(
            &job.name,
            &run.id,
            status.as_str(),
            trigger,
        ));

        tracing::info!(job = %job.name, run = %run.id, status = %status,
            duration_ms = run.duration_ms, "job completed");
    }
}
