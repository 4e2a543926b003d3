//! Authoritative in-memory job set with validation, runtime states, and
//! durable YAML persistence.
//!
//! Every mutation runs under one exclusive lock and is all-or-nothing: the
//! job map, the runtime-state map, the scheduler queue, and the on-disk file
//! are snapshotted first and all restored if any step fails. Reads take a
//! shared lock and return defensive copies.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::config::{self, Job};
use crate::error::{CronbatError, Result};
use crate::events::{Event, EventBroker};
use crate::scheduler::{CronSchedule, Scheduler};

/// Observer-visible job lifecycle state. `Started` implies enabled and
/// scheduled; `Stopped` and `Paused` both persist as `enabled: false` and
/// are distinguished only for the observer API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    Started,
    Stopped,
    Paused,
}

impl RuntimeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Paused => "paused",
        }
    }
}

#[derive(Default)]
struct RegistryState {
    jobs: HashMap<String, Job>,
    states: HashMap<String, RuntimeState>,
}

/// Concurrent registry of job definitions.
pub struct JobRegistry {
    jobs_dir: PathBuf,
    scheduler: Arc<Scheduler>,
    broker: Arc<EventBroker>,
    inner: RwLock<RegistryState>,
}

impl JobRegistry {
    /// Install the initial job set without scheduling anything yet.
    pub fn new(
        jobs_dir: impl Into<PathBuf>,
        scheduler: Arc<Scheduler>,
        broker: Arc<EventBroker>,
        initial_jobs: Vec<Job>,
    ) -> Self {
        let mut state = RegistryState::default();
        for job in initial_jobs {
            let runtime = if job.is_enabled() {
                RuntimeState::Started
            } else {
                RuntimeState::Stopped
            };
            state.states.insert(job.name.clone(), runtime);
            state.jobs.insert(job.name.clone(), job);
        }

        Self {
            jobs_dir: jobs_dir.into(),
            scheduler,
            broker,
            inner: RwLock::new(state),
        }
    }

    /// Schedule every enabled job, skipping (and logging) invalid schedules.
    pub fn schedule_all(&self) {
        let state = self.inner.read();
        for job in state.jobs.values() {
            if let Err(err) = self.apply_schedule(job) {
                tracing::error!(job = %job.name, schedule = %job.schedule, error = %err,
                    "invalid schedule, job not scheduled");
                continue;
            }
            if let Some(next) = self.scheduler.next_run_time(&job.name) {
                tracing::info!(job = %job.name, next_run = %next.to_rfc3339(), "job scheduled");
            }
        }
    }

    /// Snapshot of all jobs, ordered by name.
    pub fn jobs(&self) -> Vec<Job> {
        let state = self.inner.read();
        let mut jobs: Vec<Job> = state.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs
    }

    /// Cloned snapshot of one job.
    pub fn get(&self, name: &str) -> Option<Job> {
        self.inner.read().jobs.get(name).cloned()
    }

    /// Runtime state for the observer API. Falls back to the enabled flag
    /// for jobs without an explicit state entry.
    pub fn job_state(&self, name: &str) -> Option<RuntimeState> {
        let state = self.inner.read();
        if let Some(runtime) = state.states.get(name) {
            return Some(*runtime);
        }
        state.jobs.get(name).map(|job| {
            if job.is_enabled() {
                RuntimeState::Started
            } else {
                RuntimeState::Stopped
            }
        })
    }

    /// Next scheduled fire time for the named job.
    pub fn next_run_time(&self, name: &str) -> Option<chrono::DateTime<Utc>> {
        self.scheduler.next_run_time(name)
    }

    /// Create a new job: validate, schedule if enabled, persist.
    pub fn create(&self, mut job: Job) -> Result<()> {
        validate_job(&mut job)?;

        let mut state = self.inner.write();
        if state.jobs.contains_key(&job.name) {
            return Err(CronbatError::Conflict(format!(
                "job already exists: {}",
                job.name
            )));
        }

        let path = self.jobs_dir.join(format!("{}.yaml", job.name));
        job.file_path = Some(path.clone());

        if let Err(err) = self.apply_schedule(&job) {
            self.scheduler.remove(&job.name);
            return Err(err);
        }
        if let Err(err) = config::save_job(&path, &mut job) {
            self.scheduler.remove(&job.name);
            return Err(err);
        }

        let runtime = if job.is_enabled() {
            RuntimeState::Started
        } else {
            RuntimeState::Stopped
        };
        state.states.insert(job.name.clone(), runtime);
        let name = job.name.clone();
        state.jobs.insert(name.clone(), job);
        drop(state);

        self.broker.publish(Event::job_changed(&name, "create"));
        Ok(())
    }

    /// Replace the mutable fields of a job. Renames are not allowed here.
    pub fn update_settings(&self, name: &str, updated: Job) -> Result<()> {
        let mut guard = self.inner.write();
        let state = &mut *guard;
        let current = state
            .jobs
            .get_mut(name)
            .ok_or_else(|| CronbatError::job_not_found(name))?;

        let mut candidate = current.clone();
        candidate.name = name.to_string();
        candidate.schedule = updated.schedule.trim().to_string();
        candidate.command = updated.command.trim().to_string();
        candidate.working_dir = updated.working_dir.trim().to_string();
        candidate.executor = updated.executor.trim().to_string();
        candidate.timeout = updated.timeout.trim().to_string();
        candidate.env = updated.env;
        candidate.on_success = updated.on_success;
        candidate.on_failure = updated.on_failure;
        candidate.metadata = updated.metadata;
        if updated.enabled.is_some() {
            candidate.enabled = updated.enabled;
        }
        validate_job(&mut candidate)?;

        let old_job = current.clone();
        let old_state = state.states.get(name).copied();
        candidate.file_path = old_job
            .file_path
            .clone()
            .or_else(|| Some(self.jobs_dir.join(format!("{name}.yaml"))));
        *current = candidate;

        let restore = |state: &mut RegistryState, registry: &Self| {
            state.jobs.insert(name.to_string(), old_job.clone());
            match old_state {
                Some(runtime) => state.states.insert(name.to_string(), runtime),
                None => state.states.remove(name),
            };
            let _ = registry.apply_schedule(&old_job);
        };

        if let Err(err) = self.apply_schedule(state.jobs.get(name).expect("just updated")) {
            restore(state, self);
            return Err(err);
        }

        let path = state.jobs.get(name).and_then(|j| j.file_path.clone()).expect("set above");
        let mut to_save = state.jobs.get(name).expect("present").clone();
        if let Err(err) = config::save_job(&path, &mut to_save) {
            restore(state, self);
            return Err(err);
        }

        let runtime = if to_save.is_enabled() {
            RuntimeState::Started
        } else {
            match state.states.get(name) {
                None | Some(RuntimeState::Started) => RuntimeState::Stopped,
                Some(other) => *other,
            }
        };
        state.states.insert(name.to_string(), runtime);
        drop(guard);

        self.broker.publish(Event::job_changed(name, "update"));
        Ok(())
    }

    /// Replace a job from its raw YAML form. A rename is allowed when the
    /// target name is free; the runtime state carries over.
    pub fn update_yaml(&self, name: &str, raw: &str) -> Result<String> {
        let mut parsed = config::parse_job_yaml(raw)?;
        parsed.name = parsed.name.trim().to_string();
        if parsed.name.is_empty() {
            return Err(CronbatError::Validation(
                "job name is required in YAML".into(),
            ));
        }
        validate_job(&mut parsed)?;

        let mut guard = self.inner.write();
        let state = &mut *guard;
        let old_job = state
            .jobs
            .get(name)
            .ok_or_else(|| CronbatError::job_not_found(name))?
            .clone();

        let new_name = parsed.name.clone();
        if new_name != name && state.jobs.contains_key(&new_name) {
            return Err(CronbatError::Conflict(format!(
                "job already exists: {new_name}"
            )));
        }

        let old_state = state.states.get(name).copied();
        let old_path = self.file_path_for(&old_job);
        let new_path = self.jobs_dir.join(format!("{new_name}.yaml"));
        parsed.file_path = Some(new_path.clone());

        // A YAML update that enables starts the job; one that disables only
        // demotes a started job, preserving a paused label.
        let next_state = if parsed.is_enabled() {
            RuntimeState::Started
        } else {
            match old_state {
                None | Some(RuntimeState::Started) => RuntimeState::Stopped,
                Some(other) => other,
            }
        };

        state.jobs.remove(name);
        state.jobs.insert(new_name.clone(), parsed.clone());
        state.states.remove(name);
        state.states.insert(new_name.clone(), next_state);

        let restore = |state: &mut RegistryState, registry: &Self| {
            registry.scheduler.remove(name);
            registry.scheduler.remove(&new_name);
            state.jobs.remove(&new_name);
            state.jobs.insert(name.to_string(), old_job.clone());
            state.states.remove(&new_name);
            match old_state {
                Some(runtime) => state.states.insert(name.to_string(), runtime),
                None => state.states.remove(name),
            };
            let _ = registry.apply_schedule(&old_job);
        };

        self.scheduler.remove(name);
        if let Err(err) = self.apply_schedule(&parsed) {
            restore(state, self);
            return Err(err);
        }

        let mut to_save = parsed.clone();
        if let Err(err) = config::save_job(&new_path, &mut to_save) {
            restore(state, self);
            return Err(err);
        }

        if new_path != old_path {
            if let Err(err) = fs::remove_file(&old_path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    restore(state, self);
                    let _ = fs::remove_file(&new_path);
                    return Err(err.into());
                }
            }
        }
        drop(guard);

        self.broker.publish(Event::job_changed(&new_name, "update"));
        Ok(new_name)
    }

    pub fn enable(&self, name: &str) -> Result<()> {
        self.set_enabled(name, true, RuntimeState::Started, "enable")
    }

    pub fn disable(&self, name: &str) -> Result<()> {
        self.set_enabled(name, false, RuntimeState::Stopped, "disable")
    }

    pub fn start(&self, name: &str) -> Result<()> {
        self.set_enabled(name, true, RuntimeState::Started, "start")
    }

    pub fn stop(&self, name: &str) -> Result<()> {
        self.set_enabled(name, false, RuntimeState::Stopped, "stop")
    }

    /// Pause is stop with a distinct observer label.
    pub fn pause(&self, name: &str) -> Result<()> {
        self.set_enabled(name, false, RuntimeState::Paused, "pause")
    }

    fn set_enabled(
        &self,
        name: &str,
        enabled: bool,
        runtime: RuntimeState,
        action: &str,
    ) -> Result<()> {
        let mut guard = self.inner.write();
        let state = &mut *guard;
        let job = state
            .jobs
            .get_mut(name)
            .ok_or_else(|| CronbatError::job_not_found(name))?;

        let old_job = job.clone();
        let old_state = state.states.get(name).copied();
        job.enabled = Some(enabled);

        let restore = |state: &mut RegistryState, registry: &Self| {
            state.jobs.insert(name.to_string(), old_job.clone());
            match old_state {
                Some(runtime) => state.states.insert(name.to_string(), runtime),
                None => state.states.remove(name),
            };
            let _ = registry.apply_schedule(&old_job);
        };

        let updated = state.jobs.get(name).expect("present").clone();
        if let Err(err) = self.apply_schedule(&updated) {
            restore(state, self);
            return Err(err);
        }

        let path = self.file_path_for(&updated);
        let mut to_save = updated;
        if let Err(err) = config::save_job(&path, &mut to_save) {
            restore(state, self);
            return Err(err);
        }
        if let Some(job) = state.jobs.get_mut(name) {
            job.file_path = to_save.file_path;
        }

        state.states.insert(name.to_string(), runtime);
        drop(guard);

        self.broker.publish(Event::job_changed(name, action));
        Ok(())
    }

    /// Unschedule a job and move its durable form into the `archive/`
    /// sibling, timestamped.
    pub fn archive(&self, name: &str) -> Result<()> {
        let mut guard = self.inner.write();
        let state = &mut *guard;
        let job = state
            .jobs
            .get(name)
            .ok_or_else(|| CronbatError::job_not_found(name))?
            .clone();

        self.scheduler.remove(name);
        let restore = |registry: &Self| {
            let _ = registry.apply_schedule(&job);
        };

        let archive_dir = self.jobs_dir.join("archive");
        if let Err(err) = fs::create_dir_all(&archive_dir) {
            restore(self);
            return Err(err.into());
        }

        let src = self.file_path_for(&job);
        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let dst = archive_dir.join(format!("{name}-{stamp}.yaml"));

        if let Err(err) = fs::rename(&src, &dst) {
            if err.kind() != std::io::ErrorKind::NotFound {
                restore(self);
                return Err(err.into());
            }
            // No file on disk: persist the in-memory snapshot instead.
            let mut archived = job.clone();
            if let Err(err) = config::save_job(&dst, &mut archived) {
                restore(self);
                return Err(err);
            }
        }

        state.jobs.remove(name);
        state.states.remove(name);
        drop(guard);

        self.broker.publish(Event::job_changed(name, "archive"));
        Ok(())
    }

    /// Unschedule a job and remove both its durable form and registry entry.
    pub fn delete(&self, name: &str) -> Result<()> {
        let mut guard = self.inner.write();
        let state = &mut *guard;
        let job = state
            .jobs
            .get(name)
            .ok_or_else(|| CronbatError::job_not_found(name))?;

        let path = self.file_path_for(job);
        if let Err(err) = fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(err.into());
            }
        }

        state.jobs.remove(name);
        state.states.remove(name);
        self.scheduler.remove(name);
        drop(guard);

        self.broker.publish(Event::job_changed(name, "delete"));
        Ok(())
    }

    /// Persisted YAML for a job, marshalled from memory when the file is
    /// gone.
    pub fn read_yaml(&self, name: &str) -> Result<String> {
        let (snapshot, path) = {
            let state = self.inner.read();
            let job = state
                .jobs
                .get(name)
                .ok_or_else(|| CronbatError::job_not_found(name))?;
            (job.clone(), self.file_path_for(job))
        };

        match fs::read_to_string(&path) {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                config::marshal_job_yaml(&snapshot)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn file_path_for(&self, job: &Job) -> PathBuf {
        job.file_path
            .clone()
            .unwrap_or_else(|| self.jobs_dir.join(format!("{}.yaml", job.name)))
    }

    /// Reconcile the scheduler with a job definition: remove, then re-add
    /// when enabled.
    fn apply_schedule(&self, job: &Job) -> Result<()> {
        self.scheduler.remove(&job.name);
        if !job.is_enabled() {
            return Ok(());
        }
        let schedule = CronSchedule::parse(&job.schedule)
            .map_err(|err| CronbatError::Validation(err.to_string()))?;
        self.scheduler.add(job.name.clone(), schedule);
        Ok(())
    }
}

fn is_safe_job_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_'))
}

/// Normalise and validate a job definition in place.
fn validate_job(job: &mut Job) -> Result<()> {
    job.name = job.name.trim().to_string();
    job.schedule = job.schedule.trim().to_string();
    job.command = job.command.trim().to_string();
    job.working_dir = job.working_dir.trim().to_string();
    job.executor = job.executor.trim().to_string();
    job.timeout = job.timeout.trim().to_string();

    if job.name.is_empty() {
        return Err(CronbatError::Validation("job name is required".into()));
    }
    if !is_safe_job_name(&job.name) {
        return Err(CronbatError::Validation(
            "invalid job name: use only letters, numbers, '.', '-', '_'".into(),
        ));
    }
    if job.schedule.is_empty() {
        return Err(CronbatError::Validation("job schedule is required".into()));
    }
    CronSchedule::parse(&job.schedule)
        .map_err(|err| CronbatError::Validation(err.to_string()))?;
    if job.command.is_empty() {
        return Err(CronbatError::Validation("job command is required".into()));
    }
    if job.executor.is_empty() {
        job.executor = "shell".to_string();
    }
    job.parse_timeout()?;
    Ok(())
}
