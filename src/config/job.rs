//! Job definitions and their on-disk YAML form.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CronbatError, Result};

/// Definition of a single cron job, parsed from a YAML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub schedule: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub executor: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timeout: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Tri-state: unset means enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_success: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_failure: Vec<String>,
    /// Free-form, opaque to the daemon.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_yaml::Value>,
    /// Where the durable form lives on disk; never serialized.
    #[serde(skip)]
    pub file_path: Option<PathBuf>,
}

impl Job {
    /// Whether the job is enabled. Defaults to true when unset.
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Parse the timeout string. Empty means no timeout.
    pub fn parse_timeout(&self) -> Result<Option<Duration>> {
        if self.timeout.is_empty() {
            return Ok(None);
        }
        let parsed = humantime::parse_duration(&self.timeout)
            .map_err(|err| CronbatError::Validation(format!("invalid timeout: {err}")))?;
        Ok(if parsed.is_zero() { None } else { Some(parsed) })
    }
}

fn apply_job_defaults(job: &mut Job) {
    if job.executor.is_empty() {
        job.executor = "shell".to_string();
    }
}

/// Parse a single job YAML payload and apply defaults.
pub fn parse_job_yaml(data: &str) -> Result<Job> {
    let mut job: Job = serde_yaml::from_str(data)?;
    apply_job_defaults(&mut job);
    Ok(job)
}

/// Serialize a job to YAML.
pub fn marshal_job_yaml(job: &Job) -> Result<String> {
    Ok(serde_yaml::to_string(job)?)
}

/// Write a job definition file, recording its path on the job.
pub fn save_job(path: &Path, job: &mut Job) -> Result<()> {
    let data = marshal_job_yaml(job)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, data)?;
    job.file_path = Some(path.to_path_buf());
    Ok(())
}

/// Read every `*.yaml` file in `dir` into a job definition.
pub fn load_jobs(dir: &Path) -> Result<Vec<Job>> {
    let mut jobs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() || path.extension().map_or(true, |ext| ext != "yaml") {
            continue;
        }

        let data = fs::read_to_string(&path)?;
        let mut job = parse_job_yaml(&data)
            .map_err(|err| CronbatError::Parse(format!("{}: {err}", path.display())))?;
        job.file_path = Some(path);
        jobs.push(job);
    }
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Job {
        Job {
            name: "backup".into(),
            schedule: "0 3 * * *".into(),
            command: "tar czf /tmp/backup.tgz /data".into(),
            working_dir: "/data".into(),
            timeout: "30m".into(),
            env: HashMap::from([("RETENTION".into(), "5".into())]),
            on_success: vec!["slack".into()],
            on_failure: vec!["slack".into(), "email".into()],
            ..Job::default()
        }
    }

    #[test]
    fn yaml_roundtrip_modulo_defaults() {
        let mut original = sample();
        let yaml = marshal_job_yaml(&original).unwrap();
        let parsed = parse_job_yaml(&yaml).unwrap();

        // Parsing applies the executor default; everything else survives.
        original.executor = "shell".into();
        assert_eq!(parsed, original);
    }

    #[test]
    fn enabled_defaults_to_true() {
        let job = parse_job_yaml("name: a\nschedule: '@daily'\ncommand: true\n").unwrap();
        assert_eq!(job.enabled, None);
        assert!(job.is_enabled());

        let job = parse_job_yaml(
            "name: a\nschedule: '@daily'\ncommand: true\nenabled: false\n",
        )
        .unwrap();
        assert_eq!(job.enabled, Some(false));
        assert!(!job.is_enabled());
    }

    #[test]
    fn timeout_parsing() {
        let mut job = sample();
        assert_eq!(job.parse_timeout().unwrap(), Some(Duration::from_secs(1800)));

        job.timeout = String::new();
        assert_eq!(job.parse_timeout().unwrap(), None);

        job.timeout = "100ms".into();
        assert_eq!(job.parse_timeout().unwrap(), Some(Duration::from_millis(100)));

        job.timeout = "0s".into();
        assert_eq!(job.parse_timeout().unwrap(), None);

        job.timeout = "soon".into();
        assert!(job.parse_timeout().is_err());
    }

    #[test]
    fn file_path_is_never_serialized() {
        let mut job = sample();
        job.file_path = Some(PathBuf::from("/etc/cronbat/jobs/backup.yaml"));
        let yaml = marshal_job_yaml(&job).unwrap();
        assert!(!yaml.contains("file_path"));
    }

    #[test]
    fn save_and_load_jobs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup.yaml");
        let mut job = sample();
        save_job(&path, &mut job).unwrap();
        assert_eq!(job.file_path.as_deref(), Some(path.as_path()));

        // Non-YAML files are skipped.
        fs::write(dir.path().join("README.md"), "notes").unwrap();

        let jobs = load_jobs(dir.path()).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "backup");
        assert_eq!(jobs[0].file_path.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn malformed_yaml_reports_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("bad.yaml"), "name: [unclosed").unwrap();
        let err = load_jobs(dir.path()).unwrap_err();
        assert!(err.to_string().contains("bad.yaml"));
    }
}
