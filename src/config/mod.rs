//! Daemon configuration.
//!
//! Loaded from a YAML file (`cronbat.yaml` by default) with defaults applied
//! for anything unset. Paths support `~` and `$VAR` expansion.

pub mod job;

pub use job::{load_jobs, marshal_job_yaml, parse_job_yaml, save_job, Job};

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Controls persistent per-run stdout/stderr log files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunLogConfig {
    /// Tri-state so "unset" can default to enabled.
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub max_bytes_per_stream: u64,
    #[serde(default)]
    pub retention_days: u32,
    #[serde(default)]
    pub max_total_mb: u64,
    #[serde(default)]
    pub cleanup_interval: String,
}

impl RunLogConfig {
    /// Whether persistent run log files are enabled. Defaults to true.
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn max_total_bytes(&self) -> u64 {
        self.max_total_mb * 1024 * 1024
    }

    /// Cleanup ticker period, falling back to one hour on a bad value.
    pub fn cleanup_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.cleanup_interval)
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or(Duration::from_secs(3600))
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bind address for the HTTP observer surface.
    #[serde(default)]
    pub listen: String,
    #[serde(default)]
    pub data_dir: String,
    #[serde(default)]
    pub jobs_dir: String,
    #[serde(default)]
    pub log_level: String,
    #[serde(default)]
    pub run_logs: RunLogConfig,
}

impl Default for Config {
    fn default() -> Self {
        let mut cfg = Self {
            listen: String::new(),
            data_dir: String::new(),
            jobs_dir: String::new(),
            log_level: String::new(),
            run_logs: RunLogConfig::default(),
        };
        apply_defaults(&mut cfg);
        cfg
    }
}

impl Config {
    /// Read and parse a configuration file, applying defaults for any unset
    /// fields.
    pub fn load(path: &std::path::Path) -> Result<Config> {
        let data = std::fs::read_to_string(path)?;
        let mut cfg: Config = serde_yaml::from_str(&data)?;
        apply_defaults(&mut cfg);
        Ok(cfg)
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    pub fn jobs_dir(&self) -> PathBuf {
        PathBuf::from(&self.jobs_dir)
    }

    pub fn run_logs_dir(&self) -> PathBuf {
        PathBuf::from(&self.run_logs.dir)
    }
}

fn apply_defaults(cfg: &mut Config) {
    if cfg.listen.is_empty() {
        cfg.listen = ":8080".to_string();
    }
    if cfg.data_dir.is_empty() {
        cfg.data_dir = "./data".to_string();
    }
    cfg.data_dir = expand_path(&cfg.data_dir);
    if cfg.jobs_dir.is_empty() {
        cfg.jobs_dir = default_jobs_dir();
    }
    cfg.jobs_dir = expand_path(&cfg.jobs_dir);
    if cfg.log_level.is_empty() {
        cfg.log_level = "info".to_string();
    }

    if cfg.run_logs.dir.is_empty() {
        cfg.run_logs.dir = PathBuf::from(&cfg.data_dir)
            .join("logs")
            .to_string_lossy()
            .into_owned();
    } else {
        cfg.run_logs.dir = expand_path(&cfg.run_logs.dir);
    }
    if cfg.run_logs.max_bytes_per_stream == 0 {
        cfg.run_logs.max_bytes_per_stream = 256 * 1024;
    }
    if cfg.run_logs.retention_days == 0 {
        cfg.run_logs.retention_days = 7;
    }
    if cfg.run_logs.max_total_mb == 0 {
        cfg.run_logs.max_total_mb = 128;
    }
    if cfg.run_logs.cleanup_interval.is_empty() {
        cfg.run_logs.cleanup_interval = "1h".to_string();
    }
    if cfg.run_logs.enabled.is_none() {
        cfg.run_logs.enabled = Some(true);
    }
}

fn default_jobs_dir() -> String {
    match home_dir() {
        Some(home) => home
            .join(".config")
            .join("cronbat")
            .join("jobs")
            .to_string_lossy()
            .into_owned(),
        None => "./jobs".to_string(),
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
}

/// Expand `$VAR` references and a leading `~` in a path value.
fn expand_path(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        return String::new();
    }

    let expanded = expand_env(value);
    let Some(home) = home_dir() else {
        return expanded;
    };

    if expanded == "~" {
        return home.to_string_lossy().into_owned();
    }
    if let Some(rest) = expanded.strip_prefix("~/") {
        return home.join(rest).to_string_lossy().into_owned();
    }
    expanded
}

fn expand_env(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.char_indices().peekable();
    while let Some((i, ch)) = chars.next() {
        if ch != '$' {
            out.push(ch);
            continue;
        }
        let rest = &value[i + 1..];
        let name_len = rest
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .count();
        if name_len == 0 {
            out.push(ch);
            continue;
        }
        let name: String = rest.chars().take(name_len).collect();
        out.push_str(&std::env::var(&name).unwrap_or_default());
        for _ in 0..name_len {
            chars.next();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_fill_unset_fields() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "listen: ':9090'").unwrap();
        let cfg = Config::load(file.path()).unwrap();

        assert_eq!(cfg.listen, ":9090");
        assert_eq!(cfg.data_dir, "./data");
        assert_eq!(cfg.log_level, "info");
        assert!(cfg.run_logs.is_enabled());
        assert_eq!(cfg.run_logs.max_bytes_per_stream, 256 * 1024);
        assert_eq!(cfg.run_logs.retention_days, 7);
        assert_eq!(cfg.run_logs.max_total_mb, 128);
        assert_eq!(cfg.run_logs.max_total_bytes(), 128 * 1024 * 1024);
        assert_eq!(
            cfg.run_logs.cleanup_interval_duration(),
            Duration::from_secs(3600)
        );
        assert_eq!(cfg.run_logs_dir(), PathBuf::from("./data/logs"));
    }

    #[test]
    fn run_logs_can_be_disabled() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "run_logs:\n  enabled: false\n  retention_days: 30").unwrap();
        let cfg = Config::load(file.path()).unwrap();
        assert!(!cfg.run_logs.is_enabled());
        assert_eq!(cfg.run_logs.retention_days, 30);
    }

    #[test]
    fn bad_cleanup_interval_falls_back_to_hourly() {
        let cfg = RunLogConfig {
            cleanup_interval: "whenever".into(),
            ..RunLogConfig::default()
        };
        assert_eq!(cfg.cleanup_interval_duration(), Duration::from_secs(3600));

        let cfg = RunLogConfig {
            cleanup_interval: "15m".into(),
            ..RunLogConfig::default()
        };
        assert_eq!(cfg.cleanup_interval_duration(), Duration::from_secs(900));
    }

    #[test]
    fn tilde_and_env_expansion() {
        std::env::set_var("CRONBAT_TEST_SUBDIR", "nested");
        let expanded = expand_path("/srv/$CRONBAT_TEST_SUBDIR/logs");
        assert_eq!(expanded, "/srv/nested/logs");

        if let Some(home) = home_dir() {
            let expanded = expand_path("~/jobs");
            assert_eq!(PathBuf::from(expanded), home.join("jobs"));
        }
    }

    #[test]
    fn default_config_is_complete() {
        let cfg = Config::default();
        assert_eq!(cfg.listen, ":8080");
        assert!(!cfg.jobs_dir.is_empty());
        assert!(cfg.run_logs.is_enabled());
    }
}
