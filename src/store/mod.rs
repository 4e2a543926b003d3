//! Durable run history backed by SQLite.
//!
//! Each operation opens its own connection on a WAL-mode database file and
//! runs on the blocking thread pool, so readers never block run recording.
//! Timestamps are persisted as UTC RFC3339 with fixed-width fractional
//! seconds, which keeps lexicographic and chronological order aligned.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::task;
use ulid::Ulid;

use crate::error::{CronbatError, Result};

/// Generate a new lexicographically sortable run identifier.
pub fn new_run_id() -> String {
    Ulid::new().to_string()
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = CronbatError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            other => Err(CronbatError::Storage(format!("unknown run status: {other}"))),
        }
    }
}

/// A single execution of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub job_name: String,
    pub status: RunStatus,
    pub exit_code: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub error_msg: String,
    /// `schedule`, `manual`, or `trigger:<name>`.
    pub trigger: String,
    /// Reserved for LLM post-processing; opaque to the core.
    pub llm_analysis: String,
    pub llm_tokens_used: i64,
    pub created_at: DateTime<Utc>,
}

impl Run {
    /// Build the initial `running` row for a fresh execution.
    pub fn started(job_name: &str, trigger: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            id: new_run_id(),
            job_name: job_name.to_string(),
            status: RunStatus::Running,
            exit_code: 0,
            started_at,
            finished_at: None,
            duration_ms: 0,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            error_msg: String::new(),
            trigger: trigger.to_string(),
            llm_analysis: String::new(),
            llm_tokens_used: 0,
            created_at: Utc::now(),
        }
    }
}

/// Filtering and pagination for run queries.
#[derive(Debug, Clone, Default)]
pub struct ListOpts {
    pub job_name: Option<String>,
    /// `0` returns all runs; negative values are rejected.
    pub limit: i64,
    pub offset: i64,
}

/// Aggregate statistics for one job.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStats {
    pub total_runs: i64,
    pub successes: i64,
    pub failures: i64,
    pub last_run: Option<DateTime<Utc>>,
    pub avg_duration_ms: f64,
}

/// Interface for persisting and querying runs.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert or finalise a run. On id conflict only the mutable
    /// finalisation fields are updated; `id`, `job_name`, `started_at`,
    /// `trigger` and `created_at` are write-once.
    async fn record_run(&self, run: &Run) -> Result<()>;

    async fn get_run(&self, id: &str) -> Result<Option<Run>>;

    /// Runs ordered by `started_at` descending.
    async fn list_runs(&self, opts: ListOpts) -> Result<Vec<Run>>;

    async fn get_job_stats(&self, job_name: &str) -> Result<JobStats>;
}

const MIGRATION_SQL: &str = r"
CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    job_name TEXT NOT NULL,
    status TEXT NOT NULL,
    exit_code INTEGER,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    duration_ms INTEGER,
    stdout_tail TEXT,
    stderr_tail TEXT,
    error_msg TEXT,
    trigger_type TEXT NOT NULL DEFAULT 'schedule',
    llm_analysis TEXT,
    llm_tokens_used INTEGER,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_runs_job_name ON runs(job_name);
CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at);
";

const SELECT_RUN_COLS: &str = "id, job_name, status, exit_code, started_at, finished_at, \
     duration_ms, stdout_tail, stderr_tail, error_msg, trigger_type, \
     llm_analysis, llm_tokens_used, created_at";

/// SQLite-backed [`RunStore`].
#[derive(Debug, Clone)]
pub struct SqliteRunStore {
    db_path: PathBuf,
}

impl SqliteRunStore {
    /// Open the database at `path`, enabling WAL mode and applying the
    /// schema migration.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = path.into();
        let migrate_path = db_path.clone();
        run_blocking(move || {
            let conn = open_connection(&migrate_path)?;
            conn.execute_batch(MIGRATION_SQL)?;
            Ok(())
        })
        .await?;
        Ok(Self { db_path })
    }
}

fn open_connection(path: &PathBuf) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    Ok(conn)
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    task::spawn_blocking(f)
        .await
        .map_err(|err| CronbatError::Storage(format!("store task failed: {err}")))?
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|err| CronbatError::Storage(format!("bad timestamp {s:?}: {err}")))
}

/// Empty strings are stored as NULL, mirroring how absent values read back
/// as empty.
fn null_text(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn scan_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRun> {
    Ok(RawRun {
        id: row.get(0)?,
        job_name: row.get(1)?,
        status: row.get(2)?,
        exit_code: row.get::<_, Option<i32>>(3)?,
        started_at: row.get(4)?,
        finished_at: row.get::<_, Option<String>>(5)?,
        duration_ms: row.get::<_, Option<i64>>(6)?,
        stdout_tail: row.get::<_, Option<String>>(7)?,
        stderr_tail: row.get::<_, Option<String>>(8)?,
        error_msg: row.get::<_, Option<String>>(9)?,
        trigger: row.get(10)?,
        llm_analysis: row.get::<_, Option<String>>(11)?,
        llm_tokens_used: row.get::<_, Option<i64>>(12)?,
        created_at: row.get(13)?,
    })
}

/// Row as stored, before timestamp parsing.
struct RawRun {
    id: String,
    job_name: String,
    status: String,
    exit_code: Option<i32>,
    started_at: String,
    finished_at: Option<String>,
    duration_ms: Option<i64>,
    stdout_tail: Option<String>,
    stderr_tail: Option<String>,
    error_msg: Option<String>,
    trigger: String,
    llm_analysis: Option<String>,
    llm_tokens_used: Option<i64>,
    created_at: String,
}

impl RawRun {
    fn into_run(self) -> Result<Run> {
        Ok(Run {
            status: self.status.parse()?,
            started_at: parse_time(&self.started_at)?,
            finished_at: self.finished_at.as_deref().map(parse_time).transpose()?,
            created_at: parse_time(&self.created_at)?,
            id: self.id,
            job_name: self.job_name,
            exit_code: self.exit_code.unwrap_or(0),
            duration_ms: self.duration_ms.unwrap_or(0),
            stdout_tail: self.stdout_tail.unwrap_or_default(),
            stderr_tail: self.stderr_tail.unwrap_or_default(),
            error_msg: self.error_msg.unwrap_or_default(),
            trigger: self.trigger,
            llm_analysis: self.llm_analysis.unwrap_or_default(),
            llm_tokens_used: self.llm_tokens_used.unwrap_or(0),
        })
    }
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn record_run(&self, run: &Run) -> Result<()> {
        let run = run.clone();
        let path = self.db_path.clone();
        run_blocking(move || {
            let conn = open_connection(&path)?;
            conn.execute(
                r"
                INSERT INTO runs (
                    id, job_name, status, exit_code, started_at, finished_at,
                    duration_ms, stdout_tail, stderr_tail, error_msg, trigger_type,
                    llm_analysis, llm_tokens_used, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    exit_code = excluded.exit_code,
                    finished_at = excluded.finished_at,
                    duration_ms = excluded.duration_ms,
                    stdout_tail = excluded.stdout_tail,
                    stderr_tail = excluded.stderr_tail,
                    error_msg = excluded.error_msg,
                    llm_analysis = excluded.llm_analysis,
                    llm_tokens_used = excluded.llm_tokens_used",
                params![
                    run.id,
                    run.job_name,
                    run.status.as_str(),
                    run.exit_code,
                    format_time(&run.started_at),
                    run.finished_at.as_ref().map(format_time),
                    // NULL while running so averages only cover finished runs.
                    run.finished_at.as_ref().map(|_| run.duration_ms),
                    null_text(&run.stdout_tail),
                    null_text(&run.stderr_tail),
                    null_text(&run.error_msg),
                    run.trigger,
                    null_text(&run.llm_analysis),
                    if run.llm_tokens_used == 0 { None } else { Some(run.llm_tokens_used) },
                    format_time(&run.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let id = id.to_string();
        let path = self.db_path.clone();
        run_blocking(move || {
            let conn = open_connection(&path)?;
            let raw = conn
                .query_row(
                    &format!("SELECT {SELECT_RUN_COLS} FROM runs WHERE id = ?1"),
                    params![id],
                    scan_run,
                )
                .optional()?;
            raw.map(RawRun::into_run).transpose()
        })
        .await
    }

    async fn list_runs(&self, opts: ListOpts) -> Result<Vec<Run>> {
        if opts.limit < 0 {
            return Err(CronbatError::InvalidArgument(format!(
                "limit must be non-negative, got {}",
                opts.limit
            )));
        }
        if opts.offset < 0 {
            return Err(CronbatError::InvalidArgument(format!(
                "offset must be non-negative, got {}",
                opts.offset
            )));
        }

        let path = self.db_path.clone();
        run_blocking(move || {
            let conn = open_connection(&path)?;

            let mut query = format!("SELECT {SELECT_RUN_COLS} FROM runs");
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            if let Some(job_name) = &opts.job_name {
                query.push_str(" WHERE job_name = ?");
                args.push(Box::new(job_name.clone()));
            }
            query.push_str(" ORDER BY started_at DESC");
            if opts.limit > 0 {
                query.push_str(" LIMIT ?");
                args.push(Box::new(opts.limit));
            }
            if opts.offset > 0 {
                if opts.limit == 0 {
                    // SQLite requires LIMIT before OFFSET; -1 means unbounded.
                    query.push_str(" LIMIT -1");
                }
                query.push_str(" OFFSET ?");
                args.push(Box::new(opts.offset));
            }

            let mut stmt = conn.prepare(&query)?;
            let rows = stmt.query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                scan_run,
            )?;

            let mut runs = Vec::new();
            for raw in rows {
                runs.push(raw?.into_run()?);
            }
            Ok(runs)
        })
        .await
    }

    async fn get_job_stats(&self, job_name: &str) -> Result<JobStats> {
        let job_name = job_name.to_string();
        let path = self.db_path.clone();
        run_blocking(move || {
            let conn = open_connection(&path)?;
            let (total_runs, successes, failures, last_run, avg_duration_ms) = conn.query_row(
                r"
                SELECT
                    COUNT(*),
                    SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status = 'failure' THEN 1 ELSE 0 END),
                    MAX(started_at),
                    AVG(duration_ms)
                FROM runs
                WHERE job_name = ?1",
                params![job_name],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<f64>>(4)?,
                    ))
                },
            )?;

            Ok(JobStats {
                total_runs,
                successes: successes.unwrap_or(0),
                failures: failures.unwrap_or(0),
                last_run: last_run.as_deref().map(parse_time).transpose()?,
                avg_duration_ms: avg_duration_ms.unwrap_or(0.0),
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    async fn open_store(dir: &tempfile::TempDir) -> SqliteRunStore {
        SqliteRunStore::open(dir.path().join("runs.db")).await.unwrap()
    }

    fn finished(mut run: Run, status: RunStatus, exit_code: i32, duration_ms: i64) -> Run {
        run.status = status;
        run.exit_code = exit_code;
        run.finished_at = Some(run.started_at + Duration::milliseconds(duration_ms));
        run.duration_ms = duration_ms;
        run
    }

    #[tokio::test]
    async fn upsert_preserves_write_once_fields() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        let running = Run::started("backup", "schedule", Utc::now());
        store.record_run(&running).await.unwrap();

        let mut done = finished(running.clone(), RunStatus::Success, 0, 120);
        done.stdout_tail = "hi\n".into();
        // Attempted overwrites of write-once fields must be ignored.
        done.job_name = "tampered".into();
        done.trigger = "manual".into();
        done.created_at = Utc::now() + Duration::hours(1);
        store.record_run(&done).await.unwrap();

        let stored = store.get_run(&running.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Success);
        assert_eq!(stored.stdout_tail, "hi\n");
        assert!(stored.finished_at.is_some());
        assert_eq!(stored.job_name, "backup");
        assert_eq!(stored.trigger, "schedule");
        assert_eq!(
            format_time(&stored.created_at),
            format_time(&running.created_at)
        );
    }

    #[tokio::test]
    async fn get_missing_run_is_none() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        assert!(store.get_run("01NOPE").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn running_row_roundtrips_null_finished_at() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let running = Run::started("echo", "manual", Utc::now());
        store.record_run(&running).await.unwrap();

        let stored = store.get_run(&running.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Running);
        assert!(stored.finished_at.is_none());
        assert_eq!(stored.error_msg, "");
    }

    #[tokio::test]
    async fn list_orders_filters_and_paginates() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        let base = Utc::now();
        for (i, job) in ["a", "b", "a", "a"].iter().enumerate() {
            let run = Run::started(job, "schedule", base + Duration::seconds(i as i64));
            store
                .record_run(&finished(run, RunStatus::Success, 0, 5))
                .await
                .unwrap();
        }

        let all = store.list_runs(ListOpts::default()).await.unwrap();
        assert_eq!(all.len(), 4);
        assert!(all.windows(2).all(|w| w[0].started_at >= w[1].started_at));

        let only_a = store
            .list_runs(ListOpts {
                job_name: Some("a".into()),
                ..ListOpts::default()
            })
            .await
            .unwrap();
        assert_eq!(only_a.len(), 3);

        let paged = store
            .list_runs(ListOpts {
                job_name: Some("a".into()),
                limit: 1,
                offset: 1,
            })
            .await
            .unwrap();
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].started_at, base + Duration::seconds(2));

        let offset_only = store
            .list_runs(ListOpts {
                limit: 0,
                offset: 2,
                ..ListOpts::default()
            })
            .await
            .unwrap();
        assert_eq!(offset_only.len(), 2);
    }

    #[tokio::test]
    async fn negative_pagination_is_rejected() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let err = store
            .list_runs(ListOpts {
                limit: -1,
                ..ListOpts::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CronbatError::InvalidArgument(_)));

        let err = store
            .list_runs(ListOpts {
                offset: -3,
                ..ListOpts::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CronbatError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn job_stats_aggregate() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        let base = Utc::now();
        let runs = [
            (RunStatus::Success, 0, 100),
            (RunStatus::Failure, 2, 300),
            (RunStatus::Success, 0, 200),
        ];
        for (i, (status, code, ms)) in runs.iter().enumerate() {
            let run = Run::started("stats", "schedule", base + Duration::seconds(i as i64));
            store
                .record_run(&finished(run, *status, *code, *ms))
                .await
                .unwrap();
        }
        // A still-running row counts toward totals but not successes,
        // failures, or the duration average.
        store
            .record_run(&Run::started("stats", "manual", base + Duration::seconds(10)))
            .await
            .unwrap();

        let stats = store.get_job_stats("stats").await.unwrap();
        assert_eq!(stats.total_runs, 4);
        assert_eq!(stats.successes, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(
            stats.last_run.map(|t| format_time(&t)),
            Some(format_time(&(base + Duration::seconds(10))))
        );
        assert!((stats.avg_duration_ms - 200.0).abs() < 0.001);

        let empty = store.get_job_stats("no-such-job").await.unwrap();
        assert_eq!(empty.total_runs, 0);
        assert!(empty.last_run.is_none());
        assert_eq!(empty.avg_duration_ms, 0.0);
    }
}
