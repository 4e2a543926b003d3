//! Shell subprocess runner.
//!
//! Commands run through `sh -c` with the job environment overlaid on the
//! daemon's. Both output streams are captured into fixed-size ring buffers
//! (so the result always carries the most recent 64 KiB of each stream) and
//! optionally teed to extra writers supplied by the run-log manager. A
//! positive timeout bounds the wall-clock run; on expiry the child is killed
//! and the result reports `error = "timeout"`.

pub mod buffer;

pub use buffer::RingBuffer;

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Capacity of each per-stream tail buffer.
pub const RING_BUFFER_SIZE: usize = 64 * 1024;

/// Environment variables injected into every executed command.
pub const ENV_JOB_NAME: &str = "CRONBAT_JOB_NAME";
pub const ENV_TRIGGER: &str = "CRONBAT_TRIGGER";

/// Shared sink for teeing stream bytes to persistent storage. Write errors
/// are swallowed so log storage can never fail a run.
pub type SharedWriter = Arc<Mutex<dyn Write + Send>>;

/// Information about the job being executed, exposed to the command through
/// the environment.
#[derive(Debug, Clone, Default)]
pub struct JobContext {
    pub job_name: String,
    /// `schedule`, `manual`, or `trigger:<name>`.
    pub trigger: String,
    pub env: HashMap<String, String>,
}

/// Optional output destinations and working directory for one run.
#[derive(Default)]
pub struct RunOptions {
    pub extra_stdout: Option<SharedWriter>,
    pub extra_stderr: Option<SharedWriter>,
    pub work_dir: Option<PathBuf>,
}

/// Outcome of one command execution.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    /// `0` on success, the child's code on a non-zero exit, `-1` when the
    /// process was killed by a signal or could not be spawned.
    pub exit_code: i32,
    /// Most recent bytes of stdout, in order.
    pub stdout: String,
    /// Most recent bytes of stderr, in order.
    pub stderr: String,
    pub duration_ms: i64,
    /// Empty on a clean or non-zero exit, `"timeout"` on deadline expiry,
    /// otherwise the OS error.
    pub error: String,
}

/// Executes shell commands for jobs.
#[derive(Debug, Default)]
pub struct Runner;

impl Runner {
    pub fn new() -> Self {
        Self
    }

    /// Run `command` with the given context. `timeout` of `None` means
    /// unbounded.
    pub async fn run(
        &self,
        command: &str,
        ctx: &JobContext,
        timeout: Option<Duration>,
        opts: &RunOptions,
    ) -> RunResult {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .env_clear()
            .envs(build_env(ctx))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &opts.work_dir {
            cmd.current_dir(dir);
        }

        let start = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                return RunResult {
                    exit_code: -1,
                    duration_ms: start.elapsed().as_millis() as i64,
                    error: err.to_string(),
                    ..RunResult::default()
                };
            }
        };

        let stdout_ring = Arc::new(Mutex::new(RingBuffer::new(RING_BUFFER_SIZE)));
        let stderr_ring = Arc::new(Mutex::new(RingBuffer::new(RING_BUFFER_SIZE)));

        // Draining both pipes concurrently also prevents the child from
        // blocking on a full pipe.
        let stdout_task = child.stdout.take().map(|pipe| {
            tokio::spawn(drain(
                pipe,
                Arc::clone(&stdout_ring),
                opts.extra_stdout.clone(),
            ))
        });
        let stderr_task = child.stderr.take().map(|pipe| {
            tokio::spawn(drain(
                pipe,
                Arc::clone(&stderr_ring),
                opts.extra_stderr.clone(),
            ))
        });

        let mut timed_out = false;
        let status = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    timed_out = true;
                    let _ = child.start_kill();
                    child.wait().await
                }
            },
            None => child.wait().await,
        };

        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        let duration_ms = start.elapsed().as_millis() as i64;
        let mut result = RunResult {
            stdout: stdout_ring.lock().to_string_lossy(),
            stderr: stderr_ring.lock().to_string_lossy(),
            duration_ms,
            ..RunResult::default()
        };

        match status {
            Ok(status) => {
                result.exit_code = status.code().unwrap_or(-1);
                if timed_out {
                    result.error = "timeout".into();
                }
            }
            Err(err) => {
                result.exit_code = -1;
                result.error = if timed_out {
                    "timeout".into()
                } else {
                    err.to_string()
                };
            }
        }
        result
    }
}

/// Read a pipe to EOF, feeding the ring buffer and the optional extra sink.
async fn drain<R>(mut reader: R, ring: Arc<Mutex<RingBuffer>>, extra: Option<SharedWriter>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                ring.lock().write(&chunk[..n]);
                if let Some(writer) = &extra {
                    let _ = writer.lock().write_all(&chunk[..n]);
                }
            }
        }
    }
}

/// Current process environment overlaid with the job's variables plus the
/// reserved job metadata variables.
fn build_env(ctx: &JobContext) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    for (key, value) in &ctx.env {
        env.insert(key.clone(), value.clone());
    }
    env.insert(ENV_JOB_NAME.into(), ctx.job_name.clone());
    env.insert(ENV_TRIGGER.into(), ctx.trigger.clone());
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(name: &str, trigger: &str) -> JobContext {
        JobContext {
            job_name: name.into(),
            trigger: trigger.into(),
            ..JobContext::default()
        }
    }

    #[tokio::test]
    async fn clean_exit_captures_stdout() {
        let runner = Runner::new();
        let result = runner
            .run("echo hi", &ctx("echo", "manual"), None, &RunOptions::default())
            .await;
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "hi\n");
        assert_eq!(result.stderr, "");
        assert_eq!(result.error, "");
        assert!(result.duration_ms >= 0);
    }

    #[tokio::test]
    async fn nonzero_exit_reports_code_without_error() {
        let runner = Runner::new();
        let result = runner
            .run(
                "echo err 1>&2; exit 3",
                &ctx("bad", "manual"),
                None,
                &RunOptions::default(),
            )
            .await;
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stderr, "err\n");
        assert_eq!(result.stdout, "");
        assert_eq!(result.error, "");
    }

    #[tokio::test]
    async fn deadline_kills_child() {
        let runner = Runner::new();
        let result = runner
            .run(
                "sleep 5",
                &ctx("slow", "manual"),
                Some(Duration::from_millis(100)),
                &RunOptions::default(),
            )
            .await;
        assert_eq!(result.error, "timeout");
        assert_ne!(result.exit_code, 0);
        assert!(result.duration_ms >= 100 && result.duration_ms < 5000);
    }

    #[tokio::test]
    async fn job_env_and_reserved_variables_are_visible() {
        let runner = Runner::new();
        let mut context = ctx("backup", "manual");
        context.env.insert("MY_SETTING".into(), "42".into());
        let result = runner
            .run(
                r#"printf '%s|%s|%s' "$CRONBAT_JOB_NAME" "$CRONBAT_TRIGGER" "$MY_SETTING""#,
                &context,
                None,
                &RunOptions::default(),
            )
            .await;
        assert_eq!(result.stdout, "backup|manual|42");
    }

    #[tokio::test]
    async fn work_dir_sets_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Runner::new();
        let opts = RunOptions {
            work_dir: Some(dir.path().to_path_buf()),
            ..RunOptions::default()
        };
        let result = runner.run("pwd", &ctx("cwd", "manual"), None, &opts).await;
        let reported = std::fs::canonicalize(result.stdout.trim()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[tokio::test]
    async fn missing_work_dir_is_a_spawn_failure() {
        let runner = Runner::new();
        let opts = RunOptions {
            work_dir: Some(PathBuf::from("/nonexistent/cronbat-test-dir")),
            ..RunOptions::default()
        };
        let result = runner.run("true", &ctx("cwd", "manual"), None, &opts).await;
        assert_eq!(result.exit_code, -1);
        assert!(!result.error.is_empty());
    }

    #[tokio::test]
    async fn long_output_keeps_only_the_tail() {
        let runner = Runner::new();
        let result = runner
            .run(
                "head -c 100000 /dev/zero | tr '\\0' 'x'",
                &ctx("spam", "manual"),
                None,
                &RunOptions::default(),
            )
            .await;
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.len(), RING_BUFFER_SIZE);
        assert!(result.stdout.bytes().all(|b| b == b'x'));
    }

    #[tokio::test]
    async fn extra_writers_receive_every_byte() {
        let runner = Runner::new();
        let sink: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_writer: SharedWriter = Arc::new(Mutex::new(TeeSink(Arc::clone(&sink))));
        let opts = RunOptions {
            extra_stdout: Some(sink_writer),
            ..RunOptions::default()
        };
        let result = runner
            .run("printf 'one\\ntwo\\n'", &ctx("tee", "manual"), None, &opts)
            .await;
        assert_eq!(result.stdout, "one\ntwo\n");
        assert_eq!(sink.lock().as_slice(), b"one\ntwo\n");
    }

    struct TeeSink(Arc<Mutex<Vec<u8>>>);

    impl Write for TeeSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
