//! Persistent per-run stdout/stderr files with retention.
//!
//! Each run gets `<base>/<safe(job)>/<run_id>.stdout.log` and
//! `.stderr.log`, written through a size-capped writer so a runaway job
//! cannot fill the disk. Cleanup applies an age threshold first, then
//! evicts oldest files until the total size fits under the global cap.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{CronbatError, Result};
use crate::runner::SharedWriter;

const STDOUT_SUFFIX: &str = ".stdout.log";
const STDERR_SUFFIX: &str = ".stderr.log";

/// Handles persistent run log files and their retention.
#[derive(Debug)]
pub struct Manager {
    base_dir: PathBuf,
    max_bytes_per_stream: u64,
    retention_days: u32,
    max_total_bytes: u64,
}

/// Persisted logs for one run.
#[derive(Debug, Clone)]
pub struct RunLogs {
    pub stdout: String,
    pub stderr: String,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

impl Manager {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        max_bytes_per_stream: u64,
        retention_days: u32,
        max_total_bytes: u64,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_bytes_per_stream,
            retention_days,
            max_total_bytes,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Stdout/stderr log file paths for a run.
    pub fn paths(&self, job_name: &str, run_id: &str) -> (PathBuf, PathBuf) {
        let dir = self.base_dir.join(sanitize_segment(job_name));
        (
            dir.join(format!("{run_id}{STDOUT_SUFFIX}")),
            dir.join(format!("{run_id}{STDERR_SUFFIX}")),
        )
    }

    /// Open capped writers for both streams of a run.
    pub fn open_run_writers(&self, job_name: &str, run_id: &str) -> Result<RunWriters> {
        let (stdout_path, stderr_path) = self.paths(job_name, run_id);
        if let Some(parent) = stdout_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let stdout_file = File::create(&stdout_path)?;
        let stderr_file = File::create(&stderr_path)?;

        Ok(RunWriters {
            stdout: Arc::new(Mutex::new(CappedFileWriter::new(
                stdout_file,
                self.max_bytes_per_stream,
            ))),
            stderr: Arc::new(Mutex::new(CappedFileWriter::new(
                stderr_file,
                self.max_bytes_per_stream,
            ))),
            stdout_path,
            stderr_path,
        })
    }

    /// Read persisted logs for a run. `NotFound` only when neither stream
    /// file exists; a single missing side comes back empty.
    pub fn read_run_logs(&self, job_name: &str, run_id: &str) -> Result<RunLogs> {
        let (stdout_path, stderr_path) = self.paths(job_name, run_id);

        let stdout = read_optional(&stdout_path)?;
        let stderr = read_optional(&stderr_path)?;

        if stdout.is_none() && stderr.is_none() {
            return Err(CronbatError::NotFound(format!(
                "run logs not found: {job_name}/{run_id}"
            )));
        }

        Ok(RunLogs {
            stdout: stdout.unwrap_or_default(),
            stderr: stderr.unwrap_or_default(),
            stdout_path,
            stderr_path,
        })
    }

    /// Remove logs past the age threshold, then evict oldest-first until the
    /// total size fits under the global cap.
    pub fn cleanup(&self) -> Result<()> {
        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(u64::from(self.retention_days) * 86_400))
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut survivors: Vec<LogFile> = Vec::new();
        if !self.base_dir.exists() {
            return Ok(());
        }
        collect_logs(&self.base_dir, cutoff, &mut survivors)?;

        if self.max_total_bytes == 0 {
            return Ok(());
        }

        let mut total: u64 = survivors.iter().map(|f| f.size).sum();
        if total <= self.max_total_bytes {
            return Ok(());
        }

        survivors.sort_by_key(|f| f.modified);
        for file in survivors {
            if total <= self.max_total_bytes {
                break;
            }
            if let Err(err) = fs::remove_file(&file.path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %file.path.display(), error = %err, "failed to evict run log");
                }
            }
            // Subtract unconditionally; the next pass re-evaluates anything
            // that survived a failed removal.
            total = total.saturating_sub(file.size);
        }
        Ok(())
    }
}

struct LogFile {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

/// Walk the log tree, deleting expired files and collecting the survivors.
fn collect_logs(dir: &Path, cutoff: SystemTime, out: &mut Vec<LogFile>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_logs(&path, cutoff, out)?;
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.ends_with(STDOUT_SUFFIX) && !name.ends_with(STDERR_SUFFIX) {
            continue;
        }

        let meta = entry.metadata()?;
        let modified = meta.modified()?;
        if modified < cutoff {
            let _ = fs::remove_file(&path);
            continue;
        }
        out.push(LogFile {
            path,
            size: meta.len(),
            modified,
        });
    }
    Ok(())
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(String::from_utf8_lossy(&data).into_owned())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Open capped writers for one run, shared with the runner's tee.
pub struct RunWriters {
    stdout: Arc<Mutex<CappedFileWriter>>,
    stderr: Arc<Mutex<CappedFileWriter>>,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

/// Persistence outcome for one stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamSummary {
    pub bytes_written: u64,
    pub truncated: bool,
}

/// Result of closing both writers.
#[derive(Debug, Default)]
pub struct CloseSummary {
    pub stdout: StreamSummary,
    pub stderr: StreamSummary,
    /// Set when flushing either file failed; never fails the run.
    pub warning: Option<String>,
}

impl RunWriters {
    pub fn stdout_writer(&self) -> SharedWriter {
        Arc::clone(&self.stdout) as SharedWriter
    }

    pub fn stderr_writer(&self) -> SharedWriter {
        Arc::clone(&self.stderr) as SharedWriter
    }

    /// Flush and close both files, reporting what was persisted.
    pub fn close(self) -> CloseSummary {
        let mut summary = CloseSummary::default();
        let mut warnings = Vec::new();

        {
            let mut stdout = self.stdout.lock();
            summary.stdout = stdout.summary();
            if let Err(err) = stdout.finish() {
                warnings.push(format!("stdout log: {err}"));
            }
        }
        {
            let mut stderr = self.stderr.lock();
            summary.stderr = stderr.summary();
            if let Err(err) = stderr.finish() {
                warnings.push(format!("stderr log: {err}"));
            }
        }

        if !warnings.is_empty() {
            summary.warning = Some(warnings.join("; "));
        }
        summary
    }
}

/// Writer that persists up to `max_bytes`, then accepts and discards the
/// rest. Always reports success to the caller: log storage must not fail a
/// run, so underlying I/O errors are swallowed too.
#[derive(Debug)]
pub struct CappedFileWriter {
    file: File,
    max_bytes: u64,
    written: u64,
    truncated: bool,
}

impl CappedFileWriter {
    pub fn new(file: File, max_bytes: u64) -> Self {
        Self {
            file,
            max_bytes,
            written: 0,
            truncated: false,
        }
    }

    pub fn written_bytes(&self) -> u64 {
        self.written
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    fn summary(&self) -> StreamSummary {
        StreamSummary {
            bytes_written: self.written,
            truncated: self.truncated,
        }
    }

    /// Flush buffered data to disk. Called once when the run finishes.
    fn finish(&mut self) -> std::io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()
    }
}

impl Write for CappedFileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.max_bytes == 0 {
            self.truncated = true;
            return Ok(buf.len());
        }

        let remaining = self.max_bytes - self.written;
        if remaining == 0 {
            self.truncated = true;
            return Ok(buf.len());
        }

        let to_write = if buf.len() as u64 > remaining {
            self.truncated = true;
            &buf[..remaining as usize]
        } else {
            buf
        };

        match self.file.write(to_write) {
            Ok(n) => self.written += n as u64,
            Err(_) => {
                // Swallowed: job execution must not fail on log storage.
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let _ = self.file.flush();
        Ok(())
    }
}

/// Replace unsafe path characters with `_`, trim leading/trailing `.` and
/// `_`, and fall back to `unknown` for empty results.
pub fn sanitize_segment(value: &str) -> String {
    if value.is_empty() {
        return "unknown".into();
    }

    let mapped: String = value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = mapped.trim_matches(|ch| ch == '.' || ch == '_');
    if trimmed.is_empty() {
        "unknown".into()
    } else {
        trimmed.to_string()
    }
}

/// Periodic cleanup driver, cancelled through the shutdown signal.
pub async fn run_cleanup_loop(
    manager: Arc<Manager>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick of an interval is immediate; startup cleanup already
    // ran, so consume it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                let manager = Arc::clone(&manager);
                let outcome = tokio::task::spawn_blocking(move || manager.cleanup()).await;
                match outcome {
                    Ok(Err(err)) => tracing::warn!(error = %err, "run log cleanup failed"),
                    Err(err) => tracing::warn!(error = %err, "run log cleanup task panicked"),
                    Ok(Ok(())) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sanitize_replaces_and_trims() {
        assert_eq!(sanitize_segment("nightly-backup"), "nightly-backup");
        assert_eq!(sanitize_segment("my job/../etc"), "my_job_.._etc");
        assert_eq!(sanitize_segment("...___"), "unknown");
        assert_eq!(sanitize_segment(""), "unknown");
        assert_eq!(sanitize_segment("_inner_"), "inner");
    }

    #[test]
    fn capped_writer_persists_min_of_len_and_cap() {
        let dir = tempdir().unwrap();
        for (input_len, cap) in [(10u64, 64u64), (64, 64), (100, 64), (0, 64), (10, 0)] {
            let path = dir.path().join(format!("{input_len}-{cap}.log"));
            let mut writer = CappedFileWriter::new(File::create(&path).unwrap(), cap);
            let data = vec![b'z'; input_len as usize];
            for chunk in data.chunks(7) {
                assert_eq!(writer.write(chunk).unwrap(), chunk.len());
            }
            writer.finish().unwrap();

            assert_eq!(writer.written_bytes(), input_len.min(cap));
            assert_eq!(writer.truncated(), input_len > cap);
            assert_eq!(fs::metadata(&path).unwrap().len(), input_len.min(cap));
        }
    }

    #[test]
    fn writers_roundtrip_through_reader() {
        let dir = tempdir().unwrap();
        let manager = Manager::new(dir.path(), 1024, 7, 0);
        let writers = manager.open_run_writers("backup", "01RUN").unwrap();
        writers.stdout_writer().lock().write_all(b"out data").unwrap();
        writers.stderr_writer().lock().write_all(b"err data").unwrap();
        let summary = writers.close();
        assert_eq!(summary.stdout.bytes_written, 8);
        assert!(!summary.stdout.truncated);
        assert!(summary.warning.is_none());

        let logs = manager.read_run_logs("backup", "01RUN").unwrap();
        assert_eq!(logs.stdout, "out data");
        assert_eq!(logs.stderr, "err data");
    }

    #[test]
    fn reader_tolerates_one_missing_side() {
        let dir = tempdir().unwrap();
        let manager = Manager::new(dir.path(), 1024, 7, 0);
        let writers = manager.open_run_writers("backup", "01RUN").unwrap();
        writers.stdout_writer().lock().write_all(b"only out").unwrap();
        let stderr_path = writers.stderr_path.clone();
        writers.close();
        fs::remove_file(stderr_path).unwrap();

        let logs = manager.read_run_logs("backup", "01RUN").unwrap();
        assert_eq!(logs.stdout, "only out");
        assert_eq!(logs.stderr, "");
    }

    #[test]
    fn reader_reports_not_found_when_both_absent() {
        let dir = tempdir().unwrap();
        let manager = Manager::new(dir.path(), 1024, 7, 0);
        let err = manager.read_run_logs("backup", "NOPE").unwrap_err();
        assert!(matches!(err, CronbatError::NotFound(_)));
    }

    #[test]
    fn cleanup_deletes_expired_files() {
        let dir = tempdir().unwrap();
        let manager = Manager::new(dir.path(), 1024, 0, 0);
        let writers = manager.open_run_writers("old", "01A").unwrap();
        writers.stdout_writer().lock().write_all(b"stale").unwrap();
        writers.close();

        // retention_days = 0 makes anything older than "now" expire.
        std::thread::sleep(Duration::from_millis(50));
        manager.cleanup().unwrap();

        assert!(matches!(
            manager.read_run_logs("old", "01A"),
            Err(CronbatError::NotFound(_))
        ));
    }

    #[test]
    fn cleanup_evicts_oldest_until_under_cap() {
        let dir = tempdir().unwrap();
        // Generous age threshold; only the size cap applies.
        let manager = Manager::new(dir.path(), 1024, 365, 2048);

        for run in ["01OLD", "02MID", "03NEW"] {
            let writers = manager.open_run_writers("bulk", run).unwrap();
            writers
                .stdout_writer()
                .lock()
                .write_all(&vec![b'x'; 1024])
                .unwrap();
            writers.close();
            std::thread::sleep(Duration::from_millis(30));
        }

        // 3 KiB of stdout logs against a 2 KiB cap: the oldest must go.
        manager.cleanup().unwrap();
        assert!(!manager.paths("bulk", "01OLD").0.exists());
        assert!(manager.paths("bulk", "03NEW").0.exists());
    }
}
