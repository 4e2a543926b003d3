use thiserror::Error;

/// Errors surfaced by the cronbat core to its callers.
#[derive(Error, Debug)]
pub enum CronbatError {
    /// Malformed input: bad job name, missing schedule/command, invalid
    /// duration or cron expression.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A referenced job or run does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A create or rename collides with an existing job name.
    #[error("conflict: {0}")]
    Conflict(String),

    /// YAML or expression text could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// A caller-supplied argument is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Database failure in the run store.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<serde_yaml::Error> for CronbatError {
    fn from(err: serde_yaml::Error) -> Self {
        CronbatError::Parse(err.to_string())
    }
}

impl From<rusqlite::Error> for CronbatError {
    fn from(err: rusqlite::Error) -> Self {
        CronbatError::Storage(err.to_string())
    }
}

impl CronbatError {
    /// Create a not-found error for a job name.
    pub fn job_not_found(name: &str) -> Self {
        CronbatError::NotFound(format!("job not found: {name}"))
    }
}

/// Result type alias for cronbat operations.
pub type Result<T> = std::result::Result<T, CronbatError>;
