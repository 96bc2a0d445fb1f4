use crate::constants::exit_codes;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransferError {
    /// The store refused access to the object (e.g. **HTTP 403**).
    /// Never retried.
    #[error("{operation} {key}: permission denied: {message}")]
    Denied {
        operation: &'static str,
        key: String,
        message: String,
    },

    /// The requested object does not exist.
    #[error("{operation} {key}: object not found")]
    NotFound { operation: &'static str, key: String },

    /// Any other client-side rejection (**HTTP 4xx**). Never retried.
    #[error("{operation} {key}: rejected: {message}")]
    Rejected {
        operation: &'static str,
        key: String,
        message: String,
    },

    /// Connection reset, timeout or **HTTP 5xx**. Retried with backoff.
    #[error("{operation} {key}: transient failure: {message}")]
    Transient {
        operation: &'static str,
        key: String,
        message: String,
    },

    /// A transient failure that outlived the retry budget.
    #[error("{operation} {key}: giving up after {attempts} attempts: {message}")]
    Exhausted {
        operation: &'static str,
        key: String,
        attempts: usize,
        message: String,
    },

    /// Local I/O error while feeding or draining a transfer.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Turns a transient failure into its terminal form once retries are spent.
    pub fn exhausted(self, attempts: usize) -> Self {
        match self {
            Self::Transient {
                operation,
                key,
                message,
            } => Self::Exhausted {
                operation,
                key,
                attempts,
                message,
            },
            other => other,
        }
    }
}

#[derive(Error, Debug)]
pub enum ArchiveError {
    /// An entry path would land outside the extraction directory.
    /// Aborts the whole unpack.
    #[error("archive entry '{0}' escapes the target directory")]
    PathEscape(String),

    /// The stream is not a stratus archive or is truncated.
    #[error("malformed archive: {0}")]
    Malformed(String),

    /// A file changed size between being listed and being read.
    #[error("'{0}' changed while it was being archived")]
    Changed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum JobError {
    /// The batch service rejected the submission (bad definition, queue or resources).
    /// Carries the service's message verbatim.
    #[error("job submission rejected: {0}")]
    Submission(String),

    #[error("job {0} not found")]
    NotFound(String),

    /// Network trouble or a service-side error; retried with backoff.
    #[error("transient batch service failure: {0}")]
    Transient(String),

    /// A non-retryable failure reported by the batch or log service.
    #[error("batch service failure: {0}")]
    Service(String),
}

impl JobError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// A job that reached `FAILED` because of the execution platform rather than the user's program.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("job {job_id} failed due to an infrastructure problem, not the build itself: {reason}")]
pub struct InfrastructureFailure {
    pub job_id: String,
    pub reason: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UsageError {
    /// The selected backend cannot honour the requested option.
    #[error("the {backend} backend does not support {feature}")]
    Unsupported {
        backend: &'static str,
        feature: &'static str,
    },

    #[error("{0}")]
    Conflict(String),

    #[error("missing configuration: {0}")]
    MissingConfig(String),

    #[error("invalid pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("build directory {0} does not exist or is not a directory")]
    BuildDir(String),
}

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Usage(#[from] UsageError),

    /// Failure of a local backend (container daemon, subprocess).
    #[error("backend failure: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => exit_codes::USAGE,
            _ => exit_codes::FAILURE,
        }
    }
}
