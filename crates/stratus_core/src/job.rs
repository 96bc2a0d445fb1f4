use crate::constants::CANCEL_REASON;
use crate::error::JobError;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a remote job as reported by the batch service.
///
/// Declaration order is lifecycle order, so `Ord` can be used to reject regressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Submitted,
    Pending,
    Runnable,
    Starting,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "SUBMITTED",
            Self::Pending => "PENDING",
            Self::Runnable => "RUNNABLE",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SUBMITTED" => Ok(Self::Submitted),
            "PENDING" => Ok(Self::Pending),
            "RUNNABLE" => Ok(Self::Runnable),
            "STARTING" => Ok(Self::Starting),
            "RUNNING" => Ok(Self::Running),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            other => Err(JobError::Service(format!("unknown job state '{other}'"))),
        }
    }
}

/// Why a job ended, derived from the service's status fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitInfo {
    /// The user's program ran to completion with this exit code.
    Exited { code: i32 },
    /// The platform killed or never started the program.
    Infrastructure { reason: String },
    /// Terminated on the user's request.
    Cancelled { reason: String },
}

/// Status reasons (lowercase) the batch platform gives when it, not the program, ended
/// the job. Matched as prefixes of each `;`-separated reason.
const INFRASTRUCTURE_REASONS: &[&str] = &[
    "host ec2",
    "host terminated",
    "spot instance",
    "outofmemoryerror",
    "cannotpullcontainer",
    "cannotstartcontainer",
    "cannotinspectcontainer",
    "cannotcreatevolume",
    "resourceinitializationerror",
    "taskfailedtostart",
    "dockertimeouterror",
    "job attempt duration exceeded timeout",
];

/// Prefix of the reason the service records when someone terminates a job from outside
/// (console, another CLI). Treated like an interactive cancel.
const EXTERNAL_TERMINATION: &str = "terminated by";

/// A snapshot of one remote execution. Only ever produced by asking the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Opaque id assigned by the service; the only handle needed to reattach.
    pub id: String,
    pub name: Option<String>,
    pub state: JobState,
    /// Job-level status reason, e.g. "Essential container in task exited".
    pub status_reason: Option<String>,
    /// Container-level reason, e.g. "OutOfMemoryError: Container killed due to memory usage".
    pub container_reason: Option<String>,
    pub exit_code: Option<i32>,
    pub log_stream: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    /// Container environment as submitted (used to recover object keys on reattach).
    pub environment: BTreeMap<String, String>,
}

impl Job {
    pub fn new(id: impl Into<String>, state: JobState) -> Self {
        Self {
            id: id.into(),
            name: None,
            state,
            status_reason: None,
            container_reason: None,
            exit_code: None,
            log_stream: None,
            created_at: None,
            environment: BTreeMap::new(),
        }
    }

    pub fn with_status_reason(mut self, reason: impl Into<String>) -> Self {
        self.status_reason = Some(reason.into());
        self
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_log_stream(mut self, stream: impl Into<String>) -> Self {
        self.log_stream = Some(stream.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    fn reasons(&self) -> String {
        [self.status_reason.as_deref(), self.container_reason.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Classifies how the job ended. `None` while the job is still active.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        match self.state {
            JobState::Succeeded => Some(ExitInfo::Exited {
                code: self.exit_code.unwrap_or(0),
            }),
            JobState::Failed => {
                let reason = self.reasons();
                let lowered: Vec<String> = reason
                    .split(';')
                    .map(|part| part.trim().to_lowercase())
                    .collect();

                let cancelled = reason.contains(CANCEL_REASON)
                    || lowered.iter().any(|r| r.starts_with(EXTERNAL_TERMINATION));
                if cancelled {
                    return Some(ExitInfo::Cancelled { reason });
                }

                let platform = lowered
                    .iter()
                    .any(|r| INFRASTRUCTURE_REASONS.iter().any(|m| r.starts_with(m)));
                if platform {
                    return Some(ExitInfo::Infrastructure { reason });
                }

                Some(match self.exit_code {
                    Some(code) => ExitInfo::Exited { code },
                    None if reason.is_empty() => ExitInfo::Infrastructure {
                        reason: "the job ended without recording an exit code".into(),
                    },
                    None => ExitInfo::Infrastructure { reason },
                })
            }
            _ => None,
        }
    }
}

/// Resource overrides for a submission. Set values replace the job definition's defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cpus: Option<u32>,
    /// Memory in MiB.
    pub memory_mib: Option<u64>,
}

impl Resources {
    pub fn is_empty(&self) -> bool {
        self.cpus.is_none() && self.memory_mib.is_none()
    }

    /// Values from `self` win, falling back to `defaults`.
    pub fn or(self, defaults: Resources) -> Resources {
        Resources {
            cpus: self.cpus.or(defaults.cpus),
            memory_mib: self.memory_mib.or(defaults.memory_mib),
        }
    }
}

/// A request to submit one job to the batch service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub name: String,
    /// Registered job definition name or ARN.
    pub definition: String,
    pub queue: String,
    /// Command override. Empty keeps the definition's command.
    pub command: Vec<String>,
    pub environment: Vec<(String, String)>,
    pub resources: Resources,
}

/// One line of job output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl LogLine {
    pub fn new(timestamp: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            message: message.into(),
        }
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.message
        )
    }
}

/// One page of log events plus the cursor to resume after it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogPage {
    pub lines: Vec<LogLine>,
    pub next_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("Host EC2 (instance i-0abc) terminated.")]
    #[case("host terminated")]
    #[case("OutOfMemoryError: Container killed due to memory usage")]
    #[case("CannotPullContainerError: pull image manifest has been retried")]
    #[case("Job attempt duration exceeded timeout")]
    fn infrastructure_reasons(#[case] reason: &str) {
        let job = Job::new("job-1", JobState::Failed)
            .with_status_reason(reason)
            .with_exit_code(137);
        assert!(matches!(
            job.exit_info(),
            Some(ExitInfo::Infrastructure { .. })
        ));
    }

    #[rstest]
    #[case("Essential container in task exited")]
    #[case("Task exited with a hosted runtime error")]
    #[case("script terminated unexpectedly")]
    fn program_reasons_keep_the_exit_code(#[case] reason: &str) {
        let job = Job::new("job-1", JobState::Failed)
            .with_status_reason(reason)
            .with_exit_code(2);
        assert_eq!(job.exit_info(), Some(ExitInfo::Exited { code: 2 }));
    }

    #[rstest]
    #[case(Some(143))]
    #[case(None)]
    fn jobs_terminated_from_elsewhere_are_cancelled(#[case] exit_code: Option<i32>) {
        let mut job = Job::new("job-1", JobState::Failed).with_status_reason("Terminated by user");
        job.exit_code = exit_code;
        assert!(matches!(job.exit_info(), Some(ExitInfo::Cancelled { .. })));
    }

    #[test]
    fn container_reasons_are_checked_too() {
        let mut job = Job::new("job-1", JobState::Failed)
            .with_status_reason("Essential container in task exited")
            .with_exit_code(137);
        job.container_reason = Some("OutOfMemoryError: Container killed due to memory usage".into());
        assert!(matches!(
            job.exit_info(),
            Some(ExitInfo::Infrastructure { .. })
        ));
    }

    #[test]
    fn program_failure_keeps_exit_code() {
        let job = Job::new("job-1", JobState::Failed)
            .with_status_reason("Essential container in task exited")
            .with_exit_code(3);
        assert_eq!(job.exit_info(), Some(ExitInfo::Exited { code: 3 }));
    }

    #[test]
    fn missing_exit_code_is_infrastructure() {
        let job = Job::new("job-1", JobState::Failed);
        assert!(matches!(
            job.exit_info(),
            Some(ExitInfo::Infrastructure { .. })
        ));
    }

    #[test]
    fn cancellation_wins_over_markers() {
        let job = Job::new("job-1", JobState::Failed)
            .with_status_reason(format!("{CANCEL_REASON}; task terminated"))
            .with_exit_code(143);
        assert!(matches!(job.exit_info(), Some(ExitInfo::Cancelled { .. })));
    }

    #[test]
    fn active_jobs_have_no_exit_info() {
        assert_eq!(Job::new("j", JobState::Running).exit_info(), None);
    }

    #[test]
    fn states_are_ordered_by_lifecycle() {
        assert!(JobState::Submitted < JobState::Running);
        assert!(JobState::Running < JobState::Succeeded);
        assert_eq!("runnable".parse::<JobState>().ok(), Some(JobState::Runnable));
        assert!("LOST".parse::<JobState>().is_err());
    }

    #[test]
    fn explicit_resources_replace_defaults() {
        let defaults = Resources {
            cpus: Some(4),
            memory_mib: Some(7200),
        };
        let merged = Resources {
            cpus: Some(16),
            memory_mib: None,
        }
        .or(defaults);
        assert_eq!(merged.cpus, Some(16));
        assert_eq!(merged.memory_mib, Some(7200));
    }
}
