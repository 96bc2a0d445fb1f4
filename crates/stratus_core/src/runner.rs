//! The backend-agnostic build lifecycle.

use crate::constants::{DEFAULT_BUILD_COMMAND, exit_codes};
use crate::error::{InfrastructureFailure, RunnerError, UsageError};
use crate::glob::PatternSet;
use crate::interrupt::Signal;
use crate::job::{ExitInfo, Job, Resources};
use crate::manifest::DownloadSelection;

use std::path::PathBuf;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

/// Terminal signals forwarded by the binary.
pub type Signals = UnboundedReceiver<Signal>;

/// Optional features of a backend. Requesting one that is missing is a usage error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub detach: bool,
    pub attach: bool,
    pub cancel: bool,
    pub resources: bool,
    /// Results are transferred back, so `--download`/`--no-download` mean something.
    pub download: bool,
}

impl Capabilities {
    /// Everything: remote backends.
    pub const REMOTE: Self = Self {
        detach: true,
        attach: true,
        cancel: true,
        resources: true,
        download: true,
    };

    /// Nothing: the build runs in place in the foreground.
    pub const LOCAL: Self = Self {
        detach: false,
        attach: false,
        cancel: false,
        resources: false,
        download: false,
    };
}

/// Everything a backend needs to know about one invocation.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub build_dir: PathBuf,
    /// The command run inside the build directory.
    pub command: Vec<String>,
    /// User exclusions applied on top of the always-excluded set.
    pub exclude: PatternSet,
    pub download: DownloadSelection,
    pub resources: Resources,
    pub environment: Vec<(String, String)>,
    /// Stop watching right after submission.
    pub detach: bool,
    /// Reattach to this job instead of submitting a new one.
    pub attach: Option<String>,
    /// Terminate the attached job.
    pub cancel: bool,
    /// Stream the job's log output.
    pub logs: bool,
}

impl BuildRequest {
    pub fn new(build_dir: impl Into<PathBuf>) -> Self {
        Self {
            build_dir: build_dir.into(),
            command: DEFAULT_BUILD_COMMAND.iter().map(|s| s.to_string()).collect(),
            exclude: PatternSet::default(),
            download: DownloadSelection::All,
            resources: Resources::default(),
            environment: Vec::new(),
            detach: false,
            attach: None,
            cancel: false,
            logs: true,
        }
    }

    /// Checks the request against what `backend` can do. Touches only the local filesystem.
    pub fn validate(&self, backend: &'static str, caps: Capabilities) -> Result<(), UsageError> {
        let unsupported = |feature| UsageError::Unsupported { backend, feature };

        if self.cancel && self.attach.is_none() {
            return Err(UsageError::Conflict(
                "--cancel requires --attach <job-id>".into(),
            ));
        }
        if self.detach && self.cancel {
            return Err(UsageError::Conflict(
                "--detach and --cancel cannot be combined".into(),
            ));
        }
        if self.detach && self.attach.is_some() {
            return Err(UsageError::Conflict(
                "--detach and --attach cannot be combined".into(),
            ));
        }

        if self.detach && !caps.detach {
            return Err(unsupported("--detach"));
        }
        if self.attach.is_some() && !caps.attach {
            return Err(unsupported("--attach"));
        }
        if self.cancel && !caps.cancel {
            return Err(unsupported("--cancel"));
        }
        if !self.resources.is_empty() && !caps.resources {
            return Err(unsupported("--cpus/--memory"));
        }
        if self.download != DownloadSelection::All && !caps.download {
            return Err(unsupported("--download/--no-download"));
        }

        if !self.build_dir.is_dir() {
            return Err(UsageError::BuildDir(self.build_dir.display().to_string()));
        }
        Ok(())
    }
}

/// How an invocation ended, from the local process' point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    /// The user's program exited non-zero.
    Failed { exit_code: i32 },
    Infrastructure(InfrastructureFailure),
    /// The job was terminated on the user's request.
    Cancelled,
    /// The local process was interrupted after the job finished (e.g. during download).
    Interrupted,
    /// The job keeps running; nothing more to do locally.
    Detached,
}

impl Outcome {
    /// `None` while the job is still active.
    pub fn from_job(job: &Job) -> Option<Self> {
        Some(match job.exit_info()? {
            ExitInfo::Exited { code: 0 } if job.state == crate::job::JobState::Succeeded => {
                Self::Succeeded
            }
            ExitInfo::Exited { code: 0 } => Self::Failed {
                exit_code: exit_codes::FAILURE,
            },
            ExitInfo::Exited { code } => Self::Failed { exit_code: code },
            ExitInfo::Infrastructure { reason } => Self::Infrastructure(InfrastructureFailure {
                job_id: job.id.clone(),
                reason,
            }),
            ExitInfo::Cancelled { .. } => Self::Cancelled,
        })
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Succeeded | Self::Detached => exit_codes::SUCCESS,
            Self::Failed { exit_code } => *exit_code,
            Self::Infrastructure(_) => exit_codes::INFRASTRUCTURE,
            Self::Cancelled | Self::Interrupted => exit_codes::INTERRUPTED,
        }
    }

    /// Whether the job may have left results worth bringing back.
    pub fn has_results(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed { .. } | Self::Infrastructure(_)
        )
    }
}

/// One execution backend.
///
/// `drive` calls the methods in order: `prepare` and `run` for a new build (skipped when
/// reattaching), then `cancel` if asked, `attach`, and finally `teardown`. Only `prepare`
/// is abandoned on Ctrl-C; interrupts arriving during `run` are left for `attach`.
pub trait Runner: Send {
    /// Backend selector as typed on the command line.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Makes the build directory available to the backend.
    fn prepare(
        &mut self,
        request: &BuildRequest,
    ) -> impl Future<Output = Result<(), RunnerError>> + Send;

    /// Starts the build and returns an id `attach` understands.
    fn run(
        &mut self,
        request: &BuildRequest,
    ) -> impl Future<Output = Result<String, RunnerError>> + Send;

    /// Requests termination without waiting for it.
    fn cancel(&mut self, id: &str) -> impl Future<Output = Result<(), RunnerError>> + Send;

    /// Watches the build until it ends or the user detaches.
    fn attach(
        &mut self,
        id: &str,
        request: &BuildRequest,
        signals: &mut Signals,
    ) -> impl Future<Output = Result<Outcome, RunnerError>> + Send;

    /// Releases what the run left behind and reports the exit code.
    fn teardown(
        &mut self,
        outcome: &Outcome,
    ) -> impl Future<Output = Result<i32, RunnerError>> + Send;
}

/// Runs one build on `runner` and returns the process exit code.
pub async fn drive<R: Runner>(
    runner: &mut R,
    request: &BuildRequest,
    signals: &mut Signals,
) -> Result<i32, RunnerError> {
    request.validate(runner.name(), runner.capabilities())?;

    let id = match &request.attach {
        Some(id) => id.clone(),
        None => {
            let prepared = tokio::select! {
                prepared = runner.prepare(request) => Some(prepared?),
                _ = next_interrupt(signals) => None,
            };
            if prepared.is_none() {
                return runner.teardown(&Outcome::Interrupted).await;
            }

            // Once submission starts the job may exist remotely, so it runs to completion
            // and interrupts queue up for `attach`.
            let id = runner.run(request).await?;
            if request.detach {
                return runner.teardown(&Outcome::Detached).await;
            }
            id
        }
    };

    if request.cancel {
        runner.cancel(&id).await?;
    }

    let outcome = runner.attach(&id, request, signals).await?;
    debug!(backend = runner.name(), ?outcome, "Build finished");
    runner.teardown(&outcome).await
}

/// Resolves on the next Ctrl-C. Detach requests are ignored; a closed channel never resolves.
pub async fn next_interrupt(signals: &mut Signals) {
    loop {
        match signals.recv().await {
            Some(Signal::Interrupt) => return,
            Some(Signal::Detach) => continue,
            None => std::future::pending::<()>().await,
        }
    }
}
