//! The `ambient` backend: the build command runs as a plain child process.

use stratus_core::prelude::*;

use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tracing::debug;

/// Runs the build command in the build directory with the invoking user's own tools.
pub struct AmbientRunner<C> {
    console: C,
    child: Option<Child>,
}

impl<C: Console> AmbientRunner<C> {
    pub fn new(console: C) -> Self {
        Self {
            console,
            child: None,
        }
    }
}

impl<C: Console> Runner for AmbientRunner<C> {
    fn name(&self) -> &'static str {
        BackendKind::Ambient.as_str()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::LOCAL
    }

    async fn prepare(&mut self, request: &BuildRequest) -> Result<(), RunnerError> {
        if request.command.is_empty() {
            return Err(UsageError::Conflict("no build command given".into()).into());
        }
        Ok(())
    }

    async fn run(&mut self, request: &BuildRequest) -> Result<String, RunnerError> {
        let (program, args) = request
            .command
            .split_first()
            .ok_or_else(|| UsageError::Conflict("no build command given".into()))?;

        let output = || {
            if request.logs {
                Stdio::inherit()
            } else {
                Stdio::null()
            }
        };

        self.console.status(&format!(
            "Running {} in {}",
            request.command.join(" "),
            request.build_dir.display()
        ));
        let child = Command::new(program)
            .args(args)
            .current_dir(&request.build_dir)
            .envs(request.environment.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(output())
            .stderr(output())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunnerError::Backend(format!("Failed to start {program}: {e}")))?;

        let id = child.id().map(|pid| pid.to_string()).unwrap_or_default();
        debug!(pid = %id, "Spawned build process");
        self.child = Some(child);
        Ok(id)
    }

    async fn cancel(&mut self, _: &str) -> Result<(), RunnerError> {
        if let Some(child) = self.child.as_mut() {
            child.start_kill()?;
        }
        Ok(())
    }

    async fn attach(
        &mut self,
        id: &str,
        _: &BuildRequest,
        signals: &mut Signals,
    ) -> Result<Outcome, RunnerError> {
        let Some(child) = self.child.as_mut() else {
            return Err(RunnerError::Backend(format!("process {id} is not running")));
        };

        // The child shares the terminal, so it receives Ctrl-C itself.
        let mut interrupted = false;
        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                _ = next_interrupt(signals), if !interrupted => interrupted = true,
            }
        };

        if interrupted {
            return Ok(Outcome::Interrupted);
        }
        Ok(outcome_of(status))
    }

    async fn teardown(&mut self, outcome: &Outcome) -> Result<i32, RunnerError> {
        self.child = None;
        Ok(outcome.exit_code())
    }
}

fn outcome_of(status: ExitStatus) -> Outcome {
    match status.code() {
        Some(0) => Outcome::Succeeded,
        Some(code) => Outcome::Failed { exit_code: code },
        // Killed by a signal.
        None => Outcome::Failed {
            exit_code: exit_codes::FAILURE,
        },
    }
}
