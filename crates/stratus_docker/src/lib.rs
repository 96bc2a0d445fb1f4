use stratus_core::prelude::*;

use bollard::Docker;
use bollard::config::ContainerCreateBody;
use bollard::container::LogOutput as DockerLogOutput;
use bollard::errors::Error as DockerError;
use bollard::models::HostConfig;
use bollard::query_parameters::{CreateContainerOptions, LogsOptions, RemoveContainerOptions};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::path::Path;
use tracing::{debug, warn};

/// Where the build directory is mounted inside the container.
pub const MOUNT_POINT: &str = "/build";

/// Runs the build in a local container with the build directory bind-mounted.
///
/// The build happens in place, so there is nothing to upload or download and the
/// container is supervised only for as long as this process lives.
#[derive(Clone)]
pub struct DockerRunner<C> {
    client: Docker,
    config: DockerConfig,
    console: C,
    container: Option<String>,
}

impl<C: Console> DockerRunner<C> {
    /// Connects to the local Docker socket (defaults to /var/run/docker.sock on Linux)
    pub fn connect_local(config: DockerConfig, console: C) -> Result<Self, RunnerError> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| RunnerError::Backend(format!("Failed to connect to Docker: {e}")))?;
        Ok(Self::new(client, config, console))
    }

    pub fn new(client: Docker, config: DockerConfig, console: C) -> Self {
        Self {
            client,
            config,
            console,
            container: None,
        }
    }

    async fn stop(&self, name: &str) {
        self.console
            .status(&format!("Stopping container {name}, waiting for it to exit..."));
        if let Err(err) = self.client.stop_container(name, None).await {
            warn!(container = name, "Failed to stop container: {err}");
        }
    }
}

impl<C: Console> Runner for DockerRunner<C> {
    fn name(&self) -> &'static str {
        BackendKind::Docker.as_str()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::LOCAL
    }

    async fn prepare(&mut self, _: &BuildRequest) -> Result<(), RunnerError> {
        self.config.validate()?;
        self.client
            .version()
            .await
            .map_err(|e| RunnerError::Backend(format!("Docker unavailable: {e}")))?;

        self.client
            .inspect_image(&self.config.image)
            .await
            .map_err(|e| {
                RunnerError::Backend(format!(
                    "image {} is not available locally ({e}); pull it with `docker pull {}`",
                    self.config.image, self.config.image
                ))
            })?;
        Ok(())
    }

    async fn run(&mut self, request: &BuildRequest) -> Result<String, RunnerError> {
        let name = format!("stratus-build-{}", uuid::Uuid::new_v4());
        let build_dir = request.build_dir.canonicalize()?;

        let env: Vec<String> = request
            .environment
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let options = CreateContainerOptions {
            name: name.clone().into(),
            ..Default::default()
        };

        let body = ContainerCreateBody {
            image: Some(self.config.image.clone()),
            cmd: Some(request.command.clone()),
            env: Some(env),
            working_dir: Some(MOUNT_POINT.to_string()),
            host_config: Some(HostConfig {
                binds: Some(vec![bind_mount(&build_dir)]),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.client
            .create_container(Some(options), body)
            .await
            .map_err(|e| RunnerError::Backend(format!("Failed to create container: {e}")))?;
        self.container = Some(name.clone());

        self.client
            .start_container(name.as_str(), None)
            .await
            .map_err(|e| RunnerError::Backend(format!("Failed to start: {e}")))?;

        self.console.status(&format!(
            "Running {} in container {name} ({})",
            request.command.join(" "),
            self.config.image
        ));
        Ok(name)
    }

    async fn cancel(&mut self, id: &str) -> Result<(), RunnerError> {
        self.stop(id).await;
        Ok(())
    }

    async fn attach(
        &mut self,
        id: &str,
        request: &BuildRequest,
        signals: &mut Signals,
    ) -> Result<Outcome, RunnerError> {
        let logs = request.logs.then(|| {
            let options = LogsOptions {
                follow: true,
                stdout: true,
                stderr: true,
                timestamps: true,
                tail: "all".to_string(),
                ..Default::default()
            };
            let mut stream = self.client.logs(id, Some(options)).boxed();
            let console = self.console.clone();

            tokio::spawn(async move {
                while let Some(output) = stream.next().await {
                    match output {
                        Ok(output) => {
                            for line in log_lines(output) {
                                console.log_line(&line);
                            }
                        }
                        Err(err) => {
                            warn!("Container log stream ended: {err}");
                            break;
                        }
                    }
                }
            })
        });

        let mut wait = self.client.wait_container(id, None).boxed();
        let mut interrupted = false;

        let exited = loop {
            tokio::select! {
                next = wait.next() => break next,
                _ = next_interrupt(signals), if !interrupted => {
                    interrupted = true;
                    self.stop(id).await;
                }
            }
        };

        if let Some(handle) = logs {
            let _ = handle.await;
        }

        let outcome = match exited {
            Some(result) => exit_outcome(result.map(|r| r.status_code))?,
            None => {
                return Err(RunnerError::Backend(format!(
                    "container {id} disappeared before reporting an exit status"
                )));
            }
        };
        debug!(container = id, ?outcome, "Container exited");

        if interrupted {
            return Ok(Outcome::Interrupted);
        }
        Ok(outcome)
    }

    async fn teardown(&mut self, outcome: &Outcome) -> Result<i32, RunnerError> {
        if let Some(name) = self.container.take() {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(err) = self.client.remove_container(&name, Some(options)).await {
                self.console
                    .warn(&format!("Could not remove container {name}: {err}"));
            }
        }
        Ok(outcome.exit_code())
    }
}

/// `host:container` bind specification for the build directory.
fn bind_mount(build_dir: &Path) -> String {
    format!("{}:{MOUNT_POINT}", build_dir.display())
}

/// Maps the result of waiting on a container to an outcome.
/// Docker reports non-zero exits as an error carrying the code.
fn exit_outcome(status: Result<i64, DockerError>) -> Result<Outcome, RunnerError> {
    let code = match status {
        Ok(code) => code,
        Err(DockerError::DockerContainerWaitError { code, .. }) => code,
        Err(err) => return Err(RunnerError::Backend(format!("Failed to wait: {err}"))),
    };

    Ok(match i32::try_from(code) {
        Ok(0) => Outcome::Succeeded,
        Ok(code) => Outcome::Failed { exit_code: code },
        Err(_) => Outcome::Failed {
            exit_code: exit_codes::FAILURE,
        },
    })
}

/// Splits one chunk of container output into timestamped lines.
fn log_lines(output: DockerLogOutput) -> Vec<LogLine> {
    let bytes = match output {
        DockerLogOutput::StdOut { message }
        | DockerLogOutput::StdErr { message }
        | DockerLogOutput::Console { message }
        | DockerLogOutput::StdIn { message } => message,
    };

    String::from_utf8_lossy(&bytes)
        .lines()
        .map(|line| {
            let parsed = line.split_once(' ').and_then(|(ts, msg)| {
                DateTime::parse_from_rfc3339(ts)
                    .ok()
                    .map(|t| (t.with_timezone(&Utc), msg))
            });
            match parsed {
                Some((timestamp, msg)) => LogLine::new(timestamp, msg),
                None => LogLine::new(Utc::now(), line),
            }
        })
        .collect()
}
