//! The remote build facade.

use crate::aws::{AwsBatchApi, CloudWatchLogs};
use crate::controller::JobController;
use crate::tailer::{DEFAULT_LOG_INTERVAL, LogTailer, tail};

use stratus_archive::{ArchiveEntry, Packer, pack_stream, unpack_stream};
use stratus_core::prelude::*;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

enum Watched {
    Finished(Job),
    Detached,
}

/// Runs builds as AWS Batch jobs, mirroring the build directory through an object store.
pub struct AwsBatchRunner<S, C, B = AwsBatchApi, L = CloudWatchLogs> {
    config: AwsBatchConfig,
    controller: JobController<B>,
    logs: L,
    store: S,
    console: C,
    interrupts: InterruptCoordinator,
    retry: RetryPolicy,
    keys: Option<RunKeys>,
    uploaded_at: Option<DateTime<Utc>>,
}

impl<S: ObjectStore, C: Console> AwsBatchRunner<S, C> {
    pub fn from_sdk(
        sdk: &aws_config::SdkConfig,
        config: AwsBatchConfig,
        store: S,
        console: C,
    ) -> Self {
        let batch = AwsBatchApi::new(sdk);
        let logs = CloudWatchLogs::new(sdk, config.log_group.clone());
        Self::new(config, batch, logs, store, console)
    }
}

impl<S, C, B, L> AwsBatchRunner<S, C, B, L>
where
    S: ObjectStore,
    C: Console,
    B: BatchApi,
    L: LogApi,
{
    pub fn new(config: AwsBatchConfig, batch: B, logs: L, store: S, console: C) -> Self {
        Self {
            config,
            controller: JobController::new(batch),
            logs,
            store,
            console,
            interrupts: InterruptCoordinator::default(),
            retry: RetryPolicy::default(),
            keys: None,
            uploaded_at: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.controller = self.controller.with_retry(retry);
        self.retry = retry;
        self
    }

    /// Completion time of the upload made by [`prepare`](Runner::prepare) in this process.
    pub fn uploaded_at(&self) -> Option<DateTime<Utc>> {
        self.uploaded_at
    }

    pub fn keys(&self) -> Option<&RunKeys> {
        self.keys.as_ref()
    }

    fn tailer(&self) -> LogTailer<L> {
        LogTailer::new(self.logs.clone())
            .with_retry(self.retry)
            .with_interval(self.config.poll_interval.min(DEFAULT_LOG_INTERVAL))
    }

    fn reattach_hint(&self, job_id: &str, request: &BuildRequest) {
        self.console.status(&format!(
            "Detached from job {job_id}, which keeps running. Reattach later with:\n\n    stratus build --aws-batch --attach {job_id} {}\n",
            request.build_dir.display()
        ));
    }

    async fn put_bytes(&self, key: &str, body: Vec<u8>) -> Result<(), TransferError> {
        let source = stream::once(async move { Ok::<_, io::Error>(Bytes::from(body)) }).boxed();
        self.store.put_stream(key, source).await
    }

    async fn request_cancel(&mut self, job_id: &str) -> Result<(), RunnerError> {
        self.console
            .status(&format!("Cancelling job {job_id}, waiting for it to stop..."));
        self.controller.terminate(job_id, CANCEL_REASON).await?;
        self.interrupts.mark_cancelling();
        Ok(())
    }

    async fn on_interrupt(&mut self, job: &Job) -> Result<(), RunnerError> {
        match self.interrupts.on_interrupt(job.is_terminal()) {
            InterruptAction::Warn => self.console.warn(&format!(
                "Press Control-C again within {} seconds to cancel job {}, or Control-Z to detach and leave it running.",
                self.interrupts.window().as_secs(),
                job.id
            )),
            InterruptAction::Cancel => self.request_cancel(&job.id).await?,
            InterruptAction::AlreadyCancelling => self.console.status(&format!(
                "Cancellation of job {} already requested, waiting for it to stop...",
                job.id
            )),
            InterruptAction::Exit => {}
        }
        Ok(())
    }

    /// Polls until the job is terminal or the user detaches.
    async fn watch(
        &mut self,
        mut job: Job,
        jobs: &watch::Sender<Option<Job>>,
        signals: &mut Signals,
    ) -> Result<Watched, RunnerError> {
        let mut signals_open = true;

        while !job.is_terminal() {
            tokio::select! {
                _ = sleep(self.config.poll_interval) => {
                    self.interrupts.expire();
                    let next = self.controller.poll(&job.id).await?;
                    if next.state != job.state {
                        self.console.status(&format!("Job {} is {}", next.id, next.state));
                    }
                    jobs.send_replace(Some(next.clone()));
                    job = next;
                }
                signal = signals.recv(), if signals_open => match signal {
                    Some(Signal::Interrupt) => self.on_interrupt(&job).await?,
                    Some(Signal::Detach) => return Ok(Watched::Detached),
                    None => signals_open = false,
                },
            }
        }
        Ok(Watched::Finished(job))
    }

    /// Waits for the log task to drain. `true` if the user interrupted the wait.
    async fn drain_logs(
        &self,
        mut handle: JoinHandle<Result<(), JobError>>,
        stop: &CancellationToken,
        signals: &mut Signals,
    ) -> bool {
        tokio::select! {
            joined = &mut handle => {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => self.console.warn(&format!("Log output is incomplete: {err}")),
                    Err(err) => warn!("Log task failed: {err}"),
                }
                false
            }
            _ = next_interrupt(signals) => {
                stop.cancel();
                true
            }
        }
    }

    fn report(&self, job: &Job, outcome: &Outcome) {
        if self.interrupts.is_cancelling() && *outcome != Outcome::Cancelled {
            self.console.warn(&format!(
                "Job {} finished before the cancellation took effect",
                job.id
            ));
        }
        match outcome {
            Outcome::Succeeded => self.console.status(&format!("Job {} succeeded", job.id)),
            Outcome::Failed { exit_code } => self.console.warn(&format!(
                "Job {} failed: the build exited with status {exit_code}",
                job.id
            )),
            Outcome::Infrastructure(failure) => self.console.warn(&failure.to_string()),
            Outcome::Cancelled => self.console.status(&format!("Job {} was cancelled", job.id)),
            Outcome::Interrupted | Outcome::Detached => {}
        }
    }

    /// Brings modified files back into the build directory.
    /// Returns `Some(Outcome::Interrupted)` if the user interrupted the transfer.
    async fn download(
        &mut self,
        job: &Job,
        request: &BuildRequest,
        signals: &mut Signals,
    ) -> Result<Option<Outcome>, RunnerError> {
        let Some(keys) = self.keys.clone() else {
            self.console.warn(&format!(
                "Job {} does not say where its build directory was stored; not downloading results",
                job.id
            ));
            return Ok(None);
        };

        let since = match self.uploaded_at.or(job.created_at) {
            Some(since) => since,
            None => {
                warn!(job_id = %job.id, "No upload time known, treating every file as modified");
                DateTime::<Utc>::MIN_UTC
            }
        };

        let modified = self
            .store
            .list_modified_since(&keys.namespace, since)
            .await?;
        if !modified.iter().any(|object| object.key == keys.archive) {
            self.console.warn(&format!(
                "Job {} did not upload results to {}; nothing to download",
                job.id,
                keys.archive_url()
            ));
            return Ok(None);
        }

        self.console.status(&format!(
            "Downloading results from {} into {}",
            keys.archive_url(),
            request.build_dir.display()
        ));
        let source = self.store.get_stream(&keys.archive).await?;

        let manifest = Arc::new(Mutex::new(TransferManifest::new(
            since,
            request.download.clone(),
        )));
        let console = self.console.clone();
        let offered = Arc::clone(&manifest);
        let select = move |entry: &ArchiveEntry| {
            if !entry.is_file() {
                return false;
            }
            let wanted = match offered.lock() {
                Ok(mut manifest) => {
                    manifest.offer(ManifestEntry::new(&entry.path, entry.modified_utc()))
                }
                Err(_) => false,
            };
            if wanted {
                console.status(&format!("downloading {}", entry.path));
            }
            wanted
        };

        let cancel = CancellationToken::new();
        let mut unpacking = std::pin::pin!(unpack_stream(
            source,
            request.build_dir.clone(),
            select,
            cancel.clone()
        ));

        tokio::select! {
            unpacked = &mut unpacking => {
                let summary = unpacked?;
                if let Ok(manifest) = manifest.lock() {
                    info!(
                        files = summary.written.len(),
                        modified = manifest.selected().len(),
                        considered = manifest.len(),
                        "Downloaded results"
                    );
                }
                Ok(None)
            }
            _ = next_interrupt(signals) => {
                cancel.cancel();
                let _ = unpacking.await;
                self.console.warn("Download interrupted; the build directory may be incomplete");
                Ok(Some(Outcome::Interrupted))
            }
        }
    }
}

impl<S, C, B, L> Runner for AwsBatchRunner<S, C, B, L>
where
    S: ObjectStore,
    C: Console,
    B: BatchApi,
    L: LogApi,
{
    fn name(&self) -> &'static str {
        "aws-batch"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::REMOTE
    }

    async fn prepare(&mut self, request: &BuildRequest) -> Result<(), RunnerError> {
        self.config.validate()?;
        let keys = RunKeys::generate(&self.config.bucket, &self.config.prefix);

        self.console.status(&format!(
            "Uploading {} to {}",
            request.build_dir.display(),
            keys.archive_url()
        ));
        let console = self.console.clone();
        let packer = Packer::new(&request.build_dir, &request.exclude);
        let source = pack_stream(packer, move |entry| {
            if entry.is_file() {
                console.status(&format!("uploading {}", entry.path));
            }
        });
        self.store.put_stream(&keys.archive, source).await?;

        if !request.environment.is_empty() {
            let overrides: BTreeMap<&str, &str> = request
                .environment
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            let body = serde_json::to_vec(&overrides).map_err(io::Error::other)?;

            self.console.status(&format!(
                "Uploading environment overrides to {}",
                keys.environment_url()
            ));
            self.put_bytes(&keys.environment, body).await?;
        }

        self.uploaded_at = Some(Utc::now());
        debug!(run_id = %keys.run_id, "Build directory uploaded");
        self.keys = Some(keys);
        Ok(())
    }

    async fn run(&mut self, request: &BuildRequest) -> Result<String, RunnerError> {
        let keys = self.keys.clone().ok_or_else(|| {
            RunnerError::Backend("the build directory must be uploaded before submission".into())
        })?;

        let dir_name = request
            .build_dir
            .canonicalize()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_default();

        let mut environment = vec![(env::WORKDIR_URL.to_string(), keys.archive_url())];
        if !request.environment.is_empty() {
            environment.push((env::ENV_URL.to_string(), keys.environment_url()));
        }

        let job_request = JobRequest {
            name: job_name(&dir_name, &keys.run_id),
            definition: self.config.job_definition.clone(),
            queue: self.config.queue.clone(),
            command: request.command.clone(),
            environment,
            resources: request.resources.or(self.config.resources),
        };

        self.console.status(&format!(
            "Submitting job {} to queue {}",
            job_request.name, job_request.queue
        ));
        let console = &self.console;
        let job = self
            .controller
            .submit(&job_request, |job_id| {
                console.status(&format!("Submitted job {job_id} ({})", job_request.name));
            })
            .await?;
        self.console.status(&format!("Job {} is {}", job.id, job.state));

        if request.detach {
            self.reattach_hint(&job.id, request);
        }
        Ok(job.id)
    }

    async fn cancel(&mut self, id: &str) -> Result<(), RunnerError> {
        self.request_cancel(id).await
    }

    async fn attach(
        &mut self,
        id: &str,
        request: &BuildRequest,
        signals: &mut Signals,
    ) -> Result<Outcome, RunnerError> {
        let job = self.controller.poll(id).await?;
        self.console.status(&format!("Job {id} is {}", job.state));

        if self.keys.is_none() {
            self.keys = RunKeys::from_job(&job);
        }

        let (jobs_tx, jobs_rx) = watch::channel(Some(job.clone()));
        let stop = CancellationToken::new();
        let logs = request.logs.then(|| {
            tokio::spawn(tail(
                self.tailer(),
                jobs_rx,
                self.console.clone(),
                stop.clone(),
            ))
        });

        let job = match self.watch(job, &jobs_tx, signals).await {
            Ok(Watched::Finished(job)) => job,
            Ok(Watched::Detached) => {
                stop.cancel();
                if let Some(handle) = logs {
                    let _ = handle.await;
                }
                self.reattach_hint(id, request);
                return Ok(Outcome::Detached);
            }
            Err(err) => {
                stop.cancel();
                return Err(err);
            }
        };

        if let Some(handle) = logs {
            if self.drain_logs(handle, &stop, signals).await {
                return Ok(Outcome::Interrupted);
            }
        }

        let outcome = Outcome::from_job(&job).ok_or_else(|| {
            JobError::Service(format!("job {id} ended without a final state"))
        })?;
        self.report(&job, &outcome);

        if outcome.has_results() && !request.download.is_nothing() {
            if let Some(interrupted) = self.download(&job, request, signals).await? {
                return Ok(interrupted);
            }
        }
        Ok(outcome)
    }

    async fn teardown(&mut self, outcome: &Outcome) -> Result<i32, RunnerError> {
        if let Some(keys) = &self.keys {
            // The job still reads its environment while it runs.
            if *outcome != Outcome::Detached && self.store.exists(&keys.environment).await? {
                if let Err(err) = self.store.delete(&keys.environment).await {
                    self.console.warn(&format!(
                        "Could not delete {}: {err}",
                        keys.environment_url()
                    ));
                }
            }
        }
        Ok(outcome.exit_code())
    }
}
