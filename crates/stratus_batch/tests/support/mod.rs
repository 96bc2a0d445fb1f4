#![allow(dead_code)]

use stratus_archive::{Packer, unpack};
use stratus_batch::AwsBatchRunner;
use stratus_core::prelude::*;
use stratus_core::testing::{EventLog, MemoryStore, RecordingConsole};

use chrono::{TimeZone, Utc};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

pub type TestRunner = AwsBatchRunner<MemoryStore, RecordingConsole, FakeBatch, FakeLogs>;

pub const BUCKET: &str = "test-bucket";

#[derive(Default)]
struct BatchState {
    script: VecDeque<Job>,
    current: Option<Job>,
    submits: Vec<JobRequest>,
    terminates: usize,
    reject: Option<String>,
    results: Vec<(String, String)>,
    ran: bool,
    describe_delay: Option<Duration>,
}

/// A batch service that plays back job snapshots one describe at a time.
///
/// When the job reaches a final state, it "runs": the uploaded archive is unpacked,
/// the configured result files are written and the archive is stored again.
#[derive(Clone)]
pub struct FakeBatch {
    state: Arc<Mutex<BatchState>>,
    store: MemoryStore,
}

impl FakeBatch {
    pub fn new(store: MemoryStore, script: Vec<Job>) -> Self {
        Self {
            state: Arc::new(Mutex::new(BatchState {
                script: script.into(),
                ..Default::default()
            })),
            store,
        }
    }

    /// The job writes `contents` to `path` in its build directory.
    pub fn produce(&self, path: &str, contents: &str) {
        self.state
            .lock()
            .unwrap()
            .results
            .push((path.into(), contents.into()));
    }

    /// The first describe after this call takes `delay` to answer.
    pub fn slow_describe(&self, delay: Duration) {
        self.state.lock().unwrap().describe_delay = Some(delay);
    }

    pub fn reject_submissions(&self, message: &str) {
        self.state.lock().unwrap().reject = Some(message.into());
    }

    pub fn submits(&self) -> Vec<JobRequest> {
        self.state.lock().unwrap().submits.clone()
    }

    pub fn terminates(&self) -> usize {
        self.state.lock().unwrap().terminates
    }

    fn run_job(&self, job: &Job, results: &[(String, String)]) {
        let Some((_, key)) = job
            .environment
            .get(env::WORKDIR_URL)
            .and_then(|url| parse_s3_url(url))
        else {
            return;
        };
        let Some(archive) = self.store.object(key) else {
            return;
        };

        let workdir = tempfile::tempdir().unwrap();
        unpack(&archive[..], workdir.path(), |_| true).unwrap();
        for (path, contents) in results {
            let path = workdir.path().join(path);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, contents).unwrap();
        }

        let mut repacked = Vec::new();
        Packer::new(workdir.path(), &PatternSet::default())
            .write_to(&mut repacked, |_| {})
            .unwrap();
        self.store.insert(key, repacked, Utc::now());
    }
}

impl BatchApi for FakeBatch {
    async fn submit(&self, req: &JobRequest) -> Result<String, JobError> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = &state.reject {
            return Err(JobError::Submission(message.clone()));
        }
        state.submits.push(req.clone());
        Ok("job-1".into())
    }

    async fn describe(&self, job_id: &str) -> Result<Job, JobError> {
        let delay = self.state.lock().unwrap().describe_delay.take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let (job, results) = {
            let mut state = self.state.lock().unwrap();
            if let Some(next) = state.script.pop_front() {
                state.current = Some(next);
            }
            let mut job = state
                .current
                .clone()
                .ok_or_else(|| JobError::NotFound(job_id.into()))?;
            job.id = job_id.into();
            if let Some(submitted) = state.submits.last() {
                job.environment = submitted.environment.iter().cloned().collect();
            }
            if state.terminates > 0 && !job.is_terminal() {
                job = Job::new(job_id, JobState::Failed).with_status_reason(CANCEL_REASON);
                state.script.clear();
                state.current = Some(job.clone());
            }

            let runs = job.is_terminal() && job.exit_code.is_some() && !state.ran;
            if runs {
                state.ran = true;
            }
            (job, runs.then(|| state.results.clone()))
        };

        if let Some(results) = results {
            self.run_job(&job, &results);
        }
        Ok(job)
    }

    async fn terminate(&self, _: &str, _: &str) -> Result<(), JobError> {
        self.state.lock().unwrap().terminates += 1;
        Ok(())
    }
}

/// A log store serving fixed pages. The cursor is the index of the next page; past the
/// last page the cursor given is handed back, the way CloudWatch marks the end.
#[derive(Clone, Default)]
pub struct FakeLogs {
    pages: Arc<Vec<Vec<LogLine>>>,
}

impl FakeLogs {
    /// One line per page.
    pub fn with_lines(messages: &[&str]) -> Self {
        let pages: Vec<Vec<&str>> = messages.iter().map(|m| vec![*m]).collect();
        Self::with_pages(&pages)
    }

    /// Pages as given; an empty page still moves the cursor.
    pub fn with_pages(pages: &[Vec<&str>]) -> Self {
        let mut n = 0;
        let pages = pages
            .iter()
            .map(|page| {
                page.iter()
                    .map(|message| {
                        let at = Utc.timestamp_opt(1_700_000_000 + n, 0).single().unwrap();
                        n += 1;
                        LogLine::new(at, *message)
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        Self {
            pages: Arc::new(pages),
        }
    }
}

impl LogApi for FakeLogs {
    async fn fetch(&self, _: &str, cursor: Option<&str>) -> Result<LogPage, JobError> {
        let from: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        Ok(match self.pages.get(from) {
            Some(page) => LogPage {
                lines: page.clone(),
                next_cursor: Some((from + 1).to_string()),
            },
            None => LogPage {
                lines: Vec::new(),
                next_cursor: Some(from.to_string()),
            },
        })
    }
}

pub fn config() -> AwsBatchConfig {
    AwsBatchConfig {
        bucket: BUCKET.into(),
        prefix: "runs/".into(),
        poll_interval: Duration::from_millis(1),
        ..Default::default()
    }
}

pub fn job(state: JobState) -> Job {
    Job::new("job-1", state).with_log_stream("stratus-job/default/abc")
}

/// A small pipeline checkout.
pub fn build_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "Snakefile", "rule all:\n    input: 'results/tree.nwk'\n");
    write(dir.path(), "data/input.tsv", "strain\tdate\n");
    dir
}

pub fn write(root: &Path, path: &str, contents: &str) {
    let path = root.join(path);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

/// Sends `signals` once the job has been submitted, so they reach the watch loop
/// instead of interrupting the upload.
pub fn signal_after_submit(batch: &FakeBatch, tx: UnboundedSender<Signal>, signals: Vec<Signal>) {
    let batch = batch.clone();
    tokio::spawn(async move {
        while batch.submits().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        for signal in signals {
            let _ = tx.send(signal);
        }
    });
}

pub struct Harness {
    pub events: EventLog,
    pub store: MemoryStore,
    pub console: RecordingConsole,
    pub batch: FakeBatch,
}

impl Harness {
    pub fn new(script: Vec<Job>) -> Self {
        let events = EventLog::default();
        let store = MemoryStore::new(events.clone());
        Self {
            console: RecordingConsole::new(events.clone()),
            batch: FakeBatch::new(store.clone(), script),
            store,
            events,
        }
    }

    pub fn runner(&self, logs: FakeLogs) -> TestRunner {
        AwsBatchRunner::new(
            config(),
            self.batch.clone(),
            logs,
            self.store.clone(),
            self.console.clone(),
        )
        .with_retry(RetryPolicy::immediate(3))
    }
}
