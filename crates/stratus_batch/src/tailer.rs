//! Incremental job log output.

use stratus_core::prelude::*;

use futures::stream::{self, Stream};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(2);

/// Times [`tail`] starts over from the last cursor after a failed fetch.
const RECONNECTS: usize = 3;

/// Follows one job's log stream from a cursor.
///
/// The cursor only moves past lines that were returned, so a tailer rebuilt with
/// [`resume`](Self::resume) neither repeats nor skips output.
#[derive(Debug, Clone)]
pub struct LogTailer<L> {
    api: L,
    retry: RetryPolicy,
    interval: Duration,
    stream: Option<String>,
    cursor: Option<String>,
    caught_up: bool,
}

impl<L: LogApi> LogTailer<L> {
    pub fn new(api: L) -> Self {
        Self {
            api,
            retry: RetryPolicy::default(),
            interval: DEFAULT_LOG_INTERVAL,
            stream: None,
            cursor: None,
            caught_up: false,
        }
    }

    /// Continues a previous tail of `stream` after `cursor`.
    pub fn resume(mut self, stream: impl Into<String>, cursor: Option<String>) -> Self {
        self.stream = Some(stream.into());
        self.cursor = cursor;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Whether the last fetch reached the end of the stored log.
    ///
    /// Pages may come back empty while more events follow; the end is only known once
    /// the store hands back the cursor it was given.
    pub fn is_caught_up(&self) -> bool {
        self.caught_up
    }

    /// A fresh tailer positioned where this one stopped.
    fn reconnected(&self) -> Self {
        let fresh = Self::new(self.api.clone())
            .with_retry(self.retry)
            .with_interval(self.interval);
        match &self.stream {
            Some(stream) => fresh.resume(stream.clone(), self.cursor.clone()),
            None => fresh,
        }
    }

    /// Fetches the page after the cursor and advances past it.
    /// Returns nothing until a log stream is known.
    pub async fn fetch(&mut self) -> Result<Vec<LogLine>, JobError> {
        let Some(stream) = self.stream.as_deref() else {
            return Ok(Vec::new());
        };
        let cursor = self.cursor.as_deref();

        let page = retry_with_backoff(
            self.retry,
            |_| self.api.fetch(stream, cursor),
            |attempt, delay, err| warn!(stream, attempt, ?delay, "Retrying log fetch: {err}"),
            |err| {
                if err.is_transient() {
                    RetryDisposition::Retry
                } else {
                    RetryDisposition::Abort
                }
            },
        )
        .await?;

        let caught_up = page.next_cursor.is_none() || page.next_cursor.as_deref() == cursor;
        self.caught_up = caught_up;
        if page.next_cursor.is_some() {
            self.cursor = page.next_cursor;
        }
        Ok(page.lines)
    }

    /// Lines in the order the log store recorded them.
    ///
    /// Follows the job snapshots published on `jobs`: the log stream is picked up once the job
    /// reports one, and the sequence ends once the job is terminal and the log is drained.
    pub fn lines(
        self,
        jobs: watch::Receiver<Option<Job>>,
    ) -> impl Stream<Item = Result<LogLine, JobError>> + Send {
        let state = TailState::new(self, jobs);

        stream::unfold(state, |mut state| async move {
            let item = state.next().await?;
            Some((item, state))
        })
    }
}

struct TailState<L> {
    tailer: LogTailer<L>,
    jobs: watch::Receiver<Option<Job>>,
    buffer: VecDeque<LogLine>,
    finished: bool,
}

impl<L: LogApi> TailState<L> {
    fn new(tailer: LogTailer<L>, jobs: watch::Receiver<Option<Job>>) -> Self {
        Self {
            tailer,
            jobs,
            buffer: VecDeque::new(),
            finished: false,
        }
    }

    async fn next(&mut self) -> Option<Result<LogLine, JobError>> {
        loop {
            if let Some(line) = self.buffer.pop_front() {
                return Some(Ok(line));
            }
            if self.finished {
                return None;
            }

            let (terminal, log_stream) = match &*self.jobs.borrow() {
                Some(job) => (job.is_terminal(), job.log_stream.clone()),
                None => (false, None),
            };

            if self.tailer.stream.is_none() {
                self.tailer.stream = log_stream;
                if self.tailer.stream.is_none() {
                    if terminal {
                        debug!("Job finished without a log stream");
                        return None;
                    }
                    self.wait().await;
                    continue;
                }
            }

            match self.tailer.fetch().await {
                Ok(lines) => {
                    let empty = lines.is_empty();
                    self.buffer.extend(lines);
                    if self.tailer.is_caught_up() {
                        // Terminal was observed before this fetch, so nothing can follow it.
                        if terminal {
                            self.finished = true;
                        } else if empty {
                            self.wait().await;
                        }
                    }
                }
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            }
        }
    }

    /// Starts over from the current cursor after a failed fetch.
    fn reconnect(&mut self) {
        self.tailer = self.tailer.reconnected();
        self.finished = false;
    }
}

impl<L> TailState<L> {
    /// Sleeps one interval, waking early if a new job snapshot arrives.
    async fn wait(&mut self) {
        let interval = self.tailer.interval;
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = self.jobs.changed() => {
                if changed.is_err() {
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }
}

/// Prints the job's log through `console` until it is drained or `stop` fires.
///
/// A fetch that still fails after the tailer's own retries is followed by a reconnect
/// from the last cursor, so nothing is printed twice.
pub async fn tail<L: LogApi, C: Console>(
    tailer: LogTailer<L>,
    jobs: watch::Receiver<Option<Job>>,
    console: C,
    stop: CancellationToken,
) -> Result<(), JobError> {
    let mut state = TailState::new(tailer, jobs);
    let mut reconnects = 0;

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return Ok(()),
            next = state.next() => match next {
                Some(Ok(line)) => console.log_line(&line),
                Some(Err(err)) if reconnects < RECONNECTS => {
                    reconnects += 1;
                    warn!(
                        cursor = state.tailer.cursor(),
                        reconnects,
                        "Reconnecting to the job log: {err}"
                    );
                    state.reconnect();
                }
                Some(Err(err)) => return Err(err),
                None => return Ok(()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use futures::StreamExt;
    use std::sync::{Arc, Mutex};

    /// Serves one line per page; the cursor is the index of the next line.
    #[derive(Clone, Default)]
    struct PagedLogs {
        lines: Arc<Mutex<Vec<LogLine>>>,
        cursors: Arc<Mutex<Vec<Option<String>>>>,
    }

    impl PagedLogs {
        fn append(&self, message: &str) {
            let mut lines = self.lines.lock().unwrap();
            let at = Utc.timestamp_opt(1_700_000_000 + lines.len() as i64, 0).unwrap();
            lines.push(LogLine::new(at, message));
        }
    }

    impl LogApi for PagedLogs {
        async fn fetch(&self, _: &str, cursor: Option<&str>) -> Result<LogPage, JobError> {
            self.cursors.lock().unwrap().push(cursor.map(String::from));
            let from: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
            let lines = self.lines.lock().unwrap();
            let page: Vec<LogLine> = lines.iter().skip(from).take(1).cloned().collect();
            Ok(LogPage {
                next_cursor: Some((from + page.len()).to_string()),
                lines: page,
            })
        }
    }

    /// Serves fixed pages in order; the cursor is the index of the next page.
    /// Once past the last page the cursor given is handed back.
    #[derive(Clone, Default)]
    struct FixedPages {
        pages: Vec<Vec<&'static str>>,
        failures: Arc<Mutex<usize>>,
    }

    impl LogApi for FixedPages {
        async fn fetch(&self, _: &str, cursor: Option<&str>) -> Result<LogPage, JobError> {
            {
                let mut failures = self.failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(JobError::Service("connection closed".into()));
                }
            }
            let from: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
            let Some(page) = self.pages.get(from) else {
                return Ok(LogPage {
                    lines: Vec::new(),
                    next_cursor: cursor.map(String::from),
                });
            };
            let at = Utc.timestamp_opt(1_700_000_000 + from as i64, 0).unwrap();
            Ok(LogPage {
                lines: page.iter().map(|m| LogLine::new(at, *m)).collect(),
                next_cursor: Some((from + 1).to_string()),
            })
        }
    }

    fn running() -> Job {
        Job::new("job-1", JobState::Running).with_log_stream("stream-1")
    }

    #[tokio::test]
    async fn a_finished_job_replays_its_whole_log() {
        let logs = PagedLogs::default();
        for m in ["a", "b", "c"] {
            logs.append(m);
        }
        let job = Job::new("job-1", JobState::Succeeded).with_log_stream("stream-1");
        let (_tx, rx) = watch::channel(Some(job));

        let lines: Vec<String> = LogTailer::new(logs)
            .lines(rx)
            .map(|l| l.unwrap().message)
            .collect()
            .await;

        assert_eq!(lines, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn empty_pages_in_the_middle_do_not_end_a_replay() {
        let logs = FixedPages {
            pages: vec![vec!["step1 done"], vec![], vec![], vec!["step2 done"]],
            ..Default::default()
        };
        let job = Job::new("job-1", JobState::Succeeded).with_log_stream("stream-1");
        let (_tx, rx) = watch::channel(Some(job));

        let lines: Vec<String> = LogTailer::new(logs)
            .lines(rx)
            .map(|l| l.unwrap().message)
            .collect()
            .await;

        assert_eq!(lines, ["step1 done", "step2 done"]);
    }

    #[tokio::test]
    async fn tail_reconnects_from_the_last_cursor() {
        let logs = FixedPages {
            pages: vec![vec!["a"], vec!["b"]],
            failures: Arc::new(Mutex::new(1)),
        };
        let job = Job::new("job-1", JobState::Succeeded).with_log_stream("stream-1");
        let (_tx, rx) = watch::channel(Some(job));
        let console = stratus_core::testing::RecordingConsole::default();

        let tailer = LogTailer::new(logs).with_retry(RetryPolicy::immediate(1));
        tail(tailer, rx, console.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            console.log_lines(),
            [
                "[2023-11-14T22:13:20.000Z] a",
                "[2023-11-14T22:13:21.000Z] b"
            ]
        );
    }

    #[tokio::test]
    async fn tail_gives_up_on_a_log_that_keeps_failing() {
        let logs = FixedPages {
            pages: vec![vec!["a"]],
            failures: Arc::new(Mutex::new(RECONNECTS + 1)),
        };
        let (_tx, rx) = watch::channel(Some(running()));
        let console = stratus_core::testing::RecordingConsole::default();

        let tailer = LogTailer::new(logs).with_retry(RetryPolicy::immediate(1));
        let result = tail(tailer, rx, console.clone(), CancellationToken::new()).await;

        assert!(matches!(result, Err(JobError::Service(_))));
        assert!(console.log_lines().is_empty());
    }

    #[tokio::test]
    async fn output_written_before_termination_is_drained() {
        let logs = PagedLogs::default();
        logs.append("step1 done");
        let (tx, rx) = watch::channel(Some(running()));
        let tailer = LogTailer::new(logs.clone()).with_interval(Duration::from_millis(1));
        let mut lines = std::pin::pin!(tailer.lines(rx));

        assert_eq!(lines.next().await.unwrap().unwrap().message, "step1 done");
        logs.append("step2 done");
        tx.send_replace(Some(
            Job::new("job-1", JobState::Succeeded).with_log_stream("stream-1"),
        ));

        assert_eq!(lines.next().await.unwrap().unwrap().message, "step2 done");
        assert!(lines.next().await.is_none());
    }

    #[tokio::test]
    async fn resumed_tailers_continue_after_the_cursor() {
        let logs = PagedLogs::default();
        for m in ["a", "b", "c"] {
            logs.append(m);
        }
        let mut first = LogTailer::new(logs.clone()).resume("stream-1", None);
        assert_eq!(first.fetch().await.unwrap()[0].message, "a");

        let mut second =
            LogTailer::new(logs.clone()).resume("stream-1", first.cursor().map(String::from));
        assert_eq!(second.fetch().await.unwrap()[0].message, "b");
        assert_eq!(
            logs.cursors.lock().unwrap().last().cloned().flatten().as_deref(),
            Some("1")
        );
    }

    #[tokio::test]
    async fn the_stream_is_picked_up_once_the_job_reports_it() {
        let logs = PagedLogs::default();
        logs.append("hello");
        let (tx, rx) = watch::channel(Some(Job::new("job-1", JobState::Runnable)));
        let tailer = LogTailer::new(logs).with_interval(Duration::from_millis(1));

        let collect = tokio::spawn(async move {
            tailer
                .lines(rx)
                .map(|l| l.unwrap().message)
                .collect::<Vec<_>>()
                .await
        });
        tx.send_replace(Some(running()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send_replace(Some(
            Job::new("job-1", JobState::Succeeded).with_log_stream("stream-1"),
        ));

        assert_eq!(collect.await.unwrap(), ["hello"]);
    }

    #[tokio::test]
    async fn jobs_that_never_logged_end_quietly() {
        let (_tx, rx) = watch::channel(Some(Job::new("job-1", JobState::Failed)));
        let lines: Vec<_> = LogTailer::new(PagedLogs::default()).lines(rx).collect().await;
        assert!(lines.is_empty());
    }

    #[tokio::test]
    async fn tail_stops_when_asked() {
        let (_tx, rx) = watch::channel(Some(running()));
        let stop = CancellationToken::new();
        stop.cancel();
        let console = stratus_core::testing::RecordingConsole::default();

        let tailer = LogTailer::new(PagedLogs::default()).with_interval(Duration::from_millis(1));
        tail(tailer, rx, console.clone(), stop).await.unwrap();

        assert!(console.log_lines().is_empty());
    }
}
