//! Job lifecycle on top of a [`BatchApi`].

use stratus_core::prelude::*;

use std::time::Duration;
use tracing::{debug, warn};

/// Submits, polls and terminates one job, retrying transient service failures.
///
/// State is never inferred locally: every [`Job`] returned comes from the service. The
/// controller only refuses to go backwards, so a stale read after a newer one is ignored.
#[derive(Debug, Clone)]
pub struct JobController<B> {
    api: B,
    retry: RetryPolicy,
    last: Option<Job>,
}

impl<B: BatchApi> JobController<B> {
    pub fn new(api: B) -> Self {
        Self {
            api,
            retry: RetryPolicy::default(),
            last: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Submits the job and describes it once, so the first state is the service's own.
    ///
    /// `on_submitted` sees the id as soon as the service assigns it, before the describe.
    pub async fn submit(
        &mut self,
        request: &JobRequest,
        on_submitted: impl FnOnce(&str),
    ) -> Result<Job, JobError> {
        let job_id = retrying(self.retry, "submit", || self.api.submit(request)).await?;
        debug!(job_id, name = %request.name, queue = %request.queue, "Submitted job");
        on_submitted(&job_id);
        self.poll(&job_id).await
    }

    /// One status query. Reports the current state, whatever it is.
    pub async fn poll(&mut self, job_id: &str) -> Result<Job, JobError> {
        let job = retrying(self.retry, "describe", || self.api.describe(job_id)).await?;

        if let Some(last) = self.last.as_ref().filter(|last| last.id == job.id) {
            if job.state < last.state {
                debug!(
                    job_id,
                    reported = %job.state,
                    known = %last.state,
                    "Ignoring stale job state"
                );
                return Ok(last.clone());
            }
        }

        self.last = Some(job.clone());
        Ok(job)
    }

    /// Requests termination and returns without waiting for the job to stop.
    pub async fn terminate(&mut self, job_id: &str, reason: &str) -> Result<(), JobError> {
        retrying(self.retry, "terminate", || self.api.terminate(job_id, reason)).await?;
        debug!(job_id, reason, "Requested job termination");
        Ok(())
    }
}

async fn retrying<T, F, Fut>(policy: RetryPolicy, operation: &str, mut call: F) -> Result<T, JobError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, JobError>>,
{
    retry_with_backoff(
        policy,
        |_| call(),
        |attempt, delay: Duration, err| {
            warn!(operation, attempt, ?delay, "Retrying batch request: {err}");
        },
        |err| {
            if err.is_transient() {
                RetryDisposition::Retry
            } else {
                RetryDisposition::Abort
            }
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Scripted {
        describes: Arc<Mutex<VecDeque<Result<Job, JobError>>>>,
        terminated: Arc<Mutex<Vec<String>>>,
    }

    impl Scripted {
        fn with(items: Vec<Result<Job, JobError>>) -> Self {
            Self {
                describes: Arc::new(Mutex::new(items.into())),
                ..Default::default()
            }
        }
    }

    impl BatchApi for Scripted {
        async fn submit(&self, _: &JobRequest) -> Result<String, JobError> {
            Ok("job-1".into())
        }

        async fn describe(&self, job_id: &str) -> Result<Job, JobError> {
            self.describes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(JobError::NotFound(job_id.into())))
        }

        async fn terminate(&self, job_id: &str, _: &str) -> Result<(), JobError> {
            self.terminated.lock().unwrap().push(job_id.into());
            Ok(())
        }
    }

    #[tokio::test]
    async fn submit_reports_the_first_described_state() {
        let api = Scripted::with(vec![Ok(Job::new("job-1", JobState::Runnable))]);
        let mut controller = JobController::new(api);

        let mut announced = None;
        let job = controller
            .submit(&JobRequest::default(), |id| announced = Some(id.to_string()))
            .await
            .unwrap();

        assert_eq!(job.state, JobState::Runnable);
        assert_eq!(announced.as_deref(), Some("job-1"));
    }

    #[tokio::test]
    async fn submitted_id_is_known_even_if_describe_fails() {
        let api = Scripted::with(vec![Err(JobError::Service("describe failed".into()))]);
        let mut controller = JobController::new(api);

        let mut announced = None;
        let result = controller
            .submit(&JobRequest::default(), |id| announced = Some(id.to_string()))
            .await;

        assert!(result.is_err());
        assert_eq!(announced.as_deref(), Some("job-1"));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let api = Scripted::with(vec![
            Err(JobError::Transient("throttled".into())),
            Err(JobError::Transient("connection reset".into())),
            Ok(Job::new("job-1", JobState::Running)),
        ]);
        let mut controller = JobController::new(api).with_retry(RetryPolicy::immediate(5));

        assert_eq!(controller.poll("job-1").await.unwrap().state, JobState::Running);
    }

    #[tokio::test]
    async fn service_errors_are_not_retried() {
        let api = Scripted::with(vec![
            Err(JobError::Service("bad".into())),
            Ok(Job::new("job-1", JobState::Running)),
        ]);
        let mut controller = JobController::new(api).with_retry(RetryPolicy::immediate(5));

        assert!(matches!(
            controller.poll("job-1").await,
            Err(JobError::Service(_))
        ));
    }

    #[tokio::test]
    async fn stale_reads_never_move_the_job_backwards() {
        let api = Scripted::with(vec![
            Ok(Job::new("job-1", JobState::Running)),
            Ok(Job::new("job-1", JobState::Runnable)),
            Ok(Job::new("job-1", JobState::Succeeded)),
        ]);
        let mut controller = JobController::new(api);

        let states = [
            controller.poll("job-1").await.unwrap().state,
            controller.poll("job-1").await.unwrap().state,
            controller.poll("job-1").await.unwrap().state,
        ];
        assert_eq!(
            states,
            [JobState::Running, JobState::Running, JobState::Succeeded]
        );
    }

    #[tokio::test]
    async fn terminate_does_not_wait_for_the_job() {
        let api = Scripted::default();
        let mut controller = JobController::new(api.clone());

        controller.terminate("job-1", CANCEL_REASON).await.unwrap();

        assert_eq!(*api.terminated.lock().unwrap(), ["job-1"]);
    }
}
