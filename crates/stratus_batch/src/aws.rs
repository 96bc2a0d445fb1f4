//! AWS Batch and CloudWatch Logs adapters.

use stratus_core::prelude::*;

use aws_sdk_batch::Client as BatchClient;
use aws_sdk_batch::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_batch::types::{
    ContainerOverrides, JobDetail, KeyValuePair, ResourceRequirement, ResourceType,
};
use aws_sdk_cloudwatchlogs::Client as LogsClient;
use chrono::{TimeZone, Utc};
use tracing::debug;

#[derive(Clone, Debug)]
pub struct AwsBatchApi {
    client: BatchClient,
}

impl AwsBatchApi {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: BatchClient::new(config),
        }
    }

    pub fn from_client(client: BatchClient) -> Self {
        Self { client }
    }
}

/// Network trouble, throttling and 5xx responses are worth retrying.
fn is_transient<E>(err: &SdkError<E>) -> bool {
    match err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(context) => {
            let status = context.raw().status();
            status.is_server_error() || status.as_u16() == 429
        }
        _ => false,
    }
}

fn message<E>(err: &SdkError<E>) -> String
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    err.as_service_error()
        .and_then(|e| e.message().map(str::to_string))
        .unwrap_or_else(|| DisplayErrorContext(err).to_string())
}

fn job_error<E>(err: SdkError<E>) -> JobError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    if is_transient(&err) {
        JobError::Transient(message(&err))
    } else {
        JobError::Service(message(&err))
    }
}

fn resource(kind: ResourceType, value: impl ToString) -> ResourceRequirement {
    ResourceRequirement::builder()
        .r#type(kind)
        .value(value.to_string())
        .build()
}

fn to_job(job_id: &str, detail: &JobDetail) -> Result<Job, JobError> {
    let state = detail
        .status()
        .ok_or_else(|| JobError::Service(format!("job {job_id} has no status")))?
        .as_str()
        .parse::<JobState>()?;

    let mut job = Job::new(job_id, state);
    job.name = detail.job_name().map(str::to_string);
    job.status_reason = detail.status_reason().map(str::to_string);
    job.created_at = detail
        .created_at()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

    if let Some(container) = detail.container() {
        job.exit_code = container.exit_code();
        job.container_reason = container.reason().map(str::to_string);
        job.log_stream = container.log_stream_name().map(str::to_string);
        job.environment = container
            .environment()
            .iter()
            .filter_map(|kv| Some((kv.name()?.to_string(), kv.value()?.to_string())))
            .collect();
    }
    Ok(job)
}

impl BatchApi for AwsBatchApi {
    async fn submit(&self, req: &JobRequest) -> Result<String, JobError> {
        let env: Vec<KeyValuePair> = req
            .environment
            .iter()
            .map(|(k, v)| KeyValuePair::builder().name(k).value(v).build())
            .collect();

        let mut overrides = ContainerOverrides::builder().set_environment(Some(env));

        if !req.command.is_empty() {
            overrides = overrides.set_command(Some(req.command.clone()));
        }

        // Overrides replace the definition's values for the same resource type.
        let mut requirements = Vec::new();
        if let Some(cpus) = req.resources.cpus {
            requirements.push(resource(ResourceType::Vcpu, cpus));
        }
        if let Some(memory) = req.resources.memory_mib {
            requirements.push(resource(ResourceType::Memory, memory));
        }
        if !requirements.is_empty() {
            overrides = overrides.set_resource_requirements(Some(requirements));
        }

        let output = self
            .client
            .submit_job()
            .job_name(&req.name)
            .job_queue(&req.queue)
            .job_definition(&req.definition)
            .container_overrides(overrides.build())
            .send()
            .await
            .map_err(|e| {
                if is_transient(&e) {
                    JobError::Transient(message(&e))
                } else {
                    JobError::Submission(message(&e))
                }
            })?;

        output
            .job_id
            .ok_or_else(|| JobError::Service("submission returned no job id".into()))
    }

    async fn describe(&self, job_id: &str) -> Result<Job, JobError> {
        let resp = self
            .client
            .describe_jobs()
            .jobs(job_id)
            .send()
            .await
            .map_err(job_error)?;

        let detail = resp
            .jobs()
            .first()
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        to_job(job_id, detail)
    }

    async fn terminate(&self, job_id: &str, reason: &str) -> Result<(), JobError> {
        self.client
            .terminate_job()
            .job_id(job_id)
            .reason(reason)
            .send()
            .await
            .map(|_| ())
            .map_err(job_error)
    }
}

#[derive(Clone, Debug)]
pub struct CloudWatchLogs {
    client: LogsClient,
    group: String,
}

impl CloudWatchLogs {
    pub fn new(config: &aws_config::SdkConfig, group: impl Into<String>) -> Self {
        Self {
            client: LogsClient::new(config),
            group: group.into(),
        }
    }
}

impl LogApi for CloudWatchLogs {
    async fn fetch(&self, stream: &str, cursor: Option<&str>) -> Result<LogPage, JobError> {
        let mut req = self
            .client
            .get_log_events()
            .log_group_name(&self.group)
            .log_stream_name(stream)
            .start_from_head(true);

        if let Some(token) = cursor {
            req = req.next_token(token);
        }

        let output = match req.send().await {
            Ok(output) => output,
            // The stream is created lazily once the container writes to it.
            Err(e)
                if e.as_service_error()
                    .is_some_and(|e| e.is_resource_not_found_exception()) =>
            {
                debug!(stream, "Log stream does not exist yet");
                return Ok(LogPage {
                    lines: Vec::new(),
                    next_cursor: cursor.map(str::to_string),
                });
            }
            Err(e) => return Err(job_error(e)),
        };

        let lines = output
            .events()
            .iter()
            .map(|event| {
                let timestamp = event
                    .timestamp()
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                    .unwrap_or_else(Utc::now);
                LogLine::new(timestamp, event.message().unwrap_or_default())
            })
            .collect();

        Ok(LogPage {
            lines,
            next_cursor: output.next_forward_token().map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_batch::operation::submit_job::SubmitJobError;

    #[test]
    fn timeouts_are_retried() {
        let err: SdkError<SubmitJobError> = SdkError::timeout_error("timed out");
        assert!(is_transient(&err));
        assert!(job_error(err).is_transient());
    }

    #[test]
    fn construction_failures_are_not() {
        let err: SdkError<SubmitJobError> = SdkError::construction_failure("missing queue");
        assert!(!is_transient(&err));
        assert!(matches!(job_error(err), JobError::Service(_)));
    }

    #[test]
    fn resources_are_sent_as_strings() {
        let requirement = resource(ResourceType::Memory, 7_500u64);
        assert_eq!(requirement.value(), Some("7500"));
        assert_eq!(requirement.r#type(), Some(&ResourceType::Memory));
    }
}
