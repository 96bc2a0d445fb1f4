use crate::error::*;
use crate::job::*;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::pin::Pin;

/// A streamed object body. Chunks arrive as they are produced or received.
pub type ByteSource = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Listing entry of an object in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
}

/// A trait for injecting object storage into a runner.
///
/// Implementations retry transient failures themselves and never retry permission
/// failures. Every transfer is logged before it starts.
pub trait ObjectStore: Send + Sync + 'static + Clone {
    /// Checks whether an object exists.
    fn exists(&self, key: &str) -> impl Future<Output = Result<bool, TransferError>> + Send;

    /// Streams `source` into `key` without knowing its size up front.
    fn put_stream(
        &self,
        key: &str,
        source: ByteSource,
    ) -> impl Future<Output = Result<(), TransferError>> + Send;

    /// Opens `key` for reading; bytes are yielded as they arrive.
    fn get_stream(&self, key: &str)
    -> impl Future<Output = Result<ByteSource, TransferError>> + Send;

    /// Objects under `prefix` last modified at or after `since`.
    fn list_modified_since(
        &self,
        prefix: &str,
        since: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<ObjectInfo>, TransferError>> + Send;

    /// Deletes an object. Deleting a missing object is not an error.
    fn delete(&self, key: &str) -> impl Future<Output = Result<(), TransferError>> + Send;
}

/// Raw access to a remote batch service. One call, one request; retries live in the controller.
pub trait BatchApi: Send + Sync + 'static + Clone {
    /// Submits a job and returns the id assigned by the service.
    fn submit(&self, req: &JobRequest) -> impl Future<Output = Result<String, JobError>> + Send;

    /// Describes the job as the service currently sees it.
    fn describe(&self, job_id: &str) -> impl Future<Output = Result<Job, JobError>> + Send;

    /// Requests termination. Returns before the job actually stops.
    fn terminate(
        &self,
        job_id: &str,
        reason: &str,
    ) -> impl Future<Output = Result<(), JobError>> + Send;
}

/// Raw access to a job log store.
pub trait LogApi: Send + Sync + 'static + Clone {
    /// Fetches the page of events following `cursor` (from the start when `None`).
    fn fetch(
        &self,
        stream: &str,
        cursor: Option<&str>,
    ) -> impl Future<Output = Result<LogPage, JobError>> + Send;
}

/// User-facing output. Diagnostics go to `tracing`; this is what the user reads.
pub trait Console: Send + Sync + 'static + Clone {
    /// A progress or status line.
    fn status(&self, message: &str);

    /// A warning the user should act on.
    fn warn(&self, message: &str);

    /// A line of the job's own output.
    fn log_line(&self, line: &LogLine);
}
