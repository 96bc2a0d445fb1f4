//! # Stratus S3
//!
//! An S3 backend for the [`ObjectStore`] trait.
//!
//! ## Features
//!
//! * **Streaming Uploads**: Bodies of unknown length are sent as multipart uploads, one part at a
//!   time. Small bodies that fit a single part use a plain `PutObject`. A failed multipart upload
//!   is aborted so no orphaned parts are billed.
//! * **Streaming Downloads**: Bytes are yielded as they arrive.
//! * **Retries**: Network failures, throttling and 5xx responses are retried with exponential
//!   backoff. Permission failures are reported immediately with the offending key.
//!
//! ## Usage
//!
//! ```no_run
//! use stratus_s3::S3Store;
//! use aws_config::BehaviorVersion;
//!
//! # async fn run() {
//! let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
//! let store = S3Store::new(aws_sdk_s3::Client::new(&config), "my-builds");
//! # }
//! ```

mod error;
mod parts;

use error::{from_sdk, is_not_found};
use parts::PartBuffer;

use stratus_core::prelude::*;

use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct S3Store {
    client: Client,
    bucket: String,
    retry: RetryPolicy,
}

impl S3Store {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Runs `call` under the retry policy. Only transient failures are retried.
    async fn retrying<T, F, Fut>(
        &self,
        operation: &'static str,
        key: &str,
        mut call: F,
    ) -> Result<T, TransferError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        let mut attempts = 0;
        retry_with_backoff(
            self.retry,
            |attempt| {
                attempts = attempt;
                call()
            },
            |attempt, delay, err| {
                warn!(operation, key, attempt, ?delay, "Retrying S3 request: {err}");
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
        .map_err(|err| err.exhausted(attempts))
    }

    async fn put_single(&self, key: &str, body: Bytes) -> Result<(), TransferError> {
        self.retrying("put", key, || {
            let body = body.clone();
            async move {
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .body(ByteStream::from(body))
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|e| from_sdk("put", key, e))
            }
        })
        .await
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        number: i32,
        body: Bytes,
    ) -> Result<CompletedPart, TransferError> {
        debug!(key, part = number, bytes = body.len(), "Uploading part");
        let e_tag = self
            .retrying("upload part", key, || {
                let body = body.clone();
                async move {
                    self.client
                        .upload_part()
                        .bucket(&self.bucket)
                        .key(key)
                        .upload_id(upload_id)
                        .part_number(number)
                        .body(ByteStream::from(body))
                        .send()
                        .await
                        .map(|out| out.e_tag().map(str::to_string))
                        .map_err(|e| from_sdk("upload part", key, e))
                }
            })
            .await?;

        Ok(CompletedPart::builder()
            .set_e_tag(e_tag)
            .part_number(number)
            .build())
    }

    async fn multipart(
        &self,
        key: &str,
        upload_id: &str,
        first: Bytes,
        buffer: &mut PartBuffer,
        source: &mut ByteSource,
    ) -> Result<(), TransferError> {
        let mut parts = vec![self.upload_part(key, upload_id, 1, first).await?];

        while let Some(chunk) = source.next().await {
            if let Some(part) = buffer.push(&chunk?) {
                let number = parts.len() as i32 + 1;
                parts.push(self.upload_part(key, upload_id, number, part).await?);
            }
        }
        if let Some(last) = buffer.finish() {
            let number = parts.len() as i32 + 1;
            parts.push(self.upload_part(key, upload_id, number, last).await?);
        }

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();
        self.retrying("complete upload", key, || {
            let completed = completed.clone();
            async move {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .multipart_upload(completed)
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|e| from_sdk("complete upload", key, e))
            }
        })
        .await
    }
}

impl ObjectStore for S3Store {
    async fn exists(&self, key: &str) -> Result<bool, TransferError> {
        self.retrying("head", key, || async move {
            match self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
            {
                Ok(_) => Ok(true),
                Err(e) if is_not_found(&e) => Ok(false),
                Err(e) => Err(from_sdk("head", key, e)),
            }
        })
        .await
    }

    async fn put_stream(&self, key: &str, mut source: ByteSource) -> Result<(), TransferError> {
        info!(bucket = %self.bucket, key, "Uploading");

        let mut buffer = PartBuffer::default();
        let first = loop {
            match source.next().await {
                Some(chunk) => {
                    if let Some(part) = buffer.push(&chunk?) {
                        break part;
                    }
                }
                None => {
                    let body = buffer.finish().unwrap_or_default();
                    return self.put_single(key, body).await;
                }
            }
        };

        let upload_id = self
            .retrying("create upload", key, || async move {
                self.client
                    .create_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| from_sdk("create upload", key, e))
            })
            .await?
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| TransferError::Rejected {
                operation: "create upload",
                key: key.to_string(),
                message: "no upload id in response".into(),
            })?;

        let result = self
            .multipart(key, &upload_id, first, &mut buffer, &mut source)
            .await;

        if result.is_err() {
            warn!(key, upload_id, "Aborting multipart upload");
            if let Err(e) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                warn!(key, "Failed to abort multipart upload: {e}");
            }
        }
        result
    }

    async fn get_stream(&self, key: &str) -> Result<ByteSource, TransferError> {
        info!(bucket = %self.bucket, key, "Downloading");

        let output = self
            .retrying("get", key, || async move {
                self.client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| {
                        if is_not_found(&e) {
                            TransferError::NotFound {
                                operation: "get",
                                key: key.to_string(),
                            }
                        } else {
                            from_sdk("get", key, e)
                        }
                    })
            })
            .await?;

        Ok(ReaderStream::new(output.body.into_async_read()).boxed())
    }

    async fn list_modified_since(
        &self,
        prefix: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ObjectInfo>, TransferError> {
        let mut objects = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let page = self
                .retrying("list", prefix, || {
                    let token = token.clone();
                    async move {
                        self.client
                            .list_objects_v2()
                            .bucket(&self.bucket)
                            .prefix(prefix)
                            .set_continuation_token(token)
                            .send()
                            .await
                            .map_err(|e| from_sdk("list", prefix, e))
                    }
                })
                .await?;

            for object in page.contents() {
                let (Some(key), Some(modified)) = (object.key(), object.last_modified()) else {
                    continue;
                };
                let Some(last_modified) = Utc
                    .timestamp_opt(modified.secs(), modified.subsec_nanos())
                    .single()
                else {
                    continue;
                };
                if last_modified >= since {
                    objects.push(ObjectInfo {
                        key: key.to_string(),
                        last_modified,
                        size: object.size().unwrap_or_default().max(0) as u64,
                    });
                }
            }

            match page.next_continuation_token() {
                Some(next) if page.is_truncated().unwrap_or(false) => {
                    token = Some(next.to_string())
                }
                _ => break,
            }
        }

        debug!(prefix, count = objects.len(), %since, "Listed modified objects");
        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<(), TransferError> {
        info!(bucket = %self.bucket, key, "Deleting");
        self.retrying("delete", key, || async move {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| from_sdk("delete", key, e))
        })
        .await
    }
}
