use crate::constants::{DEFAULT_LOG_GROUP, DEFAULT_POLL_INTERVAL};
use crate::error::UsageError;
use crate::job::Resources;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    Docker,
    AwsBatch,
    Ambient,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::AwsBatch => "aws-batch",
            Self::Ambient => "ambient",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = UsageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "docker" => Ok(Self::Docker),
            "aws-batch" => Ok(Self::AwsBatch),
            "ambient" => Ok(Self::Ambient),
            other => Err(UsageError::Conflict(format!("unknown backend '{other}'"))),
        }
    }
}

/// Settings for the AWS Batch backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsBatchConfig {
    /// Registered job definition name or ARN.
    pub job_definition: String,
    pub queue: String,
    /// Bucket holding build archives.
    pub bucket: String,
    /// Key prefix inside the bucket; may be empty.
    pub prefix: String,
    /// CloudWatch log group the job definition logs to.
    pub log_group: String,
    /// Default resource overrides; flags on the command line win.
    pub resources: Resources,
    pub poll_interval: Duration,
}

impl Default for AwsBatchConfig {
    fn default() -> Self {
        Self {
            job_definition: "stratus-job".into(),
            queue: "stratus-job-queue".into(),
            bucket: String::new(),
            prefix: String::new(),
            log_group: DEFAULT_LOG_GROUP.into(),
            resources: Resources::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl AwsBatchConfig {
    pub fn validate(&self) -> Result<(), UsageError> {
        let missing = |what: &str, flag: &str, var: &str| {
            UsageError::MissingConfig(format!("{what}: pass {flag} or set {var}"))
        };

        if self.bucket.trim().is_empty() {
            return Err(missing(
                "S3 bucket",
                "--aws-batch-s3-bucket",
                "STRATUS_AWS_BATCH_S3_BUCKET",
            ));
        }
        if self.job_definition.trim().is_empty() {
            return Err(missing(
                "job definition",
                "--aws-batch-job",
                "STRATUS_AWS_BATCH_JOB",
            ));
        }
        if self.queue.trim().is_empty() {
            return Err(missing(
                "job queue",
                "--aws-batch-queue",
                "STRATUS_AWS_BATCH_QUEUE",
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(UsageError::Conflict(
                "the poll interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Settings for the local container backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerConfig {
    pub image: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: "stratus/base:latest".into(),
        }
    }
}

impl DockerConfig {
    pub fn validate(&self) -> Result<(), UsageError> {
        if self.image.trim().is_empty() {
            return Err(UsageError::MissingConfig(
                "container image: pass --docker-image or set STRATUS_DOCKER_IMAGE".into(),
            ));
        }
        Ok(())
    }
}

/// Process-wide settings, assembled once at startup and handed to the runner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub backend: BackendKind,
    pub aws_batch: AwsBatchConfig,
    pub docker: DockerConfig,
}

impl Config {
    /// Validates only the section of the selected backend.
    pub fn validate(&self) -> Result<(), UsageError> {
        match self.backend {
            BackendKind::AwsBatch => self.aws_batch.validate(),
            BackendKind::Docker => self.docker.validate(),
            BackendKind::Ambient => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aws_batch_needs_a_bucket() {
        let config = Config {
            backend: BackendKind::AwsBatch,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("STRATUS_AWS_BATCH_S3_BUCKET"));
    }

    #[test]
    fn other_backends_ignore_aws_settings() {
        let config = Config {
            backend: BackendKind::Ambient,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn backend_names_round_trip() {
        for kind in [BackendKind::Docker, BackendKind::AwsBatch, BackendKind::Ambient] {
            assert_eq!(kind.as_str().parse::<BackendKind>().ok(), Some(kind));
        }
    }
}
