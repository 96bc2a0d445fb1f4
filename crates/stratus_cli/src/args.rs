//! Command-line surface and its translation into configuration and build requests.

use stratus_core::prelude::*;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(
    name = "stratus",
    version,
    about = "Run pipeline builds locally, in containers, or on AWS Batch",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Print debug diagnostics (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a build in the selected backend.
    Build(BuildArgs),
}

#[derive(Debug, Args)]
#[group(id = "backend", multiple = false)]
pub struct BackendArgs {
    /// Run on AWS Batch, syncing the build directory through S3.
    #[arg(long)]
    pub aws_batch: bool,

    /// Run in a local Docker container (default).
    #[arg(long)]
    pub docker: bool,

    /// Run directly in the current environment.
    #[arg(long)]
    pub ambient: bool,
}

impl BackendArgs {
    pub fn kind(&self) -> BackendKind {
        if self.aws_batch {
            BackendKind::AwsBatch
        } else if self.ambient {
            BackendKind::Ambient
        } else {
            BackendKind::Docker
        }
    }
}

#[derive(Debug, Args)]
pub struct AwsBatchArgs {
    /// Job definition name or ARN.
    #[arg(long = "aws-batch-job", env = "STRATUS_AWS_BATCH_JOB", default_value = "stratus-job")]
    pub job_definition: String,

    /// Job queue name or ARN.
    #[arg(
        long = "aws-batch-queue",
        env = "STRATUS_AWS_BATCH_QUEUE",
        default_value = "stratus-job-queue"
    )]
    pub queue: String,

    /// Bucket holding build directory archives.
    #[arg(long = "aws-batch-s3-bucket", env = "STRATUS_AWS_BATCH_S3_BUCKET")]
    pub bucket: Option<String>,

    /// Key prefix inside the bucket.
    #[arg(
        long = "aws-batch-s3-prefix",
        env = "STRATUS_AWS_BATCH_S3_PREFIX",
        default_value = ""
    )]
    pub prefix: String,

    /// CloudWatch log group the job definition writes to.
    #[arg(
        long = "aws-batch-log-group",
        env = "STRATUS_AWS_BATCH_LOG_GROUP",
        default_value = DEFAULT_LOG_GROUP
    )]
    pub log_group: String,

    /// Default vCPUs when --cpus is not given.
    #[arg(id = "aws_batch_cpus", long = "aws-batch-cpus", env = "STRATUS_AWS_BATCH_CPUS", hide = true)]
    pub cpus: Option<u32>,

    /// Default memory when --memory is not given.
    #[arg(
        id = "aws_batch_memory",
        long = "aws-batch-memory",
        env = "STRATUS_AWS_BATCH_MEMORY",
        value_parser = parse_memory,
        hide = true
    )]
    pub memory: Option<u64>,

    /// Seconds between job status checks.
    #[arg(long = "aws-batch-poll-interval", value_name = "SECONDS", default_value_t = 15, hide = true)]
    pub poll_interval: u64,
}

#[derive(Debug, Args)]
pub struct DockerArgs {
    /// Container image to build in.
    #[arg(
        long = "docker-image",
        env = "STRATUS_DOCKER_IMAGE",
        default_value = "stratus/base:latest"
    )]
    pub image: String,
}

#[derive(Debug, Args)]
pub struct BuildArgs {
    #[command(flatten)]
    pub backend: BackendArgs,

    /// Build directory.
    #[arg(default_value = ".")]
    pub directory: PathBuf,

    /// Command to run instead of the default, given after `--`.
    #[arg(last = true)]
    pub command: Vec<String>,

    /// Submit the job and exit without waiting for it.
    #[arg(long)]
    pub detach: bool,

    /// Reattach to a previously submitted job.
    #[arg(long, value_name = "JOB_ID")]
    pub attach: Option<String>,

    /// Cancel the job given with --attach.
    #[arg(long)]
    pub cancel: bool,

    /// Leave results in the remote store.
    #[arg(long, conflicts_with = "download")]
    pub no_download: bool,

    /// Only download results matching PATTERN; `!PATTERN` excludes. Repeatable.
    #[arg(long, value_name = "PATTERN")]
    pub download: Vec<String>,

    /// Do not upload paths matching PATTERN. Repeatable.
    #[arg(long = "exclude-from-upload", value_name = "PATTERN")]
    pub exclude: Vec<String>,

    /// Do not stream the job's log output.
    #[arg(long)]
    pub no_logs: bool,

    /// Pass NAME (from this environment) or NAME=VALUE to the build. Repeatable; disables
    /// the automatic pass-through of well-known variables.
    #[arg(long = "env", value_name = "NAME[=VALUE]")]
    pub env: Vec<String>,

    /// vCPUs for the job.
    #[arg(long)]
    pub cpus: Option<u32>,

    /// Memory for the job, e.g. 8GiB or 512MiB (plain numbers are MiB).
    #[arg(long, value_parser = parse_memory)]
    pub memory: Option<u64>,

    #[command(flatten)]
    pub aws: AwsBatchArgs,

    #[command(flatten)]
    pub docker: DockerArgs,
}

impl BuildArgs {
    pub fn config(&self) -> Config {
        Config {
            backend: self.backend.kind(),
            aws_batch: AwsBatchConfig {
                job_definition: self.aws.job_definition.clone(),
                queue: self.aws.queue.clone(),
                bucket: self.aws.bucket.clone().unwrap_or_default(),
                prefix: self.aws.prefix.clone(),
                log_group: self.aws.log_group.clone(),
                resources: Resources {
                    cpus: self.aws.cpus,
                    memory_mib: self.aws.memory,
                },
                poll_interval: Duration::from_secs(self.aws.poll_interval),
            },
            docker: DockerConfig {
                image: self.docker.image.clone(),
            },
        }
    }

    /// `lookup` reads the invoking environment for `--env NAME` and pass-through.
    pub fn request<F>(&self, lookup: F) -> Result<BuildRequest, UsageError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut request = BuildRequest::new(&self.directory);

        if !self.command.is_empty() {
            request.command = self.command.clone();
        }
        request.exclude = PatternSet::parse(&self.exclude)?;
        request.download = if self.no_download {
            DownloadSelection::Nothing
        } else {
            DownloadSelection::from_patterns(PatternSet::parse(&self.download)?)
        };
        request.resources = Resources {
            cpus: self.cpus,
            memory_mib: self.memory,
        };
        request.environment = resolve_environment(&self.env, lookup)?;
        request.detach = self.detach;
        request.attach = self.attach.clone();
        request.cancel = self.cancel;
        request.logs = !self.no_logs;

        Ok(request)
    }
}

/// Memory in MiB from `512`, `512MiB`, `8GiB`, `8G` and the like.
pub fn parse_memory(value: &str) -> Result<u64, String> {
    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let number: u64 = number
        .parse()
        .map_err(|_| format!("'{value}' is not an amount of memory"))?;
    let factor = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "m" | "mb" | "mib" => 1,
        "g" | "gb" | "gib" => 1024,
        "t" | "tb" | "tib" => 1024 * 1024,
        _ => return Err(format!("unknown memory unit in '{value}'")),
    };

    number
        .checked_mul(factor)
        .ok_or_else(|| format!("'{value}' is too large"))
}
