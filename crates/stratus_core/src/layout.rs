//! Deterministic object keys for one run.

use crate::constants::{env, keys};
use crate::job::Job;

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunKeys {
    pub bucket: String,
    pub run_id: String,
    /// `{prefix}{run_id}/`, everything belonging to the run lives below it.
    pub namespace: String,
    pub archive: String,
    pub environment: String,
}

impl RunKeys {
    pub fn new(bucket: impl Into<String>, prefix: &str, run_id: impl Into<String>) -> Self {
        let run_id = run_id.into();
        let prefix = prefix.trim_start_matches('/');
        let namespace = match prefix {
            "" => format!("{run_id}/"),
            p if p.ends_with('/') => format!("{p}{run_id}/"),
            p => format!("{p}/{run_id}/"),
        };

        Self {
            bucket: bucket.into(),
            archive: format!("{namespace}{}", keys::ARCHIVE),
            environment: format!("{namespace}{}", keys::ENVIRONMENT),
            namespace,
            run_id,
        }
    }

    /// Keys for a brand new run.
    pub fn generate(bucket: impl Into<String>, prefix: &str) -> Self {
        Self::new(bucket, prefix, Uuid::new_v4().to_string())
    }

    /// Recovers the keys from the environment the job was submitted with.
    pub fn from_job(job: &Job) -> Option<Self> {
        let url = job.environment.get(env::WORKDIR_URL)?;
        let (bucket, archive) = parse_s3_url(url)?;
        let namespace = archive.strip_suffix(keys::ARCHIVE)?;
        let run_id = namespace.trim_end_matches('/').rsplit('/').next()?;
        if run_id.is_empty() {
            return None;
        }
        let prefix = &namespace[..namespace.len() - run_id.len() - 1];
        Some(Self::new(bucket, prefix, run_id))
    }

    pub fn url(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }

    pub fn archive_url(&self) -> String {
        self.url(&self.archive)
    }

    pub fn environment_url(&self) -> String {
        self.url(&self.environment)
    }
}

/// Splits `s3://bucket/key` into its parts.
pub fn parse_s3_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("s3://")?;
    let (bucket, key) = rest.split_once('/')?;
    if bucket.is_empty() || key.is_empty() {
        return None;
    }
    Some((bucket, key))
}

/// A job name the batch service accepts: `[A-Za-z0-9_-]`, at most 128 characters.
pub fn job_name(build_dir_name: &str, run_id: &str) -> String {
    let base: String = build_dir_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let base = base.trim_matches('-');
    let base = if base.is_empty() { "build" } else { base };

    let mut name = format!("{base}-{run_id}");
    if name.len() > 128 {
        let keep = 128 - run_id.len() - 1;
        name = format!("{}-{run_id}", &base[..keep.min(base.len())]);
    }
    name
}
