//! # Stratus
//![![License](https://img.shields.io/badge/license-MIT%2FApache-blue.svg)](https://github.com/stratus-build/stratus)
//!
//!> *Your build, somewhere else*
//!
//! Runs a reproducible pipeline build inside one of several interchangeable backends
//! (AWS Batch, a local Docker container, or the invoking environment) and mirrors the
//! build directory to and from that backend transparently.
//!
//! This crate serves as an entry point, re-exporting the core types and the archive codec,
//! and optionally including the remote implementations via feature flags.
//!
//! ## Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | **`s3`** | Object transfer engine for AWS S3 (`stratus_s3`). |
//! | **`aws`** | AWS Batch runner with CloudWatch log tailing (`stratus_batch`). |
//! | **`docker`** | Local Docker runner (`stratus_docker`). |
//!
//! ## Example: Remote Build
//!
//! ```toml
//! [dependencies]
//! stratus = { version = "0.3", features = ["s3", "aws"] }
//! ```
//!
//! ```rust,ignore
//! use stratus::prelude::*;
//! use aws_config::BehaviorVersion;
//!
//! # async fn run() -> Result<(), RunnerError> {
//! let sdk = aws_config::load_defaults(BehaviorVersion::latest()).await;
//! let config = AwsBatchConfig {
//!     job_definition: "stratus-job".into(),
//!     queue: "stratus-job-queue".into(),
//!     bucket: "my-builds".into(),
//!     ..Default::default()
//! };
//!
//! let store = S3Store::new(aws_sdk_s3::Client::new(&sdk), &config.bucket);
//! let mut runner = AwsBatchRunner::from_sdk(&sdk, config, store, Terminal);
//!
//! let request = BuildRequest::new("./my-build");
//! let (_tx, mut signals) = tokio::sync::mpsc::unbounded_channel();
//! let code = drive(&mut runner, &request, &mut signals).await?;
//! # let _ = code;
//! # Ok(())
//! # }
//! ```

pub use stratus_core::*;

pub mod archive {
    pub use stratus_archive::*;
}

#[cfg(feature = "s3")]
pub mod s3 {
    pub use stratus_s3::*;
}

#[cfg(feature = "aws")]
pub mod batch {
    pub use stratus_batch::*;
}

#[cfg(feature = "docker")]
pub mod docker {
    pub use stratus_docker::*;
}

pub mod prelude {
    pub use stratus_core::prelude::*;

    pub use stratus_archive::{Packer, pack_stream, unpack, unpack_stream};

    #[cfg(feature = "s3")]
    pub use stratus_s3::S3Store;

    #[cfg(feature = "aws")]
    pub use stratus_batch::{AwsBatchRunner, JobController, LogTailer};

    #[cfg(feature = "docker")]
    pub use stratus_docker::DockerRunner;
}
