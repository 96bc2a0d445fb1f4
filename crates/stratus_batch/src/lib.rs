//! # Stratus Batch
//!
//! Runs stratus builds on AWS Batch.
//!
//! - **[`JobController`]**: Submit, poll and terminate with retries. Never moves a job backwards.
//! - **[`LogTailer`]**: Resumable CloudWatch log following.
//! - **[`AwsBatchRunner`]**: The [`Runner`](stratus_core::runner::Runner) tying upload,
//!   submission, watching and download together.
//!
//! The AWS clients sit behind the [`BatchApi`](stratus_core::traits::BatchApi) and
//! [`LogApi`](stratus_core::traits::LogApi) traits, see [`AwsBatchApi`] and [`CloudWatchLogs`].

mod aws;
mod controller;
mod runner;
mod tailer;

pub use aws::{AwsBatchApi, CloudWatchLogs};
pub use controller::JobController;
pub use runner::AwsBatchRunner;
pub use tailer::{DEFAULT_LOG_INTERVAL, LogTailer, tail};
