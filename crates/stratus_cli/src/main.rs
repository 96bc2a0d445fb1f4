//! The `stratus` binary.

mod ambient;
mod args;
mod signals;

use ambient::AmbientRunner;
use args::{BuildArgs, Cli, Command};

use stratus_batch::AwsBatchRunner;
use stratus_core::prelude::*;
use stratus_docker::DockerRunner;
use stratus_s3::S3Store;

use aws_config::BehaviorVersion;
use clap::Parser;
use std::process;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            Terminal.warn(&format!("error: {err:#}"));
            exit_code(&err)
        }
    };

    process::exit(code);
}

/// Diagnostics go to stderr; `RUST_LOG` wins over `--verbose`.
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Command::Build(args) => build(args).await,
    }
}

async fn build(args: BuildArgs) -> anyhow::Result<i32> {
    let config = args.config();
    config.validate()?;
    let request = args.request(|name| std::env::var(name).ok())?;
    let mut signals = signals::forward()?;

    let code = match config.backend {
        BackendKind::AwsBatch => {
            let sdk = aws_config::load_defaults(BehaviorVersion::latest()).await;
            let store = S3Store::new(aws_sdk_s3::Client::new(&sdk), &config.aws_batch.bucket);
            let mut runner = AwsBatchRunner::from_sdk(&sdk, config.aws_batch, store, Terminal);
            drive(&mut runner, &request, &mut signals).await?
        }
        BackendKind::Docker => {
            let mut runner = DockerRunner::connect_local(config.docker, Terminal)?;
            drive(&mut runner, &request, &mut signals).await?
        }
        BackendKind::Ambient => {
            let mut runner = AmbientRunner::new(Terminal);
            drive(&mut runner, &request, &mut signals).await?
        }
    };
    Ok(code)
}

fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(err) = err.downcast_ref::<RunnerError>() {
        return err.exit_code();
    }
    if err.downcast_ref::<UsageError>().is_some() {
        return exit_codes::USAGE;
    }
    exit_codes::FAILURE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_errors_exit_with_two() {
        let err = anyhow::Error::from(UsageError::Conflict("nope".into()));
        assert_eq!(exit_code(&err), exit_codes::USAGE);

        let err = anyhow::Error::from(RunnerError::from(UsageError::BuildDir("x".into())));
        assert_eq!(exit_code(&err), exit_codes::USAGE);
    }

    #[test]
    fn everything_else_exits_with_one() {
        let err = anyhow::Error::from(RunnerError::Backend("daemon gone".into()));
        assert_eq!(exit_code(&err), exit_codes::FAILURE);
        assert_eq!(exit_code(&anyhow::anyhow!("boom")), exit_codes::FAILURE);
    }
}
