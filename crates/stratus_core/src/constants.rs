use std::time::Duration;

pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    /// Any fatal error not covered by a more specific code.
    pub const FAILURE: i32 = 1;
    /// Conflicting or unsupported flags for the selected backend.
    pub const USAGE: i32 = 2;
    /// The job failed for a reason outside the user's program.
    pub const INFRASTRUCTURE: i32 = 125;
    /// The job was cancelled, or the local process was interrupted.
    pub const INTERRUPTED: i32 = 130;
}

pub mod env {
    /// Variables forwarded to the remote job automatically when the user gives no explicit `--env`.
    pub const PASSTHROUGH: &[&str] = &[
        "AWS_ACCESS_KEY_ID",
        "AWS_SECRET_ACCESS_KEY",
        "AWS_SESSION_TOKEN",
        "GITHUB_TOKEN",
        "SNAKEMAKE_PROFILE",
    ];

    pub const WORKDIR_URL: &str = "STRATUS_WORKDIR_URL";
    pub const ENV_URL: &str = "STRATUS_ENV_URL";
}

pub mod keys {
    pub const ARCHIVE: &str = "workdir.stratus";
    pub const ENVIRONMENT: &str = "env.json";
}

pub mod archive {
    /// Never uploaded, whatever the user asks for.
    pub const ALWAYS_EXCLUDED: &[&str] = &["**/__pycache__", "**/*.pyc", "**/environment*"];
}

/// The default command run inside the build directory.
pub const DEFAULT_BUILD_COMMAND: &[&str] = &["snakemake", "--printshellcmds"];

/// Two interrupts within this window cancel the remote job.
pub const INTERRUPT_WINDOW: Duration = Duration::from_secs(10);

/// Reason given to the batch service when the user cancels a job.
pub const CANCEL_REASON: &str = "Cancelled interactively by the user";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_LOG_GROUP: &str = "/aws/batch/job";
