//! CLI error type and exit code mapping

use vmprobe_core::error::VmProbeError;

/// Errors surfaced by `vmprobe` subcommands.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Configuration loading or validation failure.
    #[error("configuration error: {0}")]
    Config(String),

    /// A subcommand-specific operation failed.
    #[error("{0}")]
    Command(String),

    /// At least one scenario failed or was cancelled.
    #[error("{failed} scenario(s) did not pass")]
    ScenariosFailed { failed: usize },

    #[error("json output error: {0}")]
    JsonSerialize(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Maps the error to a process exit code.
    ///
    /// | Code | Meaning                           |
    /// |------|-----------------------------------|
    /// | 0    | every scenario passed or skipped  |
    /// | 1    | scenario failure / command error  |
    /// | 2    | configuration error               |
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::ScenariosFailed { .. }
            | Self::Command(_)
            | Self::JsonSerialize(_)
            | Self::Io(_) => 1,
        }
    }
}

impl From<VmProbeError> for CliError {
    fn from(err: VmProbeError) -> Self {
        match err {
            VmProbeError::Config(e) => Self::Config(e.to_string()),
            other => Self::Command(other.to_string()),
        }
    }
}
