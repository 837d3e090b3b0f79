//! CLI argument parsing using clap derive API
//!
//! Purely declarative: no side effects or I/O happen here.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// vmprobe -- VM lifecycle integration test runner.
///
/// Use `vmprobe <COMMAND> --help` for subcommand details.
#[derive(Parser, Debug)]
#[command(name = "vmprobe", version, about, long_about = None)]
pub struct Cli {
    /// Path to the vmprobe.toml configuration file.
    #[arg(short, long, global = true, default_value = "vmprobe.toml")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    /// Output format.
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Supported output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text.
    Text,
    /// Machine-readable JSON.
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the built-in scenarios.
    List(ListArgs),

    /// Run scenarios against the configured cloud.
    Run(RunArgs),

    /// Validate the configuration file.
    Validate,
}

/// List the built-in scenarios.
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only list scenarios carrying this tag.
    #[arg(long)]
    pub tag: Option<String>,
}

/// Run scenarios. With no names, every scenario (matching `--tag`) runs.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Scenario names.
    pub names: Vec<String>,

    /// Only run scenarios carrying this tag.
    #[arg(long)]
    pub tag: Option<String>,

    /// Number of scenarios to run concurrently (overrides `[runner] parallel`).
    #[arg(short, long)]
    pub parallel: Option<usize>,
}
