//! `vmprobe` binary entry point.

use std::process::ExitCode;

use clap::Parser;

use vmprobe_runner::cli::Cli;
use vmprobe_runner::commands;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match commands::dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "vmprobe failed");
            eprintln!("error: {e}");
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}
