//! Command handlers -- one module per subcommand

pub mod list;
pub mod run;
pub mod validate;

use std::path::Path;

use vmprobe_core::config::VmProbeConfig;
use vmprobe_core::error::{ConfigError, VmProbeError};

use crate::cli::{Cli, Commands};
use crate::error::CliError;
use crate::logging;
use crate::output::OutputWriter;

/// Loads configuration, sets up logging and runs the selected subcommand.
pub async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let writer = OutputWriter::new(cli.output);

    // `validate` reports load errors itself instead of failing here
    if matches!(cli.command, Commands::Validate) {
        return validate::execute(&cli.config, &writer).await;
    }

    let mut config = load_config(&cli.config, matches!(cli.command, Commands::List(_))).await?;
    apply_cli_overrides(&mut config, &cli);
    config.validate()?;
    logging::init_tracing(&config.general).map_err(|e| CliError::Config(e.to_string()))?;

    tracing::debug!(config = %cli.config.display(), "configuration loaded");

    match cli.command {
        Commands::List(args) => list::execute(args, &writer),
        Commands::Run(args) => run::execute(args, config, &writer).await,
        Commands::Validate => Ok(()),
    }
}

/// Loads `path` with environment overrides.
///
/// With `allow_missing` a missing file falls back to defaults plus environment.
pub async fn load_config(path: &Path, allow_missing: bool) -> Result<VmProbeConfig, CliError> {
    match VmProbeConfig::from_file(path).await {
        Ok(mut config) => {
            config.apply_env_overrides();
            Ok(config)
        }
        Err(VmProbeError::Config(ConfigError::FileNotFound { .. })) if allow_missing => {
            let mut config = VmProbeConfig::default();
            config.apply_env_overrides();
            Ok(config)
        }
        Err(e) => Err(e.into()),
    }
}

/// CLI flags take precedence over environment and file values.
pub fn apply_cli_overrides(config: &mut VmProbeConfig, cli: &Cli) {
    if let Some(level) = &cli.log_level {
        config.general.log_level.clone_from(level);
    }
    if let Some(format) = &cli.log_format {
        config.general.log_format.clone_from(format);
    }
    if let Commands::Run(args) = &cli.command {
        if let Some(parallel) = args.parallel {
            config.runner.parallel = parallel;
        }
    }
}
