//! `vmprobe validate` command handler

use std::io::Write;
use std::path::Path;

use serde::Serialize;
use tracing::info;

use vmprobe_control_plane::ControlPlaneSettings;
use vmprobe_core::config::VmProbeConfig;
use vmprobe_remote::{SshSettings, WinRmSettings};

use crate::error::CliError;
use crate::output::{OutputWriter, Render};

/// Loads and validates the configuration, reporting every problem found.
pub async fn execute(config_path: &Path, writer: &OutputWriter) -> Result<(), CliError> {
    info!(path = %config_path.display(), "validating configuration");

    let report = match VmProbeConfig::load(config_path).await {
        Ok(config) => check(config_path, &config),
        Err(e) => ConfigValidationReport {
            source: config_path.display().to_string(),
            valid: false,
            errors: vec![e.to_string()],
            warnings: Vec::new(),
        },
    };

    writer.render(&report)?;

    if !report.valid {
        return Err(CliError::Config("configuration is invalid".to_owned()));
    }
    Ok(())
}

/// Checks a loaded configuration beyond `VmProbeConfig::validate`.
pub fn check(config_path: &Path, config: &VmProbeConfig) -> ConfigValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if let Err(e) = config.require_run_fields() {
        errors.push(e.to_string());
    }
    if let Err(e) = ControlPlaneSettings::from_core(&config.control_plane, &config.compute).validate() {
        errors.push(e.to_string());
    }
    if let Err(e) = SshSettings::from_core(&config.guest).validate() {
        errors.push(e.to_string());
    }
    if let Err(e) = WinRmSettings::from_core(&config.host).validate() {
        errors.push(e.to_string());
    }
    if let Err(e) = config.require_host_credentials() {
        warnings.push(format!("host-side scenarios cannot run: {e}"));
    }
    if !Path::new(&config.guest.script_root).is_dir() {
        warnings.push(format!(
            "guest.script_root '{}' is not a directory",
            config.guest.script_root
        ));
    }

    ConfigValidationReport {
        source: config_path.display().to_string(),
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

#[derive(Debug, Serialize)]
pub struct ConfigValidationReport {
    pub source: String,
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl Render for ConfigValidationReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        if self.valid {
            writeln!(w, "Configuration valid: {}", self.source)?;
        } else {
            writeln!(w, "Configuration invalid: {}", self.source)?;
            for error in &self.errors {
                writeln!(w, "  error: {error}")?;
            }
        }
        for warning in &self.warnings {
            writeln!(w, "  warning: {warning}")?;
        }
        Ok(())
    }
}
