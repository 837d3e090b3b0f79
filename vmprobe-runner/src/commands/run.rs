//! `vmprobe run` command handler

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vmprobe_control_plane::{ControlPlaneFacade, ControlPlaneSettings, OpenStackClient};
use vmprobe_core::config::VmProbeConfig;
use vmprobe_core::error::VmProbeError;
use vmprobe_remote::{SshConnector, SshSettings, WinRmConnector, WinRmSettings};

use crate::catalog;
use crate::cli::RunArgs;
use crate::error::CliError;
use crate::metrics_server;
use crate::orchestrator::{LifecycleOrchestrator, OrchestratorSettings};
use crate::output::OutputWriter;
use crate::report::ScenarioOutcome;
use crate::scenario::Channel;
use crate::suite::SuiteRunner;

/// Runs the selected scenarios and renders the suite report.
///
/// Ctrl-C cancels the running scenarios; their teardown still completes
/// before the command returns.
pub async fn execute(
    args: RunArgs,
    config: VmProbeConfig,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    config.require_run_fields()?;

    let scenarios = catalog::select(catalog::builtin()?, &args.names, args.tag.as_deref())?;
    if scenarios.is_empty() {
        return Err(CliError::Command("no scenarios selected".to_owned()));
    }
    if scenarios.iter().any(|s| s.addresses(Channel::Host)) {
        config.require_host_credentials()?;
    }

    if config.metrics.enabled {
        metrics_server::install_metrics_recorder(&config.metrics)
            .map_err(|e| CliError::Command(e.to_string()))?;
    }

    let cp_settings = ControlPlaneSettings::from_core(&config.control_plane, &config.compute);
    let client = OpenStackClient::new(cp_settings.clone()).map_err(VmProbeError::from)?;
    let facade = ControlPlaneFacade::new(Arc::new(client), cp_settings);
    let guest = SshConnector::new(SshSettings::from_core(&config.guest)).map_err(VmProbeError::from)?;
    let host =
        WinRmConnector::new(WinRmSettings::from_core(&config.host)).map_err(VmProbeError::from)?;

    let orchestrator = LifecycleOrchestrator::new(
        facade,
        Arc::new(guest),
        Arc::new(host),
        OrchestratorSettings::from_core(&config),
    );
    let runner = SuiteRunner::new(Arc::new(orchestrator), config.runner.parallel);

    let cancel = CancellationToken::new();
    let signal = tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

    info!(
        scenarios = scenarios.len(),
        parallel = config.runner.parallel,
        "running scenarios"
    );
    let report = runner.run(scenarios, &cancel).await;
    signal.abort();

    writer.render(&report)?;

    if report.succeeded() {
        Ok(())
    } else {
        Err(CliError::ScenariosFailed {
            failed: report.count(ScenarioOutcome::Failed) + report.count(ScenarioOutcome::Cancelled),
        })
    }
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("interrupt received, cancelling scenarios after teardown");
        cancel.cancel();
    }
}
