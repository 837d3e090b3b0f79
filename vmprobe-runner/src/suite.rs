//! Suite runner -- bounded concurrent execution of scenarios.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use vmprobe_control_plane::ComputeApi;
use vmprobe_core::error::VmProbeError;
use vmprobe_core::metrics as m;
use vmprobe_remote::SessionConnector;

use crate::orchestrator::LifecycleOrchestrator;
use crate::report::{ScenarioOutcome, ScenarioReport, SuiteReport};
use crate::scenario::ScenarioCase;

/// Runs independent scenarios with at most `parallel` in flight.
///
/// Scenarios share the orchestrator (and through it the compute client and
/// connectors) immutably; each run owns its own ledger, instance and sessions.
pub struct SuiteRunner<A, G, H> {
    orchestrator: Arc<LifecycleOrchestrator<A, G, H>>,
    parallel: usize,
}

impl<A, G, H> SuiteRunner<A, G, H>
where
    A: ComputeApi,
    G: SessionConnector,
    H: SessionConnector,
{
    pub fn new(orchestrator: Arc<LifecycleOrchestrator<A, G, H>>, parallel: usize) -> Self {
        Self {
            orchestrator,
            parallel: parallel.max(1),
        }
    }

    /// Runs every scenario; reports come back in input order.
    pub async fn run(&self, scenarios: Vec<ScenarioCase>, cancel: &CancellationToken) -> SuiteReport {
        let started = Instant::now();
        let total = scenarios.len();
        info!(scenarios = total, parallel = self.parallel, "suite started");

        let semaphore = Arc::new(Semaphore::new(self.parallel));
        let names: Vec<String> = scenarios.iter().map(|s| s.name.clone()).collect();
        let mut tasks = JoinSet::new();

        for (index, case) in scenarios.into_iter().enumerate() {
            let orchestrator = Arc::clone(&self.orchestrator);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let report = orchestrator.run(&case, &cancel).await;
                record(&report);
                (index, report)
            });
        }

        let mut slots: Vec<Option<ScenarioReport>> = (0..total).map(|_| None).collect();
        let mut lost = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, report)) => slots[index] = Some(report),
                Err(e) => {
                    error!(error = %e, "scenario task failed");
                    lost.push(e);
                }
            }
        }

        let report = SuiteReport {
            scenarios: fill_missing(names, slots, lost),
            duration: started.elapsed(),
        };
        info!(
            passed = report.count(ScenarioOutcome::Passed),
            failed = report.count(ScenarioOutcome::Failed),
            skipped = report.count(ScenarioOutcome::Skipped),
            cancelled = report.count(ScenarioOutcome::Cancelled),
            "suite finished"
        );
        report
    }
}

/// Replaces every empty slot with a failed report so no scenario goes missing.
fn fill_missing(
    names: Vec<String>,
    slots: Vec<Option<ScenarioReport>>,
    lost: Vec<JoinError>,
) -> Vec<ScenarioReport> {
    let mut lost = lost.into_iter();
    names
        .into_iter()
        .zip(slots)
        .map(|(name, slot)| {
            slot.unwrap_or_else(|| {
                let cause = lost.next().map_or_else(
                    || std::io::Error::other("scenario task produced no report"),
                    std::io::Error::from,
                );
                let report = ScenarioReport::aborted(name, &VmProbeError::Io(cause));
                record(&report);
                report
            })
        })
        .collect()
}

fn record(report: &ScenarioReport) {
    metrics::counter!(m::SCENARIOS_TOTAL, m::LABEL_OUTCOME => report.outcome.as_str())
        .increment(1);
    metrics::histogram!(m::SCENARIO_DURATION_SECONDS).record(report.duration.as_secs_f64());
    if let Some(failure) = &report.failure {
        metrics::counter!(m::SCENARIO_FAILURES_TOTAL, m::LABEL_ERROR_KIND => failure.kind.as_str())
            .increment(1);
    }
}
