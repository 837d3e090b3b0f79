//! The instance never reaches ACTIVE.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use vmprobe_core::error::ErrorKind;
use vmprobe_core::ledger::ResourceKind;
use vmprobe_runner::{ScenarioCase, ScenarioOutcome, ScenarioState};

use super::builtin;
use crate::helpers::Harness;
use crate::helpers::config::TestSettings;
use crate::helpers::fake_compute::FakeCompute;
use crate::helpers::scripted_connector::ScriptedConnector;

#[tokio::test(start_paused = true)]
async fn test_e2e_boot_timeout_releases_everything() {
    let (settings, _scripts) = TestSettings::new()
        .boot_timeout(Duration::from_secs(30))
        .build();
    let harness = Harness::new(
        FakeCompute::new().never_active(),
        ScriptedConnector::guest(),
        ScriptedConnector::host(),
        settings,
    );
    let case = builtin("storage-vhdx-fixed-scsi");

    let report = harness.orchestrator.run(&case, &CancellationToken::new()).await;

    assert_eq!(report.outcome, ScenarioOutcome::Failed);
    assert_eq!(
        report.states,
        vec![ScenarioState::Init, ScenarioState::Failed, ScenarioState::TornDown]
    );
    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.kind, ErrorKind::Timeout);
    assert_eq!(failure.step, None);
    assert_eq!(failure.instruction, "wait for ACTIVE");
    assert!(failure.message.contains("BUILD"));

    let released: Vec<_> = report.cleanup.released.iter().map(|r| r.kind).collect();
    assert_eq!(
        released,
        vec![
            ResourceKind::Instance,
            ResourceKind::SecurityGroup,
            ResourceKind::Keypair
        ]
    );
    assert_eq!(harness.cloud.count_calls("delete_server"), 1);
    assert_eq!(harness.cloud.count_calls("allocate_floating_ip"), 0);
    assert_eq!(harness.cloud.live_resources(), 0);
    assert!(harness.guest.targets().is_empty());
    assert!(harness.host.targets().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_e2e_scenario_boot_timeout_overrides_settings() {
    let (settings, _scripts) = TestSettings::new()
        .boot_timeout(Duration::from_secs(600))
        .build();
    let harness = Harness::new(
        FakeCompute::new().never_active(),
        ScriptedConnector::guest(),
        ScriptedConnector::host(),
        settings,
    );
    let case = ScenarioCase::builder("quick-boot")
        .boot_timeout(Duration::from_secs(10))
        .verify_reachable()
        .build()
        .unwrap();

    let report = harness.orchestrator.run(&case, &CancellationToken::new()).await;

    assert_eq!(report.failure.as_ref().unwrap().kind, ErrorKind::Timeout);
    assert!(report.duration >= Duration::from_secs(10));
    assert!(report.duration < Duration::from_secs(60));
    assert_eq!(harness.cloud.live_resources(), 0);
}
