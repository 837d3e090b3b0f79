//! Failures before the instance is usable, and cleanup failures.

use tokio_util::sync::CancellationToken;

use vmprobe_core::error::ErrorKind;
use vmprobe_core::ledger::ResourceKind;
use vmprobe_runner::{ScenarioOutcome, ScenarioState};

use super::builtin;
use crate::helpers::Harness;
use crate::helpers::config::TestSettings;
use crate::helpers::fake_compute::{CONSOLE_TAIL, FakeCompute};
use crate::helpers::scripted_connector::ScriptedConnector;

use ScenarioState::*;

/// Keypair creation rejected -> nothing to release, no sessions opened.
#[tokio::test(start_paused = true)]
async fn test_e2e_keypair_quota_exceeded() {
    let (settings, _scripts) = TestSettings::new().build();
    let harness = Harness::new(
        FakeCompute::new().failing("create_keypair"),
        ScriptedConnector::guest(),
        ScriptedConnector::host(),
        settings,
    );
    let case = builtin("nmi-interrupt");

    let report = harness.orchestrator.run(&case, &CancellationToken::new()).await;

    assert_eq!(report.outcome, ScenarioOutcome::Failed);
    assert_eq!(report.states, vec![Init, Failed, TornDown]);
    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.kind, ErrorKind::Provisioning);
    assert_eq!(failure.step, None);
    assert_eq!(failure.instruction, "create keypair");
    assert!(failure.message.contains("Quota exceeded"));

    assert!(report.steps.is_empty());
    assert!(report.cleanup.released.is_empty());
    assert!(report.warnings.is_empty());
    assert!(harness.guest.targets().is_empty());
    assert!(harness.host.targets().is_empty());
    assert_eq!(harness.cloud.count_calls("create_server"), 0);
    assert_eq!(harness.cloud.live_resources(), 0);
}

/// Instance creation rejected -> keypair and security group still released.
#[tokio::test(start_paused = true)]
async fn test_e2e_instance_create_failure_releases_earlier_resources() {
    let (settings, _scripts) = TestSettings::new().build();
    let harness = Harness::new(
        FakeCompute::new().failing("create_server"),
        ScriptedConnector::guest(),
        ScriptedConnector::host(),
        settings,
    );
    let case = builtin("lifecycle-smoke");

    let report = harness.orchestrator.run(&case, &CancellationToken::new()).await;

    assert_eq!(report.failure.as_ref().unwrap().kind, ErrorKind::Provisioning);
    let released: Vec<_> = report.cleanup.released.iter().map(|r| r.kind).collect();
    assert_eq!(released, vec![ResourceKind::SecurityGroup, ResourceKind::Keypair]);
    assert_eq!(harness.cloud.live_resources(), 0);
}

/// A failed release is a warning; the scenario result is unchanged.
#[tokio::test(start_paused = true)]
async fn test_e2e_cleanup_failure_is_warning() {
    let (settings, _scripts) = TestSettings::new().build();
    let harness = Harness::new(
        FakeCompute::new().failing("delete_security_group"),
        ScriptedConnector::guest(),
        ScriptedConnector::host(),
        settings,
    );
    let case = builtin("nmi-interrupt");

    let report = harness.orchestrator.run(&case, &CancellationToken::new()).await;

    assert_eq!(report.outcome, ScenarioOutcome::Passed, "{:?}", report.failure);
    assert!(report.failure.is_none());
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].starts_with("security_group 'sg-vmprobe-nmi-interrupt-"));
    assert_eq!(report.cleanup.released.len(), 3);
    assert_eq!(report.cleanup.failures.len(), 1);
    // 보안 그룹만 남음
    assert_eq!(harness.cloud.live_resources(), 1);
}

/// Guest never answers -> connection failure with the console tail attached.
#[tokio::test(start_paused = true)]
async fn test_e2e_guest_unreachable() {
    let (settings, _scripts) = TestSettings::new().build();
    let harness = Harness::new(
        FakeCompute::new(),
        ScriptedConnector::guest().unreachable(),
        ScriptedConnector::host(),
        settings,
    );
    let case = builtin("nmi-interrupt");

    let report = harness.orchestrator.run(&case, &CancellationToken::new()).await;

    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.kind, ErrorKind::Connection);
    assert_eq!(failure.step, None);
    assert_eq!(failure.instruction, "open guest session");
    assert_eq!(report.console_output.as_deref(), Some(CONSOLE_TAIL));
    assert_eq!(
        report.states,
        vec![Init, Provisioned, Networked, Failed, TornDown]
    );
    // 호스트 세션은 열렸다가 정리 단계에서 닫힘
    assert_eq!(harness.host.connects(), 1);
    assert_eq!(harness.host.closes(), 1);
    assert_eq!(harness.guest.connects(), 0);
    assert_eq!(harness.cloud.live_resources(), 0);
}
