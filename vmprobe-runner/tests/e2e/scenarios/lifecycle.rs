//! Power-state gating, identity across transitions, cancellation and suites.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use vmprobe_core::error::ErrorKind;
use vmprobe_core::types::{PowerAction, PowerState};
use vmprobe_runner::{Expectation, ScenarioCase, ScenarioOutcome, ScenarioState, SuiteRunner};

use super::builtin;
use crate::helpers::Harness;
use crate::helpers::config::TestSettings;
use crate::helpers::fake_compute::FakeCompute;
use crate::helpers::scripted_connector::ScriptedConnector;

use ScenarioState::*;

fn harness(cloud: FakeCompute) -> (Harness, tempfile::TempDir) {
    let (settings, scripts) = TestSettings::new().build();
    let harness = Harness::new(
        cloud,
        ScriptedConnector::guest().reply("uname -a", 0, "Linux vmprobe 5.15.0 x86_64"),
        ScriptedConnector::host(),
        settings,
    );
    (harness, scripts)
}

/// Suspend on a PAUSED guest is refused without calling the control plane.
#[tokio::test(start_paused = true)]
async fn test_e2e_precondition_blocks_power_action() {
    let (harness, _scripts) = harness(FakeCompute::new());
    let case = ScenarioCase::builder("suspend-paused")
        .transition(PowerAction::Pause)
        .power(PowerAction::Suspend)
        .verify_reachable()
        .build()
        .unwrap();

    let report = harness.orchestrator.run(&case, &CancellationToken::new()).await;

    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.kind, ErrorKind::Transition);
    assert_eq!(failure.step, Some(3));
    assert_eq!(failure.instruction, "power suspend");
    assert!(failure.message.contains("PAUSED"));
    // pause만 요청됨
    assert_eq!(harness.cloud.count_calls("server_action"), 1);
    assert_eq!(harness.cloud.live_resources(), 0);
}

/// A second action before the first one settled is refused.
#[tokio::test(start_paused = true)]
async fn test_e2e_action_without_wait_blocks_next_action() {
    let (harness, _scripts) = harness(FakeCompute::new());
    let case = ScenarioCase::builder("stop-then-start")
        .power(PowerAction::Stop)
        .power(PowerAction::Start)
        .verify_reachable()
        .build()
        .unwrap();

    let report = harness.orchestrator.run(&case, &CancellationToken::new()).await;

    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.kind, ErrorKind::Transition);
    assert_eq!(failure.step, Some(2));
    assert!(failure.message.contains("BUILDING"));
    assert_eq!(harness.cloud.count_calls("server_action"), 1);
}

/// A transition that does not settle in time fails without a second request.
#[tokio::test(start_paused = true)]
async fn test_e2e_transition_timeout_is_not_retried() {
    let (harness, _scripts) = harness(FakeCompute::new());
    let case = ScenarioCase::builder("slow-stop")
        .transition_timeout(Duration::from_secs(1))
        .transition(PowerAction::Stop)
        .verify_reachable()
        .build()
        .unwrap();

    let report = harness.orchestrator.run(&case, &CancellationToken::new()).await;

    assert_eq!(report.outcome, ScenarioOutcome::Failed);
    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.kind, ErrorKind::Timeout);
    assert_eq!(failure.step, Some(2));
    assert_eq!(failure.instruction, "wait for SHUTOFF");
    assert_eq!(failure.last_vm_state, Some(PowerState::Building));
    assert_eq!(harness.cloud.count_calls("server_action"), 1);
    assert_eq!(&report.states[report.states.len() - 2..], &[Failed, TornDown]);
    assert_eq!(harness.cloud.live_resources(), 0);
}

/// Stop then start keeps the instance id and its floating IP.
#[tokio::test(start_paused = true)]
async fn test_e2e_stop_start_keeps_identity() {
    let (harness, _scripts) = harness(FakeCompute::new());
    let case = ScenarioCase::builder("stop-start")
        .transition(PowerAction::Stop)
        .transition(PowerAction::Start)
        .verify_reachable()
        .build()
        .unwrap();

    let report = harness.orchestrator.run(&case, &CancellationToken::new()).await;

    assert_eq!(report.outcome, ScenarioOutcome::Passed, "{:?}", report.failure);
    let servers = harness.cloud.created_servers();
    assert_eq!(servers.len(), 1);
    let actions: Vec<_> = harness
        .cloud
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("server_action"))
        .collect();
    assert_eq!(
        actions,
        vec![
            format!("server_action {} stop", servers[0]),
            format!("server_action {} start", servers[0]),
        ]
    );
    let targets = harness.guest.targets();
    assert_eq!(targets.len(), 2);
    assert_eq!(targets[0], targets[1]);
    assert_eq!(harness.cloud.count_calls("associate_floating_ip"), 1);
}

/// Repeating an action whose target state is already reached is a no-op.
#[tokio::test(start_paused = true)]
async fn test_e2e_repeated_action_is_idempotent() {
    let (harness, _scripts) = harness(FakeCompute::new());
    let case = ScenarioCase::builder("double-pause")
        .transition(PowerAction::Pause)
        .power(PowerAction::Pause)
        .transition(PowerAction::Unpause)
        .verify_reachable()
        .build()
        .unwrap();

    let report = harness.orchestrator.run(&case, &CancellationToken::new()).await;

    assert_eq!(report.outcome, ScenarioOutcome::Passed, "{:?}", report.failure);
    assert_eq!(harness.cloud.count_calls("server_action"), 2);
    assert_eq!(report.steps[2].detail.as_deref(), Some("already PAUSED"));
}

/// The session opened at REMOTE_READY serves the first reachability check;
/// later checks follow a power action and reconnect.
#[tokio::test(start_paused = true)]
async fn test_e2e_guest_session_reopened_only_after_power_actions() {
    let (harness, _scripts) = harness(FakeCompute::new());

    let report = harness
        .orchestrator
        .run(&builtin("lifecycle-smoke"), &CancellationToken::new())
        .await;

    assert_eq!(report.outcome, ScenarioOutcome::Passed, "{:?}", report.failure);
    assert_eq!(harness.guest.commands_matching("uname -a").len(), 3);
    assert_eq!(harness.guest.connects(), 3);
    assert_eq!(harness.guest.closes(), 3);
}

/// An action already in its target state leaves the guest session open.
#[tokio::test(start_paused = true)]
async fn test_e2e_noop_action_keeps_guest_session() {
    let (harness, _scripts) = harness(FakeCompute::new());
    let case = ScenarioCase::builder("start-running")
        .guest_command("uptime", Expectation::success())
        .power(PowerAction::Start)
        .guest_command("uptime", Expectation::success())
        .build()
        .unwrap();

    let report = harness.orchestrator.run(&case, &CancellationToken::new()).await;

    assert_eq!(report.outcome, ScenarioOutcome::Passed, "{:?}", report.failure);
    assert_eq!(report.steps[1].detail.as_deref(), Some("already ACTIVE"));
    assert_eq!(harness.cloud.count_calls("server_action"), 0);
    assert_eq!(harness.guest.commands_matching("uptime").len(), 2);
    assert_eq!(harness.guest.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_e2e_cancelled_before_start() {
    let (harness, _scripts) = harness(FakeCompute::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = harness
        .orchestrator
        .run(&builtin("lifecycle-smoke"), &cancel)
        .await;

    assert_eq!(report.outcome, ScenarioOutcome::Cancelled);
    assert_eq!(report.states, vec![Init, TornDown]);
    assert!(report.failure.is_none());
    assert!(harness.cloud.calls().is_empty());
}

/// Cancellation during the boot wait still tears everything down.
#[tokio::test(start_paused = true)]
async fn test_e2e_cancelled_during_boot() {
    let (harness, _scripts) = harness(FakeCompute::new().never_active());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        trigger.cancel();
    });

    let report = harness
        .orchestrator
        .run(&builtin("lifecycle-smoke"), &cancel)
        .await;

    assert_eq!(report.outcome, ScenarioOutcome::Cancelled);
    assert_eq!(report.states, vec![Init, TornDown]);
    assert_eq!(report.cleanup.released.len(), 3);
    assert!(report.duration < Duration::from_secs(120));
    assert_eq!(harness.cloud.live_resources(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_e2e_image_too_large_for_flavor_is_skipped() {
    let (harness, _scripts) = harness(FakeCompute::new().image_min_disk(40));

    let report = harness
        .orchestrator
        .run(&builtin("lifecycle-smoke"), &CancellationToken::new())
        .await;

    assert_eq!(report.outcome, ScenarioOutcome::Skipped);
    assert!(report.skip_reason.as_deref().unwrap().contains("does not fit"));
    assert_eq!(report.states, vec![Init, TornDown]);
    assert_eq!(harness.cloud.count_calls("create_"), 0);
}

/// Concurrent scenarios own separate instances; reports keep input order.
#[tokio::test(start_paused = true)]
async fn test_e2e_suite_runs_scenarios_concurrently() {
    let (harness, _scripts) = harness(FakeCompute::new());
    let cloud = Arc::clone(&harness.cloud);
    let runner = SuiteRunner::new(Arc::new(harness.orchestrator), 2);
    let scenarios = vec![
        builtin("lifecycle-smoke"),
        builtin("nmi-interrupt"),
        builtin("nmi-unprivileged"),
    ];

    let suite = runner.run(scenarios, &CancellationToken::new()).await;

    let names: Vec<_> = suite.scenarios.iter().map(|r| r.scenario.as_str()).collect();
    assert_eq!(names, vec!["lifecycle-smoke", "nmi-interrupt", "nmi-unprivileged"]);
    assert!(suite.succeeded());
    assert_eq!(suite.count(ScenarioOutcome::Passed), 3);

    let mut run_ids: Vec<_> = suite.scenarios.iter().map(|r| r.run_id.clone()).collect();
    run_ids.sort_unstable();
    run_ids.dedup();
    assert_eq!(run_ids.len(), 3);
    assert_eq!(cloud.created_servers().len(), 3);
    assert_eq!(cloud.live_resources(), 0);
}
