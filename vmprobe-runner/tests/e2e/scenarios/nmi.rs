//! Non-maskable interrupt delivery through the host management channel.

use tokio_util::sync::CancellationToken;

use vmprobe_core::error::ErrorKind;
use vmprobe_runner::{ScenarioOutcome, ScenarioState};

use super::builtin;
use crate::helpers::Harness;
use crate::helpers::config::TestSettings;
use crate::helpers::fake_compute::{FakeCompute, HYPERVISOR_HOST};
use crate::helpers::scripted_connector::ScriptedConnector;

const NMI_DELIVERED: &str = "verify-nmi.sh: NMI count 1";

/// NMI injected while paused is delivered once the guest resumes.
#[tokio::test(start_paused = true)]
async fn test_e2e_nmi_while_paused() {
    let (settings, _scripts) = TestSettings::new().build();
    let harness = Harness::new(
        FakeCompute::new(),
        ScriptedConnector::guest().reply("./verify-nmi.sh", 0, NMI_DELIVERED),
        ScriptedConnector::host().reply("Debug-VM", 0, ""),
        settings,
    );
    let case = builtin("nmi-pause");

    let report = harness.orchestrator.run(&case, &CancellationToken::new()).await;

    assert_eq!(report.outcome, ScenarioOutcome::Passed, "{:?}", report.failure);
    let labels: Vec<_> = report.steps.iter().map(|s| s.instruction.as_str()).collect();
    assert_eq!(
        labels,
        vec![
            "power pause",
            "wait for PAUSED",
            "inject nmi",
            "power unpause",
            "wait for ACTIVE",
            "guest script verify-nmi.sh"
        ]
    );
    assert!(report.reached(ScenarioState::Verified));
    assert_eq!(report.final_state(), Some(ScenarioState::TornDown));

    let nmi = harness.host.commands_matching("-InjectNonMaskableInterrupt");
    assert_eq!(nmi.len(), 1);
    assert!(nmi[0].contains(&format!(
        "Debug-VM -Name 'instance-00000001' -ComputerName '{HYPERVISOR_HOST}'"
    )));

    let server = &harness.cloud.created_servers()[0];
    let calls = harness.cloud.calls();
    let pause = calls
        .iter()
        .position(|c| c == &format!("server_action {server} pause"))
        .unwrap();
    let unpause = calls
        .iter()
        .position(|c| c == &format!("server_action {server} unpause"))
        .unwrap();
    assert!(pause < unpause);

    // 초기 세션 + unpause 이후 검증 세션
    assert_eq!(harness.guest.connects(), 2);
    assert_eq!(harness.guest.commands_matching("./verify-nmi.sh").len(), 1);
    assert_eq!(harness.cloud.live_resources(), 0);
}

/// Stopped, saved and paused guests reject NMIs; each time the guest comes
/// back reachable on a new session.
#[tokio::test(start_paused = true)]
async fn test_e2e_nmi_rejected_in_every_inactive_state() {
    let (settings, _scripts) = TestSettings::new().build();
    let harness = Harness::new(
        FakeCompute::new(),
        ScriptedConnector::guest().reply("uname -a", 0, "Linux vmprobe 5.15.0-91-generic x86_64"),
        ScriptedConnector::host().reply("Debug-VM", 1, "Debug-VM : The virtual machine is not running"),
        settings,
    );
    let case = builtin("nmi-change-status");

    let report = harness.orchestrator.run(&case, &CancellationToken::new()).await;

    assert_eq!(report.outcome, ScenarioOutcome::Passed, "{:?}", report.failure);
    assert_eq!(harness.host.commands_matching("Debug-VM").len(), 3);
    assert_eq!(harness.cloud.count_calls("server_action"), 6);
    assert_eq!(harness.guest.commands_matching("uname -a").len(), 3);
    assert_eq!(harness.guest.connects(), 4);
    assert_eq!(harness.host.connects(), 1);

    let reachable = report
        .steps
        .iter()
        .find(|s| s.instruction == "verify guest reachable")
        .unwrap();
    assert_eq!(
        reachable.detail.as_deref(),
        Some("Linux vmprobe 5.15.0-91-generic x86_64")
    );
    assert_eq!(harness.cloud.live_resources(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_e2e_nmi_accepted_while_stopped_fails_scenario() {
    let (settings, _scripts) = TestSettings::new().build();
    let harness = Harness::new(
        FakeCompute::new(),
        ScriptedConnector::guest(),
        ScriptedConnector::host(),
        settings,
    );
    let case = builtin("nmi-change-status");

    let report = harness.orchestrator.run(&case, &CancellationToken::new()).await;

    assert_eq!(report.outcome, ScenarioOutcome::Failed);
    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.kind, ErrorKind::CommandExecution);
    assert_eq!(failure.step, Some(3));
    assert_eq!(failure.instruction, "inject nmi (expect rejection)");
    assert!(failure.message.contains("expected the command to be rejected"));
    // 호스트 단계 실패는 콘솔을 가져오지 않음
    assert!(report.console_output.is_none());
    assert_eq!(harness.cloud.count_calls("server_action"), 1);
    assert_eq!(harness.cloud.live_resources(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_e2e_host_address_override() {
    let (settings, _scripts) = TestSettings::new().host_address("hv-mgmt.lab").build();
    let harness = Harness::new(
        FakeCompute::new(),
        ScriptedConnector::guest(),
        ScriptedConnector::host(),
        settings,
    );
    let case = builtin("nmi-interrupt");

    let report = harness.orchestrator.run(&case, &CancellationToken::new()).await;

    assert_eq!(report.outcome, ScenarioOutcome::Passed, "{:?}", report.failure);
    let target = &harness.host.targets()[0];
    assert_eq!(target.address, "hv-mgmt.lab");
    assert_eq!(target.port, 5985);
    // Debug-VM은 여전히 인스턴스의 하이퍼바이저 호스트를 대상으로 함
    let nmi = harness.host.commands_matching("Debug-VM");
    assert!(nmi[0].contains(&format!("-ComputerName '{HYPERVISOR_HOST}'")));
}
