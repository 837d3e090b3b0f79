//! Disk attach on a stopped guest, then format from inside the guest.

use tokio_util::sync::CancellationToken;

use vmprobe_core::error::ErrorKind;
use vmprobe_core::ledger::ResourceKind;
use vmprobe_core::types::PowerState;
use vmprobe_runner::catalog::FORMAT_SCRIPT;
use vmprobe_runner::{ScenarioOutcome, ScenarioState};

use super::builtin;
use crate::helpers::Harness;
use crate::helpers::config::TestSettings;
use crate::helpers::fake_compute::{CONSOLE_TAIL, FakeCompute, HYPERVISOR_HOST};
use crate::helpers::scripted_connector::ScriptedConnector;

use ScenarioState::*;

#[tokio::test(start_paused = true)]
async fn test_e2e_storage_attach_and_format() {
    let (settings, _scripts) = TestSettings::new().build();
    let harness = Harness::new(
        FakeCompute::new(),
        ScriptedConnector::guest().reply("./format.sh", 0, "all disks formatted and mounted"),
        ScriptedConnector::host(),
        settings,
    );
    let case = builtin("storage-vhdx-fixed-scsi");

    let report = harness.orchestrator.run(&case, &CancellationToken::new()).await;

    assert_eq!(report.outcome, ScenarioOutcome::Passed, "{:?}", report.failure);
    assert_eq!(
        report.states,
        vec![
            Init,
            Provisioned,
            Networked,
            RemoteReady,
            Transitioning,
            RemoteReady,
            Transitioning,
            RemoteReady,
            Verified,
            TornDown
        ]
    );
    assert_eq!(report.steps.len(), 6);
    assert_eq!(report.steps[1].instruction, "wait for SHUTOFF");
    assert!(report.steps[2].instruction.starts_with("attach disk"));
    assert_eq!(report.steps[5].instruction, "guest script format.sh 1 ext3");
    assert!(report.warnings.is_empty());

    // 호스트: 디스크 연결 명령이 정확히 한 번
    let attach = harness.host.commands_matching("attach-disk.ps1");
    assert_eq!(attach.len(), 1);
    assert!(attach[0].starts_with("powershell C:\\vmprobe\\setupscripts\\attach-disk.ps1"));
    assert!(attach[0].contains(&format!(
        "-vmName instance-00000001 -hvServer {HYPERVISOR_HOST} -diskType vhdx -controllerType SCSI -controllerID 0 -Lun 1"
    )));
    assert_eq!(harness.host.targets()[0].address, HYPERVISOR_HOST);
    assert_eq!(harness.host.users(), vec!["Administrator"]);

    // 게스트: 스크립트를 스테이징한 뒤 인자와 함께 실행
    let copies = harness.guest.copies();
    assert_eq!(copies.len(), 1);
    assert!(copies[0].0.ends_with(FORMAT_SCRIPT));
    assert_eq!(copies[0].1, "/tmp/vmprobe/format.sh");
    assert_eq!(
        harness.guest.commands_matching("./format.sh 1 ext3"),
        vec!["cd /tmp/vmprobe && ./format.sh 1 ext3"]
    );

    // 전원 액션 후 게스트 세션은 새로 열림
    assert_eq!(harness.guest.connects(), 2);
    assert_eq!(harness.guest.closes(), 2);
    assert_eq!(harness.host.closes(), 1);
    let guest_targets = harness.guest.targets();
    assert!(guest_targets.iter().all(|t| t == &guest_targets[0]));
    assert_eq!(harness.guest.users(), vec!["ubuntu", "ubuntu"]);

    // 역순 해제
    let released: Vec<_> = report.cleanup.released.iter().map(|r| r.kind).collect();
    assert_eq!(
        released,
        vec![
            ResourceKind::FloatingIp,
            ResourceKind::Instance,
            ResourceKind::SecurityGroup,
            ResourceKind::Keypair
        ]
    );
    assert_eq!(harness.cloud.live_resources(), 0);
    assert!(
        harness
            .cloud
            .calls()
            .contains(&format!("create_keypair vmprobe-storage-vhdx-fixed-scsi-{}-kp", report.run_id))
    );
}

#[tokio::test(start_paused = true)]
async fn test_e2e_storage_format_failure_captures_console() {
    let (settings, _scripts) = TestSettings::new().build();
    let harness = Harness::new(
        FakeCompute::new(),
        ScriptedConnector::guest().reply_with_stderr(
            "./format.sh",
            2,
            "format.sh: found 1 disk(s)",
            "mkfs.ext3: /dev/sdb1 is apparently in use by the system",
        ),
        ScriptedConnector::host(),
        settings,
    );
    let case = builtin("storage-vhd-fixed-ide");

    let report = harness.orchestrator.run(&case, &CancellationToken::new()).await;

    assert_eq!(report.outcome, ScenarioOutcome::Failed);
    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.kind, ErrorKind::CommandExecution);
    assert_eq!(failure.step, Some(6));
    assert_eq!(failure.instruction, "guest script format.sh 1 ext3");
    assert!(failure.message.contains("expected exit code 0, got 2"));
    // 실패 시점의 VM 상태와 스크립트 출력이 함께 보고됨
    assert_eq!(failure.last_vm_state, Some(PowerState::Active));
    assert_eq!(failure.raw_status.as_deref(), Some("ACTIVE"));
    assert_eq!(failure.stdout.as_deref(), Some("format.sh: found 1 disk(s)"));
    assert_eq!(
        failure.stderr.as_deref(),
        Some("mkfs.ext3: /dev/sdb1 is apparently in use by the system")
    );

    assert_eq!(report.console_output.as_deref(), Some(CONSOLE_TAIL));
    assert_eq!(harness.cloud.count_calls("console_output"), 1);
    assert!(!report.reached(Verified));
    assert_eq!(&report.states[report.states.len() - 2..], &[Failed, TornDown]);
    assert_eq!(harness.cloud.live_resources(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_e2e_storage_missing_script_is_config_error() {
    let (settings, _scripts) = TestSettings::new().without_script(FORMAT_SCRIPT).build();
    let harness = Harness::new(
        FakeCompute::new(),
        ScriptedConnector::guest(),
        ScriptedConnector::host(),
        settings,
    );
    let case = builtin("storage-vhdx-fixed-ide");

    let report = harness.orchestrator.run(&case, &CancellationToken::new()).await;

    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.kind, ErrorKind::Config);
    assert_eq!(failure.step, Some(6));
    assert!(failure.message.contains(FORMAT_SCRIPT));
    assert!(harness.guest.copies().is_empty());
    assert_eq!(harness.cloud.live_resources(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_e2e_storage_without_host_credentials_fails_before_steps() {
    let (settings, _scripts) = TestSettings::new().without_host_credentials().build();
    let harness = Harness::new(
        FakeCompute::new(),
        ScriptedConnector::guest(),
        ScriptedConnector::host(),
        settings,
    );
    let case = builtin("storage-vhd-fixed-scsi");

    let report = harness.orchestrator.run(&case, &CancellationToken::new()).await;

    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.kind, ErrorKind::Config);
    assert_eq!(failure.step, None);
    assert_eq!(failure.instruction, "open host session");
    assert!(report.steps.is_empty());
    assert_eq!(
        report.states,
        vec![Init, Provisioned, Networked, Failed, TornDown]
    );
    assert!(harness.host.targets().is_empty());
    assert!(harness.guest.targets().is_empty());
    assert_eq!(harness.cloud.live_resources(), 0);
}
