//! Built-in scenario catalog.

use vmprobe_core::error::VmProbeError;
use vmprobe_core::types::PowerAction;

use crate::scenario::{ControllerType, DiskFormat, DiskSpec, Expectation, ScenarioCase};

/// Guest script that partitions, formats and mounts new disks.
pub const FORMAT_SCRIPT: &str = "format.sh";
/// Guest script that checks the NMI counter in `/proc/interrupts`.
pub const VERIFY_NMI_SCRIPT: &str = "verify-nmi.sh";

/// Host command for an NMI attempt from an account without Hyper-V admin rights.
const UNPRIVILEGED_NMI_COMMAND: &str =
    "powershell {scripts}setupscripts\\nmi-unprivileged.ps1 -vmName {vm} -hvServer {host}";

/// Returns every built-in scenario.
pub fn builtin() -> Result<Vec<ScenarioCase>, VmProbeError> {
    let mut scenarios = vec![
        storage("storage-vhd-fixed-ide", DiskSpec::fixed(DiskFormat::Vhd, ControllerType::Ide, 1, 1))?,
        storage("storage-vhd-fixed-scsi", DiskSpec::fixed(DiskFormat::Vhd, ControllerType::Scsi, 0, 1))?,
        storage("storage-vhdx-fixed-ide", DiskSpec::fixed(DiskFormat::Vhdx, ControllerType::Ide, 1, 1))?,
        storage("storage-vhdx-fixed-scsi", DiskSpec::fixed(DiskFormat::Vhdx, ControllerType::Scsi, 0, 1))?,
    ];

    scenarios.push(
        ScenarioCase::builder("nmi-interrupt")
            .description("Inject an NMI into the running guest and check that it was delivered")
            .tags(&["nmi", "smoke"])
            .inject_nmi(Expectation::success())
            .verify_script(VERIFY_NMI_SCRIPT, &[])
            .build()?,
    );

    scenarios.push(
        ScenarioCase::builder("nmi-pause")
            .description("Inject an NMI while the guest is paused; it is delivered after unpause")
            .tags(&["nmi"])
            .transition(PowerAction::Pause)
            .inject_nmi(Expectation::success())
            .transition(PowerAction::Unpause)
            .verify_script(VERIFY_NMI_SCRIPT, &[])
            .build()?,
    );

    scenarios.push(
        ScenarioCase::builder("nmi-change-status")
            .description("The host rejects NMIs to stopped, saved and paused guests")
            .tags(&["nmi", "smoke"])
            .transition(PowerAction::Stop)
            .inject_nmi(Expectation::rejected())
            .transition(PowerAction::Start)
            .verify_reachable()
            .transition(PowerAction::Save)
            .inject_nmi(Expectation::rejected())
            .transition(PowerAction::Unsave)
            .verify_reachable()
            .transition(PowerAction::Pause)
            .inject_nmi(Expectation::rejected())
            .transition(PowerAction::Unpause)
            .verify_reachable()
            .build()?,
    );

    scenarios.push(
        ScenarioCase::builder("nmi-unprivileged")
            .description("An unprivileged host account cannot inject an NMI")
            .tags(&["nmi", "smoke"])
            .host_command(UNPRIVILEGED_NMI_COMMAND, Expectation::success())
            .verify_reachable()
            .build()?,
    );

    scenarios.push(
        ScenarioCase::builder("lifecycle-smoke")
            .description("Pause/unpause then suspend/resume; the guest stays reachable")
            .tags(&["lifecycle", "smoke"])
            .verify_reachable()
            .transition(PowerAction::Pause)
            .transition(PowerAction::Unpause)
            .verify_reachable()
            .transition(PowerAction::Suspend)
            .transition(PowerAction::Resume)
            .verify_reachable()
            .build()?,
    );

    Ok(scenarios)
}

fn storage(name: &str, disk: DiskSpec) -> Result<ScenarioCase, VmProbeError> {
    ScenarioCase::builder(name)
        .description(format!("Attach a {disk} disk to a stopped guest, then format it"))
        .tags(&["storage"])
        .transition(PowerAction::Stop)
        .attach_disk(disk)
        .transition(PowerAction::Start)
        .verify_script(FORMAT_SCRIPT, &["1", "ext3"])
        .build()
}

/// Selects scenarios by name and tag.
///
/// With no names every scenario is a candidate; a tag filter then keeps the
/// scenarios carrying that tag. An unknown name is an error.
pub fn select(
    all: Vec<ScenarioCase>,
    names: &[String],
    tag: Option<&str>,
) -> Result<Vec<ScenarioCase>, VmProbeError> {
    if let Some(unknown) = names.iter().find(|n| !all.iter().any(|s| &s.name == *n)) {
        return Err(VmProbeError::Config(
            vmprobe_core::error::ConfigError::InvalidValue {
                field: "scenario".to_owned(),
                reason: format!("unknown scenario '{unknown}'"),
            },
        ));
    }
    Ok(all
        .into_iter()
        .filter(|s| names.is_empty() || names.contains(&s.name))
        .filter(|s| tag.is_none_or(|t| s.has_tag(t)))
        .collect())
}
