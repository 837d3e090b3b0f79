//! Scenario declarations.
//!
//! A [`ScenarioCase`] is pure data: an instruction sequence plus an optional
//! final verification. Every scenario runs through the same
//! [`LifecycleOrchestrator`](crate::orchestrator::LifecycleOrchestrator);
//! scenarios differ only in what they declare here.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use vmprobe_core::error::{ConfigError, VmProbeError};
use vmprobe_core::types::{CommandOutput, PowerAction, PowerState};

/// Virtual disk file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Vhd,
    Vhdx,
}

impl DiskFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vhd => "vhd",
            Self::Vhdx => "vhdx",
        }
    }
}

/// Disk controller the new disk is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerType {
    Ide,
    Scsi,
}

impl ControllerType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ide => "IDE",
            Self::Scsi => "SCSI",
        }
    }
}

/// Virtual disk allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VhdType {
    Fixed,
    Dynamic,
}

impl VhdType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fixed => "Fixed",
            Self::Dynamic => "Dynamic",
        }
    }
}

/// Disk to attach on the hypervisor host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    pub format: DiskFormat,
    pub controller: ControllerType,
    pub controller_id: u32,
    pub lun: u32,
    pub vhd_type: VhdType,
    pub sector_size: u32,
}

impl DiskSpec {
    /// Fixed-size disk with 512-byte sectors.
    pub fn fixed(format: DiskFormat, controller: ControllerType, controller_id: u32, lun: u32) -> Self {
        Self {
            format,
            controller,
            controller_id,
            lun,
            vhd_type: VhdType::Fixed,
            sector_size: 512,
        }
    }
}

impl fmt::Display for DiskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}:{} {} {}B",
            self.format.as_str(),
            self.controller.as_str(),
            self.controller_id,
            self.lun,
            self.vhd_type.as_str(),
            self.sector_size
        )
    }
}

/// Expected exit status of a remote instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedExit {
    /// Exactly this exit code.
    Code(i32),
    /// Any non-zero exit code: the instruction is expected to be rejected.
    AnyFailure,
}

/// What a remote instruction must produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expectation {
    pub exit: ExpectedExit,
    /// Substrings that must all appear in stdout.
    #[serde(default)]
    pub stdout_markers: Vec<String>,
}

impl Default for Expectation {
    fn default() -> Self {
        Self::success()
    }
}

impl Expectation {
    pub fn success() -> Self {
        Self {
            exit: ExpectedExit::Code(0),
            stdout_markers: Vec::new(),
        }
    }

    pub fn rejected() -> Self {
        Self {
            exit: ExpectedExit::AnyFailure,
            stdout_markers: Vec::new(),
        }
    }

    pub fn exit_code(code: i32) -> Self {
        Self {
            exit: ExpectedExit::Code(code),
            stdout_markers: Vec::new(),
        }
    }

    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.stdout_markers.push(marker.into());
        self
    }

    pub fn expects_failure(&self) -> bool {
        !matches!(self.exit, ExpectedExit::Code(0))
    }

    /// Checks `output`; the error is a human-readable mismatch reason.
    pub fn check(&self, output: &CommandOutput) -> Result<(), String> {
        match self.exit {
            ExpectedExit::Code(code) if output.exit_code != code => {
                return Err(format!(
                    "expected exit code {code}, got {}",
                    output.exit_code
                ));
            }
            ExpectedExit::AnyFailure if output.exit_code == 0 => {
                return Err("expected the command to be rejected, but it succeeded".to_owned());
            }
            _ => {}
        }
        if let Some(missing) = self
            .stdout_markers
            .iter()
            .find(|m| !output.stdout.contains(m.as_str()))
        {
            return Err(format!("stdout is missing marker '{missing}'"));
        }
        Ok(())
    }
}

/// Which remote channel an instruction addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Guest,
    Host,
}

/// One step of a scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Instruction {
    /// Issue a power action without waiting.
    Power { action: PowerAction },
    /// Wait for a power state with the transition timeout.
    WaitFor { state: PowerState },
    /// Host side: attach a new virtual disk to the instance.
    AttachDisk { disk: DiskSpec, expect: Expectation },
    /// Host side: deliver a non-maskable interrupt to the instance.
    InjectNmi { expect: Expectation },
    /// Host side: arbitrary command line.
    ///
    /// `{vm}`, `{host}` and `{scripts}` are replaced by the hypervisor-side
    /// instance name, the host name and the host script folder.
    HostCommand { command: String, expect: Expectation },
    /// Guest side: command line.
    GuestCommand { command: String, expect: Expectation },
    /// Guest side: stage a script from the script root and run it.
    GuestScript {
        script: String,
        #[serde(default)]
        args: Vec<String>,
        expect: Expectation,
    },
    /// Open a fresh guest session and run a liveness probe.
    VerifyReachable,
}

impl Instruction {
    /// Remote channel this instruction needs, if any.
    pub fn channel(&self) -> Option<Channel> {
        match self {
            Self::Power { .. } | Self::WaitFor { .. } => None,
            Self::AttachDisk { .. } | Self::InjectNmi { .. } | Self::HostCommand { .. } => {
                Some(Channel::Host)
            }
            Self::GuestCommand { .. } | Self::GuestScript { .. } | Self::VerifyReachable => {
                Some(Channel::Guest)
            }
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Power { action } => write!(f, "power {action}"),
            Self::WaitFor { state } => write!(f, "wait for {state}"),
            Self::AttachDisk { disk, .. } => write!(f, "attach disk ({disk})"),
            Self::InjectNmi { expect } if expect.expects_failure() => {
                f.write_str("inject nmi (expect rejection)")
            }
            Self::InjectNmi { .. } => f.write_str("inject nmi"),
            Self::HostCommand { command, .. } => write!(f, "host: {command}"),
            Self::GuestCommand { command, .. } => write!(f, "guest: {command}"),
            Self::GuestScript { script, args, .. } if args.is_empty() => {
                write!(f, "guest script {script}")
            }
            Self::GuestScript { script, args, .. } => {
                write!(f, "guest script {script} {}", args.join(" "))
            }
            Self::VerifyReachable => f.write_str("verify guest reachable"),
        }
    }
}

/// Per-scenario timeout overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutOverrides {
    pub boot: Option<Duration>,
    pub transition: Option<Duration>,
    pub command: Option<Duration>,
}

/// One declared test scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioCase {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Overrides `[compute] image_ref`.
    #[serde(default)]
    pub image_ref: Option<String>,
    /// Overrides `[compute] flavor_ref`.
    #[serde(default)]
    pub flavor_ref: Option<String>,
    pub steps: Vec<Instruction>,
    /// Final assertion, run after every step succeeded.
    #[serde(default)]
    pub verification: Option<Instruction>,
    #[serde(default)]
    pub timeouts: TimeoutOverrides,
}

impl ScenarioCase {
    pub fn builder(name: impl Into<String>) -> ScenarioBuilder {
        ScenarioBuilder::new(name)
    }

    /// Steps followed by the verification.
    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.steps.iter().chain(self.verification.iter())
    }

    pub fn addresses(&self, channel: Channel) -> bool {
        self.instructions().any(|i| i.channel() == Some(channel))
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }
}

/// Builder for [`ScenarioCase`].
#[derive(Debug)]
pub struct ScenarioBuilder {
    case: ScenarioCase,
}

impl ScenarioBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            case: ScenarioCase {
                name: name.into(),
                description: String::new(),
                tags: Vec::new(),
                image_ref: None,
                flavor_ref: None,
                steps: Vec::new(),
                verification: None,
                timeouts: TimeoutOverrides::default(),
            },
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.case.description = description.into();
        self
    }

    pub fn tags(mut self, tags: &[&str]) -> Self {
        self.case.tags.extend(tags.iter().map(|t| (*t).to_owned()));
        self
    }

    pub fn image(mut self, image_ref: impl Into<String>) -> Self {
        self.case.image_ref = Some(image_ref.into());
        self
    }

    pub fn flavor(mut self, flavor_ref: impl Into<String>) -> Self {
        self.case.flavor_ref = Some(flavor_ref.into());
        self
    }

    pub fn step(mut self, instruction: Instruction) -> Self {
        self.case.steps.push(instruction);
        self
    }

    pub fn power(self, action: PowerAction) -> Self {
        self.step(Instruction::Power { action })
    }

    pub fn wait_for(self, state: PowerState) -> Self {
        self.step(Instruction::WaitFor { state })
    }

    /// `Power(action)` followed by `WaitFor(action.target_state())`.
    pub fn transition(self, action: PowerAction) -> Self {
        self.power(action).wait_for(action.target_state())
    }

    pub fn attach_disk(self, disk: DiskSpec) -> Self {
        self.step(Instruction::AttachDisk {
            disk,
            expect: Expectation::success(),
        })
    }

    pub fn inject_nmi(self, expect: Expectation) -> Self {
        self.step(Instruction::InjectNmi { expect })
    }

    pub fn host_command(self, command: impl Into<String>, expect: Expectation) -> Self {
        self.step(Instruction::HostCommand {
            command: command.into(),
            expect,
        })
    }

    pub fn guest_command(self, command: impl Into<String>, expect: Expectation) -> Self {
        self.step(Instruction::GuestCommand {
            command: command.into(),
            expect,
        })
    }

    pub fn guest_script(self, script: impl Into<String>, args: &[&str]) -> Self {
        self.step(Instruction::GuestScript {
            script: script.into(),
            args: args.iter().map(|a| (*a).to_owned()).collect(),
            expect: Expectation::success(),
        })
    }

    pub fn verify_reachable(self) -> Self {
        self.step(Instruction::VerifyReachable)
    }

    /// Final guest script with the default success expectation.
    pub fn verify_script(mut self, script: impl Into<String>, args: &[&str]) -> Self {
        self.case.verification = Some(Instruction::GuestScript {
            script: script.into(),
            args: args.iter().map(|a| (*a).to_owned()).collect(),
            expect: Expectation::success(),
        });
        self
    }

    pub fn verification(mut self, instruction: Instruction) -> Self {
        self.case.verification = Some(instruction);
        self
    }

    pub fn boot_timeout(mut self, timeout: Duration) -> Self {
        self.case.timeouts.boot = Some(timeout);
        self
    }

    pub fn transition_timeout(mut self, timeout: Duration) -> Self {
        self.case.timeouts.transition = Some(timeout);
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.case.timeouts.command = Some(timeout);
        self
    }

    /// Validates and returns the scenario.
    pub fn build(self) -> Result<ScenarioCase, VmProbeError> {
        let case = self.case;
        if case.name.trim().is_empty() {
            return Err(invalid("scenario.name", "must not be empty"));
        }
        if case.steps.is_empty() && case.verification.is_none() {
            return Err(invalid(
                &format!("scenario.{}", case.name),
                "declares no steps and no verification",
            ));
        }
        if let Some(v) = &case.verification {
            if v.channel().is_none() {
                return Err(invalid(
                    &format!("scenario.{}.verification", case.name),
                    "must address the guest or the host",
                ));
            }
        }
        Ok(case)
    }
}

fn invalid(field: &str, reason: &str) -> VmProbeError {
    VmProbeError::Config(ConfigError::InvalidValue {
        field: field.to_owned(),
        reason: reason.to_owned(),
    })
}
