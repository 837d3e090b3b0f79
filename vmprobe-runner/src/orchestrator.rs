//! Lifecycle orchestration -- provisioning, remote sessions, steps and teardown.
//!
//! The [`LifecycleOrchestrator`] runs one [`ScenarioCase`] to completion.
//! Every scenario goes through the same sequence; only the declared
//! instructions differ.
//!
//! # Scenario states
//!
//! ```text
//! INIT -> PROVISIONED -> NETWORKED -> REMOTE_READY <-> TRANSITIONING
//!                                          |
//!                                       VERIFIED
//! any state -> (FAILED) -> TORN_DOWN
//! ```
//!
//! # Teardown
//!
//! Teardown runs on every exit path, including provisioning failures and
//! cancellation: the guest session is closed, then the host session, then
//! the resource ledger releases everything in reverse acquisition order.
//! Cleanup failures become report warnings and never replace the primary
//! failure.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use vmprobe_control_plane::{ComputeApi, ControlPlaneFacade, PowerActionOutcome};
use vmprobe_core::config::VmProbeConfig;
use vmprobe_core::error::{ConfigError, VmProbeError};
use vmprobe_core::ledger::{CleanupReport, ResourceKind, ResourceLedger};
use vmprobe_core::metrics as m;
use vmprobe_core::types::{
    CommandOutput, Credentials, Instance, Keypair, PowerAction, PowerState, SecurityGroupRule,
    SessionTarget,
};
use vmprobe_remote::{RemoteSession, SessionConnector, run_staged_script};

use crate::report::{
    FailureReport, ScenarioOutcome, ScenarioReport, ScenarioState, StepOutcome, StepReport,
};
use crate::scenario::{Channel, DiskSpec, Expectation, Instruction, ScenarioCase};

/// Command used to check that a fresh guest session works.
pub const REACHABILITY_PROBE: &str = "uname -a";

/// Settings passed to the orchestrator constructor.
#[derive(Clone)]
pub struct OrchestratorSettings {
    pub image_ref: String,
    pub flavor_ref: String,
    /// Prefix for every resource name the orchestrator creates.
    pub name_prefix: String,
    pub boot_timeout: Duration,
    pub transition_timeout: Duration,
    pub poll_interval: Duration,
    pub delete_timeout: Duration,
    pub guest_command_timeout: Duration,
    pub host_command_timeout: Duration,
    pub guest_user: String,
    pub guest_port: u16,
    /// Local directory holding guest scripts.
    pub script_root: PathBuf,
    /// Guest directory scripts are staged into.
    pub staging_dir: String,
    /// Host-management address; the instance's hypervisor host when `None`.
    pub host_address: Option<String>,
    pub host_port: u16,
    pub host_credentials: Option<Credentials>,
    /// Host directory holding host-side scripts (`{scripts}`).
    pub host_script_folder: String,
    pub console_lines: u32,
}

impl OrchestratorSettings {
    pub fn from_core(config: &VmProbeConfig) -> Self {
        let host = &config.host;
        let host_credentials = (!host.username.is_empty()).then(|| Credentials::Password {
            user: host.username.clone(),
            password: host.password.clone(),
        });
        Self {
            image_ref: config.compute.image_ref.clone(),
            flavor_ref: config.compute.flavor_ref.clone(),
            name_prefix: config.compute.name_prefix.clone(),
            boot_timeout: config.compute.boot_timeout(),
            transition_timeout: config.compute.transition_timeout(),
            poll_interval: config.compute.poll_interval(),
            delete_timeout: config.compute.delete_timeout(),
            guest_command_timeout: Duration::from_secs(config.guest.command_timeout_secs),
            host_command_timeout: Duration::from_secs(host.command_timeout_secs),
            guest_user: config.guest.ssh_user.clone(),
            guest_port: config.guest.ssh_port,
            script_root: PathBuf::from(&config.guest.script_root),
            staging_dir: config
                .guest
                .remote_staging_dir
                .trim_end_matches('/')
                .to_owned(),
            host_address: (!host.address.is_empty()).then(|| host.address.clone()),
            host_port: host.port,
            host_credentials,
            host_script_folder: host.script_folder.clone(),
            console_lines: config.compute.console_lines,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_core(&VmProbeConfig::default())
    }
}

impl std::fmt::Debug for OrchestratorSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorSettings")
            .field("image_ref", &self.image_ref)
            .field("flavor_ref", &self.flavor_ref)
            .field("name_prefix", &self.name_prefix)
            .field("boot_timeout", &self.boot_timeout)
            .field("transition_timeout", &self.transition_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("guest_user", &self.guest_user)
            .field("script_root", &self.script_root)
            .field("host_address", &self.host_address)
            .field("host_credentials", &self.host_credentials)
            .finish_non_exhaustive()
    }
}

/// Why a run stopped before completing every instruction.
enum Halt {
    Failed(VmProbeError),
    Cancelled,
    Skipped(String),
}

impl From<VmProbeError> for Halt {
    fn from(err: VmProbeError) -> Self {
        Self::Failed(err)
    }
}

/// Timeouts after applying the scenario's overrides.
#[derive(Debug, Clone, Copy)]
struct Budgets {
    boot: Duration,
    transition: Duration,
    guest_command: Duration,
    host_command: Duration,
}

/// Mutable state of one run. Owned by exactly one scenario.
struct RunContext<G: SessionConnector, H: SessionConnector> {
    run_id: String,
    ledger: ResourceLedger,
    keypair: Option<Keypair>,
    instance: Option<Instance>,
    /// Last state a wait observed; gates power actions.
    observed: PowerState,
    pending_action: Option<(PowerAction, Instant)>,
    guest: Option<G::Session>,
    /// The session opened at REMOTE_READY has not run a command yet.
    guest_fresh: bool,
    host: Option<H::Session>,
    states: Vec<ScenarioState>,
    steps: Vec<StepReport>,
    console_output: Option<String>,
    /// Instruction being executed when the run stopped.
    position: (Option<usize>, String),
}

impl<G: SessionConnector, H: SessionConnector> RunContext<G, H> {
    fn new(run_id: String) -> Self {
        Self {
            run_id,
            ledger: ResourceLedger::new(),
            keypair: None,
            instance: None,
            observed: PowerState::Building,
            pending_action: None,
            guest: None,
            guest_fresh: false,
            host: None,
            states: vec![ScenarioState::Init],
            steps: Vec::new(),
            console_output: None,
            position: (None, "init".to_owned()),
        }
    }

    fn enter(&mut self, state: ScenarioState) {
        if self.states.last() != Some(&state) {
            debug!(state = %state, "scenario state");
            self.states.push(state);
        }
    }

    fn current(&self) -> ScenarioState {
        self.states.last().copied().unwrap_or(ScenarioState::Init)
    }

    fn instance(&self) -> Result<&Instance, VmProbeError> {
        self.instance.as_ref().ok_or_else(|| VmProbeError::Transition {
            instance_id: String::new(),
            reason: "no instance has been provisioned".to_owned(),
        })
    }

    /// Folds a freshly read record into the tracked instance.
    fn observe(&mut self, current: Instance) {
        self.observed = current.state;
        if let Some(instance) = self.instance.as_mut() {
            instance.state = current.state;
            instance.raw_status = current.raw_status;
            if !current.host.is_empty() {
                instance.host = current.host;
            }
            if !current.hypervisor_name.is_empty() {
                instance.hypervisor_name = current.hypervisor_name;
            }
        }
    }

    /// Closes the guest session; the next guest instruction opens a new one.
    async fn drop_guest(&mut self) {
        self.guest_fresh = false;
        if let Some(session) = self.guest.take() {
            debug!(remote = %session.target(), "closing guest session");
            session.close().await;
        }
    }
}

/// Runs scenarios against one control plane and one pair of connectors.
pub struct LifecycleOrchestrator<A, G, H> {
    facade: ControlPlaneFacade<A>,
    guest: Arc<G>,
    host: Arc<H>,
    settings: OrchestratorSettings,
}

impl<A, G, H> LifecycleOrchestrator<A, G, H>
where
    A: ComputeApi,
    G: SessionConnector,
    H: SessionConnector,
{
    pub fn new(
        facade: ControlPlaneFacade<A>,
        guest: Arc<G>,
        host: Arc<H>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            facade,
            guest,
            host,
            settings,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Runs `case` to completion and returns its report.
    ///
    /// Never returns early without teardown: every resource the run tracked
    /// has been released (or reported as a cleanup warning) when this returns.
    pub async fn run(&self, case: &ScenarioCase, cancel: &CancellationToken) -> ScenarioReport {
        let run_id = new_run_id();
        let span = info_span!("scenario", scenario = %case.name, run_id = %run_id);
        self.run_inner(case, cancel, run_id).instrument(span).await
    }

    async fn run_inner(
        &self,
        case: &ScenarioCase,
        cancel: &CancellationToken,
        run_id: String,
    ) -> ScenarioReport {
        let started_at = Utc::now();
        let started = Instant::now();
        let mut ctx: RunContext<G, H> = RunContext::new(run_id);
        info!(steps = case.steps.len(), "scenario started");

        let result = self.drive(case, &mut ctx, cancel).await;

        let (outcome, failure, skip_reason) = match result {
            Ok(()) => (ScenarioOutcome::Passed, None, None),
            Err(Halt::Skipped(reason)) => (ScenarioOutcome::Skipped, None, Some(reason)),
            Err(Halt::Cancelled) => {
                warn!(at = %ctx.position.1, "scenario cancelled");
                (ScenarioOutcome::Cancelled, None, None)
            }
            Err(Halt::Failed(error)) => {
                let (step, instruction) = ctx.position.clone();
                let mut report = FailureReport::new(&error, step, instruction);
                if let Some(instance) = ctx.instance.as_ref() {
                    report = report.with_vm_state(ctx.observed, instance.raw_status.clone());
                }
                warn!(
                    error = %error,
                    kind = %error.kind(),
                    step = ?report.step,
                    instruction = %report.instruction,
                    vm_state = ?report.last_vm_state,
                    raw_status = ?report.raw_status,
                    stdout = ?report.stdout,
                    stderr = ?report.stderr,
                    "scenario failed"
                );
                ctx.enter(ScenarioState::Failed);
                (ScenarioOutcome::Failed, Some(report), None)
            }
        };

        let cleanup = self.teardown(&mut ctx).await;
        ctx.enter(ScenarioState::TornDown);

        let warnings = cleanup.warnings();
        for warning in &warnings {
            warn!(warning = %warning, "cleanup failure");
        }
        info!(
            outcome = %outcome,
            released = cleanup.released.len(),
            duration_secs = started.elapsed().as_secs_f64(),
            "scenario finished"
        );

        ScenarioReport {
            scenario: case.name.clone(),
            run_id: ctx.run_id.clone(),
            outcome,
            started_at,
            duration: started.elapsed(),
            states: std::mem::take(&mut ctx.states),
            steps: std::mem::take(&mut ctx.steps),
            failure,
            skip_reason,
            warnings,
            cleanup,
            console_output: ctx.console_output.take(),
        }
    }

    fn budgets(&self, case: &ScenarioCase) -> Budgets {
        let t = &case.timeouts;
        Budgets {
            boot: t.boot.unwrap_or(self.settings.boot_timeout),
            transition: t.transition.unwrap_or(self.settings.transition_timeout),
            guest_command: t.command.unwrap_or(self.settings.guest_command_timeout),
            host_command: t.command.unwrap_or(self.settings.host_command_timeout),
        }
    }

    async fn drive(
        &self,
        case: &ScenarioCase,
        ctx: &mut RunContext<G, H>,
        cancel: &CancellationToken,
    ) -> Result<(), Halt> {
        if cancel.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        let budgets = self.budgets(case);

        self.provision(case, ctx, cancel, budgets).await?;
        self.attach_network(ctx).await?;
        self.open_sessions(case, ctx, cancel).await?;

        let verification_index = case.steps.len() + 1;
        let numbered = case
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| (i + 1, step))
            .chain(case.verification.iter().map(|v| (verification_index, v)));

        for (index, instruction) in numbered {
            if cancel.is_cancelled() {
                return Err(Halt::Cancelled);
            }
            ctx.position = (Some(index), instruction.to_string());
            self.run_step(index, instruction, ctx, cancel, budgets).await?;
        }

        if case.verification.is_some() {
            ctx.enter(ScenarioState::Verified);
        }
        Ok(())
    }

    // ── INIT -> PROVISIONED ─────────────────────────────────────────────

    async fn provision(
        &self,
        case: &ScenarioCase,
        ctx: &mut RunContext<G, H>,
        cancel: &CancellationToken,
        budgets: Budgets,
    ) -> Result<(), Halt> {
        let image_ref = case.image_ref.as_deref().unwrap_or(&self.settings.image_ref);
        let flavor_ref = case
            .flavor_ref
            .as_deref()
            .unwrap_or(&self.settings.flavor_ref);

        ctx.position = (None, "check flavor".to_owned());
        if !self.facade.check_flavor_fits(image_ref, flavor_ref).await? {
            return Err(Halt::Skipped(format!(
                "image '{image_ref}' does not fit flavor '{flavor_ref}'"
            )));
        }
        if cancel.is_cancelled() {
            return Err(Halt::Cancelled);
        }

        let base = format!("{}-{}-{}", self.settings.name_prefix, case.name, ctx.run_id);

        ctx.position = (None, "create keypair".to_owned());
        let keypair_name = format!("{base}-kp");
        let keypair = self.facade.create_keypair(&keypair_name).await?;
        let facade = self.facade.clone();
        ctx.ledger
            .track(ResourceKind::Keypair, keypair_name.clone(), move || async move {
                facade.delete_keypair(&keypair_name).await
            });

        ctx.position = (None, "create security group".to_owned());
        let group = self
            .facade
            .create_security_group(&format!("{base}-sg"), &SecurityGroupRule::permissive_defaults())
            .await?;
        let facade = self.facade.clone();
        let group_id = group.id.clone();
        ctx.ledger
            .track(ResourceKind::SecurityGroup, group.id.clone(), move || async move {
                facade.delete_security_group(&group_id).await
            });

        ctx.position = (None, "create instance".to_owned());
        let instance = self
            .facade
            .create_instance(&base, image_ref, flavor_ref, &keypair, std::slice::from_ref(&group))
            .await?;
        let facade = self.facade.clone();
        let instance_id = instance.id.clone();
        let (delete_timeout, poll) = (self.settings.delete_timeout, self.settings.poll_interval);
        ctx.ledger
            .track(ResourceKind::Instance, instance.id.clone(), move || async move {
                facade.delete_instance(&instance_id).await?;
                facade
                    .wait_for_deletion(&instance_id, delete_timeout, poll)
                    .await
            });
        ctx.keypair = Some(keypair);
        ctx.instance = Some(instance.clone());

        ctx.position = (None, format!("wait for {}", PowerState::Active));
        let active = cancellable(
            cancel,
            self.facade
                .wait_for_state(&instance, PowerState::Active, budgets.boot, poll),
        )
        .await?;
        ctx.observe(active);
        ctx.enter(ScenarioState::Provisioned);
        info!(instance_id = %instance.id, "instance active");
        Ok(())
    }

    // ── PROVISIONED -> NETWORKED ────────────────────────────────────────

    async fn attach_network(&self, ctx: &mut RunContext<G, H>) -> Result<(), Halt> {
        ctx.position = (None, "allocate floating ip".to_owned());
        let ip = self.facade.create_floating_ip().await?;
        let facade = self.facade.clone();
        let ip_id = ip.id.clone();
        ctx.ledger
            .track(ResourceKind::FloatingIp, ip.id.clone(), move || async move {
                facade.delete_floating_ip(&ip_id).await
            });

        ctx.position = (None, "associate floating ip".to_owned());
        let Some(instance) = ctx.instance.as_mut() else {
            return Err(Halt::Failed(VmProbeError::Transition {
                instance_id: String::new(),
                reason: "no instance to associate the floating ip with".to_owned(),
            }));
        };
        self.facade.associate_floating_ip(&ip, instance).await?;
        ctx.enter(ScenarioState::Networked);
        Ok(())
    }

    // ── NETWORKED -> REMOTE_READY ───────────────────────────────────────

    async fn open_sessions(
        &self,
        case: &ScenarioCase,
        ctx: &mut RunContext<G, H>,
        cancel: &CancellationToken,
    ) -> Result<(), Halt> {
        if case.addresses(Channel::Host) {
            ctx.position = (None, "open host session".to_owned());
            cancellable(cancel, self.host_session(ctx)).await?;
        }
        if case.addresses(Channel::Guest) {
            ctx.position = (None, "open guest session".to_owned());
            let opened = cancellable(cancel, self.guest_session(ctx)).await.map(|_| ());
            if let Err(halt) = opened {
                self.capture_console(ctx).await;
                return Err(halt);
            }
            ctx.guest_fresh = true;
        }
        ctx.enter(ScenarioState::RemoteReady);
        Ok(())
    }

    /// Returns the live guest session, opening a new one when needed.
    async fn guest_session<'c>(
        &self,
        ctx: &'c mut RunContext<G, H>,
    ) -> Result<&'c G::Session, VmProbeError> {
        if ctx.guest.as_ref().is_some_and(|s| !s.is_alive()) {
            ctx.drop_guest().await;
        }
        if ctx.guest.is_none() {
            let instance = ctx.instance()?;
            let address = instance.floating_ip.clone().ok_or_else(|| {
                VmProbeError::Transition {
                    instance_id: instance.id.clone(),
                    reason: "instance has no floating ip for the guest session".to_owned(),
                }
            })?;
            let private_key = ctx
                .keypair
                .as_ref()
                .and_then(|k| k.private_key.clone())
                .ok_or_else(|| VmProbeError::Provisioning {
                    resource: "keypair".to_owned(),
                    reason: "control plane returned no private key".to_owned(),
                })?;
            let target = SessionTarget::guest(address, self.settings.guest_port);
            let credentials = Credentials::PrivateKey {
                user: self.settings.guest_user.clone(),
                private_key,
            };
            let session = self.guest.connect(&target, &credentials).await?;
            info!(remote = %target, "guest session opened");
            ctx.guest = Some(session);
        }
        ctx.guest.as_ref().ok_or_else(|| VmProbeError::Connection {
            target: "guest".to_owned(),
            attempts: 0,
            reason: "guest session unavailable".to_owned(),
        })
    }

    /// Returns the live host session, opening a new one when needed.
    async fn host_session<'c>(
        &self,
        ctx: &'c mut RunContext<G, H>,
    ) -> Result<&'c H::Session, VmProbeError> {
        if ctx.host.as_ref().is_some_and(|s| !s.is_alive()) {
            if let Some(stale) = ctx.host.take() {
                stale.close().await;
            }
        }
        if ctx.host.is_none() {
            let address = match &self.settings.host_address {
                Some(address) => address.clone(),
                None => ctx.instance()?.host.clone(),
            };
            if address.is_empty() {
                return Err(config_error(
                    "host.address",
                    "not set and the control plane reported no hypervisor host",
                ));
            }
            let credentials = self.settings.host_credentials.clone().ok_or_else(|| {
                config_error("host.username", "required by scenarios with host-side steps")
            })?;
            let target = SessionTarget::host(address, self.settings.host_port);
            let session = self.host.connect(&target, &credentials).await?;
            info!(remote = %target, "host session opened");
            ctx.host = Some(session);
        }
        ctx.host.as_ref().ok_or_else(|| VmProbeError::Connection {
            target: "host".to_owned(),
            attempts: 0,
            reason: "host session unavailable".to_owned(),
        })
    }

    // ── steps ───────────────────────────────────────────────────────────

    async fn run_step(
        &self,
        index: usize,
        instruction: &Instruction,
        ctx: &mut RunContext<G, H>,
        cancel: &CancellationToken,
        budgets: Budgets,
    ) -> Result<(), Halt> {
        let started = Instant::now();
        info!(step = index, instruction = %instruction, "step started");

        let result = self.execute(instruction, ctx, cancel, budgets).await;
        let duration = started.elapsed();

        let (outcome, detail) = match &result {
            Ok(detail) => (StepOutcome::Passed, detail.clone()),
            Err(Halt::Failed(e)) => (StepOutcome::Failed, Some(e.to_string())),
            Err(Halt::Cancelled) => (StepOutcome::Failed, Some("cancelled".to_owned())),
            Err(Halt::Skipped(reason)) => (StepOutcome::Failed, Some(reason.clone())),
        };
        ctx.steps.push(StepReport {
            index,
            instruction: instruction.to_string(),
            duration,
            outcome,
            detail,
        });

        match result {
            Ok(_) => {
                info!(step = index, duration_secs = duration.as_secs_f64(), "step passed");
                Ok(())
            }
            Err(halt) => {
                if matches!(halt, Halt::Failed(_)) && instruction.channel() == Some(Channel::Guest) {
                    self.capture_console(ctx).await;
                }
                Err(halt)
            }
        }
    }

    /// Executes one instruction; the `Ok` value is an optional report detail.
    async fn execute(
        &self,
        instruction: &Instruction,
        ctx: &mut RunContext<G, H>,
        cancel: &CancellationToken,
        budgets: Budgets,
    ) -> Result<Option<String>, Halt> {
        match instruction {
            Instruction::Power { action } => self.power(*action, ctx).await,
            Instruction::WaitFor { state } => {
                self.wait_for(*state, ctx, cancel, budgets.transition).await
            }
            Instruction::AttachDisk { disk, expect } => {
                let command = {
                    let instance = ctx.instance()?;
                    attach_disk_command(
                        &self.settings.host_script_folder,
                        vm_name(instance),
                        &instance.host,
                        disk,
                    )
                };
                self.host_command(&command, expect, ctx, cancel, budgets.host_command)
                    .await
            }
            Instruction::InjectNmi { expect } => {
                let command = {
                    let instance = ctx.instance()?;
                    inject_nmi_command(vm_name(instance), &instance.host)
                };
                self.host_command(&command, expect, ctx, cancel, budgets.host_command)
                    .await
            }
            Instruction::HostCommand { command, expect } => {
                let command = {
                    let instance = ctx.instance()?;
                    expand_placeholders(
                        command,
                        vm_name(instance),
                        &instance.host,
                        &self.settings.host_script_folder,
                    )
                };
                self.host_command(&command, expect, ctx, cancel, budgets.host_command)
                    .await
            }
            Instruction::GuestCommand { command, expect } => {
                let timeout = budgets.guest_command;
                ctx.guest_fresh = false;
                let session = self.guest_session(ctx).await?;
                let output = cancellable(cancel, async {
                    session
                        .execute(command, &[], timeout)
                        .await
                        .map_err(VmProbeError::from)
                })
                .await?;
                check(session.target(), command, expect, output)
            }
            Instruction::GuestScript {
                script,
                args,
                expect,
            } => {
                let local = self.settings.script_root.join(script);
                if tokio::fs::metadata(&local).await.is_err() {
                    return Err(config_error(
                        "guest.script_root",
                        format!("script '{}' not found", local.display()),
                    )
                    .into());
                }
                let timeout = budgets.guest_command;
                let staging_dir = self.settings.staging_dir.clone();
                ctx.guest_fresh = false;
                let session = self.guest_session(ctx).await?;
                let output = cancellable(cancel, async {
                    run_staged_script(session, &local, &staging_dir, args, timeout)
                        .await
                        .map_err(VmProbeError::from)
                })
                .await?;
                let shown = vmprobe_remote::display_command(script, args);
                check(session.target(), &shown, expect, output)
            }
            Instruction::VerifyReachable => {
                if !std::mem::replace(&mut ctx.guest_fresh, false) {
                    ctx.drop_guest().await;
                }
                let timeout = budgets.guest_command;
                let session = cancellable(cancel, self.guest_session(ctx)).await?;
                let output = cancellable(cancel, async {
                    session
                        .run(REACHABILITY_PROBE, &[], timeout)
                        .await
                        .map_err(VmProbeError::from)
                })
                .await?;
                Ok(Some(output.stdout.trim().to_owned()).filter(|s| !s.is_empty()))
            }
        }
    }

    async fn power(
        &self,
        action: PowerAction,
        ctx: &mut RunContext<G, H>,
    ) -> Result<Option<String>, Halt> {
        let instance = ctx.instance()?.clone();
        if ctx.observed != action.target_state() && !action.allowed_from(ctx.observed) {
            return Err(VmProbeError::Transition {
                instance_id: instance.id,
                reason: format!(
                    "cannot {action}: last observed state {} is not one of {:?}",
                    ctx.observed,
                    action.preconditions()
                ),
            }
            .into());
        }

        ctx.enter(ScenarioState::Transitioning);

        match self.facade.apply_power_action(&instance, action).await? {
            PowerActionOutcome::Issued => {
                // 전원 액션 이후 게스트 세션은 재사용하지 않음
                ctx.drop_guest().await;
                ctx.observed = PowerState::Building;
                ctx.pending_action = Some((action, Instant::now()));
                Ok(None)
            }
            PowerActionOutcome::AlreadyInTarget => {
                ctx.observed = action.target_state();
                Ok(Some(format!("already {}", action.target_state())))
            }
        }
    }

    async fn wait_for(
        &self,
        state: PowerState,
        ctx: &mut RunContext<G, H>,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<Option<String>, Halt> {
        let instance = ctx.instance()?.clone();
        let current = cancellable(
            cancel,
            self.facade
                .wait_for_state(&instance, state, timeout, self.settings.poll_interval),
        )
        .await?;
        ctx.observe(current);

        if let Some((action, issued_at)) = ctx.pending_action.take() {
            if action.target_state() == state {
                metrics::histogram!(
                    m::POWER_TRANSITION_DURATION_SECONDS,
                    m::LABEL_ACTION => action.as_str()
                )
                .record(issued_at.elapsed().as_secs_f64());
            }
        }
        if ctx.current() == ScenarioState::Transitioning {
            ctx.enter(ScenarioState::RemoteReady);
        }
        Ok(None)
    }

    async fn host_command(
        &self,
        command: &str,
        expect: &Expectation,
        ctx: &mut RunContext<G, H>,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<Option<String>, Halt> {
        let session = cancellable(cancel, self.host_session(ctx)).await?;
        let output = cancellable(cancel, async {
            session
                .execute(command, &[], timeout)
                .await
                .map_err(VmProbeError::from)
        })
        .await?;
        check(session.target(), command, expect, output)
    }

    /// Fetches the console tail once per run; failures are only logged.
    async fn capture_console(&self, ctx: &mut RunContext<G, H>) {
        if ctx.console_output.is_some() {
            return;
        }
        let Some(instance) = ctx.instance.as_ref() else {
            return;
        };
        match self
            .facade
            .console_output(&instance.id, self.settings.console_lines)
            .await
        {
            Ok(console) => ctx.console_output = Some(console),
            Err(e) => warn!(instance_id = %instance.id, error = %e, "console output unavailable"),
        }
    }

    // ── TORN_DOWN ───────────────────────────────────────────────────────

    async fn teardown(&self, ctx: &mut RunContext<G, H>) -> CleanupReport {
        ctx.drop_guest().await;
        if let Some(session) = ctx.host.take() {
            debug!(remote = %session.target(), "closing host session");
            session.close().await;
        }
        ctx.ledger.release_all().await
    }
}

/// Races `fut` against cancellation.
async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, VmProbeError>>,
) -> Result<T, Halt> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Halt::Cancelled),
        result = fut => result.map_err(Halt::Failed),
    }
}

/// Applies `expect` to a command's output.
fn check(
    target: &SessionTarget,
    command: &str,
    expect: &Expectation,
    output: CommandOutput,
) -> Result<Option<String>, Halt> {
    match expect.check(&output) {
        Ok(()) => Ok(Some(format!("exit code {}", output.exit_code))),
        Err(reason) => Err(VmProbeError::CommandExecution {
            target: target.to_string(),
            command: command.to_owned(),
            reason,
            output,
        }
        .into()),
    }
}

fn vm_name(instance: &Instance) -> &str {
    if instance.hypervisor_name.is_empty() {
        &instance.name
    } else {
        &instance.hypervisor_name
    }
}

/// Host command line that attaches a new disk to `vm`.
pub fn attach_disk_command(script_folder: &str, vm: &str, host: &str, disk: &DiskSpec) -> String {
    format!(
        "powershell {script_folder}setupscripts\\attach-disk.ps1 -vmName {vm} -hvServer {host} \
         -diskType {} -controllerType {} -controllerID {} -Lun {} -vhdType {} -sectorSize {}",
        disk.format.as_str(),
        disk.controller.as_str(),
        disk.controller_id,
        disk.lun,
        disk.vhd_type.as_str(),
        disk.sector_size
    )
}

/// Host command line that injects a non-maskable interrupt into `vm`.
pub fn inject_nmi_command(vm: &str, host: &str) -> String {
    format!(
        "powershell -NonInteractive -Command \"Debug-VM -Name '{vm}' -ComputerName '{host}' \
         -InjectNonMaskableInterrupt -Confirm:$False -Force\""
    )
}

/// Replaces `{vm}`, `{host}` and `{scripts}` in a host command template.
pub fn expand_placeholders(template: &str, vm: &str, host: &str, scripts: &str) -> String {
    template
        .replace("{vm}", vm)
        .replace("{host}", host)
        .replace("{scripts}", scripts)
}

fn config_error(field: &str, reason: impl Into<String>) -> VmProbeError {
    VmProbeError::Config(ConfigError::InvalidValue {
        field: field.to_owned(),
        reason: reason.into(),
    })
}

fn new_run_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_owned()
}
