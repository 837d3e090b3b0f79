//! Control-plane facade.
//!
//! [`ControlPlaneFacade`] wraps a [`ComputeApi`] with the behaviour scenarios
//! rely on: blocking state waits with a deadline, idempotent power actions
//! checked against the transition table, idempotent releases and mapping of
//! API failures onto the [`VmProbeError`] taxonomy.
//!
//! No operation here retries a control-plane call.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use vmprobe_core::error::VmProbeError;
use vmprobe_core::metrics as m;
use vmprobe_core::types::{
    FloatingIp, Instance, Keypair, PowerAction, PowerState, SecurityGroup, SecurityGroupRule,
};

use crate::api::{ComputeApi, ServerCreateRequest};
use crate::config::ControlPlaneSettings;
use crate::error::ControlPlaneError;

/// Result of [`ControlPlaneFacade::apply_power_action`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerActionOutcome {
    /// The action was sent to the control plane.
    Issued,
    /// The instance was already in the action's target state; nothing was sent.
    AlreadyInTarget,
}

/// Facade over the compute control plane.
pub struct ControlPlaneFacade<A> {
    api: Arc<A>,
    settings: ControlPlaneSettings,
}

impl<A> Clone for ControlPlaneFacade<A> {
    fn clone(&self) -> Self {
        Self {
            api: Arc::clone(&self.api),
            settings: self.settings.clone(),
        }
    }
}

impl<A: ComputeApi> ControlPlaneFacade<A> {
    pub fn new(api: Arc<A>, settings: ControlPlaneSettings) -> Self {
        Self { api, settings }
    }

    pub fn settings(&self) -> &ControlPlaneSettings {
        &self.settings
    }

    pub fn api(&self) -> &Arc<A> {
        &self.api
    }

    // ── keypairs & security groups ──────────────────────────────────────

    /// Creates a keypair. Name collisions and quota errors are `Provisioning`.
    pub async fn create_keypair(&self, name: &str) -> Result<Keypair, VmProbeError> {
        let keypair = self
            .api
            .create_keypair(name)
            .await
            .map_err(|e| provisioning("keypair", name, e))?;
        info!(keypair = %keypair.name, fingerprint = %keypair.fingerprint, "keypair created");
        Ok(keypair)
    }

    /// Deletes a keypair. An already missing keypair counts as released.
    pub async fn delete_keypair(&self, name: &str) -> Result<(), VmProbeError> {
        release(self.api.delete_keypair(name).await, "keypair", name)
    }

    /// Creates a security group and adds `rules` in order.
    ///
    /// If a rule is rejected the half-built group is deleted before returning.
    pub async fn create_security_group(
        &self,
        name: &str,
        rules: &[SecurityGroupRule],
    ) -> Result<SecurityGroup, VmProbeError> {
        let mut group = self
            .api
            .create_security_group(name, "vmprobe scenario access")
            .await
            .map_err(|e| provisioning("security group", name, e))?;

        for rule in rules {
            if let Err(e) = self.api.add_security_group_rule(&group.id, rule).await {
                warn!(group = %group.id, error = %e, "security group rule rejected, removing group");
                if let Err(cleanup) = self.api.delete_security_group(&group.id).await {
                    warn!(group = %group.id, error = %cleanup, "failed to remove half-built group");
                }
                return Err(provisioning("security group rule", name, e));
            }
            group.rules.push(rule.clone());
        }

        info!(group = %group.id, rules = group.rules.len(), "security group created");
        Ok(group)
    }

    /// Deletes a security group. An already missing group counts as released.
    pub async fn delete_security_group(&self, id: &str) -> Result<(), VmProbeError> {
        release(self.api.delete_security_group(id).await, "security group", id)
    }

    // ── instances ───────────────────────────────────────────────────────

    /// Requests an instance. The returned instance is `Building`; callers poll
    /// with [`wait_for_state`](Self::wait_for_state).
    pub async fn create_instance(
        &self,
        name: &str,
        image_ref: &str,
        flavor_ref: &str,
        keypair: &Keypair,
        security_groups: &[SecurityGroup],
    ) -> Result<Instance, VmProbeError> {
        let request = ServerCreateRequest {
            name: name.to_owned(),
            image_ref: image_ref.to_owned(),
            flavor_ref: flavor_ref.to_owned(),
            key_name: keypair.name.clone(),
            security_groups: security_groups.iter().map(|g| g.name.clone()).collect(),
        };
        let mut instance = self
            .api
            .create_server(&request)
            .await
            .map_err(|e| provisioning("instance", name, e))?;

        // 생성 직후 응답에는 상태가 없으므로 항상 BUILDING으로 시작
        instance.state = PowerState::Building;
        instance.key_name = Some(keypair.name.clone());
        instance.security_groups = request.security_groups;
        info!(
            instance_id = %instance.id,
            instance_name = name,
            image_ref,
            flavor_ref,
            "instance requested"
        );
        Ok(instance)
    }

    /// Reads the current instance record.
    pub async fn get_instance(&self, id: &str) -> Result<Instance, VmProbeError> {
        Ok(self.api.get_server(id).await?)
    }

    /// Polls the instance until `target` is observed or `timeout` elapses.
    ///
    /// - a zero `timeout` fails immediately without polling
    /// - `Error` is a `Transition` failure, and so is `Deleted` unless it is the target
    /// - on expiry the `Timeout` carries the last observed status
    pub async fn wait_for_state(
        &self,
        instance: &Instance,
        target: PowerState,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Instance, VmProbeError> {
        let operation = format!("wait for {target} on instance {}", instance.id);
        if timeout.is_zero() {
            metrics::counter!(m::WAIT_TIMEOUTS_TOTAL).increment(1);
            return Err(VmProbeError::Timeout {
                operation,
                budget: timeout,
                last_observed: describe(instance),
            });
        }

        let deadline = Instant::now() + timeout;

        loop {
            metrics::counter!(m::WAIT_POLLS_TOTAL).increment(1);
            let current = match self.api.get_server(&instance.id).await {
                Ok(current) => current,
                Err(e) if e.is_not_found() && target == PowerState::Deleted => {
                    let mut gone = instance.clone();
                    gone.state = PowerState::Deleted;
                    gone.raw_status = "DELETED".to_owned();
                    return Ok(gone);
                }
                Err(e) if e.is_not_found() => {
                    return Err(VmProbeError::Transition {
                        instance_id: instance.id.clone(),
                        reason: format!("instance disappeared while waiting for {target}"),
                    });
                }
                Err(e) => return Err(e.into()),
            };

            if current.state == target {
                debug!(instance_id = %current.id, state = %target, "target state observed");
                return Ok(current);
            }
            if current.state == PowerState::Error {
                return Err(VmProbeError::Transition {
                    instance_id: current.id.clone(),
                    reason: format!(
                        "instance entered ERROR (status {}) while waiting for {target}",
                        current.raw_status
                    ),
                });
            }
            if current.state == PowerState::Deleted {
                return Err(VmProbeError::Transition {
                    instance_id: current.id.clone(),
                    reason: format!("instance was deleted while waiting for {target}"),
                });
            }

            let last_observed = describe(&current);
            let now = Instant::now();
            if now >= deadline {
                metrics::counter!(m::WAIT_TIMEOUTS_TOTAL).increment(1);
                warn!(instance_id = %instance.id, target = %target, last_observed = %last_observed, "state wait timed out");
                return Err(VmProbeError::Timeout {
                    operation,
                    budget: timeout,
                    last_observed,
                });
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// Issues `action` without waiting for it to complete.
    ///
    /// Re-reads the instance first: already in the target state is a no-op,
    /// a state outside the action's preconditions is a `Transition` failure.
    pub async fn apply_power_action(
        &self,
        instance: &Instance,
        action: PowerAction,
    ) -> Result<PowerActionOutcome, VmProbeError> {
        let current = self.api.get_server(&instance.id).await?;

        if current.state == action.target_state() {
            debug!(instance_id = %current.id, action = %action, "instance already in target state");
            return Ok(PowerActionOutcome::AlreadyInTarget);
        }
        if current.state.is_terminal() || !action.allowed_from(current.state) {
            return Err(VmProbeError::Transition {
                instance_id: current.id.clone(),
                reason: format!("cannot {action} from {}", current.state),
            });
        }

        let result = self.api.server_action(&current.id, action).await;
        let label = if result.is_ok() { "success" } else { "failure" };
        metrics::counter!(
            m::POWER_ACTIONS_TOTAL,
            m::LABEL_ACTION => action.as_str(),
            m::LABEL_RESULT => label
        )
        .increment(1);

        match result {
            Ok(()) => {
                info!(instance_id = %current.id, action = %action, from = %current.state, "power action issued");
                Ok(PowerActionOutcome::Issued)
            }
            Err(ControlPlaneError::Conflict(reason)) => Err(VmProbeError::Transition {
                instance_id: current.id.clone(),
                reason: format!("{action} rejected: {reason}"),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes an instance. An already missing instance counts as released.
    pub async fn delete_instance(&self, instance_id: &str) -> Result<(), VmProbeError> {
        release(self.api.delete_server(instance_id).await, "instance", instance_id)
    }

    /// Polls until the control plane no longer reports the instance.
    pub async fn wait_for_deletion(
        &self,
        instance_id: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<(), VmProbeError> {
        let deadline = Instant::now() + timeout;
        loop {
            metrics::counter!(m::WAIT_POLLS_TOTAL).increment(1);
            let last_observed = match self.api.get_server(instance_id).await {
                Ok(current) if current.state == PowerState::Deleted => return Ok(()),
                Ok(current) => describe(&current),
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            let now = Instant::now();
            if now >= deadline {
                metrics::counter!(m::WAIT_TIMEOUTS_TOTAL).increment(1);
                return Err(VmProbeError::Timeout {
                    operation: format!("wait for deletion of instance {instance_id}"),
                    budget: timeout,
                    last_observed,
                });
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// Returns the tail of the instance console log.
    pub async fn console_output(&self, instance_id: &str, lines: u32) -> Result<String, VmProbeError> {
        Ok(self.api.console_output(instance_id, lines).await?)
    }

    /// Checks that the image's minimum disk and RAM fit into the flavor.
    pub async fn check_flavor_fits(
        &self,
        image_ref: &str,
        flavor_ref: &str,
    ) -> Result<bool, VmProbeError> {
        let image = self.api.get_image(image_ref).await?;
        let flavor = self.api.get_flavor(flavor_ref).await?;
        let fits = image.fits(&flavor);
        if !fits {
            info!(
                image_ref,
                flavor_ref,
                min_disk_gb = image.min_disk_gb,
                disk_gb = flavor.disk_gb,
                min_ram_mb = image.min_ram_mb,
                ram_mb = flavor.ram_mb,
                "image does not fit flavor"
            );
        }
        Ok(fits)
    }

    // ── floating IPs ────────────────────────────────────────────────────

    /// Allocates a floating IP from the configured pool.
    pub async fn create_floating_ip(&self) -> Result<FloatingIp, VmProbeError> {
        let pool = &self.settings.floating_ip_pool;
        let ip = self
            .api
            .allocate_floating_ip(pool)
            .await
            .map_err(|e| provisioning("floating ip", pool, e))?;
        info!(address = %ip.address, pool = %ip.pool, "floating ip allocated");
        Ok(ip)
    }

    /// Binds `ip` to `instance` and records the binding on the instance.
    ///
    /// Binding the same address again is a no-op; binding a second address
    /// to an instance that already has one is rejected.
    pub async fn associate_floating_ip(
        &self,
        ip: &FloatingIp,
        instance: &mut Instance,
    ) -> Result<(), VmProbeError> {
        match instance.floating_ip.as_deref() {
            Some(bound) if bound == ip.address => return Ok(()),
            Some(bound) => {
                return Err(VmProbeError::Provisioning {
                    resource: format!("floating ip {}", ip.address),
                    reason: format!("instance {} already bound to {bound}", instance.id),
                });
            }
            None => {}
        }
        self.api
            .associate_floating_ip(&instance.id, &ip.address)
            .await
            .map_err(|e| provisioning("floating ip association", &ip.address, e))?;
        instance.floating_ip = Some(ip.address.clone());
        info!(instance_id = %instance.id, address = %ip.address, "floating ip associated");
        Ok(())
    }

    /// Releases a floating IP. An already missing address counts as released.
    pub async fn delete_floating_ip(&self, id: &str) -> Result<(), VmProbeError> {
        release(self.api.release_floating_ip(id).await, "floating ip", id)
    }
}

fn describe(instance: &Instance) -> String {
    if instance.raw_status.is_empty() {
        instance.state.to_string()
    } else {
        format!("{} ({})", instance.state, instance.raw_status)
    }
}

fn provisioning(resource: &str, name: &str, err: ControlPlaneError) -> VmProbeError {
    match err {
        ControlPlaneError::Http(_) | ControlPlaneError::Auth(_) | ControlPlaneError::Decode(_) => {
            err.into()
        }
        other => VmProbeError::Provisioning {
            resource: format!("{resource} '{name}'"),
            reason: other.to_string(),
        },
    }
}

fn release(result: Result<(), ControlPlaneError>, resource: &str, id: &str) -> Result<(), VmProbeError> {
    match result {
        Ok(()) => {
            debug!(resource, id, "released");
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            debug!(resource, id, "already gone");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::{MockComputeApi, instance};
    use vmprobe_core::types::{Flavor, ImageInfo};

    fn facade(api: MockComputeApi) -> (ControlPlaneFacade<MockComputeApi>, Arc<MockComputeApi>) {
        let api = Arc::new(api);
        (
            ControlPlaneFacade::new(Arc::clone(&api), ControlPlaneSettings::default()),
            api,
        )
    }

    const POLL: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn wait_returns_once_target_observed() {
        let (facade, api) = facade(MockComputeApi::new().with_server("a", &["BUILD", "BUILD", "ACTIVE"]));
        let start = Instant::now();

        let active = facade
            .wait_for_state(&instance("a", "BUILD"), PowerState::Active, Duration::from_secs(60), POLL)
            .await
            .unwrap();

        assert_eq!(active.state, PowerState::Active);
        assert_eq!(api.count_calls("get_server"), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_fails_without_polling() {
        let (facade, api) = facade(MockComputeApi::new().with_server("a", &["ACTIVE"]));

        let err = facade
            .wait_for_state(&instance("a", "BUILD"), PowerState::Active, Duration::ZERO, POLL)
            .await
            .unwrap_err();

        assert!(matches!(err, VmProbeError::Timeout { .. }));
        assert_eq!(api.count_calls("get_server"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_carries_last_observed_status() {
        let (facade, _api) = facade(MockComputeApi::new().with_server("a", &["BUILD"]));

        let err = facade
            .wait_for_state(&instance("a", "BUILD"), PowerState::Active, Duration::from_secs(12), POLL)
            .await
            .unwrap_err();

        match err {
            VmProbeError::Timeout {
                budget,
                last_observed,
                ..
            } => {
                assert_eq!(budget, Duration::from_secs(12));
                assert_eq!(last_observed, "BUILDING (BUILD)");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn error_state_is_a_transition_failure() {
        let (facade, _api) = facade(MockComputeApi::new().with_server("a", &["BUILD", "ERROR"]));

        let err = facade
            .wait_for_state(&instance("a", "BUILD"), PowerState::Active, Duration::from_secs(60), POLL)
            .await
            .unwrap_err();

        assert!(matches!(err, VmProbeError::Transition { .. }));
        assert!(err.to_string().contains("ERROR"));
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_while_waiting_is_a_transition_failure() {
        let (facade, _api) = facade(MockComputeApi::new().with_server("a", &["SOFT_DELETED"]));

        let err = facade
            .wait_for_state(&instance("a", "ACTIVE"), PowerState::Shutoff, Duration::from_secs(60), POLL)
            .await
            .unwrap_err();

        assert!(matches!(err, VmProbeError::Transition { .. }));
    }

    #[tokio::test]
    async fn power_action_in_target_state_is_noop() {
        let (facade, api) = facade(MockComputeApi::new().with_server("a", &["SHUTOFF"]));

        let outcome = facade
            .apply_power_action(&instance("a", "SHUTOFF"), PowerAction::Stop)
            .await
            .unwrap();

        assert_eq!(outcome, PowerActionOutcome::AlreadyInTarget);
        assert_eq!(api.count_calls("server_action"), 0);
    }

    #[tokio::test]
    async fn power_action_outside_preconditions_is_rejected() {
        let (facade, api) = facade(MockComputeApi::new().with_server("a", &["SHUTOFF"]));

        let err = facade
            .apply_power_action(&instance("a", "SHUTOFF"), PowerAction::Pause)
            .await
            .unwrap_err();

        assert!(matches!(err, VmProbeError::Transition { .. }));
        assert!(err.to_string().contains("cannot pause from SHUTOFF"));
        assert_eq!(api.count_calls("server_action"), 0);
    }

    #[tokio::test]
    async fn power_action_from_error_is_rejected() {
        let (facade, _api) = facade(MockComputeApi::new().with_server("a", &["ERROR"]));

        let err = facade
            .apply_power_action(&instance("a", "ERROR"), PowerAction::Start)
            .await
            .unwrap_err();

        assert!(matches!(err, VmProbeError::Transition { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_then_start_keeps_identity() {
        let (facade, _api) = facade(MockComputeApi::new().with_server("a", &["ACTIVE"]));
        let original = instance("a", "ACTIVE");

        facade.apply_power_action(&original, PowerAction::Stop).await.unwrap();
        let stopped = facade
            .wait_for_state(&original, PowerState::Shutoff, Duration::from_secs(60), POLL)
            .await
            .unwrap();
        facade.apply_power_action(&stopped, PowerAction::Start).await.unwrap();
        let started = facade
            .wait_for_state(&stopped, PowerState::Active, Duration::from_secs(60), POLL)
            .await
            .unwrap();

        assert_eq!(started.id, original.id);
        assert_eq!(started.state, PowerState::Active);
    }

    #[tokio::test]
    async fn create_failure_is_provisioning_error() {
        let (facade, _api) = facade(MockComputeApi::new().with_failing_creates());

        let err = facade.create_keypair("kp-1").await.unwrap_err();

        assert!(matches!(err, VmProbeError::Provisioning { .. }));
        assert!(err.to_string().contains("Quota exceeded"));
    }

    #[tokio::test]
    async fn security_group_rules_are_added_in_order() {
        let (facade, api) = facade(MockComputeApi::new());

        let group = facade
            .create_security_group("sg-1", &SecurityGroupRule::permissive_defaults())
            .await
            .unwrap();

        assert_eq!(group.rules.len(), 2);
        let rules: Vec<String> = api
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("add_rule"))
            .collect();
        assert_eq!(rules, vec!["add_rule sg-sg-1 tcp 22", "add_rule sg-sg-1 icmp -1"]);
    }

    #[tokio::test]
    async fn release_of_missing_resource_is_ok() {
        let (facade, _api) = facade(MockComputeApi::new().with_failing_deletes());

        // mock은 보안 그룹 삭제 실패를 NotFound로 보고
        facade.delete_security_group("sg-gone").await.unwrap();
    }

    #[tokio::test]
    async fn release_failure_propagates() {
        let (facade, _api) = facade(MockComputeApi::new().with_failing_deletes());

        let err = facade.delete_instance("a").await.unwrap_err();
        assert!(matches!(err, VmProbeError::ControlPlane(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_deletion_returns_when_gone() {
        let (facade, api) = facade(MockComputeApi::new().with_server("a", &["ACTIVE"]));
        facade.delete_instance("a").await.unwrap();

        facade
            .wait_for_deletion("a", Duration::from_secs(30), POLL)
            .await
            .unwrap();
        assert_eq!(api.count_calls("get_server"), 1);
    }

    #[tokio::test]
    async fn floating_ip_binds_once() {
        let (facade, _api) = facade(MockComputeApi::new().with_server("a", &["ACTIVE"]));
        let mut vm = instance("a", "ACTIVE");
        let ip = facade.create_floating_ip().await.unwrap();

        facade.associate_floating_ip(&ip, &mut vm).await.unwrap();
        facade.associate_floating_ip(&ip, &mut vm).await.unwrap();
        assert_eq!(vm.floating_ip.as_deref(), Some("172.24.4.10"));

        let other = FloatingIp {
            address: "172.24.4.11".to_owned(),
            ..ip
        };
        let err = facade.associate_floating_ip(&other, &mut vm).await.unwrap_err();
        assert!(matches!(err, VmProbeError::Provisioning { .. }));
    }

    #[tokio::test]
    async fn flavor_fit_check() {
        let mut api = MockComputeApi::new();
        api.flavor = Some(Flavor {
            id: "1".to_owned(),
            ram_mb: 512,
            disk_gb: 1,
        });
        api.image = Some(ImageInfo {
            id: "img".to_owned(),
            min_ram_mb: 256,
            min_disk_gb: 10,
        });
        let (facade, _api) = facade(api);

        assert!(!facade.check_flavor_fits("img", "1").await.unwrap());
    }
}
