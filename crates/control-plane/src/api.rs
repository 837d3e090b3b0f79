//! Compute API abstraction for testability.
//!
//! The [`ComputeApi`] trait covers exactly the control-plane calls a scenario
//! needs. Production code uses [`OpenStackClient`](crate::OpenStackClient);
//! unit tests use `MockComputeApi`.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────┐
//! │ ControlPlaneFacade │  waits, idempotency, error taxonomy
//! └─────────┬──────────┘
//!           ▼
//!     ┌───────────┐
//!     │ComputeApi │ (trait)
//!     └───────────┘
//!        │      │
//!        ▼      ▼
//!  ┌─────────┐ ┌────┐
//!  │OpenStack│ │Mock│
//!  └─────────┘ └────┘
//! ```

use std::future::Future;

use vmprobe_core::types::{
    Flavor, FloatingIp, ImageInfo, Instance, Keypair, PowerAction, SecurityGroup,
    SecurityGroupRule,
};

use crate::error::ControlPlaneError;

/// Server creation parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCreateRequest {
    pub name: String,
    pub image_ref: String,
    pub flavor_ref: String,
    pub key_name: String,
    /// Security group names.
    pub security_groups: Vec<String>,
}

/// Trait abstracting compute control-plane operations.
///
/// Implementations perform a single request per call and never wait for a
/// state to settle; polling lives in the facade.
///
/// # Error Handling
///
/// - missing resources: `ControlPlaneError::NotFound`
/// - state conflicts: `ControlPlaneError::Conflict`
/// - everything else the API rejects: `ControlPlaneError::Api`
pub trait ComputeApi: Send + Sync + 'static {
    /// Creates a keypair and returns it with the generated private key.
    fn create_keypair(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Keypair, ControlPlaneError>> + Send;

    fn delete_keypair(&self, name: &str)
    -> impl Future<Output = Result<(), ControlPlaneError>> + Send;

    /// Creates an empty security group.
    fn create_security_group(
        &self,
        name: &str,
        description: &str,
    ) -> impl Future<Output = Result<SecurityGroup, ControlPlaneError>> + Send;

    fn add_security_group_rule(
        &self,
        group_id: &str,
        rule: &SecurityGroupRule,
    ) -> impl Future<Output = Result<(), ControlPlaneError>> + Send;

    fn delete_security_group(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<(), ControlPlaneError>> + Send;

    /// Requests a new server. The returned instance is not settled yet.
    fn create_server(
        &self,
        request: &ServerCreateRequest,
    ) -> impl Future<Output = Result<Instance, ControlPlaneError>> + Send;

    /// Reads the current server record.
    fn get_server(&self, id: &str)
    -> impl Future<Output = Result<Instance, ControlPlaneError>> + Send;

    fn delete_server(&self, id: &str)
    -> impl Future<Output = Result<(), ControlPlaneError>> + Send;

    /// Issues a power action without waiting for it to complete.
    fn server_action(
        &self,
        id: &str,
        action: PowerAction,
    ) -> impl Future<Output = Result<(), ControlPlaneError>> + Send;

    fn allocate_floating_ip(
        &self,
        pool: &str,
    ) -> impl Future<Output = Result<FloatingIp, ControlPlaneError>> + Send;

    fn associate_floating_ip(
        &self,
        server_id: &str,
        address: &str,
    ) -> impl Future<Output = Result<(), ControlPlaneError>> + Send;

    fn release_floating_ip(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<(), ControlPlaneError>> + Send;

    fn get_flavor(&self, id: &str)
    -> impl Future<Output = Result<Flavor, ControlPlaneError>> + Send;

    fn get_image(&self, id: &str)
    -> impl Future<Output = Result<ImageInfo, ControlPlaneError>> + Send;

    /// Returns the last `lines` lines of the server console log.
    fn console_output(
        &self,
        server_id: &str,
        lines: u32,
    ) -> impl Future<Output = Result<String, ControlPlaneError>> + Send;
}
