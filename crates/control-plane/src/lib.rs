//! vmprobe 컨트롤 플레인 크레이트
//!
//! # Module Structure
//!
//! - [`error`]: Domain error types (`ControlPlaneError`)
//! - [`config`]: Client and wait settings (`ControlPlaneSettings`, builder)
//! - [`api`]: Compute API abstraction (`ComputeApi` trait)
//! - [`openstack`]: Identity v3 + Compute v2.1 implementation (`OpenStackClient`)
//! - [`facade`]: State waits and idempotent actions (`ControlPlaneFacade`)

pub mod api;
pub mod config;
pub mod error;
pub mod facade;
pub mod openstack;

// --- Public API Re-exports ---

pub use api::{ComputeApi, ServerCreateRequest};
pub use config::{ControlPlaneSettings, ControlPlaneSettingsBuilder};
pub use error::ControlPlaneError;
pub use facade::{ControlPlaneFacade, PowerActionOutcome};
pub use openstack::OpenStackClient;
