//! Shared E2E test helpers.

pub mod config;
pub mod fake_compute;
pub mod scripted_connector;

use std::sync::Arc;

use vmprobe_control_plane::{ControlPlaneFacade, ControlPlaneSettings};
use vmprobe_runner::{LifecycleOrchestrator, OrchestratorSettings};

use fake_compute::FakeCompute;
use scripted_connector::ScriptedConnector;

pub type TestOrchestrator = LifecycleOrchestrator<FakeCompute, ScriptedConnector, ScriptedConnector>;

/// Everything a scenario test needs to inspect after a run.
pub struct Harness {
    pub cloud: Arc<FakeCompute>,
    pub guest: Arc<ScriptedConnector>,
    pub host: Arc<ScriptedConnector>,
    pub orchestrator: TestOrchestrator,
}

impl Harness {
    pub fn new(
        cloud: FakeCompute,
        guest: ScriptedConnector,
        host: ScriptedConnector,
        settings: OrchestratorSettings,
    ) -> Self {
        let cloud = Arc::new(cloud);
        let guest = Arc::new(guest);
        let host = Arc::new(host);
        let facade = ControlPlaneFacade::new(Arc::clone(&cloud), ControlPlaneSettings::default());
        let orchestrator =
            LifecycleOrchestrator::new(facade, Arc::clone(&guest), Arc::clone(&host), settings);
        Self {
            cloud,
            guest,
            host,
            orchestrator,
        }
    }
}
