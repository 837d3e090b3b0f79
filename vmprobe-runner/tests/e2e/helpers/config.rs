//! Orchestrator settings for E2E runs.

use std::time::Duration;

use tempfile::TempDir;

use vmprobe_core::types::Credentials;
use vmprobe_runner::OrchestratorSettings;
use vmprobe_runner::catalog::{FORMAT_SCRIPT, VERIFY_NMI_SCRIPT};

/// Builder for test-friendly [`OrchestratorSettings`].
///
/// Owns a temporary script root holding stub copies of the catalog's guest
/// scripts; keep the builder's [`TempDir`] alive for the whole run.
pub struct TestSettings {
    settings: OrchestratorSettings,
    scripts: TempDir,
}

#[allow(dead_code)]
impl TestSettings {
    pub fn new() -> Self {
        let scripts = tempfile::tempdir().unwrap();
        for script in [FORMAT_SCRIPT, VERIFY_NMI_SCRIPT] {
            std::fs::write(scripts.path().join(script), "#!/bin/bash\nexit 0\n").unwrap();
        }

        let settings = OrchestratorSettings {
            image_ref: "ubuntu-22.04".to_owned(),
            flavor_ref: "m1.small".to_owned(),
            name_prefix: "vmprobe".to_owned(),
            boot_timeout: Duration::from_secs(120),
            transition_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
            delete_timeout: Duration::from_secs(60),
            guest_command_timeout: Duration::from_secs(300),
            host_command_timeout: Duration::from_secs(120),
            guest_user: "ubuntu".to_owned(),
            guest_port: 22,
            script_root: scripts.path().to_path_buf(),
            staging_dir: "/tmp/vmprobe".to_owned(),
            host_address: None,
            host_port: 5985,
            host_credentials: Some(Credentials::Password {
                user: "Administrator".to_owned(),
                password: "P@ssw0rd".to_owned(),
            }),
            host_script_folder: "C:\\vmprobe\\".to_owned(),
            console_lines: 50,
        };
        Self { settings, scripts }
    }

    pub fn boot_timeout(mut self, timeout: Duration) -> Self {
        self.settings.boot_timeout = timeout;
        self
    }

    pub fn host_address(mut self, address: &str) -> Self {
        self.settings.host_address = Some(address.to_owned());
        self
    }

    pub fn without_host_credentials(mut self) -> Self {
        self.settings.host_credentials = None;
        self
    }

    /// Removes a stub script from the script root.
    pub fn without_script(self, script: &str) -> Self {
        std::fs::remove_file(self.scripts.path().join(script)).unwrap();
        self
    }

    pub fn build(self) -> (OrchestratorSettings, TempDir) {
        (self.settings, self.scripts)
    }
}
