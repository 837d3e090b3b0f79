//! E2E scenarios, one module per scenario family.

mod boot_timeout;
mod lifecycle;
mod nmi;
mod provisioning_failure;
mod storage;

use vmprobe_runner::ScenarioCase;
use vmprobe_runner::catalog;

/// Looks up a built-in scenario by name.
pub(crate) fn builtin(name: &str) -> ScenarioCase {
    catalog::builtin()
        .unwrap()
        .into_iter()
        .find(|s| s.name == name)
        .unwrap_or_else(|| panic!("no built-in scenario named {name}"))
}
