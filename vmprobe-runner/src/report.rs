//! Scenario and suite reports.

use std::fmt;
use std::io::Write;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use vmprobe_core::error::{ErrorKind, VmProbeError};
use vmprobe_core::ledger::CleanupReport;
use vmprobe_core::types::PowerState;

use crate::output::Render;

/// Orchestration state of one scenario run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScenarioState {
    Init,
    Provisioned,
    Networked,
    RemoteReady,
    Transitioning,
    Verified,
    Failed,
    TornDown,
}

impl fmt::Display for ScenarioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::Provisioned => "PROVISIONED",
            Self::Networked => "NETWORKED",
            Self::RemoteReady => "REMOTE_READY",
            Self::Transitioning => "TRANSITIONING",
            Self::Verified => "VERIFIED",
            Self::Failed => "FAILED",
            Self::TornDown => "TORN_DOWN",
        };
        f.write_str(s)
    }
}

/// Final result of a scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioOutcome {
    Passed,
    Failed,
    /// The image does not fit the flavor; nothing was provisioned.
    Skipped,
    /// Cancelled before completion; teardown still ran.
    Cancelled,
}

impl ScenarioOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ScenarioOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Passed,
    Failed,
}

/// One executed step.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub instruction: String,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub outcome: StepOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Lines of command output kept in a failure report.
pub const OUTPUT_TAIL_LINES: usize = 20;

/// The terminal failure of a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub kind: ErrorKind,
    /// Step index; `None` for provisioning, networking and session setup.
    pub step: Option<usize>,
    pub instruction: String,
    pub message: String,
    /// Last power state the run observed; `None` before an instance existed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_vm_state: Option<PowerState>,
    /// Control-plane status string from the last instance read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_status: Option<String>,
    /// Tail of the failed command's stdout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    /// Tail of the failed command's stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl FailureReport {
    pub fn new(error: &VmProbeError, step: Option<usize>, instruction: impl Into<String>) -> Self {
        let output = error.command_output();
        Self {
            kind: error.kind(),
            step,
            instruction: instruction.into(),
            message: error.to_string(),
            last_vm_state: None,
            raw_status: None,
            stdout: output.and_then(|o| tail(&o.stdout, OUTPUT_TAIL_LINES)),
            stderr: output.and_then(|o| tail(&o.stderr, OUTPUT_TAIL_LINES)),
        }
    }

    /// Attaches the last known instance state.
    pub fn with_vm_state(mut self, state: PowerState, raw_status: impl Into<String>) -> Self {
        let raw_status = raw_status.into();
        self.last_vm_state = Some(state);
        self.raw_status = Some(raw_status).filter(|s| !s.is_empty());
        self
    }
}

/// Last `lines` lines of `text`; `None` when blank.
fn tail(text: &str, lines: usize) -> Option<String> {
    let trimmed = text.trim_end();
    if trimmed.trim().is_empty() {
        return None;
    }
    let all: Vec<&str> = trimmed.lines().collect();
    let start = all.len().saturating_sub(lines);
    Some(all[start..].join("\n"))
}

/// Report of one scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub run_id: String,
    pub outcome: ScenarioOutcome,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    /// Every state the run passed through, in order.
    pub states: Vec<ScenarioState>,
    pub steps: Vec<StepReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    /// Cleanup failures, reported as warnings.
    pub warnings: Vec<String>,
    pub cleanup: CleanupReport,
    /// Console tail fetched after a guest step failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub console_output: Option<String>,
}

impl ScenarioReport {
    /// Report for a run whose task ended without producing one.
    ///
    /// Teardown did not complete, so the run's resources may still exist.
    pub fn aborted(scenario: impl Into<String>, error: &VmProbeError) -> Self {
        Self {
            scenario: scenario.into(),
            run_id: String::new(),
            outcome: ScenarioOutcome::Failed,
            started_at: Utc::now(),
            duration: Duration::ZERO,
            states: vec![ScenarioState::Failed],
            steps: Vec::new(),
            failure: Some(FailureReport::new(error, None, "scenario task")),
            skip_reason: None,
            warnings: vec!["teardown did not run; resources may have leaked".to_owned()],
            cleanup: CleanupReport::default(),
            console_output: None,
        }
    }

    pub fn final_state(&self) -> Option<ScenarioState> {
        self.states.last().copied()
    }

    pub fn reached(&self, state: ScenarioState) -> bool {
        self.states.contains(&state)
    }
}

/// Aggregate of a suite run.
#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    pub scenarios: Vec<ScenarioReport>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
}

impl SuiteReport {
    pub fn count(&self, outcome: ScenarioOutcome) -> usize {
        self.scenarios.iter().filter(|r| r.outcome == outcome).count()
    }

    /// `true` when every scenario passed or was skipped.
    pub fn succeeded(&self) -> bool {
        self.scenarios
            .iter()
            .all(|r| matches!(r.outcome, ScenarioOutcome::Passed | ScenarioOutcome::Skipped))
    }
}

impl Render for SuiteReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        for report in &self.scenarios {
            writeln!(
                w,
                "{:<28} {:<10} {:>8.1}s  [{}]",
                report.scenario,
                report.outcome.as_str().to_uppercase(),
                report.duration.as_secs_f64(),
                report.run_id
            )?;
            for step in &report.steps {
                let mark = match step.outcome {
                    StepOutcome::Passed => "ok",
                    StepOutcome::Failed => "FAIL",
                };
                writeln!(
                    w,
                    "    {:>2}. {:<48} {:<4} {:>7.1}s",
                    step.index,
                    step.instruction,
                    mark,
                    step.duration.as_secs_f64()
                )?;
            }
            if let Some(reason) = &report.skip_reason {
                writeln!(w, "    skipped: {reason}")?;
            }
            if let Some(failure) = &report.failure {
                let at = failure
                    .step
                    .map_or_else(|| failure.instruction.clone(), |s| format!("step {s} ({})", failure.instruction));
                writeln!(w, "    error [{}] at {at}: {}", failure.kind, failure.message)?;
                if let Some(state) = failure.last_vm_state {
                    match &failure.raw_status {
                        Some(raw) => writeln!(w, "    vm state: {state} ({raw})")?,
                        None => writeln!(w, "    vm state: {state}")?,
                    }
                }
                for (stream, text) in [("stdout", &failure.stdout), ("stderr", &failure.stderr)] {
                    if let Some(text) = text {
                        writeln!(w, "    {stream}:")?;
                        for line in text.lines() {
                            writeln!(w, "      | {line}")?;
                        }
                    }
                }
            }
            for warning in &report.warnings {
                writeln!(w, "    warning: cleanup {warning}")?;
            }
            if let Some(console) = &report.console_output {
                writeln!(w, "    console output:")?;
                for line in console.lines() {
                    writeln!(w, "      | {line}")?;
                }
            }
        }
        writeln!(w)?;
        writeln!(
            w,
            "{} passed, {} failed, {} skipped, {} cancelled in {:.1}s",
            self.count(ScenarioOutcome::Passed),
            self.count(ScenarioOutcome::Failed),
            self.count(ScenarioOutcome::Skipped),
            self.count(ScenarioOutcome::Cancelled),
            self.duration.as_secs_f64()
        )
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}
