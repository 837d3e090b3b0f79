//! vmprobe-runner -- scenario orchestration and the `vmprobe` CLI.
//!
//! # Module Structure
//!
//! - [`scenario`]: `ScenarioCase` declarations and the instruction set
//! - [`catalog`]: built-in scenarios and selection by name/tag
//! - [`orchestrator`]: `LifecycleOrchestrator`, one scenario end to end
//! - [`suite`]: bounded concurrent execution of many scenarios
//! - [`report`]: scenario/suite reports
//! - [`cli`], [`commands`], [`output`], [`error`]: the `vmprobe` binary
//! - [`logging`], [`metrics_server`]: tracing and Prometheus setup

pub mod catalog;
pub mod cli;
pub mod commands;
pub mod error;
pub mod logging;
pub mod metrics_server;
pub mod orchestrator;
pub mod output;
pub mod report;
pub mod scenario;
pub mod suite;

pub use orchestrator::{LifecycleOrchestrator, OrchestratorSettings};
pub use report::{ScenarioOutcome, ScenarioReport, ScenarioState, SuiteReport};
pub use scenario::{Expectation, Instruction, ScenarioCase};
pub use suite::SuiteRunner;
