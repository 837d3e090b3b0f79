//! End-to-end scenario runs for vmprobe-runner.
//!
//! A simulated compute cloud and scripted remote connectors stand in for
//! OpenStack, the guest shell and the hypervisor host. Scenarios go through
//! the real `LifecycleOrchestrator`, ledger and facade; tokio time is paused
//! so boot and transition waits complete instantly.
//!
//! # Test Structure
//!
//! - `helpers/` -- simulated cloud, scripted connectors, settings builder
//! - `scenarios/` -- one file per scenario family
//!
//! # Running
//!
//! ```bash
//! cargo test -p vmprobe-runner --test e2e
//! ```

mod helpers;
mod scenarios;
