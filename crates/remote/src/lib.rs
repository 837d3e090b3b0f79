//! vmprobe 원격 세션 크레이트
//!
//! 게스트 OS 셸과 하이퍼바이저 호스트 관리 채널을 하나의 계약([`RemoteSession`])
//! 뒤에 둡니다. 오케스트레이터는 이 트레이트에만 의존합니다.
//!
//! # Module Structure
//!
//! - [`error`]: Domain error types (`RemoteError`)
//! - [`config`]: Transport settings (`SshSettings`, `WinRmSettings`)
//! - [`retry`]: Connect retry budget with linear backoff
//! - [`session`]: `RemoteSession` / `SessionConnector` traits, script staging
//! - [`ssh`]: OpenSSH guest shell transport
//! - [`winrm`]: WinRM host-management transport

pub mod config;
pub mod error;
pub mod retry;
pub mod session;
pub mod ssh;
pub mod winrm;

// --- Public API Re-exports ---

pub use config::{SshSettings, WinRmSettings};
pub use error::RemoteError;
pub use retry::{RetryBudget, connect_with_retry};
pub use session::{RemoteSession, SessionConnector, display_command, run_staged_script, shell_quote};
pub use ssh::{SshConnector, SshSession};
pub use winrm::{WinRmConnector, WinRmSession};
