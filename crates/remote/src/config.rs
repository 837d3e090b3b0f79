//! 원격 세션 설정
//!
//! core의 `[guest]`, `[host]` 섹션에서 전송별 설정을 만듭니다.

use std::time::Duration;

use vmprobe_core::config::{GuestConfig, HostConfig};

use crate::error::RemoteError;
use crate::retry::RetryBudget;

/// WinRM 요청 하나의 HTTP 제한 시간
const WINRM_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// WinRM Receive 작업의 서버 측 대기 시간
const WINRM_OPERATION_TIMEOUT: Duration = Duration::from_secs(20);
/// 호스트 접속 시도당 제한 시간
const WINRM_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// OpenSSH 게스트 셸 설정
#[derive(Debug, Clone)]
pub struct SshSettings {
    pub user: String,
    pub port: u16,
    pub ssh_program: String,
    pub scp_program: String,
    pub connect_timeout: Duration,
    pub retry: RetryBudget,
    pub command_timeout: Duration,
    /// 게스트 측 스크립트 스테이징 디렉토리
    pub staging_dir: String,
}

impl SshSettings {
    pub fn from_core(guest: &GuestConfig) -> Self {
        let connect_timeout = Duration::from_secs(guest.connect_timeout_secs);
        Self {
            user: guest.ssh_user.clone(),
            port: guest.ssh_port,
            ssh_program: guest.ssh_program.clone(),
            scp_program: guest.scp_program.clone(),
            connect_timeout,
            retry: RetryBudget::new(
                guest.connect_attempts,
                Duration::from_millis(guest.retry_backoff_ms),
                connect_timeout,
            ),
            command_timeout: Duration::from_secs(guest.command_timeout_secs),
            staging_dir: guest.remote_staging_dir.trim_end_matches('/').to_owned(),
        }
    }

    pub fn validate(&self) -> Result<(), RemoteError> {
        if self.user.is_empty() {
            return Err(config_err("guest.ssh_user", "must not be empty"));
        }
        if self.port == 0 {
            return Err(config_err("guest.ssh_port", "must not be 0"));
        }
        if self.ssh_program.is_empty() || self.scp_program.is_empty() {
            return Err(config_err("guest.ssh_program", "client programs must be set"));
        }
        if !self.staging_dir.starts_with('/') {
            return Err(config_err(
                "guest.remote_staging_dir",
                "must be an absolute path",
            ));
        }
        Ok(())
    }
}

impl Default for SshSettings {
    fn default() -> Self {
        Self::from_core(&GuestConfig::default())
    }
}

/// WinRM 호스트 관리 설정
#[derive(Debug, Clone)]
pub struct WinRmSettings {
    pub port: u16,
    pub use_https: bool,
    pub request_timeout: Duration,
    pub operation_timeout: Duration,
    pub retry: RetryBudget,
    pub command_timeout: Duration,
    /// 호스트 측 스크립트 폴더
    pub script_folder: String,
}

impl WinRmSettings {
    pub fn from_core(host: &HostConfig) -> Self {
        Self {
            port: host.port,
            use_https: host.use_https,
            request_timeout: WINRM_REQUEST_TIMEOUT,
            operation_timeout: WINRM_OPERATION_TIMEOUT,
            retry: RetryBudget::new(
                host.connect_attempts,
                Duration::from_millis(host.retry_backoff_ms),
                WINRM_CONNECT_TIMEOUT,
            ),
            command_timeout: Duration::from_secs(host.command_timeout_secs),
            script_folder: host.script_folder.clone(),
        }
    }

    /// `http(s)://{address}:{port}/wsman`
    pub fn endpoint(&self, address: &str, port: u16) -> String {
        let scheme = if self.use_https { "https" } else { "http" };
        format!("{scheme}://{address}:{port}/wsman")
    }

    pub fn validate(&self) -> Result<(), RemoteError> {
        if self.port == 0 {
            return Err(config_err("host.port", "must not be 0"));
        }
        if self.operation_timeout >= self.request_timeout {
            return Err(config_err(
                "host.operation_timeout",
                "must be shorter than the HTTP request timeout",
            ));
        }
        Ok(())
    }
}

impl Default for WinRmSettings {
    fn default() -> Self {
        Self::from_core(&HostConfig::default())
    }
}

fn config_err(field: &str, reason: &str) -> RemoteError {
    RemoteError::Config {
        field: field.to_owned(),
        reason: reason.to_owned(),
    }
}
