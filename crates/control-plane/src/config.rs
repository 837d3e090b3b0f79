//! 컨트롤 플레인 설정
//!
//! [`ControlPlaneSettings`]는 core의 `[control_plane]`, `[compute]` 섹션을
//! 기반으로 클라이언트와 파사드가 쓰는 설정을 제공합니다.
//!
//! # 사용 예시
//! ```ignore
//! use vmprobe_core::config::VmProbeConfig;
//! use vmprobe_control_plane::config::ControlPlaneSettings;
//!
//! let core = VmProbeConfig::default();
//! let settings = ControlPlaneSettings::from_core(&core.control_plane, &core.compute);
//! ```

use std::fmt;
use std::time::Duration;

use vmprobe_core::config::{ComputeConfig, ControlPlaneConfig};

use crate::error::ControlPlaneError;

/// 설정 상한값 상수
const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// 컨트롤 플레인 설정
#[derive(Clone)]
pub struct ControlPlaneSettings {
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub project_name: String,
    pub user_domain: String,
    pub project_domain: String,
    /// 비어 있으면 카탈로그의 첫 public 엔드포인트
    pub region: String,
    pub request_timeout: Duration,
    pub floating_ip_pool: String,
    pub poll_interval: Duration,
    pub boot_timeout: Duration,
    pub transition_timeout: Duration,
    pub delete_timeout: Duration,
    pub console_lines: u32,
}

impl Default for ControlPlaneSettings {
    fn default() -> Self {
        Self::from_core(&ControlPlaneConfig::default(), &ComputeConfig::default())
    }
}

impl ControlPlaneSettings {
    /// core 설정 섹션에서 생성합니다.
    pub fn from_core(cp: &ControlPlaneConfig, compute: &ComputeConfig) -> Self {
        Self {
            auth_url: cp.auth_url.trim_end_matches('/').to_owned(),
            username: cp.username.clone(),
            password: cp.password.clone(),
            project_name: cp.project_name.clone(),
            user_domain: cp.user_domain.clone(),
            project_domain: cp.project_domain.clone(),
            region: cp.region.clone(),
            request_timeout: Duration::from_secs(cp.request_timeout_secs),
            floating_ip_pool: cp.floating_ip_pool.clone(),
            poll_interval: compute.poll_interval(),
            boot_timeout: compute.boot_timeout(),
            transition_timeout: compute.transition_timeout(),
            delete_timeout: compute.delete_timeout(),
            console_lines: compute.console_lines,
        }
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), ControlPlaneError> {
        if self.auth_url.is_empty() {
            return Err(config_err("auth_url", "must not be empty"));
        }
        if self.request_timeout.is_zero() || self.request_timeout > MAX_REQUEST_TIMEOUT {
            return Err(config_err(
                "request_timeout",
                format!("must be 1-{}s", MAX_REQUEST_TIMEOUT.as_secs()),
            ));
        }
        if self.poll_interval < MIN_POLL_INTERVAL {
            return Err(config_err(
                "poll_interval",
                format!("must be at least {}ms", MIN_POLL_INTERVAL.as_millis()),
            ));
        }
        if self.floating_ip_pool.is_empty() {
            return Err(config_err("floating_ip_pool", "must not be empty"));
        }
        Ok(())
    }
}

fn config_err(field: &str, reason: impl Into<String>) -> ControlPlaneError {
    ControlPlaneError::Config {
        field: field.to_owned(),
        reason: reason.into(),
    }
}

impl fmt::Debug for ControlPlaneSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlPlaneSettings")
            .field("auth_url", &self.auth_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("project_name", &self.project_name)
            .field("region", &self.region)
            .field("request_timeout", &self.request_timeout)
            .field("floating_ip_pool", &self.floating_ip_pool)
            .field("poll_interval", &self.poll_interval)
            .field("boot_timeout", &self.boot_timeout)
            .field("transition_timeout", &self.transition_timeout)
            .finish_non_exhaustive()
    }
}

/// 컨트롤 플레인 설정 빌더
#[derive(Default)]
pub struct ControlPlaneSettingsBuilder {
    settings: ControlPlaneSettings,
}

impl ControlPlaneSettingsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auth_url(mut self, url: impl Into<String>) -> Self {
        self.settings.auth_url = url.into();
        self
    }

    pub fn credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        project_name: impl Into<String>,
    ) -> Self {
        self.settings.username = username.into();
        self.settings.password = password.into();
        self.settings.project_name = project_name.into();
        self
    }

    pub fn floating_ip_pool(mut self, pool: impl Into<String>) -> Self {
        self.settings.floating_ip_pool = pool.into();
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.settings.poll_interval = interval;
        self
    }

    pub fn boot_timeout(mut self, timeout: Duration) -> Self {
        self.settings.boot_timeout = timeout;
        self
    }

    pub fn transition_timeout(mut self, timeout: Duration) -> Self {
        self.settings.transition_timeout = timeout;
        self
    }

    pub fn delete_timeout(mut self, timeout: Duration) -> Self {
        self.settings.delete_timeout = timeout;
        self
    }

    /// 설정을 검증하고 반환합니다.
    pub fn build(self) -> Result<ControlPlaneSettings, ControlPlaneError> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}
