//! 설정 관리 — vmprobe.toml 파싱 및 런타임 설정
//!
//! [`VmProbeConfig`]는 모든 크레이트의 설정을 담는 최상위 구조체입니다.
//!
//! # 설정 로딩 우선순위
//! 1. CLI 인자 (최고 우선)
//! 2. 환경변수 (`VMPROBE_GUEST_SSH_USER=centos` 형식)
//! 3. 설정 파일 (`vmprobe.toml`)
//! 4. 기본값 (`Default` 구현)
//!
//! # 사용 예시
//! ```no_run
//! # async fn example() -> Result<(), vmprobe_core::error::VmProbeError> {
//! use vmprobe_core::config::VmProbeConfig;
//!
//! // 파일에서 로드 + 환경변수 오버라이드
//! let config = VmProbeConfig::load("vmprobe.toml").await?;
//!
//! // TOML 문자열에서 직접 파싱
//! let config = VmProbeConfig::parse("[compute]\nimage_ref = \"img-1\"")?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, VmProbeError};

/// 동시 실행 시나리오 상한
pub const MAX_PARALLEL_SCENARIOS: usize = 64;

/// vmprobe 통합 설정
///
/// `vmprobe.toml` 파일의 최상위 구조를 나타냅니다.
/// 각 크레이트는 `from_core`로 자기 섹션만 읽어 사용합니다.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmProbeConfig {
    /// 일반 설정
    #[serde(default)]
    pub general: GeneralConfig,
    /// 컨트롤 플레인 접속 설정
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,
    /// 인스턴스 프로비저닝 및 대기 설정
    #[serde(default)]
    pub compute: ComputeConfig,
    /// 게스트 셸 세션 설정
    #[serde(default)]
    pub guest: GuestConfig,
    /// 호스트 관리 세션 설정
    #[serde(default)]
    pub host: HostConfig,
    /// 시나리오 실행기 설정
    #[serde(default)]
    pub runner: RunnerConfig,
    /// 메트릭 익스포터 설정
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl VmProbeConfig {
    /// TOML 파일에서 설정을 로드하고 환경변수 오버라이드를 적용합니다.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, VmProbeError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// TOML 파일에서 설정을 로드합니다 (환경변수 오버라이드 없음).
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, VmProbeError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VmProbeError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                VmProbeError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// TOML 문자열에서 설정을 파싱합니다.
    pub fn parse(toml_str: &str) -> Result<Self, VmProbeError> {
        toml::from_str(toml_str).map_err(|e| {
            VmProbeError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// 환경변수로 설정값을 오버라이드합니다.
    ///
    /// 환경변수 네이밍 규칙: `VMPROBE_{SECTION}_{FIELD}`
    /// 예: `VMPROBE_CONTROL_PLANE_PASSWORD=secret`
    pub fn apply_env_overrides(&mut self) {
        // General
        override_string(&mut self.general.log_level, "VMPROBE_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "VMPROBE_GENERAL_LOG_FORMAT");

        // Control plane
        let cp = &mut self.control_plane;
        override_string(&mut cp.auth_url, "VMPROBE_CONTROL_PLANE_AUTH_URL");
        override_string(&mut cp.username, "VMPROBE_CONTROL_PLANE_USERNAME");
        override_string(&mut cp.password, "VMPROBE_CONTROL_PLANE_PASSWORD");
        override_string(&mut cp.project_name, "VMPROBE_CONTROL_PLANE_PROJECT_NAME");
        override_string(&mut cp.user_domain, "VMPROBE_CONTROL_PLANE_USER_DOMAIN");
        override_string(
            &mut cp.project_domain,
            "VMPROBE_CONTROL_PLANE_PROJECT_DOMAIN",
        );
        override_string(&mut cp.region, "VMPROBE_CONTROL_PLANE_REGION");
        override_u64(
            &mut cp.request_timeout_secs,
            "VMPROBE_CONTROL_PLANE_REQUEST_TIMEOUT_SECS",
        );
        override_string(
            &mut cp.floating_ip_pool,
            "VMPROBE_CONTROL_PLANE_FLOATING_IP_POOL",
        );

        // Compute
        let compute = &mut self.compute;
        override_string(&mut compute.image_ref, "VMPROBE_COMPUTE_IMAGE_REF");
        override_string(&mut compute.flavor_ref, "VMPROBE_COMPUTE_FLAVOR_REF");
        override_string(&mut compute.name_prefix, "VMPROBE_COMPUTE_NAME_PREFIX");
        override_u64(
            &mut compute.boot_timeout_secs,
            "VMPROBE_COMPUTE_BOOT_TIMEOUT_SECS",
        );
        override_u64(
            &mut compute.poll_interval_secs,
            "VMPROBE_COMPUTE_POLL_INTERVAL_SECS",
        );
        override_u64(
            &mut compute.transition_timeout_secs,
            "VMPROBE_COMPUTE_TRANSITION_TIMEOUT_SECS",
        );
        override_u64(
            &mut compute.delete_timeout_secs,
            "VMPROBE_COMPUTE_DELETE_TIMEOUT_SECS",
        );
        override_u32(&mut compute.console_lines, "VMPROBE_COMPUTE_CONSOLE_LINES");

        // Guest
        let guest = &mut self.guest;
        override_string(&mut guest.ssh_user, "VMPROBE_GUEST_SSH_USER");
        override_u16(&mut guest.ssh_port, "VMPROBE_GUEST_SSH_PORT");
        override_string(&mut guest.ssh_program, "VMPROBE_GUEST_SSH_PROGRAM");
        override_string(&mut guest.scp_program, "VMPROBE_GUEST_SCP_PROGRAM");
        override_u64(
            &mut guest.connect_timeout_secs,
            "VMPROBE_GUEST_CONNECT_TIMEOUT_SECS",
        );
        override_u32(
            &mut guest.connect_attempts,
            "VMPROBE_GUEST_CONNECT_ATTEMPTS",
        );
        override_u64(
            &mut guest.retry_backoff_ms,
            "VMPROBE_GUEST_RETRY_BACKOFF_MS",
        );
        override_u64(
            &mut guest.command_timeout_secs,
            "VMPROBE_GUEST_COMMAND_TIMEOUT_SECS",
        );
        override_string(&mut guest.script_root, "VMPROBE_GUEST_SCRIPT_ROOT");
        override_string(
            &mut guest.remote_staging_dir,
            "VMPROBE_GUEST_REMOTE_STAGING_DIR",
        );

        // Host
        let host = &mut self.host;
        override_string(&mut host.address, "VMPROBE_HOST_ADDRESS");
        override_string(&mut host.username, "VMPROBE_HOST_USERNAME");
        override_string(&mut host.password, "VMPROBE_HOST_PASSWORD");
        override_u16(&mut host.port, "VMPROBE_HOST_PORT");
        override_bool(&mut host.use_https, "VMPROBE_HOST_USE_HTTPS");
        override_string(&mut host.script_folder, "VMPROBE_HOST_SCRIPT_FOLDER");
        override_u32(&mut host.connect_attempts, "VMPROBE_HOST_CONNECT_ATTEMPTS");
        override_u64(&mut host.retry_backoff_ms, "VMPROBE_HOST_RETRY_BACKOFF_MS");
        override_u64(
            &mut host.command_timeout_secs,
            "VMPROBE_HOST_COMMAND_TIMEOUT_SECS",
        );

        // Runner
        override_usize(&mut self.runner.parallel, "VMPROBE_RUNNER_PARALLEL");

        // Metrics
        override_bool(&mut self.metrics.enabled, "VMPROBE_METRICS_ENABLED");
        override_string(&mut self.metrics.listen_addr, "VMPROBE_METRICS_LISTEN_ADDR");
        override_u16(&mut self.metrics.port, "VMPROBE_METRICS_PORT");
    }

    /// 설정값의 유효성을 검증합니다.
    ///
    /// 자격 증명이나 이미지 참조처럼 실행 시점에만 필요한 값은
    /// [`require_run_fields`](Self::require_run_fields)에서 검사합니다.
    pub fn validate(&self) -> Result<(), VmProbeError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(invalid(
                "general.log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(invalid(
                "general.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        let auth_url = self.control_plane.auth_url.as_str();
        if !(auth_url.starts_with("http://") || auth_url.starts_with("https://")) {
            return Err(invalid(
                "control_plane.auth_url",
                "must start with http:// or https://",
            ));
        }
        if self.control_plane.request_timeout_secs == 0 {
            return Err(invalid(
                "control_plane.request_timeout_secs",
                "must be greater than 0",
            ));
        }

        let compute = &self.compute;
        for (field, value) in [
            ("compute.boot_timeout_secs", compute.boot_timeout_secs),
            ("compute.poll_interval_secs", compute.poll_interval_secs),
            (
                "compute.transition_timeout_secs",
                compute.transition_timeout_secs,
            ),
            ("compute.delete_timeout_secs", compute.delete_timeout_secs),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be greater than 0"));
            }
        }
        if compute.poll_interval_secs > compute.boot_timeout_secs {
            return Err(invalid(
                "compute.poll_interval_secs",
                "must not exceed compute.boot_timeout_secs",
            ));
        }
        if compute.name_prefix.is_empty() {
            return Err(invalid("compute.name_prefix", "must not be empty"));
        }

        let guest = &self.guest;
        if guest.ssh_user.is_empty() {
            return Err(invalid("guest.ssh_user", "must not be empty"));
        }
        if guest.ssh_port == 0 {
            return Err(invalid("guest.ssh_port", "must not be 0"));
        }
        if guest.connect_attempts == 0 {
            return Err(invalid("guest.connect_attempts", "must be at least 1"));
        }
        if guest.connect_timeout_secs == 0 || guest.command_timeout_secs == 0 {
            return Err(invalid(
                "guest.command_timeout_secs",
                "connect and command timeouts must be greater than 0",
            ));
        }
        if !guest.remote_staging_dir.starts_with('/') {
            return Err(invalid(
                "guest.remote_staging_dir",
                "must be an absolute path",
            ));
        }

        let host = &self.host;
        if host.port == 0 {
            return Err(invalid("host.port", "must not be 0"));
        }
        if host.connect_attempts == 0 {
            return Err(invalid("host.connect_attempts", "must be at least 1"));
        }
        if host.command_timeout_secs == 0 {
            return Err(invalid("host.command_timeout_secs", "must be greater than 0"));
        }

        if self.runner.parallel == 0 || self.runner.parallel > MAX_PARALLEL_SCENARIOS {
            return Err(invalid(
                "runner.parallel",
                format!("must be between 1 and {MAX_PARALLEL_SCENARIOS}"),
            ));
        }

        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(invalid("metrics.port", "must not be 0 when metrics are enabled"));
        }

        Ok(())
    }

    /// 시나리오 실행에 필요한 값이 채워져 있는지 확인합니다.
    pub fn require_run_fields(&self) -> Result<(), VmProbeError> {
        let required = [
            ("control_plane.username", &self.control_plane.username),
            ("control_plane.password", &self.control_plane.password),
            ("control_plane.project_name", &self.control_plane.project_name),
            ("compute.image_ref", &self.compute.image_ref),
            ("compute.flavor_ref", &self.compute.flavor_ref),
        ];
        for (field, value) in required {
            if value.is_empty() {
                return Err(invalid(field, "required to run scenarios"));
            }
        }
        Ok(())
    }

    /// 호스트 관리 채널 자격 증명이 채워져 있는지 확인합니다.
    pub fn require_host_credentials(&self) -> Result<(), VmProbeError> {
        if self.host.username.is_empty() {
            return Err(invalid(
                "host.username",
                "required by scenarios with host-side steps",
            ));
        }
        if self.host.password.is_empty() {
            return Err(invalid(
                "host.password",
                "required by scenarios with host-side steps",
            ));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> VmProbeError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason: reason.into(),
    }
    .into()
}

/// 일반 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// 로그 레벨 (trace, debug, info, warn, error)
    pub log_level: String,
    /// 로그 형식 (json, pretty)
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "pretty".to_owned(),
        }
    }
}

/// 컨트롤 플레인(Identity v3 + Compute v2.1) 접속 설정
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Identity 엔드포인트 (예: `http://controller:5000/v3`)
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub project_name: String,
    pub user_domain: String,
    pub project_domain: String,
    /// 서비스 카탈로그에서 선택할 리전 (비어 있으면 첫 엔드포인트)
    pub region: String,
    /// 단일 HTTP 요청 제한 시간 (초)
    pub request_timeout_secs: u64,
    /// 플로팅 IP 할당 풀
    pub floating_ip_pool: String,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            auth_url: "http://127.0.0.1:5000/v3".to_owned(),
            username: String::new(),
            password: String::new(),
            project_name: String::new(),
            user_domain: "Default".to_owned(),
            project_domain: "Default".to_owned(),
            region: String::new(),
            request_timeout_secs: 60,
            floating_ip_pool: "public".to_owned(),
        }
    }
}

impl std::fmt::Debug for ControlPlaneConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlaneConfig")
            .field("auth_url", &self.auth_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("project_name", &self.project_name)
            .field("user_domain", &self.user_domain)
            .field("project_domain", &self.project_domain)
            .field("region", &self.region)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("floating_ip_pool", &self.floating_ip_pool)
            .finish()
    }
}

/// 인스턴스 프로비저닝 및 상태 대기 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// 기본 이미지 ID
    pub image_ref: String,
    /// 기본 플레이버 ID
    pub flavor_ref: String,
    /// 리소스 이름 접두사
    pub name_prefix: String,
    /// ACTIVE 대기 제한 시간 (초)
    pub boot_timeout_secs: u64,
    /// 상태 폴링 간격 (초)
    pub poll_interval_secs: u64,
    /// 전원 전이 대기 제한 시간 (초)
    pub transition_timeout_secs: u64,
    /// 삭제 대기 제한 시간 (초)
    pub delete_timeout_secs: u64,
    /// 실패 시 수집할 콘솔 로그 줄 수
    pub console_lines: u32,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            image_ref: String::new(),
            flavor_ref: String::new(),
            name_prefix: "vmprobe".to_owned(),
            boot_timeout_secs: 600,
            poll_interval_secs: 5,
            transition_timeout_secs: 300,
            delete_timeout_secs: 300,
            console_lines: 50,
        }
    }
}

impl ComputeConfig {
    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn transition_timeout(&self) -> Duration {
        Duration::from_secs(self.transition_timeout_secs)
    }

    pub fn delete_timeout(&self) -> Duration {
        Duration::from_secs(self.delete_timeout_secs)
    }
}

/// 게스트 셸(SSH) 세션 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestConfig {
    /// 게스트 로그인 사용자
    pub ssh_user: String,
    pub ssh_port: u16,
    /// ssh 클라이언트 실행 파일
    pub ssh_program: String,
    /// scp 클라이언트 실행 파일
    pub scp_program: String,
    /// 접속 시도당 제한 시간 (초)
    pub connect_timeout_secs: u64,
    /// 접속 시도 횟수
    pub connect_attempts: u32,
    /// 재시도 간 기본 대기 (밀리초, 시도 횟수에 비례해 증가)
    pub retry_backoff_ms: u64,
    /// 명령 기본 제한 시간 (초)
    pub command_timeout_secs: u64,
    /// 로컬 게스트 스크립트 디렉토리
    pub script_root: String,
    /// 게스트 측 스크립트 스테이징 디렉토리
    pub remote_staging_dir: String,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            ssh_user: "ubuntu".to_owned(),
            ssh_port: 22,
            ssh_program: "ssh".to_owned(),
            scp_program: "scp".to_owned(),
            connect_timeout_secs: 30,
            connect_attempts: 10,
            retry_backoff_ms: 3000,
            command_timeout_secs: 600,
            script_root: "scripts/guest".to_owned(),
            remote_staging_dir: "/tmp/vmprobe".to_owned(),
        }
    }
}

/// 하이퍼바이저 호스트 관리(WinRM) 세션 설정
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// 호스트 주소 (비어 있으면 인스턴스의 하이퍼바이저 호스트명 사용)
    pub address: String,
    pub username: String,
    pub password: String,
    pub port: u16,
    pub use_https: bool,
    /// 호스트 측 스크립트 폴더 (예: `C:\vmprobe\`)
    pub script_folder: String,
    pub connect_attempts: u32,
    pub retry_backoff_ms: u64,
    pub command_timeout_secs: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            username: String::new(),
            password: String::new(),
            port: 5985,
            use_https: false,
            script_folder: "C:\\vmprobe\\".to_owned(),
            connect_attempts: 3,
            retry_backoff_ms: 2000,
            command_timeout_secs: 600,
        }
    }
}

impl std::fmt::Debug for HostConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostConfig")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("port", &self.port)
            .field("use_https", &self.use_https)
            .field("script_folder", &self.script_folder)
            .field("connect_attempts", &self.connect_attempts)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("command_timeout_secs", &self.command_timeout_secs)
            .finish()
    }
}

/// 시나리오 실행기 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// 동시에 실행할 시나리오 수
    pub parallel: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self { parallel: 1 }
    }
}

/// Prometheus 익스포터 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_addr: String,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1".to_owned(),
            port: 9464,
        }
    }
}

// --- 환경변수 오버라이드 헬퍼 ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_parsed<T: std::str::FromStr>(target: &mut T, env_key: &str, type_name: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                expected = type_name,
                "failed to parse env var, ignoring"
            ),
        }
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    override_parsed(target, env_key, "bool");
}

fn override_u16(target: &mut u16, env_key: &str) {
    override_parsed(target, env_key, "u16");
}

fn override_u32(target: &mut u32, env_key: &str) {
    override_parsed(target, env_key, "u32");
}

fn override_u64(target: &mut u64, env_key: &str) {
    override_parsed(target, env_key, "u64");
}

fn override_usize(target: &mut usize, env_key: &str) {
    override_parsed(target, env_key, "usize");
}
