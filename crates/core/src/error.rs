//! 에러 타입 — 시나리오 실패 분류
//!
//! [`VmProbeError`]는 시나리오를 실패시키는 모든 원인을 표현합니다.
//! 호출자는 문자열 검사 없이 [`ErrorKind`]로 재시도 가능 여부,
//! 치명적 실패, 단언 실패를 구분할 수 있습니다.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::CommandOutput;

/// vmprobe 최상위 에러 타입
#[derive(Debug, thiserror::Error)]
pub enum VmProbeError {
    /// 설정 관련 에러
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// 컨트롤 플레인이 생성 요청을 거부함 (쿼터, 잘못된 참조, 이름 충돌)
    #[error("provisioning error: {resource}: {reason}")]
    Provisioning {
        /// 생성하려던 리소스
        resource: String,
        /// 거부 사유
        reason: String,
    },

    /// 상태 대기 또는 원격 명령이 제한 시간을 초과함
    #[error("timeout: {operation} exceeded {budget:?} (last observed: {last_observed})")]
    Timeout {
        /// 수행 중이던 작업
        operation: String,
        /// 제한 시간
        budget: Duration,
        /// 마지막으로 관측된 상태 또는 출력
        last_observed: String,
    },

    /// 인스턴스가 ERROR 또는 예상치 못한 상태에 도달함
    #[error("transition error on instance '{instance_id}': {reason}")]
    Transition {
        /// 대상 인스턴스 ID
        instance_id: String,
        /// 실패 사유
        reason: String,
    },

    /// 원격 세션을 열 수 없거나 세션이 끊어짐
    #[error("connection error to {target} after {attempts} attempt(s): {reason}")]
    Connection {
        /// 접속 대상
        target: String,
        /// 시도 횟수
        attempts: u32,
        /// 실패 사유
        reason: String,
    },

    /// 원격 명령이 기대와 다른 결과를 반환함 (단언 실패)
    #[error("command '{command}' on {target} failed: {reason} (exit code {})", .output.exit_code)]
    CommandExecution {
        /// 실행 대상
        target: String,
        /// 실행한 명령
        command: String,
        /// 실패 사유
        reason: String,
        /// 명령 출력
        output: CommandOutput,
    },

    /// 리소스 해제 실패 (경고로 보고됨)
    #[error("cleanup failed for {} resource(s): {}", .failures.len(), .failures.join("; "))]
    Cleanup {
        /// 개별 해제 실패 내역
        failures: Vec<String>,
    },

    /// 생성 이외의 컨트롤 플레인 API 실패
    #[error("control plane error: {0}")]
    ControlPlane(String),

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 에러 분류 태그
///
/// 시나리오 리포트에 기록되며, 재시도 가능 여부 판단에 사용됩니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Provisioning,
    Timeout,
    Transition,
    Connection,
    CommandExecution,
    Cleanup,
    ControlPlane,
    Io,
}

impl ErrorKind {
    /// 메트릭 레이블용 고정 이름
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Provisioning => "provisioning",
            Self::Timeout => "timeout",
            Self::Transition => "transition",
            Self::Connection => "connection",
            Self::CommandExecution => "command_execution",
            Self::Cleanup => "cleanup",
            Self::ControlPlane => "control_plane",
            Self::Io => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl VmProbeError {
    /// 에러 분류 태그를 반환합니다.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Provisioning { .. } => ErrorKind::Provisioning,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Transition { .. } => ErrorKind::Transition,
            Self::Connection { .. } => ErrorKind::Connection,
            Self::CommandExecution { .. } => ErrorKind::CommandExecution,
            Self::Cleanup { .. } => ErrorKind::Cleanup,
            Self::ControlPlane(_) => ErrorKind::ControlPlane,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// 시나리오 단언 실패인지 확인합니다 (인프라 실패와 구분).
    pub fn is_assertion_failure(&self) -> bool {
        matches!(self, Self::CommandExecution { .. })
    }

    /// 같은 작업을 다시 시도하면 성공할 수 있는 에러인지 확인합니다.
    ///
    /// 연결 실패만 해당합니다. 전원 액션과 생성 요청은 중복 적용 위험 때문에
    /// 재시도 대상이 아닙니다.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// 원격 명령 출력이 있으면 반환합니다.
    pub fn command_output(&self) -> Option<&CommandOutput> {
        match self {
            Self::CommandExecution { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// 설정 관련 에러
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// 설정 파일을 찾을 수 없음
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// 설정 파싱 실패
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// 유효하지 않은 설정 값
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}
