//! 원격 세션 에러 타입
//!
//! [`RemoteError`]는 게스트 셸과 호스트 관리 전송에서 발생하는 에러를 표현합니다.
//! `From<RemoteError> for VmProbeError` 구현으로 `?` 연산자를 통한 자동 변환을 지원합니다.

use std::time::Duration;

use vmprobe_core::error::{ConfigError, VmProbeError};
use vmprobe_core::types::CommandOutput;

/// 원격 세션 도메인 에러
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// 재시도 예산을 모두 소진하도록 접속하지 못함
    #[error("cannot connect to {target} after {attempts} attempt(s): {reason}")]
    Connection {
        target: String,
        attempts: u32,
        reason: String,
    },

    /// 명령이 제한 시간 안에 끝나지 않음
    #[error("command '{command}' on {target} timed out after {budget:?}")]
    Timeout {
        target: String,
        command: String,
        budget: Duration,
        /// 제한 시간 전까지 수집된 출력
        partial: String,
    },

    /// 명령이 0이 아닌 종료 코드를 반환함
    #[error("command '{command}' on {target} exited with {}", .output.exit_code)]
    CommandFailed {
        target: String,
        command: String,
        output: CommandOutput,
    },

    /// 명령 실행 중 전송 계층이 끊어짐 (세션은 더 이상 사용할 수 없음)
    #[error("transport failure on {target}: {reason}")]
    Transport { target: String, reason: String },

    /// 프로토콜 응답을 해석할 수 없음
    #[error("protocol error: {0}")]
    Protocol(String),

    /// 이미 닫혔거나 끊어진 세션을 사용함
    #[error("session to {target} is closed")]
    Closed { target: String },

    /// 인증 정보 형식이 전송과 맞지 않음
    #[error("unsupported credentials for {target}: {reason}")]
    Credentials { target: String, reason: String },

    /// 설정 에러
    #[error("config error: {field}: {reason}")]
    Config { field: String, reason: String },

    /// 로컬 I/O 에러 (클라이언트 프로세스 실행, 키 파일)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    /// 세션을 더 이상 사용할 수 없는 에러인지 확인합니다.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Closed { .. })
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        let target = err
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "unknown".to_owned());
        Self::Transport {
            target,
            reason: err.to_string(),
        }
    }
}

impl From<RemoteError> for VmProbeError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Connection {
                target,
                attempts,
                reason,
            } => VmProbeError::Connection {
                target,
                attempts,
                reason,
            },
            RemoteError::Timeout {
                target,
                command,
                budget,
                partial,
            } => VmProbeError::Timeout {
                operation: format!("command '{command}' on {target}"),
                budget,
                last_observed: if partial.is_empty() {
                    "no output".to_owned()
                } else {
                    partial
                },
            },
            RemoteError::CommandFailed {
                target,
                command,
                output,
            } => VmProbeError::CommandExecution {
                target,
                reason: format!("exit code {}", output.exit_code),
                command,
                output,
            },
            RemoteError::Transport { target, reason } => VmProbeError::Connection {
                target,
                attempts: 1,
                reason,
            },
            RemoteError::Closed { target } => VmProbeError::Connection {
                target,
                attempts: 0,
                reason: "session closed".to_owned(),
            },
            RemoteError::Credentials { target, reason } => VmProbeError::Connection {
                target,
                attempts: 0,
                reason,
            },
            RemoteError::Protocol(reason) => VmProbeError::Connection {
                target: "host-management".to_owned(),
                attempts: 1,
                reason,
            },
            RemoteError::Config { field, reason } => {
                VmProbeError::Config(ConfigError::InvalidValue { field, reason })
            }
            RemoteError::Io(e) => VmProbeError::Io(e),
        }
    }
}
