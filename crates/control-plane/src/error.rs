//! 컨트롤 플레인 에러 타입
//!
//! [`ControlPlaneError`]는 컴퓨트 API 호출 중 발생하는 에러를 표현합니다.
//! `From<ControlPlaneError> for VmProbeError` 변환이 구현되어 있어
//! 상위 레이어에서 `?` 연산자로 전파할 수 있습니다.

use vmprobe_core::error::{ConfigError, VmProbeError};

/// 컨트롤 플레인 도메인 에러
#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    /// 리소스가 존재하지 않음 (HTTP 404)
    #[error("{resource} '{id}' not found")]
    NotFound {
        /// 리소스 종류
        resource: String,
        /// 조회한 식별자
        id: String,
    },

    /// 현재 리소스 상태와 충돌 (HTTP 409)
    #[error("conflict: {0}")]
    Conflict(String),

    /// 그 밖의 API 에러 응답
    #[error("api error (HTTP {status}): {message}")]
    Api {
        /// HTTP 상태 코드
        status: u16,
        /// 컨트롤 플레인이 보고한 메시지
        message: String,
    },

    /// 인증 실패
    #[error("authentication failed: {0}")]
    Auth(String),

    /// HTTP 전송 실패
    #[error("http error: {0}")]
    Http(String),

    /// 응답 디코딩 실패
    #[error("decode error: {0}")]
    Decode(String),

    /// API가 지원하지 않는 요청
    #[error("unsupported request: {0}")]
    Unsupported(String),

    /// 설정 에러
    #[error("config error: {field}: {reason}")]
    Config {
        /// 설정 필드명
        field: String,
        /// 에러 사유
        reason: String,
    },
}

impl ControlPlaneError {
    /// 대상이 이미 없어서 실패했는지 확인합니다.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<reqwest::Error> for ControlPlaneError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Http(err.to_string())
        }
    }
}

impl From<ControlPlaneError> for VmProbeError {
    fn from(err: ControlPlaneError) -> Self {
        match err {
            ControlPlaneError::Config { field, reason } => {
                VmProbeError::Config(ConfigError::InvalidValue { field, reason })
            }
            other => VmProbeError::ControlPlane(other.to_string()),
        }
    }
}
