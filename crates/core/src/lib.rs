//! vmprobe 공통 크레이트
//!
//! VM 수명주기 통합 테스트 하네스의 모든 크레이트가 공유하는
//! 데이터 모델, 에러 분류, 설정, 리소스 원장, 메트릭 이름을 제공합니다.

pub mod config;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod types;

// --- 주요 타입 re-export ---

// 에러
pub use error::{ConfigError, ErrorKind, VmProbeError};

// 설정
pub use config::VmProbeConfig;

// 리소스 원장
pub use ledger::{BoxFuture, CleanupFailure, CleanupReport, ResourceKind, ResourceLedger};

// 도메인 타입
pub use types::{
    CommandOutput, Credentials, Flavor, FloatingIp, ImageInfo, Instance, Keypair, PowerAction,
    PowerState, SecurityGroup, SecurityGroupRule, SessionKind, SessionTarget,
};
