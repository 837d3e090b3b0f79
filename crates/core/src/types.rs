//! 도메인 타입 — 시나리오 전반에서 공유되는 데이터 모델
//!
//! 컨트롤 플레인이 만든 리소스(인스턴스, 키페어, 보안 그룹, 플로팅 IP)와
//! 원격 세션 관련 타입을 정의합니다.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 인스턴스 전원 상태
///
/// 컨트롤 플레인의 상태 문자열을 정규화한 값입니다.
/// `Error`와 `Deleted`는 종료 상태로, 어떤 전원 액션도 허용되지 않습니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PowerState {
    /// 생성 중 또는 중간 작업 상태 (아직 안정되지 않음)
    Building,
    /// 실행 중
    Active,
    /// 전원 꺼짐
    Shutoff,
    /// 일시정지
    Paused,
    /// 일시중단 (메모리 상태 보존)
    Suspended,
    /// 저장됨 (shelve)
    Saved,
    /// 오류
    Error,
    /// 삭제됨
    Deleted,
}

impl PowerState {
    /// 컨트롤 플레인 상태 문자열을 전원 상태로 변환합니다.
    ///
    /// 알 수 없는 문자열(REBOOT, MIGRATING 등 중간 상태)은 `Building`으로 취급합니다.
    pub fn from_status(status: &str) -> Self {
        match status.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => Self::Active,
            "SHUTOFF" => Self::Shutoff,
            "PAUSED" => Self::Paused,
            "SUSPENDED" => Self::Suspended,
            "SHELVED" | "SHELVED_OFFLOADED" => Self::Saved,
            "ERROR" => Self::Error,
            "DELETED" | "SOFT_DELETED" => Self::Deleted,
            _ => Self::Building,
        }
    }

    /// 더 이상 전이가 허용되지 않는 종료 상태인지 확인합니다.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Deleted)
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Building => "BUILDING",
            Self::Active => "ACTIVE",
            Self::Shutoff => "SHUTOFF",
            Self::Paused => "PAUSED",
            Self::Suspended => "SUSPENDED",
            Self::Saved => "SAVED",
            Self::Error => "ERROR",
            Self::Deleted => "DELETED",
        };
        f.write_str(s)
    }
}

/// 전원 액션
///
/// 컨트롤 플레인에 요청하는 상태 전이입니다. 각 액션은 허용되는
/// 선행 상태 집합과 하나의 목표 상태를 가집니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerAction {
    Stop,
    Start,
    Pause,
    Unpause,
    Suspend,
    Resume,
    Save,
    Unsave,
}

impl PowerAction {
    /// 액션 완료 후 기대되는 상태를 반환합니다.
    pub fn target_state(self) -> PowerState {
        match self {
            Self::Stop => PowerState::Shutoff,
            Self::Start | Self::Unpause | Self::Resume | Self::Unsave => PowerState::Active,
            Self::Pause => PowerState::Paused,
            Self::Suspend => PowerState::Suspended,
            Self::Save => PowerState::Saved,
        }
    }

    /// 액션을 요청할 수 있는 선행 상태 집합을 반환합니다.
    pub fn preconditions(self) -> &'static [PowerState] {
        match self {
            Self::Stop => &[PowerState::Active, PowerState::Paused, PowerState::Suspended],
            Self::Start => &[PowerState::Shutoff],
            Self::Pause | Self::Suspend => &[PowerState::Active],
            Self::Unpause => &[PowerState::Paused],
            Self::Resume => &[PowerState::Suspended],
            Self::Save => &[PowerState::Active, PowerState::Shutoff],
            Self::Unsave => &[PowerState::Saved],
        }
    }

    /// 주어진 상태에서 이 액션을 요청할 수 있는지 확인합니다.
    pub fn allowed_from(self, state: PowerState) -> bool {
        self.preconditions().contains(&state)
    }

    /// 메트릭 레이블과 로그에 쓰는 고정 이름
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Unpause => "unpause",
            Self::Suspend => "suspend",
            Self::Resume => "resume",
            Self::Save => "save",
            Self::Unsave => "unsave",
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 프로비저닝된 가상 머신 인스턴스
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// 컨트롤 플레인 인스턴스 ID
    pub id: String,
    /// 인스턴스 이름
    pub name: String,
    /// 하이퍼바이저 호스트명
    pub host: String,
    /// 하이퍼바이저 측 VM 이름
    pub hypervisor_name: String,
    /// 현재 전원 상태
    pub state: PowerState,
    /// 컨트롤 플레인이 보고한 원본 상태 문자열
    pub raw_status: String,
    /// 연결된 키페어 이름
    pub key_name: Option<String>,
    /// 연결된 보안 그룹 이름
    pub security_groups: Vec<String>,
    /// 바인딩된 플로팅 IP 주소
    pub floating_ip: Option<String>,
}

/// 키페어
///
/// 개인 키는 메모리에만 보관되며 `Debug` 출력에서 가려집니다.
#[derive(Clone, PartialEq, Eq)]
pub struct Keypair {
    /// 키페어 이름 (시나리오 실행마다 고유)
    pub name: String,
    /// 공개 키
    pub public_key: String,
    /// 개인 키 (컨트롤 플레인이 생성한 경우에만 존재)
    pub private_key: Option<String>,
    /// 지문
    pub fingerprint: String,
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("name", &self.name)
            .field("fingerprint", &self.fingerprint)
            .field(
                "private_key",
                &self.private_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// 보안 그룹 규칙 방향
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleDirection {
    Ingress,
    Egress,
}

/// 보안 그룹 규칙
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupRule {
    /// 방향
    pub direction: RuleDirection,
    /// 프로토콜 (tcp, udp, icmp)
    pub protocol: String,
    /// 시작 포트 (icmp는 type, -1은 전체)
    pub from_port: i32,
    /// 끝 포트
    pub to_port: i32,
    /// 허용 CIDR
    pub cidr: String,
}

impl SecurityGroupRule {
    /// 모든 출발지에서 들어오는 규칙을 생성합니다.
    pub fn ingress(protocol: &str, from_port: i32, to_port: i32) -> Self {
        Self {
            direction: RuleDirection::Ingress,
            protocol: protocol.to_owned(),
            from_port,
            to_port,
            cidr: "0.0.0.0/0".to_owned(),
        }
    }

    /// SSH와 ICMP를 허용하는 기본 규칙 집합
    pub fn permissive_defaults() -> Vec<Self> {
        vec![Self::ingress("tcp", 22, 22), Self::ingress("icmp", -1, -1)]
    }
}

/// 보안 그룹
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    /// 보안 그룹 ID
    pub id: String,
    /// 보안 그룹 이름
    pub name: String,
    /// 순서가 보존되는 규칙 목록
    pub rules: Vec<SecurityGroupRule>,
}

/// 플로팅 IP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloatingIp {
    /// 플로팅 IP ID
    pub id: String,
    /// 할당된 주소
    pub address: String,
    /// 주소 풀
    pub pool: String,
    /// 바인딩된 인스턴스 ID
    pub instance_id: Option<String>,
}

/// 플레이버 자원 사양
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flavor {
    pub id: String,
    pub ram_mb: u64,
    pub disk_gb: u64,
}

/// 이미지 최소 요구 사양
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: String,
    pub min_ram_mb: u64,
    pub min_disk_gb: u64,
}

impl ImageInfo {
    /// 이미지가 플레이버에 들어가는지 확인합니다.
    pub fn fits(&self, flavor: &Flavor) -> bool {
        self.min_disk_gb <= flavor.disk_gb && self.min_ram_mb <= flavor.ram_mb
    }
}

/// 원격 명령 실행 결과
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// 표준 출력
    pub stdout: String,
    /// 표준 에러
    pub stderr: String,
    /// 종료 코드
    pub exit_code: i32,
    /// 실행 시간
    pub duration: Duration,
}

impl CommandOutput {
    /// 종료 코드가 0인지 확인합니다.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// 원격 세션 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionKind {
    /// 게스트 OS 셸
    GuestShell,
    /// 하이퍼바이저 호스트 관리 채널
    HostManagement,
}

impl SessionKind {
    /// 메트릭 레이블용 고정 이름
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GuestShell => "guest-shell",
            Self::HostManagement => "host-management",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 원격 세션 대상
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTarget {
    /// 세션 종류
    pub kind: SessionKind,
    /// 대상 주소 (IP 또는 호스트명)
    pub address: String,
    /// 포트
    pub port: u16,
}

impl SessionTarget {
    /// 게스트 셸 대상을 생성합니다.
    pub fn guest(address: impl Into<String>, port: u16) -> Self {
        Self {
            kind: SessionKind::GuestShell,
            address: address.into(),
            port,
        }
    }

    /// 호스트 관리 대상을 생성합니다.
    pub fn host(address: impl Into<String>, port: u16) -> Self {
        Self {
            kind: SessionKind::HostManagement,
            address: address.into(),
            port,
        }
    }
}

impl fmt::Display for SessionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.kind, self.address, self.port)
    }
}

/// 세션 인증 정보
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// 개인 키 인증 (게스트 셸)
    PrivateKey { user: String, private_key: String },
    /// 비밀번호 인증 (호스트 관리)
    Password { user: String, password: String },
}

impl Credentials {
    /// 사용자명을 반환합니다.
    pub fn user(&self) -> &str {
        match self {
            Self::PrivateKey { user, .. } | Self::Password { user, .. } => user,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrivateKey { user, .. } => f
                .debug_struct("PrivateKey")
                .field("user", user)
                .field("private_key", &"<redacted>")
                .finish(),
            Self::Password { user, .. } => f
                .debug_struct("Password")
                .field("user", user)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}
