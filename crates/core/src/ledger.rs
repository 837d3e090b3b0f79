//! 리소스 원장 — 시나리오가 만든 리소스의 역순 해제 보장
//!
//! [`ResourceLedger`]는 획득 순서대로 리소스와 해제 동작을 기록하고,
//! [`release_all`](ResourceLedger::release_all)에서 정확히 역순으로 해제합니다.
//! 개별 해제 실패는 로그로 남기고 수집할 뿐, 나머지 해제를 막지 않습니다.
//!
//! # 사용 예시
//! ```ignore
//! let mut ledger = ResourceLedger::new();
//! ledger.track(ResourceKind::Keypair, "kp-1", move || async move {
//!     facade.delete_keypair("kp-1").await
//! });
//!
//! // 성공/실패와 무관하게 시나리오 종료 시 한 번 호출
//! let report = ledger.release_all().await;
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::VmProbeError;
use crate::metrics as m;

/// 박싱된 Send future
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// 해제 동작 — 한 번만 호출됩니다.
pub type ReleaseFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), VmProbeError>> + Send>;

/// 원장이 추적하는 리소스 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Keypair,
    SecurityGroup,
    Instance,
    FloatingIp,
}

impl ResourceKind {
    /// 메트릭 레이블용 고정 이름
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Keypair => "keypair",
            Self::SecurityGroup => "security_group",
            Self::Instance => "instance",
            Self::FloatingIp => "floating_ip",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct LedgerEntry {
    kind: ResourceKind,
    handle: String,
    release: ReleaseFn,
}

/// 해제된 리소스
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasedResource {
    pub kind: ResourceKind,
    pub handle: String,
}

/// 해제 실패 내역
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupFailure {
    pub kind: ResourceKind,
    pub handle: String,
    pub reason: String,
}

impl fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}': {}", self.kind, self.handle, self.reason)
    }
}

/// `release_all` 결과
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// 해제 순서대로 기록된 리소스
    pub released: Vec<ReleasedResource>,
    /// 해제 실패 내역
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    /// 모든 해제가 성공했는지 확인합니다.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// 리포트에 덧붙일 경고 문자열 목록
    pub fn warnings(&self) -> Vec<String> {
        self.failures.iter().map(ToString::to_string).collect()
    }

    /// 실패가 있으면 집계된 `Cleanup` 에러로 변환합니다.
    pub fn into_error(self) -> Option<VmProbeError> {
        if self.failures.is_empty() {
            None
        } else {
            Some(VmProbeError::Cleanup {
                failures: self.warnings(),
            })
        }
    }
}

/// 리소스 원장
///
/// 시나리오 하나가 독점 소유합니다. 시나리오 사이에 공유되지 않습니다.
#[derive(Default)]
pub struct ResourceLedger {
    entries: Vec<LedgerEntry>,
    released: bool,
}

impl ResourceLedger {
    /// 빈 원장을 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 리소스와 해제 동작을 기록합니다.
    pub fn track<F, Fut>(&mut self, kind: ResourceKind, handle: impl Into<String>, release: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), VmProbeError>> + Send + 'static,
    {
        let handle = handle.into();
        if self.released {
            warn!(kind = %kind, handle = %handle, "tracking resource after ledger release");
        }
        debug!(kind = %kind, handle = %handle, position = self.entries.len(), "resource tracked");
        self.entries.push(LedgerEntry {
            kind,
            handle,
            release: Box::new(move || Box::pin(release())),
        });
    }

    /// 추적 중인 리소스 수
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 추적 중인 리소스가 없는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `release_all`이 이미 호출되었는지 확인합니다.
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// 획득 순서대로 추적 중인 리소스를 반환합니다.
    pub fn tracked(&self) -> Vec<(ResourceKind, &str)> {
        self.entries
            .iter()
            .map(|e| (e.kind, e.handle.as_str()))
            .collect()
    }

    /// 모든 리소스를 획득 역순으로 해제합니다.
    ///
    /// 개별 실패는 수집만 하고 전파하지 않습니다. 완료 후 원장은 비어 있습니다.
    /// 두 번째 호출은 빈 리포트를 반환합니다.
    pub async fn release_all(&mut self) -> CleanupReport {
        let mut report = CleanupReport::default();

        if self.released && self.entries.is_empty() {
            warn!("release_all called on an already released ledger");
            return report;
        }
        self.released = true;

        let total = self.entries.len();
        info!(resources = total, "releasing tracked resources");

        while let Some(entry) = self.entries.pop() {
            let LedgerEntry {
                kind,
                handle,
                release,
            } = entry;

            match release().await {
                Ok(()) => {
                    debug!(kind = %kind, handle = %handle, "resource released");
                    report.released.push(ReleasedResource { kind, handle });
                }
                Err(e) => {
                    error!(kind = %kind, handle = %handle, error = %e, "resource release failed");
                    metrics::counter!(m::CLEANUP_FAILURES_TOTAL, m::LABEL_RESOURCE => kind.as_str())
                        .increment(1);
                    report.failures.push(CleanupFailure {
                        kind,
                        handle,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            released = report.released.len(),
            failed = report.failures.len(),
            "resource release finished"
        );
        report
    }
}

impl Drop for ResourceLedger {
    fn drop(&mut self) {
        for entry in &self.entries {
            error!(
                kind = %entry.kind,
                handle = %entry.handle,
                "ledger dropped with unreleased resource"
            );
        }
    }
}

impl fmt::Debug for ResourceLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLedger")
            .field("entries", &self.tracked())
            .field("released", &self.released)
            .finish()
    }
}
