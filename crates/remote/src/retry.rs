//! 접속 재시도 예산
//!
//! 세션 접속은 `attempts`회까지 시도하며, 시도 사이에는
//! `backoff_base * attempt` 만큼 선형으로 대기합니다.
//! 각 시도는 `attempt_timeout`으로 제한됩니다.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};
use vmprobe_core::metrics as m;
use vmprobe_core::types::SessionTarget;

use crate::error::RemoteError;

/// 접속 재시도 예산
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    /// 총 시도 횟수 (최소 1)
    pub attempts: u32,
    /// 재시도 대기 기본값
    pub backoff_base: Duration,
    /// 시도당 제한 시간
    pub attempt_timeout: Duration,
}

impl RetryBudget {
    pub fn new(attempts: u32, backoff_base: Duration, attempt_timeout: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff_base,
            attempt_timeout,
        }
    }

    /// 한 번만 시도하는 예산
    pub fn single(attempt_timeout: Duration) -> Self {
        Self::new(1, Duration::ZERO, attempt_timeout)
    }
}

/// 재시도 예산 안에서 접속을 시도합니다.
///
/// `connect`는 시도 번호(1부터)를 받습니다. 시도 중 하나라도 성공하면 즉시
/// 반환하고, 모두 실패하면 마지막 실패 사유를 담은 `RemoteError::Connection`을
/// 반환합니다. 인증 정보 형식 에러처럼 재시도해도 소용없는 에러는 그대로 반환합니다.
pub async fn connect_with_retry<T, F, Fut>(
    target: &SessionTarget,
    budget: RetryBudget,
    mut connect: F,
) -> Result<T, RemoteError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let mut last_reason = String::from("no attempt made");

    for attempt in 1..=budget.attempts {
        if attempt > 1 {
            let backoff = budget.backoff_base * (attempt - 1);
            warn!(
                remote = %target,
                attempt,
                backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                reason = %last_reason,
                "retrying session connect"
            );
            tokio::time::sleep(backoff).await;
        }

        let result = tokio::time::timeout(budget.attempt_timeout, connect(attempt)).await;
        let outcome = match &result {
            Ok(Ok(_)) => "success",
            _ => "failure",
        };
        metrics::counter!(
            m::REMOTE_CONNECT_ATTEMPTS_TOTAL,
            m::LABEL_CHANNEL => target.kind.as_str(),
            m::LABEL_RESULT => outcome
        )
        .increment(1);

        match result {
            Ok(Ok(session)) => {
                debug!(remote = %target, attempt, "session connected");
                return Ok(session);
            }
            Ok(Err(e @ (RemoteError::Credentials { .. } | RemoteError::Config { .. }))) => {
                return Err(e);
            }
            Ok(Err(e)) => last_reason = e.to_string(),
            Err(_elapsed) => {
                last_reason = format!("attempt timed out after {:?}", budget.attempt_timeout);
            }
        }
    }

    Err(RemoteError::Connection {
        target: target.to_string(),
        attempts: budget.attempts,
        reason: last_reason,
    })
}
