//! 메트릭 상수 및 설명 등록
//!
//! 모든 Prometheus 메트릭의 이름과 설명을 중앙에서 정의합니다.
//! 각 크레이트는 이 상수를 사용하여 `metrics::counter!()`,
//! `metrics::histogram!()` 매크로를 호출합니다.
//!
//! # 네이밍 컨벤션
//!
//! - 접두어: `vmprobe_`
//! - 영역: `scenario_`, `control_plane_`, `power_`, `remote_`, `cleanup_`
//! - 접미어: `_total` (counter), `_seconds` (histogram/latency)
//!
//! # 사용 예시
//!
//! ```ignore
//! use vmprobe_core::metrics as m;
//!
//! metrics::counter!(m::SCENARIOS_TOTAL, m::LABEL_OUTCOME => "passed").increment(1);
//! ```

// ─── 레이블 키 상수 ────────────────────────────────────────────────

/// 시나리오 결과 레이블 키 (passed, failed, skipped)
pub const LABEL_OUTCOME: &str = "outcome";

/// 전원 액션 레이블 키 (stop, start, pause, ...)
pub const LABEL_ACTION: &str = "action";

/// 원격 채널 레이블 키 (guest-shell, host-management)
pub const LABEL_CHANNEL: &str = "channel";

/// 리소스 종류 레이블 키 (keypair, security_group, instance, floating_ip)
pub const LABEL_RESOURCE: &str = "resource";

/// 에러 분류 레이블 키
pub const LABEL_ERROR_KIND: &str = "kind";

/// 결과 레이블 키 (success, failure)
pub const LABEL_RESULT: &str = "result";

// ─── 시나리오 메트릭 ────────────────────────────────────────────────

/// 완료된 시나리오 수 (counter, label: outcome)
pub const SCENARIOS_TOTAL: &str = "vmprobe_scenarios_total";

/// 실패한 시나리오의 에러 분류 (counter, label: kind)
pub const SCENARIO_FAILURES_TOTAL: &str = "vmprobe_scenario_failures_total";

/// 시나리오 전체 소요 시간 (histogram, 초)
pub const SCENARIO_DURATION_SECONDS: &str = "vmprobe_scenario_duration_seconds";

// ─── 컨트롤 플레인 메트릭 ───────────────────────────────────────────

/// 컨트롤 플레인 HTTP 요청 수 (counter, label: result)
pub const CONTROL_PLANE_REQUESTS_TOTAL: &str = "vmprobe_control_plane_requests_total";

/// 상태 대기 중 수행한 폴링 수 (counter)
pub const WAIT_POLLS_TOTAL: &str = "vmprobe_control_plane_wait_polls_total";

/// 상태 대기 시간 초과 수 (counter)
pub const WAIT_TIMEOUTS_TOTAL: &str = "vmprobe_control_plane_wait_timeouts_total";

/// 발행된 전원 액션 수 (counter, labels: action, result)
pub const POWER_ACTIONS_TOTAL: &str = "vmprobe_power_actions_total";

/// 전원 액션 발행부터 목표 상태 관측까지 걸린 시간 (histogram, 초, label: action)
pub const POWER_TRANSITION_DURATION_SECONDS: &str = "vmprobe_power_transition_duration_seconds";

// ─── 원격 세션 메트릭 ───────────────────────────────────────────────

/// 원격 명령 실행 수 (counter, labels: channel, result)
pub const REMOTE_COMMANDS_TOTAL: &str = "vmprobe_remote_commands_total";

/// 원격 명령 실행 시간 (histogram, 초, label: channel)
pub const REMOTE_COMMAND_DURATION_SECONDS: &str = "vmprobe_remote_command_duration_seconds";

/// 세션 접속 시도 수 (counter, labels: channel, result)
pub const REMOTE_CONNECT_ATTEMPTS_TOTAL: &str = "vmprobe_remote_connect_attempts_total";

// ─── 정리 메트릭 ────────────────────────────────────────────────────

/// 리소스 해제 실패 수 (counter, label: resource)
pub const CLEANUP_FAILURES_TOTAL: &str = "vmprobe_cleanup_failures_total";

// ─── 히스토그램 버킷 정의 ────────────────────────────────────────────

/// 전원 전이 시간 버킷 (초)
///
/// 1s ~ 600s. shelve/unshelve는 수 분이 걸립니다.
pub const TRANSITION_DURATION_BUCKETS: [f64; 9] =
    [1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 450.0, 600.0];

/// 시나리오 소요 시간 버킷 (초)
pub const SCENARIO_DURATION_BUCKETS: [f64; 8] =
    [30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0, 3600.0];

// ─── 설명 등록 함수 ─────────────────────────────────────────────────

/// 모든 메트릭의 설명(description)을 등록합니다.
///
/// 전역 레코더 설치 후 한 번만 호출합니다. `vmprobe` 바이너리의
/// 메트릭 익스포터 시작 시점에서 호출됩니다.
pub fn describe_all() {
    use metrics::{describe_counter, describe_histogram};

    describe_counter!(SCENARIOS_TOTAL, "Scenarios completed, by outcome");
    describe_counter!(
        SCENARIO_FAILURES_TOTAL,
        "Failed scenarios, by terminal error kind"
    );
    describe_histogram!(
        SCENARIO_DURATION_SECONDS,
        "Wall-clock duration of a scenario including teardown"
    );

    describe_counter!(
        CONTROL_PLANE_REQUESTS_TOTAL,
        "HTTP requests issued to the compute control plane"
    );
    describe_counter!(WAIT_POLLS_TOTAL, "Status polls issued while waiting for a state");
    describe_counter!(WAIT_TIMEOUTS_TOTAL, "State waits that exceeded their budget");
    describe_counter!(POWER_ACTIONS_TOTAL, "Power actions issued, by action and result");
    describe_histogram!(
        POWER_TRANSITION_DURATION_SECONDS,
        "Time from issuing a power action to observing its target state"
    );

    describe_counter!(
        REMOTE_COMMANDS_TOTAL,
        "Remote commands executed, by channel and result"
    );
    describe_histogram!(
        REMOTE_COMMAND_DURATION_SECONDS,
        "Remote command execution latency in seconds"
    );
    describe_counter!(
        REMOTE_CONNECT_ATTEMPTS_TOTAL,
        "Remote session connect attempts, by channel and result"
    );

    describe_counter!(
        CLEANUP_FAILURES_TOTAL,
        "Resource releases that failed during teardown"
    );
}
