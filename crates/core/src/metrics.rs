//! 메트릭 상수 및 설명 등록
//!
//! 모든 메트릭의 이름과 설명을 중앙에서 정의합니다.
//! 엔진은 이 상수를 사용하여 `metrics::counter!()`, `metrics::gauge!()`,
//! `metrics::histogram!()` 매크로를 호출합니다. 익스포터는 이 워크스페이스에
//! 포함되지 않으며, 레코더가 설치되지 않은 경우 호출은 no-op입니다.
//!
//! # 네이밍 컨벤션
//!
//! - 접두어: `vigil_cep_`
//! - 접미어: `_total` (counter), `_seconds` (histogram), 없음 (gauge)
//!
//! # 사용 예시
//!
//! ```ignore
//! use metrics::counter;
//!
//! counter!(vigil_core::metrics::CEP_EVENTS_PROCESSED_TOTAL).increment(1);
//! ```

// ─── 레이블 키 상수 ────────────────────────────────────────────────

/// 심각도 레이블 키 (INFO, LOW, MEDIUM, HIGH, CRITICAL)
pub const LABEL_SEVERITY: &str = "severity";

/// 레플리카 인덱스 레이블 키
pub const LABEL_REPLICA: &str = "replica";

/// 규칙 업데이트 동작 레이블 키 (upsert, delete)
pub const LABEL_ACTION: &str = "action";

// ─── CEP 엔진 메트릭 ────────────────────────────────────────────────

/// 평가된 이벤트 수 (counter)
pub const CEP_EVENTS_PROCESSED_TOTAL: &str = "vigil_cep_events_processed_total";

/// 식별자 누락/디코딩 실패로 버려진 레코드 수 (counter)
pub const CEP_RECORDS_DROPPED_TOTAL: &str = "vigil_cep_records_dropped_total";

/// 생성된 알림 수 (counter, label: severity)
pub const CEP_ALERTS_EMITTED_TOTAL: &str = "vigil_cep_alerts_emitted_total";

/// 적용된 규칙 업데이트 수 (counter, label: action)
pub const CEP_RULE_UPDATES_APPLIED_TOTAL: &str = "vigil_cep_rule_updates_applied_total";

/// 규칙 컴파일 실패 수 (counter)
pub const CEP_RULE_COMPILE_FAILURES_TOTAL: &str = "vigil_cep_rule_compile_failures_total";

/// 규칙 저장소 조회 실패 수 (counter)
pub const CEP_RULE_FETCH_FAILURES_TOTAL: &str = "vigil_cep_rule_fetch_failures_total";

/// 싱크 전달 실패 수 (counter)
pub const CEP_SINK_FAILURES_TOTAL: &str = "vigil_cep_sink_failures_total";

/// 레플리카별 등록된 규칙 수 (gauge, label: replica)
pub const CEP_ACTIVE_RULES: &str = "vigil_cep_active_rules";

/// 이벤트 하나의 평가 소요 시간 (histogram, 초)
pub const CEP_EVALUATION_DURATION_SECONDS: &str = "vigil_cep_evaluation_duration_seconds";

/// 모든 메트릭의 설명을 등록합니다.
///
/// 레코더 설치 직후 한 번 호출합니다.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    describe_counter!(
        CEP_EVENTS_PROCESSED_TOTAL,
        "Total number of normalized events evaluated against the rule set"
    );
    describe_counter!(
        CEP_RECORDS_DROPPED_TOTAL,
        "Raw records dropped because they lacked an identifier or were undecodable"
    );
    describe_counter!(
        CEP_ALERTS_EMITTED_TOTAL,
        "Alerts emitted by rule matches, by severity"
    );
    describe_counter!(
        CEP_RULE_UPDATES_APPLIED_TOTAL,
        "Rule updates applied to a replica registry, by action"
    );
    describe_counter!(
        CEP_RULE_COMPILE_FAILURES_TOTAL,
        "Rule definitions rejected by the predicate compiler"
    );
    describe_counter!(
        CEP_RULE_FETCH_FAILURES_TOTAL,
        "Rule store reads that failed or timed out"
    );
    describe_counter!(
        CEP_SINK_FAILURES_TOTAL,
        "Alerts or events that could not be handed to a sink"
    );
    describe_gauge!(CEP_ACTIVE_RULES, "Compiled rules registered per replica");
    describe_histogram!(
        CEP_EVALUATION_DURATION_SECONDS,
        "Time spent evaluating all rules against one event"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_METRIC_NAMES: &[&str] = &[
        CEP_EVENTS_PROCESSED_TOTAL,
        CEP_RECORDS_DROPPED_TOTAL,
        CEP_ALERTS_EMITTED_TOTAL,
        CEP_RULE_UPDATES_APPLIED_TOTAL,
        CEP_RULE_COMPILE_FAILURES_TOTAL,
        CEP_RULE_FETCH_FAILURES_TOTAL,
        CEP_SINK_FAILURES_TOTAL,
        CEP_ACTIVE_RULES,
        CEP_EVALUATION_DURATION_SECONDS,
    ];

    #[test]
    fn all_metrics_start_with_prefix() {
        for name in ALL_METRIC_NAMES {
            assert!(name.starts_with("vigil_cep_"), "{name} has wrong prefix");
        }
    }

    #[test]
    fn counters_end_with_total() {
        for name in ALL_METRIC_NAMES {
            if *name == CEP_ACTIVE_RULES || *name == CEP_EVALUATION_DURATION_SECONDS {
                continue;
            }
            assert!(name.ends_with("_total"), "{name} should end with _total");
        }
    }

    #[test]
    fn metric_names_are_unique() {
        let unique: std::collections::HashSet<_> = ALL_METRIC_NAMES.iter().collect();
        assert_eq!(unique.len(), ALL_METRIC_NAMES.len());
    }

    #[test]
    fn describe_all_without_recorder_does_not_panic() {
        describe_all();
    }
}
