//! 이벤트 정규화 -- 원시 레코드를 [`NormalizedEvent`]로 변환합니다.
//!
//! 버스에서 전달된 JSON 레코드의 최상위 `msgId`/`hostname`과
//! `cefExtensions` 객체의 정규 필드를 고정 이름으로 복사하고,
//! `<X>Label`/`<X>` 쌍으로 표현된 동적 필드를 확장 맵에 펼칩니다.
//!
//! # 입력 레코드 예시
//! ```json
//! {
//!   "msgId": "PRINT-0001",
//!   "hostname": "pc-017",
//!   "cefExtensions": {
//!     "suid": "alice", "src": "10.0.0.5", "act": "PRINT",
//!     "cs1Label": "Page Count", "cs1": "42"
//!   }
//! }
//! ```
//!
//! `msgId`가 없는 레코드는 에러가 아니라 필터링 대상입니다 (`None` 반환).

use std::borrow::Cow;
use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::CepError;

/// 동적 필드 레이블 키 접미사
const LABEL_SUFFIX: &str = "Label";
/// 정수로도 파싱되는 파생 필드 이름
const PAGE_COUNT_FIELD: &str = "PageCount";

/// 버스에서 수신한 디코딩 전 레코드
#[derive(Debug, Clone)]
pub struct RawRecord {
    /// 원시 JSON 바이트
    pub data: Bytes,
    /// 수신 소스 식별자 (예: "kafka:cef-events/3")
    pub source: String,
    /// 수신 시각
    pub received_at: DateTime<Utc>,
}

impl RawRecord {
    /// 새 레코드를 생성합니다. 수신 시각은 현재 시각입니다.
    pub fn new(data: impl Into<Bytes>, source: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            source: source.into(),
            received_at: Utc::now(),
        }
    }
}

/// 정규화된 보안 이벤트
///
/// 생성 후 변경되지 않습니다. `msg_id`가 없는 이벤트는 만들어지지 않습니다.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEvent {
    /// 메시지 식별자 (필수)
    pub msg_id: String,
    /// 사용자 ID (`suid`)
    pub user_id: Option<String>,
    /// 사용자 이름 (`suser`)
    pub user_name: Option<String>,
    /// 호스트명
    pub hostname: Option<String>,
    /// 출발지 IP (`src`)
    pub user_ip: Option<String>,
    /// 행위 (`act`)
    pub action: Option<String>,
    /// 결과
    pub outcome: Option<String>,
    /// 이벤트 유형
    pub event_type: Option<String>,
    /// 정규화 시각
    pub timestamp: DateTime<Utc>,
    /// 파일 크기 (`fsize`, 없으면 0)
    pub file_size: i64,
    /// 페이지 수 (`PageCount` 파생 필드, 없거나 파싱 실패 시 0)
    pub page_count: i64,
    /// 악성 여부 (`cn1 == "1"`)
    pub is_malicious: bool,
    /// 정규화 시각의 시 (0-23, 고정 오프셋 기준)
    pub hour: u32,
    /// 정규화 시각의 요일 (ISO, 월=1 ... 일=7)
    pub day_of_week: u32,
    /// 확장 필드 (원본 확장 키 + 레이블 파생 필드)
    pub ext: HashMap<String, String>,
}

impl NormalizedEvent {
    /// 최소 필드만 가진 이벤트를 생성합니다.
    ///
    /// 테스트나 다른 수집 경로에서 직접 이벤트를 조립할 때 사용합니다.
    pub fn new(msg_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            msg_id: msg_id.into(),
            user_id: None,
            user_name: None,
            hostname: None,
            user_ip: None,
            action: None,
            outcome: None,
            event_type: None,
            timestamp,
            file_size: 0,
            page_count: 0,
            is_malicious: false,
            hour: 0,
            day_of_week: 1,
            ext: HashMap::new(),
        }
    }

    /// 필드 이름(별칭 포함)을 문자열 값으로 해석합니다.
    ///
    /// 정규 필드 별칭을 먼저 확인하고, 없으면 확장 맵에서 찾습니다.
    /// 값이 없으면 빈 문자열이 아니라 `None`입니다. 파일 크기와 페이지 수는 원본
    /// 텍스트가 없으면 숫자 필드 값을 텍스트로 돌려주므로 항상 존재합니다.
    pub fn resolve(&self, field: &str) -> Option<Cow<'_, str>> {
        fn borrowed(v: &Option<String>) -> Option<Cow<'_, str>> {
            v.as_deref().map(Cow::Borrowed)
        }

        match field {
            "msgId" => Some(Cow::Borrowed(&self.msg_id)),
            "suid" | "userId" => borrowed(&self.user_id),
            "suser" | "userName" => borrowed(&self.user_name),
            "hostname" | "shost" => borrowed(&self.hostname),
            "src" | "userIp" => borrowed(&self.user_ip),
            "act" | "action" => borrowed(&self.action),
            "outcome" => borrowed(&self.outcome),
            "eventType" => borrowed(&self.event_type),
            "hour" => Some(Cow::Owned(self.hour.to_string())),
            "dayOfWeek" => Some(Cow::Owned(self.day_of_week.to_string())),
            "fsize" | "fileSize" => Some(match self.ext.get("fsize") {
                Some(v) => Cow::Borrowed(v.as_str()),
                None => Cow::Owned(self.file_size.to_string()),
            }),
            "pageCount" | "PageCount" => Some(match self.ext.get(PAGE_COUNT_FIELD) {
                Some(v) => Cow::Borrowed(v.as_str()),
                None => Cow::Owned(self.page_count.to_string()),
            }),
            "isMalicious" => Some(Cow::Borrowed(if self.is_malicious {
                "true"
            } else {
                "false"
            })),
            other => self.ext.get(other).map(|v| Cow::Borrowed(v.as_str())),
        }
    }

    /// 필드 이름(별칭 포함)을 숫자로 해석합니다.
    ///
    /// 값이 없거나 숫자로 파싱할 수 없으면 0입니다.
    pub fn resolve_number(&self, field: &str) -> f64 {
        match field {
            "fsize" | "fileSize" => self.file_size as f64,
            "pageCount" | "PageCount" => self.page_count as f64,
            "hour" => f64::from(self.hour),
            "dayOfWeek" => f64::from(self.day_of_week),
            "isMalicious" => f64::from(u8::from(self.is_malicious)),
            other => self
                .resolve(other)
                .and_then(|v| v.trim().parse::<f64>().ok())
                .unwrap_or(0.0),
        }
    }
}

/// 이벤트 정규화기
///
/// 시/요일 파생 필드 계산에 쓰는 고정 오프셋만 상태로 가집니다.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    zone: FixedOffset,
}

impl Normalizer {
    /// 고정 UTC 오프셋(초)으로 정규화기를 생성합니다.
    pub fn new(utc_offset_secs: i32) -> Result<Self, CepError> {
        let zone = FixedOffset::east_opt(utc_offset_secs).ok_or_else(|| CepError::Config {
            field: "utc_offset_secs".to_owned(),
            reason: format!("{utc_offset_secs} is not a valid UTC offset"),
        })?;
        Ok(Self { zone })
    }

    /// 원시 레코드를 정규화합니다.
    ///
    /// JSON 디코딩 실패, 객체가 아닌 레코드, `msgId` 누락은 모두 `None`입니다.
    /// 파생 시각 필드는 레코드의 수신 시각을 기준으로 계산합니다.
    pub fn normalize(&self, record: &RawRecord) -> Option<NormalizedEvent> {
        let value: Value = match serde_json::from_slice(&record.data) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(source = %record.source, error = %e, "undecodable record dropped");
                return None;
            }
        };
        self.normalize_value_at(&value, record.received_at)
    }

    /// 디코딩된 JSON 값을 현재 시각 기준으로 정규화합니다.
    pub fn normalize_value(&self, value: &Value) -> Option<NormalizedEvent> {
        self.normalize_value_at(value, Utc::now())
    }

    /// 디코딩된 JSON 값을 주어진 시각 기준으로 정규화합니다.
    pub fn normalize_value_at(&self, value: &Value, now: DateTime<Utc>) -> Option<NormalizedEvent> {
        let root = value.as_object()?;
        let Some(msg_id) = root.get("msgId").and_then(scalar_string) else {
            tracing::debug!("record without msgId dropped");
            return None;
        };

        let mut event = NormalizedEvent::new(msg_id, now);
        event.hostname = root.get("hostname").and_then(scalar_string);

        let local = now.with_timezone(&self.zone);
        event.hour = local.hour();
        event.day_of_week = local.weekday().number_from_monday();

        if let Some(ext) = root.get("cefExtensions").and_then(Value::as_object) {
            apply_extensions(&mut event, ext);
        }

        Some(event)
    }
}

/// `cefExtensions` 객체를 이벤트에 반영합니다.
fn apply_extensions(event: &mut NormalizedEvent, ext: &Map<String, Value>) {
    let get = |key: &str| ext.get(key).and_then(scalar_string);

    event.user_id = get("suid");
    event.user_name = get("suser");
    event.user_ip = get("src");
    event.action = get("act");
    event.outcome = get("outcome");
    event.event_type = get("eventType");
    event.is_malicious = get("cn1").is_some_and(|v| v == "1");
    if let Some(size) = ext.get("fsize") {
        event.file_size = lenient_integer(size).unwrap_or(0);
    }

    for (key, value) in ext {
        if let Some(s) = scalar_string(value) {
            event.ext.insert(key.clone(), s);
        }
    }

    // 레이블 파생 필드: cs1Label="Page Count", cs1="42" -> PageCount="42"
    for (key, label) in ext {
        let Some(value_key) = key.strip_suffix(LABEL_SUFFIX) else {
            continue;
        };
        let Some(label) = scalar_string(label) else {
            continue;
        };
        let name: String = label.chars().filter(|c| *c != ' ').collect();
        if name.is_empty() {
            continue;
        }
        if let Some(val) = ext.get(value_key).and_then(scalar_string) {
            event.ext.insert(name, val);
        }
    }

    if let Some(pc) = event.ext.get(PAGE_COUNT_FIELD) {
        event.page_count = pc.trim().parse::<i64>().unwrap_or(0);
    }
}

/// 스칼라 JSON 값을 문자열로 변환합니다. null, 배열, 객체는 `None`입니다.
fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// 정수 또는 정수 문자열을 파싱합니다. 실수는 소수점 이하를 버립니다.
fn lenient_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    const KST: i32 = 9 * 3600;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn normalizer() -> Normalizer {
        Normalizer::new(KST).unwrap()
    }

    #[test]
    fn copies_canonical_fields() {
        let value = json!({
            "msgId": "M-1",
            "hostname": "pc-01",
            "cefExtensions": {
                "suid": "alice", "suser": "Alice Kim", "src": "10.0.0.5",
                "act": "COPY", "outcome": "success", "eventType": "file", "fsize": 2048
            }
        });
        let event = normalizer().normalize_value(&value).unwrap();
        assert_eq!(event.msg_id, "M-1");
        assert_eq!(event.hostname.as_deref(), Some("pc-01"));
        assert_eq!(event.user_id.as_deref(), Some("alice"));
        assert_eq!(event.user_name.as_deref(), Some("Alice Kim"));
        assert_eq!(event.user_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(event.action.as_deref(), Some("COPY"));
        assert_eq!(event.outcome.as_deref(), Some("success"));
        assert_eq!(event.event_type.as_deref(), Some("file"));
        assert_eq!(event.file_size, 2048);
    }

    #[test]
    fn missing_msg_id_is_dropped() {
        let value = json!({ "hostname": "pc-01" });
        assert!(normalizer().normalize_value(&value).is_none());
        let value = json!({ "msgId": null });
        assert!(normalizer().normalize_value(&value).is_none());
    }

    #[test]
    fn non_object_record_is_dropped() {
        assert!(normalizer().normalize_value(&json!([1, 2, 3])).is_none());
    }

    #[test]
    fn undecodable_bytes_are_dropped() {
        let record = RawRecord::new(Bytes::from_static(b"{not json"), "test");
        assert!(normalizer().normalize(&record).is_none());
    }

    #[test]
    fn numeric_msg_id_is_stringified() {
        let event = normalizer().normalize_value(&json!({ "msgId": 42 })).unwrap();
        assert_eq!(event.msg_id, "42");
    }

    #[test]
    fn label_pairs_are_expanded() {
        let value = json!({
            "msgId": "M-2",
            "cefExtensions": { "cs1Label": "PageCount", "cs1": "42" }
        });
        let event = normalizer().normalize_value(&value).unwrap();
        assert_eq!(event.ext.get("PageCount").map(String::as_str), Some("42"));
        assert_eq!(event.page_count, 42);
    }

    #[test]
    fn label_spaces_are_removed() {
        let value = json!({
            "msgId": "M-3",
            "cefExtensions": { "cs2Label": "Config Type", "cs2": "ipchange" }
        });
        let event = normalizer().normalize_value(&value).unwrap();
        assert_eq!(event.resolve("ConfigType").as_deref(), Some("ipchange"));
    }

    #[test]
    fn empty_label_and_missing_sibling_are_ignored() {
        let value = json!({
            "msgId": "M-4",
            "cefExtensions": { "cs1Label": "", "cs1": "x", "cs3Label": "Orphan" }
        });
        let event = normalizer().normalize_value(&value).unwrap();
        assert!(!event.ext.contains_key(""));
        assert!(!event.ext.contains_key("Orphan"));
    }

    #[test]
    fn unparsable_page_count_defaults_to_zero() {
        let value = json!({
            "msgId": "M-5",
            "cefExtensions": { "cn2Label": "PageCount", "cn2": "many" }
        });
        let event = normalizer().normalize_value(&value).unwrap();
        assert_eq!(event.page_count, 0);
        assert_eq!(event.resolve("PageCount").as_deref(), Some("many"));
    }

    #[test]
    fn malicious_flag_from_cn1() {
        let value = json!({ "msgId": "M-6", "cefExtensions": { "cn1": "1" } });
        assert!(normalizer().normalize_value(&value).unwrap().is_malicious);
        let value = json!({ "msgId": "M-7", "cefExtensions": { "cn1": "0" } });
        assert!(!normalizer().normalize_value(&value).unwrap().is_malicious);
    }

    #[test]
    fn hour_and_day_use_fixed_offset() {
        // 2026-01-15 (목) 20:00 UTC == 2026-01-16 (금) 05:00 KST
        let event = normalizer()
            .normalize_value_at(&json!({ "msgId": "M-8" }), at(2026, 1, 15, 20))
            .unwrap();
        assert_eq!(event.hour, 5);
        assert_eq!(event.day_of_week, 5);

        let utc = Normalizer::new(0).unwrap();
        let event = utc
            .normalize_value_at(&json!({ "msgId": "M-8" }), at(2026, 1, 15, 20))
            .unwrap();
        assert_eq!(event.hour, 20);
        assert_eq!(event.day_of_week, 4);
    }

    #[test]
    fn invalid_offset_is_rejected() {
        assert!(Normalizer::new(90_000).is_err());
    }

    #[test]
    fn resolve_aliases() {
        let value = json!({
            "msgId": "M-9",
            "hostname": "pc-09",
            "cefExtensions": { "suid": "bob", "src": "10.1.1.1", "act": "PRINT", "fsize": "77" }
        });
        let event = normalizer().normalize_value(&value).unwrap();
        assert_eq!(event.resolve("userId"), event.resolve("suid"));
        assert_eq!(event.resolve("shost").as_deref(), Some("pc-09"));
        assert_eq!(event.resolve("userIp").as_deref(), Some("10.1.1.1"));
        assert_eq!(event.resolve("action").as_deref(), Some("PRINT"));
        assert_eq!(event.resolve("fileSize").as_deref(), Some("77"));
        assert_eq!(event.resolve_number("fileSize"), 77.0);
        assert!(event.resolve("outcome").is_none());
    }

    #[test]
    fn numeric_fields_resolve_without_raw_text() {
        let mut event = NormalizedEvent::new("M-13", Utc::now());
        event.file_size = 2_000_000;
        event.page_count = 12;
        assert_eq!(event.resolve("fileSize").as_deref(), Some("2000000"));
        assert_eq!(event.resolve("fsize").as_deref(), Some("2000000"));
        assert_eq!(event.resolve("PageCount").as_deref(), Some("12"));

        let rule =
            crate::rule::compile_predicate("fileSize = 2000000 AND pageCount = '12'").unwrap();
        assert!(crate::rule::matches(&rule, &event));
    }

    #[test]
    fn resolve_number_defaults_to_zero() {
        let mut event = NormalizedEvent::new("M-10", Utc::now());
        event.ext.insert("riskScore".to_owned(), "not-a-number".to_owned());
        assert_eq!(event.resolve_number("riskScore"), 0.0);
        assert_eq!(event.resolve_number("absent"), 0.0);
        event.ext.insert("riskScore".to_owned(), " 7.5 ".to_owned());
        assert_eq!(event.resolve_number("riskScore"), 7.5);
    }

    #[test]
    fn scalar_extension_values_are_stringified() {
        let value = json!({
            "msgId": "M-11",
            "cefExtensions": { "cnt": 3, "flag": true, "nested": { "a": 1 }, "nothing": null }
        });
        let event = normalizer().normalize_value(&value).unwrap();
        assert_eq!(event.ext.get("cnt").map(String::as_str), Some("3"));
        assert_eq!(event.ext.get("flag").map(String::as_str), Some("true"));
        assert!(!event.ext.contains_key("nested"));
        assert!(!event.ext.contains_key("nothing"));
    }

    #[test]
    fn float_file_size_is_truncated() {
        let value = json!({ "msgId": "M-12", "cefExtensions": { "fsize": 10.9 } });
        assert_eq!(normalizer().normalize_value(&value).unwrap().file_size, 10);
    }
}
