//! 도메인 타입 -- 시스템 전역에서 사용되는 공통 타입
//!
//! 규칙 엔진과 외부 싱크가 공유하는 데이터 구조를 정의합니다.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// 보안 알림
///
/// 규칙이 이벤트에 매칭될 때마다 하나씩 생성되며, 생성 후에는 변경되지 않습니다.
/// 외부 싱크로 전달되는 JSON 형식:
///
/// ```json
/// { "alertId": "alert-1a2b3c4d5e6f", "ruleId": "usb-bulk-copy", "ruleName": "USB 대량 복사",
///   "severity": "HIGH", "description": "...", "userId": "alice", "hostname": "pc-01",
///   "userIp": "10.0.0.5", "timestamp": "2026-01-15T03:00:00Z" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// 알림 ID (`alert-` 접두사 + 12자리)
    pub alert_id: String,
    /// 매칭된 규칙 ID
    pub rule_id: String,
    /// 매칭된 규칙 이름
    pub rule_name: String,
    /// 심각도
    pub severity: Severity,
    /// 규칙 설명
    pub description: String,
    /// 이벤트의 사용자 ID
    pub user_id: Option<String>,
    /// 이벤트의 호스트명
    pub hostname: Option<String>,
    /// 이벤트의 사용자 IP
    pub user_ip: Option<String>,
    /// 알림 생성 시각
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} (rule: {}, user: {})",
            self.severity,
            self.rule_name,
            self.rule_id,
            self.user_id.as_deref().unwrap_or("-"),
        )
    }
}

/// 심각도 레벨
///
/// `Ord` 구현으로 심각도 비교가 가능합니다 (`Info < Low < Medium < High < Critical`).
/// 직렬화는 대문자(`"HIGH"`), 역직렬화는 대소문자를 구분하지 않습니다.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// 정보성 이벤트
    Info,
    /// 낮은 심각도
    Low,
    /// 중간 심각도 (규칙 정의의 기본값)
    #[default]
    Medium,
    /// 높은 심각도
    High,
    /// 치명적 -- 즉시 대응 필요
    Critical,
}

impl Severity {
    /// 문자열에서 심각도를 파싱합니다.
    ///
    /// 대소문자를 구분하지 않습니다.
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "info" | "informational" => Some(Self::Info),
            "low" => Some(Self::Low),
            "medium" | "med" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" | "crit" => Some(Self::Critical),
            _ => None,
        }
    }

    /// 대문자 표기 (`"MEDIUM"` 등)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_loose(s).ok_or_else(|| format!("unknown severity '{s}'"))
    }
}

impl Serialize for Severity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_alert() -> Alert {
        Alert {
            alert_id: "alert-0123456789ab".to_owned(),
            rule_id: "usb-copy".to_owned(),
            rule_name: "USB bulk copy".to_owned(),
            severity: Severity::High,
            description: "many files copied".to_owned(),
            user_id: Some("alice".to_owned()),
            hostname: Some("pc-01".to_owned()),
            user_ip: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Info < Severity::Low);
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn severity_default_is_medium() {
        assert_eq!(Severity::default(), Severity::Medium);
    }

    #[test]
    fn severity_from_str_loose() {
        assert_eq!(Severity::from_str_loose("HIGH"), Some(Severity::High));
        assert_eq!(Severity::from_str_loose("high"), Some(Severity::High));
        assert_eq!(Severity::from_str_loose(" Critical "), Some(Severity::Critical));
        assert_eq!(Severity::from_str_loose("med"), Some(Severity::Medium));
        assert_eq!(Severity::from_str_loose("urgent"), None);
    }

    #[test]
    fn severity_serializes_uppercase() {
        let json = serde_json::to_string(&Severity::Critical).unwrap();
        assert_eq!(json, "\"CRITICAL\"");
        let parsed: Severity = serde_json::from_str("\"low\"").unwrap();
        assert_eq!(parsed, Severity::Low);
    }

    #[test]
    fn severity_rejects_unknown() {
        let result: Result<Severity, _> = serde_json::from_str("\"SEVERE\"");
        assert!(result.is_err());
    }

    #[test]
    fn alert_serializes_camel_case() {
        let json = serde_json::to_value(sample_alert()).unwrap();
        assert_eq!(json["alertId"], "alert-0123456789ab");
        assert_eq!(json["ruleId"], "usb-copy");
        assert_eq!(json["ruleName"], "USB bulk copy");
        assert_eq!(json["severity"], "HIGH");
        assert_eq!(json["userId"], "alice");
        assert!(json["userIp"].is_null());
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn alert_display() {
        let display = sample_alert().to_string();
        assert!(display.contains("HIGH"));
        assert!(display.contains("usb-copy"));
        assert!(display.contains("alice"));
    }
}
