//! 규칙 데이터 타입
//!
//! 저장소에 보관되는 [`RuleDefinition`], 레지스트리에 등록되는 [`CompiledRule`],
//! 브로드캐스트 채널로 전달되는 [`RuleUpdate`]를 정의합니다.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use vigil_core::types::Severity;

use super::condition::ConditionNode;
use crate::error::CepError;

/// 규칙 ID 최대 길이
const MAX_RULE_ID_LEN: usize = 256;

/// 규칙 정의 -- 규칙 저장소의 원본 표현
///
/// 부분 수정 없이 항상 통째로 교체됩니다.
///
/// # JSON 스키마
/// ```json
/// {
///   "name": "USB 대량 복사",
///   "severity": "HIGH",
///   "description": "업무 시간 외 대용량 파일 복사",
///   "enabled": true,
///   "sql": "SELECT * FROM events WHERE action = 'COPY' AND fileSize > 1000000"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    /// 규칙 이름 (비어 있으면 규칙 ID 사용)
    #[serde(default)]
    pub name: String,
    /// 심각도 (기본 MEDIUM, 알 수 없는 값도 MEDIUM)
    #[serde(default, deserialize_with = "lenient_severity")]
    pub severity: Severity,
    /// 규칙 설명
    #[serde(default)]
    pub description: String,
    /// 활성화 여부 (기본 true)
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 조건식 (`SELECT ... WHERE ...` 또는 조건식만)
    pub sql: String,
}

fn default_enabled() -> bool {
    true
}

/// 심각도는 자유 문자열로 저장되므로 알 수 없는 값은 규칙을 버리지 않고 MEDIUM으로 읽습니다.
fn lenient_severity<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Severity, D::Error> {
    let Some(raw) = Option::<String>::deserialize(deserializer)? else {
        return Ok(Severity::default());
    };
    Ok(Severity::from_str_loose(&raw).unwrap_or_else(|| {
        tracing::warn!(severity = %raw, "unknown rule severity, using MEDIUM");
        Severity::default()
    }))
}

impl RuleDefinition {
    /// 조건식만으로 기본값 정의를 생성합니다.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            severity: Severity::default(),
            description: String::new(),
            enabled: true,
            sql: sql.into(),
        }
    }

    /// 이름을 설정합니다.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// 심각도를 설정합니다.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// 활성화 여부를 설정합니다.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// 주어진 ID로 등록 가능한 정의인지 검증합니다.
    pub fn validate(&self, rule_id: &str) -> Result<(), CepError> {
        validate_rule_id(rule_id)?;

        if self.sql.trim().is_empty() {
            return Err(CepError::RuleValidation {
                rule_id: rule_id.to_owned(),
                reason: "sql must not be empty".to_owned(),
            });
        }

        Ok(())
    }
}

/// 규칙 ID 형식을 검증합니다.
pub fn validate_rule_id(rule_id: &str) -> Result<(), CepError> {
    if rule_id.trim().is_empty() {
        return Err(CepError::RuleValidation {
            rule_id: "(empty)".to_owned(),
            reason: "rule id must not be empty".to_owned(),
        });
    }

    if rule_id.len() > MAX_RULE_ID_LEN {
        return Err(CepError::RuleValidation {
            rule_id: rule_id.chars().take(32).collect(),
            reason: format!("rule id must not exceed {MAX_RULE_ID_LEN} bytes"),
        });
    }

    Ok(())
}

/// 컴파일된 규칙
///
/// 조건 트리가 없는 규칙은 존재하지 않습니다. 컴파일에 실패하면 만들어지지 않습니다.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRule {
    /// 규칙 ID
    pub id: String,
    /// 규칙 이름
    pub name: String,
    /// 심각도
    pub severity: Severity,
    /// 설명
    pub description: String,
    /// 활성화 여부
    pub enabled: bool,
    /// 원본 조건식 텍스트
    pub sql: String,
    /// 컴파일된 조건 트리
    pub condition: ConditionNode,
}

impl CompiledRule {
    /// 이 규칙을 다시 컴파일할 수 있는 정의로 되돌립니다.
    pub fn to_definition(&self) -> RuleDefinition {
        RuleDefinition {
            name: self.name.clone(),
            severity: self.severity,
            description: self.description.clone(),
            enabled: self.enabled,
            sql: self.sql.clone(),
        }
    }
}

impl fmt::Display for CompiledRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({}): {}", self.severity, self.id, self.name, self.condition)
    }
}

/// 규칙 업데이트 동작
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum UpdateAction {
    /// 삽입 또는 교체 (저장소에서 다시 조회)
    #[default]
    Upsert,
    /// 삭제
    Delete,
}

impl UpdateAction {
    /// 소문자 표기
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for UpdateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for UpdateAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for UpdateAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.trim().to_ascii_lowercase().as_str() {
            "upsert" => Ok(Self::Upsert),
            "delete" => Ok(Self::Delete),
            _ => Err(serde::de::Error::custom(format!(
                "unknown rule update action '{raw}'"
            ))),
        }
    }
}

/// 규칙 업데이트 알림
///
/// 페이로드 없이 ID와 동작만 전달합니다. upsert는 항상 저장소 재조회를 유발합니다.
///
/// ```json
/// { "ruleId": "usb-bulk-copy", "action": "delete" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleUpdate {
    /// 대상 규칙 ID
    pub rule_id: String,
    /// 동작 (기본 upsert)
    #[serde(default)]
    pub action: UpdateAction,
}

impl RuleUpdate {
    /// upsert 알림을 생성합니다.
    pub fn upsert(rule_id: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            action: UpdateAction::Upsert,
        }
    }

    /// delete 알림을 생성합니다.
    pub fn delete(rule_id: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            action: UpdateAction::Delete,
        }
    }

    /// 버스에서 받은 JSON 알림을 디코딩합니다.
    pub fn from_notification(raw: &[u8]) -> Result<Self, CepError> {
        let update: Self =
            serde_json::from_slice(raw).map_err(|e| CepError::Notification(e.to_string()))?;
        validate_rule_id(&update.rule_id)
            .map_err(|e| CepError::Notification(e.to_string()))?;
        Ok(update)
    }
}
