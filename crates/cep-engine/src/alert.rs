//! 알림 생성 -- 매칭된 규칙과 이벤트로 [`Alert`]를 만듭니다.
//!
//! 중복 제거나 속도 제한은 하지 않습니다. 같은 이벤트가 반복되면 알림도 반복됩니다.

use chrono::{DateTime, Utc};
use vigil_core::types::Alert;

use crate::normalizer::NormalizedEvent;
use crate::rule::CompiledRule;

/// 알림 ID 접두사
const ALERT_ID_PREFIX: &str = "alert-";
/// UUID에서 가져올 문자 수
const ALERT_ID_UUID_CHARS: usize = 12;

/// 알림 팩토리
#[derive(Debug, Default)]
pub struct AlertFactory {
    /// 생성한 총 알림 수
    total_built: u64,
}

impl AlertFactory {
    /// 새 팩토리를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 현재 시각으로 알림을 생성합니다.
    pub fn build(&mut self, rule: &CompiledRule, event: &NormalizedEvent) -> Alert {
        self.build_at(rule, event, Utc::now())
    }

    /// 주어진 시각으로 알림을 생성합니다.
    pub fn build_at(
        &mut self,
        rule: &CompiledRule,
        event: &NormalizedEvent,
        now: DateTime<Utc>,
    ) -> Alert {
        self.total_built += 1;
        Alert {
            alert_id: new_alert_id(),
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            severity: rule.severity,
            description: rule.description.clone(),
            user_id: event.user_id.clone(),
            hostname: event.hostname.clone(),
            user_ip: event.user_ip.clone(),
            timestamp: now,
        }
    }

    /// 생성한 총 알림 수
    pub fn total_built(&self) -> u64 {
        self.total_built
    }
}

/// `alert-` + v4 UUID 앞 12자리
pub fn new_alert_id() -> String {
    let uuid = uuid::Uuid::new_v4().to_string();
    let mut id = String::with_capacity(ALERT_ID_PREFIX.len() + ALERT_ID_UUID_CHARS);
    id.push_str(ALERT_ID_PREFIX);
    id.push_str(&uuid[..ALERT_ID_UUID_CHARS]);
    id
}
