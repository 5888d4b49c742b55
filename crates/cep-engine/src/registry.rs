//! 규칙 레지스트리 -- 레플리카별 컴파일된 규칙의 단일 원본
//!
//! 레지스트리는 `규칙 ID -> CompiledRule` 뷰와 ID별 논리 버전(마지막으로 적용된
//! 변경의 순번)을 함께 관리합니다. 삭제도 버전(툼스톤)으로 남기 때문에,
//! 뒤늦게 도착한 이전 순번의 upsert 결과가 이후에 삭제된 규칙을 되살리지 못합니다.
//!
//! 모든 레플리카는 같은 순서의 업데이트 스트림을 받으므로 같은 순번을 부여합니다.
//! 레지스트리는 [`RegistrySnapshot`]으로 직렬화하고 다시 복원할 수 있습니다.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::CepError;
use crate::rule::{CompiledRule, RuleDefinition, compile_rule};

/// 레지스트리에 적용할 변경
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryChange {
    /// 규칙 삽입 또는 교체
    Upsert {
        /// 업데이트 순번
        seq: u64,
        /// 컴파일된 규칙
        rule: CompiledRule,
    },
    /// 규칙 삭제
    Delete {
        /// 업데이트 순번
        seq: u64,
        /// 삭제할 규칙 ID
        rule_id: String,
    },
}

impl RegistryChange {
    /// 변경의 순번
    pub fn seq(&self) -> u64 {
        match self {
            Self::Upsert { seq, .. } | Self::Delete { seq, .. } => *seq,
        }
    }

    /// 대상 규칙 ID
    pub fn rule_id(&self) -> &str {
        match self {
            Self::Upsert { rule, .. } => &rule.id,
            Self::Delete { rule_id, .. } => rule_id,
        }
    }
}

/// 변경 적용 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// 뷰에 반영됨
    Applied,
    /// 더 최신 변경이 이미 적용되어 무시됨
    Stale,
}

/// 규칙 레지스트리
#[derive(Debug, Default, Clone)]
pub struct RuleRegistry {
    /// 현재 유효한 규칙 뷰
    view: HashMap<String, Arc<CompiledRule>>,
    /// ID별 마지막 적용 순번 (삭제된 ID 포함)
    versions: HashMap<String, u64>,
    /// 지금까지 적용된 가장 큰 순번
    last_seq: u64,
}

impl RuleRegistry {
    /// 빈 레지스트리를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 일괄 로드한 규칙으로 레지스트리를 생성합니다. 모든 규칙의 버전은 0입니다.
    pub fn from_rules(rules: impl IntoIterator<Item = CompiledRule>) -> Self {
        let mut registry = Self::new();
        for rule in rules {
            registry.versions.insert(rule.id.clone(), 0);
            registry.view.insert(rule.id.clone(), Arc::new(rule));
        }
        registry
    }

    /// 변경을 적용합니다.
    ///
    /// 같은 ID에 더 큰 순번의 변경이 이미 적용되었으면 `Stale`을 반환하고 무시합니다.
    /// 없는 규칙의 삭제도 `Applied`입니다 (멱등).
    pub fn apply(&mut self, change: RegistryChange) -> ApplyOutcome {
        let seq = change.seq();
        if let Some(&current) = self.versions.get(change.rule_id())
            && seq < current
        {
            return ApplyOutcome::Stale;
        }

        self.last_seq = self.last_seq.max(seq);
        match change {
            RegistryChange::Upsert { seq, rule } => {
                self.versions.insert(rule.id.clone(), seq);
                self.view.insert(rule.id.clone(), Arc::new(rule));
            }
            RegistryChange::Delete { seq, rule_id } => {
                self.view.remove(&rule_id);
                self.versions.insert(rule_id, seq);
            }
        }
        ApplyOutcome::Applied
    }

    /// ID로 규칙을 조회합니다.
    pub fn get(&self, rule_id: &str) -> Option<&Arc<CompiledRule>> {
        self.view.get(rule_id)
    }

    /// 규칙이 등록되어 있는지 확인합니다.
    pub fn contains(&self, rule_id: &str) -> bool {
        self.view.contains_key(rule_id)
    }

    /// ID의 마지막 적용 순번 (삭제된 ID 포함)
    pub fn version(&self, rule_id: &str) -> Option<u64> {
        self.versions.get(rule_id).copied()
    }

    /// 지금까지 적용된 가장 큰 순번
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// 등록된 규칙 수
    pub fn len(&self) -> usize {
        self.view.len()
    }

    /// 등록된 규칙이 없는지 여부
    pub fn is_empty(&self) -> bool {
        self.view.is_empty()
    }

    /// 등록된 모든 규칙 (순서 없음)
    pub fn rules(&self) -> impl Iterator<Item = &Arc<CompiledRule>> {
        self.view.values()
    }

    /// 활성화된 규칙 (순서 없음)
    pub fn enabled_rules(&self) -> impl Iterator<Item = &Arc<CompiledRule>> {
        self.view.values().filter(|r| r.enabled)
    }

    /// 현재 상태의 스냅샷을 만듭니다.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let rules = self
            .view
            .iter()
            .map(|(id, rule)| {
                let seq = self.versions.get(id).copied().unwrap_or(0);
                (
                    id.clone(),
                    SnapshotEntry {
                        seq,
                        definition: rule.to_definition(),
                    },
                )
            })
            .collect();

        let tombstones = self
            .versions
            .iter()
            .filter(|(id, _)| !self.view.contains_key(*id))
            .map(|(id, seq)| (id.clone(), *seq))
            .collect();

        RegistrySnapshot {
            last_seq: self.last_seq,
            rules,
            tombstones,
        }
    }

    /// 스냅샷에서 레지스트리를 복원합니다.
    ///
    /// 모든 정의를 다시 컴파일하며, 실패한 규칙은 제외하고 에러 목록으로 반환합니다.
    /// 제외된 규칙의 ID는 툼스톤으로 남아 이전 순번의 변경을 계속 막습니다.
    pub fn restore_from_snapshot(snapshot: RegistrySnapshot) -> (Self, Vec<(String, CepError)>) {
        let mut registry = Self {
            last_seq: snapshot.last_seq,
            versions: snapshot.tombstones.into_iter().collect(),
            ..Self::default()
        };
        let mut failures = Vec::new();

        for (id, entry) in snapshot.rules {
            registry.versions.insert(id.clone(), entry.seq);
            match compile_rule(&id, &entry.definition) {
                Ok(rule) => {
                    registry.view.insert(id, Arc::new(rule));
                }
                Err(e) => failures.push((id, e)),
            }
        }

        (registry, failures)
    }
}

/// 직렬화 가능한 레지스트리 스냅샷
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    /// 적용된 가장 큰 순번
    pub last_seq: u64,
    /// 규칙 ID -> 정의와 버전
    pub rules: BTreeMap<String, SnapshotEntry>,
    /// 삭제된 규칙 ID -> 삭제 순번
    #[serde(default)]
    pub tombstones: BTreeMap<String, u64>,
}

/// 스냅샷의 규칙 항목
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// 마지막 적용 순번
    pub seq: u64,
    /// 규칙 정의
    pub definition: RuleDefinition,
}
