//! 탐지 규칙 -- SQL 조건식 컴파일 및 평가
//!
//! 규칙은 SQL `WHERE` 절의 부분집합으로 작성된 불리언 조건식입니다.
//!
//! # 규칙 예시
//! ```yaml
//! id: after-hours-print
//! name: 야간 대량 출력
//! severity: HIGH
//! sql: SELECT * FROM events WHERE action = 'PRINT' AND PageCount >= 100 AND (hour < 7 OR hour >= 22)
//! ```
//!
//! # 아키텍처
//! - [`lexer`]: 조건식 토크나이저
//! - [`compiler`]: 재귀 하강 파서, [`ConditionNode`] 트리 생성
//! - [`condition`]: 조건 트리 변형과 LIKE 패턴
//! - [`evaluator`]: 트리를 이벤트에 대해 평가
//! - [`types`]: 규칙 정의, 컴파일된 규칙, 업데이트 알림

pub mod compiler;
pub mod condition;
pub mod evaluator;
pub mod lexer;
pub mod types;

pub use compiler::{MAX_NESTING_DEPTH, MAX_PREDICATE_BYTES, compile_predicate, compile_rule};
pub use condition::{CompareOp, ConditionNode, LikePattern, Literal};
pub use evaluator::matches;
pub use types::{CompiledRule, RuleDefinition, RuleUpdate, UpdateAction};

impl CompiledRule {
    /// 규칙이 활성화되어 있고 조건이 이벤트에 매칭되는지 평가합니다.
    pub fn evaluate(&self, event: &crate::normalizer::NormalizedEvent) -> bool {
        self.enabled && matches(&self.condition, event)
    }
}
