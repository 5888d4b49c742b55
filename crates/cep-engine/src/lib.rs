#![doc = include_str!("../README.md")]

pub mod alert;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod normalizer;
pub mod registry;
pub mod sink;
pub mod store;

pub mod rule;

// --- 주요 타입 re-export ---

// 엔진
pub use engine::{CepEngine, CepEngineBuilder};

// 설정
pub use config::{EngineConfig, EngineConfigBuilder};

// 에러
pub use error::CepError;

// 정규화
pub use normalizer::{NormalizedEvent, Normalizer, RawRecord};

// 규칙
pub use rule::{
    CompiledRule, ConditionNode, RuleDefinition, RuleUpdate, UpdateAction, compile_predicate,
    compile_rule,
};

// 레지스트리
pub use registry::{ApplyOutcome, RegistryChange, RegistrySnapshot, RuleRegistry};

// 디스패처
pub use dispatcher::{Dispatcher, DispatcherStats, ReplicaReport, ReplicaState};

// 저장소
pub use store::{DirectoryRuleStore, InMemoryRuleStore, RuleStore};

// 싱크
pub use sink::{AlertSink, EventOutput, EventSink, NoopEventSink};

// 알림
pub use alert::AlertFactory;
