//! 레플리카 디스패처 -- 이벤트 평가와 규칙 업데이트를 한 태스크에서 직렬화합니다.
//!
//! 디스패처 하나가 엔진 레플리카 하나입니다. 자신의 레지스트리를 소유하며
//! 다른 레플리카와 상태를 공유하지 않습니다.
//!
//! # 처리 순서
//! `run` 루프는 `biased` select로 취소, 규칙 업데이트, 조회 결과, 이벤트 순서로
//! 채널을 확인합니다. 이미 도착한 업데이트는 다음 이벤트보다 먼저 적용됩니다.
//! 삭제는 즉시 적용되고, upsert는 [`RuleFetcher`]에 조회를 맡긴 뒤
//! 결과가 돌아오는 시점에 적용됩니다.
//!
//! # 부트스트랩
//! 레지스트리는 첫 이벤트가 도착할 때 저장소 전체 조회로 채워집니다.
//! 그 전에 도착한 변경은 보류했다가 부트스트랩 직후 순번대로 재적용합니다.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_core::metrics as m;
use vigil_core::types::Alert;

use crate::alert::AlertFactory;
use crate::config::EngineConfig;
use crate::error::CepError;
use crate::fetcher::{self, FetchOutcome, FetchPolicy, FetchRequest, RuleFetcher};
use crate::normalizer::{NormalizedEvent, Normalizer, RawRecord};
use crate::registry::{ApplyOutcome, RegistryChange, RegistrySnapshot, RuleRegistry};
use crate::rule::{RuleUpdate, UpdateAction, compile_rule};
use crate::sink::{AlertSink, EventSink};
use crate::store::RuleStore;

/// 레플리카 레지스트리 상태
#[derive(Debug)]
pub enum ReplicaState {
    /// 부트스트랩 전. 도착한 변경을 보류합니다.
    Uninitialized {
        /// 보류 중인 변경 (도착 순서)
        pending: Vec<RegistryChange>,
    },
    /// 부트스트랩 완료
    Ready(RuleRegistry),
}

/// 디스패처 처리 통계
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// 평가한 이벤트 수
    pub events_processed: u64,
    /// 정규화에 실패해 버린 레코드 수
    pub records_dropped: u64,
    /// 싱크에 전달된 알림 수
    pub alerts_emitted: u64,
    /// 레지스트리에 적용된 변경 수
    pub updates_applied: u64,
    /// 더 최신 버전 때문에 버려진 변경 수
    pub stale_updates: u64,
    /// 컴파일 실패 수
    pub compile_failures: u64,
    /// 저장소 조회 실패 수 (없는 규칙 포함)
    pub fetch_failures: u64,
    /// 싱크 발행 실패 수
    pub sink_failures: u64,
}

impl DispatcherStats {
    /// 다른 레플리카의 통계를 더합니다.
    pub fn merge(&mut self, other: &Self) {
        self.events_processed += other.events_processed;
        self.records_dropped += other.records_dropped;
        self.alerts_emitted += other.alerts_emitted;
        self.updates_applied += other.updates_applied;
        self.stale_updates += other.stale_updates;
        self.compile_failures += other.compile_failures;
        self.fetch_failures += other.fetch_failures;
        self.sink_failures += other.sink_failures;
    }
}

/// 레플리카 종료 보고
#[derive(Debug, Clone)]
pub struct ReplicaReport {
    /// 레플리카 번호
    pub replica: usize,
    /// 누적 통계
    pub stats: DispatcherStats,
    /// 종료 시점 레지스트리 (부트스트랩 전이면 `None`)
    pub snapshot: Option<RegistrySnapshot>,
}

/// 레플리카 디스패처
pub struct Dispatcher<S, A, E> {
    replica: usize,
    replica_label: String,
    store: Arc<S>,
    policy: FetchPolicy,
    normalizer: Normalizer,
    state: ReplicaState,
    next_seq: u64,
    alerts: AlertFactory,
    alert_sink: A,
    event_sink: E,
    fetch_tx: mpsc::UnboundedSender<FetchRequest>,
    outcomes: mpsc::Receiver<FetchOutcome>,
    stats: DispatcherStats,
}

impl<S, A, E> Dispatcher<S, A, E>
where
    S: RuleStore,
    A: AlertSink,
    E: EventSink,
{
    /// 디스패처와 짝이 되는 조회 워커를 함께 생성합니다.
    ///
    /// 반환된 [`RuleFetcher`]는 호출자가 별도 태스크로 실행해야 합니다.
    pub fn new(
        replica: usize,
        config: &EngineConfig,
        store: Arc<S>,
        alert_sink: A,
        event_sink: E,
    ) -> Result<(Self, RuleFetcher<S>), CepError> {
        config.validate()?;
        let normalizer = Normalizer::new(config.utc_offset_secs)?;
        let policy = FetchPolicy::from_config(config);
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcomes) = mpsc::channel(config.channel_capacity);

        let fetcher = RuleFetcher::new(Arc::clone(&store), policy, fetch_rx, outcome_tx);
        let dispatcher = Self {
            replica,
            replica_label: replica.to_string(),
            store,
            policy,
            normalizer,
            state: ReplicaState::Uninitialized {
                pending: Vec::new(),
            },
            next_seq: 0,
            alerts: AlertFactory::new(),
            alert_sink,
            event_sink,
            fetch_tx,
            outcomes,
            stats: DispatcherStats::default(),
        };
        Ok((dispatcher, fetcher))
    }

    /// 스냅샷에서 레지스트리를 복원해 부트스트랩을 건너뜁니다.
    ///
    /// 이후 업데이트 순번은 스냅샷의 `last_seq` 다음부터 이어집니다.
    /// 다시 컴파일하지 못한 규칙의 에러 목록을 반환합니다.
    pub fn restore(&mut self, snapshot: RegistrySnapshot) -> Vec<(String, CepError)> {
        let (registry, failures) = RuleRegistry::restore_from_snapshot(snapshot);
        for (rule_id, err) in &failures {
            warn!(replica = self.replica, rule_id = %rule_id, error = %err, "dropping rule from snapshot");
        }
        self.next_seq = registry.last_seq();
        self.stats.compile_failures += failures.len() as u64;
        self.set_ready(registry);
        failures
    }

    /// 레플리카 번호
    pub fn replica(&self) -> usize {
        self.replica
    }

    /// 현재 레지스트리 상태
    pub fn state(&self) -> &ReplicaState {
        &self.state
    }

    /// 부트스트랩이 끝났으면 레지스트리를 반환합니다.
    pub fn registry(&self) -> Option<&RuleRegistry> {
        match &self.state {
            ReplicaState::Ready(registry) => Some(registry),
            ReplicaState::Uninitialized { .. } => None,
        }
    }

    /// 현재 레지스트리 스냅샷 (부트스트랩 전이면 `None`)
    pub fn snapshot(&self) -> Option<RegistrySnapshot> {
        self.registry().map(RuleRegistry::snapshot)
    }

    /// 처리 통계
    pub fn stats(&self) -> DispatcherStats {
        self.stats
    }

    /// 취소되거나 레코드 채널이 닫힐 때까지 실행합니다.
    ///
    /// 종료 시 누적 통계와 마지막 레지스트리 스냅샷을 반환합니다.
    pub async fn run(
        mut self,
        mut records: mpsc::Receiver<RawRecord>,
        mut updates: mpsc::Receiver<RuleUpdate>,
        cancel: CancellationToken,
    ) -> ReplicaReport {
        info!(replica = self.replica, "dispatcher started");
        let mut updates_open = true;
        let mut outcomes_open = true;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!(replica = self.replica, "dispatcher cancelled");
                    break;
                }

                update = updates.recv(), if updates_open => {
                    match update {
                        Some(update) => self.handle_update(update),
                        None => {
                            debug!(replica = self.replica, "update channel closed");
                            updates_open = false;
                        }
                    }
                }

                outcome = self.outcomes.recv(), if outcomes_open => {
                    match outcome {
                        Some(outcome) => self.handle_fetch_outcome(outcome),
                        None => {
                            debug!(replica = self.replica, "fetch outcome channel closed");
                            outcomes_open = false;
                        }
                    }
                }

                record = records.recv() => {
                    match record {
                        Some(record) => {
                            self.process_record(&record).await;
                        }
                        None => {
                            info!(replica = self.replica, "record channel closed, shutting down dispatcher");
                            break;
                        }
                    }
                }
            }
        }

        info!(
            replica = self.replica,
            events = self.stats.events_processed,
            alerts = self.stats.alerts_emitted,
            "dispatcher stopped"
        );
        ReplicaReport {
            replica: self.replica,
            stats: self.stats,
            snapshot: self.snapshot(),
        }
    }

    /// 규칙 업데이트 알림을 처리합니다.
    ///
    /// 알림마다 다음 순번을 부여합니다. 삭제는 즉시 적용하고,
    /// upsert는 조회 워커에 요청합니다.
    pub fn handle_update(&mut self, update: RuleUpdate) {
        self.next_seq += 1;
        let seq = self.next_seq;

        match update.action {
            UpdateAction::Delete => {
                self.apply_change(RegistryChange::Delete {
                    seq,
                    rule_id: update.rule_id,
                });
            }
            UpdateAction::Upsert => {
                debug!(replica = self.replica, rule_id = %update.rule_id, seq, "requesting rule fetch");
                let request = FetchRequest {
                    seq,
                    rule_id: update.rule_id,
                };
                if let Err(e) = self.fetch_tx.send(request) {
                    warn!(
                        replica = self.replica,
                        rule_id = %e.0.rule_id,
                        "rule fetcher is not running, dropping upsert"
                    );
                    self.record_fetch_failure();
                }
            }
        }
    }

    /// 조회 결과가 도착할 때까지 기다렸다가 적용합니다.
    ///
    /// 조회 워커가 종료되어 더 이상 결과가 없으면 `false`를 반환합니다.
    pub async fn apply_next_fetch_outcome(&mut self) -> bool {
        match self.outcomes.recv().await {
            Some(outcome) => {
                self.handle_fetch_outcome(outcome);
                true
            }
            None => false,
        }
    }

    /// 조회 결과를 레지스트리 변경으로 바꿔 적용합니다.
    ///
    /// 컴파일 실패나 조회 실패는 해당 규칙의 이전 버전을 그대로 둡니다.
    pub fn handle_fetch_outcome(&mut self, outcome: FetchOutcome) {
        let FetchOutcome {
            seq,
            rule_id,
            result,
        } = outcome;

        match result {
            Ok(Some(definition)) => match compile_rule(&rule_id, &definition) {
                Ok(rule) => self.apply_change(RegistryChange::Upsert { seq, rule }),
                Err(e) => {
                    warn!(
                        replica = self.replica,
                        rule_id = %rule_id,
                        seq,
                        error = %e,
                        "rule failed to compile, keeping previous version"
                    );
                    self.stats.compile_failures += 1;
                    metrics::counter!(m::CEP_RULE_COMPILE_FAILURES_TOTAL).increment(1);
                }
            },
            Ok(None) => {
                warn!(
                    replica = self.replica,
                    rule_id = %rule_id,
                    seq,
                    "upserted rule not found in store, keeping previous version"
                );
                self.record_fetch_failure();
            }
            Err(e) => {
                warn!(
                    replica = self.replica,
                    rule_id = %rule_id,
                    seq,
                    error = %e,
                    "rule fetch failed, keeping previous version"
                );
                self.record_fetch_failure();
            }
        }
    }

    /// 원시 레코드를 정규화해 평가합니다.
    ///
    /// 디코딩할 수 없는 레코드는 버리고 빈 목록을 반환합니다.
    pub async fn process_record(&mut self, record: &RawRecord) -> Vec<Alert> {
        match self.normalizer.normalize(record) {
            Some(event) => self.process_event(&event).await,
            None => {
                self.stats.records_dropped += 1;
                metrics::counter!(m::CEP_RECORDS_DROPPED_TOTAL).increment(1);
                Vec::new()
            }
        }
    }

    /// 정규화된 이벤트를 모든 활성 규칙에 대해 평가하고 알림을 발행합니다.
    ///
    /// 레지스트리가 아직 비어 있으면 먼저 부트스트랩합니다.
    /// 일치한 규칙마다 만든 알림의 복사본을 반환합니다. 알림 싱크는 자리가 날 때까지
    /// 기다리며, 전달에 성공한 알림만 `alerts_emitted`에 집계됩니다.
    pub async fn process_event(&mut self, event: &NormalizedEvent) -> Vec<Alert> {
        if let Err(e) = self.event_sink.publish(event) {
            debug!(replica = self.replica, error = %e, "event sink publish failed");
            self.record_sink_failure();
        }

        self.ensure_ready().await;
        let ReplicaState::Ready(registry) = &self.state else {
            return Vec::new();
        };

        let started = Instant::now();
        let matched: Vec<_> = registry
            .enabled_rules()
            .filter(|rule| rule.evaluate(event))
            .cloned()
            .collect();
        metrics::histogram!(m::CEP_EVALUATION_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        self.stats.events_processed += 1;
        metrics::counter!(m::CEP_EVENTS_PROCESSED_TOTAL).increment(1);

        let mut emitted = Vec::with_capacity(matched.len());
        for rule in matched {
            let alert = self.alerts.build(&rule, event);
            debug!(
                replica = self.replica,
                rule_id = %rule.id,
                alert_id = %alert.alert_id,
                "rule matched"
            );
            match self.alert_sink.publish(alert.clone()).await {
                Ok(()) => {
                    self.stats.alerts_emitted += 1;
                    metrics::counter!(m::CEP_ALERTS_EMITTED_TOTAL, m::LABEL_SEVERITY => alert.severity.as_str())
                        .increment(1);
                }
                Err(e) => {
                    warn!(
                        replica = self.replica,
                        rule_id = %rule.id,
                        error = %e,
                        "failed to publish alert"
                    );
                    self.stats.sink_failures += 1;
                    metrics::counter!(m::CEP_SINK_FAILURES_TOTAL).increment(1);
                }
            }
            emitted.push(alert);
        }
        emitted
    }

    async fn ensure_ready(&mut self) {
        let ReplicaState::Uninitialized { pending } = &mut self.state else {
            return;
        };
        let pending = std::mem::take(pending);
        let registry = self.bootstrap(pending).await;
        self.set_ready(registry);
    }

    async fn bootstrap(&mut self, pending: Vec<RegistryChange>) -> RuleRegistry {
        let definitions = match fetcher::fetch_all(self.store.as_ref(), &self.policy).await {
            Ok(definitions) => definitions,
            Err(e) => {
                warn!(
                    replica = self.replica,
                    error = %e,
                    "rule bootstrap failed, starting with an empty rule set"
                );
                self.record_fetch_failure();
                Vec::new()
            }
        };

        let mut compiled = Vec::with_capacity(definitions.len());
        for (rule_id, definition) in definitions {
            match compile_rule(&rule_id, &definition) {
                Ok(rule) => compiled.push(rule),
                Err(e) => {
                    warn!(replica = self.replica, rule_id = %rule_id, error = %e, "skipping rule that failed to compile");
                    self.stats.compile_failures += 1;
                    metrics::counter!(m::CEP_RULE_COMPILE_FAILURES_TOTAL).increment(1);
                }
            }
        }

        let mut registry = RuleRegistry::from_rules(compiled);
        let replayed = pending.len();
        for change in pending {
            match registry.apply(change) {
                ApplyOutcome::Applied => self.stats.updates_applied += 1,
                ApplyOutcome::Stale => self.stats.stale_updates += 1,
            }
        }

        info!(
            replica = self.replica,
            rules = registry.len(),
            replayed,
            "rule registry bootstrapped"
        );
        registry
    }

    fn set_ready(&mut self, registry: RuleRegistry) {
        metrics::gauge!(m::CEP_ACTIVE_RULES, m::LABEL_REPLICA => self.replica_label.clone())
            .set(registry.len() as f64);
        self.state = ReplicaState::Ready(registry);
    }

    fn apply_change(&mut self, change: RegistryChange) {
        let action = match &change {
            RegistryChange::Upsert { .. } => "upsert",
            RegistryChange::Delete { .. } => "delete",
        };

        match &mut self.state {
            ReplicaState::Uninitialized { pending } => {
                debug!(
                    replica = self.replica,
                    rule_id = %change.rule_id(),
                    seq = change.seq(),
                    "registry not bootstrapped, deferring change"
                );
                pending.push(change);
            }
            ReplicaState::Ready(registry) => {
                let rule_id = change.rule_id().to_owned();
                let seq = change.seq();
                match registry.apply(change) {
                    ApplyOutcome::Applied => {
                        info!(replica = self.replica, rule_id = %rule_id, seq, action, "rule update applied");
                        self.stats.updates_applied += 1;
                        metrics::counter!(m::CEP_RULE_UPDATES_APPLIED_TOTAL, m::LABEL_ACTION => action)
                            .increment(1);
                        metrics::gauge!(m::CEP_ACTIVE_RULES, m::LABEL_REPLICA => self.replica_label.clone())
                            .set(registry.len() as f64);
                    }
                    ApplyOutcome::Stale => {
                        debug!(replica = self.replica, rule_id = %rule_id, seq, action, "stale rule update ignored");
                        self.stats.stale_updates += 1;
                    }
                }
            }
        }
    }

    fn record_fetch_failure(&mut self) {
        self.stats.fetch_failures += 1;
        metrics::counter!(m::CEP_RULE_FETCH_FAILURES_TOTAL).increment(1);
    }

    fn record_sink_failure(&mut self) {
        self.stats.sink_failures += 1;
        metrics::counter!(m::CEP_SINK_FAILURES_TOTAL).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::RuleDefinition;
    use crate::sink::NoopEventSink;
    use crate::store::InMemoryRuleStore;
    use serde_json::json;
    use std::sync::Mutex;
    use vigil_core::types::Severity;

    /// 발행된 알림을 기록하는 싱크
    #[derive(Clone, Default)]
    struct RecordingSink {
        alerts: Arc<Mutex<Vec<Alert>>>,
    }

    impl RecordingSink {
        fn rule_ids(&self) -> Vec<String> {
            self.alerts
                .lock()
                .unwrap()
                .iter()
                .map(|a| a.rule_id.clone())
                .collect()
        }
    }

    impl AlertSink for RecordingSink {
        async fn publish(&self, alert: Alert) -> Result<(), CepError> {
            self.alerts.lock().unwrap().push(alert);
            Ok(())
        }
    }

    /// 항상 실패하는 싱크
    struct FailingSink;

    impl AlertSink for FailingSink {
        async fn publish(&self, _alert: Alert) -> Result<(), CepError> {
            Err(CepError::Sink {
                sink: "alert".to_owned(),
                reason: "closed".to_owned(),
            })
        }
    }

    /// 항상 실패하는 저장소
    struct BrokenStore;

    impl RuleStore for BrokenStore {
        async fn fetch_all(&self) -> Result<Vec<(String, RuleDefinition)>, CepError> {
            Err(CepError::fetch("*", "connection refused"))
        }

        async fn fetch_by_id(&self, rule_id: &str) -> Result<Option<RuleDefinition>, CepError> {
            Err(CepError::fetch(rule_id, "connection refused"))
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            fetch_retries: 0,
            fetch_retry_backoff_ms: 1,
            ..EngineConfig::default()
        }
    }

    fn record(value: serde_json::Value) -> RawRecord {
        RawRecord::new(value.to_string(), "test")
    }

    fn store_with(rules: &[(&str, &str)]) -> InMemoryRuleStore {
        InMemoryRuleStore::with_rules(rules.iter().map(|(id, sql)| {
            (
                (*id).to_owned(),
                RuleDefinition::new(*sql).with_severity(Severity::High),
            )
        }))
    }

    fn dispatcher_for(
        store: InMemoryRuleStore,
    ) -> (
        Dispatcher<InMemoryRuleStore, RecordingSink, NoopEventSink>,
        RecordingSink,
        CancellationToken,
    ) {
        let sink = RecordingSink::default();
        let (dispatcher, fetcher) =
            Dispatcher::new(0, &test_config(), Arc::new(store), sink.clone(), NoopEventSink)
                .unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(fetcher.run(cancel.clone()));
        (dispatcher, sink, cancel)
    }

    #[tokio::test]
    async fn bootstraps_on_first_event() {
        let (mut dispatcher, sink, _cancel) =
            dispatcher_for(store_with(&[("R", "userId = 'alice'")]));
        assert!(dispatcher.registry().is_none());

        let alerts = dispatcher
            .process_record(&record(json!({"msgId": "1", "cefExtensions": {"suid": "alice"}})))
            .await;

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule_id, "R");
        assert_eq!(dispatcher.registry().unwrap().len(), 1);
        assert_eq!(sink.rule_ids(), vec!["R".to_owned()]);
        assert_eq!(dispatcher.stats().events_processed, 1);
    }

    #[tokio::test]
    async fn delete_applies_before_next_event() {
        let (mut dispatcher, sink, _cancel) =
            dispatcher_for(store_with(&[("R", "userId = 'alice'")]));
        let event = record(json!({"msgId": "1", "cefExtensions": {"suid": "alice"}}));

        assert_eq!(dispatcher.process_record(&event).await.len(), 1);
        dispatcher.handle_update(RuleUpdate::delete("R"));
        assert!(dispatcher.process_record(&event).await.is_empty());
        assert_eq!(sink.rule_ids().len(), 1);
    }

    #[tokio::test]
    async fn upsert_replaces_rule_after_fetch() {
        let store = store_with(&[("R", "userId = 'alice'")]);
        let (mut dispatcher, _sink, _cancel) = dispatcher_for(store.clone());
        let bob = record(json!({"msgId": "1", "cefExtensions": {"suid": "bob"}}));

        assert!(dispatcher.process_record(&bob).await.is_empty());

        store
            .put("R", RuleDefinition::new("userId = 'bob'"))
            .await;
        dispatcher.handle_update(RuleUpdate::upsert("R"));
        assert!(dispatcher.apply_next_fetch_outcome().await);

        let alerts = dispatcher.process_record(&bob).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(dispatcher.registry().unwrap().version("R"), Some(1));
    }

    #[tokio::test]
    async fn malformed_upsert_keeps_previous_version() {
        let store = store_with(&[("R", "userId = 'alice'")]);
        let (mut dispatcher, _sink, _cancel) = dispatcher_for(store.clone());
        let alice = record(json!({"msgId": "1", "cefExtensions": {"suid": "alice"}}));
        assert_eq!(dispatcher.process_record(&alice).await.len(), 1);

        store.put("R", RuleDefinition::new("userId = ")).await;
        dispatcher.handle_update(RuleUpdate::upsert("R"));
        assert!(dispatcher.apply_next_fetch_outcome().await);

        assert_eq!(dispatcher.process_record(&alice).await.len(), 1);
        assert_eq!(dispatcher.stats().compile_failures, 1);
    }

    #[tokio::test]
    async fn missing_upsert_keeps_previous_version() {
        let store = store_with(&[("R", "userId = 'alice'")]);
        let (mut dispatcher, _sink, _cancel) = dispatcher_for(store.clone());
        let alice = record(json!({"msgId": "1", "cefExtensions": {"suid": "alice"}}));
        assert_eq!(dispatcher.process_record(&alice).await.len(), 1);

        store.remove("R").await;
        dispatcher.handle_update(RuleUpdate::upsert("R"));
        assert!(dispatcher.apply_next_fetch_outcome().await);

        assert_eq!(dispatcher.process_record(&alice).await.len(), 1);
        assert_eq!(dispatcher.stats().fetch_failures, 1);
    }

    #[tokio::test]
    async fn stale_upsert_does_not_resurrect_deleted_rule() {
        let store = store_with(&[("R", "userId = 'alice'")]);
        let (mut dispatcher, _sink, _cancel) = dispatcher_for(store);
        let alice = record(json!({"msgId": "1", "cefExtensions": {"suid": "alice"}}));
        assert_eq!(dispatcher.process_record(&alice).await.len(), 1);

        // upsert(seq 1) 조회가 끝나기 전에 delete(seq 2)가 적용됨
        dispatcher.handle_update(RuleUpdate::upsert("R"));
        dispatcher.handle_update(RuleUpdate::delete("R"));
        assert!(dispatcher.apply_next_fetch_outcome().await);

        assert!(dispatcher.process_record(&alice).await.is_empty());
        let stats = dispatcher.stats();
        assert_eq!(stats.updates_applied, 1);
        assert_eq!(stats.stale_updates, 1);
    }

    #[tokio::test]
    async fn changes_before_bootstrap_are_replayed() {
        let (mut dispatcher, _sink, _cancel) = dispatcher_for(store_with(&[
            ("A", "userId = 'alice'"),
            ("B", "userId = 'alice'"),
        ]));

        dispatcher.handle_update(RuleUpdate::delete("A"));
        assert!(matches!(
            dispatcher.state(),
            ReplicaState::Uninitialized { pending } if pending.len() == 1
        ));

        let alerts = dispatcher
            .process_record(&record(json!({"msgId": "1", "cefExtensions": {"suid": "alice"}})))
            .await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule_id, "B");
    }

    #[tokio::test]
    async fn undecodable_record_is_dropped() {
        let (mut dispatcher, sink, _cancel) =
            dispatcher_for(store_with(&[("R", "userId = 'alice'")]));

        let alerts = dispatcher
            .process_record(&RawRecord::new("not json", "test"))
            .await;

        assert!(alerts.is_empty());
        assert_eq!(dispatcher.stats().records_dropped, 1);
        assert!(dispatcher.registry().is_none());
        assert!(sink.rule_ids().is_empty());
    }

    #[tokio::test]
    async fn disabled_rule_never_fires() {
        let store = InMemoryRuleStore::with_rules([(
            "R".to_owned(),
            RuleDefinition::new("userId = 'alice'").with_enabled(false),
        )]);
        let (mut dispatcher, _sink, _cancel) = dispatcher_for(store);

        let alerts = dispatcher
            .process_record(&record(json!({"msgId": "1", "cefExtensions": {"suid": "alice"}})))
            .await;
        assert!(alerts.is_empty());
    }

    #[tokio::test]
    async fn broken_store_bootstraps_empty() {
        let (mut dispatcher, fetcher) = Dispatcher::new(
            0,
            &test_config(),
            Arc::new(BrokenStore),
            RecordingSink::default(),
            NoopEventSink,
        )
        .unwrap();
        drop(fetcher);

        let alerts = dispatcher
            .process_record(&record(json!({"msgId": "1"})))
            .await;

        assert!(alerts.is_empty());
        assert!(dispatcher.registry().unwrap().is_empty());
        assert_eq!(dispatcher.stats().fetch_failures, 1);
    }

    #[tokio::test]
    async fn upsert_without_fetcher_is_counted() {
        let (mut dispatcher, fetcher) = Dispatcher::new(
            0,
            &test_config(),
            Arc::new(InMemoryRuleStore::new()),
            RecordingSink::default(),
            NoopEventSink,
        )
        .unwrap();
        drop(fetcher);

        dispatcher.handle_update(RuleUpdate::upsert("R"));
        assert_eq!(dispatcher.stats().fetch_failures, 1);
        assert!(!dispatcher.apply_next_fetch_outcome().await);
    }

    #[tokio::test]
    async fn sink_failure_still_returns_alert() {
        let (mut dispatcher, fetcher) = Dispatcher::new(
            0,
            &test_config(),
            Arc::new(store_with(&[("R", "userId = 'alice'")])),
            FailingSink,
            NoopEventSink,
        )
        .unwrap();
        drop(fetcher);

        let alerts = dispatcher
            .process_record(&record(json!({"msgId": "1", "cefExtensions": {"suid": "alice"}})))
            .await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(dispatcher.stats().alerts_emitted, 0);
        assert_eq!(dispatcher.stats().sink_failures, 1);
    }

    #[tokio::test]
    async fn restore_skips_bootstrap_and_continues_sequence() {
        let (mut source, _sink, _cancel) =
            dispatcher_for(store_with(&[("R", "userId = 'alice'")]));
        source
            .process_record(&record(json!({"msgId": "1"})))
            .await;
        source.handle_update(RuleUpdate::delete("GONE"));
        let snapshot = source.snapshot().unwrap();
        assert_eq!(snapshot.last_seq, 1);

        let (mut restored, _sink, _cancel) = dispatcher_for(InMemoryRuleStore::new());
        assert!(restored.restore(snapshot).is_empty());
        assert_eq!(restored.registry().unwrap().len(), 1);

        let alerts = restored
            .process_record(&record(json!({"msgId": "2", "cefExtensions": {"suid": "alice"}})))
            .await;
        assert_eq!(alerts.len(), 1);

        restored.handle_update(RuleUpdate::delete("R"));
        assert_eq!(restored.registry().unwrap().version("R"), Some(2));
    }

    #[tokio::test]
    async fn run_processes_updates_before_queued_records() {
        let sink = RecordingSink::default();
        let (dispatcher, fetcher) = Dispatcher::new(
            0,
            &test_config(),
            Arc::new(store_with(&[("R", "userId = 'alice'")])),
            sink.clone(),
            NoopEventSink,
        )
        .unwrap();
        let (record_tx, record_rx) = mpsc::channel(8);
        let (update_tx, update_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        tokio::spawn(fetcher.run(cancel.clone()));

        update_tx.send(RuleUpdate::delete("R")).await.unwrap();
        record_tx
            .send(record(json!({"msgId": "1", "cefExtensions": {"suid": "alice"}})))
            .await
            .unwrap();
        drop(record_tx);

        let report = dispatcher.run(record_rx, update_rx, cancel).await;
        assert_eq!(report.stats.events_processed, 1);
        assert_eq!(report.stats.alerts_emitted, 0);
        assert!(sink.rule_ids().is_empty());
        let snapshot = report.snapshot.unwrap();
        assert!(snapshot.rules.is_empty());
        assert_eq!(snapshot.last_seq, 1);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let (dispatcher, _fetcher) = Dispatcher::new(
            0,
            &test_config(),
            Arc::new(InMemoryRuleStore::new()),
            RecordingSink::default(),
            NoopEventSink,
        )
        .unwrap();
        let (_record_tx, record_rx) = mpsc::channel(1);
        let (_update_tx, update_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(dispatcher.run(record_rx, update_rx, cancel.clone()));

        cancel.cancel();
        let report = tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.stats, DispatcherStats::default());
        assert!(report.snapshot.is_none());
    }

    #[test]
    fn stats_merge_adds_fields() {
        let mut total = DispatcherStats {
            events_processed: 2,
            alerts_emitted: 1,
            ..Default::default()
        };
        total.merge(&DispatcherStats {
            events_processed: 3,
            sink_failures: 4,
            ..Default::default()
        });
        assert_eq!(total.events_processed, 5);
        assert_eq!(total.alerts_emitted, 1);
        assert_eq!(total.sink_failures, 4);
    }
}
