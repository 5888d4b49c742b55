//! 엔진 오케스트레이션 -- 레플리카 디스패처와 조회 워커의 생명주기를 관리합니다.
//!
//! [`CepEngine`]은 core의 [`Pipeline`] trait을 구현하여
//! 다른 모듈과 동일한 생명주기(start/stop/health_check)로 관리됩니다.
//!
//! # 내부 아키텍처
//! ```text
//!                      +-> records[0] -> Dispatcher[0] <-> RuleFetcher[0]
//! submit (round-robin) +-> records[1] -> Dispatcher[1] <-> RuleFetcher[1]   -> alerts mpsc
//!                      +-> ...
//! broadcast_update ------> updates[i] (모든 레플리카, 같은 순서)
//! ```
//!
//! 레코드 하나는 정확히 한 레플리카가 평가합니다. 규칙 업데이트는 모든 레플리카에
//! 같은 순서로 전달되므로 각 레플리카는 독립적으로 같은 레지스트리 상태에 수렴합니다.
//! 동시에 호출된 `broadcast_update`는 `update_lock`으로 직렬화되어 서로의 전달 사이에
//! 끼어들지 않습니다.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use vigil_core::error::{PipelineError, VigilError};
use vigil_core::pipeline::{HealthStatus, Pipeline};
use vigil_core::types::Alert;

use crate::config::EngineConfig;
use crate::dispatcher::{Dispatcher, DispatcherStats, ReplicaReport};
use crate::error::CepError;
use crate::normalizer::{NormalizedEvent, RawRecord};
use crate::registry::RegistrySnapshot;
use crate::rule::RuleUpdate;
use crate::sink::EventOutput;
use crate::store::RuleStore;

/// 엔진 실행 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    /// 초기화됨, 아직 시작하지 않음
    Initialized,
    /// 실행 중
    Running,
    /// 정지됨
    Stopped,
}

/// 레플리카 입력 채널
struct ReplicaHandle {
    records: mpsc::Sender<RawRecord>,
    updates: mpsc::Sender<RuleUpdate>,
}

/// CEP 엔진 -- 레코드를 레플리카에 분배하고 규칙 업데이트를 방송합니다.
///
/// # 사용 예시
/// ```ignore
/// use vigil_cep::{CepEngineBuilder, InMemoryRuleStore, RawRecord};
///
/// let (mut engine, alert_rx) = CepEngineBuilder::new(InMemoryRuleStore::new())
///     .config(config)
///     .build()?;
///
/// engine.start().await?;
/// engine.submit(RawRecord::new(payload, "bus")).await?;
/// ```
pub struct CepEngine<S> {
    config: EngineConfig,
    state: EngineState,
    store: Arc<S>,
    alert_tx: mpsc::Sender<Alert>,
    event_output: EventOutput,
    snapshot: Option<RegistrySnapshot>,
    replicas: Vec<ReplicaHandle>,
    dispatchers: Vec<JoinHandle<ReplicaReport>>,
    fetchers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    next_replica: AtomicUsize,
    update_lock: Mutex<()>,
    last_stats: DispatcherStats,
    last_snapshots: Vec<Option<RegistrySnapshot>>,
}

impl<S: RuleStore> CepEngine<S> {
    /// 현재 상태 이름
    pub fn state_name(&self) -> &str {
        match self.state {
            EngineState::Initialized => "initialized",
            EngineState::Running => "running",
            EngineState::Stopped => "stopped",
        }
    }

    /// 엔진 설정
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 설정된 레플리카 수
    pub fn replica_count(&self) -> usize {
        self.config.replicas
    }

    /// 마지막 정지 시점까지 모든 레플리카의 누적 통계
    pub fn stats(&self) -> DispatcherStats {
        self.last_stats
    }

    /// 마지막 정지 시점의 레플리카별 레지스트리 스냅샷 (레플리카 번호 순)
    ///
    /// 부트스트랩 전에 정지한 레플리카는 `None`입니다.
    pub fn replica_snapshots(&self) -> &[Option<RegistrySnapshot>] {
        &self.last_snapshots
    }

    /// 레코드를 다음 레플리카에 제출합니다 (라운드 로빈).
    ///
    /// 레플리카 입력 채널이 가득 차면 자리가 날 때까지 기다립니다.
    pub async fn submit(&self, record: RawRecord) -> Result<(), CepError> {
        let replicas = self.running_replicas()?;
        let index = self.next_replica.fetch_add(1, Ordering::Relaxed) % replicas.len();
        replicas[index]
            .records
            .send(record)
            .await
            .map_err(|_| CepError::Channel(format!("replica {index} record channel closed")))
    }

    /// 규칙 업데이트를 모든 레플리카에 같은 순서로 전달합니다.
    ///
    /// 한 업데이트의 전달이 끝날 때까지 다른 방송은 대기합니다.
    pub async fn broadcast_update(&self, update: RuleUpdate) -> Result<(), CepError> {
        let replicas = self.running_replicas()?;
        let _order = self.update_lock.lock().await;
        tracing::info!(
            rule_id = %update.rule_id,
            action = ?update.action,
            replicas = replicas.len(),
            "broadcasting rule update"
        );
        for (index, replica) in replicas.iter().enumerate() {
            replica.updates.send(update.clone()).await.map_err(|_| {
                CepError::Channel(format!("replica {index} update channel closed"))
            })?;
        }
        Ok(())
    }

    /// 알림 채널 페이로드를 파싱해 방송합니다.
    ///
    /// 파싱할 수 없는 페이로드는 레지스트리를 건드리지 않고 에러를 반환합니다.
    pub async fn handle_notification(&self, payload: &[u8]) -> Result<(), CepError> {
        let update = RuleUpdate::from_notification(payload).inspect_err(|e| {
            tracing::warn!(error = %e, "ignoring malformed rule notification");
        })?;
        self.broadcast_update(update).await
    }

    fn running_replicas(&self) -> Result<&[ReplicaHandle], CepError> {
        if self.state != EngineState::Running || self.replicas.is_empty() {
            return Err(CepError::Channel("engine is not running".to_owned()));
        }
        Ok(&self.replicas)
    }

    fn spawn_replica(&mut self, replica: usize) -> Result<ReplicaHandle, CepError> {
        let (mut dispatcher, fetcher) = Dispatcher::new(
            replica,
            &self.config,
            Arc::clone(&self.store),
            self.alert_tx.clone(),
            self.event_output.clone(),
        )?;
        if let Some(snapshot) = &self.snapshot {
            dispatcher.restore(snapshot.clone());
        }

        let (records_tx, records_rx) = mpsc::channel(self.config.channel_capacity);
        let (updates_tx, updates_rx) = mpsc::channel(self.config.channel_capacity);

        self.fetchers.push(tokio::spawn(fetcher.run(self.cancel.clone())));
        self.dispatchers.push(tokio::spawn(dispatcher.run(
            records_rx,
            updates_rx,
            self.cancel.clone(),
        )));

        Ok(ReplicaHandle {
            records: records_tx,
            updates: updates_tx,
        })
    }
}

impl<S: RuleStore> Pipeline for CepEngine<S> {
    async fn start(&mut self) -> Result<(), VigilError> {
        if self.state == EngineState::Running {
            return Err(PipelineError::AlreadyRunning.into());
        }

        tracing::info!(replicas = self.config.replicas, "starting cep engine");

        self.cancel = CancellationToken::new();
        let mut replicas = Vec::with_capacity(self.config.replicas);
        for replica in 0..self.config.replicas {
            match self.spawn_replica(replica) {
                Ok(handle) => replicas.push(handle),
                Err(e) => {
                    self.cancel.cancel();
                    self.dispatchers.clear();
                    self.fetchers.clear();
                    return Err(e.into());
                }
            }
        }
        self.replicas = replicas;
        self.next_replica.store(0, Ordering::Relaxed);

        self.state = EngineState::Running;
        tracing::info!("cep engine started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), VigilError> {
        if self.state != EngineState::Running {
            return Err(PipelineError::NotRunning.into());
        }

        tracing::info!("stopping cep engine");

        // 입력 채널을 닫아 디스패처가 남은 레코드를 처리한 뒤 종료하게 함
        self.replicas.clear();

        let mut stats = DispatcherStats::default();
        let mut snapshots = Vec::with_capacity(self.dispatchers.len());
        for (replica, task) in self.dispatchers.drain(..).enumerate() {
            match task.await {
                Ok(report) => {
                    stats.merge(&report.stats);
                    snapshots.push(report.snapshot);
                }
                Err(e) => {
                    tracing::error!(replica, error = %e, "dispatcher task failed");
                    snapshots.push(None);
                }
            }
        }

        self.cancel.cancel();
        for task in self.fetchers.drain(..) {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "rule fetcher task failed");
            }
        }

        self.last_stats = stats;
        self.last_snapshots = snapshots;
        self.state = EngineState::Stopped;
        tracing::info!(
            events = stats.events_processed,
            alerts = stats.alerts_emitted,
            "cep engine stopped"
        );
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            EngineState::Running => {
                let total = self.dispatchers.len();
                let stopped = self.dispatchers.iter().filter(|t| t.is_finished()).count();
                if stopped == total {
                    return HealthStatus::Unhealthy("all replicas stopped".to_owned());
                }
                if stopped > 0 {
                    return HealthStatus::Degraded(format!("{stopped} of {total} replicas stopped"));
                }

                let capacity = self.config.channel_capacity;
                let saturated = self
                    .replicas
                    .iter()
                    .filter(|r| r.records.capacity() * 10 < capacity)
                    .count();
                if saturated > 0 {
                    HealthStatus::Degraded(format!(
                        "{saturated} replica input queues above 90% utilization"
                    ))
                } else {
                    HealthStatus::Healthy
                }
            }
            EngineState::Initialized => HealthStatus::Unhealthy("not started".to_owned()),
            EngineState::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
        }
    }
}

/// CEP 엔진 빌더
///
/// 엔진을 구성하고 알림 채널을 생성합니다.
pub struct CepEngineBuilder<S> {
    config: EngineConfig,
    store: Arc<S>,
    alert_tx: Option<mpsc::Sender<Alert>>,
    event_tx: Option<mpsc::Sender<NormalizedEvent>>,
    snapshot: Option<RegistrySnapshot>,
}

impl<S: RuleStore> CepEngineBuilder<S> {
    /// 규칙 저장소로 빌더를 생성합니다.
    pub fn new(store: S) -> Self {
        Self::with_shared_store(Arc::new(store))
    }

    /// 공유된 규칙 저장소로 빌더를 생성합니다.
    pub fn with_shared_store(store: Arc<S>) -> Self {
        Self {
            config: EngineConfig::default(),
            store,
            alert_tx: None,
            event_tx: None,
            snapshot: None,
        }
    }

    /// 엔진 설정을 지정합니다.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// 외부 알림 전송 채널을 설정합니다.
    ///
    /// 설정하지 않으면 빌더가 새 채널을 생성합니다.
    pub fn alert_sender(mut self, tx: mpsc::Sender<Alert>) -> Self {
        self.alert_tx = Some(tx);
        self
    }

    /// 정규화된 이벤트를 받을 채널을 설정합니다. 설정하지 않으면 버립니다.
    pub fn event_sender(mut self, tx: mpsc::Sender<NormalizedEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// 시작할 때 모든 레플리카가 복원할 레지스트리 스냅샷을 지정합니다.
    pub fn snapshot(mut self, snapshot: RegistrySnapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    /// 엔진을 빌드합니다.
    ///
    /// # Returns
    /// - `CepEngine`: 엔진 인스턴스
    /// - `Option<mpsc::Receiver<Alert>>`: 알림 수신 채널
    ///   (외부 alert_sender를 설정한 경우 None)
    pub fn build(self) -> Result<(CepEngine<S>, Option<mpsc::Receiver<Alert>>), CepError> {
        self.config.validate()?;

        let (alert_tx, alert_rx) = match self.alert_tx {
            Some(tx) => (tx, None),
            None => {
                let (tx, rx) = mpsc::channel(self.config.alert_channel_capacity);
                (tx, Some(rx))
            }
        };
        let event_output = match self.event_tx {
            Some(tx) => EventOutput::Channel(tx),
            None => EventOutput::Discard,
        };

        let engine = CepEngine {
            config: self.config,
            state: EngineState::Initialized,
            store: self.store,
            alert_tx,
            event_output,
            snapshot: self.snapshot,
            replicas: Vec::new(),
            dispatchers: Vec::new(),
            fetchers: Vec::new(),
            cancel: CancellationToken::new(),
            next_replica: AtomicUsize::new(0),
            update_lock: Mutex::new(()),
            last_stats: DispatcherStats::default(),
            last_snapshots: Vec::new(),
        };

        Ok((engine, alert_rx))
    }
}
