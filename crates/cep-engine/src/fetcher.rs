//! 규칙 조회 워커 -- 저장소 호출을 이벤트 처리 경로에서 분리합니다.
//!
//! 레플리카마다 [`RuleFetcher`] 태스크가 하나씩 실행됩니다. 디스패처는 upsert 알림을
//! 받으면 [`FetchRequest`]를 보내고 곧바로 이벤트 처리를 계속하며, 조회 결과는
//! [`FetchOutcome`] 메시지로 돌아옵니다. 느리거나 실패하는 저장소 호출이
//! 이벤트 소비를 멈추지 않습니다.
//!
//! 모든 저장소 호출은 [`FetchPolicy`]의 타임아웃과 재시도로 감쌉니다.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::CepError;
use crate::rule::RuleDefinition;
use crate::store::RuleStore;

/// 저장소 호출 정책
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPolicy {
    /// 호출 1회 타임아웃
    pub timeout: Duration,
    /// 첫 시도 이후 재시도 횟수
    pub retries: u32,
    /// 재시도 간격
    pub backoff: Duration,
}

impl FetchPolicy {
    /// 엔진 설정에서 정책을 만듭니다.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            timeout: config.fetch_timeout(),
            retries: config.fetch_retries,
            backoff: config.fetch_retry_backoff(),
        }
    }
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// 저장소 호출을 타임아웃과 재시도로 감쌉니다.
///
/// 타임아웃은 [`CepError::Fetch`]로 보고되며, 마지막 시도의 에러를 반환합니다.
pub async fn with_retry<T, F, Fut>(policy: &FetchPolicy, target: &str, mut call: F) -> Result<T, CepError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CepError>>,
{
    let attempts = policy.retries.saturating_add(1);
    let mut attempt = 1;
    loop {
        let err = match tokio::time::timeout(policy.timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(_) => CepError::fetch(
                target,
                format!("timed out after {}ms", policy.timeout.as_millis()),
            ),
        };

        if attempt >= attempts {
            return Err(err);
        }
        tracing::warn!(
            target_id = target,
            attempt,
            max_attempts = attempts,
            error = %err,
            "rule store call failed, retrying"
        );
        attempt += 1;
        tokio::time::sleep(policy.backoff).await;
    }
}

/// 전체 규칙을 정책에 따라 조회합니다 (부트스트랩용).
pub async fn fetch_all<S: RuleStore>(
    store: &S,
    policy: &FetchPolicy,
) -> Result<Vec<(String, RuleDefinition)>, CepError> {
    with_retry(policy, "*", move || store.fetch_all()).await
}

/// 규칙 하나를 정책에 따라 조회합니다.
pub async fn fetch_one<S: RuleStore>(
    store: &S,
    policy: &FetchPolicy,
    rule_id: &str,
) -> Result<Option<RuleDefinition>, CepError> {
    with_retry(policy, rule_id, move || store.fetch_by_id(rule_id)).await
}

/// 조회 요청
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// upsert 알림의 순번
    pub seq: u64,
    /// 조회할 규칙 ID
    pub rule_id: String,
}

/// 조회 결과
#[derive(Debug)]
pub struct FetchOutcome {
    /// 요청 순번
    pub seq: u64,
    /// 규칙 ID
    pub rule_id: String,
    /// 조회된 정의 (`Ok(None)`: 저장소에 없음)
    pub result: Result<Option<RuleDefinition>, CepError>,
}

/// 규칙 조회 워커
pub struct RuleFetcher<S> {
    store: Arc<S>,
    policy: FetchPolicy,
    requests: mpsc::UnboundedReceiver<FetchRequest>,
    outcomes: mpsc::Sender<FetchOutcome>,
}

impl<S: RuleStore> RuleFetcher<S> {
    /// 새 워커를 생성합니다.
    pub fn new(
        store: Arc<S>,
        policy: FetchPolicy,
        requests: mpsc::UnboundedReceiver<FetchRequest>,
        outcomes: mpsc::Sender<FetchOutcome>,
    ) -> Self {
        Self {
            store,
            policy,
            requests,
            outcomes,
        }
    }

    /// 요청 채널이 닫히거나 취소될 때까지 요청을 순서대로 처리합니다.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => break,
                request = self.requests.recv() => match request {
                    Some(r) => r,
                    None => break,
                },
            };

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = fetch_one(self.store.as_ref(), &self.policy, &request.rule_id) => result,
            };

            let outcome = FetchOutcome {
                seq: request.seq,
                rule_id: request.rule_id,
                result,
            };
            if self.outcomes.send(outcome).await.is_err() {
                tracing::debug!("fetch outcome receiver closed, stopping fetcher");
                break;
            }
        }
        tracing::debug!("rule fetcher stopped");
    }
}
