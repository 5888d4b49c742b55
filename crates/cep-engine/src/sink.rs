//! 출력 싱크 -- 알림과 정규화 이벤트를 외부로 넘기는 협력자
//!
//! 알림 싱크는 비동기이며 `mpsc::Sender` 구현은 채널에 자리가 날 때까지 기다립니다.
//! 느린 소비자는 레플리카를 늦출 뿐 알림을 잃게 하지 않습니다. 수신 측이 닫힌
//! 경우에만 실패하고, 디스패처는 이를 로그와 통계로 남긴 뒤 평가를 계속합니다.
//!
//! 이벤트 싱크는 보관용 사본이므로 최선 노력(`try_send`)으로 전달합니다.

use tokio::sync::mpsc;
use vigil_core::types::Alert;

use crate::error::CepError;
use crate::normalizer::NormalizedEvent;

/// 알림 싱크
pub trait AlertSink: Send + Sync + 'static {
    /// 알림 하나를 전달합니다. 수신 측이 받을 수 있을 때까지 대기할 수 있습니다.
    ///
    /// # Errors
    /// 알림을 더 이상 전달할 수 없으면 [`CepError::Sink`]를 반환합니다.
    fn publish(&self, alert: Alert) -> impl Future<Output = Result<(), CepError>> + Send;
}

/// 정규화 이벤트 싱크 (원본 이벤트 보관용)
pub trait EventSink: Send + 'static {
    /// 이벤트 하나를 전달합니다.
    fn publish(&self, event: &NormalizedEvent) -> Result<(), CepError>;
}

impl AlertSink for mpsc::Sender<Alert> {
    async fn publish(&self, alert: Alert) -> Result<(), CepError> {
        self.send(alert).await.map_err(|_| CepError::Sink {
            sink: "alert".to_owned(),
            reason: "channel closed".to_owned(),
        })
    }
}

impl EventSink for mpsc::Sender<NormalizedEvent> {
    fn publish(&self, event: &NormalizedEvent) -> Result<(), CepError> {
        self.try_send(event.clone()).map_err(|e| CepError::Sink {
            sink: "event".to_owned(),
            reason: match e {
                mpsc::error::TrySendError::Full(_) => "channel full".to_owned(),
                mpsc::error::TrySendError::Closed(_) => "channel closed".to_owned(),
            },
        })
    }
}

/// 이벤트를 버리는 싱크
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn publish(&self, _event: &NormalizedEvent) -> Result<(), CepError> {
        Ok(())
    }
}

/// 이벤트 싱크 선택 (채널 또는 버림)
#[derive(Debug, Clone)]
pub enum EventOutput {
    /// 채널로 전달
    Channel(mpsc::Sender<NormalizedEvent>),
    /// 버림
    Discard,
}

impl EventSink for EventOutput {
    fn publish(&self, event: &NormalizedEvent) -> Result<(), CepError> {
        match self {
            Self::Channel(tx) => tx.publish(event),
            Self::Discard => NoopEventSink.publish(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vigil_core::types::Severity;

    fn sample_alert() -> Alert {
        Alert {
            alert_id: "alert-000000000000".to_owned(),
            rule_id: "r1".to_owned(),
            rule_name: "Rule".to_owned(),
            severity: Severity::High,
            description: String::new(),
            user_id: None,
            hostname: None,
            user_ip: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn channel_alert_sink_delivers() {
        let (tx, mut rx) = mpsc::channel(1);
        AlertSink::publish(&tx, sample_alert()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().rule_id, "r1");
    }

    #[tokio::test]
    async fn full_alert_channel_waits_for_reader() {
        let (tx, mut rx) = mpsc::channel(1);
        AlertSink::publish(&tx, sample_alert()).await.unwrap();

        let pending = tokio::spawn(async move { AlertSink::publish(&tx, sample_alert()).await });
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        assert!(rx.recv().await.is_some());
        pending.await.unwrap().unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn closed_alert_channel_is_sink_error() {
        let (tx, rx) = mpsc::channel::<Alert>(1);
        drop(rx);
        let err = tx.publish(sample_alert()).await.unwrap_err();
        assert!(matches!(err, CepError::Sink { sink, .. } if sink == "alert"));
    }

    #[test]
    fn closed_channel_is_sink_error() {
        let (tx, rx) = mpsc::channel::<NormalizedEvent>(1);
        drop(rx);
        let err = tx.publish(&NormalizedEvent::new("M-1", Utc::now())).unwrap_err();
        assert!(matches!(err, CepError::Sink { sink, .. } if sink == "event"));
    }

    #[test]
    fn discard_output_accepts_everything() {
        let out = EventOutput::Discard;
        out.publish(&NormalizedEvent::new("M-1", Utc::now())).unwrap();
    }
}
