//! CEP 엔진 에러 타입
//!
//! [`CepError`]는 규칙 컴파일, 규칙 저장소 조회, 싱크 전달 등 엔진 내부에서
//! 발생하는 모든 에러를 표현합니다. 디스패처 루프는 어떤 에러로도 종료되지 않으며,
//! 에러는 로그로 남기고 이전 상태를 유지합니다.
//! `From<CepError> for VigilError` 변환이 구현되어 있어 상위 레이어에서
//! `?` 연산자로 전파할 수 있습니다.

use vigil_core::error::{DetectionError, PipelineError, VigilError};

/// CEP 엔진 도메인 에러
#[derive(Debug, thiserror::Error)]
pub enum CepError {
    /// 조건식 컴파일 실패
    #[error("compile error at offset {offset}: {reason}")]
    Compile {
        /// 문제 토큰의 바이트 오프셋
        offset: usize,
        /// 실패 사유
        reason: String,
    },

    /// 규칙 저장소 조회 실패 (연결 불가, 타임아웃, 잘못된 응답)
    #[error("fetch error: {target}: {reason}")]
    Fetch {
        /// 조회 대상 (규칙 ID 또는 "*")
        target: String,
        /// 실패 사유
        reason: String,
    },

    /// 규칙 파일 로딩 실패
    #[error("rule load error: {path}: {reason}")]
    RuleLoad {
        /// 규칙 파일 경로
        path: String,
        /// 로딩 실패 사유
        reason: String,
    },

    /// 규칙 정의 유효성 검증 실패
    #[error("rule validation error: rule '{rule_id}': {reason}")]
    RuleValidation {
        /// 문제가 된 규칙 ID
        rule_id: String,
        /// 검증 실패 사유
        reason: String,
    },

    /// 규칙 업데이트 알림 디코딩 실패
    #[error("invalid rule update notification: {0}")]
    Notification(String),

    /// 싱크 전달 실패
    #[error("sink error: {sink}: {reason}")]
    Sink {
        /// 싱크 종류 (alert, event)
        sink: String,
        /// 실패 사유
        reason: String,
    },

    /// 설정 에러
    #[error("config error: {field}: {reason}")]
    Config {
        /// 설정 필드명
        field: String,
        /// 에러 사유
        reason: String,
    },

    /// 채널 통신 에러
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// 정규식 컴파일 에러
    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl CepError {
    /// 컴파일 에러를 생성합니다.
    pub(crate) fn compile(offset: usize, reason: impl Into<String>) -> Self {
        Self::Compile {
            offset,
            reason: reason.into(),
        }
    }

    /// 조회 에러를 생성합니다.
    pub(crate) fn fetch(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Fetch {
            target: target.into(),
            reason: reason.into(),
        }
    }
}

impl From<CepError> for VigilError {
    fn from(err: CepError) -> Self {
        match err {
            CepError::Compile { .. } | CepError::RuleValidation { .. } | CepError::Regex(_) => {
                VigilError::Detection(DetectionError::Rule(err.to_string()))
            }
            CepError::Fetch { .. } | CepError::RuleLoad { .. } => {
                VigilError::Detection(DetectionError::RuleStore(err.to_string()))
            }
            CepError::Io(e) => VigilError::Io(e),
            CepError::Channel(reason) => VigilError::Pipeline(PipelineError::ChannelSend(reason)),
            other => VigilError::Pipeline(PipelineError::InitFailed(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_error_display() {
        let err = CepError::compile(17, "expected ')'");
        let msg = err.to_string();
        assert!(msg.contains("17"));
        assert!(msg.contains("expected ')'"));
    }

    #[test]
    fn fetch_error_display() {
        let err = CepError::fetch("usb-bulk-copy", "timed out after 5000ms");
        let msg = err.to_string();
        assert!(msg.contains("usb-bulk-copy"));
        assert!(msg.contains("timed out"));
    }

    #[test]
    fn compile_error_converts_to_detection_error() {
        let err: VigilError = CepError::compile(0, "empty predicate").into();
        assert!(matches!(err, VigilError::Detection(DetectionError::Rule(_))));
    }

    #[test]
    fn fetch_error_converts_to_rule_store_error() {
        let err: VigilError = CepError::fetch("*", "unreachable").into();
        assert!(matches!(
            err,
            VigilError::Detection(DetectionError::RuleStore(_))
        ));
    }

    #[test]
    fn channel_error_converts_to_pipeline_error() {
        let err: VigilError = CepError::Channel("receiver closed".to_owned()).into();
        assert!(matches!(err, VigilError::Pipeline(PipelineError::ChannelSend(_))));
    }

    #[test]
    fn io_error_keeps_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: VigilError = CepError::from(io).into();
        assert!(matches!(err, VigilError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied));
    }
}
