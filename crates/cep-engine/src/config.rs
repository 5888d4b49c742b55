//! CEP 엔진 설정
//!
//! [`EngineConfig`]는 core의 [`EngineSection`](vigil_core::config::EngineSection)을
//! 기반으로 엔진 내부에서만 사용하는 설정을 추가합니다.
//!
//! # 사용 예시
//! ```ignore
//! use vigil_core::config::VigilConfig;
//! use vigil_cep::config::EngineConfig;
//!
//! let core_config = VigilConfig::default();
//! let config = EngineConfig::from_core(&core_config.engine);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CepError;

/// 레플리카 수 상한
const MAX_REPLICAS: usize = 256;
/// 채널 용량 상한
const MAX_CHANNEL_CAPACITY: usize = 1_000_000;
/// 재시도 횟수 상한
const MAX_FETCH_RETRIES: u32 = 10;
/// 고정 오프셋 허용 범위 (UTC-12:00 ~ UTC+14:00)
const MIN_UTC_OFFSET_SECS: i32 = -12 * 3600;
const MAX_UTC_OFFSET_SECS: i32 = 14 * 3600;

/// CEP 엔진 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// 병렬 디스패처 레플리카 수
    pub replicas: usize,
    /// 레플리카별 이벤트/업데이트 채널 용량
    pub channel_capacity: usize,
    /// 파일 기반 규칙 저장소 디렉토리
    pub rule_dir: String,
    /// 규칙 저장소 호출 타임아웃 (밀리초)
    pub fetch_timeout_ms: u64,
    /// 규칙 저장소 호출 재시도 횟수 (첫 시도 제외)
    pub fetch_retries: u32,
    /// 재시도 간격 (밀리초)
    pub fetch_retry_backoff_ms: u64,
    /// hour/dayOfWeek 계산용 고정 UTC 오프셋 (초)
    pub utc_offset_secs: i32,

    // --- 확장 설정 (core에 없는 추가 필드) ---
    /// 엔진이 직접 만드는 알림 채널 용량 (외부 송신측 미지정 시)
    pub alert_channel_capacity: usize,
    /// 규칙 파일 최대 크기 (바이트)
    pub max_rule_file_bytes: u64,
    /// 디렉토리 저장소에서 읽을 최대 규칙 수
    pub max_rules: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_core(&vigil_core::config::EngineSection::default())
    }
}

impl EngineConfig {
    /// core의 `EngineSection`에서 엔진 설정을 생성합니다.
    ///
    /// core 설정에 없는 확장 필드는 기본값이 적용됩니다.
    pub fn from_core(core: &vigil_core::config::EngineSection) -> Self {
        Self {
            replicas: core.replicas,
            channel_capacity: core.channel_capacity,
            rule_dir: core.rule_dir.clone(),
            fetch_timeout_ms: core.fetch_timeout_ms,
            fetch_retries: core.fetch_retries,
            fetch_retry_backoff_ms: core.fetch_retry_backoff_ms,
            utc_offset_secs: core.utc_offset_secs,
            alert_channel_capacity: 1024,
            max_rule_file_bytes: 1024 * 1024,
            max_rules: 10_000,
        }
    }

    /// 저장소 호출 타임아웃
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// 재시도 간격
    pub fn fetch_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.fetch_retry_backoff_ms)
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), CepError> {
        if self.replicas == 0 || self.replicas > MAX_REPLICAS {
            return Err(config_err("replicas", format!("must be 1-{MAX_REPLICAS}")));
        }

        for (field, value) in [
            ("channel_capacity", self.channel_capacity),
            ("alert_channel_capacity", self.alert_channel_capacity),
        ] {
            if value == 0 || value > MAX_CHANNEL_CAPACITY {
                return Err(config_err(field, format!("must be 1-{MAX_CHANNEL_CAPACITY}")));
            }
        }

        if self.fetch_timeout_ms == 0 {
            return Err(config_err("fetch_timeout_ms", "must be greater than 0"));
        }

        if self.fetch_retries > MAX_FETCH_RETRIES {
            return Err(config_err(
                "fetch_retries",
                format!("must be at most {MAX_FETCH_RETRIES}"),
            ));
        }

        if !(MIN_UTC_OFFSET_SECS..=MAX_UTC_OFFSET_SECS).contains(&self.utc_offset_secs) {
            return Err(config_err(
                "utc_offset_secs",
                format!("must be within {MIN_UTC_OFFSET_SECS}..={MAX_UTC_OFFSET_SECS}"),
            ));
        }

        if self.max_rule_file_bytes == 0 {
            return Err(config_err("max_rule_file_bytes", "must be greater than 0"));
        }

        if self.max_rules == 0 {
            return Err(config_err("max_rules", "must be greater than 0"));
        }

        Ok(())
    }
}

fn config_err(field: &str, reason: impl Into<String>) -> CepError {
    CepError::Config {
        field: field.to_owned(),
        reason: reason.into(),
    }
}

/// 엔진 설정 빌더
#[derive(Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// 새 빌더를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 레플리카 수를 설정합니다.
    pub fn replicas(mut self, replicas: usize) -> Self {
        self.config.replicas = replicas;
        self
    }

    /// 레플리카별 채널 용량을 설정합니다.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    /// 규칙 디렉토리를 설정합니다.
    pub fn rule_dir(mut self, dir: impl Into<String>) -> Self {
        self.config.rule_dir = dir.into();
        self
    }

    /// 저장소 호출 타임아웃(밀리초)을 설정합니다.
    pub fn fetch_timeout_ms(mut self, ms: u64) -> Self {
        self.config.fetch_timeout_ms = ms;
        self
    }

    /// 재시도 횟수를 설정합니다.
    pub fn fetch_retries(mut self, retries: u32) -> Self {
        self.config.fetch_retries = retries;
        self
    }

    /// 재시도 간격(밀리초)을 설정합니다.
    pub fn fetch_retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.fetch_retry_backoff_ms = ms;
        self
    }

    /// 고정 UTC 오프셋(초)을 설정합니다.
    pub fn utc_offset_secs(mut self, secs: i32) -> Self {
        self.config.utc_offset_secs = secs;
        self
    }

    /// 알림 채널 용량을 설정합니다.
    pub fn alert_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.alert_channel_capacity = capacity;
        self
    }

    /// 최대 규칙 수를 설정합니다.
    pub fn max_rules(mut self, max: usize) -> Self {
        self.config.max_rules = max;
        self
    }

    /// 설정을 검증하고 `EngineConfig`를 생성합니다.
    pub fn build(self) -> Result<EngineConfig, CepError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
