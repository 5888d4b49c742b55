//! 설정 관리 -- vigil.toml 파싱 및 런타임 설정
//!
//! [`VigilConfig`]는 모든 모듈의 설정을 담는 최상위 구조체입니다.
//!
//! # 설정 로딩 우선순위
//! 1. 환경변수 (`VIGIL_ENGINE_REPLICAS=8` 형식)
//! 2. 설정 파일 (`vigil.toml`)
//! 3. 기본값 (`Default` 구현)
//!
//! # 사용 예시
//! ```no_run
//! # async fn example() -> Result<(), vigil_core::error::VigilError> {
//! use vigil_core::config::VigilConfig;
//!
//! // 파일에서 로드 + 환경변수 오버라이드
//! let config = VigilConfig::load("vigil.toml").await?;
//!
//! // TOML 문자열에서 직접 파싱
//! let config = VigilConfig::parse("[general]\nlog_level = \"debug\"")?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, VigilError};

/// 한 시간(초)
const SECS_PER_HOUR: i32 = 3600;

/// Vigil 통합 설정
///
/// `vigil.toml` 파일의 최상위 구조를 나타냅니다.
/// 각 모듈은 자기 섹션만 읽어 사용합니다.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VigilConfig {
    /// 일반 설정
    #[serde(default)]
    pub general: GeneralConfig,
    /// 규칙 엔진 설정
    #[serde(default)]
    pub engine: EngineSection,
}

impl VigilConfig {
    /// TOML 파일에서 설정을 로드하고 환경변수 오버라이드를 적용합니다.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, VigilError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// TOML 파일에서 설정을 로드합니다 (환경변수 오버라이드 없음).
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, VigilError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VigilError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                VigilError::Io(e)
            }
        })?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// TOML 문자열에서 설정을 파싱합니다.
    pub fn parse(toml_str: &str) -> Result<Self, VigilError> {
        toml::from_str(toml_str).map_err(|e| {
            VigilError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// 환경변수로 설정값을 오버라이드합니다.
    ///
    /// 환경변수 네이밍 규칙: `VIGIL_{SECTION}_{FIELD}`
    pub fn apply_env_overrides(&mut self) {
        // General
        override_string(&mut self.general.log_level, "VIGIL_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "VIGIL_GENERAL_LOG_FORMAT");

        // Engine
        override_parsed(&mut self.engine.replicas, "VIGIL_ENGINE_REPLICAS");
        override_parsed(
            &mut self.engine.channel_capacity,
            "VIGIL_ENGINE_CHANNEL_CAPACITY",
        );
        override_string(&mut self.engine.rule_dir, "VIGIL_ENGINE_RULE_DIR");
        override_parsed(
            &mut self.engine.fetch_timeout_ms,
            "VIGIL_ENGINE_FETCH_TIMEOUT_MS",
        );
        override_parsed(&mut self.engine.fetch_retries, "VIGIL_ENGINE_FETCH_RETRIES");
        override_parsed(
            &mut self.engine.fetch_retry_backoff_ms,
            "VIGIL_ENGINE_FETCH_RETRY_BACKOFF_MS",
        );
        override_parsed(
            &mut self.engine.utc_offset_secs,
            "VIGIL_ENGINE_UTC_OFFSET_SECS",
        );
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), VigilError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "general.log_level".to_owned(),
                reason: format!("must be one of: {}", valid_levels.join(", ")),
            }
            .into());
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "general.log_format".to_owned(),
                reason: format!("must be one of: {}", valid_formats.join(", ")),
            }
            .into());
        }

        if self.engine.replicas == 0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.replicas".to_owned(),
                reason: "at least one replica is required".to_owned(),
            }
            .into());
        }

        if self.engine.channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.channel_capacity".to_owned(),
                reason: "must be greater than 0".to_owned(),
            }
            .into());
        }

        if self.engine.fetch_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.fetch_timeout_ms".to_owned(),
                reason: "rule store calls must be bounded by a non-zero timeout".to_owned(),
            }
            .into());
        }

        // UTC-12:00 ~ UTC+14:00
        let offset = self.engine.utc_offset_secs;
        if !(-12 * SECS_PER_HOUR..=14 * SECS_PER_HOUR).contains(&offset) {
            return Err(ConfigError::InvalidValue {
                field: "engine.utc_offset_secs".to_owned(),
                reason: format!("{offset} is outside -43200..=50400"),
            }
            .into());
        }

        Ok(())
    }
}

/// 일반 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// 로그 레벨 (trace, debug, info, warn, error)
    pub log_level: String,
    /// 로그 형식 (json, pretty)
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "json".to_owned(),
        }
    }
}

/// 규칙 엔진 설정 (`[engine]` 섹션)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// 병렬 디스패처 레플리카 수
    pub replicas: usize,
    /// 레플리카별 이벤트/업데이트 채널 용량
    pub channel_capacity: usize,
    /// 파일 기반 규칙 저장소 디렉토리
    pub rule_dir: String,
    /// 규칙 저장소 호출 타임아웃 (밀리초)
    pub fetch_timeout_ms: u64,
    /// 규칙 저장소 호출 재시도 횟수
    pub fetch_retries: u32,
    /// 재시도 간격 (밀리초)
    pub fetch_retry_backoff_ms: u64,
    /// hour/dayOfWeek 파생 필드 계산에 쓰는 고정 UTC 오프셋 (초, 기본 +09:00)
    pub utc_offset_secs: i32,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            replicas: 4,
            channel_capacity: 1024,
            rule_dir: "/etc/vigil/rules".to_owned(),
            fetch_timeout_ms: 5_000,
            fetch_retries: 2,
            fetch_retry_backoff_ms: 500,
            utc_offset_secs: 9 * SECS_PER_HOUR,
        }
    }
}

// --- 환경변수 오버라이드 헬퍼 ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_parsed<T: FromStr>(target: &mut T, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                expected = std::any::type_name::<T>(),
                "failed to parse env var, ignoring"
            ),
        }
    }
}
