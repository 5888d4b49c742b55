//! 규칙 저장소 -- 규칙 정의의 원본을 제공하는 협력자
//!
//! [`RuleStore`]는 전체 조회와 ID 조회 두 가지 연산만 요구합니다.
//! 엔진은 모든 호출을 타임아웃과 재시도로 감싸므로 구현체는 이를 신경 쓰지 않아도 됩니다.
//!
//! - [`InMemoryRuleStore`]: 공유 가능한 메모리 저장소 (임베딩, 테스트)
//! - [`DirectoryRuleStore`]: `.yml`/`.yaml`/`.json` 규칙 파일 디렉토리

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::RwLock;

use crate::error::CepError;
use crate::rule::RuleDefinition;

/// 규칙 정의 저장소
pub trait RuleStore: Send + Sync + 'static {
    /// 모든 규칙 정의를 조회합니다.
    ///
    /// # Errors
    /// 저장소에 접근할 수 없거나 응답이 잘못된 경우 [`CepError::Fetch`] 등을 반환합니다.
    fn fetch_all(
        &self,
    ) -> impl Future<Output = Result<Vec<(String, RuleDefinition)>, CepError>> + Send;

    /// ID로 규칙 정의를 조회합니다. 없으면 `Ok(None)`입니다.
    fn fetch_by_id(
        &self,
        rule_id: &str,
    ) -> impl Future<Output = Result<Option<RuleDefinition>, CepError>> + Send;
}

/// 메모리 규칙 저장소
///
/// 복제본이 같은 맵을 공유하므로 엔진에 넘긴 뒤에도 규칙을 수정할 수 있습니다.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRuleStore {
    rules: Arc<RwLock<HashMap<String, RuleDefinition>>>,
}

impl InMemoryRuleStore {
    /// 빈 저장소를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 초기 규칙으로 저장소를 생성합니다.
    pub fn with_rules(rules: impl IntoIterator<Item = (String, RuleDefinition)>) -> Self {
        Self {
            rules: Arc::new(RwLock::new(rules.into_iter().collect())),
        }
    }

    /// 규칙을 저장하거나 교체합니다. 이전 정의를 반환합니다.
    pub async fn put(
        &self,
        rule_id: impl Into<String>,
        definition: RuleDefinition,
    ) -> Option<RuleDefinition> {
        self.rules.write().await.insert(rule_id.into(), definition)
    }

    /// 규칙을 제거합니다.
    pub async fn remove(&self, rule_id: &str) -> Option<RuleDefinition> {
        self.rules.write().await.remove(rule_id)
    }

    /// 저장된 규칙 수
    pub async fn len(&self) -> usize {
        self.rules.read().await.len()
    }

    /// 저장된 규칙이 없는지 여부
    pub async fn is_empty(&self) -> bool {
        self.rules.read().await.is_empty()
    }
}

impl RuleStore for InMemoryRuleStore {
    async fn fetch_all(&self) -> Result<Vec<(String, RuleDefinition)>, CepError> {
        let mut all: Vec<_> = self
            .rules
            .read()
            .await
            .iter()
            .map(|(id, def)| (id.clone(), def.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(all)
    }

    async fn fetch_by_id(&self, rule_id: &str) -> Result<Option<RuleDefinition>, CepError> {
        Ok(self.rules.read().await.get(rule_id).cloned())
    }
}

/// 규칙 파일 형식: 정의 필드 + 선택적 `id`
#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    id: Option<String>,
    #[serde(flatten)]
    definition: RuleDefinition,
}

/// 디렉토리 규칙 저장소
///
/// 파일 하나에 규칙 하나를 담습니다. 규칙 ID는 파일의 `id` 필드, 없으면 파일 이름(확장자 제외)입니다.
/// 개별 파일 로딩 실패는 경고 로그를 남기고 건너뜁니다.
#[derive(Debug, Clone)]
pub struct DirectoryRuleStore {
    dir: PathBuf,
    max_file_bytes: u64,
    max_rules: usize,
}

impl DirectoryRuleStore {
    /// 기본 제한(파일 1MiB, 규칙 10,000개)으로 저장소를 생성합니다.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_file_bytes: 1024 * 1024,
            max_rules: 10_000,
        }
    }

    /// 엔진 설정의 디렉토리와 제한으로 저장소를 생성합니다.
    pub fn from_config(config: &crate::config::EngineConfig) -> Self {
        Self {
            dir: PathBuf::from(&config.rule_dir),
            max_file_bytes: config.max_rule_file_bytes,
            max_rules: config.max_rules,
        }
    }

    /// 파일 최대 크기를 설정합니다.
    pub fn with_max_file_bytes(mut self, max: u64) -> Self {
        self.max_file_bytes = max;
        self
    }

    /// 최대 규칙 수를 설정합니다.
    pub fn with_max_rules(mut self, max: usize) -> Self {
        self.max_rules = max;
        self
    }

    /// 저장소 디렉토리
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 디렉토리의 모든 규칙 파일을 로드합니다.
    ///
    /// # Errors
    /// - 디렉토리를 읽을 수 없는 경우
    /// - 규칙 수가 최대치를 넘는 경우
    pub async fn load_directory(&self) -> Result<Vec<(String, RuleDefinition)>, CepError> {
        let dir = &self.dir;
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| CepError::RuleLoad {
                path: dir.display().to_string(),
                reason: format!("failed to read directory: {e}"),
            })?;

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CepError::RuleLoad {
                path: dir.display().to_string(),
                reason: format!("failed to read directory entry: {e}"),
            })?
        {
            let path = entry.path();
            if rule_format(&path).is_some() {
                paths.push(path);
            }
        }
        // 파일 이름 순으로 처리하여 중복 ID 처리 결과를 고정
        paths.sort();

        let mut rules = Vec::new();
        let mut seen_ids = HashSet::new();

        for path in paths {
            match self.load_file(&path).await {
                Ok((id, definition)) => {
                    if !seen_ids.insert(id.clone()) {
                        tracing::warn!(
                            rule_id = %id,
                            path = %path.display(),
                            "duplicate rule id, skipping"
                        );
                        continue;
                    }
                    rules.push((id, definition));
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "failed to load rule file, skipping"
                    );
                }
            }

            if rules.len() > self.max_rules {
                return Err(CepError::RuleLoad {
                    path: dir.display().to_string(),
                    reason: format!("too many rules: max {}", self.max_rules),
                });
            }
        }

        tracing::info!(dir = %dir.display(), count = rules.len(), "loaded rule definitions");
        Ok(rules)
    }

    /// 단일 규칙 파일을 로드합니다.
    pub async fn load_file(&self, path: &Path) -> Result<(String, RuleDefinition), CepError> {
        let load_err = |reason: String| CepError::RuleLoad {
            path: path.display().to_string(),
            reason,
        };

        let format = rule_format(path)
            .ok_or_else(|| load_err("unsupported file extension".to_owned()))?;

        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| load_err(format!("failed to read file metadata: {e}")))?;
        if metadata.len() > self.max_file_bytes {
            return Err(load_err(format!(
                "file too large: {} bytes (max: {})",
                metadata.len(),
                self.max_file_bytes
            )));
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| load_err(format!("failed to read file: {e}")))?;

        let file: RuleFile = match format {
            RuleFormat::Json => serde_json::from_str(&content)
                .map_err(|e| load_err(format!("JSON parse error: {e}")))?,
            RuleFormat::Yaml => serde_yaml::from_str(&content)
                .map_err(|e| load_err(format!("YAML parse error: {e}")))?,
        };

        let id = match file.id {
            Some(id) if !id.trim().is_empty() => id,
            _ => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .ok_or_else(|| load_err("cannot derive rule id from file name".to_owned()))?,
        };

        file.definition.validate(&id)?;
        Ok((id, file.definition))
    }
}

impl RuleStore for DirectoryRuleStore {
    async fn fetch_all(&self) -> Result<Vec<(String, RuleDefinition)>, CepError> {
        self.load_directory()
            .await
            .map_err(|e| CepError::fetch("*", e.to_string()))
    }

    async fn fetch_by_id(&self, rule_id: &str) -> Result<Option<RuleDefinition>, CepError> {
        let rules = self
            .load_directory()
            .await
            .map_err(|e| CepError::fetch(rule_id, e.to_string()))?;
        Ok(rules
            .into_iter()
            .find(|(id, _)| id == rule_id)
            .map(|(_, def)| def))
    }
}

#[derive(Debug, Clone, Copy)]
enum RuleFormat {
    Yaml,
    Json,
}

fn rule_format(path: &Path) -> Option<RuleFormat> {
    match path.extension()?.to_str()? {
        "yml" | "yaml" => Some(RuleFormat::Yaml),
        "json" => Some(RuleFormat::Json),
        _ => None,
    }
}
