//! Configuration types.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::experts::ExpertEntry;

/// Dispatch pipeline configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Experts consulted when analysis falls back.
    pub default_experts: Vec<String>,
    /// Upper bound for a single expert call.
    pub expert_timeout: Duration,
    /// Maximum number of similar records fed into the pipeline.
    pub retrieval_top_k: usize,
    /// Minimum cosine similarity for a retrieved record.
    pub retrieval_threshold: f32,
    pub analysis_max_tokens: u32,
    pub analysis_temperature: f32,
    pub synthesis_max_tokens: u32,
    pub synthesis_temperature: f32,
    /// Also persist each successful expert response into expert-knowledge.
    pub store_expert_knowledge: bool,
    /// Retention of finished collaborations.
    pub retention: RetentionConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_experts: vec![
                "general_expert".to_string(),
                "architecture_expert".to_string(),
            ],
            expert_timeout: Duration::from_secs(30),
            retrieval_top_k: 5,
            retrieval_threshold: 0.7,
            analysis_max_tokens: 512,
            analysis_temperature: 0.1,
            synthesis_max_tokens: 2048,
            synthesis_temperature: 0.3,
            store_expert_knowledge: false,
            retention: RetentionConfig::default(),
        }
    }
}

impl DispatchConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let stale_secs: u64 = env_parse(
            "DISPATCH_COLLABORATION_STALE_SECS",
            defaults.retention.stale_after.as_secs(),
        )?;
        if stale_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DISPATCH_COLLABORATION_STALE_SECS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        let stale_after = Duration::from_secs(stale_secs);

        let default_experts = match std::env::var("DISPATCH_DEFAULT_EXPERTS") {
            Ok(raw) => {
                let experts: Vec<String> = raw
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                if experts.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        key: "DISPATCH_DEFAULT_EXPERTS".to_string(),
                        message: "must name at least one expert".to_string(),
                    });
                }
                experts
            }
            Err(_) => defaults.default_experts,
        };

        let retrieval_threshold: f32 =
            env_parse("DISPATCH_RETRIEVAL_THRESHOLD", defaults.retrieval_threshold)?;
        if !(0.0..=1.0).contains(&retrieval_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "DISPATCH_RETRIEVAL_THRESHOLD".to_string(),
                message: format!("{retrieval_threshold} is outside 0.0..=1.0"),
            });
        }

        Ok(Self {
            default_experts,
            expert_timeout: Duration::from_secs(env_parse(
                "DISPATCH_EXPERT_TIMEOUT_SECS",
                defaults.expert_timeout.as_secs(),
            )?),
            retrieval_top_k: env_parse("DISPATCH_RETRIEVAL_TOP_K", defaults.retrieval_top_k)?,
            retrieval_threshold,
            analysis_max_tokens: env_parse(
                "DISPATCH_ANALYSIS_MAX_TOKENS",
                defaults.analysis_max_tokens,
            )?,
            analysis_temperature: defaults.analysis_temperature,
            synthesis_max_tokens: env_parse(
                "DISPATCH_SYNTHESIS_MAX_TOKENS",
                defaults.synthesis_max_tokens,
            )?,
            synthesis_temperature: defaults.synthesis_temperature,
            store_expert_knowledge: env_parse(
                "DISPATCH_STORE_EXPERT_KNOWLEDGE",
                defaults.store_expert_knowledge,
            )?,
            retention: RetentionConfig {
                max_entries: env_parse(
                    "DISPATCH_COLLABORATION_MAX_ENTRIES",
                    defaults.retention.max_entries,
                )?,
                ttl: Duration::from_secs(env_parse(
                    "DISPATCH_COLLABORATION_TTL_SECS",
                    defaults.retention.ttl.as_secs(),
                )?),
                stale_after,
            },
        })
    }
}

/// Bounded retention for the in-memory collaboration table.
#[derive(Debug, Clone, Copy)]
pub struct RetentionConfig {
    /// Hard cap on retained collaborations.
    pub max_entries: usize,
    /// Settled collaborations older than this are swept.
    pub ttl: Duration,
    /// In-progress collaborations started longer ago than this are swept.
    pub stale_after: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_entries: 1_000,
            ttl: Duration::from_secs(3600), // 1 hour
            stale_after: Duration::from_secs(3600),
        }
    }
}

/// Which similarity backend serves the knowledge store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendKind {
    /// Pure in-process backend (tests, offline operation).
    Memory,
    /// libSQL database file.
    LibSql { path: PathBuf },
}

/// Knowledge store configuration.
#[derive(Debug, Clone)]
pub struct KnowledgeConfig {
    pub backend: BackendKind,
    /// Maximum number of cached embeddings.
    pub cache_max_size: usize,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            cache_max_size: 10_000,
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dimensions: 1536,
        }
    }
}

impl KnowledgeConfig {
    /// Build config from environment variables.
    /// `KNOWLEDGE_DB_PATH` selects the libSQL backend; otherwise in-memory.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let backend = match std::env::var("KNOWLEDGE_DB_PATH") {
            Ok(path) if !path.trim().is_empty() => BackendKind::LibSql {
                path: PathBuf::from(path),
            },
            _ => BackendKind::Memory,
        };

        let cache_max_size = env_parse("KNOWLEDGE_CACHE_MAX_SIZE", defaults.cache_max_size)?;
        if cache_max_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "KNOWLEDGE_CACHE_MAX_SIZE".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            backend,
            cache_max_size,
            embedding_model: std::env::var("KNOWLEDGE_EMBEDDING_MODEL")
                .unwrap_or(defaults.embedding_model),
            embedding_dimensions: env_parse(
                "KNOWLEDGE_EMBEDDING_DIMENSIONS",
                defaults.embedding_dimensions,
            )?,
        })
    }
}

/// Load an expert roster from a JSON file.
pub fn load_roster(path: &Path) -> Result<Vec<ExpertEntry>, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw)
        .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))
}

/// Parse an environment variable, using `default` when it is unset.
fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = DispatchConfig::default();
        assert!(!config.default_experts.is_empty());
        assert!(config.retrieval_top_k > 0);
        assert!(config.retention.max_entries > 0);
        assert_eq!(KnowledgeConfig::default().backend, BackendKind::Memory);
    }

    #[test]
    fn env_parse_uses_default_when_unset() {
        let value: u64 = env_parse("EXPERT_DISPATCH_TEST_UNSET_KEY", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn load_roster_reads_json_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experts.json");
        std::fs::write(
            &path,
            r#"[{"name": "python_expert", "entrypoint": "experts.prompt:PromptExpert",
                 "capabilities": ["python", "debugging"], "layer": "domain"}]"#,
        )
        .unwrap();

        let roster = load_roster(&path).unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].name, "python_expert");
        assert!(roster[0].enabled);
    }

    #[test]
    fn load_roster_rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experts.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(load_roster(&path), Err(ConfigError::ParseError(_))));
    }
}
