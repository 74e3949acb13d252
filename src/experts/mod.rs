//! Specialist workers ("experts") and the registry that resolves them.
//!
//! - `registry` — `WorkerRegistry`, descriptors, aliases, health checks
//! - `entrypoints` — static `"module:ClassName"` → factory table
//! - `prompt` — `PromptExpert`, the built-in completion-backed worker

pub mod entrypoints;
pub mod prompt;
pub mod registry;

pub use entrypoints::{EntrypointFn, EntrypointTable, ExpertContext};
pub use prompt::PromptExpert;
pub use registry::{
    ExpertDescriptor, ExpertFactory, ExpertFilter, HealthCheckFn, HealthProbe, HealthState,
    HealthStatus, WorkerRegistry, normalize_name,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ExpertError;

/// Input handed to a single expert.
#[derive(Debug, Clone, Serialize)]
pub struct ExpertRequest {
    pub question: String,
    pub tenant_id: String,
    /// Analysis and retrieved knowledge, as JSON.
    pub context: serde_json::Value,
}

/// What an expert returns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpertResponse {
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ExpertResponse {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A specialist handler.
#[async_trait]
pub trait Expert: Send + Sync {
    fn name(&self) -> &str;

    async fn respond(&self, request: &ExpertRequest) -> Result<ExpertResponse, ExpertError>;
}

/// One roster entry, in the JSON bootstrap format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpertEntry {
    pub name: String,
    /// `"module:ClassName"` key resolved through an `EntrypointTable`.
    #[serde(default)]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub layer: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl ExpertEntry {
    /// The roster used when no roster file is configured.
    pub fn default_roster() -> Vec<ExpertEntry> {
        const PROMPT: &str = entrypoints::PROMPT_EXPERT_KEY;
        let entry = |name: &str, layer: &str, capabilities: &[&str], description: &str| {
            ExpertEntry {
                name: name.to_string(),
                entrypoint: Some(PROMPT.to_string()),
                aliases: Vec::new(),
                capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
                layer: Some(layer.to_string()),
                kind: Some("advisor".to_string()),
                enabled: true,
                description: Some(description.to_string()),
            }
        };
        vec![
            entry(
                "general_expert",
                "core",
                &["general", "explanation"],
                "Broad software engineering guidance",
            ),
            entry(
                "architecture_expert",
                "core",
                &["architecture", "design", "scalability"],
                "System design, boundaries and trade-offs",
            ),
            entry(
                "python_expert",
                "language",
                &["python", "debugging"],
                "Idiomatic Python, packaging and runtime behaviour",
            ),
            entry(
                "rust_expert",
                "language",
                &["rust", "performance"],
                "Ownership, async Rust and crate design",
            ),
            entry(
                "database_expert",
                "domain",
                &["database", "sql", "performance"],
                "Schema design, indexing and query tuning",
            ),
            entry(
                "security_expert",
                "domain",
                &["security", "auth"],
                "Threat modelling, authentication and hardening",
            ),
            entry(
                "devops_expert",
                "domain",
                &["deployment", "ci", "infrastructure"],
                "Build pipelines, containers and operations",
            ),
        ]
    }
}
