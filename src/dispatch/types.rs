//! Shared types for the dispatch pipeline.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::dispatch::collaboration::CollaborationStatus;

pub const DEFAULT_TENANT: &str = "default";
pub const DEFAULT_CHANNEL: &str = "api";

// ── Request ─────────────────────────────────────────────────────────

/// Field names checked, in order, for the question text.
const TEXT_FIELDS: &[&str] = &["content", "text", "question", "message"];
/// Field names checked, in order, for the tenant.
const TENANT_FIELDS: &[&str] = &["tenant_id", "tenant"];
const CORRELATION_FIELDS: &[&str] = &["correlation_id"];
const CHANNEL_FIELDS: &[&str] = &["channel"];

/// A normalised incoming request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub text: String,
    pub tenant_id: String,
    pub correlation_id: Option<String>,
    pub channel: String,
}

impl DispatchRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tenant_id: DEFAULT_TENANT.to_string(),
            correlation_id: None,
            channel: DEFAULT_CHANNEL.to_string(),
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Normalise a mapping or bare string.
    ///
    /// Mappings take the first non-empty string among `content`, `text`,
    /// `question`, `message` (and `tenant_id`, `tenant` for the tenant).
    /// Other scalar values are rendered as text; `null` is empty.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(s) => Self::new(s.clone()),
            Value::Object(map) => {
                let first = |fields: &[&str]| {
                    fields
                        .iter()
                        .filter_map(|f| map.get(*f).and_then(Value::as_str))
                        .map(str::trim)
                        .find(|s| !s.is_empty())
                        .map(String::from)
                };
                let mut request = Self::new(first(TEXT_FIELDS).unwrap_or_default());
                if let Some(tenant) = first(TENANT_FIELDS) {
                    request.tenant_id = tenant;
                }
                request.correlation_id = first(CORRELATION_FIELDS);
                if let Some(channel) = first(CHANNEL_FIELDS) {
                    request.channel = channel;
                }
                request
            }
            Value::Null => Self::new(String::new()),
            other => Self::new(other.to_string()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

impl From<&str> for DispatchRequest {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for DispatchRequest {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

impl From<&Value> for DispatchRequest {
    fn from(value: &Value) -> Self {
        Self::from_value(value)
    }
}

// ── Analysis ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

impl Complexity {
    /// Lenient parse; anything unrecognised is `Medium`.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "low" | "simple" | "easy" => Self::Low,
            "high" | "complex" | "hard" => Self::High,
            _ => Self::Medium,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which experts to consult, and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Analysis {
    pub required_experts: Vec<String>,
    pub complexity: Complexity,
    pub keywords: Vec<String>,
    pub reasoning: String,
    /// True when this is the deterministic default rather than a model answer.
    pub fallback: bool,
}

impl Analysis {
    /// The deterministic default used when analysis fails.
    pub fn fallback(default_experts: &[String], cause: &str) -> Self {
        Self {
            required_experts: default_experts.to_vec(),
            complexity: Complexity::Medium,
            keywords: Vec::new(),
            reasoning: format!("Fallback analysis: {cause}"),
            fallback: true,
        }
    }
}

// ── Pipeline state ──────────────────────────────────────────────────

/// Per-request pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Analyzed,
    Retrieved,
    Dispatched,
    Synthesized,
    Stored,
    Done,
    NoInput,
    Error,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Analyzed => "analyzed",
            Self::Retrieved => "retrieved",
            Self::Dispatched => "dispatched",
            Self::Synthesized => "synthesized",
            Self::Stored => "stored",
            Self::Done => "done",
            Self::NoInput => "no_input",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Response ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    NoInput,
    Error,
}

/// Why a required expert was not dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotFound,
    Disabled,
    NoFactory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedExpert {
    /// The name as requested by the analysis.
    pub name: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseMetadata {
    pub channel: String,
    pub tenant_id: String,
    /// Experts that were dispatched (whatever their outcome).
    pub experts_involved: Vec<String>,
    pub experts_skipped: Vec<SkippedExpert>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complexity: Option<Complexity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interaction_id: Option<Uuid>,
    pub correlation_id: String,
    /// Number of retrieved knowledge records fed to the experts.
    pub knowledge_used: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collaboration_status: Option<CollaborationStatus>,
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseMetadata {
    pub(crate) fn new(request: &DispatchRequest, correlation_id: String, status: ResponseStatus) -> Self {
        Self {
            channel: request.channel.clone(),
            tenant_id: request.tenant_id.clone(),
            experts_involved: Vec::new(),
            experts_skipped: Vec::new(),
            complexity: None,
            interaction_id: None,
            correlation_id,
            knowledge_used: 0,
            collaboration_status: None,
            status,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchResponse {
    pub content: String,
    pub metadata: ResponseMetadata,
}

impl DispatchResponse {
    pub fn status(&self) -> ResponseStatus {
        self.metadata.status
    }

    pub fn is_success(&self) -> bool {
        self.metadata.status == ResponseStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_string_uses_default_tenant() {
        let request = DispatchRequest::from_value(&json!("How do I shard?"));
        assert_eq!(request.text, "How do I shard?");
        assert_eq!(request.tenant_id, DEFAULT_TENANT);
        assert_eq!(request.channel, DEFAULT_CHANNEL);
    }

    #[test]
    fn mapping_follows_field_priority() {
        let request = DispatchRequest::from_value(&json!({
            "text": "second",
            "content": "first",
            "tenant": "fallback-tenant",
            "tenant_id": "acme",
            "correlation_id": "req-1",
            "channel": "slack"
        }));
        assert_eq!(request.text, "first");
        assert_eq!(request.tenant_id, "acme");
        assert_eq!(request.correlation_id.as_deref(), Some("req-1"));
        assert_eq!(request.channel, "slack");
    }

    #[test]
    fn blank_fields_fall_through() {
        let request = DispatchRequest::from_value(&json!({
            "content": "   ",
            "question": "real question",
            "tenant_id": "",
            "tenant": "beta"
        }));
        assert_eq!(request.text, "real question");
        assert_eq!(request.tenant_id, "beta");
    }

    #[test]
    fn empty_inputs_are_detected() {
        assert!(DispatchRequest::from_value(&json!(null)).is_empty());
        assert!(DispatchRequest::from_value(&json!({"tenant_id": "t1"})).is_empty());
        assert!(DispatchRequest::from("  \n ").is_empty());
        assert!(!DispatchRequest::from_value(&json!(42)).is_empty());
    }

    #[test]
    fn test_complexity_parse_is_lenient() {
        assert_eq!(Complexity::parse_lenient("HIGH"), Complexity::High);
        assert_eq!(Complexity::parse_lenient("simple"), Complexity::Low);
        assert_eq!(Complexity::parse_lenient("???"), Complexity::Medium);
    }

    #[test]
    fn test_fallback_analysis_uses_defaults() {
        let defaults = vec!["general_expert".to_string()];
        let analysis = Analysis::fallback(&defaults, "timeout");
        assert!(analysis.fallback);
        assert_eq!(analysis.required_experts, defaults);
        assert_eq!(analysis.complexity, Complexity::Medium);
        assert!(analysis.reasoning.contains("timeout"));
    }

    #[test]
    fn metadata_serializes_status_snake_case() {
        let request = DispatchRequest::new("q");
        let metadata = ResponseMetadata::new(&request, "c1".into(), ResponseStatus::NoInput);
        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value["status"], "no_input");
        assert!(value.get("interaction_id").is_none());
    }
}
