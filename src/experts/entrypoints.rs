//! Static entrypoint table.
//!
//! Roster files name workers with `"module:ClassName"` keys. Instead of loading
//! anything at runtime, each key maps to a factory-builder function.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::error::RegistryError;
use crate::experts::prompt::PromptExpert;
use crate::experts::registry::{ExpertDescriptor, ExpertFactory};
use crate::experts::Expert;
use crate::llm::LlmProvider;

pub const PROMPT_EXPERT_KEY: &str = "experts.prompt:PromptExpert";

static ENTRYPOINT_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*:[A-Za-z_][A-Za-z0-9_]*$")
        .expect("entrypoint pattern is valid")
});

/// Shared services available to factories.
#[derive(Clone, Default)]
pub struct ExpertContext {
    pub llm: Option<Arc<dyn LlmProvider>>,
}

impl ExpertContext {
    pub fn with_llm(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm: Some(llm) }
    }
}

/// Turns a descriptor plus shared context into a worker factory.
pub type EntrypointFn =
    fn(&ExpertDescriptor, &ExpertContext) -> Result<ExpertFactory, String>;

/// Map from entrypoint keys to factory builders.
#[derive(Clone, Default)]
pub struct EntrypointTable {
    entries: BTreeMap<String, EntrypointFn>,
}

impl EntrypointTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The table with every built-in worker.
    pub fn builtin() -> Self {
        let mut table = Self::new();
        table
            .entries
            .insert(PROMPT_EXPERT_KEY.to_string(), prompt_expert as EntrypointFn);
        table
    }

    /// Add or replace an entrypoint.
    pub fn insert(&mut self, key: &str, entry: EntrypointFn) -> Result<(), RegistryError> {
        validate_key(key)?;
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key.trim())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Look up a key, checking its shape first.
    pub fn resolve(&self, key: &str) -> Result<EntrypointFn, RegistryError> {
        let key = key.trim();
        validate_key(key)?;
        self.entries
            .get(key)
            .copied()
            .ok_or_else(|| RegistryError::UnknownEntrypoint {
                key: key.to_string(),
            })
    }

    /// Resolve a key and build the factory for `descriptor`.
    pub fn build(
        &self,
        key: &str,
        descriptor: &ExpertDescriptor,
        ctx: &ExpertContext,
    ) -> Result<ExpertFactory, RegistryError> {
        let entry = self.resolve(key)?;
        entry(descriptor, ctx).map_err(|reason| RegistryError::FactoryFailed {
            key: key.trim().to_string(),
            reason,
        })
    }
}

fn validate_key(key: &str) -> Result<(), RegistryError> {
    if ENTRYPOINT_KEY.is_match(key) {
        Ok(())
    } else {
        Err(RegistryError::InvalidEntrypoint {
            key: key.to_string(),
        })
    }
}

fn prompt_expert(
    descriptor: &ExpertDescriptor,
    ctx: &ExpertContext,
) -> Result<ExpertFactory, String> {
    let llm = ctx
        .llm
        .clone()
        .ok_or_else(|| "no completion service configured".to_string())?;
    let expert: Arc<dyn Expert> = Arc::new(PromptExpert::from_descriptor(descriptor, llm));
    Ok(Arc::new(move || expert.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experts::registry::WorkerRegistry;
    use crate::experts::ExpertEntry;
    use crate::experts::{ExpertRequest, ExpertResponse};
    use crate::error::{ExpertError, LlmError};
    use crate::llm::{CompletionRequest, CompletionResponse, FinishReason};
    use async_trait::async_trait;
    use rust_decimal::Decimal;

    struct FixedLlm;

    #[async_trait]
    impl LlmProvider for FixedLlm {
        fn model_name(&self) -> &str {
            "fixed"
        }

        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (Decimal::ZERO, Decimal::ZERO)
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            Ok(CompletionResponse {
                content: "fixed answer".into(),
                input_tokens: 1,
                output_tokens: 1,
                finish_reason: FinishReason::Stop,
                response_id: None,
            })
        }
    }

    struct Static;

    #[async_trait]
    impl Expert for Static {
        fn name(&self) -> &str {
            "static"
        }

        async fn respond(&self, _request: &ExpertRequest) -> Result<ExpertResponse, ExpertError> {
            Ok(ExpertResponse::new("static"))
        }
    }

    fn static_expert(
        _descriptor: &ExpertDescriptor,
        _ctx: &ExpertContext,
    ) -> Result<ExpertFactory, String> {
        Ok(Arc::new(|| Arc::new(Static) as Arc<dyn Expert>))
    }

    fn entry(name: &str, entrypoint: Option<&str>) -> ExpertEntry {
        ExpertEntry {
            name: name.into(),
            entrypoint: entrypoint.map(String::from),
            aliases: Vec::new(),
            capabilities: vec!["general".into()],
            layer: None,
            kind: None,
            enabled: true,
            description: None,
        }
    }

    #[test]
    fn validates_key_shape() {
        let table = EntrypointTable::builtin();
        assert!(table.resolve(PROMPT_EXPERT_KEY).is_ok());
        assert!(matches!(
            table.resolve("no_colon_here"),
            Err(RegistryError::InvalidEntrypoint { .. })
        ));
        assert!(matches!(
            table.resolve("experts.prompt:"),
            Err(RegistryError::InvalidEntrypoint { .. })
        ));
        assert!(matches!(
            table.resolve("experts.missing:Nope"),
            Err(RegistryError::UnknownEntrypoint { .. })
        ));
    }

    #[test]
    fn insert_rejects_malformed_keys() {
        let mut table = EntrypointTable::new();
        assert!(table.insert("bad key", static_expert).is_err());
        assert!(table.insert("tests.fixtures:Static", static_expert).is_ok());
        assert!(table.contains("tests.fixtures:Static"));
    }

    #[test]
    fn prompt_expert_requires_llm() {
        let table = EntrypointTable::builtin();
        let descriptor = ExpertDescriptor::new("python_expert");
        let missing = table.build(PROMPT_EXPERT_KEY, &descriptor, &ExpertContext::default());
        assert!(matches!(missing, Err(RegistryError::FactoryFailed { .. })));

        let ctx = ExpertContext::with_llm(Arc::new(FixedLlm));
        let factory = table.build(PROMPT_EXPERT_KEY, &descriptor, &ctx).unwrap();
        assert_eq!(factory().name(), "python_expert");
    }

    #[test]
    fn bootstrap_skips_unresolvable_entries() {
        let mut table = EntrypointTable::builtin();
        table.insert("tests.fixtures:Static", static_expert).unwrap();
        let registry = WorkerRegistry::new();
        let ctx = ExpertContext::with_llm(Arc::new(FixedLlm));

        let entries = vec![
            entry("python_expert", Some(PROMPT_EXPERT_KEY)),
            entry("static_expert", Some("tests.fixtures:Static")),
            entry("broken_expert", Some("not a key")),
            entry("ghost_expert", Some("experts.ghost:Ghost")),
            entry("manual_expert", None),
            entry("", Some("tests.fixtures:Static")),
        ];
        let registered = registry.bootstrap(&entries, &table, &ctx);

        assert_eq!(registered, 3);
        assert!(registry.get("python", false).unwrap().factory.is_some());
        assert!(registry.get("static_expert", false).is_some());
        assert!(registry.get("broken_expert", true).is_none());
        assert!(registry.get("ghost_expert", true).is_none());
        assert!(registry.get("manual", false).unwrap().instantiate().is_none());
    }
}
