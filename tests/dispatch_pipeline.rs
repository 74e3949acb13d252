//! End-to-end tests over the public API with stub services.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;

use expert_dispatch::config::DispatchConfig;
use expert_dispatch::dispatch::{
    CollaborationStatus, Coordinator, DispatchRequest, ExpertOutcome, ResponseStatus, SkipReason,
};
use expert_dispatch::error::{EmbeddingError, ExpertError, LlmError};
use expert_dispatch::experts::{
    EntrypointTable, Expert, ExpertContext, ExpertDescriptor, ExpertEntry, ExpertRequest,
    ExpertResponse, WorkerRegistry,
};
use expert_dispatch::knowledge::cache::cache_key;
use expert_dispatch::knowledge::{
    Collection, EmbeddingCache, InMemoryBackend, KnowledgeStore, LibSqlBackend, RecordContent,
};
use expert_dispatch::llm::{
    CompletionRequest, CompletionResponse, EmbeddingProvider, FinishReason, LlmProvider,
};

// ── Stubs ───────────────────────────────────────────────────────────

/// Routes every question to the experts named in `analysis`.
struct StubLlm {
    analysis: String,
}

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        (Decimal::ZERO, Decimal::ZERO)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let system = &request.messages[0].content;
        let content = if system.contains("route technical questions") {
            self.analysis.clone()
        } else if system.contains("combine answers") {
            let user = &request.messages[1].content;
            format!("Combined: {}", user.lines().last().unwrap_or_default())
        } else {
            "Expert view from the prompt expert.".to_string()
        };
        Ok(CompletionResponse {
            content,
            input_tokens: 20,
            output_tokens: 10,
            finish_reason: FinishReason::Stop,
            response_id: None,
        })
    }
}

/// Keyword-axis embedder that counts provider calls.
struct KeywordEmbedder {
    calls: AtomicUsize,
}

const AXES: &[&str] = &["quer", "index", "slow", "perform", "deploy", "python"];

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keywords"
    }

    fn dimensions(&self) -> usize {
        AXES.len()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|t| {
                let lower = t.to_lowercase();
                AXES.iter()
                    .map(|axis| if lower.contains(axis) { 1.0 } else { 0.0 })
                    .collect()
            })
            .collect())
    }
}

enum Mode {
    Answer(&'static str),
    Fail,
    Sleep(Duration),
}

struct StubExpert {
    name: &'static str,
    mode: Mode,
}

#[async_trait]
impl Expert for StubExpert {
    fn name(&self) -> &str {
        self.name
    }

    async fn respond(&self, _request: &ExpertRequest) -> Result<ExpertResponse, ExpertError> {
        match &self.mode {
            Mode::Answer(text) => Ok(ExpertResponse::new(*text)),
            Mode::Fail => Err(ExpertError::Failed {
                name: self.name.to_string(),
                reason: "refused".into(),
            }),
            Mode::Sleep(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(ExpertResponse::new("late"))
            }
        }
    }
}

fn expert(name: &'static str, mode: Mode) -> ExpertDescriptor {
    ExpertDescriptor::new(name).with_instance(Arc::new(StubExpert { name, mode }))
}

fn keyword_store() -> (Arc<KnowledgeStore>, Arc<KeywordEmbedder>) {
    let embedder = Arc::new(KeywordEmbedder {
        calls: AtomicUsize::new(0),
    });
    let store = KnowledgeStore::new(Arc::new(InMemoryBackend::new()), embedder.clone(), 64);
    (Arc::new(store), embedder)
}

fn coordinator(analysis: &str, registry: Arc<WorkerRegistry>) -> (Coordinator, Arc<KnowledgeStore>) {
    let (store, _) = keyword_store();
    let config = DispatchConfig {
        default_experts: vec!["general_expert".into()],
        expert_timeout: Duration::from_millis(150),
        retrieval_threshold: 0.1,
        ..Default::default()
    };
    let llm = Arc::new(StubLlm {
        analysis: analysis.to_string(),
    });
    (Coordinator::new(registry, store.clone(), llm, config), store)
}

// ── Pipeline ────────────────────────────────────────────────────────

#[tokio::test]
async fn every_question_gets_non_empty_content() {
    let registry = Arc::new(WorkerRegistry::new());
    registry
        .register(expert("general_expert", Mode::Answer("Start simple.")))
        .unwrap();
    let (coordinator, _) = coordinator("garbage", registry);

    for question in ["?", "How do I deploy?", "x", "Ünïcödé question"] {
        let response = coordinator.handle(question).await;
        assert_eq!(response.status(), ResponseStatus::Success, "{question}");
        assert!(!response.content.trim().is_empty(), "{question}");
    }
}

#[tokio::test]
async fn whitespace_question_is_no_input() {
    let (coordinator, store) = coordinator("{}", Arc::new(WorkerRegistry::new()));

    let response = coordinator
        .handle(&serde_json::json!({"text": " \t\n", "tenant_id": "t1"}))
        .await;
    assert_eq!(response.status(), ResponseStatus::NoInput);
    assert!(response.metadata.interaction_id.is_none());
    assert_eq!(store.cache_stats().misses, 0);
    assert!(coordinator.collaborations().is_empty().await);
}

#[tokio::test]
async fn partial_failure_still_completes() {
    let registry = Arc::new(WorkerRegistry::new());
    registry
        .register(expert("fast_expert", Mode::Answer("Cache the results.")))
        .unwrap();
    registry.register(expert("failing_expert", Mode::Fail)).unwrap();
    registry
        .register(expert("slow_expert", Mode::Sleep(Duration::from_secs(10))))
        .unwrap();
    let (coordinator, _) = coordinator(
        r#"{"required_experts": ["fast", "failing", "slow"], "complexity": "high"}"#,
        registry,
    );

    let response = coordinator.handle("Speed up my API").await;
    assert_eq!(response.status(), ResponseStatus::Success);
    assert_eq!(
        response.metadata.collaboration_status,
        Some(CollaborationStatus::Completed)
    );
    assert!(response.content.contains("Cache the results."));

    let state = coordinator
        .collaborations()
        .get(response.metadata.interaction_id.unwrap())
        .await
        .unwrap();
    assert_eq!(state.experts["fast_expert"].outcome, ExpertOutcome::Succeeded);
    assert_eq!(state.experts["failing_expert"].outcome, ExpertOutcome::Failed);
    assert_eq!(state.experts["slow_expert"].outcome, ExpertOutcome::TimedOut);
}

#[tokio::test]
async fn disabled_expert_is_skipped_not_failed() {
    let registry = Arc::new(WorkerRegistry::new());
    registry
        .register(expert("python_expert", Mode::Answer("Use a venv.")).with_capability("python"))
        .unwrap();
    registry
        .register(expert("general_expert", Mode::Answer("Read the docs.")))
        .unwrap();
    registry.disable("python").unwrap();

    assert!(registry.select_by_capability("python", None).is_empty());
    assert!(registry.get("python_expert", true).is_some());

    let (coordinator, _) = coordinator(
        r#"{"required_experts": ["python_expert", "general_expert"]}"#,
        registry,
    );
    let response = coordinator.handle("Packaging help").await;
    assert_eq!(response.metadata.experts_involved, vec!["general_expert"]);
    assert_eq!(response.metadata.experts_skipped.len(), 1);
    assert_eq!(response.metadata.experts_skipped[0].reason, SkipReason::Disabled);
}

#[tokio::test]
async fn answers_accumulate_per_tenant() {
    let registry = Arc::new(WorkerRegistry::new());
    registry
        .register(expert("database_expert", Mode::Answer("Add an index.")))
        .unwrap();
    let (coordinator, store) = coordinator(r#"{"required_experts": ["database"]}"#, registry);

    let first = coordinator
        .handle(DispatchRequest::new("Slow queries on orders").with_tenant("acme"))
        .await;
    assert_eq!(first.metadata.knowledge_used, 0);

    let second = coordinator
        .handle(DispatchRequest::new("Slow queries on orders").with_tenant("acme"))
        .await;
    assert!(second.metadata.knowledge_used > 0);

    let other = coordinator
        .handle(DispatchRequest::new("Slow queries on orders").with_tenant("globex"))
        .await;
    assert_eq!(other.metadata.knowledge_used, 0);

    let stats = store
        .get_stats(Collection::ProblemSolutions, Some("acme"))
        .await
        .unwrap();
    assert_eq!(stats.tenant_records, Some(2));
    assert_eq!(stats.total_records, 3);
}

#[tokio::test]
async fn roster_bootstrap_drives_prompt_experts() {
    let llm: Arc<dyn LlmProvider> = Arc::new(StubLlm {
        analysis: r#"{"required_experts": ["rust"]}"#.into(),
    });
    let registry = Arc::new(WorkerRegistry::new());
    let roster = ExpertEntry::default_roster();
    let registered = registry.bootstrap(
        &roster,
        &EntrypointTable::builtin(),
        &ExpertContext::with_llm(llm.clone()),
    );
    assert_eq!(registered, roster.len());

    let (store, _) = keyword_store();
    let coordinator = Coordinator::new(registry, store, llm, DispatchConfig::default());
    let response = coordinator.handle("Lifetimes in async traits?").await;
    assert_eq!(response.metadata.experts_involved, vec!["rust_expert"]);
    assert!(response.content.starts_with("Combined:"));
}

// ── Registry ────────────────────────────────────────────────────────

#[test]
fn python_expert_gets_python_alias() {
    let registry = WorkerRegistry::new();
    registry.register(ExpertDescriptor::new("python_expert")).unwrap();
    let a = registry.get("python", false).unwrap();
    let b = registry.get("python_expert", false).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
}

#[test]
fn claimed_alias_is_not_overridden() {
    let registry = WorkerRegistry::new();
    registry
        .register(ExpertDescriptor::new("legacy_expert").with_alias("python"))
        .unwrap();
    registry.register(ExpertDescriptor::new("python_expert")).unwrap();
    assert_eq!(registry.get("python", false).unwrap().name, "legacy_expert");
}

// ── Knowledge ───────────────────────────────────────────────────────

#[tokio::test]
async fn stored_solution_is_found_by_related_query() {
    let (store, _) = keyword_store();
    let id = store
        .store(
            "t1",
            RecordContent::ProblemSolution {
                problem: "Slow queries".into(),
                solution: "Add an index".into(),
            },
            None,
            None,
        )
        .await
        .unwrap();

    let hits = store
        .search(Collection::ProblemSolutions, "t1", "query performance", 3, 0.1)
        .await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, id);
    assert!(hits[0].similarity_score > 0.1);
    assert!(matches!(hits[0].content, RecordContent::ProblemSolution { .. }));
}

#[tokio::test]
async fn delete_by_tenant_leaves_others() {
    let backend = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let embedder = Arc::new(KeywordEmbedder {
        calls: AtomicUsize::new(0),
    });
    let store = KnowledgeStore::new(backend, embedder, 64);
    for tenant in ["t1", "t1", "t2"] {
        store
            .store(
                tenant,
                RecordContent::ProblemSolution {
                    problem: "Slow deploys".into(),
                    solution: "Cache layers".into(),
                },
                None,
                None,
            )
            .await
            .unwrap();
    }

    assert_eq!(
        store
            .delete_by_tenant(Collection::ProblemSolutions, "t1")
            .await
            .unwrap(),
        2
    );
    let t1 = store
        .get_stats(Collection::ProblemSolutions, Some("t1"))
        .await
        .unwrap();
    let t2 = store
        .get_stats(Collection::ProblemSolutions, Some("t2"))
        .await
        .unwrap();
    assert_eq!(t1.tenant_records, Some(0));
    assert_eq!(t2.tenant_records, Some(1));
}

#[tokio::test]
async fn duplicate_text_hits_the_cache() {
    let (store, embedder) = keyword_store();
    let content = RecordContent::ProblemSolution {
        problem: "Slow queries".into(),
        solution: "Add an index".into(),
    };
    store.store("t1", content.clone(), None, None).await.unwrap();
    store.store("t1", content, None, None).await.unwrap();

    assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.cache_stats().hits, 1);
}

#[test]
fn lru_evicts_first_untouched_key() {
    let cache = EmbeddingCache::new(3);
    let keys: Vec<_> = (0..4)
        .map(|i| cache_key(&format!("text {i}"), "model"))
        .collect();
    for key in &keys {
        cache.insert(*key, vec![1.0]);
    }

    assert_eq!(cache.len(), 3);
    assert!(cache.get(&keys[0]).is_none());
    assert!(cache.get(&keys[3]).is_some());
    let stats = cache.stats();
    assert_eq!((stats.hits, stats.misses), (1, 1));
}
