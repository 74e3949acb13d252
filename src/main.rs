use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};

use expert_dispatch::config::{BackendKind, DispatchConfig, KnowledgeConfig, load_roster};
use expert_dispatch::dispatch::{Coordinator, DispatchRequest};
use expert_dispatch::error::Result;
use expert_dispatch::experts::{EntrypointTable, ExpertContext, ExpertEntry, WorkerRegistry};
use expert_dispatch::knowledge::{InMemoryBackend, KnowledgeBackend, KnowledgeStore, LibSqlBackend};
use expert_dispatch::llm::{
    EmbeddingProvider, HashingEmbedder, LlmConfig, OpenAiEmbeddings, create_provider,
};
use expert_dispatch::metrics::TracingMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let llm_config = LlmConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export ANTHROPIC_API_KEY=sk-ant-...  (or OPENAI_API_KEY=sk-...)");
        std::process::exit(1);
    });
    let llm = create_provider(&llm_config)?;

    eprintln!("🧠 Expert Dispatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", llm_config.model);

    // ── Knowledge store ─────────────────────────────────────────────────
    let knowledge_config = KnowledgeConfig::from_env()?;
    let embeddings: Arc<dyn EmbeddingProvider> = match std::env::var("OPENAI_API_KEY") {
        Ok(key) => Arc::new(OpenAiEmbeddings::new(
            secrecy::SecretString::from(key),
            knowledge_config.embedding_model.clone(),
            knowledge_config.embedding_dimensions,
        )),
        Err(_) => {
            eprintln!("   Embeddings: offline hashing (set OPENAI_API_KEY for remote embeddings)");
            Arc::new(HashingEmbedder::new(knowledge_config.embedding_dimensions))
        }
    };

    let backend: Arc<dyn KnowledgeBackend> = match &knowledge_config.backend {
        BackendKind::Memory => {
            eprintln!("   Knowledge: in-memory (set KNOWLEDGE_DB_PATH to persist)");
            Arc::new(InMemoryBackend::new())
        }
        BackendKind::LibSql { path } => {
            eprintln!("   Knowledge: {}", path.display());
            Arc::new(LibSqlBackend::new_local(path).await.unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {}: {}", path.display(), e);
                std::process::exit(1);
            }))
        }
    };
    let knowledge = Arc::new(KnowledgeStore::new(
        backend,
        embeddings,
        knowledge_config.cache_max_size,
    ));

    // ── Experts ─────────────────────────────────────────────────────────
    let roster = match std::env::var("EXPERTS_CONFIG_PATH") {
        Ok(path) => load_roster(std::path::Path::new(&path))?,
        Err(_) => ExpertEntry::default_roster(),
    };
    let registry = Arc::new(WorkerRegistry::new());
    let registered = registry.bootstrap(
        &roster,
        &EntrypointTable::builtin(),
        &ExpertContext::with_llm(llm.clone()),
    );
    eprintln!("   Experts: {registered} registered");

    let coordinator = Coordinator::new(registry, knowledge, llm, DispatchConfig::from_env()?)
        .with_metrics(Arc::new(TracingMetrics));

    // One-shot mode: question on the command line
    let args: Vec<String> = std::env::args().skip(1).collect();
    if !args.is_empty() {
        let response = coordinator.handle(args.join(" ")).await;
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    eprintln!("   One question (or JSON request) per line. Ctrl-D to exit.\n");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let request = parse_line(&line);
        let response = coordinator.handle(request).await;
        println!("{}", serde_json::to_string(&response)?);
    }

    Ok(())
}

/// A line is either a JSON request object or a bare question.
fn parse_line(line: &str) -> DispatchRequest {
    let trimmed = line.trim();
    if trimmed.starts_with('{')
        && let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed)
    {
        return DispatchRequest::from_value(&value);
    }
    DispatchRequest::from(trimmed)
}
