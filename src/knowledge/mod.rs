//! Tenant-partitioned knowledge store.
//!
//! Three logical collections share one record shape; every read and write is
//! scoped by `tenant_id`. Components:
//! - `cache` — bounded LRU embedding cache in front of the embedding service
//! - `backend` — storage contract (`InMemoryBackend`, `LibSqlBackend`)
//! - `similarity` — cosine ranking, applied above the backend
//! - `store` — `KnowledgeStore` facade used by the dispatcher

pub mod backend;
pub mod cache;
pub mod libsql_backend;
pub mod memory;
mod migrations;
pub mod similarity;
pub mod store;

pub use backend::KnowledgeBackend;
pub use cache::{CacheStats, CachedEmbedder, EmbeddingCache};
pub use libsql_backend::LibSqlBackend;
pub use memory::InMemoryBackend;
pub use store::KnowledgeStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Arbitrary per-record metadata.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// One of the three logical knowledge partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    ExpertKnowledge,
    CollaborationHistory,
    ProblemSolutions,
}

impl Collection {
    pub const ALL: [Collection; 3] = [
        Collection::ExpertKnowledge,
        Collection::CollaborationHistory,
        Collection::ProblemSolutions,
    ];

    /// Stable name, also used as the table name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExpertKnowledge => "expert_knowledge",
            Self::CollaborationHistory => "collaboration_history",
            Self::ProblemSolutions => "problem_solutions",
        }
    }

    /// Only expert knowledge carries an `updated_at` timestamp.
    pub fn tracks_updates(&self) -> bool {
        matches!(self, Self::ExpertKnowledge)
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Collection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "expert_knowledge" => Ok(Self::ExpertKnowledge),
            "collaboration_history" => Ok(Self::CollaborationHistory),
            "problem_solutions" => Ok(Self::ProblemSolutions),
            other => Err(format!("unknown collection '{other}'")),
        }
    }
}

/// Collection-specific record fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordContent {
    ExpertKnowledge {
        expert_name: String,
        topic: String,
        content: String,
    },
    CollaborationHistory {
        interaction_id: String,
        participants: Vec<String>,
        task_description: String,
        #[serde(default)]
        outcome: Option<String>,
    },
    ProblemSolution {
        problem: String,
        solution: String,
    },
}

impl RecordContent {
    pub fn collection(&self) -> Collection {
        match self {
            Self::ExpertKnowledge { .. } => Collection::ExpertKnowledge,
            Self::CollaborationHistory { .. } => Collection::CollaborationHistory,
            Self::ProblemSolution { .. } => Collection::ProblemSolutions,
        }
    }

    /// The text that gets embedded for similarity search.
    pub fn embedding_text(&self) -> String {
        match self {
            Self::ExpertKnowledge { topic, content, .. } => format!("{topic}\n{content}"),
            Self::CollaborationHistory {
                task_description, ..
            } => task_description.clone(),
            Self::ProblemSolution { problem, solution } => format!("{problem}\n{solution}"),
        }
    }

    /// Short human-readable rendering for prompts.
    pub fn summary(&self) -> String {
        match self {
            Self::ExpertKnowledge {
                expert_name,
                topic,
                content,
            } => format!("[{expert_name}] {topic}: {content}"),
            Self::CollaborationHistory {
                participants,
                task_description,
                outcome,
                ..
            } => match outcome {
                Some(outcome) => format!(
                    "Past collaboration ({}): {task_description} -> {outcome}",
                    participants.join(", ")
                ),
                None => format!(
                    "Past collaboration ({}): {task_description}",
                    participants.join(", ")
                ),
            },
            Self::ProblemSolution { problem, solution } => {
                format!("Problem: {problem}\nSolution: {solution}")
            }
        }
    }
}

/// A persisted knowledge record. Immutable once written.
#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeRecord {
    /// Monotonically increasing within its collection.
    pub id: i64,
    pub tenant_id: String,
    pub content: RecordContent,
    pub embedding: Vec<f32>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl KnowledgeRecord {
    pub fn collection(&self) -> Collection {
        self.content.collection()
    }
}

/// A record ready to be written; the backend assigns id and timestamps.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub tenant_id: String,
    pub content: RecordContent,
    pub embedding: Vec<f32>,
    pub metadata: Metadata,
}

/// A search result enriched with its similarity score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: i64,
    pub tenant_id: String,
    pub collection: Collection,
    pub content: RecordContent,
    pub metadata: Metadata,
    pub similarity_score: f32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Record counts for one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionStats {
    pub collection: Collection,
    pub total_records: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_records: Option<usize>,
}
