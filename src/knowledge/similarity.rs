//! Cosine ranking over tenant-scoped records.

use std::cmp::Ordering;

use crate::knowledge::{KnowledgeRecord, SearchHit};

/// Cosine similarity. Mismatched dimensions or zero vectors score 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Rank records by similarity to `query`, descending, dropping anything below
/// `threshold`, keeping at most `top_k`. Ties go to the newer record.
pub fn rank(
    records: Vec<KnowledgeRecord>,
    query: &[f32],
    top_k: usize,
    threshold: f32,
) -> Vec<SearchHit> {
    let mut hits: Vec<SearchHit> = records
        .into_iter()
        .filter_map(|record| {
            let score = cosine_similarity(query, &record.embedding);
            if score.is_nan() || score < threshold {
                return None;
            }
            Some(SearchHit {
                id: record.id,
                collection: record.collection(),
                tenant_id: record.tenant_id,
                content: record.content,
                metadata: record.metadata,
                similarity_score: score,
                created_at: record.created_at,
                updated_at: record.updated_at,
            })
        })
        .collect();

    hits.sort_by(|a, b| {
        b.similarity_score
            .partial_cmp(&a.similarity_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.id.cmp(&a.id))
    });
    hits.truncate(top_k);
    hits
}
