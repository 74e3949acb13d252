//! Question analysis: prompt construction and response parsing.

use std::sync::Arc;

use crate::dispatch::types::{Analysis, Complexity};
use crate::experts::{ExpertDescriptor, normalize_name};

/// Cap on the question length sent for analysis.
const MAX_QUESTION_CHARS: usize = 4000;

// ── Prompt construction ─────────────────────────────────────────────

/// Build the analysis system prompt, listing the experts that can be chosen.
pub(crate) fn build_analysis_system_prompt(available: &[Arc<ExpertDescriptor>]) -> String {
    let mut prompt = String::from(
        "You route technical questions to a panel of specialist experts.\n\n\
         Decide which experts should answer, how complex the question is, and which \
         keywords describe it.\n\n\
         Respond with ONLY a JSON object:\n\
         {\"required_experts\": [\"...\"], \"complexity\": \"low|medium|high\", \
         \"keywords\": [\"...\"], \"reasoning\": \"...\"}\n\n\
         Rules:\n\
         - Pick between one and three experts, most relevant first\n\
         - Use expert names exactly as listed\n\
         - Keep reasoning to one sentence\n",
    );

    if !available.is_empty() {
        prompt.push_str("\nAvailable experts:\n");
        for descriptor in available {
            prompt.push_str(&format!("- {}", descriptor.name));
            if let Some(description) = &descriptor.description {
                prompt.push_str(&format!(": {description}"));
            }
            if !descriptor.capabilities.is_empty() {
                let caps: Vec<&str> = descriptor.capabilities.iter().map(String::as_str).collect();
                prompt.push_str(&format!(" [{}]", caps.join(", ")));
            }
            prompt.push('\n');
        }
    }
    prompt
}

pub(crate) fn build_analysis_user_prompt(question: &str) -> String {
    let preview: String = question.chars().take(MAX_QUESTION_CHARS).collect();
    format!("Question:\n{preview}")
}

// ── Response parsing ────────────────────────────────────────────────

/// LLM analysis response structure.
#[derive(Debug, serde::Deserialize)]
struct AnalysisResponse {
    #[serde(default, alias = "experts")]
    required_experts: Vec<String>,
    #[serde(default)]
    complexity: String,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    reasoning: String,
}

/// Parse the LLM analysis into an `Analysis`.
///
/// Expert names are normalised and de-duplicated, keeping first-seen order.
/// A response that names no experts is rejected.
pub(crate) fn parse_analysis(raw: &str) -> Result<Analysis, String> {
    let json_str = extract_json_object(raw);
    let response: AnalysisResponse =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    let mut required_experts: Vec<String> = Vec::new();
    for name in &response.required_experts {
        let name = normalize_name(name);
        if !name.is_empty() && !required_experts.contains(&name) {
            required_experts.push(name);
        }
    }
    if required_experts.is_empty() {
        return Err("analysis named no experts".into());
    }

    let keywords = response
        .keywords
        .into_iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect();

    Ok(Analysis {
        required_experts,
        complexity: Complexity::parse_lenient(&response.complexity),
        keywords,
        reasoning: if response.reasoning.trim().is_empty() {
            "No reasoning given".into()
        } else {
            response.reasoning.trim().to_string()
        },
        fallback: false,
    })
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
pub(crate) fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    for fence in ["```json", "```"] {
        if let Some(start) = trimmed.find(fence) {
            let after = &trimmed[start + fence.len()..];
            if let Some(end) = after.find("```") {
                let inner = after[..end].trim();
                if inner.starts_with('{') {
                    return inner.to_string();
                }
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
