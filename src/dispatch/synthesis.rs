//! Combining expert responses into one answer.

use crate::dispatch::types::Analysis;

/// Cap on each expert response forwarded to the synthesis prompt.
const MAX_RESPONSE_CHARS: usize = 6000;

pub(crate) const PERSPECTIVES_HEADING: &str = "## Expert Perspectives";

/// One settled expert contribution, as seen by synthesis.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpertAnswer {
    pub expert: String,
    pub content: String,
}

pub(crate) fn build_synthesis_system_prompt() -> String {
    "You combine answers from several specialist experts into one response.\n\n\
     Rules:\n\
     - Merge overlapping advice and resolve contradictions explicitly\n\
     - Keep concrete steps, commands and code from the experts\n\
     - Do not invent advice none of the experts gave\n\
     - Answer the question directly; no preamble about the experts"
        .to_string()
}

pub(crate) fn build_synthesis_user_prompt(
    question: &str,
    analysis: &Analysis,
    answers: &[ExpertAnswer],
) -> String {
    let mut prompt = String::with_capacity(1024);
    prompt.push_str(&format!("Question:\n{question}\n\n"));
    prompt.push_str(&format!("Complexity: {}\n", analysis.complexity));
    if !analysis.keywords.is_empty() {
        prompt.push_str(&format!("Keywords: {}\n", analysis.keywords.join(", ")));
    }
    prompt.push_str("\nExpert responses:\n");
    for answer in answers {
        let preview: String = answer.content.chars().take(MAX_RESPONSE_CHARS).collect();
        prompt.push_str(&format!("\n[{}]\n{}\n", answer.expert, preview));
    }
    prompt
}

/// Deterministic answer used when synthesis fails. Never empty.
pub fn fallback_answer(question: &str, answers: &[ExpertAnswer]) -> String {
    let mut out = String::from(PERSPECTIVES_HEADING);
    out.push_str("\n\n");

    let answered: Vec<&ExpertAnswer> = answers
        .iter()
        .filter(|a| !a.content.trim().is_empty())
        .collect();

    if answered.is_empty() {
        out.push_str(&format!(
            "No expert was able to answer \"{}\" right now. Please try again later.\n",
            question.trim()
        ));
        return out;
    }

    for answer in answered {
        out.push_str(&format!("### {}\n\n{}\n\n", answer.expert, answer.content.trim()));
    }
    out.truncate(out.trim_end().len());
    out.push('\n');
    out
}
