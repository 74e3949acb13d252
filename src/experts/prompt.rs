//! `PromptExpert`: a specialist backed by the completion service.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ExpertError;
use crate::experts::registry::ExpertDescriptor;
use crate::experts::{Expert, ExpertRequest, ExpertResponse};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};

const MAX_TOKENS: u32 = 1024;
const TEMPERATURE: f32 = 0.4;
/// Cap on retrieved items folded into the prompt.
const MAX_KNOWLEDGE_ITEMS: usize = 5;

pub struct PromptExpert {
    name: String,
    system_prompt: String,
    llm: Arc<dyn LlmProvider>,
}

impl PromptExpert {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>, llm: Arc<dyn LlmProvider>) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            llm,
        }
    }

    /// Derive the persona from the descriptor's name, description and capabilities.
    pub fn from_descriptor(descriptor: &ExpertDescriptor, llm: Arc<dyn LlmProvider>) -> Self {
        let title = descriptor.name.replace('_', " ");
        let mut prompt = format!("You are the {title}, one specialist in a panel of experts.");
        if let Some(description) = &descriptor.description {
            prompt.push_str(&format!(" Your focus: {description}."));
        }
        if !descriptor.capabilities.is_empty() {
            let caps: Vec<&str> = descriptor.capabilities.iter().map(String::as_str).collect();
            prompt.push_str(&format!(" Areas of expertise: {}.", caps.join(", ")));
        }
        prompt.push_str(
            " Answer only from your own perspective, be concrete, and say so when \
             the question is outside your area.",
        );
        Self::new(descriptor.name.clone(), prompt, llm)
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    fn user_prompt(request: &ExpertRequest) -> String {
        let knowledge: Vec<&str> = request
            .context
            .get("knowledge")
            .and_then(|k| k.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get("summary").and_then(|s| s.as_str()))
                    .take(MAX_KNOWLEDGE_ITEMS)
                    .collect()
            })
            .unwrap_or_default();

        if knowledge.is_empty() {
            return request.question.clone();
        }
        let mut prompt = String::from("Relevant prior knowledge:\n");
        for item in knowledge {
            prompt.push_str("- ");
            prompt.push_str(item);
            prompt.push('\n');
        }
        prompt.push_str("\nQuestion: ");
        prompt.push_str(&request.question);
        prompt
    }
}

#[async_trait]
impl Expert for PromptExpert {
    fn name(&self) -> &str {
        &self.name
    }

    async fn respond(&self, request: &ExpertRequest) -> Result<ExpertResponse, ExpertError> {
        let completion = CompletionRequest::new(vec![
            ChatMessage::system(&self.system_prompt),
            ChatMessage::user(Self::user_prompt(request)),
        ])
        .with_max_tokens(MAX_TOKENS)
        .with_temperature(TEMPERATURE);

        let response = self.llm.complete(completion).await?;
        let content = response.content.trim();
        if content.is_empty() {
            return Err(ExpertError::Failed {
                name: self.name.clone(),
                reason: "empty completion".to_string(),
            });
        }

        Ok(ExpertResponse::new(content).with_metadata(serde_json::json!({
            "model": self.llm.model_name(),
            "input_tokens": response.input_tokens,
            "output_tokens": response.output_tokens,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{CompletionResponse, FinishReason};
    use rust_decimal::Decimal;
    use std::sync::Mutex;

    /// Records the last request and answers with a fixed string.
    struct RecordingLlm {
        answer: String,
        last: Mutex<Option<CompletionRequest>>,
    }

    impl RecordingLlm {
        fn new(answer: &str) -> Arc<Self> {
            Arc::new(Self {
                answer: answer.to_string(),
                last: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for RecordingLlm {
        fn model_name(&self) -> &str {
            "recording"
        }

        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (Decimal::ZERO, Decimal::ZERO)
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            *self.last.lock().unwrap() = Some(request);
            Ok(CompletionResponse {
                content: self.answer.clone(),
                input_tokens: 12,
                output_tokens: 3,
                finish_reason: FinishReason::Stop,
                response_id: None,
            })
        }
    }

    fn request(context: serde_json::Value) -> ExpertRequest {
        ExpertRequest {
            question: "How do I speed up my queries?".into(),
            tenant_id: "t1".into(),
            context,
        }
    }

    #[test]
    fn persona_comes_from_descriptor() {
        let descriptor = ExpertDescriptor::new("database_expert")
            .with_description("Schema design and query tuning")
            .with_capability("sql");
        let expert = PromptExpert::from_descriptor(&descriptor, RecordingLlm::new("x"));
        assert!(expert.system_prompt().contains("database expert"));
        assert!(expert.system_prompt().contains("query tuning"));
        assert!(expert.system_prompt().contains("sql"));
        assert_eq!(expert.name(), "database_expert");
    }

    #[tokio::test]
    async fn folds_knowledge_into_prompt() {
        let llm = RecordingLlm::new("  Add an index.  ");
        let expert = PromptExpert::new("database_expert", "persona", llm.clone());
        let context = serde_json::json!({
            "knowledge": [{"summary": "Problem: Slow queries\nSolution: Add an index"}]
        });

        let response = expert.respond(&request(context)).await.unwrap();
        assert_eq!(response.content, "Add an index.");
        assert_eq!(response.metadata["output_tokens"], 3);

        let sent = llm.last.lock().unwrap().clone().unwrap();
        assert_eq!(sent.messages[0].content, "persona");
        assert!(sent.messages[1].content.contains("Slow queries"));
        assert!(sent.messages[1].content.ends_with("How do I speed up my queries?"));
    }

    #[tokio::test]
    async fn plain_question_without_knowledge() {
        let llm = RecordingLlm::new("ok");
        let expert = PromptExpert::new("x", "persona", llm.clone());
        expert.respond(&request(serde_json::Value::Null)).await.unwrap();
        let sent = llm.last.lock().unwrap().clone().unwrap();
        assert_eq!(sent.messages[1].content, "How do I speed up my queries?");
    }

    #[tokio::test]
    async fn empty_completion_is_an_error() {
        let expert = PromptExpert::new("x", "persona", RecordingLlm::new("   "));
        let result = expert.respond(&request(serde_json::Value::Null)).await;
        assert!(matches!(result, Err(ExpertError::Failed { .. })));
    }
}
