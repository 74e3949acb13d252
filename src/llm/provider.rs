//! Completion provider abstraction.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single role/content message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    Unknown,
}

/// One text completion plus token usage.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub finish_reason: FinishReason,
    pub response_id: Option<String>,
}

impl CompletionResponse {
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// A text-completion service.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Model identifier.
    fn model_name(&self) -> &str;

    /// (input, output) cost per token.
    fn cost_per_token(&self) -> (Decimal, Decimal);

    /// Run a completion. Fails on network/auth errors.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;
}

/// Estimate the cost of a completion using the provider's token pricing.
pub fn completion_cost(provider: &dyn LlmProvider, response: &CompletionResponse) -> Decimal {
    let (input, output) = provider.cost_per_token();
    input * Decimal::from(response.input_tokens) + output * Decimal::from(response.output_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PricedLlm;

    #[async_trait]
    impl LlmProvider for PricedLlm {
        fn model_name(&self) -> &str {
            "priced"
        }

        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (Decimal::new(1, 6), Decimal::new(5, 6))
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            unimplemented!("pricing only")
        }
    }

    #[test]
    fn request_builder_sets_parameters() {
        let request = CompletionRequest::new(vec![ChatMessage::user("hi")])
            .with_temperature(0.2)
            .with_max_tokens(64);
        assert_eq!(request.temperature, Some(0.2));
        assert_eq!(request.max_tokens, Some(64));
        assert_eq!(request.messages[0].role, Role::User);
    }

    #[test]
    fn cost_uses_both_token_counts() {
        let response = CompletionResponse {
            content: "ok".into(),
            input_tokens: 1_000,
            output_tokens: 200,
            finish_reason: FinishReason::Stop,
            response_id: None,
        };
        // 1000 * 0.000001 + 200 * 0.000005 = 0.002
        assert_eq!(completion_cost(&PricedLlm, &response), Decimal::new(2, 3));
        assert_eq!(response.total_tokens(), 1_200);
    }
}
