//! Null LLM service implementation, used in tests and the e2e scenarios of
//! spec §8 where no live provider is configured.

use async_trait::async_trait;

use super::llm_service::{CompletionRequest, CompletionResponse, LlmService};
use crate::domain::errors::DomainResult;

/// Returns a fixed "no match" / empty-ish JSON response so callers that
/// parse strict JSON in `json_mode` still succeed deterministically.
#[derive(Debug, Clone, Default)]
pub struct NullLlmService;

impl NullLlmService {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LlmService for NullLlmService {
    async fn complete(&self, request: CompletionRequest) -> DomainResult<CompletionResponse> {
        let text = if request.json_mode {
            r#"{"templateId": null, "confidence": "none", "reasoning": "null LLM service"}"#.to_string()
        } else {
            String::new()
        };
        Ok(CompletionResponse { text, tokens_used: 0 })
    }
}
