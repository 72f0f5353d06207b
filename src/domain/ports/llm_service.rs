//! LLM service port ("LS" in spec §2), used by the Template Matcher (§4.3),
//! Executor Core (§4.5), and Repair Engine (§4.6) for generation/classification.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;

/// One chat-style completion request. `json_mode` asks the provider to
/// constrain output to valid JSON where supported (spec §4.3 "require a
/// strict JSON response").
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub json_mode: bool,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub text: String,
    pub tokens_used: u64,
}

#[async_trait]
pub trait LlmService: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> DomainResult<CompletionResponse>;
}
