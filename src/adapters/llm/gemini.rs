//! Gemini-style LLM service adapter (spec §6 "LLM Service contract"),
//! following `adapters::embeddings::openai::OpenAiEmbeddingProvider`'s shape:
//! config struct with an env-var API-key fallback, `Arc<reqwest::Client>`,
//! and JSON request/response types private to this module.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::errors::{DomainResult, TaskError};
use crate::domain::ports::llm_service::{CompletionRequest, CompletionResponse, LlmService};

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    /// Falls back to `GEMINI_API_KEY` env var.
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            model: "gemini-2.0-flash".to_string(),
            timeout_secs: 60,
        }
    }
}

impl GeminiConfig {
    fn get_api_key(&self) -> DomainResult<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("GEMINI_API_KEY").ok())
            .ok_or_else(|| TaskError::AuthFailure("GEMINI_API_KEY not set and no api_key configured".to_string()))
    }
}

pub struct GeminiLlmService {
    config: GeminiConfig,
    client: Arc<reqwest::Client>,
}

impl GeminiLlmService {
    pub fn new(config: GeminiConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .expect("failed to build HTTP client");
        Self { config, client: Arc::new(client) }
    }
}

#[async_trait]
impl LlmService for GeminiLlmService {
    async fn complete(&self, request: CompletionRequest) -> DomainResult<CompletionResponse> {
        let api_key = self.config.get_api_key()?;
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.config.base_url, self.config.model, api_key
        );

        let mut generation_config = GenerationConfig { response_mime_type: None };
        if request.json_mode {
            generation_config.response_mime_type = Some("application/json".to_string());
        }

        let body = GenerateRequest {
            system_instruction: Content { parts: vec![Part { text: request.system_prompt }] },
            contents: vec![Content { parts: vec![Part { text: request.user_prompt }] }],
            generation_config,
        };

        let response = self.client.post(&url).json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                TaskError::Timeout(e.to_string())
            } else {
                TaskError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TaskError::from_provider_status(status.as_u16(), text));
        }

        let parsed: GenerateResponse =
            response.json().await.map_err(|e| TaskError::FormatError(format!("unparseable Gemini response: {e}")))?;

        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| TaskError::FormatError("Gemini response had no candidates".to_string()))?;

        let tokens_used = parsed.usage_metadata.map(|u| u.total_token_count).unwrap_or(0);
        Ok(CompletionResponse { text, tokens_used })
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    system_instruction: Content,
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none", rename = "responseMimeType")]
    response_mime_type: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(rename = "totalTokenCount")]
    total_token_count: u64,
}
