//! Generic HTTP provider client (spec §6 "Provider HTTP clients (per RLQ)").
//!
//! Translates `(method, params)` into one `POST {base_url}/{method}` request
//! and returns the parsed JSON body; non-2xx responses are classified into
//! the §7 error taxonomy via `TaskError::from_provider_status`, following
//! `adapters::embeddings::openai::OpenAiEmbeddingProvider`'s status-handling
//! pattern.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::errors::{DomainResult, TaskError};
use crate::domain::ports::provider_client::ProviderClient;

#[derive(Debug, Clone)]
pub struct HttpProviderClientConfig {
    pub name: &'static str,
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

pub struct HttpProviderClient {
    config: HttpProviderClientConfig,
    client: Arc<reqwest::Client>,
}

impl HttpProviderClient {
    pub fn new(config: HttpProviderClientConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .expect("failed to build HTTP client");
        Self { config, client: Arc::new(client) }
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    fn name(&self) -> &'static str {
        self.config.name
    }

    async fn call(&self, method: &str, params: Value) -> DomainResult<Value> {
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), method);
        let mut request = self.client.post(&url).json(&params);
        if let Some(api_key) = &self.config.api_key {
            request = request.header("Authorization", format!("Bearer {api_key}"));
        }
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TaskError::Timeout(e.to_string())
            } else {
                TaskError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TaskError::from_provider_status(status.as_u16(), body));
        }

        response.json().await.map_err(|e| TaskError::FormatError(format!("unparseable provider response: {e}")))
    }
}
