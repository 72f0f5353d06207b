//! HTTP-upload object store adapter (spec §6A: production backend).
//!
//! POSTs the bytes to `{base_url}/{key}` and trusts the configured
//! `base_url` as the public URL prefix, mirroring the request/response shape
//! of `adapters::embeddings::openai::OpenAiEmbeddingProvider`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::errors::{DomainResult, TaskError};
use crate::domain::ports::object_store::ObjectStore;

#[derive(Debug, Clone)]
pub struct HttpObjectStoreConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

pub struct HttpObjectStore {
    config: HttpObjectStoreConfig,
    client: Arc<reqwest::Client>,
}

impl HttpObjectStore {
    pub fn new(config: HttpObjectStoreConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .expect("failed to build HTTP client");
        Self { config, client: Arc::new(client) }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(&self, key: &str, content_type: &str, bytes: Vec<u8>) -> DomainResult<String> {
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), key.trim_start_matches('/'));
        let mut request = self.client.put(&url).header("Content-Type", content_type).body(bytes);
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
        Ok(url)
    }

    async fn get(&self, key: &str) -> DomainResult<Option<Vec<u8>>> {
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), key.trim_start_matches('/'));
        let response = self.client.get(&url).send().await.map_err(|e| TaskError::Network(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(TaskError::from_provider_status(response.status().as_u16(), String::new()));
        }
        let bytes = response.bytes().await.map_err(|e| TaskError::Network(e.to_string()))?;
        Ok(Some(bytes.to_vec()))
    }
}
