//! Null embedding provider implementation.
//!
//! Used in tests and for deployments where the Template Matcher and Memory
//! Store fall back to lexical scoring only (spec §4.3/§4.5 fallback paths).

use async_trait::async_trait;

use super::embedding::{EmbeddingInput, EmbeddingOutput, EmbeddingProvider};
use crate::domain::errors::DomainResult;

/// A no-op embedding provider that returns empty vectors.
#[derive(Debug, Clone, Default)]
pub struct NullEmbeddingProvider;

impl NullEmbeddingProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EmbeddingProvider for NullEmbeddingProvider {
    fn name(&self) -> &'static str {
        "null"
    }

    fn dimension(&self) -> usize {
        0
    }

    async fn embed(&self, _text: &str) -> DomainResult<Vec<f32>> {
        Ok(Vec::new())
    }

    async fn embed_batch(&self, inputs: &[EmbeddingInput]) -> DomainResult<Vec<EmbeddingOutput>> {
        Ok(inputs
            .iter()
            .map(|input| EmbeddingOutput {
                id: input.id.clone(),
                vector: Vec::new(),
            })
            .collect())
    }

    fn max_batch_size(&self) -> usize {
        0
    }
}
