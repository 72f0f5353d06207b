//! Reasoning memory repository port (spec §4.6/§4.5, the DS-backed half of the Memory Store).

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::ReasoningMemory;

/// Repository interface for `ReasoningMemory` persistence.
#[async_trait]
pub trait MemoryRepository: Send + Sync {
    async fn store(&self, memory: &ReasoningMemory) -> DomainResult<()>;

    async fn get(&self, id: &str) -> DomainResult<Option<ReasoningMemory>>;

    async fn update(&self, memory: &ReasoningMemory) -> DomainResult<()>;

    /// Nearest-neighbor search over `embedding` for memory retrieval
    /// (spec §4.5 `getMemoryEnhancedContext`, §4.6 repair-lesson retrieval).
    async fn search_by_embedding(&self, query_vector: &[f32], limit: usize) -> DomainResult<Vec<ReasoningMemory>>;

    /// Fallback lexical search used when no embedding is available, via
    /// `ReasoningMemory::text_similarity`.
    async fn search_by_text(&self, query: &str, limit: usize) -> DomainResult<Vec<ReasoningMemory>>;
}
