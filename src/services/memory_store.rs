//! Memory Store (spec §4.5/§4.6 "MS") — retrieval and statistics for
//! [`crate::domain::models::ReasoningMemory`].
//!
//! Generic over [`MemoryRepository`], mirroring the reference codebase's
//! `services::memory_service::MemoryService<R: MemoryRepository>` pattern.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{MemoryCategory, ReasoningMemory};
use crate::domain::ports::{EmbeddingProvider, MemoryRepository};

pub struct MemoryStore<R: MemoryRepository, E: EmbeddingProvider> {
    repository: Arc<R>,
    embeddings: Arc<E>,
}

impl<R: MemoryRepository, E: EmbeddingProvider> MemoryStore<R, E> {
    pub fn new(repository: Arc<R>, embeddings: Arc<E>) -> Self {
        Self { repository, embeddings }
    }

    /// `getMemoryEnhancedContext` (spec §4.5): embed `query`, retrieve the
    /// top `top_k` memories with `successRate >= min_success_rate`
    /// (unscored memories with no usage history pass the filter), and mark
    /// each as retrieved.
    pub async fn enhanced_context(
        &self,
        query: &str,
        category_filter: Option<MemoryCategory>,
        min_success_rate: f32,
        top_k: usize,
    ) -> DomainResult<Vec<ReasoningMemory>> {
        let candidates = if self.embeddings.dimension() > 0 {
            let vector = self.embeddings.embed(query).await?;
            self.repository.search_by_embedding(&vector, top_k * 4).await?
        } else {
            self.repository.search_by_text(query, top_k * 4).await?
        };

        let mut filtered: Vec<ReasoningMemory> = candidates
            .into_iter()
            .filter(|m| category_filter.is_none_or(|c| m.category as u8 == c as u8))
            .filter(|m| m.success_rate().is_none_or(|rate| rate >= min_success_rate))
            .collect();
        filtered.truncate(top_k);

        for memory in &mut filtered {
            memory.record_retrieval();
            self.repository.update(memory).await?;
        }
        Ok(filtered)
    }

    /// Top-K repair-relevant memories for the Repair Engine (spec §4.6 step 1).
    pub async fn repair_lessons(&self, query: &str, min_success_rate: f32, top_k: usize) -> DomainResult<Vec<ReasoningMemory>> {
        let candidates = self.enhanced_context(query, None, min_success_rate, top_k * 4).await?;
        let mut lessons: Vec<ReasoningMemory> =
            candidates.into_iter().filter(|m| m.category.is_repair_relevant()).collect();
        lessons.truncate(top_k);
        Ok(lessons)
    }

    /// `updateMemoryStatistics` (spec §4.5): adjust success/failure counters
    /// for the given memories.
    pub async fn record_usage(&self, memory_ids: &[String], success: bool) -> DomainResult<()> {
        for id in memory_ids {
            if let Some(mut memory) = self.repository.get(id).await? {
                memory.record_usage(success);
                self.repository.update(&memory).await?;
            }
        }
        Ok(())
    }

    pub async fn store(&self, memory: &ReasoningMemory) -> DomainResult<()> {
        self.repository.store(memory).await
    }
}

/// Narrow facade the Executor Core depends on, so it need not be generic
/// over `MemoryStore`'s own repository/embedding-provider type parameters
/// (spec §4.5 `getMemoryEnhancedContext`/`updateMemoryStatistics`).
#[async_trait]
pub trait MemoryContext: Send + Sync {
    async fn enhanced_context(
        &self,
        query: &str,
        category_filter: Option<MemoryCategory>,
        min_success_rate: f32,
        top_k: usize,
    ) -> DomainResult<Vec<ReasoningMemory>>;

    async fn record_usage(&self, memory_ids: &[String], success: bool) -> DomainResult<()>;

    /// Repair-relevant lessons for the Repair Engine (spec §4.6 step 1).
    async fn repair_lessons(&self, query: &str, min_success_rate: f32, top_k: usize) -> DomainResult<Vec<ReasoningMemory>>;
}

#[async_trait]
impl<R: MemoryRepository, E: EmbeddingProvider> MemoryContext for MemoryStore<R, E> {
    async fn enhanced_context(
        &self,
        query: &str,
        category_filter: Option<MemoryCategory>,
        min_success_rate: f32,
        top_k: usize,
    ) -> DomainResult<Vec<ReasoningMemory>> {
        MemoryStore::enhanced_context(self, query, category_filter, min_success_rate, top_k).await
    }

    async fn record_usage(&self, memory_ids: &[String], success: bool) -> DomainResult<()> {
        MemoryStore::record_usage(self, memory_ids, success).await
    }

    async fn repair_lessons(&self, query: &str, min_success_rate: f32, top_k: usize) -> DomainResult<Vec<ReasoningMemory>> {
        MemoryStore::repair_lessons(self, query, min_success_rate, top_k).await
    }
}
