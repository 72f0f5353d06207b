//! Template Repository (spec §4.2 "TR").
//!
//! Owns the Template collection: guarantees any code reaching the sandbox
//! has been validated and that search indexes are never stale. Generic over
//! [`TemplateRepositoryPort`], mirroring the reference codebase's
//! `services::memory_service::MemoryService<R>` generic-over-port pattern.
//! The time-based read cache mirrors the reference codebase's compiled-code
//! cache keying idiom (`(templateId, updatedAt)`), generalized one level to
//! also cache hydrated `Template` reads.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::domain::errors::{DomainResult, TaskError};
use crate::domain::models::Template;
use crate::domain::ports::{EmbeddingProvider, TemplateRepositoryPort};
use crate::services::sandbox::{validate_and_prepare_script, SandboxPolicy};

const CACHE_TTL: Duration = Duration::from_secs(300);

struct CacheEntry {
    template: Template,
    cached_at: Instant,
}

pub struct TemplateRepository<R: TemplateRepositoryPort, E: EmbeddingProvider> {
    repository: Arc<R>,
    embeddings: Arc<E>,
    policy: SandboxPolicy,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl<R: TemplateRepositoryPort, E: EmbeddingProvider> TemplateRepository<R, E> {
    pub fn new(repository: Arc<R>, embeddings: Arc<E>, policy: SandboxPolicy) -> Self {
        Self { repository, embeddings, policy, cache: RwLock::new(HashMap::new()) }
    }

    /// `Get(templateId)` (spec §4.2): cached with ~5min expiry, invalidated
    /// on any write.
    pub async fn get(&self, template_id: &str) -> DomainResult<Option<Template>> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(template_id) {
                if entry.cached_at.elapsed() < CACHE_TTL {
                    return Ok(Some(entry.template.clone()));
                }
            }
        }
        let fetched = self.repository.get(template_id).await?;
        if let Some(ref template) = fetched {
            self.cache.write().await.insert(
                template_id.to_string(),
                CacheEntry { template: template.clone(), cached_at: Instant::now() },
            );
        }
        Ok(fetched)
    }

    pub async fn list_enabled(&self) -> DomainResult<Vec<Template>> {
        self.repository.list_enabled().await
    }

    /// `Create(templateId, data)` (spec §4.2): validates the script, embeds,
    /// defaults `enabled`/`testing`, writes atomically.
    pub async fn create(&self, mut template: Template) -> DomainResult<Template> {
        validate_and_prepare_script(&template.execution_script, &self.policy)
            .map_err(TaskError::SandboxPolicyError)?;
        template.mark_validated();
        template.name_embedding = self.embeddings.embed(&template.name).await?;
        template.embedding = self.embeddings.embed(&template.semantic_text()).await?;
        self.repository.create(&template).await?;
        self.invalidate(&template.id).await;
        Ok(template)
    }

    /// `Update(templateId, patch)` (spec §4.2): re-validates and re-embeds
    /// whenever `executionScript` changes; always flushes caches before
    /// acknowledging the write (the invariant in spec §4.2).
    pub async fn update_script(&self, template_id: &str, new_script: String, escaped: bool) -> DomainResult<Template> {
        let mut template = self
            .repository
            .get(template_id)
            .await?
            .ok_or_else(|| TaskError::InternalError(format!("template {template_id} not found")))?;

        validate_and_prepare_script(&new_script, &self.policy).map_err(TaskError::SandboxPolicyError)?;
        template.mark_script_changed(new_script, escaped);
        template.mark_validated();
        template.name_embedding = self.embeddings.embed(&template.name).await?;
        template.embedding = self.embeddings.embed(&template.semantic_text()).await?;

        self.invalidate(template_id).await;
        let applied = self.repository.update(&template).await?;
        if !applied {
            return Err(TaskError::InternalError(format!(
                "concurrent update conflict on template {template_id}"
            )));
        }
        Ok(template)
    }

    pub async fn record_repair(&self, template_id: &str, task_id: &str, error_kind: &str, token_cost: u64) -> DomainResult<Template> {
        let mut template = self
            .repository
            .get(template_id)
            .await?
            .ok_or_else(|| TaskError::InternalError(format!("template {template_id} not found")))?;
        template.record_repair(task_id, error_kind, token_cost);
        template.updated_at = Utc::now();
        self.invalidate(template_id).await;
        self.repository.update(&template).await?;
        Ok(template)
    }

    /// `Delete(templateId)`, operational-only (`template delete` CLI subcommand, §6A).
    pub async fn delete(&self, template_id: &str) -> DomainResult<bool> {
        self.invalidate(template_id).await;
        self.repository.delete(template_id).await
    }

    async fn invalidate(&self, template_id: &str) {
        self.cache.write().await.remove(template_id);
    }
}

/// Narrow facade the Repair Engine depends on, so it need not be generic
/// over `TemplateRepository`'s own repository/embedding-provider type
/// parameters (spec §4.6 step 6: "write the patched script back through
/// TR").
#[async_trait]
pub trait TemplateWriter: Send + Sync {
    async fn get(&self, template_id: &str) -> DomainResult<Option<Template>>;
    async fn update_script(&self, template_id: &str, new_script: String, escaped: bool) -> DomainResult<Template>;
    async fn record_repair(&self, template_id: &str, task_id: &str, error_kind: &str, token_cost: u64) -> DomainResult<Template>;
}

#[async_trait]
impl<R: TemplateRepositoryPort, E: EmbeddingProvider> TemplateWriter for TemplateRepository<R, E> {
    async fn get(&self, template_id: &str) -> DomainResult<Option<Template>> {
        TemplateRepository::get(self, template_id).await
    }

    async fn update_script(&self, template_id: &str, new_script: String, escaped: bool) -> DomainResult<Template> {
        TemplateRepository::update_script(self, template_id, new_script, escaped).await
    }

    async fn record_repair(&self, template_id: &str, task_id: &str, error_kind: &str, token_cost: u64) -> DomainResult<Template> {
        TemplateRepository::record_repair(self, template_id, task_id, error_kind, token_cost).await
    }
}
