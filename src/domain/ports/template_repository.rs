//! Template repository port (spec §4.2, the DS-backed half of the Template Repository).

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::Template;

/// Repository interface for Template persistence.
#[async_trait]
pub trait TemplateRepositoryPort: Send + Sync {
    async fn create(&self, template: &Template) -> DomainResult<()>;

    async fn get(&self, id: &str) -> DomainResult<Option<Template>>;

    /// Conditional update keyed on `version`, same optimistic-concurrency
    /// contract as [`crate::domain::ports::task_repository::TaskRepository::update`].
    async fn update(&self, template: &Template) -> DomainResult<bool>;

    async fn list_enabled(&self) -> DomainResult<Vec<Template>>;

    /// Nearest-neighbor search over `name_embedding`/`embedding` for the
    /// Template Matcher's fallback path (spec §4.3).
    async fn search_by_embedding(&self, query_vector: &[f32], limit: usize) -> DomainResult<Vec<(Template, f32)>>;

    /// Permanently remove a template (`template delete` CLI subcommand, §6A).
    async fn delete(&self, id: &str) -> DomainResult<bool>;
}
