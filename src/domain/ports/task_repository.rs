//! Task repository port (spec §4.8, the DS-backed half of the Task Orchestrator).

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Task, TaskStatus};

/// Filter criteria for listing tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub template_id: Option<String>,
    pub created_by: Option<String>,
}

/// Repository interface for Task persistence (spec's DS port).
///
/// `update` must perform an optimistic-concurrency conditional update keyed
/// on `version` (spec §5 "conditional update on the `version` column") —
/// implementations return `Ok(false)` rather than erroring when the stored
/// version has moved on, so the orchestrator can treat a lost race as a
/// no-op rather than a failure.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create(&self, task: &Task) -> DomainResult<()>;

    async fn get(&self, id: &str) -> DomainResult<Option<Task>>;

    /// Conditional update: succeeds only if the stored row's `version`
    /// still matches `task.version - 1` (i.e. no one else updated it since
    /// this `task` was read). Returns whether the write was applied.
    async fn update(&self, task: &Task) -> DomainResult<bool>;

    async fn list(&self, filter: TaskFilter) -> DomainResult<Vec<Task>>;

    async fn list_by_status(&self, status: TaskStatus) -> DomainResult<Vec<Task>>;
}
