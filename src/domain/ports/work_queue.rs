//! Work queue port (spec §2/§6A, "WQ" — durable dispatch queue).
//!
//! The orchestrator pushes a task id for dispatch; an in-process poller
//! pops ready entries and hands them to the Executor Core. Visibility
//! timeout protects against a crashed worker re-delivering forever, but the
//! real defense against double-execution is the conditional `version`
//! update on [`crate::domain::ports::task_repository::TaskRepository::update`]
//! (SPEC_FULL.md §9 decision 4).

use async_trait::async_trait;

use crate::domain::errors::DomainResult;

/// A dequeued unit of work: the task id plus a receipt needed to ack/nack it.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub task_id: String,
    pub receipt: String,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue a task id for dispatch at the given priority (higher = sooner).
    async fn enqueue(&self, task_id: &str, priority: i32) -> DomainResult<()>;

    /// Pop up to `limit` ready items, marking them invisible for
    /// `visibility_timeout_secs`.
    async fn dequeue(&self, limit: usize, visibility_timeout_secs: u64) -> DomainResult<Vec<WorkItem>>;

    /// Acknowledge successful processing, removing the item permanently.
    async fn ack(&self, receipt: &str) -> DomainResult<()>;

    /// Return an item to the queue immediately (e.g. on cancellation).
    async fn nack(&self, receipt: &str) -> DomainResult<()>;
}
