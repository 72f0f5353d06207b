//! SQLite-backed Work Queue (spec §2/§6A "WQ").
//!
//! A durable deliveries table claimed by an in-process poller, following the
//! reference codebase's polling-loop idiom (`services::merge_queue`): claim
//! due rows by pushing `visible_at` out by the visibility timeout, delete on
//! `ack`, reset `visible_at` to now on `nack`.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::ports::work_queue::{WorkItem, WorkQueue};

pub struct SqliteWorkQueue {
    pool: SqlitePool,
}

impl SqliteWorkQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkQueue for SqliteWorkQueue {
    async fn enqueue(&self, task_id: &str, priority: i32) -> DomainResult<()> {
        let receipt = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO work_queue_items (receipt, task_id, priority, visible_at, enqueued_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&receipt)
        .bind(task_id)
        .bind(priority)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn dequeue(&self, limit: usize, visibility_timeout_secs: u64) -> DomainResult<Vec<WorkItem>> {
        let now = Utc::now();
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT receipt, task_id FROM work_queue_items WHERE visible_at <= ? ORDER BY priority DESC, enqueued_at ASC LIMIT ?",
        )
        .bind(now.to_rfc3339())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let new_visible_at = (now + chrono::Duration::seconds(visibility_timeout_secs as i64)).to_rfc3339();
        let mut items = Vec::with_capacity(rows.len());
        for (receipt, task_id) in rows {
            sqlx::query("UPDATE work_queue_items SET visible_at = ? WHERE receipt = ?")
                .bind(&new_visible_at)
                .bind(&receipt)
                .execute(&self.pool)
                .await?;
            items.push(WorkItem { task_id, receipt });
        }
        Ok(items)
    }

    async fn ack(&self, receipt: &str) -> DomainResult<()> {
        sqlx::query("DELETE FROM work_queue_items WHERE receipt = ?").bind(receipt).execute(&self.pool).await?;
        Ok(())
    }

    async fn nack(&self, receipt: &str) -> DomainResult<()> {
        sqlx::query("UPDATE work_queue_items SET visible_at = ? WHERE receipt = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(receipt)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::connection::create_test_pool;
    use crate::adapters::sqlite::migrations::{all_embedded_migrations, Migrator};

    async fn migrated_pool() -> SqlitePool {
        let pool = create_test_pool().await.unwrap();
        Migrator::new(pool.clone()).run_embedded_migrations(all_embedded_migrations()).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_makes_item_temporarily_invisible() {
        let queue = SqliteWorkQueue::new(migrated_pool().await);
        queue.enqueue("task-1", 0).await.unwrap();

        let first = queue.dequeue(10, 300).await.unwrap();
        assert_eq!(first.len(), 1);

        let second = queue.dequeue(10, 300).await.unwrap();
        assert!(second.is_empty(), "item must stay invisible until the timeout elapses");
    }

    #[tokio::test]
    async fn ack_removes_the_item_permanently() {
        let queue = SqliteWorkQueue::new(migrated_pool().await);
        queue.enqueue("task-1", 0).await.unwrap();
        let items = queue.dequeue(10, 300).await.unwrap();
        queue.ack(&items[0].receipt).await.unwrap();

        // Even after nack'ing a non-existent receipt things stay empty; a
        // freshly-enqueued second item is the only thing left to dequeue.
        queue.enqueue("task-2", 0).await.unwrap();
        let remaining = queue.dequeue(10, 300).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].task_id, "task-2");
    }

    #[tokio::test]
    async fn nack_makes_item_immediately_redeliverable() {
        let queue = SqliteWorkQueue::new(migrated_pool().await);
        queue.enqueue("task-1", 0).await.unwrap();
        let items = queue.dequeue(10, 300).await.unwrap();
        queue.nack(&items[0].receipt).await.unwrap();

        let redelivered = queue.dequeue(10, 300).await.unwrap();
        assert_eq!(redelivered.len(), 1);
    }

    #[tokio::test]
    async fn dequeue_orders_by_priority() {
        let queue = SqliteWorkQueue::new(migrated_pool().await);
        queue.enqueue("low", 0).await.unwrap();
        queue.enqueue("high", 10).await.unwrap();

        let items = queue.dequeue(10, 300).await.unwrap();
        assert_eq!(items[0].task_id, "high");
    }
}
