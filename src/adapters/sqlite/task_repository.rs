//! SQLite-backed Task repository (spec §4.8, the DS-backed half of the Task Orchestrator).
//!
//! One row per `Task`, keyed on `id`, with `status`/`template_id` broken out
//! into their own columns for filtering and the full model JSON-encoded into
//! `data` (spec §6A: a document store with a handful of indexed columns per
//! collection, not a column per nested field).

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Task, TaskStatus};
use crate::domain::ports::task_repository::{TaskFilter, TaskRepository};

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn create(&self, task: &Task) -> DomainResult<()> {
        let data = serde_json::to_string(task)?;
        sqlx::query(
            "INSERT INTO tasks (id, template_id, created_by, status, priority, version, data, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.template_id)
        .bind(&task.created_by)
        .bind(task.status.as_str())
        .bind(task.priority)
        .bind(task.version as i64)
        .bind(&data)
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> DomainResult<Option<Task>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT data FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some((data,)) => Some(serde_json::from_str(&data)?),
            None => None,
        })
    }

    /// Conditional update: the `WHERE version = ?` clause is the optimistic-
    /// concurrency guard the port's contract requires (spec §5).
    async fn update(&self, task: &Task) -> DomainResult<bool> {
        let data = serde_json::to_string(task)?;
        let previous_version = (task.version - 1) as i64;
        let result = sqlx::query(
            "UPDATE tasks SET template_id = ?, created_by = ?, status = ?, priority = ?, version = ?, data = ?, updated_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(&task.template_id)
        .bind(&task.created_by)
        .bind(task.status.as_str())
        .bind(task.priority)
        .bind(task.version as i64)
        .bind(&data)
        .bind(task.updated_at.to_rfc3339())
        .bind(&task.id)
        .bind(previous_version)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list(&self, filter: TaskFilter) -> DomainResult<Vec<Task>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT data FROM tasks ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        let mut tasks = Vec::with_capacity(rows.len());
        for (data,) in rows {
            let task: Task = serde_json::from_str(&data)?;
            if filter.status.is_some_and(|s| s != task.status) {
                continue;
            }
            if let Some(template_id) = &filter.template_id {
                if &task.template_id != template_id {
                    continue;
                }
            }
            if let Some(created_by) = &filter.created_by {
                if &task.created_by != created_by {
                    continue;
                }
            }
            tasks.push(task);
        }
        Ok(tasks)
    }

    async fn list_by_status(&self, status: TaskStatus) -> DomainResult<Vec<Task>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT data FROM tasks WHERE status = ? ORDER BY created_at DESC")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(|(data,)| Ok(serde_json::from_str(&data)?)).collect()
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
    async fn create_then_get_round_trips() {
        let repo = SqliteTaskRepository::new(migrated_pool().await);
        let task = Task::new("tmpl-1", "user-1");
        repo.create(&task).await.unwrap();
        let fetched = repo.get(&task.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, task.id);
        assert_eq!(fetched.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn update_rejects_stale_version() {
        let repo = SqliteTaskRepository::new(migrated_pool().await);
        let mut task = Task::new("tmpl-1", "user-1");
        repo.create(&task).await.unwrap();

        task.transition_to(TaskStatus::Running).unwrap();
        assert!(repo.update(&task).await.unwrap());

        // Same `task` value again: its `version - 1` no longer matches the
        // row's stored version, so this must lose the race.
        assert!(!repo.update(&task).await.unwrap());
    }

    #[tokio::test]
    async fn list_by_status_filters() {
        let repo = SqliteTaskRepository::new(migrated_pool().await);
        let pending = Task::new("tmpl-1", "user-1");
        let mut running = Task::new("tmpl-1", "user-1");
        running.transition_to(TaskStatus::Running).unwrap();
        repo.create(&pending).await.unwrap();
        repo.create(&running).await.unwrap();

        let result = repo.list_by_status(TaskStatus::Running).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id, running.id);
    }
}
