//! SQLite-backed ReasoningMemory repository (spec §4.6/§4.5, the DS-backed
//! half of the Memory Store).
//!
//! Same JSON-document-per-row layout as [`super::task_repository`] and
//! [`super::template_repository`]; the lexical fallback search delegates to
//! `ReasoningMemory::text_similarity` (spec §4.3/§4.5 grounding note).

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::domain::errors::DomainResult;
use crate::domain::models::ReasoningMemory;
use crate::domain::ports::memory_repository::MemoryRepository;

pub struct SqliteMemoryRepository {
    pool: SqlitePool,
}

impl SqliteMemoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MemoryRepository for SqliteMemoryRepository {
    async fn store(&self, memory: &ReasoningMemory) -> DomainResult<()> {
        let data = serde_json::to_string(memory)?;
        let embedding = memory.embedding.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            "INSERT INTO reasoning_memories (id, category, data, embedding, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&memory.id)
        .bind(memory.category.as_str())
        .bind(&data)
        .bind(&embedding)
        .bind(memory.created_at.to_rfc3339())
        .bind(memory.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> DomainResult<Option<ReasoningMemory>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT data FROM reasoning_memories WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some((data,)) => Some(serde_json::from_str(&data)?),
            None => None,
        })
    }

    async fn update(&self, memory: &ReasoningMemory) -> DomainResult<()> {
        let data = serde_json::to_string(memory)?;
        let embedding = memory.embedding.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query("UPDATE reasoning_memories SET category = ?, data = ?, embedding = ?, updated_at = ? WHERE id = ?")
            .bind(memory.category.as_str())
            .bind(&data)
            .bind(&embedding)
            .bind(memory.updated_at.to_rfc3339())
            .bind(&memory.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn search_by_embedding(&self, query_vector: &[f32], limit: usize) -> DomainResult<Vec<ReasoningMemory>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT data FROM reasoning_memories")
            .fetch_all(&self.pool)
            .await?;
        let mut scored = Vec::with_capacity(rows.len());
        for (data,) in rows {
            let memory: ReasoningMemory = serde_json::from_str(&data)?;
            let score = memory.cosine_similarity(query_vector).unwrap_or(0.0);
            scored.push((memory, score));
        }
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        Ok(scored.into_iter().take(limit).map(|(memory, _)| memory).collect())
    }

    async fn search_by_text(&self, query: &str, limit: usize) -> DomainResult<Vec<ReasoningMemory>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT data FROM reasoning_memories")
            .fetch_all(&self.pool)
            .await?;
        let mut scored = Vec::with_capacity(rows.len());
        for (data,) in rows {
            let memory: ReasoningMemory = serde_json::from_str(&data)?;
            let score = ReasoningMemory::text_similarity(query, &format!("{} {}", memory.title, memory.content));
            scored.push((memory, score));
        }
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        Ok(scored.into_iter().take(limit).map(|(memory, _)| memory).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::connection::create_test_pool;
    use crate::adapters::sqlite::migrations::{all_embedded_migrations, Migrator};
    use crate::domain::models::MemoryCategory;

    async fn migrated_pool() -> SqlitePool {
        let pool = create_test_pool().await.unwrap();
        Migrator::new(pool.clone()).run_embedded_migrations(all_embedded_migrations()).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn store_then_get_round_trips() {
        let repo = SqliteMemoryRepository::new(migrated_pool().await);
        let memory = ReasoningMemory::new("mem-1", "Use widgets.list", "the correct method name", MemoryCategory::FixStrategy);
        repo.store(&memory).await.unwrap();
        let fetched = repo.get("mem-1").await.unwrap().unwrap();
        assert_eq!(fetched.title, "Use widgets.list");
    }

    #[tokio::test]
    async fn search_by_text_ranks_lexical_overlap() {
        let repo = SqliteMemoryRepository::new(migrated_pool().await);
        repo.store(&ReasoningMemory::new("mem-close", "widgets list method", "call widgets.list", MemoryCategory::FixStrategy))
            .await
            .unwrap();
        repo.store(&ReasoningMemory::new("mem-far", "unrelated topic entirely", "nothing in common", MemoryCategory::Other))
            .await
            .unwrap();

        let results = repo.search_by_text("widgets list method", 2).await.unwrap();
        assert_eq!(results[0].id, "mem-close");
    }

    #[tokio::test]
    async fn update_persists_usage_counters() {
        let repo = SqliteMemoryRepository::new(migrated_pool().await);
        let mut memory = ReasoningMemory::new("mem-1", "title", "content", MemoryCategory::ErrorPattern);
        repo.store(&memory).await.unwrap();

        memory.record_usage(true);
        repo.update(&memory).await.unwrap();

        let fetched = repo.get("mem-1").await.unwrap().unwrap();
        assert_eq!(fetched.times_used_in_success, 1);
    }
}
