//! SQLite-backed Template repository (spec §4.2, the DS-backed half of the Template Repository).
//!
//! Vector k-NN search is implemented in-process over JSON-encoded embedding
//! columns (spec §6A), scored with the cosine-similarity routine grounded on
//! `odgrim-abathur-swarm`'s `domain::models::memory::Memory::cosine_similarity`.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::domain::errors::DomainResult;
use crate::domain::models::Template;
use crate::domain::ports::template_repository::TemplateRepositoryPort;

pub struct SqliteTemplateRepository {
    pool: SqlitePool,
}

impl SqliteTemplateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl TemplateRepositoryPort for SqliteTemplateRepository {
    async fn create(&self, template: &Template) -> DomainResult<()> {
        let data = serde_json::to_string(template)?;
        let name_embedding = serde_json::to_string(&template.name_embedding)?;
        let embedding = serde_json::to_string(&template.embedding)?;
        sqlx::query(
            "INSERT INTO templates (id, version, enabled, data, name_embedding, embedding, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&template.id)
        .bind(template.version as i64)
        .bind(template.enabled)
        .bind(&data)
        .bind(&name_embedding)
        .bind(&embedding)
        .bind(template.created_at.to_rfc3339())
        .bind(template.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> DomainResult<Option<Template>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT data FROM templates WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some((data,)) => Some(serde_json::from_str(&data)?),
            None => None,
        })
    }

    async fn update(&self, template: &Template) -> DomainResult<bool> {
        let data = serde_json::to_string(template)?;
        let name_embedding = serde_json::to_string(&template.name_embedding)?;
        let embedding = serde_json::to_string(&template.embedding)?;
        let previous_version = (template.version - 1) as i64;
        let result = sqlx::query(
            "UPDATE templates SET version = ?, enabled = ?, data = ?, name_embedding = ?, embedding = ?, updated_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(template.version as i64)
        .bind(template.enabled)
        .bind(&data)
        .bind(&name_embedding)
        .bind(&embedding)
        .bind(template.updated_at.to_rfc3339())
        .bind(&template.id)
        .bind(previous_version)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_enabled(&self) -> DomainResult<Vec<Template>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT data FROM templates WHERE enabled = 1 ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(|(data,)| Ok(serde_json::from_str(&data)?)).collect()
    }

    async fn search_by_embedding(&self, query_vector: &[f32], limit: usize) -> DomainResult<Vec<(Template, f32)>> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT data, embedding FROM templates WHERE enabled = 1")
            .fetch_all(&self.pool)
            .await?;
        let mut scored = Vec::with_capacity(rows.len());
        for (data, embedding) in rows {
            let template: Template = serde_json::from_str(&data)?;
            let vector: Vec<f32> = serde_json::from_str(&embedding)?;
            let score = cosine_similarity(&vector, query_vector);
            scored.push((template, score));
        }
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn delete(&self, id: &str) -> DomainResult<bool> {
        let result = sqlx::query("DELETE FROM templates WHERE id = ?").bind(id).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
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

    fn sample(id: &str, embedding: Vec<f32>) -> Template {
        let mut t = Template::new(id, "Report X", "updateProgress(100, \"done\");");
        t.mark_validated();
        t.embedding = embedding;
        t
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let repo = SqliteTemplateRepository::new(migrated_pool().await);
        let template = sample("tmpl-1", vec![1.0, 0.0]);
        repo.create(&template).await.unwrap();
        let fetched = repo.get("tmpl-1").await.unwrap().unwrap();
        assert_eq!(fetched.name, "Report X");
    }

    #[tokio::test]
    async fn search_by_embedding_ranks_by_cosine_similarity() {
        let repo = SqliteTemplateRepository::new(migrated_pool().await);
        repo.create(&sample("tmpl-close", vec![1.0, 0.0])).await.unwrap();
        repo.create(&sample("tmpl-far", vec![0.0, 1.0])).await.unwrap();

        let results = repo.search_by_embedding(&[1.0, 0.0], 2).await.unwrap();
        assert_eq!(results[0].0.id, "tmpl-close");
        assert!(results[0].1 > results[1].1);
    }

    #[tokio::test]
    async fn update_rejects_stale_version() {
        let repo = SqliteTemplateRepository::new(migrated_pool().await);
        let mut template = sample("tmpl-1", vec![1.0, 0.0]);
        repo.create(&template).await.unwrap();

        template.mark_script_changed("updateProgress(100, \"v2\");", false);
        assert!(repo.update(&template).await.unwrap());
        assert!(!repo.update(&template).await.unwrap());
    }

    #[tokio::test]
    async fn delete_removes_the_row() {
        let repo = SqliteTemplateRepository::new(migrated_pool().await);
        repo.create(&sample("tmpl-1", vec![1.0, 0.0])).await.unwrap();

        assert!(repo.delete("tmpl-1").await.unwrap());
        assert!(repo.get("tmpl-1").await.unwrap().is_none());
        assert!(!repo.delete("tmpl-1").await.unwrap());
    }
}
