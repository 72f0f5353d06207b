//! Object store port (spec §2/§6A, "OS" — result attachments).

use async_trait::async_trait;

use crate::domain::errors::DomainResult;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload bytes under `key`, returning a public (or signed) URL.
    async fn put(&self, key: &str, content_type: &str, bytes: Vec<u8>) -> DomainResult<String>;

    async fn get(&self, key: &str) -> DomainResult<Option<Vec<u8>>>;
}
