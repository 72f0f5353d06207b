//! Provider client port (spec §4.1, the thing the Rate-Limited API Queue wraps).
//!
//! One implementation per external provider (CRM, telephony, …). The RLQ
//! itself only knows how to rate-limit, retry, and prioritize; the actual
//! request shape and transport live behind this trait.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::errors::DomainResult;

#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Provider name, used in error messages and metrics.
    fn name(&self) -> &'static str;

    /// Issue one call. Implementations classify failures into the §7
    /// taxonomy via `TaskError::from_provider_status` so the RLQ can decide
    /// whether to retry.
    async fn call(&self, method: &str, params: Value) -> DomainResult<Value>;
}
