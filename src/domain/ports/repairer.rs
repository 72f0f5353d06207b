//! Repairer port (spec §4.5/§4.6): the abstraction the Executor Core's
//! `handleError` calls into, implemented by
//! [`crate::services::repair_engine::RepairEngine`].
//!
//! Kept as a narrow port rather than a concrete dependency so the Executor
//! Core can be constructed and tested without wiring the full TR/MS/LS
//! stack the Repair Engine itself needs.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{RepairOutcome, RepairRequest};

#[async_trait]
pub trait Repairer: Send + Sync {
    async fn repair(&self, request: RepairRequest) -> DomainResult<RepairOutcome>;
}
