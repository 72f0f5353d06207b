//! Domain layer for the auto-healing dynamic task executor.
//!
//! Pure business logic and validation rules, framework-agnostic and free of
//! infrastructure concerns. Everything here is owned and mutated only
//! through the services in [`crate::services`].

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{ConfigError, ConnectionError, RepairKind, TaskError};
