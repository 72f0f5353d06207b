//! Infrastructure layer
//!
//! Ambient concerns shared by every adapter and service: configuration
//! loading and structured logging. Concrete DS/WQ/OS adapters live under
//! [`crate::adapters`].

pub mod config;
pub mod logging;
