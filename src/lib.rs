//! autoforge - an auto-healing dynamic task executor.
//!
//! Templates describe a parameterized job as a small sandboxed script; the
//! executor core runs it against rate-limited provider APIs, an object
//! store, and a reasoning-memory store, and the repair engine patches and
//! retries templates that fail in a recoverable way.
//!
//! - [`domain`] — models, ports, and the unified error taxonomy.
//! - [`services`] — the Task Orchestrator, Executor Core, Template Matcher,
//!   Template Repository, Memory Store, Repair Tracker/Engine, Sandbox
//!   Runtime, and Rate-Limited Queue.
//! - [`adapters`] — concrete sqlite, HTTP, and filesystem implementations of
//!   the domain ports.
//! - [`infrastructure`] — configuration loading and structured logging.

pub mod adapters;
pub mod domain;
pub mod infrastructure;
pub mod services;
