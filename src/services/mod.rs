//! Application services for the task-executor platform.
//!
//! One module per component named in SPEC_FULL.md §2/§4: the Rate-Limited
//! Queue, Template Repository, Template Matcher, Sandbox Runtime, Executor
//! Core, Memory Store, Repair Tracker, Repair Engine, and Task Orchestrator.

pub mod executor_core;
pub mod memory_store;
pub mod rate_limited_queue;
pub mod repair_engine;
pub mod repair_tracker;
pub mod sandbox;
pub mod task_orchestrator;
pub mod template_matcher;
pub mod template_repository;

pub use executor_core::{ExecutorContext, GeminiCallOptions, GeminiModelConfig, StreamingFetchOptions};
pub use memory_store::MemoryStore;
pub use rate_limited_queue::{ApiCaller, BackoffPolicy, PrioritizedRequest, RateLimitedQueue, RlqRequest, WaiterQueue};
pub use repair_engine::{RepairEngine, RepairEngineConfig};
pub use repair_tracker::RepairTracker;
pub use sandbox::{parse, validate_and_prepare_script, CapabilitySurface, Interpreter, Program, SandboxPolicy};
pub use task_orchestrator::{ExecutionDeps, TaskOrchestrator};
pub use template_matcher::{Confidence, MatchOutcome, TemplateMatcher};
pub use template_repository::{TemplateRepository, TemplateWriter};
