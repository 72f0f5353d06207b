//! Executor Core (spec §4.5 "EC").
//!
//! The base every template-defined executor runs under: owns per-task
//! execution state and implements all the capability methods a template's
//! sandboxed script calls into, so template authors write only business
//! logic. Mirrors the reference codebase's async-suspension-point style
//! (`services/*.rs` — every externally-visible operation is a genuine
//! `async fn`) and its `thiserror`-backed error-kind enum
//! (`domain::error::ClaudeApiError`).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::domain::errors::{DomainResult, TaskError};
use crate::domain::models::{
    Attachment, ErrorContext, MemoryCategory, ReasoningMemory, ResourceUsage, Task, TaskStatus,
    Template,
};
use crate::domain::models::{RepairRequest};
use crate::domain::ports::{ObjectStore, Repairer, TaskRepository, WorkQueue};
use crate::services::memory_store::MemoryContext;
use crate::services::rate_limited_queue::ApiCaller;

/// Deterministic Gemini model validator config (spec §4.5 `callGemini`):
/// an unrecognized or known-bad model is silently replaced, never an error.
#[derive(Debug, Clone)]
pub struct GeminiModelConfig {
    pub valid_models: Vec<String>,
    pub default_model: String,
}

impl GeminiModelConfig {
    pub fn validate(&self, requested: Option<&str>) -> String {
        match requested {
            Some(model) if self.valid_models.iter().any(|m| m == model) => model.to_string(),
            _ => self.default_model.clone(),
        }
    }
}

/// Options for `callGemini` (spec §4.5).
#[derive(Debug, Clone, Default)]
pub struct GeminiCallOptions {
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub response_schema: bool,
}

/// Options for `streamingFetch` (spec §4.5).
#[derive(Debug, Clone)]
pub struct StreamingFetchOptions {
    pub batch_size: usize,
}

impl Default for StreamingFetchOptions {
    fn default() -> Self {
        Self { batch_size: 50 }
    }
}

/// Per-task execution state and capability surface (spec §4.5 "State
/// carried on an instance").
pub struct ExecutorContext {
    pub task_id: String,
    pub template: Template,
    pub parameters: HashMap<String, Value>,
    pub context: HashMap<String, Value>,
    pub start_time: DateTime<Utc>,
    pub current_step: Option<String>,
    pub steps_completed: u32,
    pub steps_total: Option<u32>,
    pub resource_usage: ResourceUsage,
    pub provided_memories: Option<Vec<ReasoningMemory>>,
    /// Most recent `updateProgress` message, used by the orchestrator to
    /// seed `TaskResult.summary` once execution finishes successfully.
    pub last_progress_message: String,
    /// Attachments produced via `uploadReport` over the lifetime of this
    /// execution, surfaced in `TaskResult.attachments` on completion.
    pub attachments: Vec<Attachment>,
    testing: bool,

    task_repository: Arc<dyn TaskRepository>,
    api: Arc<dyn ApiCaller>,
    llm: Arc<dyn crate::domain::ports::LlmService>,
    object_store: Arc<dyn ObjectStore>,
    memory: Arc<dyn MemoryContext>,
    work_queue: Arc<dyn WorkQueue>,
    repairer: Arc<dyn Repairer>,
    gemini: GeminiModelConfig,
}

impl ExecutorContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task: &Task,
        template: Template,
        task_repository: Arc<dyn TaskRepository>,
        api: Arc<dyn ApiCaller>,
        llm: Arc<dyn crate::domain::ports::LlmService>,
        object_store: Arc<dyn ObjectStore>,
        memory: Arc<dyn MemoryContext>,
        work_queue: Arc<dyn WorkQueue>,
        repairer: Arc<dyn Repairer>,
        gemini: GeminiModelConfig,
    ) -> Self {
        Self {
            task_id: task.id.clone(),
            parameters: task.parameters.clone(),
            context: HashMap::new(),
            start_time: Utc::now(),
            current_step: None,
            steps_completed: 0,
            steps_total: None,
            resource_usage: ResourceUsage::default(),
            provided_memories: None,
            last_progress_message: String::new(),
            attachments: Vec::new(),
            testing: task.testing,
            template,
            task_repository,
            api,
            llm,
            object_store,
            memory,
            work_queue,
            repairer,
            gemini,
        }
    }

    /// `checkCancellation()` (spec §4.5): throws a distinguishable
    /// `TaskCancelled` so the error handler never tries to auto-repair it.
    pub async fn check_cancellation(&self) -> DomainResult<()> {
        let task = self
            .task_repository
            .get(&self.task_id)
            .await?
            .ok_or_else(|| TaskError::InternalError(format!("task {} not found", self.task_id)))?;
        if task.status == TaskStatus::Cancelled {
            return Err(TaskError::TaskCancelled);
        }
        Ok(())
    }

    /// `updateProgress(percent, message, step?, data?)` (spec §4.5):
    /// monotonic in `stepsCompleted`, writes through to DS.
    pub async fn update_progress(
        &mut self,
        percent: u8,
        message: impl Into<String>,
        step: Option<String>,
        steps_completed: Option<u32>,
    ) -> DomainResult<()> {
        self.check_cancellation().await?;
        let message = message.into();
        self.last_progress_message = message.clone();
        if let Some(completed) = steps_completed {
            self.steps_completed = self.steps_completed.max(completed);
        }
        if step.is_some() {
            self.current_step = step.clone();
        }
        self.write_through(|task| {
            task.update_progress(percent, message.clone(), step.clone(), steps_completed);
        })
        .await
    }

    /// `callAPI(method, params)` (spec §4.5): routes to the provider RLQ,
    /// bumps `totalApiCalls`. Rate-limit retry/backoff lives entirely
    /// inside the RLQ; this method never swallows a `RateLimited` error.
    pub async fn call_api(&mut self, method: &str, params: Value) -> DomainResult<Value> {
        self.check_cancellation().await?;
        self.resource_usage.total_api_calls += 1;
        self.api.call(method, params).await
    }

    /// `callGemini(prompt, {model?, maxTokens?, temperature?, responseSchema?})`
    /// (spec §4.5): model validation never fails the task, only rewrites it.
    pub async fn call_gemini(&mut self, prompt: &str, options: GeminiCallOptions) -> DomainResult<Value> {
        self.check_cancellation().await?;
        let model = self.gemini.validate(options.model.as_deref());
        let response = self
            .llm
            .complete(crate::domain::ports::CompletionRequest {
                system_prompt: format!("model:{model}"),
                user_prompt: prompt.to_string(),
                json_mode: options.response_schema,
                max_tokens: options.max_tokens,
            })
            .await?;
        self.resource_usage.llm_tokens += response.tokens_used;

        if options.response_schema {
            serde_json::from_str(&response.text).map_err(|e| TaskError::FormatError(e.to_string()))
        } else {
            Ok(Value::String(response.text))
        }
    }

    /// `streamingFetch(method, query, {batchSize, progressCallback?})`
    /// (spec §4.5): repeated paged `callAPI` calls until a short batch is
    /// returned, retrying rate limits at the same offset with backoff.
    pub async fn streaming_fetch<F>(
        &mut self,
        method: &str,
        mut query: serde_json::Map<String, Value>,
        options: StreamingFetchOptions,
        mut progress_callback: F,
    ) -> DomainResult<Vec<Value>>
    where
        F: FnMut(usize),
    {
        let mut results = Vec::new();
        let mut offset = 0usize;
        loop {
            query.insert("offset".to_string(), Value::from(offset));
            query.insert("limit".to_string(), Value::from(options.batch_size));

            let batch = match self.call_api(method, Value::Object(query.clone())).await {
                Ok(value) => value,
                Err(TaskError::RateLimited(_)) => {
                    let attempt = (offset / options.batch_size.max(1)) as u32;
                    tokio::time::sleep(std::time::Duration::from_millis(
                        1_000u64.saturating_mul(2u64.saturating_pow(attempt.min(5))),
                    ))
                    .await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let items = batch.as_array().cloned().unwrap_or_default();
            let batch_len = items.len();
            results.extend(items);
            progress_callback(batch_len);

            if batch_len < options.batch_size {
                break;
            }
            offset += batch_len;
        }
        Ok(results)
    }

    /// `createCheckpoint(step, data)` (spec §4.5): appends a checkpoint
    /// record to the Task.
    pub async fn create_checkpoint(&mut self, step: impl Into<String>, data: Value) -> DomainResult<()> {
        self.check_cancellation().await?;
        let step = step.into();
        self.write_through(|task| {
            task.push_checkpoint(step.clone(), data.clone());
        })
        .await
    }

    /// `uploadReport(html, filename, meta)` (spec §4.5): degrades to an
    /// inline-truncated attachment in production; throws in `testing` mode
    /// so the repair loop triggers.
    pub async fn upload_report(&mut self, html: &str, filename: &str, _meta: Value) -> DomainResult<Attachment> {
        let attachment = match self.object_store.put(filename, "text/html", html.as_bytes().to_vec()).await {
            Ok(url) => Attachment {
                public_url: url,
                file_path: None,
                content_length: Some(html.len() as u64),
                inline_truncated: false,
            },
            Err(err) if self.testing => return Err(err),
            Err(_) => Attachment {
                public_url: String::new(),
                file_path: None,
                content_length: Some(html.len() as u64),
                inline_truncated: true,
            },
        };
        self.attachments.push(attachment.clone());
        Ok(attachment)
    }

    /// `getMemoryEnhancedContext()` (spec §4.5): prefers memories supplied
    /// at construction by an outer test-time-scaling path; otherwise
    /// retrieves from MS.
    pub async fn get_memory_enhanced_context(
        &mut self,
        min_success_rate: f32,
        top_k: usize,
    ) -> DomainResult<Vec<ReasoningMemory>> {
        if let Some(provided) = &self.provided_memories {
            return Ok(provided.clone());
        }
        let query = format!(
            "{} {} {}",
            self.template.name,
            self.template.description,
            serde_json::to_string(&self.parameters).unwrap_or_default()
        );
        let memories = self
            .memory
            .enhanced_context(&query, None::<MemoryCategory>, min_success_rate, top_k)
            .await?;
        Ok(memories)
    }

    /// `updateMemoryStatistics(memoryIds, success)` (spec §4.5).
    pub async fn update_memory_statistics(&self, memory_ids: &[String], success: bool) -> DomainResult<()> {
        self.memory.record_usage(memory_ids, success).await
    }

    /// `trackGenerationMemorySuccess(taskSuccess)` (spec §4.5): propagates
    /// success/failure to the memories that seeded an AI-generated template.
    pub async fn track_generation_memory_success(&self, task_success: bool) -> DomainResult<()> {
        if let Some(metadata) = &self.template.generation_metadata {
            if !metadata.memory_ids_used.is_empty() {
                self.memory.record_usage(&metadata.memory_ids_used, task_success).await?;
            }
        }
        Ok(())
    }

    /// `handleError(err, step?)` (spec §4.5): the per-task failure funnel.
    /// Returns the error the executor should propagate/unwind with — either
    /// the original error (task failed outright) or `TaskCancelled` (an
    /// auto-repaired retry was enqueued and this execution should unwind).
    pub async fn handle_error(&mut self, err: TaskError, step: Option<String>) -> TaskError {
        if matches!(err, TaskError::TaskCancelled) || !err.is_repairable(self.testing) {
            self.fail_task(&err, step).await;
            return err;
        }

        if self.testing {
            if let Ok(Some(task)) = self.task_repository.get(&self.task_id).await {
                if task.status == TaskStatus::Cancelled {
                    return TaskError::TaskCancelled;
                }
            }

            let request = RepairRequest {
                task_id: self.task_id.clone(),
                template: self.template.clone(),
                error: ErrorContext {
                    error_kind: err.to_string(),
                    message: err.to_string(),
                    step: step.clone(),
                    stack: None,
                    current_step: self.current_step.clone(),
                    steps_completed: self.steps_completed,
                    parameters: serde_json::to_value(&self.parameters).unwrap_or(Value::Null),
                    original_user_request: None,
                },
                user_intent: None,
            };

            let repair_result = self.repairer.repair(request).await;

            if let Ok(Some(task)) = self.task_repository.get(&self.task_id).await {
                if task.status == TaskStatus::Cancelled {
                    return TaskError::TaskCancelled;
                }
            }

            match repair_result {
                Ok(outcome) if outcome.success => {
                    if let Err(e) = self.enqueue_repaired_retry().await {
                        tracing::warn!(task_id = %self.task_id, error = %e, "failed to enqueue auto-repaired retry");
                    }
                    return TaskError::TaskCancelled;
                }
                _ => {
                    self.fail_task(&err, step).await;
                    return err;
                }
            }
        }

        self.fail_task(&err, step).await;
        err
    }

    async fn enqueue_repaired_retry(&mut self) -> DomainResult<()> {
        let mut task = self
            .task_repository
            .get(&self.task_id)
            .await?
            .ok_or_else(|| TaskError::InternalError(format!("task {} not found", self.task_id)))?;

        if task.status == TaskStatus::Running {
            task.transition_to(TaskStatus::FailedAutoRepairing).map_err(TaskError::InternalError)?;
            self.task_repository.update(&task).await?;
        }

        let retry = Task::new(task.template_id.clone(), task.created_by.clone())
            .with_parameters(task.parameters.clone())
            .with_priority(task.priority)
            .with_testing(task.testing);
        self.task_repository.create(&retry).await?;
        self.work_queue.enqueue(&retry.id, retry.priority).await?;

        task.retry_task_id = Some(retry.id);
        task.transition_to(TaskStatus::AutoRepairedRetrying).map_err(TaskError::InternalError)?;
        self.task_repository.update(&task).await?;
        Ok(())
    }

    async fn fail_task(&mut self, err: &TaskError, step: Option<String>) {
        if let Ok(Some(mut task)) = self.task_repository.get(&self.task_id).await {
            if task.status.can_transition_to(TaskStatus::Failed) {
                task.errors.push(crate::domain::models::TaskErrorRecord {
                    kind: format!("{err:?}"),
                    message: err.to_string(),
                    step,
                    timestamp: Utc::now(),
                });
                if task.transition_to(TaskStatus::Failed).is_ok() {
                    let _ = self.task_repository.update(&task).await;
                }
            }
        }
    }

    async fn write_through<F: Fn(&mut Task)>(&self, mutate: F) -> DomainResult<()> {
        for _ in 0..3 {
            let Some(mut task) = self.task_repository.get(&self.task_id).await? else {
                return Err(TaskError::InternalError(format!("task {} not found", self.task_id)));
            };
            mutate(&mut task);
            if self.task_repository.update(&task).await? {
                return Ok(());
            }
        }
        Err(TaskError::InternalError(format!("concurrent update conflict on task {}", self.task_id)))
    }
}

/// Adapts an [`ExecutorContext`] as the capability surface the sandbox VM
/// dispatches method calls into (spec §4.4 "capability surface"). Argument
/// marshalling is intentionally permissive JSON — the sandbox DSL has no
/// static type system of its own.
#[async_trait]
impl crate::services::sandbox::CapabilitySurface for tokio::sync::Mutex<ExecutorContext> {
    async fn call(&self, method: &str, args: Vec<Value>) -> DomainResult<Value> {
        let mut ctx = self.lock().await;
        match method {
            "log" => Ok(Value::Null),
            "updateProgress" => {
                let percent = args.first().and_then(Value::as_u64).unwrap_or(0) as u8;
                let message = args.get(1).and_then(Value::as_str).unwrap_or("").to_string();
                ctx.update_progress(percent, message, None, None).await?;
                Ok(Value::Null)
            }
            "createCheckpoint" => {
                let step = args.first().and_then(Value::as_str).unwrap_or("").to_string();
                let data = args.into_iter().nth(1).unwrap_or(Value::Null);
                ctx.create_checkpoint(step, data).await?;
                Ok(Value::Null)
            }
            "callAPI" => {
                let method = args.first().and_then(Value::as_str).unwrap_or("").to_string();
                let params = args.into_iter().nth(1).unwrap_or(Value::Null);
                ctx.call_api(&method, params).await
            }
            other => Err(TaskError::CompileError(format!("unknown capability '{other}'"))),
        }
    }
}
