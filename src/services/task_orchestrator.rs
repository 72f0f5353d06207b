//! Task Orchestrator (spec §4.8 "TO").
//!
//! The only component that mutates `Task.status` and talks to WQ. Every
//! inbound operation (`enqueue`, `cancel`, `retry_with_repaired_template`)
//! and the worker-callback operation (`dispatch`) goes through the same
//! conditional-update guard `domain::models::task::Task` already enforces
//! in its own `transition_to`/`can_transition_to`, mirroring the reference
//! codebase's status-guarded-write pattern referenced in SPEC_FULL.md §4.8's
//! grounding note.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::domain::errors::{DomainResult, TaskError};
use crate::domain::models::{MessageContext, Task, TaskResult, TaskStatus};
use crate::domain::ports::{LlmService, ObjectStore, Repairer, TaskRepository, WorkQueue};
use crate::services::memory_store::MemoryContext;
use crate::services::rate_limited_queue::ApiCaller;
use crate::services::sandbox;
use crate::services::template_repository::TemplateWriter;
use crate::services::{ExecutorContext, GeminiModelConfig};

/// Everything the Executor Core needs to build an [`ExecutorContext`] for a
/// dispatched task, bundled so `TaskOrchestrator::new` doesn't take ten
/// separate `Arc` parameters (spec §4.5 "state carried on an instance").
pub struct ExecutionDeps {
    pub api: Arc<dyn ApiCaller>,
    pub llm: Arc<dyn LlmService>,
    pub object_store: Arc<dyn ObjectStore>,
    pub memory: Arc<dyn MemoryContext>,
    pub repairer: Arc<dyn Repairer>,
    pub gemini: GeminiModelConfig,
}

pub struct TaskOrchestrator {
    tasks: Arc<dyn TaskRepository>,
    templates: Arc<dyn TemplateWriter>,
    work_queue: Arc<dyn WorkQueue>,
    deps: ExecutionDeps,
}

impl TaskOrchestrator {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        templates: Arc<dyn TemplateWriter>,
        work_queue: Arc<dyn WorkQueue>,
        deps: ExecutionDeps,
    ) -> Self {
        Self { tasks, templates, work_queue, deps }
    }

    /// `Enqueue({templateId, parameters, userId, priority, messageContext})
    /// → taskId` (spec §4.8). Validates `parameters` against the template's
    /// schema before writing anything — a `ValidationError` here is not
    /// repair-eligible (spec §7), it is surfaced straight back to the caller.
    #[allow(clippy::too_many_arguments)]
    pub async fn enqueue(
        &self,
        template_id: &str,
        parameters: HashMap<String, Value>,
        created_by: &str,
        priority: i32,
        message_context: Option<MessageContext>,
        testing: bool,
    ) -> DomainResult<String> {
        let template = self
            .templates
            .get(template_id)
            .await?
            .ok_or_else(|| TaskError::ValidationError(format!("unknown template '{template_id}'")))?;
        template
            .parameter_schema
            .validate(&parameters)
            .map_err(TaskError::ValidationError)?;

        let mut task = Task::new(template_id, created_by)
            .with_parameters(parameters)
            .with_priority(priority)
            .with_testing(testing || template.testing);
        if let Some(context) = message_context {
            task = task.with_message_context(context);
        }

        self.tasks.create(&task).await?;
        self.work_queue.enqueue(&task.id, priority).await?;
        // The sqlite-backed WQ (§6A) has no separate opaque delivery handle
        // distinct from the task id it was enqueued under, so the task's
        // own id stands in for `execution.cloudTaskName` (DESIGN.md decision 8).
        task.execution.cloud_task_name = Some(task.id.clone());
        task.touch();
        self.tasks.update(&task).await?;
        Ok(task.id)
    }

    /// `Cancel(taskId)` (spec §4.8). A no-op once the task is already
    /// terminal. `WQ.cancel` is not invoked — see DESIGN.md decision 8 for
    /// why this port carries no handle-based cancel, and why the conditional
    /// status write alone is the enforced defense (spec §5 "cancellation
    /// during the WQ redelivery window").
    pub async fn cancel(&self, task_id: &str) -> DomainResult<()> {
        let Some(mut task) = self.tasks.get(task_id).await? else {
            return Err(TaskError::InternalError(format!("task {task_id} not found")));
        };
        if !task.status.can_transition_to(TaskStatus::Cancelled) {
            return Ok(());
        }
        task.transition_to(TaskStatus::Cancelled).map_err(TaskError::InternalError)?;
        // Lost race against a concurrent terminal write: whatever status won
        // is authoritative, nothing further to do.
        self.tasks.update(&task).await?;
        Ok(())
    }

    /// `getTask(taskId) → Task` (spec §6), a read-only projection.
    pub async fn get_task(&self, task_id: &str) -> DomainResult<Option<Task>> {
        self.tasks.get(task_id).await
    }

    /// `RetryWithRepairedTemplate(taskId, repairResult, userId) →
    /// {retryTaskId}` (spec §4.8). Exposed both as the programmatic
    /// follow-up to an automatic repair and as the `task retry` CLI
    /// subcommand (§6A) for a manually repaired template — see DESIGN.md
    /// decision 9 for why the status-transition guard accepts any terminal,
    /// non-cancelled status rather than only `failed_auto_repairing`.
    pub async fn retry_with_repaired_template(&self, task_id: &str, user_id: &str) -> DomainResult<String> {
        let Some(mut task) = self.tasks.get(task_id).await? else {
            return Err(TaskError::InternalError(format!("task {task_id} not found")));
        };
        if !task.status.is_terminal() || task.status == TaskStatus::Cancelled {
            return Err(TaskError::ValidationError(format!(
                "task {task_id} is not eligible for a repaired retry from status '{}'",
                task.status.as_str()
            )));
        }

        tracing::info!(task_id, user_id, "enqueueing repaired retry");

        let mut retry = Task::new(task.template_id.clone(), task.created_by.clone())
            .with_parameters(task.parameters.clone())
            .with_priority(task.priority)
            .with_testing(task.testing);
        if let Some(context) = task.message_context.clone() {
            retry = retry.with_message_context(context);
        }
        self.tasks.create(&retry).await?;
        self.work_queue.enqueue(&retry.id, retry.priority).await?;

        task.retry_task_id = Some(retry.id.clone());
        if task.status.can_transition_to(TaskStatus::AutoRepairedRetrying) {
            task.transition_to(TaskStatus::AutoRepairedRetrying).map_err(TaskError::InternalError)?;
        } else {
            task.touch();
        }
        self.tasks.update(&task).await?;
        Ok(retry.id)
    }

    /// Worker callback `Dispatch(taskId)` (spec §4.8). Safe to call more than
    /// once for the same task: anything past the `pending` guard is a no-op,
    /// satisfying invariant 4 (§8) that at most one dispatch transitions a
    /// task `pending → running`.
    pub async fn dispatch(&self, task_id: &str) -> DomainResult<()> {
        let Some(mut task) = self.tasks.get(task_id).await? else {
            return Ok(());
        };
        if task.status != TaskStatus::Pending {
            return Ok(());
        }
        if task.transition_to(TaskStatus::Running).is_err() {
            return Ok(());
        }
        if !self.tasks.update(&task).await? {
            // Another dispatcher won the race to claim this task.
            return Ok(());
        }

        let Some(template) = self.templates.get(&task.template_id).await? else {
            self.fail(&task, TaskError::InternalError(format!("template {} not found", task.template_id))).await?;
            return Ok(());
        };

        let program = match sandbox::parse(&template.execution_script) {
            Ok(program) => program,
            Err(message) => {
                let mut ctx = ExecutorContext::new(
                    &task,
                    template,
                    self.tasks.clone(),
                    self.deps.api.clone(),
                    self.deps.llm.clone(),
                    self.deps.object_store.clone(),
                    self.deps.memory.clone(),
                    self.work_queue.clone(),
                    self.deps.repairer.clone(),
                    self.deps.gemini.clone(),
                );
                ctx.handle_error(TaskError::CompileError(message), None).await;
                return Ok(());
            }
        };

        let ctx = ExecutorContext::new(
            &task,
            template,
            self.tasks.clone(),
            self.deps.api.clone(),
            self.deps.llm.clone(),
            self.deps.object_store.clone(),
            self.deps.memory.clone(),
            self.work_queue.clone(),
            self.deps.repairer.clone(),
            self.deps.gemini.clone(),
        );
        let surface = tokio::sync::Mutex::new(ctx);
        let outcome = {
            let interpreter = sandbox::Interpreter::new(&surface);
            interpreter.run(&program).await
        };
        let mut ctx = surface.into_inner();

        match outcome {
            Ok(()) => {
                ctx.track_generation_memory_success(true).await.ok();
                self.complete(&task, &ctx).await?;
            }
            Err(TaskError::TaskCancelled) => {
                // `checkCancellation` already observed this; nothing else to write.
            }
            Err(err) => {
                let final_err = ctx.handle_error(err, ctx.current_step.clone()).await;
                if !matches!(final_err, TaskError::TaskCancelled) {
                    ctx.track_generation_memory_success(false).await.ok();
                }
            }
        }
        Ok(())
    }

    async fn complete(&self, task: &Task, ctx: &ExecutorContext) -> DomainResult<()> {
        for _ in 0..3 {
            let Some(mut latest) = self.tasks.get(&task.id).await? else {
                return Err(TaskError::InternalError(format!("task {} not found", task.id)));
            };
            if !latest.status.can_transition_to(TaskStatus::Completed) {
                // Cancelled or already handled underneath us.
                return Ok(());
            }
            latest.result = Some(TaskResult {
                summary: ctx.last_progress_message.clone(),
                attachments: ctx.attachments.clone(),
                html_report: None,
            });
            latest.execution.resource_usage = ctx.resource_usage.clone();
            latest.transition_to(TaskStatus::Completed).map_err(TaskError::InternalError)?;
            if self.tasks.update(&latest).await? {
                return Ok(());
            }
        }
        Err(TaskError::InternalError(format!("concurrent update conflict completing task {}", task.id)))
    }

    async fn fail(&self, task: &Task, err: TaskError) -> DomainResult<()> {
        let Some(mut latest) = self.tasks.get(&task.id).await? else {
            return Ok(());
        };
        if !latest.status.can_transition_to(TaskStatus::Failed) {
            return Ok(());
        }
        latest.errors.push(crate::domain::models::TaskErrorRecord {
            kind: format!("{err:?}"),
            message: err.to_string(),
            step: None,
            timestamp: chrono::Utc::now(),
        });
        latest.transition_to(TaskStatus::Failed).map_err(TaskError::InternalError)?;
        self.tasks.update(&latest).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::domain::models::{ReasoningMemory, Template};
    use crate::domain::ports::{CompletionRequest, CompletionResponse, TaskFilter};

    struct InMemoryTasks {
        tasks: StdMutex<HashMap<String, Task>>,
    }

    impl InMemoryTasks {
        fn new() -> Self {
            Self { tasks: StdMutex::new(HashMap::new()) }
        }
    }

    #[async_trait]
    impl TaskRepository for InMemoryTasks {
        async fn create(&self, task: &Task) -> DomainResult<()> {
            self.tasks.lock().unwrap().insert(task.id.clone(), task.clone());
            Ok(())
        }

        async fn get(&self, id: &str) -> DomainResult<Option<Task>> {
            Ok(self.tasks.lock().unwrap().get(id).cloned())
        }

        async fn update(&self, task: &Task) -> DomainResult<bool> {
            let mut guard = self.tasks.lock().unwrap();
            let Some(existing) = guard.get(&task.id) else { return Ok(false) };
            if existing.version + 1 != task.version {
                return Ok(false);
            }
            guard.insert(task.id.clone(), task.clone());
            Ok(true)
        }

        async fn list(&self, _filter: TaskFilter) -> DomainResult<Vec<Task>> {
            Ok(self.tasks.lock().unwrap().values().cloned().collect())
        }

        async fn list_by_status(&self, status: TaskStatus) -> DomainResult<Vec<Task>> {
            Ok(self.tasks.lock().unwrap().values().filter(|t| t.status == status).cloned().collect())
        }
    }

    struct InMemoryTemplates {
        templates: StdMutex<HashMap<String, Template>>,
    }

    #[async_trait]
    impl TemplateWriter for InMemoryTemplates {
        async fn get(&self, template_id: &str) -> DomainResult<Option<Template>> {
            Ok(self.templates.lock().unwrap().get(template_id).cloned())
        }

        async fn update_script(&self, template_id: &str, new_script: String, escaped: bool) -> DomainResult<Template> {
            let mut guard = self.templates.lock().unwrap();
            let template = guard.get_mut(template_id).unwrap();
            template.mark_script_changed(new_script, escaped);
            template.mark_validated();
            Ok(template.clone())
        }

        async fn record_repair(&self, template_id: &str, task_id: &str, error_kind: &str, token_cost: u64) -> DomainResult<Template> {
            let mut guard = self.templates.lock().unwrap();
            let template = guard.get_mut(template_id).unwrap();
            template.record_repair(task_id, error_kind, token_cost);
            Ok(template.clone())
        }
    }

    struct NullWorkQueue;

    #[async_trait]
    impl WorkQueue for NullWorkQueue {
        async fn enqueue(&self, _task_id: &str, _priority: i32) -> DomainResult<()> {
            Ok(())
        }
        async fn dequeue(&self, _limit: usize, _visibility_timeout_secs: u64) -> DomainResult<Vec<crate::domain::ports::WorkItem>> {
            Ok(Vec::new())
        }
        async fn ack(&self, _receipt: &str) -> DomainResult<()> {
            Ok(())
        }
        async fn nack(&self, _receipt: &str) -> DomainResult<()> {
            Ok(())
        }
    }

    struct NullApi;

    #[async_trait]
    impl ApiCaller for NullApi {
        async fn call(&self, _method: &str, _params: Value) -> DomainResult<Value> {
            Ok(Value::Null)
        }
    }

    struct NullLlm;

    #[async_trait]
    impl LlmService for NullLlm {
        async fn complete(&self, _request: CompletionRequest) -> DomainResult<CompletionResponse> {
            Ok(CompletionResponse { text: "{}".to_string(), tokens_used: 0 })
        }
    }

    struct NullObjectStore;

    #[async_trait]
    impl ObjectStore for NullObjectStore {
        async fn put(&self, _key: &str, _content_type: &str, _bytes: Vec<u8>) -> DomainResult<String> {
            Ok("file:///noop".to_string())
        }
        async fn get(&self, _key: &str) -> DomainResult<Option<Vec<u8>>> {
            Ok(None)
        }
    }

    struct NullMemory;

    #[async_trait]
    impl MemoryContext for NullMemory {
        async fn enhanced_context(
            &self,
            _query: &str,
            _category_filter: Option<crate::domain::models::MemoryCategory>,
            _min_success_rate: f32,
            _top_k: usize,
        ) -> DomainResult<Vec<ReasoningMemory>> {
            Ok(Vec::new())
        }

        async fn record_usage(&self, _memory_ids: &[String], _success: bool) -> DomainResult<()> {
            Ok(())
        }

        async fn repair_lessons(&self, _query: &str, _min_success_rate: f32, _top_k: usize) -> DomainResult<Vec<ReasoningMemory>> {
            Ok(Vec::new())
        }
    }

    struct NullRepairer;

    #[async_trait]
    impl Repairer for NullRepairer {
        async fn repair(&self, _request: crate::domain::models::RepairRequest) -> DomainResult<crate::domain::models::RepairOutcome> {
            Ok(crate::domain::models::RepairOutcome::failed())
        }
    }

    fn make_orchestrator(templates: HashMap<String, Template>) -> TaskOrchestrator {
        TaskOrchestrator::new(
            Arc::new(InMemoryTasks::new()),
            Arc::new(InMemoryTemplates { templates: StdMutex::new(templates) }),
            Arc::new(NullWorkQueue),
            ExecutionDeps {
                api: Arc::new(NullApi),
                llm: Arc::new(NullLlm),
                object_store: Arc::new(NullObjectStore),
                memory: Arc::new(NullMemory),
                repairer: Arc::new(NullRepairer),
                gemini: GeminiModelConfig { valid_models: Vec::new(), default_model: "default".to_string() },
            },
        )
    }

    fn sample_template(script: &str) -> Template {
        let mut t = Template::new("tmpl-1", "Report X", script);
        t.mark_validated();
        t
    }

    #[tokio::test]
    async fn enqueue_then_dispatch_completes_a_passing_script() {
        let orchestrator = make_orchestrator(HashMap::from([(
            "tmpl-1".to_string(),
            sample_template(r#"updateProgress(100, "done");"#),
        )]));
        let task_id = orchestrator
            .enqueue("tmpl-1", HashMap::new(), "user-1", 0, None, false)
            .await
            .unwrap();

        orchestrator.dispatch(&task_id).await.unwrap();

        let task = orchestrator.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.unwrap().summary, "done");
    }

    #[tokio::test]
    async fn dispatch_is_idempotent_against_a_completed_task() {
        let orchestrator = make_orchestrator(HashMap::from([(
            "tmpl-1".to_string(),
            sample_template(r#"updateProgress(100, "done");"#),
        )]));
        let task_id = orchestrator.enqueue("tmpl-1", HashMap::new(), "user-1", 0, None, false).await.unwrap();
        orchestrator.dispatch(&task_id).await.unwrap();
        orchestrator.dispatch(&task_id).await.unwrap();

        let task = orchestrator.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn dispatch_fails_task_on_unrepairable_error() {
        let orchestrator = make_orchestrator(HashMap::from([(
            "tmpl-1".to_string(),
            sample_template(r#"log(undefinedVar);"#),
        )]));
        let task_id = orchestrator.enqueue("tmpl-1", HashMap::new(), "user-1", 0, None, false).await.unwrap();
        orchestrator.dispatch(&task_id).await.unwrap();

        let task = orchestrator.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.errors.len(), 1);
    }

    #[tokio::test]
    async fn cancel_before_dispatch_prevents_completion() {
        let orchestrator = make_orchestrator(HashMap::from([(
            "tmpl-1".to_string(),
            sample_template(r#"updateProgress(100, "done");"#),
        )]));
        let task_id = orchestrator.enqueue("tmpl-1", HashMap::new(), "user-1", 0, None, false).await.unwrap();
        orchestrator.cancel(&task_id).await.unwrap();
        orchestrator.dispatch(&task_id).await.unwrap();

        let task = orchestrator.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_is_a_no_op_on_a_terminal_task() {
        let orchestrator = make_orchestrator(HashMap::from([(
            "tmpl-1".to_string(),
            sample_template(r#"updateProgress(100, "done");"#),
        )]));
        let task_id = orchestrator.enqueue("tmpl-1", HashMap::new(), "user-1", 0, None, false).await.unwrap();
        orchestrator.dispatch(&task_id).await.unwrap();
        orchestrator.cancel(&task_id).await.unwrap();

        let task = orchestrator.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed, "a completed task must not be reopened by cancel");
    }

    #[tokio::test]
    async fn enqueue_rejects_missing_required_parameters() {
        let mut template = sample_template(r#"updateProgress(100, "done");"#);
        template.parameter_schema = crate::domain::models::ParameterSchema {
            properties: vec![crate::domain::models::ParameterProperty {
                name: "reportId".to_string(),
                required: true,
                value_type: "string".to_string(),
                default: None,
            }],
        };
        let orchestrator = make_orchestrator(HashMap::from([("tmpl-1".to_string(), template)]));

        let result = orchestrator.enqueue("tmpl-1", HashMap::new(), "user-1", 0, None, false).await;
        assert!(matches!(result, Err(TaskError::ValidationError(_))));
    }

    #[tokio::test]
    async fn retry_with_repaired_template_creates_new_task_and_links_lineage() {
        let orchestrator = make_orchestrator(HashMap::from([(
            "tmpl-1".to_string(),
            sample_template(r#"log(undefinedVar);"#),
        )]));
        let task_id = orchestrator.enqueue("tmpl-1", HashMap::new(), "user-1", 0, None, false).await.unwrap();
        orchestrator.dispatch(&task_id).await.unwrap();

        let retry_id = orchestrator.retry_with_repaired_template(&task_id, "operator-1").await.unwrap();
        assert_ne!(retry_id, task_id);

        let original = orchestrator.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(original.retry_task_id, Some(retry_id.clone()));

        let retry = orchestrator.get_task(&retry_id).await.unwrap().unwrap();
        assert_eq!(retry.status, TaskStatus::Pending);
        assert_eq!(retry.template_id, "tmpl-1");
    }

    #[tokio::test]
    async fn retry_with_repaired_template_rejects_an_active_task() {
        let orchestrator = make_orchestrator(HashMap::from([(
            "tmpl-1".to_string(),
            sample_template(r#"updateProgress(100, "done");"#),
        )]));
        let task_id = orchestrator.enqueue("tmpl-1", HashMap::new(), "user-1", 0, None, false).await.unwrap();

        let result = orchestrator.retry_with_repaired_template(&task_id, "operator-1").await;
        assert!(matches!(result, Err(TaskError::ValidationError(_))));
    }
}
