//! Repair Engine (spec §4.6 "RE").
//!
//! Turns an execution failure into a patched, validated, stored template,
//! or a structured refusal (circuit breaker denial, design mismatch, or a
//! patch that still fails validation). Depends on the narrow
//! [`TemplateWriter`]/[`MemoryContext`] facades rather than being generic
//! over their backing ports, following the same pattern `ExecutorContext`
//! uses, and on the concrete [`RepairTracker`] directly — the tracker has
//! no backing port of its own to abstract over (spec §4.7: in-process
//! only).

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;

use crate::domain::errors::DomainResult;
use crate::domain::models::{RepairOutcome, RepairRequest};
use crate::domain::ports::{CompletionRequest, LlmService, Repairer};
use crate::services::memory_store::MemoryContext;
use crate::services::repair_tracker::RepairTracker;
use crate::services::sandbox::{validate_and_prepare_script, SandboxPolicy};
use crate::services::template_repository::TemplateWriter;

/// Tunables for the repair prompt/retrieval step (spec §4.6 procedure step 1).
#[derive(Debug, Clone)]
pub struct RepairEngineConfig {
    pub memory_top_k: usize,
    pub memory_min_success_rate: f32,
    pub repair_max_tokens: u32,
}

impl Default for RepairEngineConfig {
    fn default() -> Self {
        Self { memory_top_k: 5, memory_min_success_rate: 0.5, repair_max_tokens: 4096 }
    }
}

pub struct RepairEngine {
    templates: Arc<dyn TemplateWriter>,
    memory: Arc<dyn MemoryContext>,
    llm: Arc<dyn LlmService>,
    tracker: Arc<RepairTracker>,
    policy: SandboxPolicy,
    config: RepairEngineConfig,
}

impl RepairEngine {
    pub fn new(
        templates: Arc<dyn TemplateWriter>,
        memory: Arc<dyn MemoryContext>,
        llm: Arc<dyn LlmService>,
        tracker: Arc<RepairTracker>,
        policy: SandboxPolicy,
        config: RepairEngineConfig,
    ) -> Self {
        Self { templates, memory, llm, tracker, policy, config }
    }

    async fn repair_inner(&self, request: RepairRequest) -> DomainResult<RepairOutcome> {
        let RepairRequest { task_id, template, error, user_intent } = request;

        // Precondition 1: circuit breaker.
        if self.tracker.check(&task_id, &template.id).await.is_err() {
            return Ok(RepairOutcome::failed());
        }

        // Precondition 2: intent mismatch is not a code bug.
        if let Some(intent) = &user_intent {
            if intent.detect_mismatch(&template).is_some() {
                return Ok(RepairOutcome::design_mismatch());
            }
        }

        // Step 1: retrieve repair-relevant memories.
        let query = format!("{} {} {}", template.name, error.error_kind, error.message);
        let memories = self.memory.repair_lessons(&query, self.config.memory_min_success_rate, self.config.memory_top_k).await?;
        let memory_ids: Vec<String> = memories.iter().map(|m| m.id.clone()).collect();

        // Step 2 (knowledge-base context) is out of scope: the KB document
        // store is an external collaborator this platform does not call.

        // Step 3: a best-effort code window around the failure.
        let code_window = extract_code_window(&template.execution_script, error.step.as_deref());

        // Step 4: build the repair prompt.
        let prompt = build_repair_prompt(&template, &error, &code_window, &memories);

        // Step 5: call LS deterministically and extract the first code block.
        let completion = self
            .llm
            .complete(CompletionRequest {
                system_prompt: "You are repairing a sandboxed automation script. Respond with exactly one fenced code block containing the full corrected script and no commentary. temperature=0".to_string(),
                user_prompt: prompt,
                json_mode: false,
                max_tokens: Some(self.config.repair_max_tokens),
            })
            .await?;
        let token_cost = completion.tokens_used;
        let candidate = extract_code_block(&completion.text);

        // Step 6: validate and, if it holds up, persist through TR.
        let outcome = match validate_and_prepare_script(&candidate, &self.policy) {
            Err(_) => RepairOutcome::failed(),
            Ok(prepared) => {
                let escaped = prepared != candidate;
                let updated = self.templates.update_script(&template.id, prepared, escaped).await?;
                let updated = self.templates.record_repair(&updated.id, &task_id, &error.error_kind, token_cost).await?;
                let repair_attempt = updated.repair_attempts;
                RepairOutcome::repaired(updated, repair_attempt)
            }
        };

        // Step 7: side-effects on memories and the tracker, regardless of
        // which branch of step 6 was taken.
        if let Some(metadata) = &template.generation_metadata {
            if !metadata.memory_ids_used.is_empty() {
                self.memory.record_usage(&metadata.memory_ids_used, false).await?;
            }
        }
        if !memory_ids.is_empty() {
            self.memory.record_usage(&memory_ids, outcome.success).await?;
        }
        self.tracker.record(&task_id, &template.id, token_cost).await;

        Ok(outcome)
    }
}

/// Best-effort extraction of the source lines around a named failure step.
/// Falls back to a leading slice of the script when no step is named or it
/// cannot be located, mirroring the stack-frame-best-effort language of
/// spec §4.6 procedure step 3.
fn extract_code_window(script: &str, step: Option<&str>) -> String {
    const CONTEXT_LINES: usize = 5;
    const FALLBACK_CHARS: usize = 2000;

    if let Some(step) = step {
        let lines: Vec<&str> = script.lines().collect();
        if let Some(hit) = lines.iter().position(|line| line.contains(step)) {
            let start = hit.saturating_sub(CONTEXT_LINES);
            let end = (hit + CONTEXT_LINES + 1).min(lines.len());
            return lines[start..end].join("\n");
        }
    }
    script.chars().take(FALLBACK_CHARS).collect()
}

fn build_repair_prompt(
    template: &crate::domain::models::Template,
    error: &crate::domain::models::ErrorContext,
    code_window: &str,
    memories: &[crate::domain::models::ReasoningMemory],
) -> String {
    use std::fmt::Write;

    let mut prompt = String::new();
    let _ = writeln!(prompt, "Task: {} ({})", template.name, template.id);
    let _ = writeln!(prompt, "Error: {} — {}", error.error_kind, error.message);
    if let Some(stack) = &error.stack {
        let _ = writeln!(prompt, "Stack:\n{stack}");
    }
    let _ = writeln!(prompt, "Current step: {:?}, steps completed: {}", error.current_step, error.steps_completed);
    let _ = writeln!(prompt, "Parameters: {}", error.parameters);
    prompt.push_str("Source window:\n");
    prompt.push_str(code_window);
    prompt.push('\n');
    if !memories.is_empty() {
        prompt.push_str("Lessons from past repairs:\n");
        for memory in memories {
            let _ = writeln!(prompt, "- {}: {}", memory.title, memory.content);
        }
    }
    prompt
}

/// Extract the contents of the first fenced code block in `text`, or the
/// whole (trimmed) text if none is present.
fn extract_code_block(text: &str) -> String {
    let re = Regex::new(r"(?s)```(?:\w+\n)?(.*?)```").unwrap();
    match re.captures(text) {
        Some(caps) => caps[1].trim().to_string(),
        None => text.trim().to_string(),
    }
}

#[async_trait]
impl Repairer for RepairEngine {
    async fn repair(&self, request: RepairRequest) -> DomainResult<RepairOutcome> {
        self.repair_inner(request).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::domain::errors::TaskError;
    use crate::domain::models::{ErrorContext, MemoryCategory, ReasoningMemory, Template};
    use crate::domain::ports::CompletionResponse;

    struct StubLlm {
        response: String,
    }

    #[async_trait]
    impl LlmService for StubLlm {
        async fn complete(&self, _request: CompletionRequest) -> DomainResult<CompletionResponse> {
            Ok(CompletionResponse { text: self.response.clone(), tokens_used: 42 })
        }
    }

    #[derive(Default)]
    struct StubMemory {
        usage_calls: StdMutex<Vec<(Vec<String>, bool)>>,
    }

    #[async_trait]
    impl MemoryContext for StubMemory {
        async fn enhanced_context(
            &self,
            _query: &str,
            _category_filter: Option<MemoryCategory>,
            _min_success_rate: f32,
            _top_k: usize,
        ) -> DomainResult<Vec<ReasoningMemory>> {
            Ok(Vec::new())
        }

        async fn record_usage(&self, memory_ids: &[String], success: bool) -> DomainResult<()> {
            self.usage_calls.lock().unwrap().push((memory_ids.to_vec(), success));
            Ok(())
        }

        async fn repair_lessons(&self, _query: &str, _min_success_rate: f32, _top_k: usize) -> DomainResult<Vec<ReasoningMemory>> {
            Ok(vec![ReasoningMemory::new("mem-1", "past fix", "retry with backoff", MemoryCategory::FixStrategy)])
        }
    }

    #[derive(Default)]
    struct StubTemplates {
        stored: StdMutex<HashMap<String, Template>>,
    }

    #[async_trait]
    impl TemplateWriter for StubTemplates {
        async fn get(&self, template_id: &str) -> DomainResult<Option<Template>> {
            Ok(self.stored.lock().unwrap().get(template_id).cloned())
        }

        async fn update_script(&self, template_id: &str, new_script: String, escaped: bool) -> DomainResult<Template> {
            let mut stored = self.stored.lock().unwrap();
            let template = stored.entry(template_id.to_string()).or_insert_with(|| Template::new(template_id, "t", ""));
            template.mark_script_changed(new_script, escaped);
            template.mark_validated();
            Ok(template.clone())
        }

        async fn record_repair(&self, template_id: &str, task_id: &str, error_kind: &str, token_cost: u64) -> DomainResult<Template> {
            let mut stored = self.stored.lock().unwrap();
            let template = stored.entry(template_id.to_string()).or_insert_with(|| Template::new(template_id, "t", ""));
            template.record_repair(task_id, error_kind, token_cost);
            Ok(template.clone())
        }
    }

    fn make_error() -> ErrorContext {
        ErrorContext {
            error_kind: "CompileError".to_string(),
            message: "unexpected token".to_string(),
            step: None,
            stack: None,
            current_step: None,
            steps_completed: 0,
            parameters: serde_json::json!({}),
            original_user_request: None,
        }
    }

    fn make_engine(response: &str) -> (RepairEngine, Arc<StubTemplates>, Arc<StubMemory>) {
        let templates = Arc::new(StubTemplates::default());
        let memory = Arc::new(StubMemory::default());
        let llm = Arc::new(StubLlm { response: response.to_string() });
        let tracker = Arc::new(RepairTracker::new());
        let engine = RepairEngine::new(
            templates.clone(),
            memory.clone(),
            llm,
            tracker,
            SandboxPolicy::default(),
            RepairEngineConfig::default(),
        );
        (engine, templates, memory)
    }

    #[tokio::test]
    async fn successful_repair_persists_through_template_writer() {
        let (engine, templates, memory) = make_engine("```\nlet x = 1;\n```");
        let template = Template::new("tmpl-1", "Report", "let x = ;");
        let outcome = engine
            .repair(RepairRequest { task_id: "task-1".to_string(), template, error: make_error(), user_intent: None })
            .await
            .unwrap();
        assert!(outcome.success);
        let stored = templates.get("tmpl-1").await.unwrap().unwrap();
        assert_eq!(stored.execution_script, "let x = 1;");
        assert_eq!(stored.repair_attempts, 1);
        assert_eq!(memory.usage_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn still_invalid_patch_reports_failure_without_persisting() {
        let (engine, templates, _memory) = make_engine("```\nwhile (true) { }\n```");
        let template = Template::new("tmpl-2", "Report", "let x = ;");
        let outcome = engine
            .repair(RepairRequest { task_id: "task-2".to_string(), template, error: make_error(), user_intent: None })
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(!outcome.is_design_error);
        assert!(templates.get("tmpl-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn design_mismatch_short_circuits_before_any_llm_call() {
        let (engine, _templates, _memory) = make_engine("```\nlet x = 1;\n```");
        let template = Template::new("tmpl-3", "Report", "let x = 1;");
        let intent = crate::domain::models::memory::UserIntent {
            wanted_aggregate: true,
            ..Default::default()
        };
        let mut template_with_schema = template;
        template_with_schema.parameter_schema.properties.push(crate::domain::models::template::ParameterProperty {
            name: "id".to_string(),
            required: true,
            value_type: "string".to_string(),
            default: None,
        });
        let outcome = engine
            .repair(RepairRequest {
                task_id: "task-3".to_string(),
                template: template_with_schema,
                error: make_error(),
                user_intent: Some(intent),
            })
            .await
            .unwrap();
        assert!(outcome.is_design_error);
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn circuit_breaker_denial_skips_repair_entirely() {
        let (engine, templates, _memory) = make_engine("```\nlet x = 1;\n```");
        let tracker = Arc::new(RepairTracker::new());
        // Exhaust the per-task cap before asking for a repair.
        for _ in 0..crate::domain::models::repair::MAX_REPAIR_ATTEMPTS_PER_TASK {
            tracker.record("task-4", "tmpl-4", 10).await;
        }
        let engine = RepairEngine::new(
            templates.clone(),
            engine_memory(&engine),
            engine_llm(&engine),
            tracker,
            SandboxPolicy::default(),
            RepairEngineConfig::default(),
        );
        let template = Template::new("tmpl-4", "Report", "let x = ;");
        let outcome = engine
            .repair(RepairRequest { task_id: "task-4".to_string(), template, error: make_error(), user_intent: None })
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(templates.get("tmpl-4").await.unwrap().is_none());
    }

    fn engine_memory(engine: &RepairEngine) -> Arc<dyn MemoryContext> {
        engine.memory.clone()
    }

    fn engine_llm(engine: &RepairEngine) -> Arc<dyn LlmService> {
        engine.llm.clone()
    }
}
