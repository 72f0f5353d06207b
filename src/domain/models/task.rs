//! Task domain model.
//!
//! A Task represents one requested execution of a [`Template`](super::template::Template).
//! Its status transitions form a DAG enforced by [`TaskStatus::valid_transitions`]; the
//! [`crate::services::task_orchestrator::TaskOrchestrator`] is the only component allowed
//! to mutate it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Status of a task in the execution pipeline (spec §3, §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Written by `Enqueue`, waiting for worker dispatch.
    #[default]
    Pending,
    /// Dispatched; executor is running.
    Running,
    /// Executor returned success.
    Completed,
    /// Executor failed and no repair was attempted, or repair failed.
    Failed,
    /// Repair succeeded; a retry task is being created. Transient — always
    /// followed immediately by `AutoRepairedRetrying` within the same
    /// `handleError` call.
    FailedAutoRepairing,
    /// Terminal state for the original task once a repaired retry was enqueued.
    /// `retry_task_id` points at the new task.
    AutoRepairedRetrying,
    /// User-initiated or system cancellation observed.
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::FailedAutoRepairing => "failed_auto_repairing",
            Self::AutoRepairedRetrying => "auto_repaired_retrying",
            Self::Cancelled => "cancelled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "failed_auto_repairing" => Some(Self::FailedAutoRepairing),
            "auto_repaired_retrying" => Some(Self::AutoRepairedRetrying),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal states per spec §3: the record is immutable here except for
    /// administrative audit fields. `AutoRepairedRetrying` has no outgoing
    /// transition of its own (the lineage continues on `retry_task_id`).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::AutoRepairedRetrying
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Valid transitions from this status (spec §4.8 state diagram).
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            Self::Pending => &[Self::Running, Self::Cancelled],
            Self::Running => &[
                Self::Completed,
                Self::Failed,
                Self::FailedAutoRepairing,
                Self::Cancelled,
            ],
            Self::FailedAutoRepairing => &[Self::AutoRepairedRetrying],
            Self::AutoRepairedRetrying => &[],
            Self::Completed => &[],
            Self::Failed => &[],
            Self::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

/// Routing context for a chat/webhook originated task (spec §3 `messageContext`).
///
/// Opaque to this crate beyond round-tripping it back to the (out-of-scope)
/// adapter layer for callback delivery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContext {
    pub dialog_id: Option<String>,
    pub user_id: Option<String>,
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

/// A checkpoint recorded by `createCheckpoint` (spec §4.5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub step: String,
    pub data: Value,
    pub recorded_at: DateTime<Utc>,
}

/// Progress projection written through by `updateProgress` (spec §3, §4.5).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub percent: u8,
    pub message: String,
    pub current_step: Option<String>,
    pub steps_completed: u32,
    pub steps_total: Option<u32>,
    pub checkpoints: Vec<Checkpoint>,
}

/// Peak resource usage accumulated over an execution (spec §4.5).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub peak_memory_bytes: u64,
    pub total_api_calls: u32,
    pub llm_tokens: u64,
    pub error_count: u32,
    pub warning_count: u32,
}

/// Execution bookkeeping (spec §3 `execution`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub cloud_task_name: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<u64>,
    pub resource_usage: ResourceUsage,
}

/// An attachment produced by a task (spec §3 `result.attachments`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub public_url: String,
    pub file_path: Option<String>,
    pub content_length: Option<u64>,
    pub inline_truncated: bool,
}

/// Successful outcome (spec §3 `result`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub summary: String,
    pub attachments: Vec<Attachment>,
    pub html_report: Option<String>,
}

/// A sanitized terminal-failure record (spec §7 "User-visible failure behavior").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskErrorRecord {
    pub kind: String,
    pub message: String,
    pub step: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Lineage left behind when a repaired retry is enqueued (spec §3 `autoRepairRetryInfo`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoRepairRetryInfo {
    pub repaired_template_version: u64,
    pub repair_attempt: u32,
    pub retried_at: DateTime<Utc>,
}

/// A single requested execution of a template (spec §3 "Task").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub template_id: String,
    pub created_by: String,
    pub message_context: Option<MessageContext>,

    pub parameters: HashMap<String, Value>,
    pub priority: i32,
    pub testing: bool,

    pub status: TaskStatus,
    pub progress: Progress,
    pub execution: Execution,

    pub result: Option<TaskResult>,
    pub errors: Vec<TaskErrorRecord>,

    pub retry_task_id: Option<String>,
    pub auto_repair_retry_info: Option<AutoRepairRetryInfo>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl Task {
    /// Build a new `pending` task (spec §4.8 `Enqueue`).
    pub fn new(template_id: impl Into<String>, created_by: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            template_id: template_id.into(),
            created_by: created_by.into(),
            message_context: None,
            parameters: HashMap::new(),
            priority: 0,
            testing: false,
            status: TaskStatus::Pending,
            progress: Progress::default(),
            execution: Execution::default(),
            result: None,
            errors: Vec::new(),
            retry_task_id: None,
            auto_repair_retry_info: None,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    pub fn with_parameters(mut self, parameters: HashMap<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_testing(mut self, testing: bool) -> Self {
        self.testing = testing;
        self
    }

    pub fn with_message_context(mut self, context: MessageContext) -> Self {
        self.message_context = Some(context);
        self
    }

    pub fn can_transition_to(&self, new_status: TaskStatus) -> bool {
        self.status.can_transition_to(new_status)
    }

    /// Conditional status transition (spec §4.8 "All status writes use
    /// conditional updates"). Rejects any move out of a terminal state.
    pub fn transition_to(&mut self, new_status: TaskStatus) -> Result<(), String> {
        if !self.can_transition_to(new_status) {
            return Err(format!(
                "cannot transition task {} from {} to {}",
                self.id,
                self.status.as_str(),
                new_status.as_str()
            ));
        }
        self.apply_transition(new_status);
        Ok(())
    }

    /// Bypass the state machine. Used only by crash-recovery/reconciliation
    /// paths and tests; every call is logged so bypass sites stay visible.
    pub fn force_status(&mut self, new_status: TaskStatus, reason: &str) {
        tracing::warn!(
            task_id = %self.id,
            from = %self.status.as_str(),
            to = %new_status.as_str(),
            reason,
            "forcing task status transition (bypassing state machine)"
        );
        self.apply_transition(new_status);
    }

    fn apply_transition(&mut self, new_status: TaskStatus) {
        let now = Utc::now();
        match new_status {
            TaskStatus::Running => self.execution.started_at = Some(now),
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                self.execution.finished_at = Some(now);
                if let Some(started) = self.execution.started_at {
                    self.execution.execution_time_ms =
                        Some((now - started).num_milliseconds().max(0) as u64);
                }
            }
            _ => {}
        }
        self.status = new_status;
        self.updated_at = now;
        self.version += 1;
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Bump `updated_at`/`version` for a write that mutates non-status
    /// fields without going through `transition_to` (e.g. recording
    /// `execution.cloud_task_name` or `retry_task_id`). Every write needs a
    /// version bump to satisfy the conditional-update guard on
    /// [`crate::domain::ports::task_repository::TaskRepository::update`],
    /// not just status transitions.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.version += 1;
    }

    /// Apply a monotonic progress update (spec §4.5 `updateProgress`):
    /// `steps_completed` never decreases even if `percent` does.
    pub fn update_progress(
        &mut self,
        percent: u8,
        message: impl Into<String>,
        step: Option<String>,
        steps_completed: Option<u32>,
    ) {
        self.progress.percent = percent.min(100);
        self.progress.message = message.into();
        if step.is_some() {
            self.progress.current_step = step;
        }
        if let Some(completed) = steps_completed {
            self.progress.steps_completed = self.progress.steps_completed.max(completed);
        }
        self.touch();
    }

    pub fn push_checkpoint(&mut self, step: impl Into<String>, data: Value) {
        self.progress.checkpoints.push(Checkpoint {
            step: step.into(),
            data,
            recorded_at: Utc::now(),
        });
        self.touch();
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.template_id.trim().is_empty() {
            return Err("task template_id cannot be empty".to_string());
        }
        if self.created_by.trim().is_empty() {
            return Err("task created_by cannot be empty".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Task {
        Task::new("tmpl-1", "user-1")
    }

    #[test]
    fn new_task_is_pending() {
        let t = sample();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.version, 1);
        assert!(t.validate().is_ok());
    }

    #[test]
    fn happy_path_transitions() {
        let mut t = sample();
        t.transition_to(TaskStatus::Running).unwrap();
        assert!(t.execution.started_at.is_some());
        t.transition_to(TaskStatus::Completed).unwrap();
        assert!(t.is_terminal());
        assert!(t.execution.finished_at.is_some());
    }

    #[test]
    fn repair_then_retry_path() {
        let mut t = sample();
        t.transition_to(TaskStatus::Running).unwrap();
        t.transition_to(TaskStatus::FailedAutoRepairing).unwrap();
        t.transition_to(TaskStatus::AutoRepairedRetrying).unwrap();
        assert!(t.is_terminal());
    }

    #[test]
    fn cancel_before_dispatch() {
        let mut t = sample();
        assert!(t.transition_to(TaskStatus::Cancelled).is_ok());
        assert!(t.is_terminal());
    }

    #[test]
    fn cancelled_task_never_completes() {
        let mut t = sample();
        t.transition_to(TaskStatus::Cancelled).unwrap();
        assert!(t.transition_to(TaskStatus::Completed).is_err());
        assert!(t.transition_to(TaskStatus::Running).is_err());
    }

    #[test]
    fn terminal_states_reject_all_transitions() {
        for terminal in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::AutoRepairedRetrying,
        ] {
            let mut t = sample();
            t.force_status(terminal, "test setup");
            for next in [
                TaskStatus::Pending,
                TaskStatus::Running,
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::FailedAutoRepairing,
                TaskStatus::AutoRepairedRetrying,
                TaskStatus::Cancelled,
            ] {
                if next == terminal {
                    continue;
                }
                assert!(
                    t.transition_to(next).is_err(),
                    "{:?} -> {:?} should be rejected",
                    terminal,
                    next
                );
            }
        }
    }

    #[test]
    fn self_transition_rejected() {
        let mut t = sample();
        assert!(t.transition_to(TaskStatus::Pending).is_err());
        t.transition_to(TaskStatus::Running).unwrap();
        assert!(t.transition_to(TaskStatus::Running).is_err());
    }

    #[test]
    fn force_status_bypasses_state_machine() {
        let mut t = sample();
        t.force_status(TaskStatus::Completed, "test bypass");
        assert_eq!(t.status, TaskStatus::Completed);
        t.force_status(TaskStatus::Running, "test bypass from terminal");
        assert_eq!(t.status, TaskStatus::Running);
    }

    #[test]
    fn progress_is_monotonic_in_steps_completed() {
        let mut t = sample();
        t.update_progress(50, "half way", Some("step-2".to_string()), Some(5));
        t.update_progress(30, "retrying earlier step", None, Some(2));
        assert_eq!(t.progress.percent, 30);
        assert_eq!(t.progress.steps_completed, 5, "steps_completed must not decrease");
    }

    #[test]
    fn version_increments_on_every_transition() {
        let mut t = sample();
        let before = t.version;
        t.transition_to(TaskStatus::Running).unwrap();
        assert_eq!(t.version, before + 1);
    }
}
