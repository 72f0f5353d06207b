//! Repair bookkeeping domain model (spec §3 "RepairRecord").
//!
//! Not user-facing — internal state consulted by the Repair Tracker (§4.7)
//! before the Repair Engine is allowed to spend tokens fixing a template.
//! Owned exclusively by [`crate::services::repair_tracker::RepairTracker`].

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use super::template::Template;

/// Per-task repair attempt cap (spec §4.7 limit 1).
pub const MAX_REPAIR_ATTEMPTS_PER_TASK: u32 = 3;

/// Per-template daily cumulative token spend cap (spec §4.7 limit 2).
pub const MAX_REPAIR_TOKENS_PER_TEMPLATE_PER_DAY: u64 = 1_000_000;

/// Minimum spacing between repair attempts against the same task
/// (spec §4.7 limit 3, the "~6 minute cooldown").
pub fn repair_cooldown() -> Duration {
    Duration::minutes(6)
}

/// Window after which stale per-task attempt records are garbage collected
/// (spec §4.7 "garbage collected after a window").
pub fn gc_window() -> Duration {
    Duration::hours(24)
}

/// A single repair spend event, kept only long enough to answer the three
/// limit checks above.
#[derive(Debug, Clone, PartialEq)]
pub struct RepairRecord {
    pub task_id: String,
    pub template_id: String,
    pub token_cost: u64,
    pub recorded_at: DateTime<Utc>,
}

impl RepairRecord {
    pub fn new(task_id: impl Into<String>, template_id: impl Into<String>, token_cost: u64) -> Self {
        Self {
            task_id: task_id.into(),
            template_id: template_id.into(),
            token_cost,
            recorded_at: Utc::now(),
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.recorded_at) > gc_window()
    }
}

/// Why the Repair Tracker refused a repair attempt (spec §4.7 preconditions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairDenialReason {
    TaskAttemptsExhausted,
    TemplateDailyBudgetExhausted,
    CooldownActive,
}

impl RepairDenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskAttemptsExhausted => "task_attempts_exhausted",
            Self::TemplateDailyBudgetExhausted => "template_daily_budget_exhausted",
            Self::CooldownActive => "cooldown_active",
        }
    }
}

/// Error context handed to the Repair Engine (spec §4.6 "Inputs").
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub error_kind: String,
    pub message: String,
    pub step: Option<String>,
    pub stack: Option<String>,
    pub current_step: Option<String>,
    pub steps_completed: u32,
    pub parameters: Value,
    pub original_user_request: Option<String>,
}

/// A repair request bundling the failed template with its error context
/// (spec §4.6 "Inputs").
#[derive(Debug, Clone)]
pub struct RepairRequest {
    pub task_id: String,
    pub template: Template,
    pub error: ErrorContext,
    /// Stored user-intent annotations, if any were captured at task
    /// submission time, consulted by the intent-mismatch precondition
    /// (spec §4.6 precondition 2).
    pub user_intent: Option<super::memory::UserIntent>,
}

/// The result of one Repair Engine invocation (spec §4.6 "Procedure"/"Intent
/// check"). `is_design_error` short-circuits the rest of the fields: a
/// design mismatch is not a code bug and carries no patched template.
#[derive(Debug, Clone)]
pub struct RepairOutcome {
    pub success: bool,
    pub is_design_error: bool,
    pub recommendation: Option<String>,
    pub template: Option<Template>,
    pub repair_attempt: u32,
}

impl RepairOutcome {
    pub fn design_mismatch() -> Self {
        Self {
            success: false,
            is_design_error: true,
            recommendation: Some("create_new_template_matching_user_intent".to_string()),
            template: None,
            repair_attempt: 0,
        }
    }

    pub fn failed() -> Self {
        Self { success: false, is_design_error: false, recommendation: None, template: None, repair_attempt: 0 }
    }

    pub fn repaired(template: Template, repair_attempt: u32) -> Self {
        Self { success: true, is_design_error: false, recommendation: None, template: Some(template), repair_attempt }
    }
}
