//! Repair Tracker (spec §4.7 "RT").
//!
//! Enforces the three repair budget limits before the Repair Engine is
//! allowed to spend tokens: a per-task attempt cap, a per-template daily
//! token cap, and a cooldown between attempts against the same template.
//!
//! Grounded on the reference codebase's `services::circuit_breaker::CircuitBreakerService`
//! (`Arc<RwLock<HashMap<Scope, _>>>` scoped state), generalized from a
//! single failure-threshold circuit to the three named limits below.
//! Stays in-process (SPEC_FULL.md §9 decision 3); `Template.repair_attempts`
//! is the durable secondary cap the Repair Engine consults independently.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::domain::models::repair::{
    gc_window, repair_cooldown, RepairDenialReason, RepairRecord, MAX_REPAIR_ATTEMPTS_PER_TASK,
    MAX_REPAIR_TOKENS_PER_TEMPLATE_PER_DAY,
};

#[derive(Default)]
struct TrackerState {
    by_task: HashMap<String, Vec<RepairRecord>>,
    by_template: HashMap<String, Vec<RepairRecord>>,
}

/// In-process repair bookkeeping, one instance shared across the Repair
/// Engine's invocations for a process lifetime.
pub struct RepairTracker {
    state: Arc<RwLock<TrackerState>>,
}

impl Default for RepairTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RepairTracker {
    pub fn new() -> Self {
        Self { state: Arc::new(RwLock::new(TrackerState::default())) }
    }

    /// Check whether a repair attempt against `template_id` on behalf of
    /// `task_id` is currently allowed, without recording anything.
    pub async fn check(&self, task_id: &str, template_id: &str) -> Result<(), RepairDenialReason> {
        let state = self.state.read().await;
        let now = Utc::now();

        let task_attempts = state.by_task.get(task_id).map(|v| v.iter().filter(|r| !r.is_stale(now)).count()).unwrap_or(0);
        if task_attempts >= MAX_REPAIR_ATTEMPTS_PER_TASK as usize {
            return Err(RepairDenialReason::TaskAttemptsExhausted);
        }

        if let Some(records) = state.by_template.get(template_id) {
            let today_start = now - chrono::Duration::hours(24);
            let spent_today: u64 = records.iter().filter(|r| r.recorded_at > today_start).map(|r| r.token_cost).sum();
            if spent_today >= MAX_REPAIR_TOKENS_PER_TEMPLATE_PER_DAY {
                return Err(RepairDenialReason::TemplateDailyBudgetExhausted);
            }
        }

        if let Some(records) = state.by_task.get(task_id) {
            if let Some(last) = records.iter().max_by_key(|r| r.recorded_at) {
                if now.signed_duration_since(last.recorded_at) < repair_cooldown() {
                    return Err(RepairDenialReason::CooldownActive);
                }
            }
        }

        Ok(())
    }

    /// Record a repair spend, garbage-collecting records past the 24h
    /// window as a side effect (spec §4.7).
    pub async fn record(&self, task_id: &str, template_id: &str, token_cost: u64) {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let record = RepairRecord::new(task_id, template_id, token_cost);

        state.by_task.entry(task_id.to_string()).or_default().push(record.clone());
        state.by_task.retain(|_, v| {
            v.retain(|r| !r.is_stale(now));
            !v.is_empty()
        });

        state.by_template.entry(template_id.to_string()).or_default().push(record);
        let gc_cutoff = now - gc_window();
        state.by_template.retain(|_, v| {
            v.retain(|r| r.recorded_at > gc_cutoff);
            !v.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_task_attempt_cap() {
        let tracker = RepairTracker::new();
        let now = Utc::now();
        // Seed attempts spaced outside the cooldown window, as repeated
        // real repair attempts against a single task would be, so this
        // exercises the attempt cap independent of the cooldown.
        {
            let mut state = tracker.state.write().await;
            for i in 1..MAX_REPAIR_ATTEMPTS_PER_TASK {
                let mut record = RepairRecord::new("task-1", "tmpl-1", 100);
                record.recorded_at = now - repair_cooldown() * (i as i32 + 1);
                state.by_task.entry("task-1".to_string()).or_default().push(record.clone());
                state.by_template.entry("tmpl-1".to_string()).or_default().push(record);
            }
        }
        assert!(tracker.check("task-1", "tmpl-1").await.is_ok());
        tracker.record("task-1", "tmpl-1", 100).await;
        assert_eq!(
            tracker.check("task-1", "tmpl-1").await,
            Err(RepairDenialReason::TaskAttemptsExhausted)
        );
    }

    #[tokio::test]
    async fn template_daily_budget_exhausted() {
        let tracker = RepairTracker::new();
        tracker.record("task-1", "tmpl-1", MAX_REPAIR_TOKENS_PER_TEMPLATE_PER_DAY).await;
        assert_eq!(
            tracker.check("task-2", "tmpl-1").await,
            Err(RepairDenialReason::TemplateDailyBudgetExhausted)
        );
    }

    #[tokio::test]
    async fn cooldown_blocks_immediate_reattempt() {
        let tracker = RepairTracker::new();
        tracker.record("task-1", "tmpl-1", 10).await;
        assert_eq!(tracker.check("task-1", "tmpl-2").await, Err(RepairDenialReason::CooldownActive));
    }

    #[tokio::test]
    async fn independent_tasks_do_not_interfere() {
        let tracker = RepairTracker::new();
        tracker.record("task-1", "tmpl-1", 10).await;
        assert!(tracker.check("task-2", "tmpl-2").await.is_ok());
    }
}
