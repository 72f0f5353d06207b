//! Template domain model.
//!
//! A named, versioned recipe for executing tasks (spec §3 "Template"). Owned
//! exclusively by [`crate::services::template_repository::TemplateRepository`];
//! every mutation to `execution_script` must re-validate and re-embed before
//! the write is acknowledged (spec §4.2 invariant).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single repair event recorded in `auto_repair_history` (spec §3 `autoRepairHistory`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairHistoryEntry {
    pub at: DateTime<Utc>,
    pub task_id: String,
    pub error_kind: String,
    pub token_cost: u64,
}

/// Records which reasoning memories seeded an AI-generated template (spec §3
/// `generationMetadata`), so the Repair Engine can later mark them as having
/// produced code that needed repair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetadata {
    pub memory_ids_used: Vec<String>,
    pub generated_at: Option<DateTime<Utc>>,
}

/// Trigger metadata used by the Template Matcher's fallback scoring (spec §4.3).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Triggers {
    pub patterns: Vec<String>,
    pub keywords: Vec<String>,
    pub contexts: Vec<String>,
}

/// A single property in `parameter_schema` (spec §3 "Schema").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterProperty {
    pub name: String,
    pub required: bool,
    #[serde(rename = "type")]
    pub value_type: String,
    /// May be a sentinel string the executor interprets as "derive from context".
    pub default: Option<Value>,
}

/// Parameter schema a Task's `parameters` must validate against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    pub properties: Vec<ParameterProperty>,
}

impl ParameterSchema {
    /// Validate a parameter map against required fields (spec §7 `ValidationError`).
    pub fn validate(&self, parameters: &HashMap<String, Value>) -> Result<(), String> {
        for prop in &self.properties {
            if prop.required && prop.default.is_none() && !parameters.contains_key(&prop.name) {
                return Err(format!("missing required parameter '{}'", prop.name));
            }
        }
        Ok(())
    }
}

/// A named, versioned, executable recipe (spec §3 "Template").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub version: u64,

    pub name: String,
    pub description: String,
    pub category: Vec<String>,
    pub triggers: Triggers,
    pub priority: i32,
    pub enabled: bool,
    pub testing: bool,

    pub parameter_schema: ParameterSchema,
    pub execution_script: String,

    /// Vector over `name` only — exact-name similarity.
    pub name_embedding: Vec<f32>,
    /// Vector over `name + description` — semantic similarity.
    pub embedding: Vec<f32>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_repaired: Option<DateTime<Utc>>,
    pub repair_attempts: u32,
    pub auto_repair_history: Vec<RepairHistoryEntry>,
    pub script_validated: bool,
    pub script_escaped: bool,
    pub generation_metadata: Option<GenerationMetadata>,
}

impl Template {
    /// Construct an as-yet-unvalidated template. Callers MUST run it through
    /// the Sandbox Runtime's `ValidateAndPrepareScript` and the Template
    /// Repository's embedding step before persisting (spec §3 invariant:
    /// `script_validated == true` on every stored template).
    pub fn new(id: impl Into<String>, name: impl Into<String>, execution_script: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            version: 1,
            name: name.into(),
            description: String::new(),
            category: Vec::new(),
            triggers: Triggers::default(),
            priority: 0,
            enabled: true,
            testing: true,
            parameter_schema: ParameterSchema::default(),
            execution_script: execution_script.into(),
            name_embedding: Vec::new(),
            embedding: Vec::new(),
            created_at: now,
            updated_at: now,
            last_repaired: None,
            repair_attempts: 0,
            auto_repair_history: Vec::new(),
            script_validated: false,
            script_escaped: false,
            generation_metadata: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_triggers(mut self, triggers: Triggers) -> Self {
        self.triggers = triggers;
        self
    }

    pub fn with_category(mut self, category: Vec<String>) -> Self {
        self.category = category;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Text embedded for `embedding` (spec §3: "vector over `name + description`").
    pub fn semantic_text(&self) -> String {
        format!("{} {}", self.name, self.description)
    }

    /// Bump `updated_at` (compiled-code cache key) and record a script mutation.
    /// Callers must recompute both embeddings and re-validate before persisting.
    pub fn mark_script_changed(&mut self, new_script: impl Into<String>, escaped: bool) {
        self.execution_script = new_script.into();
        self.script_escaped = escaped;
        self.script_validated = false;
        self.updated_at = Utc::now();
        self.version += 1;
    }

    pub fn mark_validated(&mut self) {
        self.script_validated = true;
    }

    pub fn record_repair(&mut self, task_id: impl Into<String>, error_kind: impl Into<String>, token_cost: u64) {
        let now = Utc::now();
        self.last_repaired = Some(now);
        self.repair_attempts += 1;
        self.auto_repair_history.push(RepairHistoryEntry {
            at: now,
            task_id: task_id.into(),
            error_kind: error_kind.into(),
            token_cost,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_template_defaults_unvalidated() {
        let t = Template::new("t1", "Report X", "let x = 1;");
        assert!(!t.script_validated);
        assert!(t.enabled);
        assert!(t.testing);
        assert_eq!(t.repair_attempts, 0);
    }

    #[test]
    fn mark_script_changed_invalidates_and_bumps_version() {
        let mut t = Template::new("t1", "Report X", "let x = 1;");
        t.mark_validated();
        let before_version = t.version;
        let before_updated = t.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        t.mark_script_changed("let x = 2;", false);
        assert!(!t.script_validated);
        assert!(t.version > before_version);
        assert!(t.updated_at > before_updated);
    }

    #[test]
    fn parameter_schema_rejects_missing_required_field() {
        let schema = ParameterSchema {
            properties: vec![ParameterProperty {
                name: "range".to_string(),
                required: true,
                value_type: "string".to_string(),
                default: None,
            }],
        };
        let params = HashMap::new();
        assert!(schema.validate(&params).is_err());
    }

    #[test]
    fn parameter_schema_accepts_defaulted_field() {
        let schema = ParameterSchema {
            properties: vec![ParameterProperty {
                name: "range".to_string(),
                required: true,
                value_type: "string".to_string(),
                default: Some(Value::String("30d".to_string())),
            }],
        };
        let params = HashMap::new();
        assert!(schema.validate(&params).is_ok());
    }

    #[test]
    fn record_repair_appends_history() {
        let mut t = Template::new("t1", "Report X", "let x = 1;");
        t.record_repair("task-1", "ClientApiError", 1200);
        assert_eq!(t.repair_attempts, 1);
        assert_eq!(t.auto_repair_history.len(), 1);
        assert!(t.last_repaired.is_some());
    }
}
