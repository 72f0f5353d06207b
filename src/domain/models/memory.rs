//! Reasoning memory domain model (spec §3 "ReasoningMemory").
//!
//! A lesson learned from a past execution, retrieved by the Repair Engine
//! (§4.6) to guide code generation, and updated with success/failure
//! statistics after each use. Owned exclusively by
//! [`crate::services::memory_store::MemoryStore`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category of a stored lesson (spec §3 `category`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    ExecutionStrategy,
    ErrorPattern,
    FixStrategy,
    Other,
}

impl MemoryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutionStrategy => "execution_strategy",
            Self::ErrorPattern => "error_pattern",
            Self::FixStrategy => "fix_strategy",
            Self::Other => "other",
        }
    }

    /// Categories the Repair Engine retrieves against (spec §4.6 step 1).
    pub fn is_repair_relevant(&self) -> bool {
        matches!(self, Self::ErrorPattern | Self::FixStrategy)
    }
}

/// Recorded user-intent annotations used by the Repair Engine's intent-mismatch
/// check (spec §3 `userIntent`, §4.6 precondition 2).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserIntent {
    pub original_request: String,
    pub wanted_new_task: bool,
    pub specified_custom_name: Option<String>,
    pub wanted_aggregate: bool,
    pub wanted_specific_entity: bool,
    pub intent_satisfied: Option<bool>,
    pub mismatch_reason: Option<String>,
    pub requests: Vec<String>,
}

impl UserIntent {
    /// Detect a *design* mismatch between what the user asked for and the
    /// template chosen to serve them (spec §4.6 precondition 2): the user
    /// wanted an aggregate view but the chosen template requires a specific
    /// entity id, or the user asked for a brand-new task by name but the
    /// system reused an existing template.
    pub fn detect_mismatch(&self, template: &super::template::Template) -> Option<String> {
        if let Some(reason) = &self.mismatch_reason {
            return Some(reason.clone());
        }
        let requires_entity_id = template
            .parameter_schema
            .properties
            .iter()
            .any(|p| p.required && (p.name.eq_ignore_ascii_case("id") || p.name.to_lowercase().ends_with("_id")));
        if self.wanted_aggregate && requires_entity_id {
            return Some("user requested an aggregate but the matched template requires a specific entity id".to_string());
        }
        if self.wanted_new_task && self.specified_custom_name.is_some() {
            return Some("user asked for a new task by name but an existing template was reused".to_string());
        }
        None
    }
}

/// A stored, vector-indexed lesson retrieved to guide code generation/repair
/// (spec §3 "ReasoningMemory").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningMemory {
    pub id: String,
    pub title: String,
    pub description: String,
    pub content: String,
    pub source: String,
    pub category: MemoryCategory,
    pub template_id: Option<String>,
    pub task_id: Option<String>,
    pub user_intent: Option<UserIntent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,

    pub times_retrieved: u64,
    pub times_used_in_success: u64,
    pub times_used_in_failure: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReasoningMemory {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
        category: MemoryCategory,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            content: content.into(),
            source: "system".to_string(),
            category,
            template_id: None,
            task_id: None,
            user_intent: None,
            embedding: None,
            times_retrieved: 0,
            times_used_in_success: 0,
            times_used_in_failure: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// `successRate = successes / (successes + failures)` when the
    /// denominator is non-zero (spec §3 invariant).
    pub fn success_rate(&self) -> Option<f32> {
        let total = self.times_used_in_success + self.times_used_in_failure;
        if total == 0 {
            None
        } else {
            Some(self.times_used_in_success as f32 / total as f32)
        }
    }

    /// Memory retrieval increments `times_retrieved` (spec §4.5
    /// `getMemoryEnhancedContext`).
    pub fn record_retrieval(&mut self) {
        self.times_retrieved += 1;
        self.updated_at = Utc::now();
    }

    /// Update success/failure counters through the only allowed path (spec §3
    /// invariant: "updates occur only through a counter-increment + recompute
    /// path").
    pub fn record_usage(&mut self, success: bool) {
        if success {
            self.times_used_in_success += 1;
        } else {
            self.times_used_in_failure += 1;
        }
        self.updated_at = Utc::now();
    }

    /// Cosine similarity between this memory's embedding and a query vector.
    /// `None` if either embedding is missing, empty, or dimensions mismatch.
    ///
    /// Grounded on `odgrim-abathur-swarm`'s
    /// `domain::models::memory::Memory::cosine_similarity`.
    pub fn cosine_similarity(&self, query_vector: &[f32]) -> Option<f32> {
        let embedding = self.embedding.as_ref()?;
        if embedding.is_empty() || embedding.len() != query_vector.len() {
            return None;
        }
        let dot: f32 = embedding.iter().zip(query_vector.iter()).map(|(a, b)| a * b).sum();
        let norm_a: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = query_vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            return None;
        }
        Some(dot / (norm_a * norm_b))
    }

    /// Weighted lexical similarity fallback when no embedding is available:
    /// 30% Jaccard word overlap + 50% TF-IDF-weighted overlap + 20% bigram
    /// overlap. Grounded on `odgrim-abathur-swarm`'s
    /// `domain::models::memory::Memory::text_similarity`.
    pub fn text_similarity(text_a: &str, text_b: &str) -> f32 {
        if text_a.is_empty() && text_b.is_empty() {
            return 1.0;
        }
        let lower_a = text_a.to_lowercase();
        let lower_b = text_b.to_lowercase();
        let words_a: Vec<&str> = lower_a.split_whitespace().collect();
        let words_b: Vec<&str> = lower_b.split_whitespace().collect();
        if words_a.is_empty() || words_b.is_empty() {
            return 0.0;
        }

        let set_a: std::collections::HashSet<&str> = words_a.iter().copied().collect();
        let set_b: std::collections::HashSet<&str> = words_b.iter().copied().collect();

        let intersection = set_a.intersection(&set_b).count() as f32;
        let union = set_a.union(&set_b).count() as f32;
        let jaccard = if union > 0.0 { intersection / union } else { 0.0 };

        const STOP_WORDS: &[&str] = &[
            "the", "a", "an", "is", "are", "was", "were", "be", "been", "being", "have", "has",
            "had", "do", "does", "did", "will", "would", "shall", "should", "may", "might",
            "must", "can", "could", "of", "in", "to", "for", "with", "on", "at", "from", "by",
            "and", "or", "but", "not", "this", "that", "it", "its", "as", "if", "then", "than",
            "so",
        ];

        let total_words = (words_a.len() + words_b.len()) as f32;
        let mut freq_a: HashMap<&str, f32> = HashMap::new();
        let mut freq_b: HashMap<&str, f32> = HashMap::new();
        for &w in &words_a {
            *freq_a.entry(w).or_default() += 1.0;
        }
        for &w in &words_b {
            *freq_b.entry(w).or_default() += 1.0;
        }

        let mut weighted_overlap = 0.0f32;
        let mut weight_sum = 0.0f32;
        for word in set_a.intersection(&set_b) {
            let combined_freq = freq_a.get(word).unwrap_or(&0.0) + freq_b.get(word).unwrap_or(&0.0);
            let idf_proxy = (total_words / combined_freq).ln().max(0.1);
            let stop_penalty = if STOP_WORDS.contains(word) { 0.1 } else { 1.0 };
            let weight = idf_proxy * stop_penalty;
            weighted_overlap += weight;
            weight_sum += weight;
        }
        for word in set_a.symmetric_difference(&set_b) {
            let combined_freq = freq_a.get(word).unwrap_or(&0.0) + freq_b.get(word).unwrap_or(&0.0);
            let idf_proxy = (total_words / combined_freq).ln().max(0.1);
            let stop_penalty = if STOP_WORDS.contains(word) { 0.1 } else { 1.0 };
            weight_sum += idf_proxy * stop_penalty;
        }
        let tf_idf_score = if weight_sum > 0.0 { weighted_overlap / weight_sum } else { 0.0 };

        let bigrams_a: std::collections::HashSet<String> =
            words_a.windows(2).map(|w| format!("{} {}", w[0], w[1])).collect();
        let bigrams_b: std::collections::HashSet<String> =
            words_b.windows(2).map(|w| format!("{} {}", w[0], w[1])).collect();
        let bigram_score = if bigrams_a.is_empty() && bigrams_b.is_empty() {
            jaccard
        } else {
            let bi_intersection = bigrams_a.intersection(&bigrams_b).count() as f32;
            let bi_union = bigrams_a.union(&bigrams_b).count() as f32;
            if bi_union > 0.0 { bi_intersection / bi_union } else { 0.0 }
        };

        (0.30 * jaccard + 0.50 * tf_idf_score + 0.20 * bigram_score).min(1.0)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("memory title cannot be empty".to_string());
        }
        if self.content.trim().is_empty() {
            return Err("memory content cannot be empty".to_string());
        }
        Ok(())
    }
}
