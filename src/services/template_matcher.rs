//! Template Matcher (spec §4.3 "TM").
//!
//! Maps a free-form user message to at most one enabled template. LLM-first:
//! asks the LLM to classify against a compact candidate table and requires a
//! strict JSON response. Falls back to deterministic scoring only when the
//! LLM call itself fails outright, not merely when it returns `none`.
//!
//! The fallback's weighted-composite-scoring idiom is grounded on
//! `odgrim-abathur-swarm`'s `domain::models::memory::Memory::relevance_score`
//! (several weighted sub-scores summed, then thresholded) — here substituting
//! trigger/keyword/phrase sub-scores for that module's semantic/decay/
//! importance sub-scores.

use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;

use crate::domain::errors::DomainResult;
use crate::domain::models::Template;
use crate::domain::ports::{CompletionRequest, LlmService};

/// LLM confidence in its chosen match (spec §4.3 `confidence ∈ {high, medium, none}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    None,
}

/// Outcome of a match attempt: `template_id: None` means no match, which is
/// the signal for the outer system to synthesize a new template (out of
/// scope here, per spec §4.3).
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub template_id: Option<String>,
    pub confidence: Confidence,
    pub reasoning: String,
}

/// Raw shape of the LLM's required JSON response (spec §4.3 step 2).
#[derive(Debug, Deserialize)]
struct LlmMatchResponse {
    #[serde(rename = "templateId")]
    template_id: Option<String>,
    confidence: Confidence,
    reasoning: String,
}

const FALLBACK_SCORE_THRESHOLD: f32 = 0.3;
const EXPLICIT_REPORT_PHRASES: &[&str] = &["generate", "create", "run", "show me report"];

pub struct TemplateMatcher {
    llm: Arc<dyn LlmService>,
}

impl TemplateMatcher {
    pub fn new(llm: Arc<dyn LlmService>) -> Self {
        Self { llm }
    }

    /// `Match(message, contextType, candidates)` (spec §4.3). `candidates`
    /// must already be filtered to `enabled == true` templates — this
    /// matcher does not itself load the template set.
    pub async fn match_message(&self, message: &str, context_type: &str, candidates: &[Template]) -> DomainResult<MatchOutcome> {
        if candidates.is_empty() {
            return Ok(MatchOutcome { template_id: None, confidence: Confidence::None, reasoning: "no enabled templates".to_string() });
        }

        match self.ask_llm(message, context_type, candidates).await {
            Ok(response) => {
                let template_id = response
                    .template_id
                    .filter(|id| candidates.iter().any(|t| &t.id == id));
                Ok(MatchOutcome { template_id, confidence: response.confidence, reasoning: response.reasoning })
            }
            Err(_) => Ok(Self::fallback_match(message, candidates)),
        }
    }

    async fn ask_llm(&self, message: &str, context_type: &str, candidates: &[Template]) -> DomainResult<LlmMatchResponse> {
        let table = build_candidate_table(candidates);
        let user_prompt = format!(
            "Message: {message}\nContext type: {context_type}\n\nCandidate templates:\n{table}\n\n\
             Respond with exactly one JSON object: {{\"templateId\": <id or null>, \"confidence\": \"high\"|\"medium\"|\"none\", \"reasoning\": <string>}}."
        );
        let completion = self
            .llm
            .complete(CompletionRequest {
                system_prompt: "You classify a user message against a fixed set of automation templates. \
                    Respond with strict JSON and no commentary."
                    .to_string(),
                user_prompt,
                json_mode: true,
                max_tokens: Some(256),
            })
            .await?;
        serde_json::from_str(&completion.text)
            .map_err(|e| crate::domain::errors::TaskError::FormatError(format!("unparseable template-match response: {e}")))
    }

    /// Deterministic fallback (spec §4.3 step 4), used only on complete LLM
    /// failure. Highest score above [`FALLBACK_SCORE_THRESHOLD`] wins; ties
    /// broken by higher `priority`.
    fn fallback_match(message: &str, candidates: &[Template]) -> MatchOutcome {
        let lower_message = message.to_lowercase();
        let mut best: Option<(&Template, f32)> = None;

        for template in candidates {
            let score = score_template(&lower_message, template);
            if score <= FALLBACK_SCORE_THRESHOLD {
                continue;
            }
            best = match best {
                Some((current, current_score))
                    if current_score > score || (current_score == score && current.priority >= template.priority) =>
                {
                    Some((current, current_score))
                }
                _ => Some((template, score)),
            };
        }

        match best {
            Some((template, score)) => MatchOutcome {
                template_id: Some(template.id.clone()),
                confidence: Confidence::Medium,
                reasoning: format!("fallback scoring matched '{}' with score {score:.2}", template.name),
            },
            None => MatchOutcome { template_id: None, confidence: Confidence::None, reasoning: "no fallback candidate scored above threshold".to_string() },
        }
    }
}

/// Composite fallback score for one candidate: trigger patterns (+0.6..0.8),
/// keyword overlap (up to +0.25, min +0.15 on any hit), explicit report
/// phrase (+0.1).
fn score_template(lower_message: &str, template: &Template) -> f32 {
    let mut score = 0.0f32;

    let pattern_hits = template
        .triggers
        .patterns
        .iter()
        .filter(|pattern| {
            Regex::new(pattern).is_ok_and(|re| re.is_match(lower_message))
        })
        .count();
    if pattern_hits > 0 {
        score += (0.6 + 0.1 * (pattern_hits - 1) as f32).min(0.8);
    }

    if !template.triggers.keywords.is_empty() {
        let hits = template.triggers.keywords.iter().filter(|kw| lower_message.contains(&kw.to_lowercase())).count();
        if hits > 0 {
            let overlap = hits as f32 / template.triggers.keywords.len() as f32;
            score += (0.25 * overlap).max(0.15);
        }
    }

    if EXPLICIT_REPORT_PHRASES.iter().any(|phrase| lower_message.starts_with(phrase)) {
        score += 0.1;
    }

    score
}

fn build_candidate_table(candidates: &[Template]) -> String {
    use std::fmt::Write;

    let mut table = String::new();
    for template in candidates {
        let _ = writeln!(
            table,
            "- id={} name={:?} description={:?} category={:?} keywords={:?}",
            template.id, template.name, template.description, template.category, template.triggers.keywords
        );
    }
    table
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::domain::models::template::Triggers;
    use crate::domain::ports::CompletionResponse;

    struct ScriptedLlm {
        response: String,
    }

    #[async_trait]
    impl LlmService for ScriptedLlm {
        async fn complete(&self, _request: CompletionRequest) -> DomainResult<CompletionResponse> {
            Ok(CompletionResponse { text: self.response.clone(), tokens_used: 10 })
        }
    }

    struct FailingLlm;

    #[async_trait]
    impl LlmService for FailingLlm {
        async fn complete(&self, _request: CompletionRequest) -> DomainResult<CompletionResponse> {
            Err(crate::domain::errors::TaskError::Network("connection refused".to_string()))
        }
    }

    fn template_with_triggers(id: &str, patterns: &[&str], keywords: &[&str], priority: i32) -> Template {
        Template::new(id, format!("Template {id}"), "updateProgress(100, \"done\");")
            .with_triggers(Triggers {
                patterns: patterns.iter().map(|s| s.to_string()).collect(),
                keywords: keywords.iter().map(|s| s.to_string()).collect(),
                contexts: Vec::new(),
            })
            .with_priority(priority)
    }

    #[tokio::test]
    async fn llm_match_is_accepted_when_template_id_is_a_known_candidate() {
        let candidates = vec![template_with_triggers("tmpl-1", &[], &[], 0)];
        let matcher = TemplateMatcher::new(Arc::new(ScriptedLlm {
            response: r#"{"templateId": "tmpl-1", "confidence": "high", "reasoning": "exact match"}"#.to_string(),
        }));
        let outcome = matcher.match_message("run the weekly report", "chat", &candidates).await.unwrap();
        assert_eq!(outcome.template_id, Some("tmpl-1".to_string()));
        assert_eq!(outcome.confidence, Confidence::High);
    }

    #[tokio::test]
    async fn llm_match_with_unknown_template_id_is_dropped() {
        let candidates = vec![template_with_triggers("tmpl-1", &[], &[], 0)];
        let matcher = TemplateMatcher::new(Arc::new(ScriptedLlm {
            response: r#"{"templateId": "tmpl-unknown", "confidence": "high", "reasoning": "hallucinated"}"#.to_string(),
        }));
        let outcome = matcher.match_message("run the weekly report", "chat", &candidates).await.unwrap();
        assert_eq!(outcome.template_id, None);
    }

    #[tokio::test]
    async fn llm_none_confidence_is_not_a_match() {
        let candidates = vec![template_with_triggers("tmpl-1", &[], &[], 0)];
        let matcher = TemplateMatcher::new(Arc::new(ScriptedLlm {
            response: r#"{"templateId": null, "confidence": "none", "reasoning": "no good fit"}"#.to_string(),
        }));
        let outcome = matcher.match_message("what's the weather", "chat", &candidates).await.unwrap();
        assert_eq!(outcome.template_id, None);
        assert_eq!(outcome.confidence, Confidence::None);
    }

    #[tokio::test]
    async fn falls_back_to_deterministic_scoring_on_llm_failure() {
        let candidates = vec![template_with_triggers("tmpl-1", &["weekly report"], &["report", "weekly"], 0)];
        let matcher = TemplateMatcher::new(Arc::new(FailingLlm));
        let outcome = matcher.match_message("please send me the weekly report", "chat", &candidates).await.unwrap();
        assert_eq!(outcome.template_id, Some("tmpl-1".to_string()));
        assert_eq!(outcome.confidence, Confidence::Medium);
    }

    #[tokio::test]
    async fn fallback_returns_no_match_below_threshold() {
        let candidates = vec![template_with_triggers("tmpl-1", &[], &["unrelated"], 0)];
        let matcher = TemplateMatcher::new(Arc::new(FailingLlm));
        let outcome = matcher.match_message("hello there", "chat", &candidates).await.unwrap();
        assert_eq!(outcome.template_id, None);
        assert_eq!(outcome.confidence, Confidence::None);
    }

    #[tokio::test]
    async fn fallback_breaks_ties_by_priority() {
        let candidates = vec![
            template_with_triggers("tmpl-low", &["weekly report"], &[], 0),
            template_with_triggers("tmpl-high", &["weekly report"], &[], 5),
        ];
        let matcher = TemplateMatcher::new(Arc::new(FailingLlm));
        let outcome = matcher.match_message("weekly report please", "chat", &candidates).await.unwrap();
        assert_eq!(outcome.template_id, Some("tmpl-high".to_string()));
    }

    #[tokio::test]
    async fn empty_candidate_set_is_immediately_no_match() {
        let matcher = TemplateMatcher::new(Arc::new(FailingLlm));
        let outcome = matcher.match_message("anything", "chat", &[]).await.unwrap();
        assert_eq!(outcome.template_id, None);
    }
}
