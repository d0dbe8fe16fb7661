//! Capability matcher
//!
//! Scores one capability against a classified task:
//!
//! ```text
//! base  = (w_d * domain + w_c * criteria + w_e * expertise) / (w_d + w_c + w_e)
//! score = base * (1 - w_p + w_p * priority / 100)
//! ```
//!
//! `domain` is 1.0 for the primary domain and 0.5 for a secondary one,
//! scaled by classification confidence. `criteria` and `expertise` saturate
//! after three matches.

use std::collections::BTreeSet;

use super::types::{AgentCapability, AgentScore, CodebaseContext, TaskClassification, TaskContext};
use super::vocabulary::{contains_term, normalized_phrase_text, token_set};
use crate::config::MatchWeights;

const SECONDARY_DOMAIN_MATCH: f64 = 0.5;
const SATURATION_MATCHES: usize = 3;

/// Prepared description text, reused across every capability scored
pub struct TaskText {
    tokens: BTreeSet<String>,
    phrase_text: String,
}

impl TaskText {
    pub fn new(ctx: &TaskContext) -> Self {
        let description = ctx.description_text();
        Self {
            tokens: token_set(description),
            phrase_text: normalized_phrase_text(description),
        }
    }

    fn contains(&self, term: &str) -> bool {
        contains_term(&self.tokens, &self.phrase_text, term)
    }
}

/// Weighted capability scorer
#[derive(Debug, Clone, Default)]
pub struct AgentCapabilityMatcher {
    weights: MatchWeights,
}

impl AgentCapabilityMatcher {
    pub fn new(weights: MatchWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &MatchWeights {
        &self.weights
    }

    /// Score a capability; the result is always within [0, 1]
    pub fn score(
        &self,
        capability: &AgentCapability,
        classification: &TaskClassification,
        codebase: &CodebaseContext,
        text: &TaskText,
    ) -> AgentScore {
        let mut reasons = Vec::new();

        let domain_match = if capability.has_domain(&classification.primary_domain) {
            reasons.push(format!(
                "Covers primary domain '{}'",
                classification.primary_domain
            ));
            1.0
        } else if let Some(secondary) = classification
            .secondary_domains
            .iter()
            .find(|d| capability.has_domain(d))
        {
            reasons.push(format!("Covers secondary domain '{}'", secondary));
            SECONDARY_DOMAIN_MATCH
        } else {
            0.0
        };
        let domain = domain_match * classification.confidence;

        let signals: BTreeSet<&str> = codebase.signals().into_iter().collect();
        let matched_criteria: Vec<&str> = capability
            .selection_criteria
            .iter()
            .map(String::as_str)
            .filter(|c| signals.contains(c.to_lowercase().as_str()))
            .collect();
        let criteria = saturating_ratio(
            matched_criteria.len(),
            capability.selection_criteria.len().min(SATURATION_MATCHES),
        );
        if !matched_criteria.is_empty() {
            reasons.push(format!(
                "Matches codebase signals: {}",
                matched_criteria.join(", ")
            ));
        }

        let matched_expertise: Vec<&str> = capability
            .expertise
            .iter()
            .map(String::as_str)
            .filter(|e| text.contains(e))
            .collect();
        let expertise = saturating_ratio(matched_expertise.len(), SATURATION_MATCHES);
        if !matched_expertise.is_empty() {
            reasons.push(format!("Expertise in: {}", matched_expertise.join(", ")));
        }

        let w = &self.weights;
        let weight_sum = w.domain + w.criteria + w.expertise;
        let base = if weight_sum > 0.0 {
            (w.domain * domain + w.criteria * criteria + w.expertise * expertise) / weight_sum
        } else {
            0.0
        };

        let priority = f64::from(capability.priority.min(100)) / 100.0;
        let priority_weight = w.priority.clamp(0.0, 1.0);
        let score = (base * (1.0 - priority_weight + priority_weight * priority)).clamp(0.0, 1.0);

        if reasons.is_empty() {
            reasons.push("No matching signals".to_string());
        }

        AgentScore {
            capability: capability.clone(),
            score,
            reasons,
        }
    }
}

fn saturating_ratio(matched: usize, saturation: usize) -> f64 {
    if saturation == 0 {
        return 0.0;
    }
    (matched as f64 / saturation as f64).min(1.0)
}
