//! Dynamic agent resolver
//!
//! Combines classifier, analyzer and matcher to pick the best-suited agent
//! for a task, falling back to a generalist when no candidate is
//! convincing.

use std::sync::Arc;
use tracing::{debug, info};

use super::analyzer::ContextAnalyzer;
use super::classifier::TaskClassifier;
use super::matcher::{AgentCapabilityMatcher, TaskText};
use super::registry::AgentCapabilityRegistry;
use super::types::{
    AgentAlternative, AgentScore, AgentSelection, DetailedAnalysis, ServiceHealth, TaskContext,
};
use crate::config::ResolverConfig;

const MAX_ALTERNATIVES: usize = 2;

/// Resolves tasks to agent roles
#[derive(Debug, Clone)]
pub struct DynamicAgentResolver {
    registry: Arc<AgentCapabilityRegistry>,
    classifier: TaskClassifier,
    analyzer: ContextAnalyzer,
    matcher: AgentCapabilityMatcher,
    config: ResolverConfig,
}

impl DynamicAgentResolver {
    pub fn new(registry: Arc<AgentCapabilityRegistry>, config: ResolverConfig) -> Self {
        let matcher = AgentCapabilityMatcher::new(config.weights);
        Self {
            registry,
            classifier: TaskClassifier::new(),
            analyzer: ContextAnalyzer::new(),
            matcher,
            config,
        }
    }

    pub fn registry(&self) -> &AgentCapabilityRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Choose an agent for the task
    pub fn resolve_agent(&self, ctx: &TaskContext) -> AgentSelection {
        self.get_detailed_analysis(ctx).selection
    }

    /// Resolve and return every intermediate artifact
    pub fn get_detailed_analysis(&self, ctx: &TaskContext) -> DetailedAnalysis {
        let classification = self.classifier.classify(ctx);
        let codebase_context = self.analyzer.analyze(ctx);
        let text = TaskText::new(ctx);

        let mut scores: Vec<AgentScore> = self
            .registry
            .get_all()
            .iter()
            .map(|cap| {
                self.matcher
                    .score(cap, &classification, &codebase_context, &text)
            })
            .collect();
        scores.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.capability.priority.cmp(&a.capability.priority))
                .then_with(|| a.capability.role.cmp(&b.capability.role))
        });

        let selection = self.select(&scores, classification.confidence);

        debug!(
            primary_domain = %classification.primary_domain,
            classification_confidence = classification.confidence,
            candidates = scores.len(),
            "Agent analysis complete"
        );
        info!(
            agent = %selection.effective_agent(),
            selected = %selection.selected_agent,
            confidence = selection.confidence,
            fallback = selection.fallback,
            "Agent resolved"
        );

        DetailedAnalysis {
            classification,
            codebase_context,
            scores,
            selection,
        }
    }

    fn select(&self, scores: &[AgentScore], classification_confidence: f64) -> AgentSelection {
        let fallback_role = self.config.fallback_agent.clone();

        let Some(best) = scores.first() else {
            return AgentSelection {
                selected_agent: fallback_role.clone(),
                confidence: 0.0,
                reasons: vec!["No agent capabilities registered".to_string()],
                alternatives: vec![],
                fallback: true,
                fallback_agent: Some(fallback_role),
            };
        };

        let top = best.score;
        let below_hard_floor = top < self.config.hard_floor;
        let fallback = below_hard_floor || top < self.config.confidence_floor;

        let mut reasons = best.reasons.clone();
        let fallback_agent = if fallback {
            let floor = if below_hard_floor { "hard floor" } else { "confidence floor" };
            reasons.push(format!(
                "Top score {:.2} is below the {}; using fallback agent",
                top, floor
            ));
            if classification_confidence >= self.config.confidence_floor {
                reasons.push(format!(
                    "Task classified with confidence {:.2}, but no agent matched it strongly",
                    classification_confidence
                ));
            }
            // An unregistered fallback role degrades to the best candidate
            if self.registry.contains(&fallback_role) {
                Some(fallback_role)
            } else {
                Some(best.capability.role.clone())
            }
        } else {
            None
        };

        let alternatives = scores
            .iter()
            .skip(1)
            .take(MAX_ALTERNATIVES)
            .map(|s| AgentAlternative {
                role: s.capability.role.clone(),
                score: s.score,
            })
            .collect();

        AgentSelection {
            selected_agent: best.capability.role.clone(),
            confidence: top,
            reasons,
            alternatives,
            fallback,
            fallback_agent,
        }
    }

    /// Report whether the resolver can produce meaningful selections
    pub fn validate_services(&self) -> ServiceHealth {
        let mut issues = Vec::new();

        if self.registry.is_empty() {
            issues.push("No agent capabilities registered".to_string());
        }
        if !self.registry.contains(&self.config.fallback_agent) {
            issues.push(format!(
                "Fallback agent '{}' is not registered",
                self.config.fallback_agent
            ));
        }
        if self.config.hard_floor > self.config.confidence_floor {
            issues.push(format!(
                "Hard floor {} exceeds confidence floor {}",
                self.config.hard_floor, self.config.confidence_floor
            ));
        }

        ServiceHealth {
            healthy: issues.is_empty(),
            capability_count: self.registry.len(),
            domain_count: self.registry.domain_count(),
            issues,
        }
    }
}
