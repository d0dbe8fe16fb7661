//! Task classifier
//!
//! Assigns a task to a primary domain by counting keyword, file and
//! dependency signals per domain. Pure and deterministic: the same
//! context always yields the same classification.

use std::collections::BTreeMap;

use super::types::{Complexity, TaskClassification, TaskContext};
use super::vocabulary::{
    DOMAINS, DomainVocabulary, GENERAL_DOMAIN, contains_term, normalize_path,
    normalized_phrase_text, token_set, tokenize,
};
use super::builtin::GENERAL_PURPOSE_ROLE;

const KEYWORD_WEIGHT: f64 = 1.0;
const FILE_WEIGHT: f64 = 1.5;
const DEPENDENCY_WEIGHT: f64 = 1.0;
/// Top score at which the signal is considered saturated
const SATURATION_SCORE: f64 = 4.0;
/// Minimum share of the top score for a secondary domain
const SECONDARY_RATIO: f64 = 0.4;
const MAX_SECONDARY: usize = 2;
/// Confidence granted to a caller-provided primary domain
const HINTED_CONFIDENCE: f64 = 0.75;

#[derive(Debug, Default)]
struct DomainSignals {
    keywords: Vec<&'static str>,
    files: usize,
    dependencies: usize,
}

impl DomainSignals {
    fn score(&self) -> f64 {
        self.keywords.len() as f64 * KEYWORD_WEIGHT
            + self.files as f64 * FILE_WEIGHT
            + self.dependencies as f64 * DEPENDENCY_WEIGHT
    }
}

/// Keyword-based task classifier
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskClassifier;

impl TaskClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify a task into domains
    pub fn classify(&self, ctx: &TaskContext) -> TaskClassification {
        let signals = collect_signals(ctx);
        let scores: BTreeMap<&str, f64> = signals
            .iter()
            .map(|(domain, s)| (*domain, s.score()))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        let total: f64 = scores.values().sum();

        // BTreeMap iteration is alphabetical, so strict `>` keeps the
        // alphabetically first domain on ties.
        let mut top: Option<(&str, f64)> = None;
        for (&domain, &score) in &scores {
            if top.is_none_or(|(_, best)| score > best) {
                top = Some((domain, score));
            }
        }

        let mut reasons = Vec::new();
        let (mut primary, mut confidence) = match top {
            Some((domain, score)) => (domain.to_string(), confidence_for(score, total)),
            None => {
                reasons.push("No domain signals found".to_string());
                (GENERAL_DOMAIN.to_string(), 0.0)
            }
        };

        if let Some(hint) = ctx
            .primary_domain
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
        {
            let hint = hint.to_lowercase();
            let hinted_score = scores.get(hint.as_str()).copied().unwrap_or(0.0);
            confidence = confidence_for(hinted_score, total).max(HINTED_CONFIDENCE);
            reasons.push(format!("Primary domain '{}' provided by caller", hint));
            primary = hint;
        }

        let secondary_domains = if ctx.secondary_domains.is_empty() {
            secondary_from_scores(&scores, &primary)
        } else {
            ctx.secondary_domains
                .iter()
                .map(|d| d.to_lowercase())
                .filter(|d| d != &primary)
                .collect()
        };

        for (domain, s) in &signals {
            if *domain != primary && !secondary_domains.iter().any(|d| d == domain) {
                continue;
            }
            if !s.keywords.is_empty() {
                reasons.push(format!(
                    "Matched {} keywords: {}",
                    domain,
                    s.keywords.join(", ")
                ));
            }
            if s.files > 0 {
                reasons.push(format!("{} affected file(s) indicate {}", s.files, domain));
            }
            if s.dependencies > 0 {
                reasons.push(format!(
                    "{} dependency(ies) indicate {}",
                    s.dependencies, domain
                ));
            }
        }

        let complexity = ctx.complexity.unwrap_or_else(|| estimate_complexity(ctx));
        let suggested_agents = suggest_agents(&primary, &secondary_domains);

        TaskClassification {
            primary_domain: primary,
            secondary_domains,
            complexity,
            confidence,
            suggested_agents,
            reasons,
        }
    }
}

/// Share of the total signal, damped while the top score is small
fn confidence_for(score: f64, total: f64) -> f64 {
    if total <= 0.0 || score <= 0.0 {
        return 0.0;
    }
    let share = score / total;
    let saturation = (score / SATURATION_SCORE).min(1.0);
    (share * saturation).clamp(0.0, 1.0)
}

fn collect_signals(ctx: &TaskContext) -> Vec<(&'static str, DomainSignals)> {
    let description = ctx.description_text();
    let tokens = token_set(description);
    let phrase_text = normalized_phrase_text(description);
    let paths: Vec<String> = ctx.affected_files.iter().map(|f| normalize_path(f)).collect();
    let dep_tokens: Vec<Vec<String>> = ctx.dependencies.iter().map(|d| tokenize(d)).collect();

    DOMAINS
        .iter()
        .map(|vocab| (vocab.domain, domain_signals(vocab, &tokens, &phrase_text, &paths, &dep_tokens)))
        .collect()
}

fn domain_signals(
    vocab: &DomainVocabulary,
    tokens: &std::collections::BTreeSet<String>,
    phrase_text: &str,
    paths: &[String],
    dep_tokens: &[Vec<String>],
) -> DomainSignals {
    let keywords = vocab
        .keywords
        .iter()
        .chain(vocab.phrases.iter())
        .copied()
        .filter(|term| contains_term(tokens, phrase_text, term))
        .collect();

    let files = paths.iter().filter(|p| vocab.matches_path(p)).count();

    let dependencies = dep_tokens
        .iter()
        .filter(|dep| dep.iter().any(|t| vocab.keywords.contains(&t.as_str())))
        .count();

    DomainSignals {
        keywords,
        files,
        dependencies,
    }
}

fn secondary_from_scores(scores: &BTreeMap<&str, f64>, primary: &str) -> Vec<String> {
    let Some(top) = scores.get(primary).copied().or_else(|| {
        scores.values().copied().fold(None, |acc: Option<f64>, s| {
            Some(acc.map_or(s, |a| a.max(s)))
        })
    }) else {
        return Vec::new();
    };

    let mut candidates: Vec<(&str, f64)> = scores
        .iter()
        .filter(|(domain, score)| **domain != primary && **score >= top * SECONDARY_RATIO)
        .map(|(d, s)| (*d, *s))
        .collect();
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    candidates
        .into_iter()
        .take(MAX_SECONDARY)
        .map(|(d, _)| d.to_string())
        .collect()
}

fn estimate_complexity(ctx: &TaskContext) -> Complexity {
    let mut points = 0;

    points += match ctx.affected_files.len() {
        n if n > 10 => 2,
        n if n > 3 => 1,
        _ => 0,
    };
    points += match ctx.dependencies.len() {
        n if n > 5 => 2,
        n if n > 2 => 1,
        _ => 0,
    };
    points += match ctx.description_text().chars().count() {
        n if n > 500 => 2,
        n if n > 150 => 1,
        _ => 0,
    };

    match points {
        p if p >= 4 => Complexity::High,
        p if p >= 2 => Complexity::Medium,
        _ => Complexity::Low,
    }
}

fn suggest_agents(primary: &str, secondary: &[String]) -> Vec<String> {
    let mut agents: Vec<String> = Vec::new();
    for domain in std::iter::once(primary).chain(secondary.iter().map(String::as_str)) {
        if let Some(vocab) = DOMAINS.iter().find(|v| v.domain == domain) {
            for agent in vocab.agents {
                if !agents.iter().any(|a| a == agent) {
                    agents.push(agent.to_string());
                }
            }
        }
    }
    if agents.is_empty() {
        agents.push(GENERAL_PURPOSE_ROLE.to_string());
    }
    agents
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terraform_task() -> TaskContext {
        TaskContext::new("Set up AWS infrastructure with Terraform")
            .with_files(&["infra/main.tf", "infra/variables.tf"])
            .with_dependencies(&["terraform", "aws-cli"])
    }

    #[test]
    fn test_terraform_task_is_infrastructure() {
        let c = TaskClassifier::new().classify(&terraform_task());

        assert_eq!(c.primary_domain, "infrastructure");
        assert!((c.confidence - 1.0).abs() < 1e-9);
        assert!(c.secondary_domains.is_empty());
        assert_eq!(c.suggested_agents[0], "platform-engineer");
        assert!(c.reasons.iter().any(|r| r.contains("terraform")));
    }

    #[test]
    fn test_vague_task_is_general() {
        let ctx = TaskContext::new("Do something").with_files(&["file.txt"]);
        let c = TaskClassifier::new().classify(&ctx);

        assert_eq!(c.primary_domain, "general");
        assert_eq!(c.confidence, 0.0);
        assert_eq!(c.complexity, Complexity::Low);
        assert_eq!(c.suggested_agents, vec!["general-purpose"]);
        assert!(!c.reasons.is_empty());
    }

    #[test]
    fn test_empty_context() {
        let c = TaskClassifier::new().classify(&TaskContext::default());
        assert_eq!(c.primary_domain, "general");
        assert_eq!(c.confidence, 0.0);
    }

    #[test]
    fn test_deterministic() {
        let classifier = TaskClassifier::new();
        let ctx = TaskContext::new("Add a React component that calls the orders API")
            .with_files(&["src/components/Orders.tsx", "server/routes/orders.go"]);

        let first = classifier.classify(&ctx);
        for _ in 0..5 {
            assert_eq!(classifier.classify(&ctx), first);
        }
    }

    #[test]
    fn test_secondary_domains() {
        let ctx = TaskContext::new("Add a React component that calls the orders API")
            .with_files(&["src/components/Orders.tsx", "server/routes/orders.go"]);
        let c = TaskClassifier::new().classify(&ctx);

        assert_eq!(c.primary_domain, "frontend");
        assert_eq!(c.secondary_domains, vec!["backend"]);
        assert!(c.confidence > 0.0 && c.confidence < 1.0);
    }

    #[test]
    fn test_adding_signal_never_lowers_confidence() {
        let classifier = TaskClassifier::new();
        let base = TaskContext::new("Tune the kubernetes deployment and add a css tweak");
        let before = classifier.classify(&base);
        assert_eq!(before.primary_domain, "infrastructure");

        let more = base.clone().with_files(&["k8s/deployment.yaml"]);
        let after = classifier.classify(&more);
        assert_eq!(after.primary_domain, "infrastructure");
        assert!(after.confidence >= before.confidence);
    }

    #[test]
    fn test_caller_domain_hint() {
        let mut ctx = TaskContext::new("Do something");
        ctx.primary_domain = Some("Security".into());

        let c = TaskClassifier::new().classify(&ctx);
        assert_eq!(c.primary_domain, "security");
        assert_eq!(c.confidence, HINTED_CONFIDENCE);
        assert_eq!(c.suggested_agents, vec!["security-auditor"]);
    }

    #[test]
    fn test_complexity_estimate_and_override() {
        let files: Vec<String> = (0..12).map(|i| format!("src/f{}.rs", i)).collect();
        let deps = ["a", "b", "c", "d", "e", "f"];
        let ctx = TaskContext::new("refactor").with_files(&files).with_dependencies(&deps);

        assert_eq!(TaskClassifier::new().classify(&ctx).complexity, Complexity::High);

        let pinned = ctx.with_complexity(Complexity::Low);
        assert_eq!(TaskClassifier::new().classify(&pinned).complexity, Complexity::Low);
    }

    #[test]
    fn test_degenerate_inputs() {
        let long = "lorem ipsum ".repeat(1000);
        let files: Vec<String> = (0..1000).map(|i| format!("pkg/mod{}/file.txt", i)).collect();
        let ctx = TaskContext::new(long).with_files(&files);

        let c = TaskClassifier::new().classify(&ctx);
        assert_eq!(c.primary_domain, "general");
        assert_eq!(c.complexity, Complexity::High);

        let unicode = TaskContext::new("データベースの移行 🚀 sql スキーマ");
        let c = TaskClassifier::new().classify(&unicode);
        assert_eq!(c.primary_domain, "database");
    }
}
