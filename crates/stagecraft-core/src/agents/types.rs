//! Agent resolution types
//!
//! - AgentCapability: what a specialist executor is good at
//! - TaskContext: the task an agent is being chosen for
//! - TaskClassification / CodebaseContext: intermediate analysis
//! - AgentScore / AgentSelection: scoring and the final choice

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Capability of a specialist agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapability {
    /// Unique role name (e.g. "platform-engineer")
    pub role: String,
    #[serde(default)]
    pub description: String,
    /// Domains this agent covers
    #[serde(default)]
    pub domains: Vec<String>,
    /// Expertise keywords matched against the task description
    #[serde(default)]
    pub expertise: Vec<String>,
    /// File/technology tags matched against codebase signals
    #[serde(default)]
    pub selection_criteria: Vec<String>,
    /// Tie-break weight, 0..=100
    #[serde(default)]
    pub priority: u32,
    /// Parent role whose declared lists are merged in at registry build time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherits: Option<String>,
}

impl AgentCapability {
    pub fn new(role: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            description: description.into(),
            domains: vec![],
            expertise: vec![],
            selection_criteria: vec![],
            priority: 50,
            inherits: None,
        }
    }

    pub fn with_domains(mut self, domains: &[&str]) -> Self {
        self.domains = domains.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_expertise(mut self, expertise: &[&str]) -> Self {
        self.expertise = expertise.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_criteria(mut self, criteria: &[&str]) -> Self {
        self.selection_criteria = criteria.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn inheriting(mut self, parent: impl Into<String>) -> Self {
        self.inherits = Some(parent.into());
        self
    }

    pub fn has_domain(&self, domain: &str) -> bool {
        self.domains.iter().any(|d| d.eq_ignore_ascii_case(domain))
    }
}

/// Task complexity tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    #[default]
    Low,
    Medium,
    High,
}

/// Task an agent is being selected for
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskContext {
    /// Free-text description; may be absent
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub affected_files: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<Complexity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_domain: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secondary_domains: Vec<String>,
}

impl TaskContext {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..Default::default()
        }
    }

    pub fn with_files<S: AsRef<str>>(mut self, files: &[S]) -> Self {
        self.affected_files = files.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn with_dependencies<S: AsRef<str>>(mut self, deps: &[S]) -> Self {
        self.dependencies = deps.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = Some(complexity);
        self
    }

    /// Description text, empty when absent
    pub fn description_text(&self) -> &str {
        self.description.as_deref().unwrap_or("")
    }
}

/// Output of the task classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskClassification {
    pub primary_domain: String,
    pub secondary_domains: Vec<String>,
    pub complexity: Complexity,
    /// 0..=1
    pub confidence: f64,
    pub suggested_agents: Vec<String>,
    pub reasons: Vec<String>,
}

/// Codebase signals derived from file paths and dependency names
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodebaseContext {
    /// Extension (or well-known filename) -> count
    pub affected_file_types: BTreeMap<String, usize>,
    pub architectural_patterns: Vec<String>,
    pub import_patterns: Vec<String>,
    pub infrastructure_components: Vec<String>,
    pub technology_stack: Vec<String>,
}

impl CodebaseContext {
    /// All observed tags, lowercase, for criteria matching
    pub fn signals(&self) -> Vec<&str> {
        let mut signals: Vec<&str> = self
            .affected_file_types
            .keys()
            .map(String::as_str)
            .chain(self.architectural_patterns.iter().map(String::as_str))
            .chain(self.import_patterns.iter().map(String::as_str))
            .chain(self.infrastructure_components.iter().map(String::as_str))
            .chain(self.technology_stack.iter().map(String::as_str))
            .collect();
        signals.sort_unstable();
        signals.dedup();
        signals
    }

    pub fn is_empty(&self) -> bool {
        self.affected_file_types.is_empty()
            && self.architectural_patterns.is_empty()
            && self.import_patterns.is_empty()
            && self.infrastructure_components.is_empty()
            && self.technology_stack.is_empty()
    }
}

/// Score of one candidate capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentScore {
    pub capability: AgentCapability,
    /// 0..=1
    pub score: f64,
    pub reasons: Vec<String>,
}

/// Runner-up candidate in a selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAlternative {
    pub role: String,
    pub score: f64,
}

/// Final agent choice for a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSelection {
    /// Best-ranked candidate
    pub selected_agent: String,
    /// 0..=1
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub alternatives: Vec<AgentAlternative>,
    /// True when no candidate had a strong enough signal
    pub fallback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_agent: Option<String>,
}

impl AgentSelection {
    /// The agent that should actually run: the fallback agent when the
    /// selection is a fallback, otherwise the selected agent.
    pub fn effective_agent(&self) -> &str {
        match (&self.fallback_agent, self.fallback) {
            (Some(agent), true) => agent,
            _ => &self.selected_agent,
        }
    }
}

/// Health report of the resolver's collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub healthy: bool,
    pub capability_count: usize,
    pub domain_count: usize,
    pub issues: Vec<String>,
}

/// Every intermediate artifact of one resolution, for diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedAnalysis {
    pub classification: TaskClassification,
    pub codebase_context: CodebaseContext,
    /// Sorted best first
    pub scores: Vec<AgentScore>,
    pub selection: AgentSelection,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_builder() {
        let cap = AgentCapability::new("platform-engineer", "Infra")
            .with_domains(&["infrastructure"])
            .with_criteria(&["terraform"])
            .with_priority(90);

        assert!(cap.has_domain("Infrastructure"));
        assert!(!cap.has_domain("frontend"));
        assert_eq!(cap.priority, 90);
    }

    #[test]
    fn test_task_context_deserialize_camel_case() {
        let json = r#"{
            "description": null,
            "affectedFiles": ["infra/main.tf"],
            "dependencies": ["terraform"]
        }"#;

        let ctx: TaskContext = serde_json::from_str(json).unwrap();
        assert_eq!(ctx.description_text(), "");
        assert_eq!(ctx.affected_files, vec!["infra/main.tf"]);
        assert!(ctx.complexity.is_none());
    }

    #[test]
    fn test_codebase_signals_dedup() {
        let mut ctx = CodebaseContext::default();
        ctx.affected_file_types.insert("tf".into(), 2);
        ctx.infrastructure_components.push("terraform".into());
        ctx.technology_stack.push("terraform".into());

        assert_eq!(ctx.signals(), vec!["terraform", "tf"]);
        assert!(!ctx.is_empty());
    }

    #[test]
    fn test_effective_agent() {
        let mut selection = AgentSelection {
            selected_agent: "frontend-developer".into(),
            confidence: 0.2,
            reasons: vec!["weak".into()],
            alternatives: vec![],
            fallback: true,
            fallback_agent: Some("general-purpose".into()),
        };
        assert_eq!(selection.effective_agent(), "general-purpose");

        selection.fallback = false;
        assert_eq!(selection.effective_agent(), "frontend-developer");
    }
}
