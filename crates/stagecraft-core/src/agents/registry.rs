//! Agent capability registry
//!
//! Built once from a loader, then read-only. Inheritance is resolved at
//! build time: a capability naming a parent gets the parent's declared
//! domains, expertise and selection criteria merged into its own.

use std::collections::{BTreeSet, HashMap};
use tracing::info;

use super::loader::{AgentLoader, BuiltinAgentLoader};
use super::types::AgentCapability;
use crate::{Error, Result};

/// Immutable set of agent capabilities, keyed by role
#[derive(Debug, Clone, Default)]
pub struct AgentCapabilityRegistry {
    /// Sorted by role
    capabilities: Vec<AgentCapability>,
    index: HashMap<String, usize>,
}

impl AgentCapabilityRegistry {
    /// Build the registry from a loader
    pub async fn initialize(loader: &dyn AgentLoader) -> Result<Self> {
        let capabilities = loader.load().await?;
        let registry = Self::from_capabilities(capabilities)?;

        info!(
            capabilities = registry.len(),
            domains = registry.domain_count(),
            "Agent capability registry initialized"
        );

        Ok(registry)
    }

    /// Build the registry from the built-in roster
    pub async fn builtin() -> Result<Self> {
        Self::initialize(&BuiltinAgentLoader).await
    }

    /// Build the registry from an explicit capability list
    pub fn from_capabilities(raw: Vec<AgentCapability>) -> Result<Self> {
        let mut by_role: HashMap<&str, &AgentCapability> = HashMap::new();
        for cap in &raw {
            if cap.role.trim().is_empty() {
                return Err(Error::config("Agent capability with empty role"));
            }
            if by_role.insert(cap.role.as_str(), cap).is_some() {
                return Err(Error::config(format!(
                    "Duplicate agent role: {}",
                    cap.role
                )));
            }
        }

        let mut capabilities = Vec::with_capacity(raw.len());
        for cap in &raw {
            let resolved = match &cap.inherits {
                None => cap.clone(),
                Some(parent) if parent == &cap.role => {
                    return Err(Error::config(format!(
                        "Agent '{}' inherits from itself",
                        cap.role
                    )));
                }
                Some(parent) => {
                    let parent_cap = by_role.get(parent.as_str()).ok_or_else(|| {
                        Error::config(format!(
                            "Agent '{}' inherits from unknown role '{}'",
                            cap.role, parent
                        ))
                    })?;
                    merge_inherited(cap, parent_cap)
                }
            };

            validate(&resolved)?;
            capabilities.push(resolved);
        }

        capabilities.sort_by(|a, b| a.role.cmp(&b.role));
        let index = capabilities
            .iter()
            .enumerate()
            .map(|(i, cap)| (cap.role.clone(), i))
            .collect();

        Ok(Self {
            capabilities,
            index,
        })
    }

    /// All capabilities, sorted by role
    pub fn get_all(&self) -> &[AgentCapability] {
        &self.capabilities
    }

    pub fn get_by_role(&self, role: &str) -> Option<&AgentCapability> {
        self.index.get(role).map(|&i| &self.capabilities[i])
    }

    pub fn contains(&self, role: &str) -> bool {
        self.index.contains_key(role)
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Distinct domains covered by any capability
    pub fn domains(&self) -> BTreeSet<&str> {
        self.capabilities
            .iter()
            .flat_map(|c| c.domains.iter().map(String::as_str))
            .collect()
    }

    pub fn domain_count(&self) -> usize {
        self.domains().len()
    }
}

fn validate(cap: &AgentCapability) -> Result<()> {
    if cap.domains.is_empty() {
        return Err(Error::config(format!(
            "Agent '{}' declares no domains",
            cap.role
        )));
    }
    if cap.selection_criteria.is_empty() {
        return Err(Error::config(format!(
            "Agent '{}' declares no selection criteria",
            cap.role
        )));
    }
    if cap.priority > 100 {
        return Err(Error::config(format!(
            "Agent '{}' priority {} exceeds 100",
            cap.role, cap.priority
        )));
    }
    Ok(())
}

/// Single-level merge: the parent's own declared lists, not its ancestors'
fn merge_inherited(child: &AgentCapability, parent: &AgentCapability) -> AgentCapability {
    let mut merged = child.clone();
    if merged.description.is_empty() {
        merged.description = parent.description.clone();
    }
    merge_list(&mut merged.domains, &parent.domains);
    merge_list(&mut merged.expertise, &parent.expertise);
    merge_list(&mut merged.selection_criteria, &parent.selection_criteria);
    merged
}

fn merge_list(target: &mut Vec<String>, extra: &[String]) {
    for item in extra {
        if !target.iter().any(|t| t.eq_ignore_ascii_case(item)) {
            target.push(item.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cap(role: &str, domain: &str, criterion: &str) -> AgentCapability {
        AgentCapability::new(role, "")
            .with_domains(&[domain])
            .with_criteria(&[criterion])
    }

    #[tokio::test]
    async fn test_builtin_registry() {
        let registry = AgentCapabilityRegistry::builtin().await.unwrap();
        assert!(registry.contains("platform-engineer"));
        assert!(registry.contains("general-purpose"));
        assert!(registry.domain_count() >= 8);

        let roles: Vec<_> = registry.get_all().iter().map(|c| c.role.clone()).collect();
        let mut sorted = roles.clone();
        sorted.sort();
        assert_eq!(roles, sorted);
    }

    #[tokio::test]
    async fn test_inheritance_merges_parent_lists() {
        let registry = AgentCapabilityRegistry::builtin().await.unwrap();
        let sre = registry.get_by_role("site-reliability-engineer").unwrap();

        assert!(sre.expertise.iter().any(|e| e == "monitoring"));
        assert!(sre.expertise.iter().any(|e| e == "terraform"));
        assert!(sre.selection_criteria.iter().any(|c| c == "prometheus"));
        assert!(sre.selection_criteria.iter().any(|c| c == "tf"));
        // no duplicate from the shared domain
        assert_eq!(sre.domains, vec!["infrastructure"]);
        assert_eq!(sre.priority, 70);
    }

    #[test]
    fn test_duplicate_role_rejected() {
        let result = AgentCapabilityRegistry::from_capabilities(vec![
            cap("a", "backend", "go"),
            cap("a", "frontend", "tsx"),
        ]);
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_empty_lists_rejected() {
        let no_domains = AgentCapability::new("a", "").with_criteria(&["go"]);
        assert!(AgentCapabilityRegistry::from_capabilities(vec![no_domains]).is_err());

        let no_criteria = AgentCapability::new("a", "").with_domains(&["backend"]);
        assert!(AgentCapabilityRegistry::from_capabilities(vec![no_criteria]).is_err());
    }

    #[test]
    fn test_child_without_criteria_inherits_them() {
        let child = AgentCapability::new("child", "")
            .with_domains(&["backend"])
            .inheriting("parent");
        let registry = AgentCapabilityRegistry::from_capabilities(vec![
            child,
            cap("parent", "backend", "go"),
        ])
        .unwrap();

        assert_eq!(
            registry.get_by_role("child").unwrap().selection_criteria,
            vec!["go"]
        );
    }

    #[test]
    fn test_unknown_and_self_parent_rejected() {
        let unknown = cap("a", "backend", "go").inheriting("missing");
        assert!(AgentCapabilityRegistry::from_capabilities(vec![unknown]).is_err());

        let selfish = cap("a", "backend", "go").inheriting("a");
        assert!(AgentCapabilityRegistry::from_capabilities(vec![selfish]).is_err());
    }

    #[test]
    fn test_inheritance_is_single_level() {
        let grandparent = AgentCapability::new("gp", "")
            .with_domains(&["data"])
            .with_criteria(&["csv"]);
        let parent = cap("p", "backend", "go").inheriting("gp");
        let child = cap("c", "frontend", "tsx").inheriting("p");

        let registry =
            AgentCapabilityRegistry::from_capabilities(vec![grandparent, parent, child]).unwrap();
        let c = registry.get_by_role("c").unwrap();
        assert_eq!(c.domains, vec!["frontend", "backend"]);
        assert!(!c.selection_criteria.iter().any(|x| x == "csv"));
    }

    #[test]
    fn test_empty_registry() {
        let registry = AgentCapabilityRegistry::from_capabilities(vec![]).unwrap();
        assert!(registry.is_empty());
        assert_eq!(registry.domain_count(), 0);
        assert!(registry.get_by_role("anything").is_none());
    }
}
