//! Built-in agent capability set

use super::types::AgentCapability;

/// Role of the generalist used when no specialist fits
pub const GENERAL_PURPOSE_ROLE: &str = "general-purpose";

/// The default specialist roster
pub fn builtin_capabilities() -> Vec<AgentCapability> {
    vec![
        AgentCapability::new(
            "platform-engineer",
            "Cloud infrastructure, provisioning, containers and delivery pipelines",
        )
        .with_domains(&["infrastructure"])
        .with_expertise(&[
            "infrastructure", "terraform", "cloud", "aws", "gcp", "azure", "kubernetes",
            "docker", "deployment", "provisioning", "networking", "vpc",
        ])
        .with_criteria(&[
            "terraform", "tf", "hcl", "aws", "gcp", "azure", "kubernetes", "docker", "helm",
            "github-actions", "infrastructure-as-code", "container-orchestration", "ansible",
        ])
        .with_priority(90),
        AgentCapability::new(
            "site-reliability-engineer",
            "Monitoring, alerting and production reliability",
        )
        .inheriting("platform-engineer")
        .with_domains(&["infrastructure"])
        .with_expertise(&[
            "monitoring", "observability", "alerting", "incident", "reliability", "slo",
            "uptime", "latency",
        ])
        .with_criteria(&["prometheus", "grafana", "datadog", "opentelemetry"])
        .with_priority(70),
        AgentCapability::new(
            "frontend-developer",
            "User interfaces, components, styling and browser behavior",
        )
        .with_domains(&["frontend"])
        .with_expertise(&[
            "react", "vue", "angular", "component", "ui", "css", "accessibility", "responsive",
            "frontend", "layout", "state",
        ])
        .with_criteria(&[
            "tsx", "jsx", "vue", "svelte", "css", "scss", "html", "react", "angular", "nextjs",
            "tailwind", "component-based",
        ])
        .with_priority(80),
        AgentCapability::new(
            "backend-developer",
            "Services, APIs, request handling and server-side logic",
        )
        .with_domains(&["backend"])
        .with_expertise(&[
            "api", "endpoint", "server", "service", "rest", "graphql", "middleware", "backend",
            "handler", "performance",
        ])
        .with_criteria(&[
            "rest-api", "service-layer", "mvc", "go", "java", "python", "rust", "express",
            "django", "flask", "fastapi", "axum", "nestjs", "graphql",
        ])
        .with_priority(80),
        AgentCapability::new(
            "database-engineer",
            "Schemas, migrations, queries and storage performance",
        )
        .with_domains(&["database"])
        .with_expertise(&[
            "database", "sql", "schema", "migration", "query", "index", "postgres", "mysql",
            "orm", "transaction",
        ])
        .with_criteria(&[
            "sql", "prisma", "postgresql", "mysql", "mongodb", "redis", "sqlite",
            "schema-migrations",
        ])
        .with_priority(75),
        AgentCapability::new(
            "security-auditor",
            "Vulnerability review, authentication and secret handling",
        )
        .with_domains(&["security"])
        .with_expertise(&[
            "security", "vulnerability", "authentication", "authorization", "encryption",
            "owasp", "audit", "secrets", "injection", "xss",
        ])
        .with_criteria(&["auth-module", "jwt", "bcrypt", "oauth", "pem"])
        .with_priority(85),
        AgentCapability::new(
            "test-engineer",
            "Test suites, coverage and regression hunting",
        )
        .with_domains(&["testing"])
        .with_expertise(&[
            "test", "testing", "coverage", "e2e", "unit", "integration", "mock", "regression",
            "flaky",
        ])
        .with_criteria(&[
            "test-suite", "jest", "pytest", "vitest", "cypress", "playwright",
            "testing-library", "mocha",
        ])
        .with_priority(70),
        AgentCapability::new(
            "technical-writer",
            "Documentation, guides and reference material",
        )
        .with_domains(&["documentation"])
        .with_expertise(&[
            "documentation", "docs", "readme", "guide", "tutorial", "changelog", "explain",
        ])
        .with_criteria(&["md", "mdx", "rst", "adoc", "markdown"])
        .with_priority(60),
        AgentCapability::new(
            "data-engineer",
            "Data pipelines, analytics and dataset processing",
        )
        .with_domains(&["data"])
        .with_expertise(&[
            "data", "etl", "pipeline", "analytics", "pandas", "spark", "warehouse", "dataset",
            "airflow", "dbt", "ml",
        ])
        .with_criteria(&[
            "ipynb", "jupyter", "parquet", "csv", "pandas", "numpy", "spark", "airflow", "dbt",
        ])
        .with_priority(70),
        AgentCapability::new(
            GENERAL_PURPOSE_ROLE,
            "Generalist for tasks without a clear specialty",
        )
        .with_domains(&["general"])
        .with_criteria(&["general"])
        .with_priority(10),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_roles_unique() {
        let caps = builtin_capabilities();
        let mut roles: Vec<_> = caps.iter().map(|c| c.role.as_str()).collect();
        roles.sort();
        roles.dedup();
        assert_eq!(roles.len(), caps.len());
        assert!(roles.contains(&GENERAL_PURPOSE_ROLE));
    }

    #[test]
    fn test_builtin_lists_non_empty() {
        for cap in builtin_capabilities() {
            assert!(!cap.domains.is_empty(), "{} has no domains", cap.role);
            assert!(!cap.selection_criteria.is_empty(), "{} has no criteria", cap.role);
            assert!(cap.priority <= 100);
        }
    }
}
