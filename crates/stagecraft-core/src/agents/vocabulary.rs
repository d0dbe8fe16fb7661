//! Domain vocabularies and text normalization shared by the classifier,
//! analyzer and matcher.

use std::collections::BTreeSet;

/// Keywords and path signals that identify one task domain
pub(crate) struct DomainVocabulary {
    pub domain: &'static str,
    /// Single-token keywords
    pub keywords: &'static [&'static str],
    /// Multi-word phrases matched against the normalized description
    pub phrases: &'static [&'static str],
    pub extensions: &'static [&'static str],
    /// Substrings of the normalized (lowercase, `/`-separated) path
    pub path_markers: &'static [&'static str],
    /// Roles usually suited to this domain
    pub agents: &'static [&'static str],
}

impl DomainVocabulary {
    /// Whether a normalized path carries a signal for this domain
    pub fn matches_path(&self, path: &str) -> bool {
        let ext = extension(path);
        ext.is_some_and(|e| self.extensions.contains(&e))
            || self.path_markers.iter().any(|m| path.contains(m))
    }
}

/// Fallback domain when nothing matches
pub(crate) const GENERAL_DOMAIN: &str = "general";

pub(crate) const DOMAINS: &[DomainVocabulary] = &[
    DomainVocabulary {
        domain: "backend",
        keywords: &[
            "api", "endpoint", "endpoints", "server", "backend", "rest", "graphql", "service",
            "microservice", "microservices", "handler", "middleware", "express", "django",
            "flask", "fastapi", "axum", "spring", "grpc", "route", "routes", "controller",
            "webhook",
        ],
        phrases: &["request handler", "http server"],
        extensions: &["go", "java", "rb", "php", "cs", "kt"],
        path_markers: &["api/", "routes/", "controllers/", "handlers/", "server/", "services/"],
        agents: &["backend-developer"],
    },
    DomainVocabulary {
        domain: "data",
        keywords: &[
            "data", "etl", "analytics", "dataset", "datasets", "pandas", "numpy", "spark",
            "notebook", "ml", "warehouse", "dbt", "airflow", "parquet", "csv",
        ],
        phrases: &["machine learning", "data pipeline", "feature engineering"],
        extensions: &["ipynb", "parquet", "csv"],
        path_markers: &["notebooks/", "dags/", "data/"],
        agents: &["data-engineer"],
    },
    DomainVocabulary {
        domain: "database",
        keywords: &[
            "database", "db", "sql", "query", "queries", "schema", "migration", "migrations",
            "postgres", "postgresql", "mysql", "sqlite", "mongodb", "redis", "index",
            "indexes", "orm", "prisma", "table", "tables",
        ],
        phrases: &["foreign key", "query plan"],
        extensions: &["sql", "prisma"],
        path_markers: &["migrations/", "db/", "schema"],
        agents: &["database-engineer"],
    },
    DomainVocabulary {
        domain: "documentation",
        keywords: &[
            "document", "documentation", "docs", "readme", "guide", "tutorial", "changelog",
            "docstring", "docstrings", "wiki",
        ],
        phrases: &["user guide", "api reference"],
        extensions: &["md", "mdx", "rst", "adoc"],
        path_markers: &["docs/", "readme"],
        agents: &["technical-writer"],
    },
    DomainVocabulary {
        domain: "frontend",
        keywords: &[
            "react", "vue", "angular", "svelte", "css", "scss", "html", "component",
            "components", "ui", "ux", "frontend", "tailwind", "layout", "responsive", "button",
            "styling", "dom", "browser", "jsx", "tsx", "nextjs",
        ],
        phrases: &["user interface", "design system"],
        extensions: &["tsx", "jsx", "vue", "svelte", "css", "scss", "sass", "less", "html"],
        path_markers: &["components/", "pages/", "public/", "styles/"],
        agents: &["frontend-developer"],
    },
    DomainVocabulary {
        domain: "infrastructure",
        keywords: &[
            "infrastructure", "terraform", "aws", "gcp", "azure", "kubernetes", "k8s",
            "docker", "helm", "cloud", "provision", "provisioning", "cloudformation", "pulumi",
            "ansible", "vpc", "iam", "deploy", "deployment", "devops", "ec2", "s3",
        ],
        phrases: &["load balancer", "ci/cd"],
        extensions: &["tf", "tfvars", "hcl"],
        path_markers: &[
            "dockerfile", "docker-compose", "k8s/", "kubernetes/", "helm/", "terraform/",
            "infra/", ".github/workflows/", "ansible/", "cloudformation",
        ],
        agents: &["platform-engineer", "site-reliability-engineer"],
    },
    DomainVocabulary {
        domain: "security",
        keywords: &[
            "security", "vulnerability", "vulnerabilities", "auth", "authentication",
            "authorization", "oauth", "jwt", "encryption", "encrypt", "xss", "csrf",
            "injection", "secret", "secrets", "owasp", "cve", "audit", "permissions",
            "sanitize",
        ],
        phrases: &["threat model", "penetration test"],
        extensions: &["pem"],
        path_markers: &["auth/", "security/"],
        agents: &["security-auditor"],
    },
    DomainVocabulary {
        domain: "testing",
        keywords: &[
            "test", "tests", "testing", "coverage", "e2e", "jest", "pytest", "mocha",
            "vitest", "cypress", "playwright", "mock", "mocks", "fixture", "fixtures",
            "regression", "flaky",
        ],
        phrases: &["unit test", "integration test", "end to end"],
        extensions: &[],
        path_markers: &[".test.", ".spec.", "_test.", "tests/", "__tests__/", "test/", "spec/"],
        agents: &["test-engineer"],
    },
];

/// Lowercase the text and split it into alphanumeric tokens
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Distinct tokens of a text
pub(crate) fn token_set(text: &str) -> BTreeSet<String> {
    tokenize(text).into_iter().collect()
}

/// Tokens joined by single spaces, for phrase matching
pub(crate) fn normalized_phrase_text(text: &str) -> String {
    let mut normalized = String::with_capacity(text.len() + 2);
    normalized.push(' ');
    normalized.push_str(&tokenize(text).join(" "));
    normalized.push(' ');
    normalized
}

/// Whether a (possibly multi-word) term occurs in the text
pub(crate) fn contains_term(tokens: &BTreeSet<String>, phrase_text: &str, term: &str) -> bool {
    let term_tokens = tokenize(term);
    match term_tokens.len() {
        0 => false,
        1 => tokens.contains(&term_tokens[0]),
        _ => phrase_text.contains(&format!(" {} ", term_tokens.join(" "))),
    }
}

/// Lowercase a path and use `/` separators
pub(crate) fn normalize_path(path: &str) -> String {
    path.trim().replace('\\', "/").to_lowercase()
}

/// File name component of a normalized path
pub(crate) fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Extension of a normalized path (without the dot)
pub(crate) fn extension(path: &str) -> Option<&str> {
    let name = file_name(path);
    match name.rfind('.') {
        Some(0) | None => None,
        Some(pos) if pos + 1 < name.len() => Some(&name[pos + 1..]),
        _ => None,
    }
}

/// Directory segments of a normalized path
pub(crate) fn dir_segments(path: &str) -> impl Iterator<Item = &str> {
    let dir = match path.rfind('/') {
        Some(pos) => &path[..pos],
        None => "",
    };
    dir.split('/').filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_unicode_and_punctuation() {
        assert_eq!(tokenize("Set up AWS-cli, now!"), vec!["set", "up", "aws", "cli", "now"]);
        assert_eq!(tokenize("Überprüfe die Datenbank"), vec!["überprüfe", "die", "datenbank"]);
        assert!(tokenize("  ... ").is_empty());
    }

    #[test]
    fn test_contains_term() {
        let text = "Write a unit test for the parser";
        let tokens = token_set(text);
        let phrase = normalized_phrase_text(text);

        assert!(contains_term(&tokens, &phrase, "unit test"));
        assert!(contains_term(&tokens, &phrase, "parser"));
        assert!(!contains_term(&tokens, &phrase, "integration test"));
        // whole tokens only
        assert!(!contains_term(&tokens, &phrase, "pars"));
    }

    #[test]
    fn test_path_helpers() {
        let path = normalize_path("Infra\\Modules\\Main.TF");
        assert_eq!(path, "infra/modules/main.tf");
        assert_eq!(file_name(&path), "main.tf");
        assert_eq!(extension(&path), Some("tf"));
        assert_eq!(dir_segments(&path).collect::<Vec<_>>(), vec!["infra", "modules"]);

        assert_eq!(extension("dockerfile"), None);
        assert_eq!(extension(".gitignore"), None);
        assert_eq!(extension("archive."), None);
    }

    #[test]
    fn test_domain_table_sorted_and_unique() {
        let names: Vec<_> = DOMAINS.iter().map(|d| d.domain).collect();
        let mut sorted = names.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_matches_path() {
        let infra = DOMAINS.iter().find(|d| d.domain == "infrastructure").unwrap();
        assert!(infra.matches_path("infra/main.tf"));
        assert!(infra.matches_path("services/api/dockerfile"));
        assert!(!infra.matches_path("src/app.tsx"));
    }
}
