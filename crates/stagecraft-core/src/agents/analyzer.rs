//! Codebase context analyzer
//!
//! Derives technology and structure signals from file paths and dependency
//! names alone. Nothing is read from disk.

use std::collections::{BTreeMap, BTreeSet};

use super::types::{CodebaseContext, TaskContext};
use super::vocabulary::{dir_segments, extension, file_name, normalize_path};

const EXTENSION_TECHNOLOGIES: &[(&str, &str)] = &[
    ("bash", "shell"),
    ("cjs", "javascript"),
    ("cs", "csharp"),
    ("css", "css"),
    ("go", "go"),
    ("hcl", "terraform"),
    ("html", "html"),
    ("ipynb", "jupyter"),
    ("java", "java"),
    ("js", "javascript"),
    ("jsx", "javascript"),
    ("kt", "kotlin"),
    ("less", "css"),
    ("md", "markdown"),
    ("mjs", "javascript"),
    ("php", "php"),
    ("prisma", "prisma"),
    ("py", "python"),
    ("rb", "ruby"),
    ("rs", "rust"),
    ("sass", "css"),
    ("scss", "css"),
    ("sh", "shell"),
    ("sql", "sql"),
    ("svelte", "svelte"),
    ("swift", "swift"),
    ("tf", "terraform"),
    ("tfvars", "terraform"),
    ("ts", "typescript"),
    ("tsx", "typescript"),
    ("vue", "vue"),
    ("yaml", "yaml"),
    ("yml", "yaml"),
];

/// Normalized dependency name -> technology
const DEPENDENCY_TECHNOLOGIES: &[(&str, &str)] = &[
    ("@angular", "angular"),
    ("@aws-sdk", "aws"),
    ("@nestjs", "nestjs"),
    ("@prisma", "prisma"),
    ("@testing-library", "testing-library"),
    ("@types", "typescript"),
    ("airflow", "airflow"),
    ("apache-airflow", "airflow"),
    ("aws-cli", "aws"),
    ("aws-sdk", "aws"),
    ("awscli", "aws"),
    ("axum", "axum"),
    ("bcrypt", "bcrypt"),
    ("boto3", "aws"),
    ("cypress", "cypress"),
    ("dbt", "dbt"),
    ("django", "django"),
    ("docker", "docker"),
    ("express", "express"),
    ("fastapi", "fastapi"),
    ("flask", "flask"),
    ("google-cloud", "gcp"),
    ("graphql", "graphql"),
    ("helm", "helm"),
    ("jest", "jest"),
    ("jsonwebtoken", "jwt"),
    ("kubectl", "kubernetes"),
    ("mocha", "mocha"),
    ("mongodb", "mongodb"),
    ("mongoose", "mongodb"),
    ("mysql", "mysql"),
    ("mysql2", "mysql"),
    ("next", "nextjs"),
    ("numpy", "numpy"),
    ("oauthlib", "oauth"),
    ("pandas", "pandas"),
    ("pg", "postgresql"),
    ("playwright", "playwright"),
    ("postgres", "postgresql"),
    ("prisma", "prisma"),
    ("psycopg2", "postgresql"),
    ("pulumi", "pulumi"),
    ("pyspark", "spark"),
    ("pytest", "pytest"),
    ("rails", "rails"),
    ("react", "react"),
    ("redis", "redis"),
    ("spark", "spark"),
    ("sqlx", "sql"),
    ("svelte", "svelte"),
    ("tailwindcss", "tailwind"),
    ("terraform", "terraform"),
    ("tokio", "tokio"),
    ("vitest", "vitest"),
    ("vue", "vue"),
];

/// Dependency technology -> infrastructure component
const DEPENDENCY_COMPONENTS: &[(&str, &str)] = &[
    ("ansible", "ansible"),
    ("aws", "aws"),
    ("docker", "docker"),
    ("gcp", "gcp"),
    ("helm", "helm"),
    ("kubernetes", "kubernetes"),
    ("pulumi", "pulumi"),
    ("terraform", "terraform"),
];

/// Directory segment -> architectural pattern
const SEGMENT_PATTERNS: &[(&str, &str)] = &[
    ("__tests__", "test-suite"),
    ("api", "rest-api"),
    ("apps", "monorepo"),
    ("auth", "auth-module"),
    ("components", "component-based"),
    ("crates", "monorepo"),
    ("endpoints", "rest-api"),
    ("functions", "serverless"),
    ("graphql", "graphql"),
    ("handlers", "rest-api"),
    ("helm", "container-orchestration"),
    ("infra", "infrastructure-as-code"),
    ("k8s", "container-orchestration"),
    ("kubernetes", "container-orchestration"),
    ("lambda", "serverless"),
    ("migrations", "schema-migrations"),
    ("packages", "monorepo"),
    ("routes", "rest-api"),
    ("security", "auth-module"),
    ("services", "service-layer"),
    ("terraform", "infrastructure-as-code"),
    ("test", "test-suite"),
    ("tests", "test-suite"),
];

fn lookup<'a>(table: &'a [(&str, &str)], key: &str) -> Option<&'a str> {
    table
        .binary_search_by(|(k, _)| (*k).cmp(key))
        .ok()
        .map(|i| table[i].1)
}

/// Strip version specifiers and sub-paths from a dependency name.
///
/// Scoped packages keep only their scope (`@aws-sdk/client-s3` -> `@aws-sdk`).
pub(crate) fn normalize_dependency(dep: &str) -> String {
    let dep = dep.trim().to_lowercase();
    if let Some(scoped) = dep.strip_prefix('@') {
        let scope = scoped.split('/').next().unwrap_or(scoped);
        return format!("@{}", scope);
    }
    let end = dep
        .find(|c: char| matches!(c, '@' | '=' | '<' | '>' | '~' | '^' | ' ' | ':' | '[' | '/'))
        .unwrap_or(dep.len());
    dep[..end].to_string()
}

/// File type key: the extension, or a well-known file name
fn file_type(path: &str) -> String {
    let name = file_name(path);
    if name.starts_with("dockerfile") {
        return "dockerfile".to_string();
    }
    match extension(path) {
        Some(ext) => ext.to_string(),
        None => name.to_string(),
    }
}

/// Path/dependency signal extractor
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextAnalyzer;

impl ContextAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Build the codebase context for a task
    pub fn analyze(&self, ctx: &TaskContext) -> CodebaseContext {
        let mut file_types: BTreeMap<String, usize> = BTreeMap::new();
        let mut patterns = BTreeSet::new();
        let mut components = BTreeSet::new();
        let mut stack = BTreeSet::new();
        let mut imports = BTreeSet::new();

        for raw in &ctx.affected_files {
            let path = normalize_path(raw);
            if path.is_empty() {
                continue;
            }
            *file_types.entry(file_type(&path)).or_default() += 1;

            let ext = extension(&path);
            if let Some(tech) = ext.and_then(|e| lookup(EXTENSION_TECHNOLOGIES, e)) {
                stack.insert(tech.to_string());
            }

            path_components(&path, ext, &mut components);
            path_patterns(&path, ext, &mut patterns);
        }

        for raw in &ctx.dependencies {
            let name = normalize_dependency(raw);
            if name.is_empty() {
                continue;
            }
            if let Some(tech) = lookup(DEPENDENCY_TECHNOLOGIES, &name) {
                stack.insert(tech.to_string());
                if let Some(component) = lookup(DEPENDENCY_COMPONENTS, tech) {
                    components.insert(component.to_string());
                }
            }
            imports.insert(name);
        }

        // Controllers next to models or views read as MVC
        if patterns.contains("controllers") {
            patterns.remove("controllers");
            let has_mvc_peer = ctx.affected_files.iter().any(|f| {
                let p = normalize_path(f);
                dir_segments(&p).any(|s| s == "models" || s == "views")
            });
            patterns.insert(if has_mvc_peer { "mvc" } else { "rest-api" }.to_string());
        }

        CodebaseContext {
            affected_file_types: file_types,
            architectural_patterns: patterns.into_iter().collect(),
            import_patterns: imports.into_iter().collect(),
            infrastructure_components: components.into_iter().collect(),
            technology_stack: stack.into_iter().collect(),
        }
    }
}

fn path_components(path: &str, ext: Option<&str>, out: &mut BTreeSet<String>) {
    let name = file_name(path);
    let yaml = matches!(ext, Some("yaml" | "yml"));

    if matches!(ext, Some("tf" | "tfvars" | "hcl")) || path.contains("terraform/") {
        out.insert("terraform".to_string());
    }
    if name.starts_with("dockerfile") || name.starts_with("docker-compose") {
        out.insert("docker".to_string());
    }
    if yaml && (path.contains("k8s/") || path.contains("kubernetes/")) {
        out.insert("kubernetes".to_string());
    }
    if path.contains("helm/") || name == "chart.yaml" {
        out.insert("helm".to_string());
    }
    if path.contains(".github/workflows/") {
        out.insert("github-actions".to_string());
    }
    if name == ".gitlab-ci.yml" {
        out.insert("gitlab-ci".to_string());
    }
    if name == "jenkinsfile" {
        out.insert("jenkins".to_string());
    }
    if path.contains("ansible/") || (yaml && name.contains("playbook")) {
        out.insert("ansible".to_string());
    }
    if name == "serverless.yml" || name == "serverless.yaml" {
        out.insert("serverless".to_string());
    }
}

fn path_patterns(path: &str, ext: Option<&str>, out: &mut BTreeSet<String>) {
    for segment in dir_segments(path) {
        if segment == "controllers" {
            out.insert("controllers".to_string());
        } else if let Some(pattern) = lookup(SEGMENT_PATTERNS, segment) {
            out.insert(pattern.to_string());
        }
    }

    let name = file_name(path);
    if name.contains(".test.") || name.contains(".spec.") || name.contains("_test.") {
        out.insert("test-suite".to_string());
    }
    if matches!(ext, Some("tf" | "tfvars" | "hcl")) {
        out.insert("infrastructure-as-code".to_string());
    }
    if matches!(ext, Some("graphql" | "gql")) {
        out.insert("graphql".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables_sorted(table: &[(&str, &str)]) -> bool {
        table.windows(2).all(|w| w[0].0 < w[1].0)
    }

    #[test]
    fn test_lookup_tables_sorted() {
        assert!(tables_sorted(EXTENSION_TECHNOLOGIES));
        assert!(tables_sorted(DEPENDENCY_TECHNOLOGIES));
        assert!(tables_sorted(DEPENDENCY_COMPONENTS));
        assert!(tables_sorted(SEGMENT_PATTERNS));
    }

    #[test]
    fn test_normalize_dependency() {
        assert_eq!(normalize_dependency("React@18.2.0"), "react");
        assert_eq!(normalize_dependency("django>=4.2"), "django");
        assert_eq!(normalize_dependency("@aws-sdk/client-s3"), "@aws-sdk");
        assert_eq!(normalize_dependency("requests[security]==2.31"), "requests");
        assert_eq!(normalize_dependency("  "), "");
    }

    #[test]
    fn test_terraform_context() {
        let ctx = TaskContext::new("ignored")
            .with_files(&["infra/main.tf", "infra/variables.tf"])
            .with_dependencies(&["terraform", "aws-cli"]);

        let analysis = ContextAnalyzer::new().analyze(&ctx);
        assert_eq!(analysis.affected_file_types.get("tf"), Some(&2));
        assert_eq!(analysis.infrastructure_components, vec!["aws", "terraform"]);
        assert_eq!(analysis.technology_stack, vec!["aws", "terraform"]);
        assert_eq!(analysis.architectural_patterns, vec!["infrastructure-as-code"]);
        assert_eq!(analysis.import_patterns, vec!["aws-cli", "terraform"]);
    }

    #[test]
    fn test_special_file_names() {
        let ctx = TaskContext::default().with_files(&[
            "Dockerfile",
            "deploy/Dockerfile.prod",
            ".github/workflows/ci.yml",
            "k8s/deployment.yaml",
            "Makefile",
        ]);

        let analysis = ContextAnalyzer::new().analyze(&ctx);
        assert_eq!(analysis.affected_file_types.get("dockerfile"), Some(&2));
        assert_eq!(analysis.affected_file_types.get("makefile"), Some(&1));
        assert!(analysis.infrastructure_components.contains(&"docker".to_string()));
        assert!(analysis.infrastructure_components.contains(&"github-actions".to_string()));
        assert!(analysis.infrastructure_components.contains(&"kubernetes".to_string()));
        assert!(analysis
            .architectural_patterns
            .contains(&"container-orchestration".to_string()));
    }

    #[test]
    fn test_mvc_detection() {
        let mvc = TaskContext::default()
            .with_files(&["app/controllers/users.rb", "app/models/user.rb"]);
        let analysis = ContextAnalyzer::new().analyze(&mvc);
        assert!(analysis.architectural_patterns.contains(&"mvc".to_string()));
        assert!(!analysis.architectural_patterns.contains(&"controllers".to_string()));

        let api_only = TaskContext::default().with_files(&["src/controllers/users.ts"]);
        let analysis = ContextAnalyzer::new().analyze(&api_only);
        assert_eq!(analysis.architectural_patterns, vec!["rest-api"]);
    }

    #[test]
    fn test_empty_and_windows_paths() {
        let analysis = ContextAnalyzer::new().analyze(&TaskContext::default());
        assert!(analysis.is_empty());

        let ctx = TaskContext::default().with_files(&["src\\components\\Nav.TSX", ""]);
        let analysis = ContextAnalyzer::new().analyze(&ctx);
        assert_eq!(analysis.affected_file_types.get("tsx"), Some(&1));
        assert_eq!(analysis.architectural_patterns, vec!["component-based"]);
        assert_eq!(analysis.technology_stack, vec!["typescript"]);
    }
}
