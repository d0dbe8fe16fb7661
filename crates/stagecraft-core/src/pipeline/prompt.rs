//! Prompt loading and rendering
//!
//! A stage's `prompt` field is a reference the loader turns into template
//! text. Templates use `{{name}}` placeholders (dotted paths allowed) that
//! are filled from the stage's resolved inputs.

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::OnceLock;
use tokio::fs;
use tracing::debug;

use super::reference::descend;
use super::types::OutputMap;
use crate::{Error, Result};

/// Source of prompt templates
#[async_trait]
pub trait PromptLoader: Send + Sync {
    async fn load(&self, reference: &str) -> Result<String>;
}

/// Treats the reference itself as the template
#[derive(Debug, Clone, Copy, Default)]
pub struct InlinePromptLoader;

#[async_trait]
impl PromptLoader for InlinePromptLoader {
    async fn load(&self, reference: &str) -> Result<String> {
        Ok(reference.to_string())
    }
}

/// Reads `<dir>/<ref>`, `<dir>/<ref>.md` or `<dir>/<ref>.txt`
#[derive(Debug, Clone)]
pub struct DirectoryPromptLoader {
    dir: PathBuf,
}

impl DirectoryPromptLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl PromptLoader for DirectoryPromptLoader {
    async fn load(&self, reference: &str) -> Result<String> {
        if reference.contains("..") || reference.starts_with('/') {
            return Err(Error::config(format!(
                "Prompt reference '{}' escapes the prompts directory",
                reference
            )));
        }

        for candidate in [
            reference.to_string(),
            format!("{}.md", reference),
            format!("{}.txt", reference),
        ] {
            let path = self.dir.join(&candidate);
            if fs::try_exists(&path).await.unwrap_or(false) {
                debug!(path = %path.display(), "Loading prompt");
                return fs::read_to_string(&path).await.map_err(|e| {
                    Error::config(format!("Failed to read prompt {}: {}", path.display(), e))
                });
            }
        }

        Err(Error::config(format!(
            "Prompt '{}' not found in {}",
            reference,
            self.dir.display()
        )))
    }
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_][A-Za-z0-9_.\-]*)\s*\}\}")
            .unwrap_or_else(|e| unreachable!("placeholder pattern is valid: {e}"))
    })
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(_) | Value::Bool(_) => value.to_string(),
        _ => serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()),
    }
}

/// Fill `{{name}}` placeholders; unknown names are left untouched
pub fn render_template(template: &str, inputs: &OutputMap) -> String {
    placeholder_regex()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            let mut parts = name.split('.');
            let head = parts.next().unwrap_or_default();
            let path: Vec<String> = parts.map(str::to_string).collect();
            inputs
                .get(head)
                .and_then(|v| descend(v, &path))
                .map(display_value)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Full prompt for a stage: the rendered template, any inputs the template
/// does not mention, and the expected output format
pub fn build_prompt(template: &str, inputs: &OutputMap, outputs: &[String]) -> String {
    let mut prompt = render_template(template, inputs);

    let mentioned: Vec<&str> = placeholder_regex()
        .captures_iter(template)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().split('.').next().unwrap_or_default())
        .collect();
    let unmentioned: Vec<(&String, &Value)> = inputs
        .iter()
        .filter(|(name, _)| !mentioned.contains(&name.as_str()))
        .collect();

    if !unmentioned.is_empty() {
        prompt.push_str("\n\n## Inputs\n");
        for (name, value) in unmentioned {
            prompt.push_str(&format!("\n### {}\n{}\n", name, display_value(value)));
        }
    }

    if outputs.len() > 1 || (outputs.len() == 1 && !prompt.contains(&outputs[0])) {
        prompt.push_str(&format!(
            "\n\nRespond with a JSON object containing the keys: {}.",
            outputs.join(", ")
        ));
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn inputs(value: Value) -> OutputMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_render_template() {
        let vars = inputs(json!({
            "topic": "caching",
            "plan": {"steps": ["a", "b"]},
            "count": 3,
            "nothing": null
        }));

        assert_eq!(
            render_template("Write about {{topic}} in {{ count }} parts", &vars),
            "Write about caching in 3 parts"
        );
        assert_eq!(render_template("First: {{plan.steps.0}}", &vars), "First: a");
        assert_eq!(render_template("[{{nothing}}]", &vars), "[]");
        assert_eq!(render_template("Keep {{unknown}}", &vars), "Keep {{unknown}}");
    }

    #[test]
    fn test_build_prompt_appends_inputs_and_format() {
        let vars = inputs(json!({"topic": "caching", "notes": "be brief"}));
        let outputs = vec!["title".to_string(), "body".to_string()];

        let prompt = build_prompt("Write about {{topic}}.", &vars, &outputs);
        assert!(prompt.starts_with("Write about caching."));
        assert!(prompt.contains("### notes\nbe brief"));
        assert!(!prompt.contains("### topic"));
        assert!(prompt.ends_with("keys: title, body."));
    }

    #[test]
    fn test_build_prompt_plain() {
        let prompt = build_prompt("Say hi", &OutputMap::new(), &[]);
        assert_eq!(prompt, "Say hi");
    }

    #[tokio::test]
    async fn test_inline_loader() {
        let text = InlinePromptLoader.load("Summarize {{input}}").await.unwrap();
        assert_eq!(text, "Summarize {{input}}");
    }

    #[tokio::test]
    async fn test_directory_loader() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("review.md"), "Review {{code}}").unwrap();
        std::fs::write(dir.path().join("exact"), "exact match").unwrap();

        let loader = DirectoryPromptLoader::new(dir.path());
        assert_eq!(loader.load("review").await.unwrap(), "Review {{code}}");
        assert_eq!(loader.load("exact").await.unwrap(), "exact match");
        assert!(matches!(
            loader.load("missing").await,
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            loader.load("../etc/passwd").await,
            Err(Error::Configuration(_))
        ));
    }
}
