//! Command definitions
//!
//! A command is a named pipeline, optionally pinned to one agent. Commands
//! are stored as YAML or TOML files:
//!
//! ```yaml
//! name: review
//! description: Review a change and summarize the risks
//! prompts:
//!   merge_strategy: sequential
//!   stages:
//!     - stage: analyze
//!       prompt: analyze
//!       inputs: { diff: input.diff }
//!       outputs: [findings]
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use super::types::PromptsPipeline;
use crate::{Error, Result};

/// A named, runnable pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Agent used for every stage that does not pin its own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub prompts: PromptsPipeline,
}

impl CommandDefinition {
    /// Parse a definition; `extension` selects the format
    pub fn parse(content: &str, extension: &str) -> Result<Self> {
        let command: Self = match extension {
            "yaml" | "yml" => serde_yaml::from_str(content).map_err(|e| {
                Error::config(format!("Failed to parse YAML command file: {}", e))
            })?,
            "toml" => toml::from_str(content).map_err(|e| {
                Error::config(format!("Failed to parse TOML command file: {}", e))
            })?,
            other => {
                return Err(Error::config(format!(
                    "Unsupported command file extension: {}",
                    other
                )));
            }
        };

        if command.name.trim().is_empty() {
            return Err(Error::config("Command name must not be empty"));
        }
        Ok(command)
    }
}

fn is_command_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml" | "toml")
    )
}

/// Reads command definitions from files
#[derive(Debug, Clone, Default)]
pub struct CommandLoader {
    dir: Option<PathBuf>,
}

impl CommandLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory searched by [`find`](Self::find) and [`load_all`](Self::load_all)
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }

    pub async fn load_file(&self, path: &Path) -> Result<CommandDefinition> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            Error::config(format!(
                "Failed to read command file {}: {}",
                path.display(),
                e
            ))
        })?;

        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let command = CommandDefinition::parse(&content, extension)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?;

        debug!(command = %command.name, path = %path.display(), "Loaded command");
        Ok(command)
    }

    /// Every command in the directory, in file name order
    pub async fn load_all(&self) -> Result<Vec<CommandDefinition>> {
        let Some(dir) = &self.dir else {
            return Ok(Vec::new());
        };

        let mut entries = fs::read_dir(dir).await.map_err(|e| {
            Error::config(format!(
                "Failed to read commands directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::config(format!("Failed to read directory entry: {}", e)))?
        {
            let path = entry.path();
            if is_command_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut commands = Vec::with_capacity(paths.len());
        for path in paths {
            commands.push(self.load_file(&path).await?);
        }

        info!(count = commands.len(), dir = %dir.display(), "Loaded commands");
        Ok(commands)
    }

    /// Look a command up by name in the directory
    pub async fn find(&self, name: &str) -> Result<CommandDefinition> {
        self.load_all()
            .await?
            .into_iter()
            .find(|c| c.name == name)
            .ok_or_else(|| Error::config(format!("Command '{}' not found", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{CacheStrategy, MergeStrategy};
    use tempfile::TempDir;

    const REVIEW_YAML: &str = r#"
name: review
description: Review a change
agent: security-auditor
prompts:
  cache_strategy: stage
  merge_strategy: parallel
  rollback_on_failure: cleanup
  retry_policy:
    max_attempts: 3
    backoff_ms: 100
    backoff: exponential
  stages:
    - stage: analyze
      prompt: analyze
      inputs:
        diff: input.diff
      outputs: [findings]
      cache:
        ttl_ms: 60000
        file_dependencies: [Cargo.lock]
    - stage: style
      prompt: style
      parallel: true
      required: false
    - stage: cleanup
      prompt: cleanup
"#;

    const DOCS_TOML: &str = r#"
name = "docs"

[[prompts.stages]]
stage = "write"
prompt = "Document {{module}}"
outputs = ["markdown"]

[prompts.stages.inputs]
module = "input.module"
"#;

    #[test]
    fn test_parse_yaml() {
        let command = CommandDefinition::parse(REVIEW_YAML, "yaml").unwrap();
        assert_eq!(command.name, "review");
        assert_eq!(command.agent.as_deref(), Some("security-auditor"));

        let pipeline = &command.prompts;
        assert_eq!(pipeline.cache_strategy, CacheStrategy::Stage);
        assert_eq!(pipeline.merge_strategy, MergeStrategy::Parallel);
        assert_eq!(pipeline.retry_policy.as_ref().unwrap().max_attempts, 3);
        assert_eq!(pipeline.stages.len(), 3);

        let analyze = &pipeline.stages[0];
        assert!(analyze.required);
        assert_eq!(analyze.inputs["diff"], "input.diff");
        let cache = analyze.cache.as_ref().unwrap();
        assert!(cache.enabled);
        assert_eq!(cache.ttl_ms, 60_000);

        assert!(!pipeline.stages[1].required);
        let ids: Vec<&str> = pipeline.execution_stages().map(|s| s.stage.as_str()).collect();
        assert_eq!(ids, vec!["analyze", "style"]);
    }

    #[test]
    fn test_parse_toml() {
        let command = CommandDefinition::parse(DOCS_TOML, "toml").unwrap();
        assert_eq!(command.name, "docs");
        assert!(command.description.is_empty());
        assert_eq!(command.prompts.stages[0].inputs["module"], "input.module");
        assert_eq!(command.prompts.merge_strategy, MergeStrategy::Sequential);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            CommandDefinition::parse("name: x", "yaml"),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            CommandDefinition::parse("{}", "json"),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            CommandDefinition::parse("name: ''\nprompts:\n  stages: []\n", "yaml"),
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_loader_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b-review.yaml"), REVIEW_YAML).unwrap();
        std::fs::write(dir.path().join("a-docs.toml"), DOCS_TOML).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let loader = CommandLoader::with_dir(dir.path());
        let names: Vec<String> = loader
            .load_all()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["docs", "review"]);

        assert_eq!(loader.find("review").await.unwrap().prompts.stages.len(), 3);
        assert!(matches!(
            loader.find("deploy").await,
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_loader_malformed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "name: [unclosed").unwrap();

        let result = CommandLoader::new().load_file(&path).await;
        match result {
            Err(Error::Configuration(message)) => assert!(message.contains("broken.yaml")),
            other => panic!("expected configuration error, got {:?}", other),
        }

        assert!(CommandLoader::new().load_all().await.unwrap().is_empty());
    }
}
