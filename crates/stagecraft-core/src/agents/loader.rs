//! Agent capability loaders
//!
//! A loader supplies the raw capability list the registry is built from.
//! Capabilities can come from the built-in roster or from a directory of
//! YAML/TOML files.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use super::builtin::builtin_capabilities;
use super::types::AgentCapability;
use crate::{Error, Result};

/// Source of agent capabilities
#[async_trait]
pub trait AgentLoader: Send + Sync {
    /// Load the full capability list
    async fn load(&self) -> Result<Vec<AgentCapability>>;
}

/// Loader for the built-in roster
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinAgentLoader;

#[async_trait]
impl AgentLoader for BuiltinAgentLoader {
    async fn load(&self) -> Result<Vec<AgentCapability>> {
        Ok(builtin_capabilities())
    }
}

/// Either a single `agent` table or an `agents` list
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AgentFile {
    Single { agent: AgentCapability },
    Many { agents: Vec<AgentCapability> },
}

impl AgentFile {
    fn into_capabilities(self) -> Vec<AgentCapability> {
        match self {
            Self::Single { agent } => vec![agent],
            Self::Many { agents } => agents,
        }
    }
}

/// Loads capabilities from `*.yaml`, `*.yml` and `*.toml` files in a directory.
///
/// Files are read in name order. Any unreadable or malformed file fails the
/// whole load.
#[derive(Debug, Clone)]
pub struct DirectoryAgentLoader {
    dir: PathBuf,
    /// Also include the built-in roster before the directory entries
    include_builtin: bool,
}

impl DirectoryAgentLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            include_builtin: false,
        }
    }

    /// Prepend the built-in roster to the loaded capabilities
    pub fn with_builtin(mut self) -> Self {
        self.include_builtin = true;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn load_file(path: &Path) -> Result<Vec<AgentCapability>> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            Error::config(format!("Failed to read agent file {}: {}", path.display(), e))
        })?;

        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let file: AgentFile = match extension {
            "yaml" | "yml" => serde_yaml::from_str(&content).map_err(|e| {
                Error::config(format!("Failed to parse agent file {}: {}", path.display(), e))
            })?,
            "toml" => toml::from_str(&content).map_err(|e| {
                Error::config(format!("Failed to parse agent file {}: {}", path.display(), e))
            })?,
            _ => {
                return Err(Error::config(format!(
                    "Unsupported agent file format: {}",
                    path.display()
                )));
            }
        };

        Ok(file.into_capabilities())
    }
}

#[async_trait]
impl AgentLoader for DirectoryAgentLoader {
    async fn load(&self) -> Result<Vec<AgentCapability>> {
        let mut entries = fs::read_dir(&self.dir).await.map_err(|e| {
            Error::config(format!(
                "Failed to read agents directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_agent_file = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| matches!(e, "yaml" | "yml" | "toml"));
            if is_agent_file {
                files.push(path);
            }
        }
        files.sort();

        let mut capabilities = if self.include_builtin {
            builtin_capabilities()
        } else {
            Vec::new()
        };

        for path in files {
            let loaded = Self::load_file(&path).await?;
            debug!(path = %path.display(), count = loaded.len(), "Loaded agent file");
            capabilities.extend(loaded);
        }

        info!(
            dir = %self.dir.display(),
            count = capabilities.len(),
            "Loaded agent capabilities"
        );

        Ok(capabilities)
    }
}
