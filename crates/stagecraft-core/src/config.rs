//! Configuration management
//!
//! Settings are read in the following order of precedence:
//! 1. Environment variables
//! 2. `stagecraft.toml`
//! 3. Built-in defaults
//!
//! `${VAR_NAME}` references inside the TOML file are expanded from the
//! environment before parsing.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::Error;

/// LLM Provider type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// Anthropic Claude API
    #[default]
    Claude,
    /// OpenAI-compatible API (GLM, etc.)
    OpenAi,
}

impl LlmProvider {
    /// Parse a provider name; unknown names fall back to Claude
    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "openai" | "glm" | "zai" | "minimax" => Self::OpenAi,
            _ => Self::Claude,
        }
    }
}

/// LLM configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// API key
    #[serde(skip_serializing)]
    pub api_key: String,

    /// Model to use
    pub model: String,

    /// API provider
    pub provider: LlmProvider,

    /// Base URL (optional, for custom endpoints)
    pub base_url: Option<String>,

    /// Response token budget per completion
    pub max_tokens: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            provider: LlmProvider::Claude,
            base_url: None,
            max_tokens: 4096,
        }
    }
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

/// Weights used by the capability matcher
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MatchWeights {
    pub domain: f64,
    pub criteria: f64,
    pub expertise: f64,
    /// Share of the score scaled by capability priority
    pub priority: f64,
}

impl Default for MatchWeights {
    fn default() -> Self {
        Self {
            domain: 0.45,
            criteria: 0.35,
            expertise: 0.20,
            priority: 0.05,
        }
    }
}

/// Dynamic agent resolution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Below this score a selection is a fallback
    pub confidence_floor: f64,
    /// Below this score a selection is always a fallback, even when
    /// `confidence_floor` is set lower
    pub hard_floor: f64,
    /// Generalist role suggested when falling back
    pub fallback_agent: String,
    pub weights: MatchWeights,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            confidence_floor: 0.6,
            hard_floor: 0.3,
            fallback_agent: "general-purpose".to_string(),
            weights: MatchWeights::default(),
        }
    }
}

/// Pipeline execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Timeout for stages that do not declare `timeout_ms`
    pub default_timeout_ms: u64,
    /// Upper bound for exponential retry backoff
    pub max_backoff_ms: u64,
    /// Maximum stages running at once inside a parallel group
    pub max_parallel: usize,
    /// Resolve agents dynamically when a command pins none
    pub dynamic_agents: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 120_000,
            max_backoff_ms: 30_000,
            max_parallel: 4,
            dynamic_agents: true,
        }
    }
}

/// Stage cache settings
///
/// The cache is held in memory by a `PipelineExecutor`, so entries are only
/// reused by runs within the same process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub default_ttl_ms: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_ms: 3_600_000,
            max_entries: 1024,
        }
    }
}

/// Location of agent capability definitions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    /// Directory of YAML/TOML capability files; builtin set when unset
    pub dir: Option<String>,
}

/// Location of prompt files
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptsConfig {
    /// Directory of prompt files; prompts are inline when unset
    pub dir: Option<String>,
}

/// Run persistence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub enabled: bool,
    /// Path to SQLite database file
    pub db_path: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "data/stagecraft.db".to_string()
}

/// Main configuration for stagecraft
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub llm: LlmConfig,
    pub resolver: ResolverConfig,
    pub pipeline: PipelineConfig,
    pub cache: CacheConfig,
    pub agents: AgentsConfig,
    pub prompts: PromptsConfig,
    pub session: SessionConfig,
}

impl Config {
    /// Expand `${VAR_NAME}` references with environment values.
    ///
    /// Unset variables expand to an empty string.
    fn expand_env_vars(value: &str) -> String {
        let mut result = String::with_capacity(value.len());
        let mut chars = value.chars().peekable();

        while let Some(c) = chars.next() {
            if c == '$' && chars.peek() == Some(&'{') {
                chars.next();

                let mut var_name = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    var_name.push(c);
                }

                if let Ok(env_value) = std::env::var(&var_name) {
                    result.push_str(&env_value);
                }
            } else {
                result.push(c);
            }
        }

        result
    }

    /// Load configuration from a TOML file, then apply environment overrides
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();

        let toml_content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read config file: {}", e)))?;

        let mut cfg = Self::from_toml_str(&toml_content)?;
        cfg.apply_env_overrides();

        Ok(cfg)
    }

    /// Parse configuration from TOML text (environment references expanded)
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        let expanded = Self::expand_env_vars(content);

        let toml: TomlConfig = toml::from_str(&expanded)
            .map_err(|e| Error::config(format!("Failed to parse TOML: {}", e)))?;

        Ok(Self::from_toml_config(toml))
    }

    /// Load from `./stagecraft.toml`, falling back to the environment only
    pub fn load() -> crate::Result<Self> {
        if Path::new("stagecraft.toml").exists() {
            return Self::from_toml_file("stagecraft.toml");
        }

        Ok(Self::from_env())
    }

    /// Build configuration from defaults plus environment variables
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env_overrides();
        cfg
    }

    fn from_toml_config(toml: TomlConfig) -> Self {
        let llm = toml.llm.unwrap_or_default();
        let defaults = LlmConfig::default();

        let llm_config = LlmConfig {
            api_key: llm.api_key.unwrap_or_default(),
            model: llm.model.unwrap_or(defaults.model),
            provider: llm
                .provider
                .as_deref()
                .map(LlmProvider::from_name)
                .unwrap_or_default(),
            base_url: llm.base_url,
            max_tokens: llm.max_tokens.unwrap_or(defaults.max_tokens),
        };

        Config {
            llm: llm_config,
            resolver: toml.resolver.unwrap_or_default(),
            pipeline: toml.pipeline.unwrap_or_default(),
            cache: toml.cache.unwrap_or_default(),
            agents: toml.agents.unwrap_or_default(),
            prompts: toml.prompts.unwrap_or_default(),
            session: toml.session.unwrap_or_default(),
        }
    }

    /// Override settings from environment variables
    fn apply_env_overrides(&mut self) {
        if let Ok(api_key) = std::env::var("LLM_API_KEY") {
            self.llm.api_key = api_key;
        } else if let Ok(api_key) = std::env::var("CLAUDE_API_KEY") {
            self.llm.api_key = api_key;
        }

        // Empty values are ignored so an exported-but-blank variable keeps the TOML value
        if let Some(model) = non_empty_env("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(provider) = non_empty_env("LLM_PROVIDER") {
            self.llm.provider = LlmProvider::from_name(&provider);
        }
        if let Some(base_url) = non_empty_env("LLM_BASE_URL") {
            self.llm.base_url = Some(base_url);
        }

        if let Some(floor) = non_empty_env("STAGECRAFT_CONFIDENCE_FLOOR").and_then(|v| v.parse().ok()) {
            self.resolver.confidence_floor = floor;
        }
        if let Some(floor) = non_empty_env("STAGECRAFT_HARD_FLOOR").and_then(|v| v.parse().ok()) {
            self.resolver.hard_floor = floor;
        }
        if let Some(agent) = non_empty_env("STAGECRAFT_FALLBACK_AGENT") {
            self.resolver.fallback_agent = agent;
        }

        if let Some(dir) = non_empty_env("STAGECRAFT_AGENTS_DIR") {
            self.agents.dir = Some(dir);
        }
        if let Some(dir) = non_empty_env("STAGECRAFT_PROMPTS_DIR") {
            self.prompts.dir = Some(dir);
        }
        if let Some(path) = non_empty_env("STAGECRAFT_DB_PATH") {
            self.session.db_path = path;
        }
        if let Ok(enabled) = std::env::var("STAGECRAFT_CACHE_ENABLED") {
            self.cache.enabled = enabled.to_lowercase() != "false";
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

// ============================================================================
// TOML file structure
// ============================================================================

#[derive(Debug, Deserialize)]
struct TomlConfig {
    llm: Option<TomlLlmConfig>,
    resolver: Option<ResolverConfig>,
    pipeline: Option<PipelineConfig>,
    cache: Option<CacheConfig>,
    agents: Option<AgentsConfig>,
    prompts: Option<PromptsConfig>,
    session: Option<SessionConfig>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlLlmConfig {
    /// "claude" or "openai"
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    max_tokens: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_provider_default() {
        assert_eq!(LlmProvider::default(), LlmProvider::Claude);
        assert_eq!(LlmProvider::from_name("GLM"), LlmProvider::OpenAi);
        assert_eq!(LlmProvider::from_name("something"), LlmProvider::Claude);
    }

    #[test]
    fn test_resolver_config_default() {
        let config = ResolverConfig::default();
        assert_eq!(config.confidence_floor, 0.6);
        assert_eq!(config.hard_floor, 0.3);
        assert_eq!(config.fallback_agent, "general-purpose");
        assert!(config.hard_floor < config.confidence_floor);
    }

    #[test]
    fn test_cache_and_pipeline_defaults() {
        assert_eq!(CacheConfig::default().default_ttl_ms, 3_600_000);
        assert_eq!(PipelineConfig::default().max_parallel, 4);
        assert_eq!(SessionConfig::default().db_path, "data/stagecraft.db");
    }

    #[test]
    fn test_expand_env_vars() {
        unsafe {
            std::env::set_var("STAGECRAFT_TEST_VAR", "test_value");
        }

        let result = Config::expand_env_vars("prefix_${STAGECRAFT_TEST_VAR}_suffix");
        assert_eq!(result, "prefix_test_value_suffix");

        let result = Config::expand_env_vars("prefix_${STAGECRAFT_NONEXISTENT}_suffix");
        assert_eq!(result, "prefix__suffix");

        unsafe {
            std::env::remove_var("STAGECRAFT_TEST_VAR");
        }
    }

    #[test]
    fn test_expand_env_vars_passthrough() {
        assert_eq!(Config::expand_env_vars("no_vars_here"), "no_vars_here");
        assert_eq!(Config::expand_env_vars("${}_content"), "_content");
        assert_eq!(Config::expand_env_vars("cost: $5"), "cost: $5");
    }

    #[test]
    fn test_toml_config_parsing() {
        let toml_content = r#"
[llm]
provider = "openai"
model = "glm-4.7"
api_key = "test_key"
base_url = "https://api.example.com"

[resolver]
confidence_floor = 0.5
fallback_agent = "generalist"

[resolver.weights]
domain = 0.6

[pipeline]
max_parallel = 2

[cache]
enabled = false

[agents]
dir = "agents"

[session]
db_path = "/tmp/runs.db"
"#;

        let config = Config::from_toml_str(toml_content).unwrap();

        assert_eq!(config.llm.provider, LlmProvider::OpenAi);
        assert_eq!(config.llm.model, "glm-4.7");
        assert_eq!(config.llm.base_url.as_deref(), Some("https://api.example.com"));
        assert_eq!(config.llm.max_tokens, 4096);

        assert_eq!(config.resolver.confidence_floor, 0.5);
        assert_eq!(config.resolver.hard_floor, 0.3);
        assert_eq!(config.resolver.fallback_agent, "generalist");
        assert_eq!(config.resolver.weights.domain, 0.6);
        assert_eq!(config.resolver.weights.criteria, 0.35);

        assert_eq!(config.pipeline.max_parallel, 2);
        assert_eq!(config.pipeline.default_timeout_ms, 120_000);
        assert!(!config.cache.enabled);
        assert_eq!(config.agents.dir.as_deref(), Some("agents"));
        assert!(config.prompts.dir.is_none());
        assert_eq!(config.session.db_path, "/tmp/runs.db");
    }

    #[test]
    fn test_toml_config_empty_file() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.llm.model, "claude-sonnet-4-20250514");
        assert!(config.cache.enabled);
    }

    #[test]
    fn test_toml_config_invalid() {
        let err = Config::from_toml_str("[llm\nmodel = 1").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
