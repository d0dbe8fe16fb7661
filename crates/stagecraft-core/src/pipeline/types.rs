//! Pipeline definition and result types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Named values produced by a stage (or supplied as initial inputs)
pub type OutputMap = serde_json::Map<String, Value>;

/// Default cache TTL: one hour
pub const DEFAULT_CACHE_TTL_MS: u64 = 3_600_000;

fn default_true() -> bool {
    true
}

fn default_ttl_ms() -> u64 {
    DEFAULT_CACHE_TTL_MS
}

/// Which stages may be served from the stage cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    #[default]
    None,
    Stage,
    Pipeline,
    Adaptive,
}

/// How adjacent stages are scheduled and how their outputs flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    #[default]
    Sequential,
    Parallel,
    Conditional,
    Waterfall,
}

/// Failure classification used by retry policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Error,
    Timeout,
    ValidationFailed,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Timeout => write!(f, "timeout"),
            Self::ValidationFailed => write!(f, "validation_failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_retry_on() -> Vec<FailureKind> {
    vec![FailureKind::Error, FailureKind::Timeout]
}

/// Retry behavior for failing stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff_ms: u64,
    #[serde(default)]
    pub backoff: BackoffKind,
    #[serde(default = "default_retry_on")]
    pub retry_on: Vec<FailureKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: 0,
            backoff: BackoffKind::default(),
            retry_on: default_retry_on(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, backoff_ms: u64, backoff: BackoffKind) -> Self {
        self.backoff_ms = backoff_ms;
        self.backoff = backoff;
        self
    }

    pub fn retry_on(mut self, kinds: &[FailureKind]) -> Self {
        self.retry_on = kinds.to_vec();
        self
    }

    /// Whether another attempt follows a failure on attempt `attempt` (1-based)
    pub fn should_retry(&self, kind: FailureKind, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1) && self.retry_on.contains(&kind)
    }

    /// Delay before attempt `attempt + 1`; only exponential growth is
    /// capped at `max_backoff_ms`
    pub fn delay(&self, attempt: u32, max_backoff_ms: u64) -> Duration {
        let ms = match self.backoff {
            BackoffKind::Fixed => self.backoff_ms,
            BackoffKind::Exponential => {
                let shift = attempt.saturating_sub(1).min(32);
                self.backoff_ms
                    .saturating_mul(1u64 << shift)
                    .min(max_backoff_ms.max(self.backoff_ms))
            }
        };
        Duration::from_millis(ms)
    }
}

/// Per-stage cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    /// Inputs that participate in the fingerprint; all inputs when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key_inputs: Option<Vec<String>>,
    /// Files whose content is part of the fingerprint
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_dependencies: Vec<String>,
}

impl Default for StageCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: DEFAULT_CACHE_TTL_MS,
            cache_key_inputs: None,
            file_dependencies: vec![],
        }
    }
}

impl StageCacheConfig {
    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    pub fn with_key_inputs(mut self, inputs: &[&str]) -> Self {
        self.cache_key_inputs = Some(inputs.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn with_file_dependencies<S: AsRef<str>>(mut self, files: &[S]) -> Self {
        self.file_dependencies = files.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }
}

/// One stage of a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStage {
    /// Unique stage id
    pub stage: String,
    /// Prompt reference, resolved by the prompt loader
    pub prompt: String,
    /// Logical input name -> `<source>.<key>[.<path>]`
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditional: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<StageCacheConfig>,
    /// Pinned agent role for this stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Model override; the provider's configured model when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl PipelineStage {
    pub fn new(stage: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            prompt: prompt.into(),
            inputs: BTreeMap::new(),
            outputs: vec![],
            required: true,
            parallel: false,
            conditional: None,
            timeout_ms: None,
            cache: None,
            agent: None,
            model: None,
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, reference: impl Into<String>) -> Self {
        self.inputs.insert(name.into(), reference.into());
        self
    }

    pub fn with_outputs(mut self, outputs: &[&str]) -> Self {
        self.outputs = outputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn in_parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    pub fn with_condition(mut self, expression: impl Into<String>) -> Self {
        self.conditional = Some(expression.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_cache(mut self, cache: StageCacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// The ordered stage list of a command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptsPipeline {
    #[serde(default)]
    pub cache_strategy: CacheStrategy,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    pub stages: Vec<PipelineStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Stage run once as cleanup when a required stage fails terminally
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_on_failure: Option<String>,
}

impl PromptsPipeline {
    pub fn new(stages: Vec<PipelineStage>) -> Self {
        Self {
            stages,
            ..Default::default()
        }
    }

    pub fn with_cache_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.cache_strategy = strategy;
        self
    }

    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = strategy;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_rollback(mut self, stage: impl Into<String>) -> Self {
        self.rollback_on_failure = Some(stage.into());
        self
    }

    pub fn stage(&self, id: &str) -> Option<&PipelineStage> {
        self.stages.iter().find(|s| s.stage == id)
    }

    /// Stages that take part in normal execution (the rollback stage does not)
    pub fn execution_stages(&self) -> impl Iterator<Item = &PipelineStage> {
        self.stages
            .iter()
            .filter(|s| self.rollback_on_failure.as_deref() != Some(s.stage.as_str()))
    }
}

/// Execution details attached to a stage output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageMetadata {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cache_hit: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    /// Outputs injected by an isolated run rather than executed
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub mocked: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub rollback: bool,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Resolver confidence when the agent was chosen dynamically
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// Result of one executed (or cache-satisfied, or skipped) stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    pub stage: String,
    pub success: bool,
    #[serde(default)]
    pub outputs: OutputMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<StageMetadata>,
}

impl StageOutput {
    pub fn success(stage: impl Into<String>, outputs: OutputMap, duration_ms: u64) -> Self {
        Self {
            stage: stage.into(),
            success: true,
            outputs,
            error: None,
            duration_ms,
            metadata: None,
        }
    }

    pub fn failure(stage: impl Into<String>, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            stage: stage.into(),
            success: false,
            outputs: OutputMap::new(),
            error: Some(error.into()),
            duration_ms,
            metadata: None,
        }
    }

    /// Successful, empty output for a stage that did not run
    pub fn skipped(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut output = Self::success(stage, OutputMap::new(), 0);
        let metadata = output.metadata_mut();
        metadata.skipped = true;
        metadata.skip_reason = Some(reason.into());
        output
    }

    pub fn metadata_mut(&mut self) -> &mut StageMetadata {
        self.metadata.get_or_insert_with(StageMetadata::default)
    }

    pub fn is_skipped(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.skipped)
    }

    pub fn is_cache_hit(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.cache_hit)
    }

    pub fn attempts(&self) -> u32 {
        self.metadata.as_ref().map_or(0, |m| m.attempts)
    }
}

/// Why and where a run stopped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbortInfo {
    pub stage: String,
    pub error: String,
    pub attempts: u32,
    pub rollback_ran: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_success: Option<bool>,
}

/// Outcome of one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub success: bool,
    /// Execution trace in completion order, rollback last
    pub stages: Vec<StageOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<AbortInfo>,
    #[serde(default)]
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl PipelineResult {
    pub fn stage(&self, id: &str) -> Option<&StageOutput> {
        self.stages.iter().find(|s| s.stage == id)
    }
}
