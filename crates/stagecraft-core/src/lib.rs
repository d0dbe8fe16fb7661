//! stagecraft-core: multi-stage LLM pipelines with dynamic agent selection
//!
//! Runs declarative stage pipelines against a completion provider, wiring
//! stage outputs into later stage inputs with caching, retries, timeouts
//! and rollback, and picks the best-suited agent for each stage when a
//! command does not pin one.

pub mod agents;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod session;

pub use agents::{
    AgentCapability, AgentCapabilityRegistry, AgentSelection, DynamicAgentResolver, TaskContext,
};
pub use config::{
    AgentsConfig, CacheConfig, Config, LlmConfig, LlmProvider, MatchWeights, PipelineConfig,
    PromptsConfig, ResolverConfig, SessionConfig,
};
pub use error::{Error, Result};
pub use llm::{CompletionOptions, CompletionProvider, CompletionResult, HttpCompletionProvider};
pub use pipeline::{
    CommandDefinition, CommandIsolationExecutor, CommandLoader, EventBus, IsolationOptions,
    PipelineExecutor, PipelineResult, PromptsPipeline, StageExecutor,
};
pub use session::RunStore;
