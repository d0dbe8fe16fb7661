//! Multi-stage prompt pipelines
//!
//! ```text
//! CommandDefinition --> PipelineExecutor --> StageExecutor --> CompletionProvider
//!                            |    |               |
//!                        StageCache  EventBus   DynamicAgentResolver
//! ```
//!
//! A pipeline is an ordered list of stages. Each stage renders a prompt
//! from inputs that reference initial inputs (`input.<key>`) or earlier
//! stage outputs (`<stage>.<key>`), calls the provider and records named
//! outputs for later stages.

pub mod cache;
pub mod command;
pub mod condition;
pub mod events;
pub mod executor;
pub mod isolation;
pub mod prompt;
pub mod reference;
pub mod stage;
pub mod types;
pub mod validate;

pub use cache::{CacheStats, Fingerprint, StageCache};
pub use command::{CommandDefinition, CommandLoader};
pub use condition::Condition;
pub use events::{EventBus, PipelineEvent};
pub use executor::{IsolationPlan, PipelineExecutor, RunRequest, RunSink};
pub use isolation::{CommandIsolationExecutor, IsolationOptions};
pub use prompt::{DirectoryPromptLoader, InlinePromptLoader, PromptLoader};
pub use reference::{InputReference, OutputScope};
pub use stage::{StageContext, StageExecutor};
pub use types::{
    AbortInfo, BackoffKind, CacheStrategy, FailureKind, MergeStrategy, OutputMap, PipelineResult,
    PipelineStage, PromptsPipeline, RetryPolicy, StageCacheConfig, StageMetadata, StageOutput,
};
pub use validate::validate_pipeline;
