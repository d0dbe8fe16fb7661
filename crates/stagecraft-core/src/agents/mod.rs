//! Dynamic agent resolution
//!
//! Picks the best-suited specialist agent for a task.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌─────────────────────────────────────────────┐
//! │ AgentLoader  │────▶│          AgentCapabilityRegistry            │
//! │ (builtin/dir)│     │  inheritance merged, validated, read-only   │
//! └──────────────┘     └──────────────────────┬──────────────────────┘
//!                                             │
//!  TaskContext ──┬──▶ TaskClassifier ──┐      ▼
//!                │                     ├──▶ AgentCapabilityMatcher ──▶ ranked scores
//!                └──▶ ContextAnalyzer ─┘                                   │
//!                                                                          ▼
//!                                                   DynamicAgentResolver::resolve_agent
//!                                                   (fallback below the floors)
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use stagecraft_core::agents::{AgentCapabilityRegistry, DynamicAgentResolver, TaskContext};
//! use stagecraft_core::config::ResolverConfig;
//! use std::sync::Arc;
//!
//! let registry = AgentCapabilityRegistry::builtin().await?;
//! let resolver = DynamicAgentResolver::new(Arc::new(registry), ResolverConfig::default());
//!
//! let task = TaskContext::new("Set up AWS infrastructure with Terraform")
//!     .with_files(&["infra/main.tf"]);
//! let selection = resolver.resolve_agent(&task);
//! println!("{} ({:.2})", selection.effective_agent(), selection.confidence);
//! ```

pub mod analyzer;
pub mod builtin;
pub mod classifier;
pub mod loader;
pub mod matcher;
pub mod registry;
pub mod resolver;
pub mod types;
mod vocabulary;

// Re-exports
pub use analyzer::ContextAnalyzer;
pub use builtin::{GENERAL_PURPOSE_ROLE, builtin_capabilities};
pub use classifier::TaskClassifier;
pub use loader::{AgentLoader, BuiltinAgentLoader, DirectoryAgentLoader};
pub use matcher::{AgentCapabilityMatcher, TaskText};
pub use registry::AgentCapabilityRegistry;
pub use resolver::DynamicAgentResolver;
pub use types::{
    AgentAlternative, AgentCapability, AgentScore, AgentSelection, CodebaseContext, Complexity,
    DetailedAnalysis, ServiceHealth, TaskClassification, TaskContext,
};
