//! LLM completion providers
//!
//! Supports both Claude API and OpenAI-compatible APIs (GLM, etc.)

mod client;
mod provider;
mod types;

pub use client::HttpCompletionProvider;
pub use provider::{ChunkHandler, CompletionProvider};
pub use types::*;
