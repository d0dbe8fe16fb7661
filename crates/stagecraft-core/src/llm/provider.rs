//! Completion provider interface
//!
//! Stage execution only depends on this trait; the HTTP client in
//! [`super::HttpCompletionProvider`] is one implementation.

use async_trait::async_trait;

use super::types::{CompletionOptions, CompletionResult};
use crate::Result;

/// Callback receiving streamed text chunks
pub type ChunkHandler<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// A source of LLM completions
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Provider name, used in logs and stage metadata
    fn name(&self) -> &str;

    /// Run a completion to the end
    async fn complete(&self, options: CompletionOptions) -> Result<CompletionResult>;

    /// Run a completion, delivering text as it arrives.
    ///
    /// The default implementation delivers the whole response as one chunk.
    async fn stream_complete(
        &self,
        options: CompletionOptions,
        on_chunk: ChunkHandler<'_>,
    ) -> Result<CompletionResult> {
        let result = self.complete(options).await?;
        on_chunk(&result.content);
        Ok(result)
    }
}
