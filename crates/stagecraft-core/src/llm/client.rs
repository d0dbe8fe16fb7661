//! LLM API HTTP Client
//!
//! Supports both Claude API and OpenAI-compatible APIs (GLM, etc.)

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, warn};

use super::provider::CompletionProvider;
use super::types::*;
use crate::config::{LlmConfig, LlmProvider};
use crate::error::{Error, Result};

/// HTTP completion provider (Claude or OpenAI-compatible wire format)
#[derive(Clone)]
pub struct HttpCompletionProvider {
    client: Client,
    api_key: String,
    model: String,
    max_tokens: u64,
    base_url: String,
    provider: LlmProvider,
}

impl HttpCompletionProvider {
    /// Create a new provider from the LLM configuration
    pub fn new(config: &LlmConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(Error::config("LLM_API_KEY or CLAUDE_API_KEY not set"));
        }

        // Per-stage timeouts are enforced by the stage executor; this only
        // bounds a stuck connection.
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(600))
            .build()
            .map_err(Error::Http)?;

        let base_url = match &config.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => match config.provider {
                LlmProvider::Claude => "https://api.anthropic.com/v1".to_string(),
                LlmProvider::OpenAi => "https://api.openai.com/v1".to_string(),
            },
        };

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            base_url,
            provider: config.provider.clone(),
        })
    }

    /// Get the model name
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Get the provider type
    pub fn provider(&self) -> &LlmProvider {
        &self.provider
    }

    async fn send_claude_request(&self, request: MessagesRequest) -> Result<CompletionResult> {
        let url = format!("{}/messages", self.base_url);

        debug!("Sending request to Claude API: {}", url);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            warn!("Claude API error: {} - {}", status, body);
            return Err(Error::Provider(format!("{}: {}", status, body)));
        }

        let parsed: MessagesResponse = serde_json::from_str(&body).map_err(|e| {
            Error::Provider(format!("Failed to parse response: {} - {}", e, body))
        })?;

        let result = parsed.into_result();

        info!(
            stop_reason = %result.stop_reason,
            output_tokens = result.usage.output_tokens,
            "Claude API response"
        );

        Ok(result)
    }

    async fn send_openai_request(&self, request: MessagesRequest) -> Result<CompletionResult> {
        let url = format!("{}/chat/completions", self.base_url);

        debug!("Sending request to OpenAI-compatible API: {}", url);

        let openai_request = ChatCompletionRequest::from_claude_request(&request);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(&openai_request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            warn!("OpenAI API error: {} - {}", status, body);
            return Err(Error::Provider(format!("{}: {}", status, body)));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&body).map_err(|e| {
            Error::Provider(format!("Failed to parse response: {} - {}", e, body))
        })?;

        let result = parsed.into_result();

        info!(
            stop_reason = %result.stop_reason,
            output_tokens = result.usage.output_tokens,
            "OpenAI API response"
        );

        Ok(result)
    }
}

#[async_trait]
impl CompletionProvider for HttpCompletionProvider {
    fn name(&self) -> &str {
        match self.provider {
            LlmProvider::Claude => "claude",
            LlmProvider::OpenAi => "openai",
        }
    }

    async fn complete(&self, options: CompletionOptions) -> Result<CompletionResult> {
        let request = MessagesRequest::from_options(&options, &self.model, self.max_tokens);

        match self.provider {
            LlmProvider::Claude => self.send_claude_request(request).await,
            LlmProvider::OpenAi => self.send_openai_request(request).await,
        }
    }
}
