//! Single-stage execution
//!
//! The stage executor evaluates a stage's condition, picks its agent,
//! renders the prompt and runs one completion under the stage timeout.
//! It never retries; [`super::PipelineExecutor`] owns retries.

use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::condition::Condition;
use super::events::{EventBus, PipelineEvent};
use super::prompt::{PromptLoader, build_prompt};
use super::reference::{InputReference, OutputScope, descend};
use super::types::{OutputMap, PipelineStage, StageOutput};
use crate::agents::{DynamicAgentResolver, TaskContext};
use crate::llm::{CompletionOptions, CompletionProvider};
use crate::{Error, Result};

/// Default stage timeout when neither the stage nor the config sets one
pub const DEFAULT_STAGE_TIMEOUT_MS: u64 = 120_000;

/// Key used when a stage declares no outputs
pub const RESPONSE_KEY: &str = "response";

/// Per-invocation context supplied by the pipeline executor
#[derive(Debug, Clone)]
pub struct StageContext<'a> {
    pub run_id: &'a str,
    /// Agent pinned by the command, if any
    pub static_agent: Option<&'a str>,
    /// Command description, used as task context for agent resolution
    pub description: Option<&'a str>,
    pub cancel: &'a CancellationToken,
    pub attempt: u32,
}

/// Agent chosen for one stage invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentChoice {
    pub role: Option<String>,
    /// Set when the role came from the resolver
    pub confidence: Option<f64>,
    pub system_prompt: Option<String>,
}

/// Executes one stage attempt
pub struct StageExecutor {
    provider: Arc<dyn CompletionProvider>,
    prompts: Arc<dyn PromptLoader>,
    resolver: Option<Arc<DynamicAgentResolver>>,
    events: EventBus,
    default_timeout_ms: u64,
}

impl StageExecutor {
    pub fn new(provider: Arc<dyn CompletionProvider>, prompts: Arc<dyn PromptLoader>) -> Self {
        Self {
            provider,
            prompts,
            resolver: None,
            events: EventBus::default(),
            default_timeout_ms: DEFAULT_STAGE_TIMEOUT_MS,
        }
    }

    /// Enable dynamic agent selection
    pub fn with_resolver(mut self, resolver: Option<Arc<DynamicAgentResolver>>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_default_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn resolver(&self) -> Option<&Arc<DynamicAgentResolver>> {
        self.resolver.as_ref()
    }

    /// Evaluate the condition and run the stage once
    pub async fn execute(
        &self,
        stage: &PipelineStage,
        inputs: &OutputMap,
        scope: &OutputScope,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutput> {
        if let Some(reason) = self.skip_reason(stage, inputs, scope)? {
            return Ok(StageOutput::skipped(&stage.stage, reason));
        }
        self.invoke(stage, inputs, ctx).await
    }

    /// `Some(reason)` when the stage's condition evaluates false
    pub fn skip_reason(
        &self,
        stage: &PipelineStage,
        inputs: &OutputMap,
        scope: &OutputScope,
    ) -> Result<Option<String>> {
        let Some(expression) = stage.conditional.as_deref() else {
            return Ok(None);
        };

        let condition = Condition::parse(expression)?;
        let run = condition.evaluate(|name| lookup_identifier(name, inputs, scope));

        debug!(stage = %stage.stage, condition = expression, run, "Evaluated stage condition");

        Ok((!run).then(|| format!("condition '{}' was false", expression)))
    }

    /// Pick the agent for a stage: stage pin, then command pin, then the
    /// resolver, then none
    pub fn choose_agent(
        &self,
        stage: &PipelineStage,
        prompt: &str,
        inputs: &OutputMap,
        ctx: &StageContext<'_>,
    ) -> AgentChoice {
        let pinned = stage.agent.as_deref().or(ctx.static_agent);

        let (role, confidence) = match (pinned, &self.resolver) {
            (Some(role), _) => (role.to_string(), None),
            (None, Some(resolver)) => {
                let task = task_context(prompt, inputs, ctx.description);
                let selection = resolver.resolve_agent(&task);
                (selection.effective_agent().to_string(), Some(selection.confidence))
            }
            (None, None) => return AgentChoice::default(),
        };

        let system_prompt = match self
            .resolver
            .as_ref()
            .and_then(|r| r.registry().get_by_role(&role))
        {
            Some(cap) if !cap.expertise.is_empty() => Some(format!(
                "You are a {}. {}\nAreas of expertise: {}.",
                cap.role,
                cap.description,
                cap.expertise.join(", ")
            )),
            Some(cap) => Some(format!("You are a {}. {}", cap.role, cap.description)),
            None => Some(format!("You are acting as {}.", role)),
        };

        AgentChoice {
            role: Some(role),
            confidence,
            system_prompt,
        }
    }

    /// Run one attempt without evaluating the condition
    pub async fn invoke(
        &self,
        stage: &PipelineStage,
        inputs: &OutputMap,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutput> {
        let started = Instant::now();

        let template = self.prompts.load(&stage.prompt).await?;
        let prompt = build_prompt(&template, inputs, &stage.outputs);
        let agent = self.choose_agent(stage, &prompt, inputs, ctx);

        let mut options = CompletionOptions::new(prompt);
        if let Some(system) = &agent.system_prompt {
            options = options.with_system(system.clone());
        }
        if let Some(model) = &stage.model {
            options = options.with_model(model.clone());
        }

        let timeout_ms = stage.timeout_ms.unwrap_or(self.default_timeout_ms);

        info!(
            run_id = ctx.run_id,
            stage = %stage.stage,
            attempt = ctx.attempt,
            agent = agent.role.as_deref().unwrap_or("-"),
            timeout_ms,
            "Invoking completion provider"
        );

        let events = self.events.clone();
        let run_id = ctx.run_id.to_string();
        let stage_id = stage.stage.clone();
        let on_chunk = move |chunk: &str| {
            events.publish(PipelineEvent::StageProgress {
                run_id: run_id.clone(),
                stage: stage_id.clone(),
                message: chunk.to_string(),
            });
        };

        let call = self.provider.stream_complete(options, &on_chunk);
        let completion = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
            result = tokio::time::timeout(Duration::from_millis(timeout_ms), call) => match result {
                Ok(completion) => completion?,
                Err(_) => {
                    return Err(Error::Timeout {
                        stage: stage.stage.clone(),
                        timeout_ms,
                    });
                }
            },
        };

        let outputs = parse_outputs(&stage.outputs, &completion.content)?;

        let mut output =
            StageOutput::success(&stage.stage, outputs, started.elapsed().as_millis() as u64);
        let metadata = output.metadata_mut();
        metadata.agent = agent.role;
        metadata.agent_confidence = agent.confidence;
        metadata.provider = Some(self.provider.name().to_string());
        Ok(output)
    }
}

/// Resolve a condition identifier: bare names and dotted paths into the
/// stage's resolved inputs first, then references into prior outputs
fn lookup_identifier(name: &str, inputs: &OutputMap, scope: &OutputScope) -> Value {
    let mut parts = name.split('.');
    let head = parts.next().unwrap_or_default();
    let rest: Vec<String> = parts.map(str::to_string).collect();

    if let Some(value) = inputs.get(head) {
        return descend(value, &rest).cloned().unwrap_or(Value::Null);
    }

    match InputReference::parse(name) {
        Ok(reference) => scope.resolve_lenient(&reference),
        Err(_) => Value::Null,
    }
}

fn string_list(inputs: &OutputMap, keys: &[&str]) -> Vec<String> {
    keys.iter()
        .filter_map(|k| inputs.get(*k))
        .filter_map(Value::as_array)
        .flatten()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect()
}

/// Task context for dynamic agent selection
fn task_context(prompt: &str, inputs: &OutputMap, description: Option<&str>) -> TaskContext {
    let text = match description {
        Some(d) if !d.is_empty() => format!("{}\n\n{}", d, prompt),
        _ => prompt.to_string(),
    };

    TaskContext {
        description: Some(text),
        affected_files: string_list(inputs, &["files", "affected_files", "affectedFiles"]),
        dependencies: string_list(inputs, &["dependencies", "deps"]),
        ..Default::default()
    }
}

/// Strip a surrounding markdown code fence
fn strip_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map_or("", |(_, b)| b);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn parse_json_object(text: &str) -> Option<OutputMap> {
    let candidates = [text.trim(), strip_fence(text)];
    for candidate in candidates {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(candidate) {
            return Some(map);
        }
    }

    // Object embedded in surrounding prose
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Map provider text onto the stage's declared outputs
pub fn parse_outputs(declared: &[String], text: &str) -> Result<OutputMap> {
    let mut outputs = OutputMap::new();

    if declared.is_empty() {
        outputs.insert(RESPONSE_KEY.to_string(), Value::String(text.to_string()));
        return Ok(outputs);
    }

    if let Some(object) = parse_json_object(text) {
        if declared.iter().all(|key| object.contains_key(key)) {
            return Ok(object);
        }
    }

    if let [single] = declared {
        outputs.insert(single.clone(), Value::String(text.trim().to_string()));
        return Ok(outputs);
    }

    Err(Error::Validation(format!(
        "response does not contain a JSON object with outputs: {}",
        declared.join(", ")
    )))
}
