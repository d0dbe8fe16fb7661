//! Pipeline execution
//!
//! Stages run in declaration order (the rollback stage excepted). Under the
//! parallel merge strategy consecutive `parallel` stages run concurrently,
//! bounded by `max_parallel`. Each stage goes through:
//!
//! ```text
//! resolve inputs -> condition -> cache lookup -> attempt (+ retries) -> record
//! ```
//!
//! A failing required stage aborts the run and triggers the rollback stage
//! once. A failing optional stage is recorded and its outputs resolve to
//! `null` downstream.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cache::{Fingerprint, StageCache};
use super::command::CommandDefinition;
use super::events::{EventBus, PipelineEvent};
use super::reference::OutputScope;
use super::stage::{StageContext, StageExecutor};
use super::types::{
    AbortInfo, CacheStrategy, MergeStrategy, OutputMap, PipelineResult, PipelineStage,
    PromptsPipeline, RetryPolicy, StageOutput,
};
use super::validate::{execution_groups, upstream_stages, validate_pipeline};
use crate::config::{CacheConfig, PipelineConfig};
use crate::{Error, Result};

/// Receives every finished run
#[async_trait]
pub trait RunSink: Send + Sync {
    async fn record(&self, result: &PipelineResult) -> Result<()>;
}

/// Overrides for a partial run
#[derive(Debug, Clone, Default)]
pub struct IsolationPlan {
    /// Stages to execute; `None` runs every stage
    pub selected: Option<HashSet<String>>,
    /// Outputs standing in for stages that do not run
    pub mocks: HashMap<String, OutputMap>,
    /// Stages treated as optional for this run
    pub downgraded: HashSet<String>,
    pub skip_validation: bool,
}

impl IsolationPlan {
    pub fn excludes(&self, stage: &str) -> bool {
        self.selected.as_ref().is_some_and(|s| !s.contains(stage))
    }
}

/// One pipeline run
#[derive(Debug, Clone)]
pub struct RunRequest<'a> {
    pub pipeline: &'a PromptsPipeline,
    pub inputs: OutputMap,
    pub command: Option<&'a str>,
    pub description: Option<&'a str>,
    /// Agent pinned for every stage that does not pin its own
    pub static_agent: Option<&'a str>,
    pub cancel: CancellationToken,
    pub isolation: Option<IsolationPlan>,
}

impl<'a> RunRequest<'a> {
    pub fn new(pipeline: &'a PromptsPipeline, inputs: OutputMap) -> Self {
        Self {
            pipeline,
            inputs,
            command: None,
            description: None,
            static_agent: None,
            cancel: CancellationToken::new(),
            isolation: None,
        }
    }

    pub fn for_command(command: &'a CommandDefinition, inputs: OutputMap) -> Self {
        Self {
            command: Some(&command.name),
            description: Some(&command.description).filter(|d| !d.is_empty()).map(String::as_str),
            static_agent: command.agent.as_deref(),
            ..Self::new(&command.prompts, inputs)
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_isolation(mut self, plan: IsolationPlan) -> Self {
        self.isolation = Some(plan);
        self
    }
}

/// Read-only facts about the current run
struct RunContext<'a> {
    run_id: String,
    pipeline: &'a PromptsPipeline,
    description: Option<&'a str>,
    static_agent: Option<&'a str>,
    cancel: CancellationToken,
    plan: IsolationPlan,
    policy: RetryPolicy,
}

impl RunContext<'_> {
    fn is_required(&self, stage: &PipelineStage) -> bool {
        stage.required && !self.plan.downgraded.contains(&stage.stage)
    }

    fn stage_context(&self, attempt: u32) -> StageContext<'_> {
        StageContext {
            run_id: &self.run_id,
            static_agent: self.static_agent,
            description: self.description,
            cancel: &self.cancel,
            attempt,
        }
    }
}

/// State updated between scheduling groups
struct RunState {
    scope: OutputScope,
    /// Stages whose outputs came from the cache
    cache_satisfied: HashSet<String>,
    /// Stages skipped by their condition under the conditional strategy
    conditionally_skipped: HashSet<String>,
    trace: Vec<StageOutput>,
}

enum RunEnd {
    Completed,
    Aborted(AbortInfo),
    Cancelled,
}

/// Runs pipelines stage by stage
pub struct PipelineExecutor {
    stages: StageExecutor,
    cache: Arc<StageCache>,
    events: EventBus,
    config: PipelineConfig,
    cache_config: CacheConfig,
    base_dir: PathBuf,
    sink: Option<Arc<dyn RunSink>>,
}

impl PipelineExecutor {
    pub fn new(stages: StageExecutor) -> Self {
        let cache_config = CacheConfig::default();
        Self {
            events: stages.events().clone(),
            stages,
            cache: Arc::new(StageCache::new(cache_config.max_entries)),
            config: PipelineConfig::default(),
            cache_config,
            base_dir: PathBuf::from("."),
            sink: None,
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Apply cache settings; replaces the cache with one sized accordingly
    pub fn with_cache_config(mut self, config: CacheConfig) -> Self {
        self.cache = Arc::new(StageCache::new(config.max_entries));
        self.cache_config = config;
        self
    }

    /// Share a cache between executors
    pub fn with_cache(mut self, cache: Arc<StageCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Directory that relative cache file dependencies resolve against
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn RunSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn cache(&self) -> &Arc<StageCache> {
        &self.cache
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub async fn run(
        &self,
        pipeline: &PromptsPipeline,
        inputs: OutputMap,
    ) -> Result<PipelineResult> {
        self.execute(RunRequest::new(pipeline, inputs)).await
    }

    pub async fn run_with_cancel(
        &self,
        pipeline: &PromptsPipeline,
        inputs: OutputMap,
        cancel: CancellationToken,
    ) -> Result<PipelineResult> {
        self.execute(RunRequest::new(pipeline, inputs).with_cancel(cancel))
            .await
    }

    pub async fn run_command(
        &self,
        command: &CommandDefinition,
        inputs: OutputMap,
        cancel: CancellationToken,
    ) -> Result<PipelineResult> {
        self.execute(RunRequest::for_command(command, inputs).with_cancel(cancel))
            .await
    }

    /// Run a pipeline to completion, abort or cancellation.
    ///
    /// Stage failures are reported in the result. `Err` is reserved for
    /// configuration problems: an invalid definition, an unresolvable
    /// reference or a prompt that cannot be loaded.
    pub async fn execute(&self, request: RunRequest<'_>) -> Result<PipelineResult> {
        let started_at = Utc::now();
        let started = Instant::now();
        let pipeline = request.pipeline;

        let ctx = RunContext {
            run_id: Uuid::now_v7().to_string(),
            pipeline,
            description: request.description,
            static_agent: request.static_agent,
            cancel: request.cancel,
            plan: request.isolation.unwrap_or_default(),
            policy: pipeline.retry_policy.clone().unwrap_or_default(),
        };

        if !ctx.plan.skip_validation {
            if let Err(e) = validate_pipeline(pipeline) {
                self.publish_error(&ctx.run_id, &e);
                return Err(e);
            }
        }

        let groups = execution_groups(pipeline);
        let stage_count: usize = groups.iter().map(Vec::len).sum();

        info!(
            run_id = %ctx.run_id,
            command = request.command.unwrap_or("-"),
            stages = stage_count,
            "Starting pipeline"
        );
        self.events.publish(PipelineEvent::PipelineStarted {
            run_id: ctx.run_id.clone(),
            stage_count,
        });

        let mut state = RunState {
            scope: OutputScope::new(request.inputs),
            cache_satisfied: HashSet::new(),
            conditionally_skipped: HashSet::new(),
            trace: Vec::new(),
        };

        let end = match self.run_groups(&ctx, &groups, &mut state).await {
            Ok(end) => end,
            Err(e) => {
                self.publish_error(&ctx.run_id, &e);
                return Err(e);
            }
        };

        let (aborted, cancelled) = match end {
            RunEnd::Completed => (None, false),
            RunEnd::Cancelled => {
                warn!(run_id = %ctx.run_id, "Pipeline cancelled");
                (None, true)
            }
            RunEnd::Aborted(mut info) => {
                warn!(
                    run_id = %ctx.run_id,
                    stage = %info.stage,
                    attempts = info.attempts,
                    error = %info.error,
                    "Required stage failed; aborting"
                );
                if let Some(rollback) = pipeline.rollback_on_failure.as_deref().and_then(|id| pipeline.stage(id)) {
                    let output = self.run_rollback(&ctx, rollback, &state.scope).await;
                    info.rollback_ran = true;
                    info.rollback_success = Some(output.success);
                    state.trace.push(output);
                }
                (Some(info), false)
            }
        };

        let result = PipelineResult {
            run_id: ctx.run_id.clone(),
            command: request.command.map(str::to_string),
            success: aborted.is_none() && !cancelled,
            stages: state.trace,
            aborted,
            cancelled,
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            run_id = %result.run_id,
            success = result.success,
            duration_ms = result.duration_ms,
            "Pipeline finished"
        );
        self.events.publish(PipelineEvent::PipelineCompleted {
            run_id: result.run_id.clone(),
            success: result.success,
            duration_ms: result.duration_ms,
        });

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.record(&result).await {
                warn!(run_id = %result.run_id, error = %e, "Failed to record pipeline run");
            }
        }

        Ok(result)
    }

    fn publish_error(&self, run_id: &str, error: &Error) {
        self.events.publish(PipelineEvent::PipelineError {
            run_id: run_id.to_string(),
            error: error.to_string(),
        });
    }

    async fn run_groups(
        &self,
        ctx: &RunContext<'_>,
        groups: &[Vec<&PipelineStage>],
        state: &mut RunState,
    ) -> Result<RunEnd> {
        let semaphore = Semaphore::new(self.config.max_parallel.max(1));

        for group in groups {
            if ctx.cancel.is_cancelled() {
                return Ok(RunEnd::Cancelled);
            }

            let mut runnable = Vec::with_capacity(group.len());
            for stage in group {
                if ctx.plan.excludes(&stage.stage) {
                    self.substitute(ctx, stage, state);
                } else {
                    runnable.push(*stage);
                }
            }

            let outcomes = if runnable.len() > 1 {
                debug!(run_id = %ctx.run_id, stages = runnable.len(), "Running parallel group");
                let semaphore = &semaphore;
                let shared: &RunState = state;
                join_all(runnable.iter().map(|stage| async move {
                    // Acquire only fails once the semaphore is closed, which never happens here
                    let _permit = semaphore.acquire().await.ok();
                    self.run_stage(ctx, stage, shared).await
                }))
                .await
            } else {
                let mut outcomes = Vec::with_capacity(1);
                for stage in &runnable {
                    outcomes.push(self.run_stage(ctx, stage, state).await);
                }
                outcomes
            };

            let mut failure = None;
            let mut cancelled = false;

            for (stage, outcome) in runnable.iter().zip(outcomes) {
                let output = match outcome {
                    Ok(output) => output,
                    Err(Error::Cancelled) => {
                        cancelled = true;
                        StageOutput::failure(&stage.stage, Error::Cancelled.to_string(), 0)
                    }
                    Err(e) => return Err(e),
                };

                self.events.publish(PipelineEvent::StageCompleted {
                    run_id: ctx.run_id.clone(),
                    stage: stage.stage.clone(),
                    duration_ms: output.duration_ms,
                    skipped: output.is_skipped(),
                });

                if output.is_skipped() && ctx.pipeline.merge_strategy == MergeStrategy::Conditional {
                    state.conditionally_skipped.insert(stage.stage.clone());
                }
                if output.is_cache_hit() {
                    state.cache_satisfied.insert(stage.stage.clone());
                }

                if !output.success && !cancelled {
                    if ctx.is_required(stage) {
                        if failure.is_none() {
                            failure = Some(AbortInfo {
                                stage: stage.stage.clone(),
                                error: output.error.clone().unwrap_or_default(),
                                attempts: output.attempts(),
                                rollback_ran: false,
                                rollback_success: None,
                            });
                        }
                    } else {
                        warn!(
                            run_id = %ctx.run_id,
                            stage = %stage.stage,
                            error = output.error.as_deref().unwrap_or(""),
                            "Optional stage failed; continuing"
                        );
                    }
                }

                state.scope.record(&output);
                state.trace.push(output);
            }

            if cancelled {
                return Ok(RunEnd::Cancelled);
            }
            if let Some(info) = failure {
                return Ok(RunEnd::Aborted(info));
            }
        }

        Ok(RunEnd::Completed)
    }

    /// Stand-in for a stage left out of an isolated run
    fn substitute(&self, ctx: &RunContext<'_>, stage: &PipelineStage, state: &mut RunState) {
        let output = match ctx.plan.mocks.get(&stage.stage) {
            Some(mock) => {
                let mut output = StageOutput::success(&stage.stage, mock.clone(), 0);
                output.metadata_mut().mocked = true;
                output
            }
            None => StageOutput::skipped(&stage.stage, "not selected for this run"),
        };

        debug!(run_id = %ctx.run_id, stage = %stage.stage, mocked = output.success && !output.is_skipped(), "Substituting stage");
        self.events.publish(PipelineEvent::StageCompleted {
            run_id: ctx.run_id.clone(),
            stage: stage.stage.clone(),
            duration_ms: 0,
            skipped: true,
        });

        state.scope.record(&output);
        state.trace.push(output);
    }

    async fn run_stage(
        &self,
        ctx: &RunContext<'_>,
        stage: &PipelineStage,
        state: &RunState,
    ) -> Result<StageOutput> {
        let started = Instant::now();
        let merge = ctx.pipeline.merge_strategy;

        if merge == MergeStrategy::Conditional {
            if let Some(upstream) = upstream_stages(stage)
                .into_iter()
                .find(|s| state.conditionally_skipped.contains(s))
            {
                return Ok(StageOutput::skipped(
                    &stage.stage,
                    format!("upstream stage '{}' was skipped", upstream),
                ));
            }
        }

        let mut inputs = state.scope.resolve_inputs(stage)?;
        if merge == MergeStrategy::Waterfall {
            if let Some((_, previous)) = state.scope.last_completed() {
                let mut merged = previous.clone();
                merged.extend(inputs);
                inputs = merged;
            }
        }

        if let Some(reason) = self.stages.skip_reason(stage, &inputs, &state.scope)? {
            info!(run_id = %ctx.run_id, stage = %stage.stage, reason = %reason, "Skipping stage");
            return Ok(StageOutput::skipped(&stage.stage, reason));
        }

        let Some(ttl) = self.cache_ttl(ctx.pipeline, stage, state) else {
            return self.attempt(ctx, stage, &inputs, started).await;
        };

        let fingerprint = match Fingerprint::compute(stage, &inputs, &self.base_dir).await {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                warn!(stage = %stage.stage, error = %e, "Cannot fingerprint stage; running uncached");
                return self.attempt(ctx, stage, &inputs, started).await;
            }
        };

        let (mut output, hit) = self
            .cache
            .get_or_compute(&stage.stage, &fingerprint, ttl, || {
                self.attempt(ctx, stage, &inputs, started)
            })
            .await?;

        let metadata = output.metadata_mut();
        metadata.fingerprint = Some(fingerprint.key.clone());
        if hit {
            metadata.cache_hit = true;
            metadata.attempts = 0;
            output.duration_ms = started.elapsed().as_millis() as u64;
            self.events.publish(PipelineEvent::CacheHit {
                run_id: ctx.run_id.clone(),
                stage: stage.stage.clone(),
                fingerprint: fingerprint.short().to_string(),
            });
        }

        Ok(output)
    }

    /// TTL when the stage may be served from the cache under the
    /// pipeline's strategy
    fn cache_ttl(
        &self,
        pipeline: &PromptsPipeline,
        stage: &PipelineStage,
        state: &RunState,
    ) -> Option<Duration> {
        if !self.cache_config.enabled {
            return None;
        }

        let configured = stage.cache.as_ref();
        if configured.is_some_and(|c| !c.enabled) {
            return None;
        }

        let cacheable = match pipeline.cache_strategy {
            CacheStrategy::None => false,
            CacheStrategy::Stage => configured.is_some(),
            CacheStrategy::Pipeline => true,
            CacheStrategy::Adaptive => {
                configured.is_some()
                    || upstream_stages(stage)
                        .iter()
                        .all(|s| state.cache_satisfied.contains(s))
            }
        };

        let ttl_ms = configured.map_or(self.cache_config.default_ttl_ms, |c| c.ttl_ms);
        cacheable.then(|| Duration::from_millis(ttl_ms))
    }

    /// Invoke the stage, retrying per the pipeline's policy.
    ///
    /// Retryable failures end as an unsuccessful output; only
    /// configuration errors and cancellation return `Err`.
    async fn attempt(
        &self,
        ctx: &RunContext<'_>,
        stage: &PipelineStage,
        inputs: &OutputMap,
        started: Instant,
    ) -> Result<StageOutput> {
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.events.publish(PipelineEvent::StageStarted {
                run_id: ctx.run_id.clone(),
                stage: stage.stage.clone(),
                attempt,
            });

            let error = match self
                .stages
                .invoke(stage, inputs, &ctx.stage_context(attempt))
                .await
            {
                Ok(mut output) => {
                    output.metadata_mut().attempts = attempt;
                    output.duration_ms = started.elapsed().as_millis() as u64;
                    return Ok(output);
                }
                Err(e) => e,
            };

            let Some(kind) = error.failure_kind() else {
                return Err(error);
            };

            self.events.publish(PipelineEvent::StageError {
                run_id: ctx.run_id.clone(),
                stage: stage.stage.clone(),
                error: error.to_string(),
                kind: Some(kind),
                attempt,
            });

            if !ctx.policy.should_retry(kind, attempt) {
                let mut output = StageOutput::failure(
                    &stage.stage,
                    error.to_string(),
                    started.elapsed().as_millis() as u64,
                );
                let metadata = output.metadata_mut();
                metadata.attempts = attempt;
                metadata.failure_kind = Some(kind);
                return Ok(output);
            }

            let delay = ctx.policy.delay(attempt, self.config.max_backoff_ms);
            warn!(
                run_id = %ctx.run_id,
                stage = %stage.stage,
                attempt,
                kind = %kind,
                delay_ms = delay.as_millis() as u64,
                "Stage attempt failed; retrying"
            );
            self.events.publish(PipelineEvent::StageProgress {
                run_id: ctx.run_id.clone(),
                stage: stage.stage.clone(),
                message: format!("attempt {} failed ({}); retrying", attempt, kind),
            });

            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Run the rollback stage once; failures are reported, never raised
    async fn run_rollback(
        &self,
        ctx: &RunContext<'_>,
        stage: &PipelineStage,
        scope: &OutputScope,
    ) -> StageOutput {
        let started = Instant::now();
        info!(run_id = %ctx.run_id, stage = %stage.stage, "Running rollback stage");

        let result = match scope.resolve_inputs(stage) {
            Ok(inputs) => self.stages.invoke(stage, &inputs, &ctx.stage_context(1)).await,
            Err(e) => Err(e),
        };

        let mut output = result.unwrap_or_else(|e| {
            warn!(run_id = %ctx.run_id, stage = %stage.stage, error = %e, "Rollback failed");
            let mut output = StageOutput::failure(
                &stage.stage,
                e.to_string(),
                started.elapsed().as_millis() as u64,
            );
            output.metadata_mut().failure_kind = e.failure_kind();
            output
        });

        let metadata = output.metadata_mut();
        metadata.rollback = true;
        metadata.attempts = 1;

        self.events.publish(PipelineEvent::StageCompleted {
            run_id: ctx.run_id.clone(),
            stage: stage.stage.clone(),
            duration_ms: output.duration_ms,
            skipped: false,
        });

        output
    }
}
