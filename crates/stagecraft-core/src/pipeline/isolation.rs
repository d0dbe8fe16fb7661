//! Partial pipeline runs
//!
//! Runs a chosen subset of stages. Stages left out contribute mocked outputs
//! when given, `null` otherwise, and stages reading from them are treated as
//! optional unless `force_required` is set.

use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::command::CommandDefinition;
use super::executor::{IsolationPlan, PipelineExecutor, RunRequest};
use super::types::{OutputMap, PipelineResult, PromptsPipeline};
use super::validate::upstream_stages;
use crate::{Error, Result};

/// What to run and what to fake
#[derive(Debug, Clone, Default)]
pub struct IsolationOptions {
    /// Stage ids to execute; `None` runs every stage
    pub stages: Option<Vec<String>>,
    pub skip_validation: bool,
    /// `"stage.key" -> value`, or `"stage" -> {key: value, ...}`
    pub mock_inputs: OutputMap,
    /// Keep `required` as declared even when upstream stages are left out
    pub force_required: bool,
}

impl IsolationOptions {
    pub fn only<S: AsRef<str>>(stages: &[S]) -> Self {
        Self {
            stages: Some(stages.iter().map(|s| s.as_ref().to_string()).collect()),
            ..Default::default()
        }
    }

    pub fn with_mock(mut self, reference: impl Into<String>, value: Value) -> Self {
        self.mock_inputs.insert(reference.into(), value);
        self
    }
}

/// Runs pipelines with an [`IsolationPlan`]
#[derive(Clone)]
pub struct CommandIsolationExecutor {
    executor: Arc<PipelineExecutor>,
}

impl CommandIsolationExecutor {
    pub fn new(executor: Arc<PipelineExecutor>) -> Self {
        Self { executor }
    }

    /// Turn options into a plan, rejecting unknown stages and malformed mocks
    pub fn plan(&self, pipeline: &PromptsPipeline, options: &IsolationOptions) -> Result<IsolationPlan> {
        let known: HashSet<&str> = pipeline.stages.iter().map(|s| s.stage.as_str()).collect();

        let selected = match &options.stages {
            Some(stages) => {
                if let Some(unknown) = stages.iter().find(|s| !known.contains(s.as_str())) {
                    return Err(Error::config(format!(
                        "Cannot isolate unknown stage '{}'",
                        unknown
                    )));
                }
                Some(stages.iter().cloned().collect::<HashSet<_>>())
            }
            None => None,
        };

        let mut plan = IsolationPlan {
            selected,
            skip_validation: options.skip_validation,
            ..Default::default()
        };

        for (reference, value) in &options.mock_inputs {
            let (stage, key) = match reference.split_once('.') {
                Some((stage, key)) => (stage, Some(key)),
                None => (reference.as_str(), None),
            };

            if !known.contains(stage) {
                return Err(Error::config(format!(
                    "Mock '{}' refers to unknown stage '{}'",
                    reference, stage
                )));
            }
            if !plan.excludes(stage) {
                warn!(stage, "Ignoring mock for a stage that runs");
                continue;
            }

            let outputs = plan.mocks.entry(stage.to_string()).or_default();
            match (key, value) {
                (Some(key), value) => {
                    outputs.insert(key.to_string(), value.clone());
                }
                (None, Value::Object(map)) => {
                    outputs.extend(map.clone());
                }
                (None, _) => {
                    return Err(Error::config(format!(
                        "Mock for stage '{}' must be an object of outputs",
                        stage
                    )));
                }
            }
        }

        if !options.force_required {
            for stage in pipeline.execution_stages() {
                if plan.excludes(&stage.stage) || !stage.required {
                    continue;
                }
                if upstream_stages(stage).iter().any(|s| plan.excludes(s)) {
                    plan.downgraded.insert(stage.stage.clone());
                }
            }
        }

        Ok(plan)
    }

    pub async fn run_isolated(
        &self,
        pipeline: &PromptsPipeline,
        inputs: OutputMap,
        options: &IsolationOptions,
        cancel: CancellationToken,
    ) -> Result<PipelineResult> {
        let plan = self.plan(pipeline, options)?;
        info!(
            selected = ?options.stages,
            mocks = plan.mocks.len(),
            downgraded = plan.downgraded.len(),
            "Running isolated pipeline"
        );
        self.executor
            .execute(
                RunRequest::new(pipeline, inputs)
                    .with_cancel(cancel)
                    .with_isolation(plan),
            )
            .await
    }

    pub async fn run_command_isolated(
        &self,
        command: &CommandDefinition,
        inputs: OutputMap,
        options: &IsolationOptions,
        cancel: CancellationToken,
    ) -> Result<PipelineResult> {
        let plan = self.plan(&command.prompts, options)?;
        self.executor
            .execute(
                RunRequest::for_command(command, inputs)
                    .with_cancel(cancel)
                    .with_isolation(plan),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CompletionOptions, CompletionProvider, CompletionResult};
    use crate::pipeline::prompt::InlinePromptLoader;
    use crate::pipeline::stage::StageExecutor;
    use crate::pipeline::types::PipelineStage;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    /// Echoes the prompt; fails for prompts starting with "Fail"
    struct EchoProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CompletionProvider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        async fn complete(&self, options: CompletionOptions) -> Result<CompletionResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if options.prompt.starts_with("Fail") {
                return Err(Error::Provider("refused".into()));
            }
            Ok(CompletionResult::text(options.prompt))
        }
    }

    fn setup() -> (Arc<EchoProvider>, CommandIsolationExecutor) {
        let provider = Arc::new(EchoProvider {
            calls: AtomicUsize::new(0),
        });
        let stages = StageExecutor::new(provider.clone(), Arc::new(InlinePromptLoader));
        let executor = Arc::new(PipelineExecutor::new(stages));
        (provider, CommandIsolationExecutor::new(executor))
    }

    fn pipeline() -> PromptsPipeline {
        PromptsPipeline::new(vec![
            PipelineStage::new("fetch", "Fetch {{url}}")
                .with_input("url", "input.url")
                .with_outputs(&["page"]),
            PipelineStage::new("summarize", "Summarize <{{page}}>").with_input("page", "fetch.page"),
            PipelineStage::new("fail", "Fail after {{summary}}")
                .with_input("summary", "summarize.response"),
        ])
    }

    #[tokio::test]
    async fn test_mocked_upstream() {
        let (provider, isolation) = setup();
        let options = IsolationOptions::only(&["summarize"]).with_mock("fetch.page", json!("cached page"));

        let result = assert_ok!(
            isolation
                .run_isolated(&pipeline(), OutputMap::new(), &options, CancellationToken::new())
                .await
        );

        assert!(result.success);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        let fetch = result.stage("fetch").unwrap();
        assert!(fetch.metadata.as_ref().unwrap().mocked);
        assert_eq!(
            result.stage("summarize").unwrap().outputs["response"],
            json!("Summarize <cached page>")
        );
        assert!(result.stage("fail").unwrap().is_skipped());
    }

    #[tokio::test]
    async fn test_unmocked_upstream_is_null_and_downgraded() {
        let (_, isolation) = setup();
        let options = IsolationOptions::only(&["summarize", "fail"]);

        let plan = isolation.plan(&pipeline(), &options).unwrap();
        assert!(plan.downgraded.contains("summarize"));
        assert!(!plan.downgraded.contains("fail"));

        let result = isolation
            .run_isolated(&pipeline(), OutputMap::new(), &options, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            result.stage("summarize").unwrap().outputs["response"],
            json!("Summarize <>")
        );
        // `fail` reads from a stage that ran, so it stays required
        assert!(!result.success);
        assert_eq!(result.aborted.unwrap().stage, "fail");
    }

    #[tokio::test]
    async fn test_downgrade_lets_failing_stage_pass() {
        let (_, isolation) = setup();
        let options = IsolationOptions::only(&["fail"]);

        let result = isolation
            .run_isolated(&pipeline(), OutputMap::new(), &options, CancellationToken::new())
            .await
            .unwrap();
        assert!(result.success);
        assert!(!result.stage("fail").unwrap().success);

        let forced = IsolationOptions {
            force_required: true,
            ..options
        };
        let result = isolation
            .run_isolated(&pipeline(), OutputMap::new(), &forced, CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_whole_stage_mock_and_validation_skip() {
        let (_, isolation) = setup();
        let broken = PromptsPipeline::new(vec![
            PipelineStage::new("fetch", "Fetch").with_outputs(&["page"]),
            // Reads a key fetch never declares
            PipelineStage::new("summarize", "Summarize <{{title}}>").with_input("title", "fetch.title"),
        ]);

        let options = IsolationOptions::only(&["summarize"])
            .with_mock("fetch", json!({"page": "p", "title": "T"}));
        assert_err!(
            isolation
                .run_isolated(&broken, OutputMap::new(), &options, CancellationToken::new())
                .await
        );

        let options = IsolationOptions {
            skip_validation: true,
            ..options
        };
        let result = isolation
            .run_isolated(&broken, OutputMap::new(), &options, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            result.stage("summarize").unwrap().outputs["response"],
            json!("Summarize <T>")
        );
    }

    #[test]
    fn test_plan_errors() {
        let (_, isolation) = setup();
        let pipeline = pipeline();

        assert!(matches!(
            isolation.plan(&pipeline, &IsolationOptions::only(&["ghost"])),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            isolation.plan(
                &pipeline,
                &IsolationOptions::only(&["summarize"]).with_mock("ghost.page", json!(1))
            ),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            isolation.plan(
                &pipeline,
                &IsolationOptions::only(&["summarize"]).with_mock("fetch", json!("flat"))
            ),
            Err(Error::Configuration(_))
        ));

        // Mocks for stages that run are dropped
        let plan = isolation
            .plan(&pipeline, &IsolationOptions::default().with_mock("fetch.page", json!("x")))
            .unwrap();
        assert!(plan.mocks.is_empty());
        assert!(plan.downgraded.is_empty());
    }
}
