//! Static pipeline checks and scheduling groups

use std::collections::{BTreeSet, HashMap, HashSet};

use super::condition::Condition;
use super::reference::{INPUT_NAMESPACE, InputReference};
use super::stage::RESPONSE_KEY;
use super::types::{MergeStrategy, PipelineStage, PromptsPipeline};
use crate::{Error, Result};

/// Split the execution order into scheduling groups.
///
/// Under the parallel merge strategy consecutive `parallel` stages share a
/// group; every other stage runs alone.
pub fn execution_groups(pipeline: &PromptsPipeline) -> Vec<Vec<&PipelineStage>> {
    let mut groups: Vec<Vec<&PipelineStage>> = Vec::new();
    let grouping = pipeline.merge_strategy == MergeStrategy::Parallel;

    for stage in pipeline.execution_stages() {
        match groups.last_mut() {
            Some(group) if grouping && stage.parallel && group.iter().all(|s| s.parallel) => {
                group.push(stage)
            }
            _ => groups.push(vec![stage]),
        }
    }
    groups
}

/// Stages a stage reads from, through its inputs or its condition
pub fn upstream_stages(stage: &PipelineStage) -> BTreeSet<String> {
    let mut sources = BTreeSet::new();

    for raw in stage.inputs.values() {
        if let Ok(reference) = InputReference::parse(raw) {
            if !reference.is_initial_input() {
                sources.insert(reference.source);
            }
        }
    }

    if let Some(condition) = stage.conditional.as_deref().and_then(|c| Condition::parse(c).ok()) {
        for identifier in condition.identifiers() {
            if let Some((head, _)) = identifier.split_once('.') {
                if head != INPUT_NAMESPACE && !stage.inputs.contains_key(head) {
                    sources.insert(head.to_string());
                }
            }
        }
    }

    sources
}

/// Reject definitions that cannot run: duplicate ids, a missing rollback
/// stage, references to unknown, later or sibling-parallel stages, keys a
/// source never declares, and malformed conditions
pub fn validate_pipeline(pipeline: &PromptsPipeline) -> Result<()> {
    let mut seen = HashSet::new();
    for stage in &pipeline.stages {
        if stage.stage.trim().is_empty() {
            return Err(Error::config("Stage id must not be empty"));
        }
        if stage.stage == INPUT_NAMESPACE {
            return Err(Error::config(format!(
                "Stage id '{}' is reserved for initial inputs",
                INPUT_NAMESPACE
            )));
        }
        if !seen.insert(stage.stage.as_str()) {
            return Err(Error::config(format!("Duplicate stage id '{}'", stage.stage)));
        }
        if stage.timeout_ms == Some(0) {
            return Err(Error::config(format!(
                "Stage '{}' has a zero timeout",
                stage.stage
            )));
        }
    }

    if let Some(policy) = &pipeline.retry_policy {
        if policy.max_attempts == 0 {
            return Err(Error::config("retry_policy.max_attempts must be at least 1"));
        }
    }

    let rollback = match pipeline.rollback_on_failure.as_deref() {
        Some(id) => Some(pipeline.stage(id).ok_or_else(|| {
            Error::config(format!("Rollback stage '{}' is not defined", id))
        })?),
        None => None,
    };

    // Position and scheduling group of every execution stage
    let mut position: HashMap<&str, (usize, usize)> = HashMap::new();
    for (group_index, group) in execution_groups(pipeline).into_iter().enumerate() {
        for stage in group {
            position.insert(stage.stage.as_str(), (position.len(), group_index));
        }
    }

    for stage in pipeline.execution_stages() {
        let here = position[stage.stage.as_str()];
        check_stage(pipeline, stage, &position, Some(here))?;
    }

    if let Some(stage) = rollback {
        check_stage(pipeline, stage, &position, None)?;
    }

    Ok(())
}

/// `here` is the stage's (position, group); `None` for the rollback stage,
/// which may read from any execution stage
fn check_stage(
    pipeline: &PromptsPipeline,
    stage: &PipelineStage,
    position: &HashMap<&str, (usize, usize)>,
    here: Option<(usize, usize)>,
) -> Result<()> {
    let check_source = |source: &str, what: &str| -> Result<()> {
        let Some(&(index, group)) = position.get(source) else {
            let reason = if pipeline.rollback_on_failure.as_deref() == Some(source) {
                "the rollback stage"
            } else {
                "an unknown stage"
            };
            return Err(Error::config(format!(
                "Stage '{}' {} refers to {} '{}'",
                stage.stage, what, reason, source
            )));
        };

        if let Some((own_index, own_group)) = here {
            if index >= own_index {
                return Err(Error::config(format!(
                    "Stage '{}' {} refers to '{}', which does not run before it",
                    stage.stage, what, source
                )));
            }
            if group == own_group {
                return Err(Error::config(format!(
                    "Stage '{}' {} refers to '{}' in the same parallel group",
                    stage.stage, what, source
                )));
            }
        }
        Ok(())
    };

    for (name, raw) in &stage.inputs {
        let reference = InputReference::parse(raw)?;
        if reference.is_initial_input() {
            continue;
        }

        check_source(&reference.source, format!("input '{}'", name).as_str())?;

        if let Some(source) = pipeline.stage(&reference.source) {
            let declared = if source.outputs.is_empty() {
                reference.key == RESPONSE_KEY
            } else {
                source.outputs.contains(&reference.key)
            };
            if !declared {
                return Err(Error::config(format!(
                    "Stage '{}' input '{}' reads '{}', which stage '{}' does not declare",
                    stage.stage, name, reference.key, source.stage
                )));
            }
        }
    }

    if let Some(expression) = stage.conditional.as_deref() {
        let condition = Condition::parse(expression)?;
        for identifier in condition.identifiers() {
            let head = identifier.split('.').next().unwrap_or_default();
            if head == INPUT_NAMESPACE || stage.inputs.contains_key(head) {
                continue;
            }
            if !identifier.contains('.') {
                return Err(Error::config(format!(
                    "Stage '{}' condition uses unknown identifier '{}'",
                    stage.stage, identifier
                )));
            }
            check_source(head, "condition")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::RetryPolicy;

    fn stage(id: &str) -> PipelineStage {
        PipelineStage::new(id, format!("Run {}", id)).with_outputs(&["result"])
    }

    fn expect_config_error(pipeline: &PromptsPipeline, needle: &str) {
        match validate_pipeline(pipeline) {
            Err(Error::Configuration(message)) => {
                assert!(message.contains(needle), "unexpected message: {}", message)
            }
            other => panic!("expected configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_pipeline() {
        let pipeline = PromptsPipeline::new(vec![
            stage("plan").with_input("goal", "input.goal"),
            stage("build")
                .with_input("plan", "plan.result")
                .with_condition("plan.result != null && goal_ok"),
            stage("undo").with_input("plan", "plan.result"),
        ])
        .with_rollback("undo");

        // `goal_ok` is not an input of build
        expect_config_error(&pipeline, "unknown identifier 'goal_ok'");

        let mut fixed = pipeline.clone();
        fixed.stages[1].conditional = Some("plan.result != null".into());
        assert!(validate_pipeline(&fixed).is_ok());
    }

    #[test]
    fn test_duplicate_and_reserved_ids() {
        expect_config_error(
            &PromptsPipeline::new(vec![stage("a"), stage("a")]),
            "Duplicate stage id 'a'",
        );
        expect_config_error(&PromptsPipeline::new(vec![stage("input")]), "reserved");
    }

    #[test]
    fn test_missing_rollback() {
        expect_config_error(
            &PromptsPipeline::new(vec![stage("a")]).with_rollback("undo"),
            "Rollback stage 'undo' is not defined",
        );
    }

    #[test]
    fn test_reference_checks() {
        expect_config_error(
            &PromptsPipeline::new(vec![stage("a").with_input("x", "ghost.result")]),
            "unknown stage 'ghost'",
        );
        expect_config_error(
            &PromptsPipeline::new(vec![stage("a").with_input("x", "b.result"), stage("b")]),
            "does not run before it",
        );
        expect_config_error(
            &PromptsPipeline::new(vec![stage("a"), stage("b").with_input("x", "a.missing")]),
            "does not declare",
        );
        expect_config_error(
            &PromptsPipeline::new(vec![stage("a"), stage("undo"), stage("b").with_input("x", "undo.result")])
                .with_rollback("undo"),
            "the rollback stage",
        );
    }

    #[test]
    fn test_response_key_for_undeclared_outputs() {
        let pipeline = PromptsPipeline::new(vec![
            PipelineStage::new("chat", "Say hello"),
            stage("b").with_input("x", "chat.response"),
        ]);
        assert!(validate_pipeline(&pipeline).is_ok());
    }

    #[test]
    fn test_parallel_siblings_cannot_reference_each_other() {
        let pipeline = PromptsPipeline::new(vec![
            stage("a").in_parallel(),
            stage("b").in_parallel().with_input("x", "a.result"),
        ])
        .with_merge_strategy(MergeStrategy::Parallel);
        expect_config_error(&pipeline, "same parallel group");

        // Without the parallel strategy the flags are ignored
        let sequential = PromptsPipeline::new(pipeline.stages.clone());
        assert!(validate_pipeline(&sequential).is_ok());
    }

    #[test]
    fn test_bad_condition_and_policy() {
        expect_config_error(
            &PromptsPipeline::new(vec![stage("a").with_condition("== 3")]),
            "",
        );
        expect_config_error(
            &PromptsPipeline::new(vec![stage("a")]).with_retry_policy(RetryPolicy::new(0)),
            "max_attempts",
        );
    }

    #[test]
    fn test_execution_groups() {
        let pipeline = PromptsPipeline::new(vec![
            stage("a"),
            stage("b").in_parallel(),
            stage("c").in_parallel(),
            stage("d"),
            stage("e").in_parallel(),
        ])
        .with_merge_strategy(MergeStrategy::Parallel);

        let ids: Vec<Vec<&str>> = execution_groups(&pipeline)
            .iter()
            .map(|g| g.iter().map(|s| s.stage.as_str()).collect())
            .collect();
        assert_eq!(ids, vec![vec!["a"], vec!["b", "c"], vec!["d"], vec!["e"]]);
    }

    #[test]
    fn test_upstream_stages() {
        let s = stage("deploy")
            .with_input("plan", "plan.result")
            .with_input("goal", "input.goal")
            .with_condition("review.approved && plan.ok");
        let upstream: Vec<String> = upstream_stages(&s).into_iter().collect();
        assert_eq!(upstream, vec!["plan".to_string(), "review".to_string()]);
    }
}
