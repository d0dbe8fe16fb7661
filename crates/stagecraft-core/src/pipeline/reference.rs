//! Input references and the output scope they resolve against
//!
//! A reference has the form `<source>.<key>[.<path>...]`, where `source` is a
//! stage id or the reserved `input` namespace for the run's initial inputs.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;

use super::types::{OutputMap, PipelineStage, StageOutput};
use crate::{Error, Result};

/// Namespace of the initial inputs
pub const INPUT_NAMESPACE: &str = "input";

/// Parsed `<source>.<key>[.<path>]` reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InputReference {
    pub source: String,
    pub key: String,
    pub path: Vec<String>,
}

impl InputReference {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.trim().split('.');
        let source = parts.next().unwrap_or_default();
        let key = parts.next().unwrap_or_default();
        let path: Vec<String> = parts.map(str::to_string).collect();

        if source.is_empty() || key.is_empty() || path.iter().any(String::is_empty) {
            return Err(Error::config(format!(
                "Invalid input reference '{}': expected <source>.<key>[.<path>]",
                raw
            )));
        }

        Ok(Self {
            source: source.to_string(),
            key: key.to_string(),
            path,
        })
    }

    pub fn is_initial_input(&self) -> bool {
        self.source == INPUT_NAMESPACE
    }

    /// Look the reference up in a source's outputs
    pub fn lookup<'a>(&self, outputs: &'a OutputMap) -> Option<&'a Value> {
        descend(outputs.get(&self.key)?, &self.path)
    }
}

impl fmt::Display for InputReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.source, self.key)?;
        for segment in &self.path {
            write!(f, ".{}", segment)?;
        }
        Ok(())
    }
}

/// Walk object keys and array indices
pub(crate) fn descend<'a>(mut value: &'a Value, path: &[String]) -> Option<&'a Value> {
    for segment in path {
        value = match value {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}

/// Outputs visible to the stage about to run
#[derive(Debug, Clone, Default)]
pub struct OutputScope {
    initial: OutputMap,
    completed: HashMap<String, OutputMap>,
    /// Sources that were skipped or failed without aborting the run
    unavailable: HashSet<String>,
    /// Most recently completed stage, for waterfall merging
    last_completed: Option<String>,
}

impl OutputScope {
    pub fn new(initial: OutputMap) -> Self {
        Self {
            initial,
            ..Default::default()
        }
    }

    pub fn initial(&self) -> &OutputMap {
        &self.initial
    }

    /// Record a finished stage
    pub fn record(&mut self, output: &StageOutput) {
        if output.success && !output.is_skipped() {
            self.unavailable.remove(&output.stage);
            self.completed
                .insert(output.stage.clone(), output.outputs.clone());
            self.last_completed = Some(output.stage.clone());
        } else {
            self.completed.remove(&output.stage);
            self.unavailable.insert(output.stage.clone());
        }
    }

    /// Mark a stage's outputs as coming from elsewhere (mocks)
    pub fn provide(&mut self, stage: impl Into<String>, outputs: OutputMap) {
        let stage = stage.into();
        self.unavailable.remove(&stage);
        self.completed.insert(stage, outputs);
    }

    pub fn mark_unavailable(&mut self, stage: impl Into<String>) {
        let stage = stage.into();
        self.completed.remove(&stage);
        self.unavailable.insert(stage);
    }

    pub fn outputs_of(&self, stage: &str) -> Option<&OutputMap> {
        self.completed.get(stage)
    }

    pub fn is_unavailable(&self, stage: &str) -> bool {
        self.unavailable.contains(stage)
    }

    pub fn has_completed(&self, stage: &str) -> bool {
        self.completed.contains_key(stage)
    }

    pub fn last_completed(&self) -> Option<(&str, &OutputMap)> {
        let stage = self.last_completed.as_deref()?;
        Some((stage, self.completed.get(stage)?))
    }

    /// Resolve a reference to a value.
    ///
    /// Unavailable sources resolve to `null`; any other miss is a
    /// configuration error.
    pub fn resolve(&self, reference: &InputReference) -> Result<Value> {
        if reference.is_initial_input() {
            return reference.lookup(&self.initial).cloned().ok_or_else(|| {
                Error::config(format!("Initial input '{}' was not provided", reference))
            });
        }

        if self.unavailable.contains(&reference.source) {
            return Ok(Value::Null);
        }

        let outputs = self.completed.get(&reference.source).ok_or_else(|| {
            Error::config(format!(
                "Reference '{}' points at stage '{}', which has not completed",
                reference, reference.source
            ))
        })?;

        reference.lookup(outputs).cloned().ok_or_else(|| {
            Error::config(format!(
                "Stage '{}' did not produce '{}'",
                reference.source, reference
            ))
        })
    }

    /// Like [`resolve`](Self::resolve), but any miss becomes `null`
    pub fn resolve_lenient(&self, reference: &InputReference) -> Value {
        let outputs = if reference.is_initial_input() {
            Some(&self.initial)
        } else {
            self.completed.get(&reference.source)
        };
        outputs
            .and_then(|o| reference.lookup(o))
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Resolve every declared input of a stage
    pub fn resolve_inputs(&self, stage: &PipelineStage) -> Result<OutputMap> {
        let mut resolved = OutputMap::new();
        for (name, raw) in &stage.inputs {
            let reference = InputReference::parse(raw)?;
            resolved.insert(name.clone(), self.resolve(&reference)?);
        }
        Ok(resolved)
    }
}
