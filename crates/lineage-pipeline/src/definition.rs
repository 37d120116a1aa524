//! Pipeline definitions: steps, their named inputs and outputs, and the
//! dependency edges derived from input references.

use std::collections::{HashMap, HashSet};

use lineage_types::{LineageError, Result, StepKey};
use serde::{Deserialize, Serialize};

/// Output name used when a step declares none explicitly.
pub const DEFAULT_OUTPUT: &str = "result";

fn default_output() -> String {
    DEFAULT_OUTPUT.to_string()
}

fn default_outputs() -> Vec<OutputDef> {
    vec![OutputDef::required(DEFAULT_OUTPUT)]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDef {
    pub name: String,
    /// Upstream step producing this input.
    pub step: StepKey,
    #[serde(default = "default_output")]
    pub output: String,
    /// An optional input may be absent (upstream failed, skipped, or did not
    /// produce the output) without skipping the consuming step.
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "OutputSpec")]
pub struct OutputDef {
    pub name: String,
    /// Optional outputs may legitimately go unproduced by a successful step.
    pub optional: bool,
}

impl OutputDef {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            optional: false,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            optional: true,
        }
    }
}

/// Outputs may be written as a bare name or as `{ "name", "optional" }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum OutputSpec {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        optional: bool,
    },
}

impl From<OutputSpec> for OutputDef {
    fn from(spec: OutputSpec) -> Self {
        match spec {
            OutputSpec::Name(name) => OutputDef::required(name),
            OutputSpec::Full { name, optional } => OutputDef { name, optional },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub key: StepKey,
    /// Compute kind resolved through the `ComputeRegistry`.
    pub kind: String,
    #[serde(default)]
    pub inputs: Vec<InputDef>,
    #[serde(default = "default_outputs")]
    pub outputs: Vec<OutputDef>,
    #[serde(default)]
    pub params: serde_json::Value,
    /// In-process retries for retryable compute errors.
    #[serde(default)]
    pub max_retries: usize,
}

impl StepDefinition {
    /// A step of `kind` with a single required `result` output.
    pub fn new(key: impl Into<StepKey>, kind: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: kind.into(),
            inputs: Vec::new(),
            outputs: default_outputs(),
            params: serde_json::Value::Null,
            max_retries: 0,
        }
    }

    /// Consume the `result` output of `step` as input `name`.
    pub fn input(self, name: impl Into<String>, step: impl Into<StepKey>) -> Self {
        self.input_from(name, step, DEFAULT_OUTPUT)
    }

    pub fn input_from(
        mut self,
        name: impl Into<String>,
        step: impl Into<StepKey>,
        output: impl Into<String>,
    ) -> Self {
        self.inputs.push(InputDef {
            name: name.into(),
            step: step.into(),
            output: output.into(),
            optional: false,
        });
        self
    }

    pub fn optional_input(
        mut self,
        name: impl Into<String>,
        step: impl Into<StepKey>,
        output: impl Into<String>,
    ) -> Self {
        self.inputs.push(InputDef {
            name: name.into(),
            step: step.into(),
            output: output.into(),
            optional: true,
        });
        self
    }

    /// Replace the declared outputs.
    pub fn outputs(mut self, outputs: Vec<OutputDef>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        if !self.params.is_object() {
            self.params = serde_json::Value::Object(serde_json::Map::new());
        }
        if let Some(map) = self.params.as_object_mut() {
            map.insert(key.into(), value);
        }
        self
    }

    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn output(&self, name: &str) -> Option<&OutputDef> {
        self.outputs.iter().find(|o| o.name == name)
    }

    pub fn required_outputs(&self) -> impl Iterator<Item = &OutputDef> {
        self.outputs.iter().filter(|o| !o.optional)
    }

    /// Upstream step keys, deduplicated, in input declaration order.
    pub fn dependencies(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.inputs
            .iter()
            .map(|i| i.step.as_str())
            .filter(|s| seen.insert(*s))
            .collect()
    }
}

#[derive(Deserialize)]
struct PipelineFile {
    name: String,
    steps: Vec<StepDefinition>,
}

/// A named step graph. Steps are stored in declaration order and addressed by key.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    name: String,
    steps: Vec<StepDefinition>,
    index: HashMap<StepKey, usize>,
    /// Maps a step key to its direct downstream dependents, in declaration order.
    dependents: HashMap<StepKey, Vec<StepKey>>,
}

impl PipelineDefinition {
    /// Build and validate a pipeline. Every input must reference a declared
    /// output of an existing step. Cycles are detected later, at plan time.
    pub fn new(name: impl Into<String>, steps: Vec<StepDefinition>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(LineageError::InvalidPipeline(
                "pipeline name must not be empty".into(),
            ));
        }

        let mut index = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if index.insert(step.key.clone(), i).is_some() {
                return Err(LineageError::InvalidPipeline(format!(
                    "duplicate step key '{}'",
                    step.key
                )));
            }
        }

        let mut dependents: HashMap<StepKey, Vec<StepKey>> = HashMap::new();
        for step in &steps {
            let mut output_names = HashSet::new();
            for output in &step.outputs {
                if !output_names.insert(output.name.as_str()) {
                    return Err(LineageError::InvalidPipeline(format!(
                        "step '{}' declares output '{}' twice",
                        step.key, output.name
                    )));
                }
            }

            let mut input_names = HashSet::new();
            for input in &step.inputs {
                if !input_names.insert(input.name.as_str()) {
                    return Err(LineageError::InvalidPipeline(format!(
                        "step '{}' declares input '{}' twice",
                        step.key, input.name
                    )));
                }
                let upstream = index
                    .get(&input.step)
                    .map(|&i| &steps[i])
                    .ok_or_else(|| {
                        LineageError::InvalidPipeline(format!(
                            "step '{}' input '{}' references unknown step '{}'",
                            step.key, input.name, input.step
                        ))
                    })?;
                if upstream.output(&input.output).is_none() {
                    return Err(LineageError::InvalidPipeline(format!(
                        "step '{}' input '{}' references undeclared output '{}.{}'",
                        step.key, input.name, input.step, input.output
                    )));
                }
            }

            for dep in step.dependencies() {
                dependents
                    .entry(dep.to_string())
                    .or_default()
                    .push(step.key.clone());
            }
        }

        Ok(Self {
            name,
            steps,
            index,
            dependents,
        })
    }

    /// Parse a pipeline from its JSON form:
    /// `{"name": "...", "steps": [{"key", "kind", "inputs", "outputs", "params"}]}`.
    pub fn from_json(source: &str) -> Result<Self> {
        let file: PipelineFile = serde_json::from_str(source)?;
        Self::new(file.name, file.steps)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn step(&self, key: &str) -> Option<&StepDefinition> {
        self.index.get(key).map(|&i| &self.steps[i])
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// All steps in declaration order.
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn dependencies(&self, key: &str) -> Vec<&str> {
        self.step(key).map(|s| s.dependencies()).unwrap_or_default()
    }

    pub fn dependents(&self, key: &str) -> &[StepKey] {
        self.dependents.get(key).map(Vec::as_slice).unwrap_or(&[])
    }
}
