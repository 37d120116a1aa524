//! Step compute trait, registry, and built-in step kinds.
//!
//! The coordinator treats every step the same way: it hands the compute
//! logic a [`StepContext`] and the step's resolved [`StepInputs`] and expects
//! [`StepOutputs`] back (or an error). Nothing else about a step is inspected.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use lineage_types::{Intermediate, LineageError, Result, RunId, StepKey};
use serde_json::Value;
use tokio::sync::watch;

use crate::definition::StepDefinition;

// ---------------------------------------------------------------------------
// Context, inputs, outputs
// ---------------------------------------------------------------------------

/// Per-step execution context. Carries the run's identity and config
/// explicitly instead of any ambient "current run" state.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: RunId,
    pub root_run_id: RunId,
    pub step_key: StepKey,
    pub params: Value,
    pub run_config: Arc<Value>,
    cancel: watch::Receiver<bool>,
}

impl StepContext {
    pub fn new(
        run_id: impl Into<RunId>,
        root_run_id: impl Into<RunId>,
        step: &StepDefinition,
        run_config: Arc<Value>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            root_run_id: root_run_id.into(),
            step_key: step.key.clone(),
            params: step.params.clone(),
            run_config,
            cancel,
        }
    }

    /// Context detached from any run, for exercising compute logic directly.
    pub fn detached(step: &StepDefinition, run_config: Value) -> Self {
        let (_tx, cancel) = watch::channel(false);
        Self::new("detached", "detached", step, Arc::new(run_config), cancel)
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Look up a run-config value by dotted path (`"flags.fail_2"`).
    pub fn config(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(self.run_config.as_ref(), |value, segment| value.get(segment))
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once termination of the run has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // The run can no longer be cancelled.
                std::future::pending::<()>().await;
            }
        }
    }

    pub fn fail(&self, message: impl Into<String>) -> LineageError {
        LineageError::step_failed(self.step_key.clone(), message)
    }
}

/// Resolved inputs, keyed by input name. `None` marks an absent optional input.
#[derive(Debug, Clone, Default)]
pub struct StepInputs {
    values: BTreeMap<String, Option<Intermediate>>,
}

impl StepInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Option<Intermediate>) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Intermediate> {
        self.values.get(name).and_then(Option::as_ref)
    }

    pub fn get_json(&self, name: &str) -> Result<Option<Value>> {
        self.get(name).map(Intermediate::to_json).transpose()
    }

    pub fn is_present(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Input names in order, with presence.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&Intermediate>)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Outputs produced by one compute invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutputs {
    values: BTreeMap<String, Intermediate>,
}

impl StepOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, name: impl Into<String>, value: Intermediate) {
        self.values.insert(name.into(), value);
    }

    pub fn put_json(&mut self, name: impl Into<String>, value: &Value) -> Result<()> {
        self.put(name, Intermediate::json(value)?);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Intermediate> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl IntoIterator for StepOutputs {
    type Item = (String, Intermediate);
    type IntoIter = std::collections::btree_map::IntoIter<String, Intermediate>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

// ---------------------------------------------------------------------------
// StepCompute trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait StepCompute: Send + Sync {
    /// The step kind this compute implements (e.g. "value", "collect").
    fn kind(&self) -> &str;

    async fn compute(&self, ctx: &StepContext, inputs: &StepInputs) -> Result<StepOutputs>;
}

// ---------------------------------------------------------------------------
// ComputeRegistry
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct ComputeRegistry {
    computes: HashMap<String, Arc<dyn StepCompute>>,
}

impl ComputeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, compute: impl StepCompute + 'static) {
        let kind = compute.kind().to_string();
        self.computes.insert(kind, Arc::new(compute));
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn StepCompute>> {
        self.computes.get(kind).cloned()
    }

    pub fn has(&self, kind: &str) -> bool {
        self.computes.contains_key(kind)
    }

    /// The compute for `step`'s kind, or `UnknownStepKind`.
    pub fn resolve(&self, step: &StepDefinition) -> Result<Arc<dyn StepCompute>> {
        self.get(&step.kind)
            .ok_or_else(|| LineageError::UnknownStepKind {
                kind: step.kind.clone(),
                step_key: step.key.clone(),
            })
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.computes.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl std::fmt::Debug for ComputeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Built-in kinds
// ---------------------------------------------------------------------------

/// Object of every present input, decoded as JSON.
fn gather(inputs: &StepInputs) -> Result<Value> {
    let mut gathered = serde_json::Map::new();
    for (name, value) in inputs.iter() {
        if let Some(value) = value {
            gathered.insert(name.to_string(), value.to_json()?);
        }
    }
    Ok(Value::Object(gathered))
}

/// Emits its `value` param on the `result` output.
pub struct ValueCompute;

#[async_trait]
impl StepCompute for ValueCompute {
    fn kind(&self) -> &str {
        "value"
    }

    async fn compute(&self, ctx: &StepContext, _inputs: &StepInputs) -> Result<StepOutputs> {
        let value = ctx.param("value").cloned().unwrap_or(Value::Null);
        let mut outputs = StepOutputs::new();
        outputs.put_json(crate::definition::DEFAULT_OUTPUT, &value)?;
        Ok(outputs)
    }
}

/// Gathers every present input into one object on `result`.
pub struct CollectCompute;

#[async_trait]
impl StepCompute for CollectCompute {
    fn kind(&self) -> &str {
        "collect"
    }

    async fn compute(&self, _ctx: &StepContext, inputs: &StepInputs) -> Result<StepOutputs> {
        let mut outputs = StepOutputs::new();
        outputs.put_json(crate::definition::DEFAULT_OUTPUT, &gather(inputs)?)?;
        Ok(outputs)
    }
}

/// Fails unless the run-config path named by its `flag` param is `true`;
/// otherwise behaves like `collect`. A `retryable: true` param marks the
/// failure as transient.
pub struct FailUnlessCompute;

#[async_trait]
impl StepCompute for FailUnlessCompute {
    fn kind(&self) -> &str {
        "fail_unless"
    }

    async fn compute(&self, ctx: &StepContext, inputs: &StepInputs) -> Result<StepOutputs> {
        let flag = ctx
            .param("flag")
            .and_then(Value::as_str)
            .ok_or_else(|| ctx.fail("fail_unless requires a string 'flag' param"))?;
        if ctx.config(flag).and_then(Value::as_bool) != Some(true) {
            return Err(LineageError::StepFailed {
                step_key: ctx.step_key.clone(),
                message: format!("run config flag '{flag}' is not set"),
                retryable: ctx.param("retryable").and_then(Value::as_bool) == Some(true),
            });
        }
        let mut outputs = StepOutputs::new();
        outputs.put_json(crate::definition::DEFAULT_OUTPUT, &gather(inputs)?)?;
        Ok(outputs)
    }
}

/// Produces only the output named by the run-config path in its `select`
/// param (falling back to its `default` param). Other outputs are left
/// unproduced, so their consumers are skipped.
pub struct BranchCompute;

#[async_trait]
impl StepCompute for BranchCompute {
    fn kind(&self) -> &str {
        "branch"
    }

    async fn compute(&self, ctx: &StepContext, inputs: &StepInputs) -> Result<StepOutputs> {
        let chosen = ctx
            .param("select")
            .and_then(Value::as_str)
            .and_then(|path| ctx.config(path))
            .or_else(|| ctx.param("default"))
            .and_then(Value::as_str)
            .ok_or_else(|| ctx.fail("branch could not determine which output to produce"))?
            .to_string();
        let value = match ctx.param("value") {
            Some(value) => value.clone(),
            None => gather(inputs)?,
        };
        let mut outputs = StepOutputs::new();
        outputs.put_json(chosen, &value)?;
        Ok(outputs)
    }
}

/// Registry with every built-in kind.
pub fn default_registry() -> ComputeRegistry {
    let mut reg = ComputeRegistry::new();
    reg.register(ValueCompute);
    reg.register(CollectCompute);
    reg.register(FailUnlessCompute);
    reg.register(BranchCompute);
    reg
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn json_input(value: Value) -> Option<Intermediate> {
        Some(Intermediate::json(&value).unwrap())
    }

    #[test]
    fn default_registry_has_builtins() {
        let reg = default_registry();
        assert_eq!(reg.kinds(), vec!["branch", "collect", "fail_unless", "value"]);
        assert!(!reg.has("nonexistent"));
    }

    #[test]
    fn resolve_unknown_kind_names_step() {
        let reg = default_registry();
        let step = StepDefinition::new("s", "mystery");
        match reg.resolve(&step) {
            Err(LineageError::UnknownStepKind { kind, step_key }) => {
                assert_eq!(kind, "mystery");
                assert_eq!(step_key, "s");
            }
            other => panic!("Expected UnknownStepKind, got: {:?}", other.map(|c| c.kind().to_string())),
        }
    }

    #[tokio::test]
    async fn value_emits_param() {
        let step = StepDefinition::new("v", "value").param("value", json!(42));
        let ctx = StepContext::detached(&step, Value::Null);
        let outputs = ValueCompute.compute(&ctx, &StepInputs::new()).await.unwrap();
        assert_eq!(outputs.get("result").unwrap().to_json().unwrap(), json!(42));
    }

    #[tokio::test]
    async fn collect_skips_absent_inputs() {
        let step = StepDefinition::new("c", "collect");
        let ctx = StepContext::detached(&step, Value::Null);
        let mut inputs = StepInputs::new();
        inputs.insert("a", json_input(json!(1)));
        inputs.insert("b", None);

        let outputs = CollectCompute.compute(&ctx, &inputs).await.unwrap();
        assert_eq!(
            outputs.get("result").unwrap().to_json().unwrap(),
            json!({"a": 1})
        );
        assert!(!inputs.is_present("b"));
    }

    #[tokio::test]
    async fn fail_unless_reads_nested_flag() {
        let step = StepDefinition::new("f", "fail_unless").param("flag", json!("flags.f"));

        let ctx = StepContext::detached(&step, json!({"flags": {"f": false}}));
        let err = FailUnlessCompute
            .compute(&ctx, &StepInputs::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LineageError::StepFailed { retryable: false, .. }));

        let ctx = StepContext::detached(&step, json!({"flags": {"f": true}}));
        assert!(FailUnlessCompute
            .compute(&ctx, &StepInputs::new())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn fail_unless_can_be_retryable() {
        let step = StepDefinition::new("f", "fail_unless")
            .param("flag", json!("go"))
            .param("retryable", json!(true));
        let ctx = StepContext::detached(&step, Value::Null);
        let err = FailUnlessCompute
            .compute(&ctx, &StepInputs::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn branch_produces_only_selected_output() {
        let step = StepDefinition::new("b", "branch")
            .param("select", json!("route"))
            .param("default", json!("left"))
            .param("value", json!("payload"));

        let ctx = StepContext::detached(&step, json!({"route": "right"}));
        let outputs = BranchCompute.compute(&ctx, &StepInputs::new()).await.unwrap();
        assert!(outputs.contains("right"));
        assert!(!outputs.contains("left"));

        let ctx = StepContext::detached(&step, Value::Null);
        let outputs = BranchCompute.compute(&ctx, &StepInputs::new()).await.unwrap();
        assert_eq!(outputs.names().collect::<Vec<_>>(), vec!["left"]);
    }

    #[tokio::test]
    async fn cancelled_resolves_after_signal() {
        let step = StepDefinition::new("s", "value");
        let (tx, rx) = watch::channel(false);
        let ctx = StepContext::new("r", "r", &step, Arc::new(Value::Null), rx);
        assert!(!ctx.is_cancelled());

        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.cancelled().await })
        };
        tx.send(true).unwrap();
        waiter.await.unwrap();
        assert!(ctx.is_cancelled());
    }
}
