//! Request-level entry point: launch, reexecute, terminate, and inspect runs.
//!
//! Every plan-time error (unknown step, cycle, missing intermediate, unknown
//! parent) is returned before a run record is created.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use lineage_types::{
    LineageError, Result, Run, RunId, RunStats, StepKey, StepState, OWNER_PID_TAG,
    RESUME_RETRY_TAG,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::compute::ComputeRegistry;
use crate::definition::PipelineDefinition;
use crate::events::{EventLogStore, EventSubscription};
use crate::launcher::Launcher;
use crate::monitor::RunMonitor;
use crate::plan::ExecutionPlan;
use crate::reexecution::{
    plan_reexecution, verify_reuse, EffectivePlan, LineageHistory, ReexecutionMode,
};
use crate::step_state::resolve_step_states;
use crate::store::{IntermediateStore, RunStore};

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

fn default_mode() -> String {
    "default".into()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    #[serde(default)]
    pub run_id: Option<RunId>,
    /// Informational; the root is always derived from the parent.
    #[serde(default)]
    pub root_run_id: Option<RunId>,
    #[serde(default)]
    pub parent_run_id: Option<RunId>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub pipeline: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub run_config: Value,
    /// `None` means all steps (or resume-from-failure for a tagged reexecution).
    #[serde(default)]
    pub step_keys: Option<Vec<StepKey>>,
    #[serde(default)]
    pub metadata: ExecutionMetadata,
}

impl LaunchRequest {
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            mode: default_mode(),
            run_config: Value::Null,
            step_keys: None,
            metadata: ExecutionMetadata::default(),
        }
    }

    pub fn with_run_config(mut self, run_config: Value) -> Self {
        self.run_config = run_config;
        self
    }

    pub fn with_step_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepKey>,
    {
        self.step_keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<RunId>) -> Self {
        self.metadata.run_id = Some(run_id.into());
        self
    }

    pub fn with_parent(mut self, parent_run_id: impl Into<RunId>) -> Self {
        self.metadata.parent_run_id = Some(parent_run_id.into());
        self
    }

    pub fn with_root(mut self, root_run_id: impl Into<RunId>) -> Self {
        self.metadata.root_run_id = Some(root_run_id.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.tags.insert(key.into(), value.into());
        self
    }

    /// Select resume-from-failure when no step keys are given.
    pub fn resume(self) -> Self {
        self.with_tag(RESUME_RETRY_TAG, "true")
    }

    fn is_resume(&self) -> bool {
        self.metadata.tags.get(RESUME_RETRY_TAG).map(String::as_str) == Some("true")
    }
}

/// Typed launch result: `{"ok": run_id}` or `{"error": kind, "message": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LaunchResponse {
    Ok { ok: RunId },
    Error { error: String, message: String },
}

impl From<Result<RunId>> for LaunchResponse {
    fn from(result: Result<RunId>) -> Self {
        match result {
            Ok(run_id) => LaunchResponse::Ok { ok: run_id },
            Err(e) => LaunchResponse::Error {
                error: e.kind().to_string(),
                message: e.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReexecutionInfo {
    pub step_keys_to_execute: Option<Vec<StepKey>>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    pipelines: HashMap<String, Arc<PipelineDefinition>>,
    registry: Arc<ComputeRegistry>,
    runs: Arc<dyn RunStore>,
    event_log: Arc<dyn EventLogStore>,
    intermediates: Arc<dyn IntermediateStore>,
    launcher: Arc<dyn Launcher>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ComputeRegistry>,
        runs: Arc<dyn RunStore>,
        event_log: Arc<dyn EventLogStore>,
        intermediates: Arc<dyn IntermediateStore>,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        Self {
            pipelines: HashMap::new(),
            registry,
            runs,
            event_log,
            intermediates,
            launcher,
        }
    }

    pub fn register_pipeline(&mut self, pipeline: PipelineDefinition) -> Arc<PipelineDefinition> {
        let pipeline = Arc::new(pipeline);
        self.pipelines
            .insert(pipeline.name().to_string(), pipeline.clone());
        pipeline
    }

    pub fn pipeline(&self, name: &str) -> Result<Arc<PipelineDefinition>> {
        self.pipelines
            .get(name)
            .cloned()
            .ok_or_else(|| LineageError::PipelineNotFound(name.to_string()))
    }

    pub fn runs(&self) -> &Arc<dyn RunStore> {
        &self.runs
    }

    pub fn event_log(&self) -> &Arc<dyn EventLogStore> {
        &self.event_log
    }

    pub fn intermediates(&self) -> &Arc<dyn IntermediateStore> {
        &self.intermediates
    }

    pub fn monitor(&self) -> RunMonitor {
        RunMonitor::new(
            self.runs.clone(),
            self.event_log.clone(),
            self.launcher.clone(),
        )
    }

    /// Compute the effective plan a request would execute, without creating
    /// a run. Fails with the same plan-time errors `launch` returns.
    pub async fn plan(&self, request: &LaunchRequest) -> Result<(EffectivePlan, Option<Run>)> {
        let pipeline = self.pipeline(&request.pipeline)?;
        let full = ExecutionPlan::full(pipeline.clone())?;

        let (lineage, parent) = match &request.metadata.parent_run_id {
            Some(parent_id) => {
                let parent = self
                    .runs
                    .get_run(parent_id)
                    .await?
                    .ok_or_else(|| LineageError::RunNotFound(parent_id.clone()))?;
                if parent.pipeline_name != pipeline.name() {
                    return Err(LineageError::InvalidRequest(format!(
                        "parent run {} belongs to pipeline '{}', not '{}'",
                        parent.run_id,
                        parent.pipeline_name,
                        pipeline.name()
                    )));
                }
                let lineage =
                    LineageHistory::load(parent_id, self.runs.as_ref(), self.event_log.as_ref())
                        .await?;
                (lineage, Some(parent))
            }
            None => (LineageHistory::empty(), None),
        };

        let mode = match (&request.step_keys, &parent) {
            (Some(keys), _) => ReexecutionMode::Explicit(keys.clone()),
            (None, Some(_)) if request.is_resume() => ReexecutionMode::ResumeFromFailure,
            (None, _) => ReexecutionMode::Full,
        };
        let plan = plan_reexecution(&full, &lineage, &mode)?;
        verify_reuse(&plan, self.intermediates.as_ref()).await?;
        for key in plan.execute_keys() {
            if let Some(step) = pipeline.step(key) {
                self.registry.resolve(step)?;
            }
        }
        Ok((plan, parent))
    }

    /// Launch a run (a reexecution when `metadata.parent_run_id` is set).
    pub async fn launch(&self, request: LaunchRequest) -> Result<RunId> {
        let (plan, parent) = self.plan(&request).await?;

        let mut run = Run::new(&request.pipeline)
            .with_mode(&request.mode)
            .with_run_config(request.run_config.clone());
        for (key, value) in &request.metadata.tags {
            run = run.with_tag(key, value);
        }
        run = run.with_tag(OWNER_PID_TAG, std::process::id().to_string());
        if let Some(parent) = &parent {
            run = run.with_parent(parent);
            if let Some(root) = &request.metadata.root_run_id {
                if root != &parent.root_run_id {
                    tracing::warn!(
                        requested_root = %root,
                        root_run_id = %parent.root_run_id,
                        "Ignoring root run id that does not match the parent's lineage"
                    );
                }
            }
        }
        if let Some(run_id) = &request.metadata.run_id {
            run = run.with_run_id(run_id);
        }
        run.requested_step_keys = request.step_keys.clone();
        if parent.is_some() || request.step_keys.is_some() {
            run.step_keys_to_execute = Some(plan.execute_keys().to_vec());
        }

        let run_id = self.runs.create_run(run.clone()).await?;
        tracing::info!(
            run_id = %run_id,
            root_run_id = %run.root_run_id,
            parent_run_id = ?run.parent_run_id,
            execute = ?plan.execute_keys(),
            "Run created"
        );
        self.launcher.launch(run, plan).await?;
        Ok(run_id)
    }

    /// Launch a reexecution. Requires `metadata.parent_run_id`.
    pub async fn reexecute(&self, request: LaunchRequest) -> Result<RunId> {
        if request.metadata.parent_run_id.is_none() {
            return Err(LineageError::InvalidRequest(
                "reexecution requires a parent run id".into(),
            ));
        }
        self.launch(request).await
    }

    /// `launch` with the result folded into the typed response.
    pub async fn handle_launch(&self, request: LaunchRequest) -> LaunchResponse {
        self.launch(request).await.into()
    }

    pub async fn reexecution_info(&self, run_id: &str) -> Result<ReexecutionInfo> {
        let run = self.get_run(run_id).await?;
        Ok(ReexecutionInfo {
            step_keys_to_execute: run.step_keys_to_execute,
        })
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Run> {
        self.runs
            .get_run(run_id)
            .await?
            .ok_or_else(|| LineageError::RunNotFound(run_id.to_string()))
    }

    /// Every run sharing `run_id`'s root, in creation order.
    pub async fn run_group(&self, run_id: &str) -> Result<Vec<Run>> {
        let run = self.get_run(run_id).await?;
        self.runs.get_runs_by_root_id(&run.root_run_id).await
    }

    pub async fn run_stats(&self, run_id: &str) -> Result<RunStats> {
        self.get_run(run_id).await?;
        Ok(RunStats::from_events(
            &self.event_log.get_events(run_id).await?,
        ))
    }

    /// State of every step in the run's plan, replayed from its log.
    pub async fn step_states(&self, run_id: &str) -> Result<HashMap<StepKey, StepState>> {
        let run = self.get_run(run_id).await?;
        let keys = match run.step_keys_to_execute {
            Some(keys) => keys,
            None => ExecutionPlan::full(self.pipeline(&run.pipeline_name)?)?
                .step_keys()
                .to_vec(),
        };
        let events = self.event_log.get_events(run_id).await?;
        Ok(resolve_step_states(&keys, &events))
    }

    pub async fn subscribe(&self, run_id: &str) -> Result<EventSubscription> {
        self.event_log.subscribe(run_id).await
    }

    /// Wait until the run records a terminal event and return its final record.
    pub async fn wait_for_run(&self, run_id: &str) -> Result<Run> {
        self.subscribe(run_id).await?.collect().await;
        self.get_run(run_id).await
    }

    pub async fn terminate(&self, run_id: &str) -> Result<bool> {
        self.get_run(run_id).await?;
        self.launcher.terminate(run_id).await
    }
}
