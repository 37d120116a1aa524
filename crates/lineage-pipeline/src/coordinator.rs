//! Run coordinator: walks an effective plan in dependency order and runs
//! each ready step on a bounded worker pool.
//!
//! A step becomes ready once every upstream step it executes with has
//! reached a terminal outcome. Its inputs are then resolved: an input is
//! present only when the upstream step succeeded in this run (or was reused)
//! and produced that output. A step missing a required input is SKIPPED
//! without running; absent optional inputs are passed as `None`.
//!
//! Once termination is requested no further step is dispatched or skipped.
//! Running steps are interrupted and recorded as FAILED; undispatched steps
//! get no event at all and stay NOT_RUN.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use lineage_types::{
    Result, Run, RunId, RunStatus, StepEvent, StepEventKind, StepKey, StepState,
};
use serde_json::{json, Value};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::compute::{ComputeRegistry, StepCompute, StepContext, StepInputs, StepOutputs};
use crate::definition::StepDefinition;
use crate::events::EventLogStore;
use crate::reexecution::EffectivePlan;
use crate::retry::{execute_with_retry, BackoffPolicy};
use crate::step_state::resolve_step_states;
use crate::store::{IntermediateStore, RunStore};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Maximum number of steps running at once.
    pub max_concurrency: usize,
    pub retry_backoff: BackoffPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            retry_backoff: BackoffPolicy::default(),
        }
    }
}

/// Outcome of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub run_id: RunId,
    pub status: RunStatus,
    /// State of every step the run set out to execute.
    pub step_states: HashMap<StepKey, StepState>,
}

/// Owns the stores and compute registry and drives runs to completion.
#[derive(Clone)]
pub struct RunCoordinator {
    registry: Arc<ComputeRegistry>,
    event_log: Arc<dyn EventLogStore>,
    runs: Arc<dyn RunStore>,
    intermediates: Arc<dyn IntermediateStore>,
    config: CoordinatorConfig,
}

// ---------------------------------------------------------------------------
// Internal types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum StepOutcome {
    Succeeded(BTreeSet<String>),
    Failed,
    Skipped,
}

/// Where a present input is read from.
#[derive(Debug, Clone)]
struct InputLocation {
    run_id: RunId,
    step_key: StepKey,
    output_name: String,
}

enum Prepared {
    Run(Vec<(String, Option<InputLocation>)>),
    Skip(String),
}

/// Everything a worker needs, owned so it can move into a task.
struct StepJob {
    run_id: RunId,
    root_run_id: RunId,
    step: StepDefinition,
    compute: Arc<dyn StepCompute>,
    inputs: Vec<(String, Option<InputLocation>)>,
    run_config: Arc<Value>,
    cancel: watch::Receiver<bool>,
    backoff: BackoffPolicy,
    event_log: Arc<dyn EventLogStore>,
    intermediates: Arc<dyn IntermediateStore>,
}

/// Aborts the wrapped task when dropped, so an aborted worker never leaves
/// its compute running.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// ---------------------------------------------------------------------------
// RunCoordinator
// ---------------------------------------------------------------------------

impl RunCoordinator {
    pub fn new(
        registry: Arc<ComputeRegistry>,
        event_log: Arc<dyn EventLogStore>,
        runs: Arc<dyn RunStore>,
        intermediates: Arc<dyn IntermediateStore>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            registry,
            event_log,
            runs,
            intermediates,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ComputeRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Execute `plan` as `run` until every step is terminal or termination
    /// is requested through `cancel`.
    pub async fn execute(
        &self,
        run: &Run,
        plan: &EffectivePlan,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<RunResult> {
        let run_id = run.run_id.clone();
        let pipeline = plan.pipeline().clone();

        self.runs
            .update_run_status(&run_id, RunStatus::Started)
            .await?;
        self.event_log
            .append_event(StepEvent::run(&run_id, StepEventKind::RunStarted))
            .await?;
        tracing::info!(
            run_id = %run_id,
            pipeline = %pipeline.name(),
            steps = plan.execute_keys().len(),
            reused = plan.reused().len(),
            "Run started"
        );

        let run_config = Arc::new(run.run_config.clone());
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));

        // Upstream steps of each executed step that this run also executes.
        let mut pending: HashMap<&str, usize> = plan
            .execute_keys()
            .iter()
            .map(|k| {
                let count = pipeline
                    .dependencies(k)
                    .into_iter()
                    .filter(|d| plan.should_execute(d))
                    .count();
                (k.as_str(), count)
            })
            .collect();
        let mut ready: VecDeque<StepKey> = plan
            .execute_keys()
            .iter()
            .filter(|k| pending.get(k.as_str()).copied() == Some(0))
            .cloned()
            .collect();

        let mut outcomes: HashMap<StepKey, StepOutcome> = HashMap::new();
        let mut workers: JoinSet<(StepKey, StepOutcome)> = JoinSet::new();
        let mut in_flight: HashSet<StepKey> = HashSet::new();
        let mut cancelled = false;
        let mut cancel_closed = false;
        let mut lost_workers = 0usize;

        loop {
            if !cancelled && *cancel.borrow() {
                cancelled = true;
                tracing::warn!(run_id = %run_id, in_flight = in_flight.len(), "Termination requested, no further steps will start");
            }

            // Dispatch everything that is ready, as far as capacity allows.
            while !cancelled {
                let Some(key) = ready.front().cloned() else {
                    break;
                };
                let Some(step) = pipeline.step(&key) else {
                    ready.pop_front();
                    continue;
                };
                match self.prepare(step, plan, &outcomes, &run_id) {
                    Prepared::Skip(reason) => {
                        ready.pop_front();
                        tracing::info!(run_id = %run_id, step = %key, reason = %reason, "Step skipped");
                        self.event_log
                            .append_event(StepEvent::step(
                                &run_id,
                                &key,
                                StepEventKind::Skipped { reason },
                            ))
                            .await?;
                        outcomes.insert(key.clone(), StepOutcome::Skipped);
                        release(&key, plan, &mut pending, &mut ready);
                    }
                    Prepared::Run(inputs) => {
                        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                            break;
                        };
                        ready.pop_front();
                        let job = StepJob {
                            run_id: run_id.clone(),
                            root_run_id: run.root_run_id.clone(),
                            compute: self.compute_for(step),
                            step: step.clone(),
                            inputs,
                            run_config: run_config.clone(),
                            cancel: cancel.clone(),
                            backoff: self.config.retry_backoff.clone(),
                            event_log: self.event_log.clone(),
                            intermediates: self.intermediates.clone(),
                        };
                        in_flight.insert(key.clone());
                        workers.spawn(run_step(job, permit));
                    }
                }
            }

            if workers.is_empty() && (cancelled || ready.is_empty()) {
                break;
            }

            tokio::select! {
                joined = workers.join_next() => match joined {
                    Some(Ok((key, outcome))) => {
                        in_flight.remove(&key);
                        outcomes.insert(key.clone(), outcome);
                        release(&key, plan, &mut pending, &mut ready);
                    }
                    Some(Err(e)) => {
                        lost_workers += 1;
                        tracing::error!(run_id = %run_id, error = %e, "Step worker panicked");
                    }
                    None => {}
                },
                changed = cancel.changed(), if !cancelled && !cancel_closed => {
                    if changed.is_err() {
                        cancel_closed = true;
                    }
                }
            }
        }

        let failed = outcomes
            .values()
            .filter(|o| matches!(o, StepOutcome::Failed))
            .count();
        let status = if cancelled {
            RunStatus::Canceled
        } else if failed > 0 || lost_workers > 0 {
            RunStatus::Failure
        } else {
            RunStatus::Success
        };

        let terminal = match status {
            RunStatus::Success => StepEventKind::RunSuccess,
            RunStatus::Canceled => StepEventKind::RunCanceled,
            _ => StepEventKind::RunFailure {
                message: Some(format!("{} step(s) failed", failed + lost_workers)),
            },
        };
        self.finish(&run_id, status, terminal).await?;

        let events = self.event_log.get_events(&run_id).await?;
        Ok(RunResult {
            run_id,
            status,
            step_states: resolve_step_states(plan.execute_keys(), &events),
        })
    }

    /// Mark a run FAILURE after an error outside any step (used by launchers
    /// when `execute` itself returns an error).
    pub async fn fail_run(&self, run_id: &str, message: impl Into<String>) -> Result<()> {
        self.finish(
            run_id,
            RunStatus::Failure,
            StepEventKind::RunFailure {
                message: Some(message.into()),
            },
        )
        .await
    }

    /// Record the final status, then the run-level terminal event that
    /// closes live subscriptions.
    async fn finish(&self, run_id: &str, status: RunStatus, terminal: StepEventKind) -> Result<()> {
        if let Err(e) = self.runs.update_run_status(run_id, status).await {
            tracing::warn!(run_id = %run_id, error = %e, "Could not record final run status");
        }
        self.event_log
            .append_event(StepEvent::run(run_id, terminal))
            .await?;
        match status {
            RunStatus::Success => tracing::info!(run_id = %run_id, "Run succeeded"),
            RunStatus::Canceled => tracing::warn!(run_id = %run_id, "Run canceled"),
            _ => tracing::error!(run_id = %run_id, "Run failed"),
        }
        Ok(())
    }

    fn compute_for(&self, step: &StepDefinition) -> Arc<dyn StepCompute> {
        match self.registry.resolve(step) {
            Ok(compute) => compute,
            Err(e) => Arc::new(Unresolved(e.to_string())),
        }
    }

    /// Decide whether `step` runs, and where each of its inputs comes from.
    fn prepare(
        &self,
        step: &StepDefinition,
        plan: &EffectivePlan,
        outcomes: &HashMap<StepKey, StepOutcome>,
        run_id: &str,
    ) -> Prepared {
        let mut inputs = Vec::with_capacity(step.inputs.len());
        for input in &step.inputs {
            let location = if plan.should_execute(&input.step) {
                match outcomes.get(&input.step) {
                    Some(StepOutcome::Succeeded(produced)) if produced.contains(&input.output) => {
                        Some(InputLocation {
                            run_id: run_id.to_string(),
                            step_key: input.step.clone(),
                            output_name: input.output.clone(),
                        })
                    }
                    _ => None,
                }
            } else {
                plan.reuse_source(&input.step)
                    .filter(|src| src.outputs.contains(&input.output))
                    .map(|src| InputLocation {
                        run_id: src.run_id.clone(),
                        step_key: input.step.clone(),
                        output_name: input.output.clone(),
                    })
            };

            if location.is_none() && !input.optional {
                let upstream = match outcomes.get(&input.step) {
                    Some(StepOutcome::Failed) => "failed",
                    Some(StepOutcome::Skipped) => "was skipped",
                    _ => "did not produce it",
                };
                return Prepared::Skip(format!(
                    "required input '{}' ({}.{}) is absent: upstream {}",
                    input.name, input.step, input.output, upstream
                ));
            }
            inputs.push((input.name.clone(), location));
        }
        Prepared::Run(inputs)
    }
}

/// A terminal outcome for `key` may make its dependents ready.
fn release(
    key: &str,
    plan: &EffectivePlan,
    pending: &mut HashMap<&str, usize>,
    ready: &mut VecDeque<StepKey>,
) {
    for dependent in plan.pipeline().dependents(key) {
        if !plan.should_execute(dependent) {
            continue;
        }
        if let Some(count) = pending.get_mut(dependent.as_str()) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                ready.push_back(dependent.clone());
            }
        }
    }
}

/// Stand-in for a step whose kind is not registered: it fails on execution.
struct Unresolved(String);

#[async_trait::async_trait]
impl StepCompute for Unresolved {
    fn kind(&self) -> &str {
        "unresolved"
    }

    async fn compute(&self, ctx: &StepContext, _inputs: &StepInputs) -> Result<StepOutputs> {
        Err(ctx.fail(self.0.clone()))
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

async fn run_step(job: StepJob, _permit: OwnedSemaphorePermit) -> (StepKey, StepOutcome) {
    let key = job.step.key.clone();
    let run_id = job.run_id.clone();
    let event_log = job.event_log.clone();

    let started = StepEvent::step(&run_id, &key, StepEventKind::Started)
        .with_metadata(json!({ "kind": job.step.kind }));
    if let Err(e) = event_log.append_event(started).await {
        tracing::error!(run_id = %run_id, step = %key, error = %e, "Could not record step start");
        return (key, StepOutcome::Failed);
    }
    tracing::info!(run_id = %run_id, step = %key, "Step started");

    let outcome = match execute_job(job).await {
        Ok(produced) => {
            tracing::info!(run_id = %run_id, step = %key, outputs = produced.len(), "Step succeeded");
            (StepEventKind::Succeeded, StepOutcome::Succeeded(produced))
        }
        Err(e) => {
            tracing::warn!(run_id = %run_id, step = %key, error = %e, "Step failed");
            (
                StepEventKind::Failed {
                    message: e.to_string(),
                },
                StepOutcome::Failed,
            )
        }
    };

    if let Err(e) = event_log
        .append_event(StepEvent::step(&run_id, &key, outcome.0))
        .await
    {
        tracing::error!(run_id = %run_id, step = %key, error = %e, "Could not record step outcome");
        return (key, StepOutcome::Failed);
    }
    (key, outcome.1)
}

/// Read inputs, compute with retry, then persist and announce outputs.
async fn execute_job(job: StepJob) -> Result<BTreeSet<String>> {
    let StepJob {
        run_id,
        root_run_id,
        step,
        compute,
        inputs: locations,
        run_config,
        cancel,
        backoff,
        event_log,
        intermediates,
    } = job;

    let mut inputs = StepInputs::new();
    for (name, location) in locations {
        let value = match location {
            Some(loc) => Some(
                intermediates
                    .read(&loc.run_id, &loc.step_key, &loc.output_name)
                    .await?,
            ),
            None => None,
        };
        inputs.insert(name, value);
    }

    let ctx = StepContext::new(&run_id, &root_run_id, &step, run_config, cancel);
    let max_retries = step.max_retries;
    let task = {
        let ctx = ctx.clone();
        let key = step.key.clone();
        tokio::spawn(async move {
            execute_with_retry(
                || compute.compute(&ctx, &inputs),
                max_retries,
                &backoff,
                &key,
            )
            .await
        })
    };
    let mut task = AbortOnDrop(task);

    let outputs = tokio::select! {
        joined = &mut task.0 => match joined {
            Ok(result) => result?,
            Err(e) => return Err(ctx.fail(format!("compute panicked: {e}"))),
        },
        _ = ctx.cancelled() => {
            return Err(ctx.fail("interrupted by run termination"));
        }
    };

    if let Some(undeclared) = outputs.names().find(|name| step.output(name).is_none()) {
        return Err(ctx.fail(format!("produced undeclared output '{undeclared}'")));
    }
    if let Some(missing) = step.required_outputs().find(|o| !outputs.contains(&o.name)) {
        return Err(ctx.fail(format!(
            "did not produce required output '{}'",
            missing.name
        )));
    }

    let mut produced = BTreeSet::new();
    for (name, value) in outputs {
        let metadata = json!({ "type_tag": value.type_tag, "bytes": value.bytes.len() });
        intermediates
            .write(&run_id, &step.key, &name, value)
            .await?;
        event_log
            .append_event(
                StepEvent::step(
                    &run_id,
                    &step.key,
                    StepEventKind::OutputProduced {
                        output_name: name.clone(),
                    },
                )
                .with_metadata(metadata),
            )
            .await?;
        produced.insert(name);
    }
    Ok(produced)
}

impl RunResult {
    pub fn state(&self, key: &str) -> StepState {
        self.step_states
            .get(key)
            .copied()
            .unwrap_or(StepState::NotRun)
    }
}
