//! Reexecution planning: decides which steps a new run executes and which
//! step outputs it reads from earlier runs of the same lineage.
//!
//! Planning happens in three passes:
//!
//! 1. **Seed.** Explicit step keys, every step of the pipeline, or (resume)
//!    every FAILED / NOT_RUN step of the parent run plus its downstream
//!    dependents within the parent's executed set.
//! 2. **Upstream expansion.** Each dependency outside the seed is resolved
//!    against the lineage. A step that succeeded in the nearest ancestor that
//!    ran it, with every required output produced, becomes `Reuse`; anything
//!    else joins the executed set and is expanded in turn. On resume, a step
//!    the parent skipped as a branch not taken is never re-attempted: it is
//!    carried over from the parent with no outputs, so its consumers see the
//!    input as absent.
//! 3. **Verification.** Every reused output must exist in the intermediate
//!    store before the run is created ([`verify_reuse`]).

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use lineage_types::{LineageError, Result, Run, RunId, StepKey, StepState};

use crate::definition::{PipelineDefinition, StepDefinition};
use crate::events::EventLogStore;
use crate::plan::{downstream_closure, ensure_known, ExecutionPlan};
use crate::step_state::RunHistory;
use crate::store::{IntermediateStore, RunStore};

/// How the new run selects its steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReexecutionMode {
    /// Execute these steps (plus whatever upstream cannot be reused).
    Explicit(Vec<StepKey>),
    /// Execute what failed or never ran in the parent run.
    ResumeFromFailure,
    /// Execute every step again.
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepDisposition {
    Execute,
    Reuse { source_run_id: RunId },
}

/// Where a reused step's outputs live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReuseSource {
    pub run_id: RunId,
    /// Outputs the source run actually produced. Optional outputs it never
    /// produced are absent here and stay absent for consumers.
    pub outputs: BTreeSet<String>,
}

/// The steps a run executes, annotated with the reuse source of every
/// upstream step it does not execute.
#[derive(Debug, Clone)]
pub struct EffectivePlan {
    plan: ExecutionPlan,
    /// Executed steps in topological order.
    execute: Vec<StepKey>,
    execute_set: HashSet<StepKey>,
    reuse: HashMap<StepKey, ReuseSource>,
}

impl EffectivePlan {
    /// Execute every step of `plan`, reusing nothing.
    pub fn fresh(plan: ExecutionPlan) -> Self {
        let execute = plan.step_keys().to_vec();
        Self {
            execute_set: execute.iter().cloned().collect(),
            execute,
            plan,
            reuse: HashMap::new(),
        }
    }

    pub fn pipeline(&self) -> &Arc<PipelineDefinition> {
        self.plan.pipeline()
    }

    pub fn execute_keys(&self) -> &[StepKey] {
        &self.execute
    }

    pub fn should_execute(&self, key: &str) -> bool {
        self.execute_set.contains(key)
    }

    pub fn reused(&self) -> &HashMap<StepKey, ReuseSource> {
        &self.reuse
    }

    pub fn reuse_source(&self, key: &str) -> Option<&ReuseSource> {
        self.reuse.get(key)
    }

    /// Reused step keys in topological order.
    pub fn reused_keys(&self) -> Vec<StepKey> {
        self.plan
            .step_keys()
            .iter()
            .filter(|k| self.reuse.contains_key(*k))
            .cloned()
            .collect()
    }

    pub fn disposition(&self, key: &str) -> Option<StepDisposition> {
        if self.should_execute(key) {
            Some(StepDisposition::Execute)
        } else {
            self.reuse.get(key).map(|src| StepDisposition::Reuse {
                source_run_id: src.run_id.clone(),
            })
        }
    }

    pub fn is_empty(&self) -> bool {
        self.execute.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Lineage
// ---------------------------------------------------------------------------

/// One ancestor run and its replayed log.
#[derive(Debug, Clone)]
pub struct AncestorRun {
    pub run: Run,
    pub history: RunHistory,
}

/// The parent run and its ancestors, nearest first. Empty for a fresh launch.
#[derive(Debug, Clone, Default)]
pub struct LineageHistory {
    ancestors: Vec<AncestorRun>,
}

impl LineageHistory {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Follow `parent_run_id` links from `parent_run_id` to the root.
    pub async fn load(
        parent_run_id: &str,
        runs: &dyn RunStore,
        events: &dyn EventLogStore,
    ) -> Result<Self> {
        let mut ancestors = Vec::new();
        let mut visited = HashSet::new();
        let mut next = Some(parent_run_id.to_string());
        while let Some(run_id) = next.take() {
            if !visited.insert(run_id.clone()) {
                tracing::warn!(run_id = %run_id, "Parent chain loops back on itself, stopping");
                break;
            }
            let run = runs
                .get_run(&run_id)
                .await?
                .ok_or_else(|| LineageError::RunNotFound(run_id.clone()))?;
            let history = RunHistory::from_events(&events.get_events(&run_id).await?);
            next = run.parent_run_id.clone();
            ancestors.push(AncestorRun { run, history });
        }
        Ok(Self { ancestors })
    }

    /// Build from already-loaded runs, nearest ancestor first.
    pub fn from_ancestors(ancestors: Vec<AncestorRun>) -> Self {
        Self { ancestors }
    }

    pub fn parent(&self) -> Option<&AncestorRun> {
        self.ancestors.first()
    }

    pub fn ancestors(&self) -> &[AncestorRun] {
        &self.ancestors
    }

    pub fn is_empty(&self) -> bool {
        self.ancestors.is_empty()
    }

    /// The nearest ancestor in which `step` succeeded, provided that run
    /// produced every required output of `step`.
    pub fn resolve(&self, step: &StepDefinition) -> Option<ReuseSource> {
        let ancestor = self
            .ancestors
            .iter()
            .find(|a| a.history.produced_outputs(&step.key).is_some())?;
        let produced = ancestor.history.produced_outputs(&step.key)?;
        if let Some(missing) = step.required_outputs().find(|o| !produced.contains(&o.name)) {
            tracing::debug!(
                step = %step.key,
                run_id = %ancestor.run.run_id,
                output = %missing.name,
                "Required output was never produced, step cannot be reused"
            );
            return None;
        }
        Some(ReuseSource {
            run_id: ancestor.run.run_id.clone(),
            outputs: step
                .outputs
                .iter()
                .filter(|o| produced.contains(&o.name))
                .map(|o| o.name.clone())
                .collect(),
        })
    }
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// Steps of `parent`'s run that it set out to execute.
fn executed_set(full: &ExecutionPlan, parent: &Run) -> HashSet<StepKey> {
    match &parent.step_keys_to_execute {
        Some(keys) => keys.iter().filter(|k| full.contains(k)).cloned().collect(),
        None => full.step_keys().iter().cloned().collect(),
    }
}

fn resume_seed(full: &ExecutionPlan, lineage: &LineageHistory) -> Result<HashSet<StepKey>> {
    let parent = lineage.parent().ok_or_else(|| {
        LineageError::InvalidRequest("resume from failure requires a parent run".into())
    })?;
    let executed = executed_set(full, &parent.run);
    let unfinished: Vec<&str> = full
        .step_keys()
        .iter()
        .filter(|k| executed.contains(*k))
        .filter(|k| {
            matches!(
                parent.history.state(k),
                StepState::Failed | StepState::NotRun
            )
        })
        .map(String::as_str)
        .collect();
    tracing::debug!(
        parent_run_id = %parent.run.run_id,
        unfinished = ?unfinished,
        "Resume seeded from unfinished steps"
    );
    Ok(downstream_closure(
        full.pipeline(),
        unfinished,
        Some(&executed),
    ))
}

/// A dependency the parent skipped stays skipped on resume. It is outside the
/// seed, so the skip was not caused by a failed or unfinished step.
fn carried_skip(mode: &ReexecutionMode, lineage: &LineageHistory, key: &str) -> Option<ReuseSource> {
    if *mode != ReexecutionMode::ResumeFromFailure {
        return None;
    }
    let parent = lineage.parent()?;
    (parent.history.state(key) == StepState::Skipped).then(|| ReuseSource {
        run_id: parent.run.run_id.clone(),
        outputs: BTreeSet::new(),
    })
}

/// Compute the effective plan for a run of `full`'s pipeline.
pub fn plan_reexecution(
    full: &ExecutionPlan,
    lineage: &LineageHistory,
    mode: &ReexecutionMode,
) -> Result<EffectivePlan> {
    let pipeline = full.pipeline().clone();
    let seed: HashSet<StepKey> = match mode {
        ReexecutionMode::Explicit(keys) => {
            ensure_known(&pipeline, keys)?;
            keys.iter().cloned().collect()
        }
        ReexecutionMode::Full => full.step_keys().iter().cloned().collect(),
        ReexecutionMode::ResumeFromFailure => resume_seed(full, lineage)?,
    };

    let mut execute = seed.clone();
    let mut reuse: HashMap<StepKey, ReuseSource> = HashMap::new();
    let mut queue: VecDeque<StepKey> = full.ordered(&seed).into();

    while let Some(key) = queue.pop_front() {
        for dep in pipeline.dependencies(&key) {
            if execute.contains(dep) || reuse.contains_key(dep) {
                continue;
            }
            let Some(step) = pipeline.step(dep) else {
                continue;
            };
            if let Some(source) = carried_skip(mode, lineage, dep) {
                tracing::debug!(step = %dep, source_run_id = %source.run_id, "Skipped in parent, carried over without outputs");
                reuse.insert(dep.to_string(), source);
                continue;
            }
            match lineage.resolve(step) {
                Some(source) => {
                    tracing::debug!(step = %dep, source_run_id = %source.run_id, "Reusing outputs");
                    reuse.insert(dep.to_string(), source);
                }
                None => {
                    tracing::debug!(step = %dep, needed_by = %key, "Upstream not reusable, executing");
                    execute.insert(dep.to_string());
                    queue.push_back(dep.to_string());
                }
            }
        }
    }

    let ordered = full.ordered(&execute);
    tracing::debug!(
        pipeline = %pipeline.name(),
        execute = ?ordered,
        reused = reuse.len(),
        "Effective plan computed"
    );
    Ok(EffectivePlan {
        plan: full.clone(),
        execute: ordered,
        execute_set: execute,
        reuse,
    })
}

/// Confirm every reused output exists in `store`. Runs before any run is
/// created so a missing output fails the launch, not a step.
pub async fn verify_reuse(plan: &EffectivePlan, store: &dyn IntermediateStore) -> Result<()> {
    for key in plan.reused_keys() {
        let Some(source) = plan.reuse_source(&key) else {
            continue;
        };
        for output in &source.outputs {
            if !store.exists(&source.run_id, &key, output).await? {
                return Err(LineageError::MissingIntermediate {
                    step_key: key.clone(),
                    output_name: output.clone(),
                    run_id: source.run_id.clone(),
                });
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::OutputDef;
    use crate::store::InMemoryIntermediateStore;
    use lineage_types::{Intermediate, StepEvent, StepEventKind};

    /// spawn -> fail -> fail_2 -> reset
    fn chain() -> ExecutionPlan {
        let pipeline = PipelineDefinition::new(
            "chain",
            vec![
                StepDefinition::new("spawn", "value"),
                StepDefinition::new("fail", "fail_unless").input("x", "spawn"),
                StepDefinition::new("fail_2", "fail_unless").input("x", "fail"),
                StepDefinition::new("reset", "collect").input("x", "fail_2"),
            ],
        )
        .unwrap();
        ExecutionPlan::full(Arc::new(pipeline)).unwrap()
    }

    fn succeeded(run: &str, key: &str, outputs: &[&str]) -> Vec<StepEvent> {
        let mut events = vec![StepEvent::step(run, key, StepEventKind::Started)];
        for o in outputs {
            events.push(StepEvent::step(
                run,
                key,
                StepEventKind::OutputProduced {
                    output_name: o.to_string(),
                },
            ));
        }
        events.push(StepEvent::step(run, key, StepEventKind::Succeeded));
        events
    }

    fn failed(run: &str, key: &str) -> Vec<StepEvent> {
        vec![
            StepEvent::step(run, key, StepEventKind::Started),
            StepEvent::step(
                run,
                key,
                StepEventKind::Failed {
                    message: "boom".into(),
                },
            ),
        ]
    }

    fn ancestor(run: Run, events: Vec<Vec<StepEvent>>) -> AncestorRun {
        let mut events: Vec<StepEvent> = events.into_iter().flatten().collect();
        for (i, e) in events.iter_mut().enumerate() {
            e.sequence = i as u64;
        }
        AncestorRun {
            history: RunHistory::from_events(&events),
            run,
        }
    }

    fn keys(plan: &EffectivePlan) -> Vec<&str> {
        plan.execute_keys().iter().map(String::as_str).collect()
    }

    #[test]
    fn fresh_launch_executes_upstream_closure() {
        let full = chain();
        let plan = plan_reexecution(
            &full,
            &LineageHistory::empty(),
            &ReexecutionMode::Explicit(vec!["fail".into()]),
        )
        .unwrap();
        assert_eq!(keys(&plan), vec!["spawn", "fail"]);
        assert!(plan.reused().is_empty());
    }

    #[test]
    fn resume_reuses_succeeded_upstream() {
        let full = chain();
        let run0 = Run::new("chain").with_run_id("r0");
        let lineage = LineageHistory::from_ancestors(vec![ancestor(
            run0,
            vec![succeeded("r0", "spawn", &["result"]), failed("r0", "fail")],
        )]);

        let plan = plan_reexecution(&full, &lineage, &ReexecutionMode::ResumeFromFailure).unwrap();
        assert_eq!(keys(&plan), vec!["fail", "fail_2", "reset"]);
        assert_eq!(
            plan.disposition("spawn"),
            Some(StepDisposition::Reuse {
                source_run_id: "r0".into()
            })
        );
    }

    #[test]
    fn reuse_walks_past_runs_that_did_not_execute_the_step() {
        let full = chain();
        let run0 = Run::new("chain").with_run_id("r0");
        let mut run1 = Run::new("chain").with_run_id("r1").with_parent(&run0);
        run1.step_keys_to_execute = Some(vec!["fail".into(), "fail_2".into(), "reset".into()]);

        let lineage = LineageHistory::from_ancestors(vec![
            ancestor(
                run1,
                vec![succeeded("r1", "fail", &["result"]), failed("r1", "fail_2")],
            ),
            ancestor(
                run0,
                vec![succeeded("r0", "spawn", &["result"]), failed("r0", "fail")],
            ),
        ]);

        let plan = plan_reexecution(&full, &lineage, &ReexecutionMode::ResumeFromFailure).unwrap();
        assert_eq!(keys(&plan), vec!["fail_2", "reset"]);
        assert_eq!(plan.reuse_source("fail").unwrap().run_id, "r1");
        // spawn is not needed: fail is reused, so expansion stops there.
        assert!(plan.disposition("spawn").is_none());
    }

    #[test]
    fn resume_of_fully_succeeded_run_is_empty() {
        let full = chain();
        let run0 = Run::new("chain").with_run_id("r0");
        let lineage = LineageHistory::from_ancestors(vec![ancestor(
            run0,
            vec![
                succeeded("r0", "spawn", &["result"]),
                succeeded("r0", "fail", &["result"]),
                succeeded("r0", "fail_2", &["result"]),
                succeeded("r0", "reset", &["result"]),
            ],
        )]);
        let plan = plan_reexecution(&full, &lineage, &ReexecutionMode::ResumeFromFailure).unwrap();
        assert!(plan.is_empty());
        assert!(plan.reused().is_empty());
    }

    #[test]
    fn dangling_step_is_never_a_reuse_source() {
        let full = chain();
        let run0 = Run::new("chain").with_run_id("r0");
        let lineage = LineageHistory::from_ancestors(vec![ancestor(
            run0,
            vec![vec![
                StepEvent::step("r0", "spawn", StepEventKind::Started),
                StepEvent::step(
                    "r0",
                    "spawn",
                    StepEventKind::OutputProduced {
                        output_name: "result".into(),
                    },
                ),
            ]],
        )]);
        let plan = plan_reexecution(&full, &lineage, &ReexecutionMode::ResumeFromFailure).unwrap();
        assert_eq!(keys(&plan), vec!["spawn", "fail", "fail_2", "reset"]);
    }

    #[test]
    fn explicit_retry_of_one_step_reuses_its_upstream() {
        let full = chain();
        let run0 = Run::new("chain").with_run_id("r0");
        let lineage = LineageHistory::from_ancestors(vec![ancestor(
            run0,
            vec![
                succeeded("r0", "spawn", &["result"]),
                succeeded("r0", "fail", &["result"]),
            ],
        )]);
        let plan = plan_reexecution(
            &full,
            &lineage,
            &ReexecutionMode::Explicit(vec!["fail".into()]),
        )
        .unwrap();
        assert_eq!(keys(&plan), vec!["fail"]);
        assert_eq!(plan.reuse_source("spawn").unwrap().run_id, "r0");
    }

    #[test]
    fn unknown_explicit_key_fails() {
        let err = plan_reexecution(
            &chain(),
            &LineageHistory::empty(),
            &ReexecutionMode::Explicit(vec!["nope".into()]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn resume_without_parent_is_invalid() {
        let err = plan_reexecution(
            &chain(),
            &LineageHistory::empty(),
            &ReexecutionMode::ResumeFromFailure,
        )
        .unwrap_err();
        assert!(matches!(err, LineageError::InvalidRequest(_)));
    }

    fn branching() -> ExecutionPlan {
        // split produces left (required) and right (optional);
        // on_right consumes right; can_fail -> child
        let pipeline = PipelineDefinition::new(
            "branching",
            vec![
                StepDefinition::new("split", "branch").outputs(vec![
                    OutputDef::required("left"),
                    OutputDef::optional("right"),
                ]),
                StepDefinition::new("on_right", "collect").input_from("x", "split", "right"),
                StepDefinition::new("can_fail", "fail_unless").input_from("x", "split", "left"),
                StepDefinition::new("child", "collect").input("x", "can_fail"),
            ],
        )
        .unwrap();
        ExecutionPlan::full(Arc::new(pipeline)).unwrap()
    }

    #[test]
    fn conditional_skip_is_not_resumed_but_failure_skips_are() {
        let full = branching();
        let run0 = Run::new("branching").with_run_id("r0");
        let lineage = LineageHistory::from_ancestors(vec![ancestor(
            run0,
            vec![
                succeeded("r0", "split", &["left"]),
                vec![StepEvent::step(
                    "r0",
                    "on_right",
                    StepEventKind::Skipped {
                        reason: "input absent".into(),
                    },
                )],
                failed("r0", "can_fail"),
                vec![StepEvent::step(
                    "r0",
                    "child",
                    StepEventKind::Skipped {
                        reason: "upstream failed".into(),
                    },
                )],
            ],
        )]);

        let plan = plan_reexecution(&full, &lineage, &ReexecutionMode::ResumeFromFailure).unwrap();
        assert_eq!(keys(&plan), vec!["can_fail", "child"]);
        let source = plan.reuse_source("split").unwrap();
        assert_eq!(source.outputs, BTreeSet::from(["left".to_string()]));
    }

    #[test]
    fn resume_keeps_branch_skip_feeding_an_optional_input() {
        let pipeline = PipelineDefinition::new(
            "branching",
            vec![
                StepDefinition::new("split", "branch").outputs(vec![
                    OutputDef::required("left"),
                    OutputDef::optional("right"),
                ]),
                StepDefinition::new("on_right", "collect").input_from("x", "split", "right"),
                StepDefinition::new("can_fail", "fail_unless").input_from("x", "split", "left"),
                StepDefinition::new("child", "collect")
                    .input("x", "can_fail")
                    .optional_input("y", "on_right", "result"),
            ],
        )
        .unwrap();
        let full = ExecutionPlan::full(Arc::new(pipeline)).unwrap();
        let run0 = Run::new("branching").with_run_id("r0");
        let lineage = LineageHistory::from_ancestors(vec![ancestor(
            run0,
            vec![
                succeeded("r0", "split", &["left"]),
                vec![StepEvent::step(
                    "r0",
                    "on_right",
                    StepEventKind::Skipped {
                        reason: "input absent".into(),
                    },
                )],
                failed("r0", "can_fail"),
                vec![StepEvent::step(
                    "r0",
                    "child",
                    StepEventKind::Skipped {
                        reason: "upstream failed".into(),
                    },
                )],
            ],
        )]);

        let plan = plan_reexecution(&full, &lineage, &ReexecutionMode::ResumeFromFailure).unwrap();
        assert_eq!(keys(&plan), vec!["can_fail", "child"]);
        assert!(!plan.should_execute("on_right"));
        let carried = plan.reuse_source("on_right").unwrap();
        assert_eq!(carried.run_id, "r0");
        assert!(carried.outputs.is_empty());
        assert_eq!(plan.reused_keys(), vec!["split".to_string(), "on_right".to_string()]);
    }

    #[test]
    fn explicit_request_still_executes_a_skipped_upstream() {
        let full = branching();
        let run0 = Run::new("branching").with_run_id("r0");
        let lineage = LineageHistory::from_ancestors(vec![ancestor(
            run0,
            vec![
                succeeded("r0", "split", &["left"]),
                vec![StepEvent::step(
                    "r0",
                    "on_right",
                    StepEventKind::Skipped {
                        reason: "input absent".into(),
                    },
                )],
            ],
        )]);
        let plan = plan_reexecution(
            &full,
            &lineage,
            &ReexecutionMode::Explicit(vec!["on_right".into()]),
        )
        .unwrap();
        assert_eq!(keys(&plan), vec!["on_right"]);
        assert_eq!(plan.reuse_source("split").unwrap().run_id, "r0");
    }

    #[test]
    fn step_missing_a_required_output_is_recomputed() {
        let full = branching();
        let run0 = Run::new("branching").with_run_id("r0");
        // split "succeeded" without announcing its required output.
        let lineage = LineageHistory::from_ancestors(vec![ancestor(
            run0,
            vec![succeeded("r0", "split", &[]), failed("r0", "can_fail")],
        )]);
        let plan = plan_reexecution(&full, &lineage, &ReexecutionMode::ResumeFromFailure).unwrap();
        assert!(plan.should_execute("split"));
        assert!(plan.reused().is_empty());
    }

    #[tokio::test]
    async fn verify_reuse_reports_missing_output() {
        let full = chain();
        let run0 = Run::new("chain").with_run_id("r0");
        let lineage = LineageHistory::from_ancestors(vec![ancestor(
            run0,
            vec![succeeded("r0", "spawn", &["result"]), failed("r0", "fail")],
        )]);
        let plan = plan_reexecution(&full, &lineage, &ReexecutionMode::ResumeFromFailure).unwrap();

        let store = InMemoryIntermediateStore::new();
        match verify_reuse(&plan, &store).await.unwrap_err() {
            LineageError::MissingIntermediate {
                step_key,
                output_name,
                run_id,
            } => {
                assert_eq!(step_key, "spawn");
                assert_eq!(output_name, "result");
                assert_eq!(run_id, "r0");
            }
            other => panic!("Expected MissingIntermediate, got: {other:?}"),
        }

        store
            .write(
                "r0",
                "spawn",
                "result",
                Intermediate::new("json", b"1".to_vec()),
            )
            .await
            .unwrap();
        verify_reuse(&plan, &store).await.unwrap();
    }
}
