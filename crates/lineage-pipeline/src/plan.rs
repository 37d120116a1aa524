//! Execution plan builder.
//!
//! Compiles a [`PipelineDefinition`] plus an optional set of requested step
//! keys into an [`ExecutionPlan`]: the requested steps together with the
//! transitive closure of their upstream dependencies, in a deterministic
//! topological order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use lineage_types::{LineageError, Result, StepKey};

use crate::definition::PipelineDefinition;

#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pipeline: Arc<PipelineDefinition>,
    /// Plan members in topological order.
    step_keys: Vec<StepKey>,
    members: HashSet<StepKey>,
}

impl ExecutionPlan {
    /// Build the plan for `requested` (or every step when `None`).
    ///
    /// Fails with `StepNotFound` for the first unknown requested key and with
    /// `CyclicPlan` when the step graph is not acyclic.
    pub fn build(pipeline: Arc<PipelineDefinition>, requested: Option<&[StepKey]>) -> Result<Self> {
        if let Some(keys) = requested {
            ensure_known(&pipeline, keys)?;
        }
        let order = topological_order(&pipeline)?;
        let members: HashSet<StepKey> = match requested {
            None => order.iter().cloned().collect(),
            Some(keys) => upstream_closure(&pipeline, keys.iter().map(String::as_str)),
        };
        let step_keys = order
            .into_iter()
            .filter(|k| members.contains(k))
            .collect();
        Ok(Self {
            pipeline,
            step_keys,
            members,
        })
    }

    /// The plan covering the whole pipeline.
    pub fn full(pipeline: Arc<PipelineDefinition>) -> Result<Self> {
        Self::build(pipeline, None)
    }

    pub fn pipeline(&self) -> &Arc<PipelineDefinition> {
        &self.pipeline
    }

    pub fn step_keys(&self) -> &[StepKey] {
        &self.step_keys
    }

    pub fn contains(&self, key: &str) -> bool {
        self.members.contains(key)
    }

    pub fn len(&self) -> usize {
        self.step_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.step_keys.is_empty()
    }

    /// Members of `subset` that are in this plan, in plan order.
    pub fn ordered(&self, subset: &HashSet<StepKey>) -> Vec<StepKey> {
        self.step_keys
            .iter()
            .filter(|k| subset.contains(*k))
            .cloned()
            .collect()
    }
}

/// Fail with `StepNotFound` naming the first key absent from `pipeline`.
pub fn ensure_known(pipeline: &PipelineDefinition, keys: &[StepKey]) -> Result<()> {
    match keys.iter().find(|k| !pipeline.contains(k)) {
        Some(missing) => Err(LineageError::StepNotFound {
            step_key: missing.clone(),
        }),
        None => Ok(()),
    }
}

/// Kahn's algorithm with declaration-order tie-breaking, so the same pipeline
/// always yields the same order.
pub fn topological_order(pipeline: &PipelineDefinition) -> Result<Vec<StepKey>> {
    let mut in_degree: HashMap<&str, usize> = pipeline
        .steps()
        .iter()
        .map(|s| (s.key.as_str(), s.dependencies().len()))
        .collect();

    let mut queue: VecDeque<&str> = pipeline
        .steps()
        .iter()
        .map(|s| s.key.as_str())
        .filter(|k| in_degree.get(k).copied() == Some(0))
        .collect();

    let mut order = Vec::with_capacity(pipeline.len());
    while let Some(key) = queue.pop_front() {
        order.push(key.to_string());
        for dependent in pipeline.dependents(key) {
            if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent.as_str());
                }
            }
        }
    }

    if order.len() < pipeline.len() {
        let cycle = pipeline
            .steps()
            .iter()
            .filter(|s| in_degree.get(s.key.as_str()).copied().unwrap_or(0) > 0)
            .map(|s| s.key.clone())
            .collect();
        return Err(LineageError::CyclicPlan { cycle });
    }
    Ok(order)
}

/// `seeds` plus everything they transitively depend on.
pub fn upstream_closure<'a>(
    pipeline: &PipelineDefinition,
    seeds: impl IntoIterator<Item = &'a str>,
) -> HashSet<StepKey> {
    let mut visited: HashSet<StepKey> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    for seed in seeds {
        if visited.insert(seed.to_string()) {
            queue.push_back(seed.to_string());
        }
    }
    while let Some(current) = queue.pop_front() {
        for dep in pipeline.dependencies(&current) {
            if visited.insert(dep.to_string()) {
                queue.push_back(dep.to_string());
            }
        }
    }
    visited
}

/// `seeds` plus everything transitively downstream of them. When `within` is
/// given, traversal never leaves that set.
pub fn downstream_closure<'a>(
    pipeline: &PipelineDefinition,
    seeds: impl IntoIterator<Item = &'a str>,
    within: Option<&HashSet<StepKey>>,
) -> HashSet<StepKey> {
    let mut visited: HashSet<StepKey> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    for seed in seeds {
        if visited.insert(seed.to_string()) {
            queue.push_back(seed.to_string());
        }
    }
    while let Some(current) = queue.pop_front() {
        for dependent in pipeline.dependents(&current) {
            if within.is_some_and(|w| !w.contains(dependent)) {
                continue;
            }
            if visited.insert(dependent.clone()) {
                queue.push_back(dependent.clone());
            }
        }
    }
    visited
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::StepDefinition;

    /// a -> b -> d, a -> c -> d, e independent
    fn diamond() -> Arc<PipelineDefinition> {
        Arc::new(
            PipelineDefinition::new(
                "diamond",
                vec![
                    StepDefinition::new("a", "value"),
                    StepDefinition::new("b", "collect").input("x", "a"),
                    StepDefinition::new("c", "collect").input("x", "a"),
                    StepDefinition::new("d", "collect")
                        .input("left", "b")
                        .input("right", "c"),
                    StepDefinition::new("e", "value"),
                ],
            )
            .unwrap(),
        )
    }

    #[test]
    fn full_plan_contains_every_step_in_dependency_order() {
        let plan = ExecutionPlan::full(diamond()).unwrap();
        assert_eq!(plan.step_keys(), &["a", "e", "b", "c", "d"]);
    }

    #[test]
    fn subset_plan_is_requested_plus_upstream_closure() {
        let plan = ExecutionPlan::build(diamond(), Some(&["b".to_string()])).unwrap();
        assert_eq!(plan.step_keys(), &["a", "b"]);
        assert!(!plan.contains("c"));
        assert!(!plan.contains("e"));

        let plan = ExecutionPlan::build(diamond(), Some(&["d".to_string()])).unwrap();
        assert_eq!(plan.step_keys(), &["a", "b", "c", "d"]);
    }

    #[test]
    fn closure_property_holds_for_every_single_step_subset() {
        let pipeline = diamond();
        for step in pipeline.steps() {
            let requested = vec![step.key.clone()];
            let plan = ExecutionPlan::build(pipeline.clone(), Some(&requested)).unwrap();
            let expected = upstream_closure(&pipeline, [step.key.as_str()]);
            let actual: HashSet<StepKey> = plan.step_keys().iter().cloned().collect();
            assert_eq!(actual, expected, "closure mismatch for {}", step.key);
        }
    }

    #[test]
    fn unknown_requested_key_names_offender() {
        let err = ExecutionPlan::build(diamond(), Some(&["a".to_string(), "nope".to_string()]))
            .unwrap_err();
        match err {
            LineageError::StepNotFound { step_key } => assert_eq!(step_key, "nope"),
            other => panic!("Expected StepNotFound, got: {other:?}"),
        }
    }

    #[test]
    fn cycle_is_reported() {
        let pipeline = Arc::new(
            PipelineDefinition::new(
                "loop",
                vec![
                    StepDefinition::new("start", "value"),
                    StepDefinition::new("x", "collect")
                        .input("s", "start")
                        .input("y", "y"),
                    StepDefinition::new("y", "collect").input("x", "x"),
                ],
            )
            .unwrap(),
        );
        let err = ExecutionPlan::full(pipeline).unwrap_err();
        match err {
            LineageError::CyclicPlan { cycle } => assert_eq!(cycle, vec!["x", "y"]),
            other => panic!("Expected CyclicPlan, got: {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let pipeline = Arc::new(
            PipelineDefinition::new("self", vec![StepDefinition::new("x", "collect").input("me", "x")])
                .unwrap(),
        );
        assert!(matches!(
            ExecutionPlan::full(pipeline),
            Err(LineageError::CyclicPlan { .. })
        ));
    }

    #[test]
    fn downstream_closure_respects_bounds() {
        let pipeline = diamond();
        let all = downstream_closure(&pipeline, ["b"], None);
        assert_eq!(all, HashSet::from(["b".to_string(), "d".to_string()]));

        let bounded = downstream_closure(
            &pipeline,
            ["a"],
            Some(&HashSet::from(["a".to_string(), "b".to_string()])),
        );
        assert_eq!(bounded, HashSet::from(["a".to_string(), "b".to_string()]));
    }
}
