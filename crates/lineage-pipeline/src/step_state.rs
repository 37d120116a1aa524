//! Step state resolution: replays a run's event log into per-step outcomes.
//!
//! States are always re-derived from events, never stored. A step that logged
//! `Started` but no terminal event (process death, termination mid-step) is
//! `NotRun`, and whatever it may have written is not trusted for reuse.

use std::collections::{BTreeSet, HashMap};

use lineage_types::{RunStatus, StepEvent, StepEventKind, StepKey, StepState};

/// Everything the log says about one step within one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepRecord {
    pub started: bool,
    pub succeeded: bool,
    pub failed: bool,
    pub skipped: bool,
    /// Outputs announced via `OutputProduced`, trusted only once the step succeeded.
    pub outputs: BTreeSet<String>,
}

impl StepRecord {
    pub fn state(&self) -> StepState {
        if self.succeeded {
            StepState::Succeeded
        } else if self.failed {
            StepState::Failed
        } else if self.skipped {
            StepState::Skipped
        } else {
            StepState::NotRun
        }
    }

    /// Started but never reached a terminal event.
    pub fn is_dangling(&self) -> bool {
        self.started && !self.succeeded && !self.failed && !self.skipped
    }
}

/// Replayed view of a single run's event log.
#[derive(Debug, Clone, Default)]
pub struct RunHistory {
    steps: HashMap<StepKey, StepRecord>,
    terminal: Option<RunStatus>,
}

impl RunHistory {
    pub fn from_events(events: &[StepEvent]) -> Self {
        let mut ordered: Vec<&StepEvent> = events.iter().collect();
        ordered.sort_by_key(|e| e.sequence);

        let mut history = RunHistory::default();
        for event in ordered {
            if let Some(status) = event.kind.terminal_run_status() {
                history.terminal = Some(status);
                continue;
            }
            let Some(key) = event.step_key.as_ref() else {
                continue;
            };
            let record = history.steps.entry(key.clone()).or_default();
            match &event.kind {
                StepEventKind::Started => record.started = true,
                StepEventKind::OutputProduced { output_name } => {
                    record.outputs.insert(output_name.clone());
                }
                StepEventKind::Succeeded => record.succeeded = true,
                StepEventKind::Failed { .. } => record.failed = true,
                StepEventKind::Skipped { .. } => record.skipped = true,
                _ => {}
            }
        }
        history
    }

    pub fn state(&self, key: &str) -> StepState {
        self.steps
            .get(key)
            .map(StepRecord::state)
            .unwrap_or(StepState::NotRun)
    }

    pub fn record(&self, key: &str) -> Option<&StepRecord> {
        self.steps.get(key)
    }

    /// Outputs of `key` that may be reused: only from a step that succeeded.
    pub fn produced_outputs(&self, key: &str) -> Option<&BTreeSet<String>> {
        self.steps
            .get(key)
            .filter(|r| r.succeeded)
            .map(|r| &r.outputs)
    }

    /// Whether `key` logged a `Started` event in this run.
    pub fn started(&self, key: &str) -> bool {
        self.steps.get(key).is_some_and(|r| r.started)
    }

    /// Steps left with `Started` and no terminal event.
    pub fn dangling_steps(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self
            .steps
            .iter()
            .filter(|(_, r)| r.is_dangling())
            .map(|(k, _)| k.as_str())
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Run status recorded by a run-level terminal event, if one was logged.
    pub fn terminal_status(&self) -> Option<RunStatus> {
        self.terminal
    }
}

/// Classify every key in `step_keys` from a run's events.
pub fn resolve_step_states<'a>(
    step_keys: impl IntoIterator<Item = &'a StepKey>,
    events: &[StepEvent],
) -> HashMap<StepKey, StepState> {
    let history = RunHistory::from_events(events);
    step_keys
        .into_iter()
        .map(|k| (k.clone(), history.state(k)))
        .collect()
}
