//! Shared types, errors, and run records for the lineage orchestrator.
//!
//! This crate provides the foundational types used across all other lineage crates:
//! - `LineageError`: unified error taxonomy
//! - `Run` / `RunStatus`: one execution attempt and its lineage pointers
//! - `StepEvent`: append-only lifecycle record for runs and steps
//! - `StepState`: derived per-step classification of a run
//! - `Intermediate`: persisted step output payload

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier of a run (a v4 UUID string).
pub type RunId = String;

/// Key of a step, unique within a pipeline.
pub type StepKey = String;

/// Unified error type for all lineage subsystems.
#[derive(Debug, thiserror::Error)]
pub enum LineageError {
    // === Plan Errors ===
    #[error("Can not build subset plan from unknown step: {step_key}")]
    StepNotFound { step_key: StepKey },

    #[error("Execution plan contains a dependency cycle through: {}", .cycle.join(", "))]
    CyclicPlan { cycle: Vec<StepKey> },

    #[error("Invalid pipeline definition: {0}")]
    InvalidPipeline(String),

    #[error("Pipeline '{0}' is not registered")]
    PipelineNotFound(String),

    // === Reexecution Errors ===
    #[error(
        "Missing intermediate for step '{step_key}' output '{output_name}' (expected in run {run_id})"
    )]
    MissingIntermediate {
        step_key: StepKey,
        output_name: String,
        run_id: RunId,
    },

    #[error("Run {0} not found")]
    RunNotFound(RunId),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // === Store Errors ===
    #[error("Run {0} already exists")]
    DuplicateRun(RunId),

    #[error("Run {run_id} cannot transition from {from} to {to}")]
    InvalidStatusTransition {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("Intermediate {run_id}/{step_key}/{output_name} was already written")]
    IntermediateAlreadyExists {
        run_id: RunId,
        step_key: StepKey,
        output_name: String,
    },

    #[error("Intermediate {run_id}/{step_key}/{output_name} not found")]
    IntermediateNotFound {
        run_id: RunId,
        step_key: StepKey,
        output_name: String,
    },

    // === Step Errors ===
    #[error("Step '{step_key}' failed: {message}")]
    StepFailed {
        step_key: StepKey,
        message: String,
        retryable: bool,
    },

    #[error("No compute registered for kind '{kind}' (step '{step_key}')")]
    UnknownStepKind { kind: String, step_key: StepKey },

    #[error("Max retries exhausted for step '{step_key}' after {attempts} attempts")]
    RetriesExhausted { step_key: StepKey, attempts: usize },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl LineageError {
    /// Returns `true` if the error is transient and the step may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LineageError::StepFailed { retryable: true, .. })
    }

    /// Returns `true` for errors raised while planning a launch. These are
    /// reported synchronously and never leave a partially-started run behind.
    pub fn is_plan_error(&self) -> bool {
        matches!(
            self,
            LineageError::StepNotFound { .. }
                | LineageError::CyclicPlan { .. }
                | LineageError::InvalidPipeline(_)
                | LineageError::PipelineNotFound(_)
                | LineageError::MissingIntermediate { .. }
                | LineageError::RunNotFound(_)
                | LineageError::InvalidRequest(_)
                | LineageError::DuplicateRun(_)
        )
    }

    /// Stable snake_case identifier used in typed error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            LineageError::StepNotFound { .. } => "step_not_found",
            LineageError::CyclicPlan { .. } => "cyclic_plan",
            LineageError::InvalidPipeline(_) => "invalid_pipeline",
            LineageError::PipelineNotFound(_) => "pipeline_not_found",
            LineageError::MissingIntermediate { .. } => "missing_intermediate",
            LineageError::RunNotFound(_) => "run_not_found",
            LineageError::InvalidRequest(_) => "invalid_request",
            LineageError::DuplicateRun(_) => "duplicate_run",
            LineageError::InvalidStatusTransition { .. } => "invalid_status_transition",
            LineageError::IntermediateAlreadyExists { .. } => "intermediate_already_exists",
            LineageError::IntermediateNotFound { .. } => "intermediate_not_found",
            LineageError::StepFailed { .. } => "step_failed",
            LineageError::UnknownStepKind { .. } => "unknown_step_kind",
            LineageError::RetriesExhausted { .. } => "retries_exhausted",
            LineageError::Io(_) => "io",
            LineageError::Json(_) => "json",
            LineageError::Other(_) => "other",
        }
    }

    /// Shorthand for a step failure raised from compute logic.
    pub fn step_failed(step_key: impl Into<StepKey>, message: impl Into<String>) -> Self {
        LineageError::StepFailed {
            step_key: step_key.into(),
            message: message.into(),
            retryable: false,
        }
    }
}

/// A convenience alias for `Result<T, LineageError>`.
pub type Result<T> = std::result::Result<T, LineageError>;

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

/// Tag selecting resume-from-failure when a reexecution names no step keys.
pub const RESUME_RETRY_TAG: &str = "lineage/is_resume_retry";
/// Tag recording the immediate ancestor of a reexecution run.
pub const PARENT_RUN_ID_TAG: &str = "lineage/parent_run_id";
/// Tag recording the first ancestor of a retry lineage.
pub const ROOT_RUN_ID_TAG: &str = "lineage/root_run_id";
/// Tag recording the id of the process that launched the run.
pub const OWNER_PID_TAG: &str = "lineage/owner_pid";

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Queued,
    Started,
    Success,
    Failure,
    Canceled,
}

impl RunStatus {
    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failure | RunStatus::Canceled
        )
    }

    /// Whether a run in `self` may move to `next`. Status only ever moves forward.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        match self {
            RunStatus::Queued => next != RunStatus::Queued,
            RunStatus::Started => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Queued => "QUEUED",
            RunStatus::Started => "STARTED",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failure => "FAILURE",
            RunStatus::Canceled => "CANCELED",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Generate a fresh run id.
pub fn new_run_id() -> RunId {
    uuid::Uuid::new_v4().to_string()
}

/// One execution attempt of a pipeline (or a subset of it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    /// First ancestor of the retry lineage; equals `run_id` for an original run.
    pub root_run_id: RunId,
    pub parent_run_id: Option<RunId>,
    pub pipeline_name: String,
    pub mode: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Step keys named by the caller; `None` means all steps.
    pub requested_step_keys: Option<Vec<StepKey>>,
    /// Steps this run actually executes after closure and reuse resolution.
    /// `None` for a plain full launch.
    pub step_keys_to_execute: Option<Vec<StepKey>>,
    #[serde(default)]
    pub run_config: serde_json::Value,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
}

impl Run {
    /// A queued original run of `pipeline_name` in the default mode.
    pub fn new(pipeline_name: impl Into<String>) -> Self {
        let run_id = new_run_id();
        Self {
            root_run_id: run_id.clone(),
            run_id,
            parent_run_id: None,
            pipeline_name: pipeline_name.into(),
            mode: "default".into(),
            tags: BTreeMap::new(),
            requested_step_keys: None,
            step_keys_to_execute: None,
            run_config: serde_json::Value::Null,
            status: RunStatus::Queued,
            created_at: Utc::now(),
        }
    }

    /// Replace the generated id. An original run keeps `root_run_id == run_id`.
    pub fn with_run_id(mut self, run_id: impl Into<RunId>) -> Self {
        let run_id = run_id.into();
        if self.parent_run_id.is_none() {
            self.root_run_id = run_id.clone();
        }
        self.run_id = run_id;
        self
    }

    /// Attach this run to `parent`'s lineage. The root is inherited from the parent.
    pub fn with_parent(mut self, parent: &Run) -> Self {
        self.parent_run_id = Some(parent.run_id.clone());
        self.root_run_id = parent.root_run_id.clone();
        self.tags
            .insert(PARENT_RUN_ID_TAG.into(), parent.run_id.clone());
        self.tags
            .insert(ROOT_RUN_ID_TAG.into(), parent.root_run_id.clone());
        self
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_run_config(mut self, config: serde_json::Value) -> Self {
        self.run_config = config;
        self
    }

    pub fn is_resume_retry(&self) -> bool {
        self.tags.get(RESUME_RETRY_TAG).map(String::as_str) == Some("true")
    }

    /// Process that launched the run, when recorded.
    pub fn owner_pid(&self) -> Option<u32> {
        self.tags.get(OWNER_PID_TAG)?.parse().ok()
    }
}

// ---------------------------------------------------------------------------
// StepEvent: append-only lifecycle record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepEventKind {
    RunStarted,
    RunSuccess,
    RunFailure { message: Option<String> },
    RunCanceled,
    Started,
    OutputProduced { output_name: String },
    Succeeded,
    Failed { message: String },
    Skipped { reason: String },
}

impl StepEventKind {
    /// The run status a run-level terminal event records, if any.
    pub fn terminal_run_status(&self) -> Option<RunStatus> {
        match self {
            StepEventKind::RunSuccess => Some(RunStatus::Success),
            StepEventKind::RunFailure { .. } => Some(RunStatus::Failure),
            StepEventKind::RunCanceled => Some(RunStatus::Canceled),
            _ => None,
        }
    }

    /// Whether this kind ends a single step's event sequence.
    pub fn is_step_terminal(&self) -> bool {
        matches!(
            self,
            StepEventKind::Succeeded | StepEventKind::Failed { .. } | StepEventKind::Skipped { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    pub run_id: RunId,
    /// Position in the run's log, assigned by the event store on append.
    #[serde(default)]
    pub sequence: u64,
    /// Absent for run-level events.
    pub step_key: Option<StepKey>,
    pub kind: StepEventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl StepEvent {
    /// A step-scoped event.
    pub fn step(
        run_id: impl Into<RunId>,
        step_key: impl Into<StepKey>,
        kind: StepEventKind,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            sequence: 0,
            step_key: Some(step_key.into()),
            kind,
            timestamp: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    /// A run-scoped event.
    pub fn run(run_id: impl Into<RunId>, kind: StepEventKind) -> Self {
        Self {
            run_id: run_id.into(),
            sequence: 0,
            step_key: None,
            kind,
            timestamp: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_for_step(&self, step_key: &str) -> bool {
        self.step_key.as_deref() == Some(step_key)
    }
}

// ---------------------------------------------------------------------------
// StepState: derived classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepState {
    Succeeded,
    Failed,
    Skipped,
    NotRun,
}

// ---------------------------------------------------------------------------
// Intermediate: persisted step output
// ---------------------------------------------------------------------------

/// Type tag for payloads produced by [`Intermediate::json`].
pub const JSON_TYPE_TAG: &str = "json";

/// Opaque output payload keyed by `(run_id, step_key, output_name)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intermediate {
    pub type_tag: String,
    pub bytes: Vec<u8>,
}

impl Intermediate {
    pub fn new(type_tag: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            type_tag: type_tag.into(),
            bytes,
        }
    }

    /// Encode a JSON value.
    pub fn json(value: &serde_json::Value) -> Result<Self> {
        Ok(Self::new(JSON_TYPE_TAG, serde_json::to_vec(value)?))
    }

    /// Decode the payload as JSON regardless of its tag.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.bytes)?)
    }
}

// ---------------------------------------------------------------------------
// RunStats: summary derived from the event log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub steps_succeeded: usize,
    pub steps_failed: usize,
    pub steps_skipped: usize,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl RunStats {
    pub fn from_events(events: &[StepEvent]) -> Self {
        let mut stats = RunStats::default();
        for event in events {
            match &event.kind {
                StepEventKind::Succeeded => stats.steps_succeeded += 1,
                StepEventKind::Failed { .. } => stats.steps_failed += 1,
                StepEventKind::Skipped { .. } => stats.steps_skipped += 1,
                StepEventKind::RunStarted => stats.start_time = Some(event.timestamp),
                kind if kind.terminal_run_status().is_some() => {
                    stats.end_time = Some(event.timestamp)
                }
                _ => {}
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_step_not_found_names_key() {
        let err = LineageError::StepNotFound {
            step_key: "nope".into(),
        };
        assert_eq!(
            err.to_string(),
            "Can not build subset plan from unknown step: nope"
        );
    }

    #[test]
    fn error_display_cyclic_plan() {
        let err = LineageError::CyclicPlan {
            cycle: vec!["a".into(), "b".into()],
        };
        assert_eq!(
            err.to_string(),
            "Execution plan contains a dependency cycle through: a, b"
        );
    }

    #[test]
    fn error_display_missing_intermediate() {
        let err = LineageError::MissingIntermediate {
            step_key: "spawn".into(),
            output_name: "result".into(),
            run_id: "r1".into(),
        };
        assert_eq!(
            err.to_string(),
            "Missing intermediate for step 'spawn' output 'result' (expected in run r1)"
        );
    }

    #[test]
    fn error_display_status_transition() {
        let err = LineageError::InvalidStatusTransition {
            run_id: "r1".into(),
            from: RunStatus::Success,
            to: RunStatus::Started,
        };
        assert_eq!(
            err.to_string(),
            "Run r1 cannot transition from SUCCESS to STARTED"
        );
    }

    #[test]
    fn retryable_only_when_flagged() {
        let retryable = LineageError::StepFailed {
            step_key: "a".into(),
            message: "flaky".into(),
            retryable: true,
        };
        assert!(retryable.is_retryable());
        assert!(!LineageError::step_failed("a", "boom").is_retryable());
        assert!(!LineageError::Other("x".into()).is_retryable());
    }

    #[test]
    fn plan_errors_are_classified() {
        assert!(LineageError::StepNotFound {
            step_key: "x".into()
        }
        .is_plan_error());
        assert!(LineageError::CyclicPlan { cycle: vec![] }.is_plan_error());
        assert!(LineageError::MissingIntermediate {
            step_key: "a".into(),
            output_name: "result".into(),
            run_id: "r".into(),
        }
        .is_plan_error());
        assert!(!LineageError::step_failed("a", "boom").is_plan_error());
    }

    #[test]
    fn kind_is_stable_snake_case() {
        assert_eq!(
            LineageError::StepNotFound {
                step_key: "x".into()
            }
            .kind(),
            "step_not_found"
        );
        assert_eq!(
            LineageError::CyclicPlan { cycle: vec![] }.kind(),
            "cyclic_plan"
        );
        assert_eq!(LineageError::Other("x".into()).kind(), "other");
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: LineageError = json_err.into();
        assert!(matches!(err, LineageError::Json(_)));
    }

    // --- RunStatus ---

    #[test]
    fn status_transitions_are_monotonic() {
        assert!(RunStatus::Queued.can_transition_to(RunStatus::Started));
        assert!(RunStatus::Queued.can_transition_to(RunStatus::Canceled));
        assert!(RunStatus::Started.can_transition_to(RunStatus::Success));
        assert!(RunStatus::Started.can_transition_to(RunStatus::Canceled));
        assert!(!RunStatus::Started.can_transition_to(RunStatus::Queued));
        assert!(!RunStatus::Success.can_transition_to(RunStatus::Failure));
        assert!(!RunStatus::Canceled.can_transition_to(RunStatus::Started));
    }

    #[test]
    fn status_serializes_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Canceled).unwrap(),
            "\"CANCELED\""
        );
        let s: StepState = serde_json::from_str("\"NOT_RUN\"").unwrap();
        assert_eq!(s, StepState::NotRun);
    }

    // --- Run ---

    #[test]
    fn original_run_is_its_own_root() {
        let run = Run::new("etl").with_run_id("r0");
        assert_eq!(run.run_id, "r0");
        assert_eq!(run.root_run_id, "r0");
        assert!(run.parent_run_id.is_none());
        assert_eq!(run.status, RunStatus::Queued);
    }

    #[test]
    fn child_run_inherits_root_and_tags() {
        let root = Run::new("etl").with_run_id("r0");
        let retry = Run::new("etl").with_run_id("r1").with_parent(&root);
        let retry_two = Run::new("etl").with_parent(&retry).with_run_id("r2");

        assert_eq!(retry_two.parent_run_id.as_deref(), Some("r1"));
        assert_eq!(retry_two.root_run_id, "r0");
        assert_eq!(
            retry_two.tags.get(ROOT_RUN_ID_TAG).map(String::as_str),
            Some("r0")
        );
        assert_eq!(retry_two.run_id, "r2");
    }

    #[test]
    fn resume_retry_tag_is_detected() {
        let run = Run::new("etl").with_tag(RESUME_RETRY_TAG, "true");
        assert!(run.is_resume_retry());
        assert!(!Run::new("etl").is_resume_retry());
    }

    #[test]
    fn owner_pid_tag_is_parsed() {
        let run = Run::new("etl").with_tag(OWNER_PID_TAG, "4242");
        assert_eq!(run.owner_pid(), Some(4242));
        assert_eq!(Run::new("etl").with_tag(OWNER_PID_TAG, "me").owner_pid(), None);
        assert_eq!(Run::new("etl").owner_pid(), None);
    }

    // --- StepEvent ---

    #[test]
    fn event_kind_serializes_with_type_tag() {
        let event = StepEvent::step(
            "r1",
            "sum",
            StepEventKind::OutputProduced {
                output_name: "result".into(),
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"]["type"], "output_produced");
        assert_eq!(json["kind"]["output_name"], "result");
        assert_eq!(json["step_key"], "sum");
    }

    #[test]
    fn terminal_run_status_mapping() {
        assert_eq!(
            StepEventKind::RunCanceled.terminal_run_status(),
            Some(RunStatus::Canceled)
        );
        assert_eq!(StepEventKind::Started.terminal_run_status(), None);
        assert!(StepEventKind::Succeeded.is_step_terminal());
        assert!(!StepEventKind::Started.is_step_terminal());
    }

    // --- Intermediate ---

    #[test]
    fn json_intermediate_decodes() {
        let value = serde_json::json!({"rows": [1, 2, 3]});
        let im = Intermediate::json(&value).unwrap();
        assert_eq!(im.type_tag, JSON_TYPE_TAG);
        assert_eq!(im.to_json().unwrap(), value);
    }

    // --- RunStats ---

    #[test]
    fn stats_count_terminal_step_events() {
        let events = vec![
            StepEvent::run("r", StepEventKind::RunStarted),
            StepEvent::step("r", "a", StepEventKind::Started),
            StepEvent::step("r", "a", StepEventKind::Succeeded),
            StepEvent::step("r", "b", StepEventKind::Started),
            StepEvent::step(
                "r",
                "b",
                StepEventKind::Failed {
                    message: "boom".into(),
                },
            ),
            StepEvent::step(
                "r",
                "c",
                StepEventKind::Skipped {
                    reason: "upstream failed".into(),
                },
            ),
            StepEvent::run("r", StepEventKind::RunFailure { message: None }),
        ];
        let stats = RunStats::from_events(&events);
        assert_eq!(stats.steps_succeeded, 1);
        assert_eq!(stats.steps_failed, 1);
        assert_eq!(stats.steps_skipped, 1);
        assert!(stats.start_time.is_some());
        assert!(stats.end_time.is_some());
    }
}
