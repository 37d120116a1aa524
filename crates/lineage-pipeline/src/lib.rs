//! Execution planning, reexecution, and run coordination for step pipelines.
//!
//! This crate implements the orchestration core: dependency-closed execution
//! plans, event-log replay into step states, lineage-aware reexecution
//! planning with output reuse, a concurrent run coordinator with
//! cancellation, and in-memory plus filesystem stores.

pub mod compute;
pub mod coordinator;
pub mod definition;
pub mod events;
pub mod instance;
pub mod launcher;
pub mod monitor;
pub mod plan;
pub mod reexecution;
pub mod retry;
pub mod service;
pub mod step_state;
pub mod store;

pub use compute::{
    default_registry, BranchCompute, CollectCompute, ComputeRegistry, FailUnlessCompute,
    StepCompute, StepContext, StepInputs, StepOutputs, ValueCompute,
};
pub use coordinator::{CoordinatorConfig, RunCoordinator, RunResult};
pub use definition::{InputDef, OutputDef, PipelineDefinition, StepDefinition, DEFAULT_OUTPUT};
pub use events::{EventLogStore, EventSubscription, InMemoryEventLog};
pub use instance::{InstanceConfig, LineageInstance};
pub use launcher::{InProcessLauncher, Launcher};
pub use monitor::RunMonitor;
pub use plan::{downstream_closure, topological_order, upstream_closure, ExecutionPlan};
pub use reexecution::{
    plan_reexecution, verify_reuse, AncestorRun, EffectivePlan, LineageHistory, ReexecutionMode,
    ReuseSource, StepDisposition,
};
pub use retry::{execute_with_retry, BackoffPolicy};
pub use service::{ExecutionMetadata, LaunchRequest, LaunchResponse, Orchestrator, ReexecutionInfo};
pub use step_state::{resolve_step_states, RunHistory, StepRecord};
pub use store::{
    FsEventLog, FsIntermediateStore, FsRunStore, InMemoryIntermediateStore, InMemoryRunStore,
    IntermediateStore, RunStore,
};
