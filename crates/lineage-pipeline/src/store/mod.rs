//! Narrow persistence interfaces for runs and step outputs, plus in-memory
//! and filesystem implementations.

pub mod fs;
pub mod memory;

use async_trait::async_trait;
use lineage_types::{Intermediate, Result, Run, RunId, RunStatus};

pub use fs::{FsEventLog, FsIntermediateStore, FsRunStore};
pub use memory::{InMemoryIntermediateStore, InMemoryRunStore};

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persist a new run. Fails with `DuplicateRun` if the id is taken.
    async fn create_run(&self, run: Run) -> Result<RunId>;

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>>;

    /// Move a run forward. Fails with `InvalidStatusTransition` when the
    /// current status does not allow `status` (terminal runs never change).
    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<()>;

    /// Every run of a retry lineage, in creation order.
    async fn get_runs_by_root_id(&self, root_run_id: &str) -> Result<Vec<Run>>;

    /// Every run, in creation order.
    async fn list_runs(&self) -> Result<Vec<Run>>;
}

/// Output artifacts keyed by `(run_id, step_key, output_name)`. Each key is
/// written at most once; payloads are never interpreted.
#[async_trait]
pub trait IntermediateStore: Send + Sync {
    async fn write(
        &self,
        run_id: &str,
        step_key: &str,
        output_name: &str,
        value: Intermediate,
    ) -> Result<()>;

    async fn exists(&self, run_id: &str, step_key: &str, output_name: &str) -> Result<bool>;

    async fn read(&self, run_id: &str, step_key: &str, output_name: &str) -> Result<Intermediate>;
}

/// Shared transition check for run store implementations.
pub(crate) fn check_transition(run: &Run, next: RunStatus) -> Result<()> {
    if run.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(lineage_types::LineageError::InvalidStatusTransition {
            run_id: run.run_id.clone(),
            from: run.status,
            to: next,
        })
    }
}
