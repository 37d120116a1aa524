//! Launch and terminate contract, plus the in-process implementation that
//! runs each launched run as a tokio task.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use lineage_types::{Result, Run, RunId};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::coordinator::RunCoordinator;
use crate::reexecution::EffectivePlan;

#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start executing `run` in the background.
    async fn launch(&self, run: Run, plan: EffectivePlan) -> Result<()>;

    /// Request best-effort termination. Returns `false` when the run is not
    /// active in this launcher.
    async fn terminate(&self, run_id: &str) -> Result<bool>;

    /// Whether the run is still executing somewhere this launcher can see.
    async fn is_alive(&self, run_id: &str) -> bool;
}

struct ActiveRun {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

type ActiveRuns = HashMap<RunId, ActiveRun>;

/// Runs each launched run on the current tokio runtime. A run is tracked only
/// while its task is running.
#[derive(Clone)]
pub struct InProcessLauncher {
    coordinator: RunCoordinator,
    active: Arc<Mutex<ActiveRuns>>,
}

impl InProcessLauncher {
    pub fn new(coordinator: RunCoordinator) -> Self {
        Self {
            coordinator,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn coordinator(&self) -> &RunCoordinator {
        &self.coordinator
    }

    /// Number of runs whose task has not finished.
    pub async fn active_count(&self) -> usize {
        let mut active = self.active.lock().await;
        prune(&mut active);
        active.len()
    }

    /// Abort the run's task outright, leaving whatever it had logged so far.
    /// Simulates the coordinating process dying mid-run.
    pub async fn kill(&self, run_id: &str) -> bool {
        let mut active = self.active.lock().await;
        prune(&mut active);
        match active.get(run_id) {
            Some(run) => {
                run.handle.abort();
                tracing::warn!(run_id = %run_id, "Run task aborted");
                true
            }
            None => false,
        }
    }
}

/// Drop runs whose task ended without removing itself (aborted tasks).
fn prune(active: &mut ActiveRuns) {
    active.retain(|_, run| !run.handle.is_finished());
}

#[async_trait]
impl Launcher for InProcessLauncher {
    async fn launch(&self, run: Run, plan: EffectivePlan) -> Result<()> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let coordinator = self.coordinator.clone();
        let tracked = self.active.clone();
        let run_id = run.run_id.clone();

        // Held across spawn so the task's own removal cannot precede the insert.
        let mut active = self.active.lock().await;
        prune(&mut active);
        let handle = tokio::spawn(async move {
            if let Err(e) = coordinator.execute(&run, &plan, cancel_rx).await {
                tracing::error!(run_id = %run.run_id, error = %e, "Run aborted by an internal error");
                if let Err(e) = coordinator.fail_run(&run.run_id, e.to_string()).await {
                    tracing::error!(run_id = %run.run_id, error = %e, "Could not record run failure");
                }
            }
            tracked.lock().await.remove(&run.run_id);
        });
        active.insert(
            run_id,
            ActiveRun {
                cancel: cancel_tx,
                handle,
            },
        );
        Ok(())
    }

    async fn terminate(&self, run_id: &str) -> Result<bool> {
        let mut active = self.active.lock().await;
        prune(&mut active);
        match active.get(run_id) {
            Some(run) => {
                tracing::info!(run_id = %run_id, "Termination requested");
                Ok(run.cancel.send(true).is_ok())
            }
            None => Ok(false),
        }
    }

    async fn is_alive(&self, run_id: &str) -> bool {
        let mut active = self.active.lock().await;
        prune(&mut active);
        active.contains_key(run_id)
    }
}
