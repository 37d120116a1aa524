//! Detects runs whose coordinating process died.
//!
//! A run left STARTED after its launcher stopped tracking it can never
//! reach a terminal status on its own. The monitor marks such runs FAILURE;
//! their dangling steps stay NOT_RUN, so a resume re-executes them.
//!
//! Runs are tagged with the id of the process that launched them. A run owned
//! by another process that is still alive is left alone, so a sweep from one
//! CLI invocation never fails a run another invocation is driving.

use std::sync::Arc;

use lineage_types::{Result, Run, RunId, RunStatus, StepEvent, StepEventKind};

use crate::events::EventLogStore;
use crate::launcher::Launcher;
use crate::step_state::RunHistory;
use crate::store::RunStore;

pub struct RunMonitor {
    runs: Arc<dyn RunStore>,
    event_log: Arc<dyn EventLogStore>,
    launcher: Arc<dyn Launcher>,
}

impl RunMonitor {
    pub fn new(
        runs: Arc<dyn RunStore>,
        event_log: Arc<dyn EventLogStore>,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        Self {
            runs,
            event_log,
            launcher,
        }
    }

    /// Fail every STARTED run that neither this launcher nor a live owning
    /// process is still driving. Returns the ids of the runs it marked.
    pub async fn sweep(&self) -> Result<Vec<RunId>> {
        let mut failed = Vec::new();
        for run in self.runs.list_runs().await? {
            if run.status != RunStatus::Started || self.launcher.is_alive(&run.run_id).await {
                continue;
            }
            if owned_elsewhere(&run) {
                tracing::debug!(run_id = %run.run_id, owner_pid = ?run.owner_pid(), "Run owned by a live process, skipping");
                continue;
            }
            let events = self.event_log.get_events(&run.run_id).await?;
            let history = RunHistory::from_events(&events);
            let dangling = history.dangling_steps();
            tracing::warn!(run_id = %run.run_id, dangling = ?dangling, "Run process is gone, marking run failed");

            self.runs
                .update_run_status(&run.run_id, RunStatus::Failure)
                .await?;
            if history.terminal_status().is_none() {
                let message = if dangling.is_empty() {
                    "run process exited unexpectedly".to_string()
                } else {
                    format!(
                        "run process exited unexpectedly while running: {}",
                        dangling.join(", ")
                    )
                };
                self.event_log
                    .append_event(StepEvent::run(
                        &run.run_id,
                        StepEventKind::RunFailure {
                            message: Some(message),
                        },
                    ))
                    .await?;
            }
            failed.push(run.run_id);
        }
        Ok(failed)
    }
}

/// The run was launched by a different process that still exists.
fn owned_elsewhere(run: &Run) -> bool {
    run.owner_pid()
        .is_some_and(|pid| pid != std::process::id() && process_alive(pid))
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // Signal 0 checks existence without delivering anything.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}
