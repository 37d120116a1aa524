//! Store wiring: an instance bundles the run store, event log, and
//! intermediate store, either in memory or under a directory on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use lineage_types::Result;
use serde::{Deserialize, Serialize};

use crate::compute::ComputeRegistry;
use crate::coordinator::{CoordinatorConfig, RunCoordinator};
use crate::events::{EventLogStore, InMemoryEventLog};
use crate::launcher::InProcessLauncher;
use crate::service::Orchestrator;
use crate::store::{
    FsEventLog, FsIntermediateStore, FsRunStore, InMemoryIntermediateStore, InMemoryRunStore,
    IntermediateStore, RunStore,
};

/// File name of the optional instance config inside an instance root.
pub const CONFIG_FILE: &str = "lineage.json";

/// Instance settings, loaded from `<root>/lineage.json` when present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Step concurrency limit; the machine's available parallelism when unset.
    pub max_concurrency: Option<usize>,
}

impl InstanceConfig {
    pub async fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(Self::default());
        }
        let json = tokio::fs::read_to_string(&path).await?;
        let config: InstanceConfig = serde_json::from_str(&json)?;
        tracing::debug!(path = %path.display(), ?config, "Instance config loaded");
        Ok(config)
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        let mut config = CoordinatorConfig::default();
        if let Some(limit) = self.max_concurrency {
            config.max_concurrency = limit.max(1);
        }
        config
    }
}

#[derive(Clone)]
pub struct LineageInstance {
    root: Option<PathBuf>,
    config: InstanceConfig,
    runs: Arc<dyn RunStore>,
    event_log: Arc<dyn EventLogStore>,
    intermediates: Arc<dyn IntermediateStore>,
}

impl LineageInstance {
    /// Everything in memory; nothing outlives the process.
    pub fn in_memory() -> Self {
        Self {
            root: None,
            config: InstanceConfig::default(),
            runs: Arc::new(InMemoryRunStore::new()),
            event_log: Arc::new(InMemoryEventLog::new()),
            intermediates: Arc::new(InMemoryIntermediateStore::new()),
        }
    }

    /// Stores under `root`, so runs can be inspected and resumed by later
    /// processes.
    pub async fn open_fs(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        let config = InstanceConfig::load(&root).await?;
        tracing::debug!(root = %root.display(), "Filesystem instance opened");
        Ok(Self {
            runs: Arc::new(FsRunStore::new(&root)),
            event_log: Arc::new(FsEventLog::new(&root)),
            intermediates: Arc::new(FsIntermediateStore::new(&root)),
            root: Some(root),
            config,
        })
    }

    pub fn with_config(mut self, config: InstanceConfig) -> Self {
        self.config = config;
        self
    }

    /// Swap in a different intermediate store (e.g. one that lost data).
    pub fn with_intermediates(mut self, intermediates: Arc<dyn IntermediateStore>) -> Self {
        self.intermediates = intermediates;
        self
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn runs(&self) -> Arc<dyn RunStore> {
        self.runs.clone()
    }

    pub fn event_log(&self) -> Arc<dyn EventLogStore> {
        self.event_log.clone()
    }

    pub fn intermediates(&self) -> Arc<dyn IntermediateStore> {
        self.intermediates.clone()
    }

    pub fn coordinator(&self, registry: Arc<ComputeRegistry>) -> RunCoordinator {
        RunCoordinator::new(
            registry,
            self.event_log.clone(),
            self.runs.clone(),
            self.intermediates.clone(),
            self.config.coordinator_config(),
        )
    }

    /// An orchestrator that executes runs in this process.
    pub fn orchestrator(&self, registry: ComputeRegistry) -> Orchestrator {
        let registry = Arc::new(registry);
        let launcher = Arc::new(InProcessLauncher::new(self.coordinator(registry.clone())));
        self.orchestrator_with_launcher(registry, launcher)
    }

    pub fn orchestrator_with_launcher(
        &self,
        registry: Arc<ComputeRegistry>,
        launcher: Arc<dyn crate::launcher::Launcher>,
    ) -> Orchestrator {
        Orchestrator::new(
            registry,
            self.runs.clone(),
            self.event_log.clone(),
            self.intermediates.clone(),
            launcher,
        )
    }
}
