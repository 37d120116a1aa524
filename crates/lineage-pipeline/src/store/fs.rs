//! Filesystem-backed stores.
//!
//! Layout under an instance root:
//!
//! ```text
//! runs/<run_id>.json                      run records
//! events/<run_id>.jsonl                   one StepEvent per line
//! storage/<run_id>/<step_key>/<output>    intermediate payload bytes
//! storage/<run_id>/<step_key>/<output>.type_tag
//! ```

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use lineage_types::{
    Intermediate, LineageError, Result, Run, RunId, RunStatus, StepEvent, JSON_TYPE_TAG,
};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{check_transition, IntermediateStore, RunStore};
use crate::events::{EventLogStore, EventSubscription, RunLog};

const TYPE_TAG_SUFFIX: &str = "type_tag";

/// Reject keys that would escape their directory.
fn path_segment<'a>(kind: &str, value: &'a str) -> Result<&'a str> {
    if value.is_empty() || value == "." || value == ".." || value.contains(['/', '\\']) {
        return Err(LineageError::InvalidRequest(format!(
            "{kind} '{value}' cannot be used as a storage path segment"
        )));
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// Run records as pretty JSON files, one per run.
#[derive(Debug)]
pub struct FsRunStore {
    dir: PathBuf,
    /// Serializes read-modify-write cycles on run files.
    lock: Mutex<()>,
}

impl FsRunStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            dir: root.as_ref().join("runs"),
            lock: Mutex::new(()),
        }
    }

    fn run_path(&self, run_id: &str) -> Result<PathBuf> {
        Ok(self
            .dir
            .join(format!("{}.json", path_segment("run id", run_id)?)))
    }

    async fn write_run(&self, run: &Run) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_string_pretty(run)?;
        tokio::fs::write(self.run_path(&run.run_id)?, json).await?;
        Ok(())
    }

    async fn read_run(&self, run_id: &str) -> Result<Option<Run>> {
        let path = self.run_path(run_id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_all(&self) -> Result<Vec<Run>> {
        let mut runs = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(runs),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let json = tokio::fs::read_to_string(&path).await?;
            runs.push(serde_json::from_str::<Run>(&json)?);
        }
        runs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(runs)
    }
}

#[async_trait]
impl RunStore for FsRunStore {
    async fn create_run(&self, run: Run) -> Result<RunId> {
        let _guard = self.lock.lock().await;
        if self.read_run(&run.run_id).await?.is_some() {
            return Err(LineageError::DuplicateRun(run.run_id));
        }
        self.write_run(&run).await?;
        tracing::debug!(run_id = %run.run_id, "Run record written");
        Ok(run.run_id)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        self.read_run(run_id).await
    }

    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut run = self
            .read_run(run_id)
            .await?
            .ok_or_else(|| LineageError::RunNotFound(run_id.to_string()))?;
        check_transition(&run, status)?;
        run.status = status;
        self.write_run(&run).await
    }

    async fn get_runs_by_root_id(&self, root_run_id: &str) -> Result<Vec<Run>> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|r| r.root_run_id == root_run_id)
            .collect())
    }

    async fn list_runs(&self) -> Result<Vec<Run>> {
        self.read_all().await
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// JSON-lines event log. An unfinished run's log is kept in memory so live
/// subscribers can be fanned out to; it is dropped once the run's terminal
/// event is written and later reads go to disk.
#[derive(Debug)]
pub struct FsEventLog {
    dir: PathBuf,
    runs: Mutex<HashMap<RunId, RunLog>>,
}

impl FsEventLog {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            dir: root.as_ref().join("events"),
            runs: Mutex::new(HashMap::new()),
        }
    }

    fn log_path(&self, run_id: &str) -> Result<PathBuf> {
        Ok(self
            .dir
            .join(format!("{}.jsonl", path_segment("run id", run_id)?)))
    }

    async fn load(&self, run_id: &str) -> Result<Vec<StepEvent>> {
        let path = self.log_path(run_id)?;
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut events = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            events.push(serde_json::from_str::<StepEvent>(line)?);
        }
        Ok(events)
    }

    async fn cached<'a>(
        &self,
        runs: &'a mut HashMap<RunId, RunLog>,
        run_id: &str,
    ) -> Result<&'a mut RunLog> {
        if !runs.contains_key(run_id) {
            let events = self.load(run_id).await?;
            runs.insert(run_id.to_string(), RunLog::from_events(events));
        }
        runs.get_mut(run_id)
            .ok_or_else(|| LineageError::Other(format!("event log cache lost run {run_id}")))
    }
}

#[async_trait]
impl EventLogStore for FsEventLog {
    async fn append_event(&self, event: StepEvent) -> Result<StepEvent> {
        let mut runs = self.runs.lock().await;
        let path = self.log_path(&event.run_id)?;
        let log = self.cached(&mut runs, &event.run_id).await?;

        // Persist before fan-out so subscribers never see an unwritten event.
        let mut pending = event;
        pending.sequence = log.events().len() as u64;
        let mut line = serde_json::to_string(&pending)?;
        line.push('\n');
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        let event = log.push(pending);
        let closed = log.is_closed();
        tracing::trace!(run_id = %event.run_id, sequence = event.sequence, kind = ?event.kind, "Event appended");
        if closed {
            runs.remove(&event.run_id);
        }
        Ok(event)
    }

    async fn get_events(&self, run_id: &str) -> Result<Vec<StepEvent>> {
        let runs = self.runs.lock().await;
        match runs.get(run_id) {
            Some(log) => Ok(log.events().to_vec()),
            None => self.load(run_id).await,
        }
    }

    async fn subscribe(&self, run_id: &str) -> Result<EventSubscription> {
        let mut runs = self.runs.lock().await;
        if let Some(log) = runs.get_mut(run_id) {
            return Ok(log.subscribe());
        }
        let mut log = RunLog::from_events(self.load(run_id).await?);
        let subscription = log.subscribe();
        if !log.is_closed() {
            runs.insert(run_id.to_string(), log);
        }
        Ok(subscription)
    }
}

// ---------------------------------------------------------------------------
// Intermediates
// ---------------------------------------------------------------------------

/// Payload files under `storage/`. Files are created with `create_new`, so
/// a second write to the same key fails instead of overwriting.
#[derive(Debug, Clone)]
pub struct FsIntermediateStore {
    dir: PathBuf,
}

impl FsIntermediateStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            dir: root.as_ref().join("storage"),
        }
    }

    fn paths(&self, run_id: &str, step_key: &str, output_name: &str) -> Result<(PathBuf, PathBuf)> {
        let step_dir = self
            .dir
            .join(path_segment("run id", run_id)?)
            .join(path_segment("step key", step_key)?);
        let output = path_segment("output name", output_name)?;
        Ok((
            step_dir.join(output),
            step_dir.join(format!("{output}.{TYPE_TAG_SUFFIX}")),
        ))
    }
}

#[async_trait]
impl IntermediateStore for FsIntermediateStore {
    async fn write(
        &self,
        run_id: &str,
        step_key: &str,
        output_name: &str,
        value: Intermediate,
    ) -> Result<()> {
        let (payload, tag) = self.paths(run_id, step_key, output_name)?;
        if let Some(parent) = payload.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&payload)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(LineageError::IntermediateAlreadyExists {
                    run_id: run_id.to_string(),
                    step_key: step_key.to_string(),
                    output_name: output_name.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(&value.bytes).await?;
        file.flush().await?;
        tokio::fs::write(&tag, value.type_tag.as_bytes()).await?;
        tracing::debug!(path = %payload.display(), "Intermediate written");
        Ok(())
    }

    async fn exists(&self, run_id: &str, step_key: &str, output_name: &str) -> Result<bool> {
        let (payload, _) = self.paths(run_id, step_key, output_name)?;
        Ok(tokio::fs::try_exists(&payload).await?)
    }

    async fn read(&self, run_id: &str, step_key: &str, output_name: &str) -> Result<Intermediate> {
        let (payload, tag) = self.paths(run_id, step_key, output_name)?;
        let bytes = match tokio::fs::read(&payload).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(LineageError::IntermediateNotFound {
                    run_id: run_id.to_string(),
                    step_key: step_key.to_string(),
                    output_name: output_name.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let type_tag = match tokio::fs::read_to_string(&tag).await {
            Ok(tag) => tag,
            Err(e) if e.kind() == ErrorKind::NotFound => JSON_TYPE_TAG.to_string(),
            Err(e) => return Err(e.into()),
        };
        Ok(Intermediate::new(type_tag, bytes))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use lineage_types::StepEventKind;

    #[tokio::test]
    async fn run_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let root = Run::new("etl").with_run_id("r0");
        let child = Run::new("etl").with_run_id("r1").with_parent(&root);

        {
            let store = FsRunStore::new(dir.path());
            store.create_run(root.clone()).await.unwrap();
            store.create_run(child.clone()).await.unwrap();
            store
                .update_run_status("r0", RunStatus::Started)
                .await
                .unwrap();
            store
                .update_run_status("r0", RunStatus::Failure)
                .await
                .unwrap();
        }

        let store = FsRunStore::new(dir.path());
        let loaded = store.get_run("r0").await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Failure);

        let lineage: Vec<String> = store
            .get_runs_by_root_id("r0")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        assert_eq!(lineage, vec!["r0", "r1"]);

        assert!(matches!(
            store.create_run(child).await,
            Err(LineageError::DuplicateRun(_))
        ));
        assert!(matches!(
            store.update_run_status("r0", RunStatus::Success).await,
            Err(LineageError::InvalidStatusTransition { .. })
        ));
    }

    #[tokio::test]
    async fn list_runs_on_empty_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRunStore::new(dir.path());
        assert!(store.list_runs().await.unwrap().is_empty());
        assert!(matches!(
            store.update_run_status("ghost", RunStatus::Started).await,
            Err(LineageError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn event_log_is_replayed_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = FsEventLog::new(dir.path());
            log.append_event(StepEvent::run("r0", StepEventKind::RunStarted))
                .await
                .unwrap();
            log.append_event(StepEvent::step("r0", "a", StepEventKind::Started))
                .await
                .unwrap();
        }

        let log = FsEventLog::new(dir.path());
        let events = log.get_events("r0").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].step_key.as_deref(), Some("a"));

        // Sequence numbering continues after a reopen.
        let next = log
            .append_event(StepEvent::run("r0", StepEventKind::RunSuccess))
            .await
            .unwrap();
        assert_eq!(next.sequence, 2);

        let seen = log.subscribe("r0").await.unwrap().collect().await;
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn finished_runs_leave_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let log = FsEventLog::new(dir.path());
        log.append_event(StepEvent::run("r0", StepEventKind::RunStarted))
            .await
            .unwrap();
        let mut live = log.subscribe("r0").await.unwrap();
        assert!(log.runs.lock().await.contains_key("r0"));

        log.append_event(StepEvent::run("r0", StepEventKind::RunSuccess))
            .await
            .unwrap();
        assert!(log.runs.lock().await.is_empty());
        assert!(live.next().await.is_some());
        assert!(matches!(
            live.next().await.map(|e| e.kind),
            Some(StepEventKind::RunSuccess)
        ));
        assert!(live.next().await.is_none());

        // Reads of a finished run come from disk without re-caching it.
        assert_eq!(log.get_events("r0").await.unwrap().len(), 2);
        assert_eq!(log.subscribe("r0").await.unwrap().collect().await.len(), 2);
        assert!(log.runs.lock().await.is_empty());
    }

    #[tokio::test]
    async fn intermediates_are_write_once_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsIntermediateStore::new(dir.path());
        let value = Intermediate::new("text", b"hello".to_vec());

        store.write("r0", "a", "result", value.clone()).await.unwrap();
        assert!(dir.path().join("storage/r0/a/result").exists());
        assert!(store.exists("r0", "a", "result").await.unwrap());
        assert_eq!(store.read("r0", "a", "result").await.unwrap(), value);

        assert!(matches!(
            store.write("r0", "a", "result", value).await,
            Err(LineageError::IntermediateAlreadyExists { .. })
        ));
        assert!(!store.exists("r0", "a", "other").await.unwrap());
        assert!(matches!(
            store.read("r0", "a", "other").await,
            Err(LineageError::IntermediateNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn path_escaping_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsIntermediateStore::new(dir.path());
        let err = store
            .write("r0", "../evil", "result", Intermediate::new("text", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, LineageError::InvalidRequest(_)));
    }
}
