use std::collections::HashMap;

use async_trait::async_trait;
use lineage_types::{Intermediate, LineageError, Result, Run, RunId, RunStatus};
use tokio::sync::{Mutex, RwLock};

use super::{check_transition, IntermediateStore, RunStore};

#[derive(Debug, Default)]
struct Runs {
    by_id: HashMap<RunId, Run>,
    /// Creation order.
    order: Vec<RunId>,
}

#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: Mutex<Runs>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create_run(&self, run: Run) -> Result<RunId> {
        let mut runs = self.runs.lock().await;
        if runs.by_id.contains_key(&run.run_id) {
            return Err(LineageError::DuplicateRun(run.run_id));
        }
        let run_id = run.run_id.clone();
        runs.order.push(run_id.clone());
        runs.by_id.insert(run_id.clone(), run);
        Ok(run_id)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        Ok(self.runs.lock().await.by_id.get(run_id).cloned())
    }

    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let mut runs = self.runs.lock().await;
        let run = runs
            .by_id
            .get_mut(run_id)
            .ok_or_else(|| LineageError::RunNotFound(run_id.to_string()))?;
        check_transition(run, status)?;
        run.status = status;
        Ok(())
    }

    async fn get_runs_by_root_id(&self, root_run_id: &str) -> Result<Vec<Run>> {
        let runs = self.runs.lock().await;
        Ok(runs
            .order
            .iter()
            .filter_map(|id| runs.by_id.get(id))
            .filter(|r| r.root_run_id == root_run_id)
            .cloned()
            .collect())
    }

    async fn list_runs(&self) -> Result<Vec<Run>> {
        let runs = self.runs.lock().await;
        Ok(runs
            .order
            .iter()
            .filter_map(|id| runs.by_id.get(id))
            .cloned()
            .collect())
    }
}

type IntermediateKey = (RunId, String, String);

fn key(run_id: &str, step_key: &str, output_name: &str) -> IntermediateKey {
    (run_id.to_string(), step_key.to_string(), output_name.to_string())
}

#[derive(Debug, Default)]
pub struct InMemoryIntermediateStore {
    values: RwLock<HashMap<IntermediateKey, Intermediate>>,
}

impl InMemoryIntermediateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored payloads.
    pub async fn len(&self) -> usize {
        self.values.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.values.read().await.is_empty()
    }
}

#[async_trait]
impl IntermediateStore for InMemoryIntermediateStore {
    async fn write(
        &self,
        run_id: &str,
        step_key: &str,
        output_name: &str,
        value: Intermediate,
    ) -> Result<()> {
        let mut values = self.values.write().await;
        let k = key(run_id, step_key, output_name);
        if values.contains_key(&k) {
            return Err(LineageError::IntermediateAlreadyExists {
                run_id: run_id.to_string(),
                step_key: step_key.to_string(),
                output_name: output_name.to_string(),
            });
        }
        values.insert(k, value);
        Ok(())
    }

    async fn exists(&self, run_id: &str, step_key: &str, output_name: &str) -> Result<bool> {
        Ok(self
            .values
            .read()
            .await
            .contains_key(&key(run_id, step_key, output_name)))
    }

    async fn read(&self, run_id: &str, step_key: &str, output_name: &str) -> Result<Intermediate> {
        self.values
            .read()
            .await
            .get(&key(run_id, step_key, output_name))
            .cloned()
            .ok_or_else(|| LineageError::IntermediateNotFound {
                run_id: run_id.to_string(),
                step_key: step_key.to_string(),
                output_name: output_name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_round_trip_and_duplicate_rejection() {
        let store = InMemoryRunStore::new();
        let run = Run::new("etl").with_run_id("r0");
        store.create_run(run.clone()).await.unwrap();

        assert_eq!(store.get_run("r0").await.unwrap(), Some(run.clone()));
        assert!(store.get_run("nope").await.unwrap().is_none());
        assert!(matches!(
            store.create_run(run).await,
            Err(LineageError::DuplicateRun(id)) if id == "r0"
        ));
    }

    #[tokio::test]
    async fn status_moves_forward_only() {
        let store = InMemoryRunStore::new();
        store
            .create_run(Run::new("etl").with_run_id("r0"))
            .await
            .unwrap();
        store
            .update_run_status("r0", RunStatus::Started)
            .await
            .unwrap();
        store
            .update_run_status("r0", RunStatus::Canceled)
            .await
            .unwrap();

        let err = store
            .update_run_status("r0", RunStatus::Success)
            .await
            .unwrap_err();
        assert!(matches!(err, LineageError::InvalidStatusTransition { .. }));
        assert_eq!(
            store.get_run("r0").await.unwrap().unwrap().status,
            RunStatus::Canceled
        );
    }

    #[tokio::test]
    async fn runs_by_root_are_in_creation_order() {
        let store = InMemoryRunStore::new();
        let root = Run::new("etl").with_run_id("r0");
        let one = Run::new("etl").with_run_id("r1").with_parent(&root);
        let two = Run::new("etl").with_run_id("r2").with_parent(&one);
        let unrelated = Run::new("etl").with_run_id("x");
        for run in [root, one, unrelated, two] {
            store.create_run(run).await.unwrap();
        }

        let ids: Vec<String> = store
            .get_runs_by_root_id("r0")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        assert_eq!(ids, vec!["r0", "r1", "r2"]);
        assert_eq!(store.list_runs().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn intermediates_are_write_once() {
        let store = InMemoryIntermediateStore::new();
        let value = Intermediate::json(&serde_json::json!(1)).unwrap();
        store.write("r0", "a", "result", value.clone()).await.unwrap();

        assert!(store.exists("r0", "a", "result").await.unwrap());
        assert!(!store.exists("r1", "a", "result").await.unwrap());
        assert_eq!(store.read("r0", "a", "result").await.unwrap(), value);

        let err = store
            .write("r0", "a", "result", value)
            .await
            .unwrap_err();
        assert!(matches!(err, LineageError::IntermediateAlreadyExists { .. }));

        let err = store.read("r1", "a", "result").await.unwrap_err();
        assert!(matches!(err, LineageError::IntermediateNotFound { .. }));
    }
}
