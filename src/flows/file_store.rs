use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use super::FlowDefinition;
use super::store::{Store, StoreError, StoreResult};
use crate::executions::{
    EventRange, Execution, ExecutionEvent, ExecutionStatus, NodeExecutionState,
};

/// File-backed store. Everything lives in memory behind `RwLock`s and is
/// written through to disk:
///
/// - `flows/{id}.json`
/// - `executions/{id}.json`
/// - `events/{execution_id}.jsonl`, one event per line in index order
pub struct FileStore {
    base_dir: PathBuf,
    flows: RwLock<HashMap<String, FlowDefinition>>,
    executions: RwLock<HashMap<String, Execution>>,
    events: RwLock<HashMap<String, Vec<ExecutionEvent>>>,
}

impl FileStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            flows: RwLock::new(HashMap::new()),
            executions: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
        }
    }

    fn flows_dir(&self) -> PathBuf {
        self.base_dir.join("flows")
    }

    fn executions_dir(&self) -> PathBuf {
        self.base_dir.join("executions")
    }

    fn events_dir(&self) -> PathBuf {
        self.base_dir.join("events")
    }

    fn execution_path(&self, id: &str) -> PathBuf {
        self.executions_dir().join(format!("{id}.json"))
    }
}

/// Atomic write via temp file + rename.
fn write_json<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(value)?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Replace an event log with `events`, one per line, via temp file + rename.
fn rewrite_log(path: &Path, events: &[ExecutionEvent]) -> StoreResult<()> {
    let mut content = String::new();
    for event in events {
        content.push_str(&serde_json::to_string(event)?);
        content.push('\n');
    }
    let tmp_path = path.with_extension("jsonl.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn json_files(dir: &Path, extension: &str) -> anyhow::Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory: {}", dir.display()))?;
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory: {}", dir.display()))?
    {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some(extension) {
            paths.push(path);
        }
    }
    Ok(paths)
}

fn read_record<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<T>(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to parse record file");
                None
            }
        },
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read record file");
            None
        }
    }
}

#[async_trait]
impl Store for FileStore {
    async fn list_flows(&self) -> Vec<FlowDefinition> {
        let mut flows: Vec<_> = self.flows.read().await.values().cloned().collect();
        flows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        flows
    }

    async fn get_flow(&self, id: &str) -> Option<FlowDefinition> {
        self.flows.read().await.get(id).cloned()
    }

    async fn save_flow(&self, flow: FlowDefinition) -> StoreResult<()> {
        let mut flows = self.flows.write().await;
        if let Some(stored) = flows.get(&flow.id) {
            if stored.version >= flow.version {
                return Err(StoreError::Conflict(format!(
                    "flow {} is already at version {}",
                    flow.id, stored.version
                )));
            }
        }
        let path = self.flows_dir().join(format!("{}.json", flow.id));
        write_json(&path, &flow)?;
        flows.insert(flow.id.clone(), flow);
        Ok(())
    }

    async fn delete_flow(&self, id: &str) -> StoreResult<bool> {
        let existed = self.flows.write().await.remove(id).is_some();
        let path = self.flows_dir().join(format!("{id}.json"));
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(existed)
    }

    async fn create_execution(&self, execution: Execution) -> StoreResult<()> {
        let mut executions = self.executions.write().await;
        if executions.contains_key(&execution.id) {
            return Err(StoreError::Conflict(format!(
                "execution {} already exists",
                execution.id
            )));
        }
        write_json(&self.execution_path(&execution.id), &execution)?;
        tracing::debug!(
            execution_id = %execution.id,
            composite = execution.is_composite(),
            "Created execution"
        );
        executions.insert(execution.id.clone(), execution);
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> StoreResult<Option<Execution>> {
        Ok(self.executions.read().await.get(id).cloned())
    }

    async fn set_execution_status(
        &self,
        id: &str,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> StoreResult<()> {
        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(id)
            .ok_or_else(|| StoreError::execution_not_found(id))?;
        execution.transition(status, error);
        write_json(&self.execution_path(id), &*execution)
    }

    async fn push_node_execution(
        &self,
        execution_id: &str,
        node: NodeExecutionState,
    ) -> StoreResult<()> {
        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(execution_id)
            .ok_or_else(|| StoreError::execution_not_found(execution_id))?;
        execution.node_executions.push(node);
        write_json(&self.execution_path(execution_id), &*execution)
    }

    async fn complete_node_execution(
        &self,
        execution_id: &str,
        node_id: &str,
        status: ExecutionStatus,
    ) -> StoreResult<()> {
        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(execution_id)
            .ok_or_else(|| StoreError::execution_not_found(execution_id))?;
        let node = execution
            .node_executions
            .iter_mut()
            .rev()
            .find(|n| n.node_id == node_id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "node execution",
                id: format!("{execution_id}/{node_id}"),
            })?;

        let now = Utc::now();
        node.status = status;
        node.completed_at = Some(now);
        node.duration_ms = node
            .started_at
            .map(|started| (now - started).num_milliseconds());
        write_json(&self.execution_path(execution_id), &*execution)
    }

    async fn append_event(
        &self,
        execution_id: &str,
        event_type: &str,
        data: Value,
    ) -> StoreResult<u64> {
        if !self.executions.read().await.contains_key(execution_id) {
            return Err(StoreError::execution_not_found(execution_id));
        }

        let mut events = self.events.write().await;
        let log = events.entry(execution_id.to_string()).or_default();
        let event = ExecutionEvent {
            execution_id: execution_id.to_string(),
            index: log.len() as u64,
            event_type: event_type.to_string(),
            data,
            created_at: Utc::now(),
        };

        let dir = self.events_dir();
        std::fs::create_dir_all(&dir)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{execution_id}.jsonl")))?;
        writeln!(file, "{}", serde_json::to_string(&event)?)?;

        let index = event.index;
        log.push(event);
        Ok(index)
    }

    async fn list_events(
        &self,
        execution_id: &str,
        range: EventRange,
    ) -> StoreResult<Vec<ExecutionEvent>> {
        let events = self.events.read().await;
        Ok(events
            .get(execution_id)
            .map(|log| {
                log.iter()
                    .filter(|e| range.contains(e.index))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn load_all(&self) -> anyhow::Result<()> {
        let mut flows = HashMap::new();
        for path in json_files(&self.flows_dir(), "json")? {
            if let Some(flow) = read_record::<FlowDefinition>(&path) {
                flows.insert(flow.id.clone(), flow);
            }
        }

        let mut executions = HashMap::new();
        for path in json_files(&self.executions_dir(), "json")? {
            if let Some(execution) = read_record::<Execution>(&path) {
                executions.insert(execution.id.clone(), execution);
            }
        }

        let mut events: HashMap<String, Vec<ExecutionEvent>> = HashMap::new();
        for path in json_files(&self.events_dir(), "jsonl")? {
            let Some(execution_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read event log: {}", path.display()))?;
            let mut log = Vec::new();
            let mut torn = false;
            for (line_no, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<ExecutionEvent>(line) {
                    Ok(event) => log.push(event),
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            line = line_no + 1,
                            error = %e,
                            "truncating event log"
                        );
                        torn = true;
                        break;
                    }
                }
            }
            // The next append must not land after the torn bytes.
            if torn {
                rewrite_log(&path, &log).with_context(|| {
                    format!("failed to truncate event log: {}", path.display())
                })?;
            }
            events.insert(execution_id.to_string(), log);
        }

        tracing::info!(
            flows = flows.len(),
            executions = executions.len(),
            event_logs = events.len(),
            "Loaded store"
        );
        *self.flows.write().await = flows;
        *self.executions.write().await = executions;
        *self.events.write().await = events;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn test_flow(id: &str, name: &str) -> FlowDefinition {
        serde_json::from_value(json!({
            "id": id,
            "name": name,
            "nodes": [{"id": "s", "type": "source"}, {"id": "k", "type": "sink"}],
            "edges": [{"id": "e1", "source": "s", "target": "k"}]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_flow_crud_and_reload() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.load_all().await.unwrap();

        store.save_flow(test_flow("f1", "Flow 1")).await.unwrap();
        store.save_flow(test_flow("f2", "Flow 2")).await.unwrap();
        assert_eq!(store.list_flows().await.len(), 2);

        assert!(store.delete_flow("f2").await.unwrap());
        assert!(!store.delete_flow("f2").await.unwrap());
        assert!(!dir.path().join("flows/f2.json").exists());

        let reloaded = FileStore::new(dir.path());
        reloaded.load_all().await.unwrap();
        let flow = reloaded.get_flow("f1").await.unwrap();
        assert_eq!(flow.name, "Flow 1");
        assert_eq!(flow.nodes.len(), 2);
        assert!(reloaded.get_flow("f2").await.is_none());
    }

    #[tokio::test]
    async fn test_event_indices_are_sequential_and_survive_reload() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.load_all().await.unwrap();
        store
            .create_execution(Execution::for_block("x1", "b1", Value::Null))
            .await
            .unwrap();

        for i in 0..4 {
            let index = store
                .append_event("x1", "progress", json!({"step": i}))
                .await
                .unwrap();
            assert_eq!(index, i);
        }

        let tail = store.list_events("x1", EventRange::After(1)).await.unwrap();
        assert_eq!(tail.iter().map(|e| e.index).collect::<Vec<_>>(), vec![2, 3]);

        let reloaded = FileStore::new(dir.path());
        reloaded.load_all().await.unwrap();
        let all = reloaded.list_events("x1", EventRange::From(0)).await.unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[3].data["step"], 3);
        assert_eq!(
            reloaded.append_event("x1", "done", Value::Null).await.unwrap(),
            4
        );
    }

    #[tokio::test]
    async fn test_torn_line_is_cut_before_next_append() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store
            .create_execution(Execution::for_block("x1", "b1", Value::Null))
            .await
            .unwrap();
        store.append_event("x1", "a", Value::Null).await.unwrap();
        store.append_event("x1", "b", Value::Null).await.unwrap();

        let log_path = dir.path().join("events/x1.jsonl");
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&log_path)
            .unwrap();
        file.write_all(br#"{"executionId":"x1","ind"#).unwrap();
        drop(file);

        let reloaded = FileStore::new(dir.path());
        reloaded.load_all().await.unwrap();
        assert_eq!(reloaded.append_event("x1", "c", Value::Null).await.unwrap(), 2);

        let again = FileStore::new(dir.path());
        again.load_all().await.unwrap();
        let events: Vec<_> = again
            .list_events("x1", EventRange::From(0))
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.index, e.event_type))
            .collect();
        assert_eq!(
            events,
            vec![(0, "a".to_string()), (1, "b".to_string()), (2, "c".to_string())]
        );
        assert_eq!(again.append_event("x1", "d", Value::Null).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_stale_flow_version_conflicts() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let mut flow = test_flow("f1", "Flow 1");
        flow.version = 1;
        store.save_flow(flow.clone()).await.unwrap();

        flow.version = 2;
        store.save_flow(flow.clone()).await.unwrap();

        let err = store.save_flow(flow.clone()).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(err.to_string(), "conflict: flow f1 is already at version 2");
    }

    #[tokio::test]
    async fn test_append_to_unknown_execution_fails() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.load_all().await.unwrap();

        let err = store
            .append_event("ghost", "progress", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: "execution", .. }));
        assert!(store
            .list_events("ghost", EventRange::From(0))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_execution_conflicts() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store
            .create_execution(Execution::for_block("x1", "b1", Value::Null))
            .await
            .unwrap();
        let err = store
            .create_execution(Execution::for_block("x1", "b1", Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_execution_lifecycle() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store
            .create_execution(Execution::for_flow("x1", "f1", Value::Null))
            .await
            .unwrap();

        store
            .set_execution_status("x1", ExecutionStatus::Running, None)
            .await
            .unwrap();
        store
            .push_node_execution("x1", NodeExecutionState::started("x1-a", "a"))
            .await
            .unwrap();
        store
            .complete_node_execution("x1", "a", ExecutionStatus::Completed)
            .await
            .unwrap();
        store
            .set_execution_status("x1", ExecutionStatus::Completed, None)
            .await
            .unwrap();

        let reloaded = FileStore::new(dir.path());
        reloaded.load_all().await.unwrap();
        let exec = reloaded.get_execution("x1").await.unwrap().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert!(exec.completed_at.is_some());
        assert_eq!(exec.node_executions[0].status, ExecutionStatus::Completed);
        assert!(exec.node_executions[0].duration_ms.is_some());

        let err = store
            .complete_node_execution("x1", "missing", ExecutionStatus::Failed)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "node execution not found: x1/missing");
    }
}
