//! Execution state persistence on top of the context store.
//!
//! Durability is best effort: every failure is logged and reported as "not
//! stored" / "not found" so a broken or absent store never fails a task.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::core::graph::DependencyGraph;
use crate::core::quality::ImprovementRecord;
use crate::core::state::{ExecutionState, PlanRevision};
use crate::io::store::ContextStore;

pub fn execution_key(task_id: &str) -> String {
    format!("execution:{task_id}")
}

pub fn history_key(task_id: &str, revision: u32) -> String {
    format!("history:{task_id}:{revision:04}")
}

pub fn depgraph_key(project: &str) -> String {
    format!("depgraph:{project}")
}

pub fn improvement_key(path: &str, unix_ts: i64) -> String {
    format!("improvement:{path}:{unix_ts}")
}

/// Typed access to the keys the agent persists.
#[derive(Clone, Default)]
pub struct ExecutionStateStore {
    store: Option<Arc<dyn ContextStore>>,
    ttl: Option<Duration>,
}

impl ExecutionStateStore {
    pub fn new(store: Arc<dyn ContextStore>, ttl: Option<Duration>) -> Self {
        Self {
            store: Some(store),
            ttl,
        }
    }

    /// A store that persists nothing; tasks run without resumability.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    #[instrument(skip(self))]
    pub async fn load(&self, task_id: &str) -> Option<ExecutionState> {
        self.get_json(&execution_key(task_id)).await
    }

    #[instrument(skip_all, fields(task_id = %state.task_id, next_step_index = state.next_step_index))]
    pub async fn save(&self, state: &ExecutionState) -> bool {
        self.put_json(&execution_key(&state.task_id), state).await
    }

    /// Most recent resumable state among tasks whose id starts with `prefix`.
    pub async fn find_resumable(&self, prefix: &str) -> Option<ExecutionState> {
        let keys = self.scan(&format!("execution:{prefix}-*")).await;
        for key in keys.iter().rev() {
            let Some(state) = self.get_json::<ExecutionState>(key).await else {
                continue;
            };
            if state.is_resumable() {
                debug!(task_id = %state.task_id, "found resumable state");
                return Some(state);
            }
        }
        None
    }

    /// Keep a superseded plan and its results under `history:<task_id>:<rev>`.
    pub async fn archive_revision(&self, task_id: &str, revision: &PlanRevision) -> bool {
        self.put_json(&history_key(task_id, revision.revision), revision)
            .await
    }

    /// Archived revisions for `task_id`, oldest first.
    pub async fn history(&self, task_id: &str) -> Vec<PlanRevision> {
        let mut revisions = Vec::new();
        for key in self.scan(&format!("history:{task_id}:*")).await {
            if let Some(revision) = self.get_json::<PlanRevision>(&key).await {
                revisions.push(revision);
            }
        }
        revisions.sort_by_key(|revision| revision.revision);
        revisions
    }

    pub async fn list_task_ids(&self) -> Vec<String> {
        self.scan("execution:*")
            .await
            .into_iter()
            .filter_map(|key| key.strip_prefix("execution:").map(str::to_string))
            .collect()
    }

    pub async fn load_graph(&self, project: &str) -> Option<DependencyGraph> {
        self.get_json(&depgraph_key(project)).await
    }

    pub async fn save_graph(&self, project: &str, graph: &DependencyGraph) -> bool {
        self.put_json(&depgraph_key(project), graph).await
    }

    pub async fn save_improvement(&self, record: &ImprovementRecord, unix_ts: i64) -> bool {
        self.put_json(&improvement_key(&record.path, unix_ts), record)
            .await
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let store = self.store.as_ref()?;
        let value = match store.get(key).await {
            Ok(value) => value?,
            Err(err) => {
                warn!(key, err = %err, "context store read failed");
                return None;
            }
        };
        match serde_json::from_value(value) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                warn!(key, err = %err, "ignoring unreadable stored value");
                None
            }
        }
    }

    async fn put_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
        let Some(store) = self.store.as_ref() else {
            return false;
        };
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(err) => {
                warn!(key, err = %err, "failed to serialize value for store");
                return false;
            }
        };
        match store.put(key, &value, self.ttl).await {
            Ok(()) => true,
            Err(err) => {
                warn!(key, err = %err, "context store write failed");
                false
            }
        }
    }

    async fn scan(&self, pattern: &str) -> Vec<String> {
        let Some(store) = self.store.as_ref() else {
            return Vec::new();
        };
        match store.scan(pattern).await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(pattern, err = %err, "context store scan failed");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::Plan;
    use crate::core::step::Step;
    use crate::core::types::{StepResult, TaskStatus};
    use crate::io::store::MemoryContextStore;

    fn state(task_id: &str, steps: usize, next: usize) -> ExecutionState {
        let mut state = ExecutionState::new(task_id, "task");
        let steps = (0..steps)
            .map(|i| Step::run_command(&format!("s{i}"), "true"))
            .collect();
        state.start_plan(Plan::new("u", steps));
        for index in 0..next {
            state.record(index, StepResult::completed());
        }
        state
    }

    #[tokio::test]
    async fn disabled_store_degrades_to_no_resume() {
        let store = ExecutionStateStore::disabled();
        assert!(!store.save(&state("t-1", 1, 0)).await);
        assert_eq!(store.load("t-1").await, None);
        assert!(store.list_task_ids().await.is_empty());
    }

    #[tokio::test]
    async fn find_resumable_prefers_latest_unfinished_run() {
        let store = ExecutionStateStore::new(Arc::new(MemoryContextStore::new()), None);
        let mut finished = state("task-abc-20240101000002", 1, 1);
        finished.status = TaskStatus::Succeeded;
        store.save(&finished).await;
        store.save(&state("task-abc-20240101000001", 2, 1)).await;
        store.save(&state("other-20240101000003", 2, 0)).await;

        let found = store.find_resumable("task-abc").await.expect("resumable");
        assert_eq!(found.task_id, "task-abc-20240101000001");
        assert_eq!(found.next_step_index, 1);
    }

    #[tokio::test]
    async fn archived_revisions_come_back_in_order() {
        let store = ExecutionStateStore::new(Arc::new(MemoryContextStore::new()), None);
        let mut current = state("t-1", 1, 1);
        for _ in 0..2 {
            let revision = current
                .replace_plan(Plan::new("u", vec![Step::run_command("s", "true")]))
                .expect("previous");
            assert!(store.archive_revision("t-1", &revision).await);
        }
        let history = store.history("t-1").await;
        assert_eq!(
            history.iter().map(|r| r.revision).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(history[0].step_results.len(), 1);
    }

    #[tokio::test]
    async fn graph_snapshot_persists() {
        let store = ExecutionStateStore::new(Arc::new(MemoryContextStore::new()), None);
        let mut graph = DependencyGraph::new();
        graph.add_file("b.py", &[]);
        graph.add_file("a.py", &["b.py".to_string()]);
        assert!(store.save_graph("proj", &graph).await);
        let loaded = store.load_graph("proj").await.expect("graph");
        assert_eq!(loaded.dependencies_of("a.py"), vec!["b.py"]);
    }
}
