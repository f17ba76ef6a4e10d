//! Durable checkpointing of task and worker state.
//!
//! Two keyspaces share one backend: `task:<id>` holds the latest task
//! snapshot, `thread:<id>` holds the worker's opaque conversational
//! state. An injective `map:task:<id>` / `map:thread:<id>` pair links
//! them; neither side holds a reference to the other at rest, both are
//! rehydrated by id.

mod backend;
mod sync;

pub use backend::{KeyValueBackend, MemoryBackend};
pub use sync::{build_synchronizer, CheckpointSynchronizer};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::RetentionConfig;
use crate::error::{CoreError, Result};
use crate::types::{Task, TaskState};

const TASK_PREFIX: &str = "task:";
const THREAD_PREFIX: &str = "thread:";
const MAP_TASK_PREFIX: &str = "map:task:";
const MAP_THREAD_PREFIX: &str = "map:thread:";

/// A persisted worker-state record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// The worker conversation thread this state belongs to.
    pub thread_id: String,
    /// The task the thread is bound to.
    pub task_id: String,
    /// Opaque worker state; the runtime never inspects it.
    pub worker_state: Vec<u8>,
    /// When the checkpoint was written.
    pub timestamp: DateTime<Utc>,
}

/// A task rehydrated during recovery, with its worker state if any.
#[derive(Debug, Clone)]
pub struct RecoveredTask {
    /// The task snapshot as last persisted.
    pub task: Task,
    /// The worker thread bound to the task, when one was recorded.
    pub thread_id: Option<String>,
    /// The persisted worker state for that thread.
    pub worker_state: Option<Vec<u8>>,
}

/// Typed façade over the key-value backend.
pub struct CheckpointStore {
    backend: Arc<dyn KeyValueBackend>,
    retention: RetentionConfig,
}

impl CheckpointStore {
    /// Creates a store over the given backend.
    pub fn new(backend: Arc<dyn KeyValueBackend>, retention: RetentionConfig) -> Self {
        Self { backend, retention }
    }

    /// Creates a store over a fresh in-memory backend.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), RetentionConfig::default())
    }

    fn wrap_err(op: &str, e: &CoreError) -> CoreError {
        CoreError::CheckpointUnavailable(format!("{op}: {e}"))
    }

    /// Persists the latest snapshot of a task, with a TTL derived from
    /// its state.
    pub async fn put_task_snapshot(&self, task: &Task) -> Result<()> {
        let key = format!("{TASK_PREFIX}{}", task.id);
        let bytes = serde_json::to_vec(task)?;
        let ttl = self.retention.ttl_for(task.state());
        self.backend
            .put(&key, bytes, Some(ttl))
            .await
            .map_err(|e| Self::wrap_err("put task snapshot", &e))
    }

    /// Loads the latest snapshot of a task.
    pub async fn get_task_snapshot(&self, task_id: &str) -> Result<Option<Task>> {
        let key = format!("{TASK_PREFIX}{task_id}");
        let bytes = self
            .backend
            .get(&key)
            .await
            .map_err(|e| Self::wrap_err("get task snapshot", &e))?;
        match bytes {
            Some(b) => Ok(Some(serde_json::from_slice(&b)?)),
            None => Ok(None),
        }
    }

    /// Persists a worker-state checkpoint.
    pub async fn put_worker_state(
        &self,
        thread_id: &str,
        task_id: &str,
        worker_state: Vec<u8>,
        ttl: Duration,
    ) -> Result<()> {
        let checkpoint = Checkpoint {
            thread_id: thread_id.to_string(),
            task_id: task_id.to_string(),
            worker_state,
            timestamp: Utc::now(),
        };
        let key = format!("{THREAD_PREFIX}{thread_id}");
        let bytes = serde_json::to_vec(&checkpoint)?;
        self.backend
            .put(&key, bytes, Some(ttl))
            .await
            .map_err(|e| Self::wrap_err("put worker state", &e))
    }

    /// Loads the worker-state checkpoint for a thread.
    pub async fn get_worker_state(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let key = format!("{THREAD_PREFIX}{thread_id}");
        let bytes = self
            .backend
            .get(&key)
            .await
            .map_err(|e| Self::wrap_err("get worker state", &e))?;
        match bytes {
            Some(b) => Ok(Some(serde_json::from_slice(&b)?)),
            None => Ok(None),
        }
    }

    /// Records the injective task ↔ thread binding.
    pub async fn bind_thread(&self, task_id: &str, thread_id: &str, ttl: Duration) -> Result<()> {
        self.backend
            .put(
                &format!("{MAP_TASK_PREFIX}{task_id}"),
                thread_id.as_bytes().to_vec(),
                Some(ttl),
            )
            .await
            .map_err(|e| Self::wrap_err("bind task map", &e))?;
        self.backend
            .put(
                &format!("{MAP_THREAD_PREFIX}{thread_id}"),
                task_id.as_bytes().to_vec(),
                Some(ttl),
            )
            .await
            .map_err(|e| Self::wrap_err("bind thread map", &e))
    }

    /// Resolves the worker thread bound to a task.
    pub async fn thread_for_task(&self, task_id: &str) -> Result<Option<String>> {
        let bytes = self
            .backend
            .get(&format!("{MAP_TASK_PREFIX}{task_id}"))
            .await
            .map_err(|e| Self::wrap_err("resolve thread", &e))?;
        Ok(bytes.map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    /// Resolves the task bound to a worker thread.
    pub async fn task_for_thread(&self, thread_id: &str) -> Result<Option<String>> {
        let bytes = self
            .backend
            .get(&format!("{MAP_THREAD_PREFIX}{thread_id}"))
            .await
            .map_err(|e| Self::wrap_err("resolve task", &e))?;
        Ok(bytes.map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    /// Removes everything recorded for a task: snapshot, binding, and
    /// the bound thread's state.
    pub async fn forget_task(&self, task_id: &str) -> Result<()> {
        if let Some(thread_id) = self.thread_for_task(task_id).await? {
            self.backend
                .delete(&format!("{THREAD_PREFIX}{thread_id}"))
                .await?;
            self.backend
                .delete(&format!("{MAP_THREAD_PREFIX}{thread_id}"))
                .await?;
        }
        self.backend
            .delete(&format!("{MAP_TASK_PREFIX}{task_id}"))
            .await?;
        self.backend.delete(&format!("{TASK_PREFIX}{task_id}")).await
    }

    /// Scans all persisted tasks and returns the non-terminal ones with
    /// their worker state, for rehydration on node start.
    ///
    /// Snapshots that no longer decode are skipped with a warning rather
    /// than aborting recovery.
    pub async fn recover_active(&self) -> Result<Vec<RecoveredTask>> {
        let keys = self
            .backend
            .list_by_prefix(TASK_PREFIX)
            .await
            .map_err(|e| Self::wrap_err("list tasks", &e))?;

        let mut recovered = Vec::new();
        for key in keys {
            let Some(bytes) = self.backend.get(&key).await? else {
                continue;
            };
            let task: Task = match serde_json::from_slice(&bytes) {
                Ok(t) => t,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping undecodable task snapshot");
                    continue;
                }
            };
            if task.is_terminal() || task.state() == TaskState::Unknown {
                continue;
            }
            let thread_id = self.thread_for_task(&task.id).await?;
            let worker_state = match &thread_id {
                Some(tid) => self.get_worker_state(tid).await?.map(|c| c.worker_state),
                None => None,
            };
            recovered.push(RecoveredTask {
                task,
                thread_id,
                worker_state,
            });
        }
        Ok(recovered)
    }

    /// The retention policy this store applies.
    #[must_use]
    pub const fn retention(&self) -> &RetentionConfig {
        &self.retention
    }
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskStatus;

    fn store() -> CheckpointStore {
        CheckpointStore::in_memory()
    }

    #[tokio::test]
    async fn test_task_snapshot_roundtrip() {
        let store = store();
        let task = Task::new("t-1", "c-1");
        store.put_task_snapshot(&task).await.unwrap();

        let loaded = store.get_task_snapshot("t-1").await.unwrap().unwrap();
        assert_eq!(loaded.id, "t-1");
        assert_eq!(loaded.state(), TaskState::Submitted);
        assert!(store.get_task_snapshot("t-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_thread_binding_is_bidirectional() {
        let store = store();
        store
            .bind_thread("t-1", "th-1", Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(
            store.thread_for_task("t-1").await.unwrap(),
            Some("th-1".to_string())
        );
        assert_eq!(
            store.task_for_thread("th-1").await.unwrap(),
            Some("t-1".to_string())
        );
    }

    #[tokio::test]
    async fn test_worker_state_roundtrip() {
        let store = store();
        store
            .put_worker_state("th-1", "t-1", b"graph-state".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        let checkpoint = store.get_worker_state("th-1").await.unwrap().unwrap();
        assert_eq!(checkpoint.task_id, "t-1");
        assert_eq!(checkpoint.worker_state, b"graph-state".to_vec());
    }

    #[tokio::test]
    async fn test_recover_skips_terminal_tasks() {
        let store = store();

        let active = Task::new("t-active", "c");
        store.put_task_snapshot(&active).await.unwrap();

        let mut done = Task::new("t-done", "c");
        done.set_status(TaskStatus::completed());
        store.put_task_snapshot(&done).await.unwrap();

        let recovered = store.recover_active().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].task.id, "t-active");
    }

    #[tokio::test]
    async fn test_recover_includes_worker_state() {
        let store = store();
        let task = Task::new("t-1", "c");
        store.put_task_snapshot(&task).await.unwrap();
        store
            .bind_thread("t-1", "th-1", Duration::from_secs(60))
            .await
            .unwrap();
        store
            .put_worker_state("th-1", "t-1", b"resume-me".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        let recovered = store.recover_active().await.unwrap();
        assert_eq!(recovered[0].thread_id.as_deref(), Some("th-1"));
        assert_eq!(recovered[0].worker_state, Some(b"resume-me".to_vec()));
    }

    #[tokio::test]
    async fn test_forget_task_clears_everything() {
        let store = store();
        let task = Task::new("t-1", "c");
        store.put_task_snapshot(&task).await.unwrap();
        store
            .bind_thread("t-1", "th-1", Duration::from_secs(60))
            .await
            .unwrap();
        store
            .put_worker_state("th-1", "t-1", b"x".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        store.forget_task("t-1").await.unwrap();
        assert!(store.get_task_snapshot("t-1").await.unwrap().is_none());
        assert!(store.get_worker_state("th-1").await.unwrap().is_none());
        assert!(store.thread_for_task("t-1").await.unwrap().is_none());
    }
}
