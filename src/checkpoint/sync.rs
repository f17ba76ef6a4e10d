//! Write-through synchronization between the live task state and the
//! checkpoint store.
//!
//! Status transitions snapshot immediately. Message and artifact traffic
//! only marks the task dirty; a background flusher writes the latest
//! dirty snapshot at most once per interval, bounding write
//! amplification on chatty workers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::CheckpointStore;
use crate::error::Result;
use crate::types::Task;

/// Coalescing writer of task snapshots.
pub struct CheckpointSynchronizer {
    store: Arc<CheckpointStore>,
    interval: Duration,
    mandatory: bool,
    dirty: Mutex<HashMap<String, Task>>,
}

impl CheckpointSynchronizer {
    /// Creates a synchronizer over a checkpoint store.
    ///
    /// With `mandatory` set, a failed transition write is returned to the
    /// caller instead of only being logged.
    pub fn new(store: Arc<CheckpointStore>, interval: Duration, mandatory: bool) -> Self {
        Self {
            store,
            interval,
            mandatory,
            dirty: Mutex::new(HashMap::new()),
        }
    }

    /// Records a status transition: the snapshot is written through
    /// immediately and any pending coalesced write for the task is
    /// superseded.
    pub async fn on_transition(&self, task: &Task) -> Result<()> {
        self.dirty.lock().await.remove(&task.id);
        match self.store.put_task_snapshot(task).await {
            Ok(()) => Ok(()),
            Err(e) if self.mandatory => Err(e),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Checkpoint write failed; task continues");
                Ok(())
            }
        }
    }

    /// Records message or artifact progress; the snapshot is deferred to
    /// the next flush tick.
    pub async fn on_progress(&self, task: &Task) {
        self.dirty.lock().await.insert(task.id.clone(), task.clone());
    }

    /// Writes out every pending dirty snapshot now.
    pub async fn flush(&self) {
        let pending: Vec<Task> = {
            let mut dirty = self.dirty.lock().await;
            dirty.drain().map(|(_, task)| task).collect()
        };
        for task in pending {
            if let Err(e) = self.store.put_task_snapshot(&task).await {
                warn!(task_id = %task.id, error = %e, "Coalesced checkpoint write failed");
            }
        }
    }

    /// Spawns the periodic flusher; the handle aborts it on drop by the
    /// owner.
    pub fn spawn_flusher(self: &Arc<Self>) -> JoinHandle<()> {
        let sync = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(sync.interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                sync.flush().await;
            }
        })
    }

    /// Number of tasks awaiting a coalesced write.
    pub async fn pending(&self) -> usize {
        self.dirty.lock().await.len()
    }

    /// The wrapped checkpoint store.
    #[must_use]
    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }
}

impl std::fmt::Debug for CheckpointSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointSynchronizer")
            .field("interval", &self.interval)
            .field("mandatory", &self.mandatory)
            .finish_non_exhaustive()
    }
}

/// Convenience: builds the synchronizer + store pair from config.
pub fn build_synchronizer(
    store: Arc<CheckpointStore>,
    config: &crate::config::CheckpointConfig,
) -> Arc<CheckpointSynchronizer> {
    debug!(interval_ms = config.interval_ms, "Checkpoint synchronizer configured");
    Arc::new(CheckpointSynchronizer::new(
        store,
        config.interval(),
        config.mandatory,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Message, TaskStatus};

    #[tokio::test]
    async fn test_transition_writes_immediately() {
        let store = Arc::new(CheckpointStore::in_memory());
        let sync = CheckpointSynchronizer::new(Arc::clone(&store), Duration::from_secs(60), false);

        let mut task = Task::new("t-1", "c-1");
        task.set_status(TaskStatus::working());
        sync.on_transition(&task).await.unwrap();

        let snapshot = store.get_task_snapshot("t-1").await.unwrap().unwrap();
        assert_eq!(snapshot.state(), crate::types::TaskState::Working);
    }

    #[tokio::test]
    async fn test_progress_is_deferred_until_flush() {
        let store = Arc::new(CheckpointStore::in_memory());
        let sync = CheckpointSynchronizer::new(Arc::clone(&store), Duration::from_secs(60), false);

        let mut task = Task::new("t-1", "c-1");
        task.push_message(Message::agent_text("thinking..."));
        sync.on_progress(&task).await;

        assert!(store.get_task_snapshot("t-1").await.unwrap().is_none());
        assert_eq!(sync.pending().await, 1);

        sync.flush().await;
        assert_eq!(sync.pending().await, 0);
        let snapshot = store.get_task_snapshot("t-1").await.unwrap().unwrap();
        assert_eq!(snapshot.history.len(), 1);
    }

    #[tokio::test]
    async fn test_transition_supersedes_pending_progress() {
        let store = Arc::new(CheckpointStore::in_memory());
        let sync = CheckpointSynchronizer::new(Arc::clone(&store), Duration::from_secs(60), false);

        let mut task = Task::new("t-1", "c-1");
        task.push_message(Message::agent_text("step 1"));
        sync.on_progress(&task).await;

        task.set_status(TaskStatus::completed());
        sync.on_transition(&task).await.unwrap();
        assert_eq!(sync.pending().await, 0);

        let snapshot = store.get_task_snapshot("t-1").await.unwrap().unwrap();
        assert!(snapshot.is_terminal());
    }

    #[tokio::test]
    async fn test_coalescing_keeps_latest() {
        let store = Arc::new(CheckpointStore::in_memory());
        let sync = CheckpointSynchronizer::new(Arc::clone(&store), Duration::from_secs(60), false);

        let mut task = Task::new("t-1", "c-1");
        for i in 0..10 {
            task.push_message(Message::agent_text(format!("chunk {i}")));
            sync.on_progress(&task).await;
        }
        // Ten progress reports coalesce into a single pending write.
        assert_eq!(sync.pending().await, 1);

        sync.flush().await;
        let snapshot = store.get_task_snapshot("t-1").await.unwrap().unwrap();
        assert_eq!(snapshot.history.len(), 10);
    }
}
