//! Task storage.
//!
//! The store exclusively owns task records. Writes to one task are
//! serialized through a per-task mutex; the outer directory is a
//! read-mostly map. Reads hand out clones, never references into the
//! store. Durability is layered on by the checkpoint synchronizer, which
//! the task manager drives on every mutation.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::error::{CoreError, JsonRpcError, Result};
use crate::types::{
    ListTasksParams, ListTasksResult, Message, Task, TaskArtifactUpdateEvent, TaskStatus,
};

/// Default page size for `tasks/list`.
const DEFAULT_PAGE_SIZE: usize = 50;

/// Concurrent directory of task records.
#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: RwLock<HashMap<String, Arc<Mutex<Task>>>>,
}

impl TaskStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, task_id: &str) -> Result<Arc<Mutex<Task>>> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| JsonRpcError::task_not_found(task_id).into())
    }

    /// Inserts a newly created task. Task IDs are unique per node;
    /// inserting a duplicate is an invariant violation.
    pub async fn insert(&self, task: Task) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(CoreError::Invariant(format!(
                "duplicate task id '{}'",
                task.id
            )));
        }
        tasks.insert(task.id.clone(), Arc::new(Mutex::new(task)));
        Ok(())
    }

    /// Returns a snapshot of a task.
    pub async fn get(&self, task_id: &str) -> Result<Task> {
        let slot = self.slot(task_id).await?;
        let task = slot.lock().await;
        Ok(task.clone())
    }

    /// Returns a snapshot of a task, or `None` when unknown.
    pub async fn try_get(&self, task_id: &str) -> Option<Task> {
        let slot = self.tasks.read().await.get(task_id).cloned()?;
        let task = slot.lock().await;
        Some(task.clone())
    }

    /// Returns true if the store knows this task.
    pub async fn contains(&self, task_id: &str) -> bool {
        self.tasks.read().await.contains_key(task_id)
    }

    /// Appends a message to a task's history and returns the updated
    /// snapshot.
    pub async fn append_history(&self, task_id: &str, message: Message) -> Result<Task> {
        let slot = self.slot(task_id).await?;
        let mut task = slot.lock().await;
        task.push_message(message);
        Ok(task.clone())
    }

    /// Merges an artifact chunk into the task's canonical artifact and
    /// returns the updated snapshot.
    pub async fn append_artifact_chunk(
        &self,
        task_id: &str,
        update: &TaskArtifactUpdateEvent,
    ) -> Result<Task> {
        let slot = self.slot(task_id).await?;
        let mut task = slot.lock().await;
        task.apply_artifact_update(update);
        Ok(task.clone())
    }

    /// Replaces a task's status, returning the previous status and the
    /// updated snapshot.
    ///
    /// Transitions not in the state machine fail with `ProtocolViolation`
    /// and leave the task untouched.
    pub async fn set_status(
        &self,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<(TaskStatus, Task)> {
        let slot = self.slot(task_id).await?;
        let mut task = slot.lock().await;
        if !task.state().can_transition_to(status.state) {
            return Err(JsonRpcError::protocol_violation(format!(
                "illegal transition {:?} -> {:?} on task '{}'",
                task.state(),
                status.state,
                task_id
            ))
            .into());
        }
        let previous = std::mem::replace(&mut task.status, status);
        task.updated_at = chrono::Utc::now();
        Ok((previous, task.clone()))
    }

    /// Forces a task into the `unknown` state after an unrecoverable
    /// invariant violation. Bypasses the transition table.
    pub async fn mark_unknown(&self, task_id: &str) -> Result<Task> {
        let slot = self.slot(task_id).await?;
        let mut task = slot.lock().await;
        task.set_status(TaskStatus::new(crate::types::TaskState::Unknown));
        Ok(task.clone())
    }

    /// Lists tasks matching the filter, newest first, paginated.
    pub async fn list(&self, params: &ListTasksParams) -> Result<ListTasksResult> {
        let slots: Vec<Arc<Mutex<Task>>> = self.tasks.read().await.values().cloned().collect();
        let mut matched = Vec::new();
        for slot in slots {
            let task = slot.lock().await;
            if let Some(state) = params.state {
                if task.state() != state {
                    continue;
                }
            }
            if let Some(ref context_id) = params.context_id {
                if &task.context_id != context_id {
                    continue;
                }
            }
            matched.push(task.clone());
        }
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        let offset = match params.page_token.as_deref() {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| JsonRpcError::invalid_params("malformed page token"))?,
            None => 0,
        };
        let page_size = params.page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1);

        let next_page_token = if offset + page_size < matched.len() {
            Some((offset + page_size).to_string())
        } else {
            None
        };
        let tasks = matched
            .into_iter()
            .skip(offset)
            .take(page_size)
            .collect();

        Ok(ListTasksResult {
            tasks,
            next_page_token,
        })
    }

    /// Number of tasks in a non-terminal state.
    pub async fn active_count(&self) -> usize {
        let slots: Vec<Arc<Mutex<Task>>> = self.tasks.read().await.values().cloned().collect();
        let mut count = 0;
        for slot in slots {
            if !slot.lock().await.is_terminal() {
                count += 1;
            }
        }
        count
    }

    /// Removes a task record entirely, returning its final snapshot.
    pub async fn remove(&self, task_id: &str) -> Option<Task> {
        let slot = self.tasks.write().await.remove(task_id)?;
        let task = slot.lock().await;
        Some(task.clone())
    }

    /// Total number of tasks, terminal included.
    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Returns true when the store holds no tasks.
    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}
