//! Task lifecycle management.
//!
//! The [`TaskManager`] is the sole writer of task state. Every mutation
//! goes through it: it updates the store, publishes exactly one event per
//! change to the task's queue, and drives the checkpoint synchronizer.
//! A per-task lock around each transition resolves races between cancel
//! requests and final transitions: whichever acquires the lock first
//! wins, the loser becomes a no-op.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::queue::QueueManager;
use super::store::TaskStore;
use crate::checkpoint::CheckpointSynchronizer;
use crate::error::{CoreError, JsonRpcError, Result};
use crate::types::{
    Event, Message, Task, TaskArtifactUpdateEvent, TaskState, TaskStatus,
};

/// Single writer of task state transitions.
pub struct TaskManager {
    store: Arc<TaskStore>,
    queues: Arc<QueueManager>,
    sync: Arc<CheckpointSynchronizer>,
    transition_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TaskManager {
    /// Creates a task manager over its collaborators.
    pub fn new(
        store: Arc<TaskStore>,
        queues: Arc<QueueManager>,
        sync: Arc<CheckpointSynchronizer>,
    ) -> Self {
        Self {
            store,
            queues,
            sync,
            transition_locks: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying task store.
    #[must_use]
    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// The queue manager fanning out this node's events.
    #[must_use]
    pub fn queues(&self) -> &Arc<QueueManager> {
        &self.queues
    }

    async fn transition_lock(&self, task_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.transition_locks.lock().await;
        Arc::clone(
            locks
                .entry(task_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    async fn publish(&self, task_id: &str, event: Event) {
        let queue = self.queues.get_or_create(task_id).await;
        match queue.publish(event) {
            Ok(_) => {}
            Err(CoreError::QueueClosed) => {
                // A final event has already gone out; nothing may follow it.
                debug!(task_id = %task_id, "Dropping event published after close");
            }
            Err(e) => warn!(task_id = %task_id, error = %e, "Event publish failed"),
        }
    }

    /// Creates a task for an incoming message and publishes its first
    /// snapshot event.
    ///
    /// The message's task/context IDs are honored when present; fresh
    /// UUIDs are minted otherwise. The incoming message becomes the first
    /// history entry.
    pub async fn create_task(&self, message: &Message) -> Result<Task> {
        let task_id = message
            .task_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let context_id = message
            .context_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut task = Task::new(&task_id, &context_id);
        let mut first = message.clone();
        first.task_id = Some(task_id.clone());
        first.context_id = Some(context_id.clone());
        task.push_message(first);

        self.store.insert(task.clone()).await?;
        self.publish(&task_id, Event::snapshot(task.clone())).await;
        self.sync.on_transition(&task).await?;

        info!(task_id = %task_id, context_id = %context_id, "Task created");
        Ok(task)
    }

    /// Reinstates a recovered task without re-running creation side
    /// effects; its fresh queue starts with a snapshot event.
    pub async fn rehydrate(&self, task: Task) -> Result<()> {
        let task_id = task.id.clone();
        self.store.insert(task.clone()).await?;
        self.publish(&task_id, Event::snapshot(task)).await;
        Ok(())
    }

    /// Looks up a task snapshot.
    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        self.store.get(task_id).await
    }

    /// Appends a message to the task and publishes a message event.
    pub async fn append_message(&self, task_id: &str, message: Message) -> Result<Task> {
        let mut message = message;
        let task = {
            let lock = self.transition_lock(task_id).await;
            let _guard = lock.lock().await;
            let current = self.store.get(task_id).await?;
            if current.is_terminal() {
                return Err(JsonRpcError::protocol_violation(format!(
                    "task '{task_id}' is terminal"
                ))
                .into());
            }
            message.task_id = Some(task_id.to_string());
            message.context_id = Some(current.context_id.clone());
            self.store.append_history(task_id, message.clone()).await?
        };
        self.publish(task_id, Event::message(message)).await;
        self.sync.on_progress(&task).await;
        Ok(task)
    }

    /// Merges an artifact chunk and publishes an artifact-update event.
    pub async fn append_artifact(
        &self,
        task_id: &str,
        update: TaskArtifactUpdateEvent,
    ) -> Result<Task> {
        let task = {
            let lock = self.transition_lock(task_id).await;
            let _guard = lock.lock().await;
            self.store.append_artifact_chunk(task_id, &update).await?
        };
        self.publish(task_id, Event::artifact(update)).await;
        self.sync.on_progress(&task).await;
        Ok(task)
    }

    /// Applies a state transition and publishes its status-update event,
    /// `final` set iff the new state is terminal.
    ///
    /// A terminal→terminal request is a no-op returning the current task;
    /// this is how a cancel that loses the race to a final transition
    /// (or vice versa) resolves. Anything else not in the state machine
    /// fails with `ProtocolViolation`.
    pub async fn transition(&self, task_id: &str, status: TaskStatus) -> Result<Task> {
        let lock = self.transition_lock(task_id).await;
        let _guard = lock.lock().await;

        let current = self.store.get(task_id).await?;
        if current.is_terminal() && status.state.is_terminal() {
            debug!(task_id = %task_id, state = ?current.state(), "Transition after terminal is a no-op");
            return Ok(current);
        }

        let is_final = status.state.is_terminal();
        let status_for_event = status.clone();
        let (previous, task) = self.store.set_status(task_id, status).await?;

        debug!(
            task_id = %task_id,
            from = ?previous.state,
            to = ?task.state(),
            "Task transition"
        );

        self.publish(
            task_id,
            Event::status(crate::types::TaskStatusUpdateEvent::new(
                task_id,
                &task.context_id,
                status_for_event,
                is_final,
            )),
        )
        .await;
        self.sync.on_transition(&task).await?;
        Ok(task)
    }

    /// Cancels a task.
    ///
    /// Idempotent on terminal tasks: the current snapshot is returned
    /// unchanged. `unknown` tasks cannot be canceled.
    pub async fn cancel(&self, task_id: &str) -> Result<Task> {
        let current = self.store.get(task_id).await?;
        if current.is_terminal() {
            return Ok(current);
        }
        if current.state() == TaskState::Unknown {
            return Err(JsonRpcError::task_not_cancelable(task_id).into());
        }
        self.transition(task_id, TaskStatus::new(TaskState::Canceled))
            .await
    }

    /// Fails a task with a human-readable cause. A no-op when the task
    /// already reached a terminal state.
    pub async fn fail(&self, task_id: &str, cause: impl Into<String>) -> Result<Task> {
        self.transition(task_id, TaskStatus::failed(cause)).await
    }

    /// Handles an unrecoverable invariant violation on a task: the state
    /// becomes `unknown`, callers are notified, further writes refuse.
    pub async fn poison(&self, task_id: &str, detail: &str) -> Result<Task> {
        warn!(task_id = %task_id, detail = %detail, "Task poisoned by invariant violation");
        let task = self.store.mark_unknown(task_id).await?;
        self.publish(task_id, Event::status(task.status_update_event(true)))
            .await;
        Ok(task)
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStore;
    use futures::StreamExt;

    fn manager() -> TaskManager {
        let store = Arc::new(TaskStore::new());
        let queues = Arc::new(QueueManager::default());
        let sync = Arc::new(CheckpointSynchronizer::new(
            Arc::new(CheckpointStore::in_memory()),
            std::time::Duration::from_secs(60),
            false,
        ));
        TaskManager::new(store, queues, sync)
    }

    #[tokio::test]
    async fn test_create_task_publishes_snapshot() {
        let manager = manager();
        let task = manager
            .create_task(&Message::user_text("USD to EUR"))
            .await
            .unwrap();
        assert_eq!(task.history.len(), 1);

        let queue = manager.queues().get(&task.id).await.unwrap();
        let mut stream = queue.subscribe().into_stream();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(first.event.event_kind(), "task");
    }

    #[tokio::test]
    async fn test_transition_emits_status_update() {
        let manager = manager();
        let task = manager
            .create_task(&Message::user_text("hi"))
            .await
            .unwrap();
        manager
            .transition(&task.id, TaskStatus::working())
            .await
            .unwrap();

        let queue = manager.queues().get(&task.id).await.unwrap();
        let events: Vec<_> = queue
            .subscribe()
            .into_stream()
            .take(2)
            .map(|r| r.unwrap().event.event_kind())
            .collect()
            .await;
        assert_eq!(events, vec!["task", "status-update"]);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_on_terminal() {
        let manager = manager();
        let task = manager
            .create_task(&Message::user_text("hi"))
            .await
            .unwrap();
        manager
            .transition(&task.id, TaskStatus::working())
            .await
            .unwrap();
        manager
            .transition(&task.id, TaskStatus::completed())
            .await
            .unwrap();

        let canceled = manager.cancel(&task.id).await.unwrap();
        assert_eq!(canceled.state(), TaskState::Completed);

        let again = manager.cancel(&task.id).await.unwrap();
        assert_eq!(again.state(), TaskState::Completed);
    }

    #[tokio::test]
    async fn test_final_event_closes_stream() {
        let manager = manager();
        let task = manager
            .create_task(&Message::user_text("hi"))
            .await
            .unwrap();
        manager
            .transition(&task.id, TaskStatus::working())
            .await
            .unwrap();
        manager
            .transition(&task.id, TaskStatus::completed())
            .await
            .unwrap();

        // No event after a final one, even if something tries.
        manager
            .append_message(&task.id, Message::agent_text("late"))
            .await
            .unwrap_err();

        let queue = manager.queues().get(&task.id).await.unwrap();
        let events: Vec<_> = queue.subscribe().into_stream().collect().await;
        let last = events.last().unwrap().as_ref().unwrap();
        assert!(last.event.is_final());
    }

    #[tokio::test]
    async fn test_illegal_transition_is_protocol_violation() {
        let manager = manager();
        let task = manager
            .create_task(&Message::user_text("hi"))
            .await
            .unwrap();
        let err = manager
            .transition(&task.id, TaskStatus::new(TaskState::InputRequired))
            .await
            .unwrap_err();
        assert_eq!(
            err.jsonrpc_code(),
            Some(crate::error::RpcErrorCode::ProtocolViolation as i32)
        );
    }

    #[tokio::test]
    async fn test_message_events_follow_history_order() {
        let manager = manager();
        let task = manager
            .create_task(&Message::user_text("q"))
            .await
            .unwrap();
        manager
            .transition(&task.id, TaskStatus::working())
            .await
            .unwrap();
        for i in 0..3 {
            manager
                .append_message(&task.id, Message::agent_text(format!("step {i}")))
                .await
                .unwrap();
        }

        let snapshot = manager.get_task(&task.id).await.unwrap();
        // Incoming message plus three appended.
        assert_eq!(snapshot.history.len(), 4);
        let texts: Vec<_> = snapshot.history[1..]
            .iter()
            .map(|m| m.text_content().unwrap())
            .collect();
        assert_eq!(texts, vec!["step 0", "step 1", "step 2"]);
    }
}
