//! Bridges workers to the task and event model.
//!
//! The host owns the translation table from [`WorkerItem`]s to protocol
//! events and state transitions, enforces the one-worker-per-task rule,
//! bounds cancellation with a grace deadline, and drives worker-state
//! checkpoints at every transition boundary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Worker, WorkerItem, WorkerStream};
use crate::checkpoint::CheckpointStore;
use crate::config::WorkerConfig;
use crate::error::{JsonRpcError, Result, WorkerError};
use crate::server::TaskManager;
use crate::types::{
    Artifact, Message, Part, Task, TaskArtifactUpdateEvent, TaskState, TaskStatus,
};

struct RunningWorker {
    handle: JoinHandle<()>,
    cancel_requested: Arc<AtomicBool>,
}

type RunningMap = Arc<Mutex<HashMap<String, RunningWorker>>>;

/// Runs workers against tasks, translating their output into events.
pub struct WorkerHost {
    worker: Arc<dyn Worker>,
    manager: Arc<TaskManager>,
    checkpoints: Arc<CheckpointStore>,
    config: WorkerConfig,
    running: RunningMap,
    slots: Arc<Semaphore>,
}

impl WorkerHost {
    /// Creates a host for the given worker.
    pub fn new(
        worker: Arc<dyn Worker>,
        manager: Arc<TaskManager>,
        checkpoints: Arc<CheckpointStore>,
        config: WorkerConfig,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_tasks));
        Self {
            worker,
            manager,
            checkpoints,
            config,
            running: Arc::new(Mutex::new(HashMap::new())),
            slots,
        }
    }

    /// The task manager this host transitions tasks through.
    #[must_use]
    pub fn manager(&self) -> &Arc<TaskManager> {
        &self.manager
    }

    /// Starts a worker turn for a freshly created (or rehydrated) task.
    pub async fn spawn_start(
        &self,
        task_id: &str,
        message: Message,
        resumed_state: Option<Vec<u8>>,
    ) -> Result<()> {
        let worker = Arc::clone(&self.worker);
        self.spawn_turn(task_id, move |tid| async move {
            worker.start(&tid, &message, resumed_state).await
        })
        .await
    }

    /// Resumes a task paused in input-required or auth-required with the
    /// caller's follow-up, moving it back to working first.
    pub async fn spawn_resume(&self, task_id: &str, message: Message) -> Result<()> {
        let worker = Arc::clone(&self.worker);
        self.spawn_turn(task_id, move |tid| async move {
            worker.resume(&tid, &message).await
        })
        .await
    }

    async fn spawn_turn<F, Fut>(&self, task_id: &str, open: F) -> Result<()>
    where
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<WorkerStream>> + Send,
    {
        let mut running = self.running.lock().await;
        if running.contains_key(task_id) {
            return Err(JsonRpcError::protocol_violation(format!(
                "task '{task_id}' already has a running worker"
            ))
            .into());
        }

        let cancel_requested = Arc::new(AtomicBool::new(false));
        let run = TurnRun {
            worker: Arc::clone(&self.worker),
            manager: Arc::clone(&self.manager),
            checkpoints: Arc::clone(&self.checkpoints),
            config: self.config.clone(),
            task_id: task_id.to_string(),
            cancel_requested: Arc::clone(&cancel_requested),
            slots: Arc::clone(&self.slots),
            running: Arc::clone(&self.running),
        };
        let tid = task_id.to_string();
        let handle = tokio::spawn(async move {
            run.execute(open(tid)).await;
        });

        running.insert(
            task_id.to_string(),
            RunningWorker {
                handle,
                cancel_requested,
            },
        );
        Ok(())
    }

    /// Cancels the task, cooperatively stopping its worker first.
    ///
    /// The worker gets the configured grace period to wind down; past it
    /// the turn is force-terminated. Either way the task ends canceled
    /// (or stays in whatever terminal state won the race).
    pub async fn cancel(&self, task_id: &str) -> Result<Task> {
        let entry = self.running.lock().await.remove(task_id);
        if let Some(running) = entry {
            running.cancel_requested.store(true, Ordering::SeqCst);
            self.worker.cancel(task_id).await;

            let mut handle = running.handle;
            match tokio::time::timeout(self.config.cancel_grace(), &mut handle).await {
                Ok(_) => debug!(task_id = %task_id, "Worker wound down within grace"),
                Err(_) => {
                    warn!(task_id = %task_id, "Worker exceeded cancel grace; force-terminating");
                    handle.abort();
                }
            }
        }
        self.manager.cancel(task_id).await
    }

    /// True while a worker turn is running for the task.
    pub async fn is_running(&self, task_id: &str) -> bool {
        self.running.lock().await.contains_key(task_id)
    }

    /// Number of worker turns currently running.
    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }
}

impl std::fmt::Debug for WorkerHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHost")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// One worker turn: opens the stream, translates items until a terminal
/// outcome, and settles the task state.
struct TurnRun {
    worker: Arc<dyn Worker>,
    manager: Arc<TaskManager>,
    checkpoints: Arc<CheckpointStore>,
    config: WorkerConfig,
    task_id: String,
    cancel_requested: Arc<AtomicBool>,
    slots: Arc<Semaphore>,
    running: RunningMap,
}

impl TurnRun {
    async fn execute<Fut>(self, open: Fut)
    where
        Fut: std::future::Future<Output = Result<WorkerStream>>,
    {
        self.run(open).await;
        self.running.lock().await.remove(&self.task_id);
    }

    async fn run<Fut>(&self, open: Fut)
    where
        Fut: std::future::Future<Output = Result<WorkerStream>>,
    {
        let permit = match Arc::clone(&self.slots).acquire_owned().await {
            Ok(p) => p,
            Err(_) => return,
        };

        if let Err(e) = self.begin_working().await {
            error!(task_id = %self.task_id, error = %e, "Could not move task to working");
            return;
        }

        let stream = match open.await {
            Ok(s) => s,
            Err(e) => {
                error!(task_id = %self.task_id, error = %e, "Worker failed to start");
                let _ = self
                    .manager
                    .fail(&self.task_id, "worker failed to start")
                    .await;
                return;
            }
        };

        self.drive(stream).await;
        drop(permit);
    }

    /// Moves submitted or paused tasks to working; re-entry from working
    /// (recovery) is left as-is.
    async fn begin_working(&self) -> Result<()> {
        let task = self.manager.get_task(&self.task_id).await?;
        match task.state() {
            TaskState::Working => Ok(()),
            _ => {
                self.manager
                    .transition(&self.task_id, TaskStatus::working())
                    .await?;
                self.checkpoint_worker().await;
                Ok(())
            }
        }
    }

    async fn drive(&self, mut stream: WorkerStream) {
        // Chunk counters decide the append flag per artifact.
        let mut chunks_seen: HashMap<String, usize> = HashMap::new();
        let mut outcome: Option<Outcome> = None;

        loop {
            let next = match self.config.turn_timeout_ms {
                Some(ms) => {
                    match tokio::time::timeout(
                        std::time::Duration::from_millis(ms),
                        stream.next(),
                    )
                    .await
                    {
                        Ok(item) => item,
                        Err(_) => {
                            outcome = Some(Outcome::Failed(WorkerError::timeout(
                                "worker turn exceeded its deadline",
                            )));
                            break;
                        }
                    }
                }
                None => stream.next().await,
            };

            let Some(item) = next else {
                break;
            };
            match self.apply(item, &mut chunks_seen).await {
                Ok(Some(done)) => {
                    outcome = Some(done);
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(task_id = %self.task_id, error = %e, "Failed to apply worker item");
                    outcome = Some(Outcome::Failed(WorkerError::internal(
                        "could not record worker output",
                    )));
                    break;
                }
            }
        }
        drop(stream);

        self.settle(outcome).await;
    }

    /// Applies one item per the translation table. Returns the terminal
    /// outcome when the item ends the turn.
    async fn apply(
        &self,
        item: WorkerItem,
        chunks_seen: &mut HashMap<String, usize>,
    ) -> Result<Option<Outcome>> {
        let task_id = &self.task_id;
        match item {
            WorkerItem::Thinking(text) => {
                self.manager
                    .append_message(task_id, Message::agent_text(text))
                    .await?;
                Ok(None)
            }
            WorkerItem::ToolInvocation { name, input } => {
                let message = Message::agent(vec![
                    Part::text(format!("Invoking {name}")),
                    Part::data(input),
                ]);
                self.manager.append_message(task_id, message).await?;
                Ok(None)
            }
            WorkerItem::ToolResult { name, output } => {
                let message = Message::agent(vec![
                    Part::text(format!("{name} returned")),
                    Part::data(output),
                ]);
                self.manager.append_message(task_id, message).await?;
                Ok(None)
            }
            WorkerItem::PartialArtifact {
                artifact_id,
                part,
                is_last,
            } => {
                let index = chunks_seen.entry(artifact_id.clone()).or_insert(0);
                let append = *index > 0;
                *index += 1;

                let task = self.manager.get_task(task_id).await?;
                let mut update = TaskArtifactUpdateEvent::new(
                    task_id,
                    &task.context_id,
                    Artifact::new(artifact_id, vec![part]),
                );
                update.append = append;
                update.last_chunk = is_last;
                self.manager.append_artifact(task_id, update).await?;
                Ok(None)
            }
            WorkerItem::NeedsInput { prompt } => {
                Ok(Some(Outcome::Paused(TaskStatus::input_required(prompt))))
            }
            WorkerItem::NeedsAuth { scheme } => Ok(Some(Outcome::Paused(
                TaskStatus::with_message(
                    TaskState::AuthRequired,
                    Message::agent_text(format!("authentication required: {scheme}")),
                ),
            ))),
            WorkerItem::Final(parts) => Ok(Some(Outcome::Completed(parts))),
            WorkerItem::Error(e) => Ok(Some(Outcome::Failed(e))),
        }
    }

    /// Settles the task once the stream has ended.
    ///
    /// A requested cancel wins over everything except a completion that
    /// beat it to the finish line.
    async fn settle(&self, outcome: Option<Outcome>) {
        let canceled = self.cancel_requested.load(Ordering::SeqCst);
        if canceled && !matches!(outcome, Some(Outcome::Completed(_))) {
            if let Err(e) = self
                .manager
                .transition(&self.task_id, TaskStatus::new(TaskState::Canceled))
                .await
            {
                warn!(task_id = %self.task_id, error = %e, "Could not settle canceled task");
            }
            return;
        }
        let result = match outcome {
            Some(Outcome::Completed(parts)) => {
                let _ = self
                    .manager
                    .append_message(&self.task_id, Message::agent(parts))
                    .await;
                self.checkpoint_worker().await;
                self.manager
                    .transition(&self.task_id, TaskStatus::completed())
                    .await
            }
            Some(Outcome::Paused(status)) => {
                // Snapshot before parking so a restart can resume here.
                self.checkpoint_worker().await;
                self.manager.transition(&self.task_id, status).await
            }
            Some(Outcome::Failed(e)) => {
                info!(task_id = %self.task_id, kind = %e.kind, "Worker reported failure");
                self.manager
                    .fail(&self.task_id, format!("worker error: {}", e.kind))
                    .await
            }
            None => {
                // Stream ended without a terminal item; that's a worker bug.
                self.manager
                    .fail(&self.task_id, "worker ended without a result")
                    .await
            }
        };
        if let Err(e) = result {
            warn!(task_id = %self.task_id, error = %e, "Could not settle task state");
            if matches!(e, crate::error::CoreError::Invariant(_)) {
                let _ = self
                    .manager
                    .poison(&self.task_id, "task state diverged while settling")
                    .await;
            }
        }
    }

    /// Persists the worker's state under the task's bound thread.
    async fn checkpoint_worker(&self) {
        let Some(state) = self.worker.snapshot(&self.task_id).await else {
            return;
        };
        let ttl = self.checkpoints.retention().ttl_for(TaskState::Working);
        let thread_id = match self.checkpoints.thread_for_task(&self.task_id).await {
            Ok(Some(existing)) => existing,
            Ok(None) => {
                let fresh = uuid::Uuid::new_v4().to_string();
                if let Err(e) = self
                    .checkpoints
                    .bind_thread(&self.task_id, &fresh, ttl)
                    .await
                {
                    warn!(task_id = %self.task_id, error = %e, "Could not bind worker thread");
                    return;
                }
                fresh
            }
            Err(e) => {
                warn!(task_id = %self.task_id, error = %e, "Thread lookup failed");
                return;
            }
        };
        if let Err(e) = self
            .checkpoints
            .put_worker_state(&thread_id, &self.task_id, state, ttl)
            .await
        {
            warn!(task_id = %self.task_id, error = %e, "Worker state checkpoint failed");
        }
    }
}

enum Outcome {
    Completed(Vec<Part>),
    Paused(TaskStatus),
    Failed(WorkerError),
}
