//! JSON-RPC request dispatch.
//!
//! Decodes the envelope, validates it and the message, resolves task
//! identity (reuse non-terminal, create otherwise), and routes to the
//! lifecycle manager and worker host. Streaming methods answer with an
//! SSE stream opened before the worker is spawned, so the task snapshot
//! is always the first observable event.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::push::PushConfigStore;
use super::sse::{sse_response, EventSse};
use super::TaskManager;
use crate::error::{JsonRpcError, Result};
use crate::types::validate::{validate_incoming_message, validate_rpc_envelope};
use crate::types::{
    AgentCard, DeletePushConfigParams, GetPushConfigParams, JsonRpcErrorResponse, JsonRpcRequest,
    JsonRpcSuccessResponse, ListPushConfigParams, ListTasksParams, ListTasksResult, Message,
    RequestId, ResubscribeParams, SendMessageParams, Task, TaskIdParams, TaskPushConfig,
    TaskQueryParams,
};
use crate::worker::WorkerHost;

/// How a dispatched request answers.
pub enum DispatchOutcome {
    /// A complete JSON-RPC response body.
    Json(String),
    /// An SSE stream (`message/stream`, `tasks/resubscribe`).
    Stream(EventSse),
}

/// What an incoming message resolved to, before any worker is spawned.
enum Resolution {
    /// A task that needs a fresh worker turn started for the message,
    /// whose ids have been filled in.
    Start {
        /// The (possibly just created) task.
        task: Task,
        /// The message to hand the worker.
        message: Message,
    },
    /// A waiting task whose worker resumes with the follow-up; the
    /// message is already in the task's history.
    Resume {
        /// The paused task.
        task: Task,
        /// The caller's follow-up.
        message: Message,
    },
}

/// Routes decoded JSON-RPC requests to the runtime.
pub struct Dispatcher {
    manager: Arc<TaskManager>,
    host: Arc<WorkerHost>,
    push_configs: Arc<PushConfigStore>,
    card: Arc<AgentCard>,
}

impl Dispatcher {
    /// Creates a dispatcher over the runtime components.
    pub fn new(
        manager: Arc<TaskManager>,
        host: Arc<WorkerHost>,
        push_configs: Arc<PushConfigStore>,
        card: Arc<AgentCard>,
    ) -> Self {
        Self {
            manager,
            host,
            push_configs,
            card,
        }
    }

    /// The card this node serves.
    #[must_use]
    pub fn card(&self) -> &Arc<AgentCard> {
        &self.card
    }

    /// Number of non-terminal tasks, reported by `/health`.
    pub async fn active_tasks(&self) -> usize {
        self.manager.store().active_count().await
    }

    /// Dispatches a raw request body.
    ///
    /// `header_last_event_id` carries the HTTP `Last-Event-ID` header;
    /// for `tasks/resubscribe` it substitutes for a missing
    /// `lastEventId` param, making a reconnect equivalent to an explicit
    /// resubscribe.
    pub async fn dispatch(
        &self,
        body: &str,
        header_last_event_id: Option<u64>,
    ) -> DispatchOutcome {
        let request: JsonRpcRequest<serde_json::Value> = match serde_json::from_str(body) {
            Ok(request) => request,
            Err(_) => {
                return DispatchOutcome::Json(error_body(None, JsonRpcError::parse_error()));
            }
        };
        let id = request.id.clone();
        if let Err(e) = validate_rpc_envelope(&request) {
            return DispatchOutcome::Json(error_body(Some(id), e));
        }

        debug!(method = %request.method, "Dispatching request");
        match request.method.as_str() {
            "message/stream" => {
                let params = match parse_params::<SendMessageParams>(&request) {
                    Ok(p) => p,
                    Err(e) => return DispatchOutcome::Json(error_body(Some(id), e)),
                };
                match self.on_message_stream(params).await {
                    Ok(sse) => DispatchOutcome::Stream(sse),
                    Err(e) => DispatchOutcome::Json(error_body(Some(id), e.to_jsonrpc_error())),
                }
            }
            "tasks/resubscribe" => {
                let params = match parse_params::<ResubscribeParams>(&request) {
                    Ok(p) => p,
                    Err(e) => return DispatchOutcome::Json(error_body(Some(id), e)),
                };
                let params = ResubscribeParams {
                    last_event_id: params.last_event_id.or(header_last_event_id),
                    ..params
                };
                match self.on_resubscribe(params).await {
                    Ok(sse) => DispatchOutcome::Stream(sse),
                    Err(e) => DispatchOutcome::Json(error_body(Some(id), e.to_jsonrpc_error())),
                }
            }
            method => {
                let result = self.dispatch_unary(method, &request).await;
                DispatchOutcome::Json(match result {
                    Ok(json) => json,
                    Err(e) => error_body(Some(id), e.to_jsonrpc_error()),
                })
            }
        }
    }

    async fn dispatch_unary(
        &self,
        method: &str,
        request: &JsonRpcRequest<serde_json::Value>,
    ) -> Result<String> {
        let id = request.id.clone();
        match method {
            "message/send" => {
                let params = parse_params::<SendMessageParams>(request)?;
                let task = self.on_message_send(params).await?;
                success_body(&id, &task)
            }
            "tasks/get" => {
                let params = parse_params::<TaskQueryParams>(request)?;
                let task = self.on_get_task(params).await?;
                success_body(&id, &task)
            }
            "tasks/cancel" => {
                let params = parse_params::<TaskIdParams>(request)?;
                let task = self.on_cancel_task(params).await?;
                success_body(&id, &task)
            }
            "tasks/list" => {
                let params = match &request.params {
                    Some(_) => parse_params::<ListTasksParams>(request)?,
                    None => ListTasksParams::default(),
                };
                let result = self.on_list_tasks(params).await?;
                success_body(&id, &result)
            }
            "tasks/pushNotificationConfig/set" => {
                let params = parse_params::<TaskPushConfig>(request)?;
                let config = self.on_set_push_config(params).await?;
                success_body(&id, &config)
            }
            "tasks/pushNotificationConfig/get" => {
                let params = parse_params::<GetPushConfigParams>(request)?;
                let config = self.on_get_push_config(params).await?;
                success_body(&id, &config)
            }
            "tasks/pushNotificationConfig/list" => {
                let params = parse_params::<ListPushConfigParams>(request)?;
                let configs = self.on_list_push_config(params).await?;
                success_body(&id, &configs)
            }
            "tasks/pushNotificationConfig/delete" => {
                let params = parse_params::<DeletePushConfigParams>(request)?;
                self.on_delete_push_config(params).await?;
                success_body(&id, &serde_json::Value::Null)
            }
            other => Err(JsonRpcError::method_not_found(other).into()),
        }
    }

    /// Resolves the task an incoming message addresses, without
    /// spawning any worker yet.
    ///
    /// No task id, or a terminal referenced task, creates a new task
    /// (sharing the terminal task's context). A waiting task has the
    /// follow-up appended and resumes its worker when the resolution is
    /// spawned. An unknown id is `TaskNotFound`; a busy one is a
    /// protocol violation.
    ///
    /// Keeping resolution separate from [`spawn_resolved`](Self::spawn_resolved)
    /// lets streaming callers open their subscription in between, so the
    /// first worker event is always observable on the stream.
    async fn resolve_message(&self, params: SendMessageParams) -> Result<Resolution> {
        let message = params.message.clone();
        validate_incoming_message(&message)?;

        if let Some(task_id) = message.task_id.clone() {
            let Some(existing) = self.manager.store().try_get(&task_id).await else {
                return Err(JsonRpcError::task_not_found(&task_id).into());
            };
            if existing.is_terminal() {
                // Follow-up to a finished task starts a new one in the
                // same context, referencing its predecessor.
                let mut fresh = message;
                fresh.task_id = None;
                fresh.context_id = Some(existing.context_id.clone());
                fresh
                    .reference_task_ids
                    .get_or_insert_with(Vec::new)
                    .push(task_id.clone());
                let task = self.manager.create_task(&fresh).await?;
                fresh.task_id = Some(task.id.clone());
                return Ok(Resolution::Start {
                    task,
                    message: fresh,
                });
            }
            if existing.is_waiting() {
                let task = self
                    .manager
                    .append_message(&task_id, message.clone())
                    .await?;
                return Ok(Resolution::Resume { task, message });
            }
            return Err(JsonRpcError::protocol_violation(format!(
                "task '{task_id}' is {:?} and not awaiting input",
                existing.state()
            ))
            .into());
        }

        let task = self.manager.create_task(&message).await?;
        let mut message = message;
        message.task_id = Some(task.id.clone());
        message.context_id = Some(task.context_id.clone());
        Ok(Resolution::Start { task, message })
    }

    /// Spawns the worker turn a resolution calls for and returns the
    /// task's current snapshot.
    async fn spawn_resolved(&self, resolution: Resolution) -> Result<Task> {
        let task_id = match resolution {
            Resolution::Start { task, message } => {
                self.host.spawn_start(&task.id, message, None).await?;
                task.id
            }
            Resolution::Resume { task, message } => {
                self.host.spawn_resume(&task.id, message).await?;
                task.id
            }
        };
        // The worker may already have advanced the task.
        self.manager.get_task(&task_id).await
    }

    /// Handles `message/send`.
    ///
    /// Returns the current snapshot immediately unless the caller asked
    /// for blocking completion and the card advertises it.
    pub async fn on_message_send(&self, params: SendMessageParams) -> Result<Task> {
        let configuration = params.configuration.clone();
        let blocking = self.card.capabilities.synchronous_completion
            && configuration
                .as_ref()
                .and_then(|c| c.blocking)
                .unwrap_or(false);

        let resolution = self.resolve_message(params).await?;
        let task = self.spawn_resolved(resolution).await?;

        let mut task = if blocking {
            self.await_terminal(&task.id).await?
        } else {
            task
        };
        task.truncate_history(configuration.and_then(|c| c.history_length));
        Ok(task)
    }

    /// Handles `message/stream`.
    ///
    /// The subscription opens between task resolution and worker spawn,
    /// so nothing the worker emits can precede it. A fresh task's stream
    /// starts with the snapshot already in its queue (seq 1); a resumed
    /// task's stream leads with its current snapshot and then carries
    /// only live events, not a replay of what the caller has seen.
    pub async fn on_message_stream(&self, params: SendMessageParams) -> Result<EventSse> {
        let resolution = self.resolve_message(params).await?;

        let (task_id, subscription, snapshot) = match &resolution {
            Resolution::Start { task, .. } => {
                let queue = self.manager.queues().get_or_create(&task.id).await;
                (task.id.clone(), queue.subscribe(), None)
            }
            Resolution::Resume { task, .. } => {
                let queue = self.manager.queues().get_or_create(&task.id).await;
                let subscription = queue.subscribe_after(Some(queue.latest_seq()));
                let current = self.manager.get_task(&task.id).await?;
                (task.id.clone(), subscription, Some(current))
            }
        };
        self.spawn_resolved(resolution).await?;

        info!(task_id = %task_id, "Streaming task events");
        Ok(sse_response(subscription, snapshot))
    }

    /// Handles `tasks/get`.
    pub async fn on_get_task(&self, params: TaskQueryParams) -> Result<Task> {
        let mut task = self.manager.get_task(&params.id).await?;
        task.truncate_history(params.history_length);
        Ok(task)
    }

    /// Handles `tasks/cancel`, cascading into the worker.
    pub async fn on_cancel_task(&self, params: TaskIdParams) -> Result<Task> {
        self.host.cancel(&params.id).await
    }

    /// Handles `tasks/list`.
    pub async fn on_list_tasks(&self, params: ListTasksParams) -> Result<ListTasksResult> {
        self.manager.store().list(&params).await
    }

    /// Handles `tasks/resubscribe`.
    pub async fn on_resubscribe(&self, params: ResubscribeParams) -> Result<EventSse> {
        let task = self.manager.get_task(&params.id).await?;
        let queue = self.manager.queues().get_or_create(&params.id).await;
        let subscription = queue.subscribe_after(params.last_event_id);
        let snapshot = (!subscription.caught_up).then_some(task);
        Ok(sse_response(subscription, snapshot))
    }

    fn require_push_capability(&self) -> Result<()> {
        if self.card.capabilities.push_notifications {
            Ok(())
        } else {
            Err(JsonRpcError::unsupported_capability("pushNotifications").into())
        }
    }

    /// Handles `tasks/pushNotificationConfig/set`.
    pub async fn on_set_push_config(&self, params: TaskPushConfig) -> Result<TaskPushConfig> {
        self.require_push_capability()?;
        if !self.manager.store().contains(&params.task_id).await {
            return Err(JsonRpcError::task_not_found(&params.task_id).into());
        }
        self.push_configs.save(params).await
    }

    /// Handles `tasks/pushNotificationConfig/get`.
    pub async fn on_get_push_config(&self, params: GetPushConfigParams) -> Result<TaskPushConfig> {
        self.require_push_capability()?;
        self.push_configs
            .get(&params.id, params.push_notification_config_id.as_deref())
            .await
    }

    /// Handles `tasks/pushNotificationConfig/list`.
    pub async fn on_list_push_config(
        &self,
        params: ListPushConfigParams,
    ) -> Result<Vec<TaskPushConfig>> {
        self.require_push_capability()?;
        Ok(self.push_configs.list(&params.id).await)
    }

    /// Handles `tasks/pushNotificationConfig/delete`.
    pub async fn on_delete_push_config(&self, params: DeletePushConfigParams) -> Result<()> {
        self.require_push_capability()?;
        self.push_configs
            .delete(&params.id, &params.push_notification_config_id)
            .await
    }

    /// Waits for the task to reach a terminal state by following its
    /// event stream.
    async fn await_terminal(&self, task_id: &str) -> Result<Task> {
        use futures::StreamExt;
        let queue = self.manager.queues().get_or_create(task_id).await;
        let mut stream = queue.subscribe().into_stream();
        while let Some(item) = stream.next().await {
            match item {
                Ok(sequenced) if sequenced.event.is_final() => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }
        self.manager.get_task(task_id).await
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("card", &self.card.name)
            .finish_non_exhaustive()
    }
}

fn parse_params<T: DeserializeOwned>(
    request: &JsonRpcRequest<serde_json::Value>,
) -> std::result::Result<T, JsonRpcError> {
    match &request.params {
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| JsonRpcError::invalid_params(e.to_string())),
        None => Err(JsonRpcError::invalid_params("missing params")),
    }
}

fn success_body<T: serde::Serialize>(id: &RequestId, result: &T) -> Result<String> {
    Ok(serde_json::to_string(&JsonRpcSuccessResponse::new(
        Some(id.clone()),
        result,
    ))?)
}

fn error_body(id: Option<RequestId>, error: JsonRpcError) -> String {
    serde_json::to_string(&JsonRpcErrorResponse::new(id, error))
        .unwrap_or_else(|_| r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"Internal error"}}"#.to_string())
}
